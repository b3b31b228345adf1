//! Command-channel front of the playback service
//!
//! Embedders do not call the service directly from their UI threads; they
//! post [Command]s into a channel and read [EngineEvent]s out of another.
//! That keeps the ownership one-directional: the UI holds an [Engine]
//! handle, the engine worker holds the service, and nothing ever reaches
//! back into the UI.
//!
//! The worker consumes commands one at a time. A `Play` command interrupts
//! whatever is running first, the way a user expects a play button to
//! behave, and `Quit` is only issued by the graceful-shutdown path.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::player::PlayerCallbacks;
use crate::service::PlaybackService;

/// Requests the engine worker can receive
#[derive(Debug)]
pub enum Command {
    /// Stop the current performance and play this file
    Play {
        /// MIDI or text-score file
        path: PathBuf,

        /// Tempo multiplier; `None` uses the configured default
        tempo: Option<f64>,
    },

    /// Pause the current performance
    Pause,

    /// Resume the paused performance
    Resume,

    /// Stop playing and wait for more commands
    Stop,

    /// Stop playing and quit the worker
    Quit,
}

/// Notifications flowing back to the embedder
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A performance started
    Started,

    /// Progress in percent
    Progress(f64),

    /// The performance was paused
    Paused,

    /// The performance resumed
    Resumed,

    /// The performance was stopped by request
    Stopped,

    /// The performance finished on its own
    Complete,

    /// Something went wrong; the engine stays usable
    Error(String),
}

/// Handle for sending commands to the engine worker
pub struct Engine {
    /// Incoming work channel of the worker
    commands: tokio::sync::mpsc::Sender<Command>,

    /// The worker task itself
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Spawn the worker around a service and return the event stream
    ///
    /// The service's callback set is replaced so events flow through the
    /// returned channel; embedders must not install their own callbacks on
    /// the same service afterwards.
    pub fn spawn(
        service: Arc<PlaybackService>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_out, events) = tokio::sync::mpsc::unbounded_channel();
        wire_callbacks(&service, events_out.clone());

        let (commands, mut work) = tokio::sync::mpsc::channel(4);
        let worker = tokio::spawn(async move {
            while let Some(command) = work.recv().await {
                info!("engine received command: {command:?}");
                match command {
                    Command::Play { path, tempo } => {
                        service.stop_all();
                        let outcome = if is_score_file(&path) {
                            service.start_from_score_path(&path, tempo)
                        } else {
                            service.start_from_path(&path, tempo)
                        };
                        match outcome {
                            Ok(()) => {
                                let _ = events_out.send(EngineEvent::Started);
                            }
                            Err(error) => {
                                // The service already reported through the
                                // callback set; the log line is for operators.
                                warn!("play command failed: {error:#}");
                            }
                        }
                    }
                    Command::Pause => service.pause(),
                    Command::Resume => service.resume(),
                    Command::Stop => service.stop_all(),
                    Command::Quit => {
                        service.stop_all();
                        break;
                    }
                }
            }
        });

        (
            Self {
                commands,
                worker: Some(worker),
            },
            events,
        )
    }

    /// Post a command; errors only when the worker already quit
    pub async fn send(&self, command: Command) -> Result<(), String> {
        self.commands
            .send(command)
            .await
            .map_err(|error| format!("engine worker is gone: {error}"))
    }

    /// Stop playing and shut the worker down
    pub async fn quit(mut self) {
        if self.send(Command::Quit).await.is_err() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

/// Whether a path looks like a text score rather than a MIDI file
fn is_score_file(path: &std::path::Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("lrcp" | "txt")
    )
}

/// Route the service callbacks into the event channel
fn wire_callbacks(
    service: &PlaybackService,
    events: tokio::sync::mpsc::UnboundedSender<EngineEvent>,
) {
    let progress = events.clone();
    let paused = events.clone();
    let resumed = events.clone();
    let stopped = events.clone();
    let complete = events.clone();
    let errored = events;
    service.set_callbacks(PlayerCallbacks {
        on_start: None,
        on_progress: Some(Box::new(move |value| {
            let _ = progress.send(EngineEvent::Progress(value));
        })),
        on_pause: Some(Box::new(move || {
            let _ = paused.send(EngineEvent::Paused);
        })),
        on_resume: Some(Box::new(move || {
            let _ = resumed.send(EngineEvent::Resumed);
        })),
        on_stop: Some(Box::new(move || {
            let _ = stopped.send(EngineEvent::Stopped);
        })),
        on_complete: Some(Box::new(move || {
            let _ = complete.send(EngineEvent::Complete);
        })),
        on_error: Some(Box::new(move |message| {
            let _ = errored.send(EngineEvent::Error(message.to_string()));
        })),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyboard::CaptureBackend;
    use crate::note::NoteEvent;
    use std::time::Duration;

    /// Wait for a specific event, skipping progress chatter
    async fn wait_for(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<EngineEvent>,
        wanted: EngineEvent,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("event before the deadline")
                .expect("event channel open");
            if event == wanted {
                return;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn play_command_runs_a_file_to_completion() {
        let backend = Arc::new(CaptureBackend::default());
        let service = Arc::new(PlaybackService::with_backend(backend.clone()));
        let (engine, mut events) = Engine::spawn(service);

        let dir = std::env::temp_dir().join(format!("pianola-engine-{}", std::process::id()));
        let notes = vec![NoteEvent::new(0.0, 0.2, 60, 0, 80)];
        let written =
            crate::midi::export_partitions([("piece", notes.as_slice())], &dir, 120).unwrap();

        engine
            .send(Command::Play {
                path: written[0].clone(),
                tempo: Some(1.0),
            })
            .await
            .unwrap();
        wait_for(&mut events, EngineEvent::Started).await;
        wait_for(&mut events, EngineEvent::Complete).await;
        assert_eq!(backend.for_key("q").len(), 2);

        engine.quit().await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_file_surfaces_an_error_event() {
        let service = Arc::new(PlaybackService::new());
        let (engine, mut events) = Engine::spawn(service);

        engine
            .send(Command::Play {
                path: PathBuf::from("/nope/missing.mid"),
                tempo: None,
            })
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, EngineEvent::Error(_)) {
                break;
            }
        }
        engine.quit().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_command_interrupts_playback() {
        let backend = Arc::new(CaptureBackend::default());
        let service = Arc::new(PlaybackService::with_backend(backend.clone()));
        let (engine, mut events) = Engine::spawn(service);

        let dir = std::env::temp_dir().join(format!("pianola-engine-stop-{}", std::process::id()));
        let notes = vec![NoteEvent::new(0.0, 3.0, 60, 0, 80)];
        let written =
            crate::midi::export_partitions([("long", notes.as_slice())], &dir, 120).unwrap();

        engine
            .send(Command::Play {
                path: written[0].clone(),
                tempo: Some(1.0),
            })
            .await
            .unwrap();
        wait_for(&mut events, EngineEvent::Started).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.send(Command::Stop).await.unwrap();
        wait_for(&mut events, EngineEvent::Stopped).await;

        // The held key was released by the stop.
        let log = backend.snapshot();
        let downs = log.iter().filter(|event| event.down).count();
        let ups = log.iter().filter(|event| !event.down).count();
        assert_eq!(downs, ups);

        engine.quit().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
