//! pianola command line - perform MIDI files through synthetic keystrokes
//!
//! The binary is a thin shell around [pianola::PlaybackService]: it parses
//! arguments, bootstraps logging (console plus daily log files in the cache
//! directory), loads configuration and key maps, and then drives one of the
//! subcommands. All timing-critical work stays inside the engine; the shell
//! only waits for completion or ctrl-c.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use pianola::analysis::{AnalysisOptions, BlackKeyStrategy, MelodyMode, MelodyOptions, TransposeMode};
use pianola::config::{self, Config};
use pianola::engine::{Command as EngineCommand, Engine, EngineEvent};
use pianola::export;
use pianola::keyboard::{KeyBackend, LogBackend};
use pianola::keymap::KeyMap;
use pianola::midi;
use pianola::note::Role;
use pianola::partition::TrackChannelPartitioner;
use pianola::player::PlayerCallbacks;
use pianola::score;
use pianola::service::PlaybackService;
use pianola::timing::TimingService;
use pianola::version::Version;

#[derive(Parser, Debug)]
#[command(version = format!("{}", Version::default()))]
/// pianola performs MIDI files on virtual instruments through synthetic keystrokes
struct Cli {
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Key map JSON file overriding the configured profile
    #[arg(long)]
    keymap: Option<PathBuf>,

    /// Disable colors. Overwrites NO_COLOR environment variable
    #[arg(long = "no-color", default_value_t = false)]
    disable_colors: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Perform a MIDI file now
    Play {
        /// The file to perform
        file: PathBuf,

        /// Tempo multiplier; defaults to the configured value
        #[arg(short, long)]
        tempo: Option<f64>,

        /// Shift the whole piece by this many semitones
        #[arg(long)]
        transpose: Option<i32>,

        /// Pick the transposition that maximizes the white-key ratio
        #[arg(long, default_value_t = false)]
        auto_transpose: bool,

        /// Reduce the piece to a single melody line first
        #[arg(long, default_value_t = false)]
        melody: bool,

        /// Melody extraction mode
        #[arg(long, value_enum, default_value_t = MelodyModeArg::Entropy)]
        melody_mode: MelodyModeArg,

        /// How black keys are folded onto the white rows
        #[arg(long, value_enum, default_value_t = BlackKeysArg::Down)]
        black_keys: BlackKeysArg,

        /// Skip start-time quantization
        #[arg(long, default_value_t = false)]
        no_quantize: bool,
    },

    /// Split a file into sections and perform a selection
    Parts {
        /// The file to split
        file: PathBuf,

        /// Section names to play; empty plays every section
        #[arg(long)]
        select: Vec<String>,

        /// Roles to include: melody, bass, drums
        #[arg(long)]
        roles: Vec<String>,

        /// Tempo multiplier
        #[arg(short, long)]
        tempo: Option<f64>,

        /// Only list the sections, do not play
        #[arg(long, default_value_t = false)]
        list: bool,
    },

    /// Export analyses of a file instead of playing it
    Export {
        /// The file to export from
        file: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "pianola-export")]
        out: PathBuf,

        /// What to write
        #[arg(long, value_enum, default_value_t = ExportKind::Csv)]
        what: ExportKind,
    },

    /// Arm a synchronized performance start at a wall-clock time today
    Schedule {
        /// The file to perform
        file: PathBuf,

        /// Target time as HH:MM:SS or HH:MM:SS.mmm
        at: String,

        /// Tempo multiplier
        #[arg(short, long)]
        tempo: Option<f64>,
    },

    /// Check clock synchronization quality and exit
    Sync,
}

/// CLI face of [MelodyMode]
#[derive(ValueEnum, Clone, Copy, Debug)]
enum MelodyModeArg {
    /// Channel selection only
    Entropy,
    /// Beat-similarity filtering
    Beat,
    /// Repetition filtering
    Repetition,
    /// Repetition, then beat
    Hybrid,
}

impl From<MelodyModeArg> for MelodyMode {
    fn from(value: MelodyModeArg) -> Self {
        match value {
            MelodyModeArg::Entropy => Self::Entropy,
            MelodyModeArg::Beat => Self::Beat,
            MelodyModeArg::Repetition => Self::Repetition,
            MelodyModeArg::Hybrid => Self::Hybrid,
        }
    }
}

/// CLI face of [BlackKeyStrategy]
#[derive(ValueEnum, Clone, Copy, Debug)]
enum BlackKeysArg {
    /// Leave black keys alone
    Off,
    /// Rewrite to the nearest lower white key
    Down,
    /// Rewrite to the closer white neighbor
    Nearest,
}

impl From<BlackKeysArg> for BlackKeyStrategy {
    fn from(value: BlackKeysArg) -> Self {
        match value {
            BlackKeysArg::Off => Self::Off,
            BlackKeysArg::Down => Self::Down,
            BlackKeysArg::Nearest => Self::Nearest,
        }
    }
}

/// What the export subcommand writes
#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExportKind {
    /// Event table as CSV
    Csv,
    /// Key-notation text
    Keys,
    /// Timestamped text score
    Score,
    /// One MIDI file per section
    Parts,
    /// All sections merged into one multi-track MIDI file
    Song,
}

/// Initialize the logging system
///
/// Events go to the console and, without ANSI colors, to daily log files in
/// the cache directory, so a bug report is one folder.
fn setup_logging_system(cli: &Cli) -> tracing_appender::non_blocking::WorkerGuard {
    let log_file_appender = tracing_appender::rolling::daily(config::cache_path(), "logs");
    let (log_file_appender, guard) = tracing_appender::non_blocking(log_file_appender);

    // https://no-color.org/
    let disable_colors = cli.disable_colors
        || std::env::var("NO_COLOR")
            .map(|x| !x.is_empty())
            .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pianola=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(!disable_colors)
                .and_then(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(log_file_appender),
                ),
        )
        .init();
    guard
}

/// The key backend the build provides
#[cfg(feature = "synthetic-input")]
fn key_backend() -> Arc<dyn KeyBackend> {
    match pianola::keyboard::EnigoBackend::new() {
        Ok(backend) => Arc::new(backend),
        Err(error) => {
            tracing::warn!("synthetic input unavailable ({error}), logging keys instead");
            Arc::new(LogBackend)
        }
    }
}

/// The key backend the build provides (logging only)
#[cfg(not(feature = "synthetic-input"))]
fn key_backend() -> Arc<dyn KeyBackend> {
    tracing::info!("built without synthetic input; key events go to the log");
    Arc::new(LogBackend)
}

/// Build the service from config, profile and overrides
fn build_service(cli: &Cli, config: &Config) -> Arc<PlaybackService> {
    let service = Arc::new(PlaybackService::with_backend(key_backend()));
    let keymap = match &cli.keymap {
        Some(path) => match KeyMap::load(path) {
            Ok(map) => map,
            Err(error) => {
                tracing::warn!("falling back to the configured profile: {error}");
                KeyMap::profile(&config.playback.keymap_profile)
            }
        },
        None => KeyMap::profile(&config.playback.keymap_profile),
    };
    service.set_keymap(keymap);
    service.set_tempo(config.playback.tempo_default);
    service
}

/// Wire completion into a channel the async shell can await
fn completion_channel(service: &PlaybackService) -> tokio::sync::mpsc::Receiver<()> {
    let (done_tx, done_rx) = tokio::sync::mpsc::channel::<()>(1);
    let stop_tx = done_tx.clone();
    service.set_callbacks(PlayerCallbacks {
        on_complete: Some(Box::new(move || {
            let _ = done_tx.try_send(());
        })),
        on_stop: Some(Box::new(move || {
            let _ = stop_tx.try_send(());
        })),
        on_error: Some(Box::new(|message| {
            tracing::error!("{message}");
        })),
        ..PlayerCallbacks::default()
    });
    done_rx
}

/// Wait for the performance to end, stopping cleanly on ctrl-c
async fn wait_for_performance(
    service: &PlaybackService,
    mut done: tokio::sync::mpsc::Receiver<()>,
) {
    tokio::select! {
        _ = done.recv() => {
            tracing::info!("performance finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, releasing keys");
            service.stop_all();
        }
    }
}

/// Parse HH:MM:SS(.mmm) into the schedule tuple
fn parse_wall_time(text: &str) -> Option<(u32, u32, u32, u32)> {
    use chrono::Timelike;
    let time = chrono::NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveTime::parse_from_str(text, "%H:%M:%S"))
        .ok()?;
    Some((
        time.hour(),
        time.minute(),
        time.second(),
        time.nanosecond() / 1_000_000,
    ))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = setup_logging_system(&cli);

    tracing::info!("starting up version {}", Version::default());

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let config = Config::load_or_default(&config_path);

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Dispatch the chosen subcommand
async fn run(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    match &cli.command {
        Command::Play {
            file,
            tempo,
            transpose,
            auto_transpose,
            melody,
            melody_mode,
            black_keys,
            no_quantize,
        } => {
            let service = build_service(cli, config);
            let mut options = AnalysisOptions {
                black_keys: (*black_keys).into(),
                ..AnalysisOptions::default()
            };
            if *auto_transpose {
                options.transpose = TransposeMode::Auto;
            } else if let Some(semitones) = transpose {
                options.transpose = TransposeMode::Manual(*semitones);
            }
            if *melody {
                options.melody = Some(MelodyOptions {
                    mode: (*melody_mode).into(),
                    ..MelodyOptions::default()
                });
            }
            if *no_quantize {
                options.quantize_grid_ms = None;
            }
            service.set_analysis_options(options);

            let (engine, mut events) = Engine::spawn(service);
            engine
                .send(EngineCommand::Play {
                    path: file.clone(),
                    tempo: *tempo,
                })
                .await
                .map_err(|message| anyhow::anyhow!(message))?;

            let mut failure: Option<String> = None;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(EngineEvent::Complete) => {
                            tracing::info!("performance finished");
                            break;
                        }
                        Some(EngineEvent::Stopped) => break,
                        Some(EngineEvent::Error(message)) => {
                            failure = Some(message);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        tracing::warn!("interrupted, releasing keys");
                        let _ = engine.send(EngineCommand::Stop).await;
                    }
                }
            }
            engine.quit().await;
            match failure {
                Some(message) => anyhow::bail!(message),
                None => Ok(()),
            }
        }

        Command::Parts {
            file,
            select,
            roles,
            tempo,
            list,
        } => {
            let service = build_service(cli, config);
            let parsed = service.load(file)?;
            let parts = TrackChannelPartitioner::with_role_inference().split(&parsed.notes);

            if *list {
                for (name, section) in &parts {
                    tracing::info!(
                        "{name}: {count} notes, role {role}",
                        count = section.meta.count,
                        role = section
                            .meta
                            .role
                            .map(|role| role.as_str())
                            .unwrap_or("unknown"),
                    );
                }
                return Ok(());
            }

            let include_roles: Vec<Role> = roles
                .iter()
                .filter_map(|name| {
                    let role = Role::parse(name);
                    if role.is_none() {
                        tracing::warn!("unknown role {name:?}");
                    }
                    role
                })
                .collect();
            let include = (!include_roles.is_empty()).then_some(include_roles.as_slice());

            let done = completion_channel(&service);
            service.play_parts(&parts, select, include, &HashMap::new(), *tempo)?;
            wait_for_performance(&service, done).await;
            Ok(())
        }

        Command::Export { file, out, what } => {
            let parsed = midi::parse_file(file)?;
            let mut notes = parsed.notes;
            pianola::analysis::tag_chords(&mut notes);
            std::fs::create_dir_all(out)?;
            match what {
                ExportKind::Csv => {
                    let path = out.join("events.csv");
                    export::write_event_csv(&notes, &path)?;
                    tracing::info!("event table written to {}", path.display());
                }
                ExportKind::Keys => {
                    let map = KeyMap::profile(&config.playback.keymap_profile);
                    let path = out.join("keys.txt");
                    export::write_key_notation(&notes, &map, &path)?;
                    tracing::info!("key notation written to {}", path.display());
                }
                ExportKind::Score => {
                    let path = out.join("score.lrcp");
                    std::fs::write(&path, score::to_lrcp(&notes))?;
                    tracing::info!("text score written to {}", path.display());
                }
                ExportKind::Parts => {
                    let parts = TrackChannelPartitioner::new().split(&notes);
                    let sections: Vec<(&str, &[pianola::NoteEvent])> = parts
                        .values()
                        .map(|section| (section.name.as_str(), section.notes.as_slice()))
                        .collect();
                    let written = midi::export_partitions(sections, out, 120)?;
                    tracing::info!("{} partition files written", written.len());
                }
                ExportKind::Song => {
                    let parts = TrackChannelPartitioner::new().split(&notes);
                    let sections: Vec<(&str, &[pianola::NoteEvent])> = parts
                        .values()
                        .map(|section| (section.name.as_str(), section.notes.as_slice()))
                        .collect();
                    let path = out.join("song.mid");
                    midi::export_sections_single(sections, &path, 120)?;
                    tracing::info!("merged sections written to {}", path.display());
                }
            }
            Ok(())
        }

        Command::Schedule { file, at, tempo } => {
            let Some(when) = parse_wall_time(at) else {
                anyhow::bail!("cannot parse {at:?} as HH:MM:SS(.mmm)");
            };
            let service = build_service(cli, config);
            let done = completion_channel(&service);

            let timing = TimingService::new(
                config.ntp.servers.clone(),
                Duration::from_secs_f64(config.ntp.timeout),
                config.ntp.max_tries,
            );
            timing.set_resync_settings(
                config.ntp.resync_interval_sec,
                config.ntp.adjust_threshold_ms,
            );
            timing.set_include_delta(config.ntp.include_delta);
            if !config.ntp.enabled {
                timing.use_local();
            }

            let tempo = tempo.unwrap_or(config.playback.tempo_default);
            let play_service = service.clone();
            let play_file = file.clone();
            let id = timing.schedule_play(
                "pianola",
                when,
                tempo,
                Arc::new(move |_instrument| {
                    play_service
                        .start_from_path(&play_file, Some(tempo))
                        .is_ok()
                }),
            );
            if id.is_empty() {
                anyhow::bail!("the requested time is already past");
            }
            tracing::info!("schedule {id} armed for {at}");

            wait_for_performance(&service, done).await;
            timing.shutdown();
            Ok(())
        }

        Command::Sync => {
            let timing = TimingService::new(
                config.ntp.servers.clone(),
                Duration::from_secs_f64(config.ntp.timeout),
                config.ntp.max_tries,
            );
            let ok = timing.sync_now();
            let status = timing.status();
            tracing::info!(
                "provider={} offset={:.2}ms rtt={:.2}ms delta={:.2}ms",
                status.provider,
                status.offset_ms,
                status.rtt_ms,
                status.sys_delta_ms,
            );
            if ok {
                Ok(())
            } else {
                anyhow::bail!("no NTP server reachable")
            }
        }
    }
}
