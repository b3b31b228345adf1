//! Auto-player - time-ripened batched dispatch of key events
//!
//! One worker thread per performance owns the runtime state exclusively and
//! walks the sorted event list: hybrid sleep/spin wait until a batch ripens,
//! releases strictly before presses inside the batch, chord detection over
//! the batch's pitch classes, refcount-disciplined presses with optional
//! retriggering, then a time-based progress callback. The UI side only ever
//! touches the atomic `is_playing` / `is_paused` flags, which the worker
//! observes at every wait branch and batch boundary.
//!
//! Stopping is idempotent: after `stop()` returns the worker has been joined
//! and every held key has been released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::clock::Clock;
use crate::keyboard::KeyDispatcher;
use crate::keymap::{ChordName, KeyMap};
use crate::note::{sort_dispatch_events, DispatchEvent, EventKind};

/// Tempo multipliers are floored here so time scaling never divides by zero
const TEMPO_FLOOR: f64 = 0.01;

/// Sleep while paused, the cancellation-latency bound of a paused player
const PAUSE_SPIN: Duration = Duration::from_millis(10);

/// Chord recognition strictness
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChordMode {
    /// Ordered subset match including the seventh chord
    #[default]
    Triad7,

    /// Ordered subset match over plain triads only
    Triad,

    /// Largest intersection wins, two shared members minimum
    Greedy,
}

/// Pattern order for subset matching; G7 must come before the triads
pub const CHORD_DETECTION_ORDER: [ChordName; 7] = [
    ChordName::G7,
    ChordName::C,
    ChordName::Dm,
    ChordName::Em,
    ChordName::F,
    ChordName::G,
    ChordName::Am,
];

/// Recognize a chord from the pitch classes of one batch
pub fn detect_chord(pitch_classes: &HashSet<u8>, mode: ChordMode) -> Option<ChordName> {
    if pitch_classes.is_empty() {
        return None;
    }
    match mode {
        ChordMode::Triad7 => CHORD_DETECTION_ORDER
            .into_iter()
            .find(|chord| is_subset(chord.pitch_classes(), pitch_classes)),
        ChordMode::Triad => CHORD_DETECTION_ORDER
            .into_iter()
            .filter(|chord| *chord != ChordName::G7)
            .find(|chord| is_subset(chord.pitch_classes(), pitch_classes)),
        ChordMode::Greedy => {
            let mut best: Option<ChordName> = None;
            let mut best_size = 0;
            for chord in CHORD_DETECTION_ORDER {
                let size = chord
                    .pitch_classes()
                    .iter()
                    .filter(|pc| pitch_classes.contains(pc))
                    .count();
                if size > best_size && size >= 2 {
                    best = Some(chord);
                    best_size = size;
                }
            }
            best
        }
    }
}

/// Whether every member of `pattern` appears in `pitch_classes`
fn is_subset(pattern: &[u8], pitch_classes: &HashSet<u8>) -> bool {
    pattern.iter().all(|pc| pitch_classes.contains(pc))
}

/// Scheduler tuning knobs
#[derive(Clone, Copy, Debug)]
pub struct PlayerOptions {
    /// A held key may be re-hit by a fresh note-on
    pub allow_retrigger: bool,

    /// Minimum interval between retriggers of one key, milliseconds
    pub retrigger_min_gap_ms: f64,

    /// Window merging simultaneous events into one batch, milliseconds
    pub epsilon_ms: f64,

    /// Fire a batch this far before its ideal time, milliseconds
    pub send_ahead_ms: f64,

    /// Below this remaining wait, busy-wait instead of sleeping
    pub spin_threshold_ms: f64,

    /// Forced micro-sleep after a batch of OS calls, milliseconds
    pub post_action_sleep_ms: f64,

    /// Press the chord-row key when a chord is recognized
    pub enable_chord_keys: bool,

    /// Drop the root pitch's melody key while a chord key is pressed
    pub chord_drop_root: bool,

    /// Chord recognition strictness
    pub chord_mode: ChordMode,

    /// Minimum hold of a chord-row key, milliseconds
    pub chord_min_sustain_ms: f64,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            allow_retrigger: true,
            retrigger_min_gap_ms: 40.0,
            epsilon_ms: 6.0,
            send_ahead_ms: 2.0,
            spin_threshold_ms: 1.0,
            post_action_sleep_ms: 0.0,
            enable_chord_keys: true,
            chord_drop_root: false,
            chord_mode: ChordMode::Triad7,
            chord_min_sustain_ms: 120.0,
        }
    }
}

/// Plain notification callback
pub type Callback = Box<dyn Fn() + Send + Sync>;

/// Callbacks the player reports through; all optional
#[derive(Default)]
pub struct PlayerCallbacks {
    /// Playback started
    pub on_start: Option<Callback>,

    /// Playback was stopped by the user
    pub on_stop: Option<Callback>,

    /// Playback paused
    pub on_pause: Option<Callback>,

    /// Playback resumed
    pub on_resume: Option<Callback>,

    /// Progress in percent, time-based
    pub on_progress: Option<Box<dyn Fn(f64) + Send + Sync>>,

    /// The stream finished on its own
    pub on_complete: Option<Callback>,

    /// Something went wrong before or during playback
    pub on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

/// Errors from starting a performance
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// A performance is already running
    #[error("a performance is already playing")]
    AlreadyPlaying,

    /// Nothing to play
    #[error("no events to play")]
    NoEvents,

    /// The worker thread could not be spawned
    #[error("failed to spawn the scheduler worker: {0}")]
    Spawn(std::io::Error),
}

/// Status snapshot of the player
#[derive(Clone, Copy, Debug)]
pub struct PlayerStatus {
    /// Whether a worker is live
    pub is_playing: bool,

    /// Whether that worker is paused
    pub is_paused: bool,

    /// Current tempo multiplier
    pub tempo: f64,
}

/// The scheduling and dispatch engine
pub struct AutoPlayer {
    /// Reference-counted keyboard front
    dispatcher: Arc<KeyDispatcher>,

    /// Tuning snapshot taken at every start
    options: Mutex<PlayerOptions>,

    /// Callback set, swapped atomically as one Arc
    callbacks: Mutex<Arc<PlayerCallbacks>>,

    /// Chord-row keys, taken from the active key map
    chord_keys: Mutex<HashMap<ChordName, String>>,

    /// Live-performance flag; the worker observes it at every branch
    is_playing: Arc<AtomicBool>,

    /// Pause flag
    is_paused: Arc<AtomicBool>,

    /// Current tempo multiplier as f64 bits
    tempo_bits: Arc<AtomicU64>,

    /// The worker of the current or last performance
    worker: Mutex<Option<JoinHandle<()>>>,

    /// Optional shared clock, used for start-time reporting
    clock: Mutex<Option<Arc<dyn Clock>>>,
}

impl AutoPlayer {
    /// Player over a dispatcher, with the default chord row
    pub fn new(dispatcher: Arc<KeyDispatcher>) -> Self {
        let player = Self {
            dispatcher,
            options: Mutex::new(PlayerOptions::default()),
            callbacks: Mutex::new(Arc::new(PlayerCallbacks::default())),
            chord_keys: Mutex::new(HashMap::new()),
            is_playing: Arc::new(AtomicBool::new(false)),
            is_paused: Arc::new(AtomicBool::new(false)),
            tempo_bits: Arc::new(AtomicU64::new(1.0f64.to_bits())),
            worker: Mutex::new(None),
            clock: Mutex::new(None),
        };
        player.set_chord_keymap(&KeyMap::default_21key());
        player
    }

    /// Replace the tuning knobs; takes effect at the next start
    pub fn set_options(&self, options: PlayerOptions) {
        *self.options.lock().unwrap() = options;
    }

    /// Current tuning knobs
    pub fn options(&self) -> PlayerOptions {
        *self.options.lock().unwrap()
    }

    /// Replace the callback set
    pub fn set_callbacks(&self, callbacks: PlayerCallbacks) {
        *self.callbacks.lock().unwrap() = Arc::new(callbacks);
    }

    /// Pull the chord-row keys out of a key map
    pub fn set_chord_keymap(&self, map: &KeyMap) {
        let mut chord_keys = HashMap::new();
        for chord in ChordName::ROW_ORDER {
            if let Some(key) = map.chord_key(chord) {
                chord_keys.insert(chord, key.to_string());
            }
        }
        *self.chord_keys.lock().unwrap() = chord_keys;
    }

    /// Inject a shared clock; only used for reporting
    pub fn set_clock_provider(&self, clock: Arc<dyn Clock>) {
        *self.clock.lock().unwrap() = Some(clock);
    }

    /// Change the tempo multiplier, effective at the next batch
    pub fn set_tempo(&self, tempo: f64) {
        self.tempo_bits
            .store(tempo.max(TEMPO_FLOOR).to_bits(), Ordering::SeqCst);
    }

    /// Status snapshot
    pub fn status(&self) -> PlayerStatus {
        PlayerStatus {
            is_playing: self.is_playing.load(Ordering::SeqCst),
            is_paused: self.is_paused.load(Ordering::SeqCst),
            tempo: f64::from_bits(self.tempo_bits.load(Ordering::SeqCst)),
        }
    }

    /// Start a performance over a sorted event list
    pub fn start(&self, mut events: Vec<DispatchEvent>, tempo: f64) -> Result<(), PlayerError> {
        if events.is_empty() {
            return Err(PlayerError::NoEvents);
        }
        if self
            .is_playing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PlayerError::AlreadyPlaying);
        }
        // A finished worker may still be parked in the slot; reap it.
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        sort_dispatch_events(&mut events);
        self.set_tempo(tempo);
        self.is_paused.store(false, Ordering::SeqCst);

        if let Some(clock) = self.clock.lock().unwrap().as_ref() {
            debug!("performance starting at shared clock {:.3}", clock.now());
        }

        let context = WorkerContext {
            events,
            options: *self.options.lock().unwrap(),
            callbacks: self.callbacks.lock().unwrap().clone(),
            chord_keys: self.chord_keys.lock().unwrap().clone(),
            dispatcher: self.dispatcher.clone(),
            is_playing: self.is_playing.clone(),
            is_paused: self.is_paused.clone(),
            tempo_bits: self.tempo_bits.clone(),
        };
        let callbacks = context.callbacks.clone();

        let handle = std::thread::Builder::new()
            .name("pianola-player".to_string())
            .spawn(move || run_worker(context))
            .map_err(|error| {
                self.is_playing.store(false, Ordering::SeqCst);
                PlayerError::Spawn(error)
            })?;
        *self.worker.lock().unwrap() = Some(handle);

        if let Some(on_start) = &callbacks.on_start {
            on_start();
        }
        info!("performance started, tempo {:.2}", tempo.max(TEMPO_FLOOR));
        Ok(())
    }

    /// Stop, join the worker, release everything; idempotent
    pub fn stop(&self) {
        let was_playing = self.is_playing.swap(false, Ordering::SeqCst);
        self.is_paused.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if was_playing {
            self.dispatcher.release_all();
            let callbacks = self.callbacks.lock().unwrap().clone();
            if let Some(on_stop) = &callbacks.on_stop {
                on_stop();
            }
            info!("performance stopped");
        }
    }

    /// Pause; the worker spins at low rate until resumed or stopped
    pub fn pause(&self) {
        if self.is_playing.load(Ordering::SeqCst)
            && !self.is_paused.swap(true, Ordering::SeqCst)
        {
            let callbacks = self.callbacks.lock().unwrap().clone();
            if let Some(on_pause) = &callbacks.on_pause {
                on_pause();
            }
            info!("performance paused");
        }
    }

    /// Surface an error through the callback set
    pub fn report_error(&self, message: &str) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        if let Some(on_error) = &callbacks.on_error {
            on_error(message);
        }
    }

    /// Resume a paused performance
    pub fn resume(&self) {
        if self.is_playing.load(Ordering::SeqCst)
            && self.is_paused.swap(false, Ordering::SeqCst)
        {
            let callbacks = self.callbacks.lock().unwrap().clone();
            if let Some(on_resume) = &callbacks.on_resume {
                on_resume();
            }
            info!("performance resumed");
        }
    }
}

impl Drop for AutoPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the worker owns for one performance
struct WorkerContext {
    /// Sorted event list, immutable for the whole performance
    events: Vec<DispatchEvent>,

    /// Tuning snapshot
    options: PlayerOptions,

    /// Callback set
    callbacks: Arc<PlayerCallbacks>,

    /// Chord-row keys
    chord_keys: HashMap<ChordName, String>,

    /// Keyboard front
    dispatcher: Arc<KeyDispatcher>,

    /// Live flag
    is_playing: Arc<AtomicBool>,

    /// Pause flag
    is_paused: Arc<AtomicBool>,

    /// Tempo bits
    tempo_bits: Arc<AtomicU64>,
}

impl WorkerContext {
    /// Effective tempo, floored
    fn tempo(&self) -> f64 {
        f64::from_bits(self.tempo_bits.load(Ordering::SeqCst)).max(TEMPO_FLOOR)
    }

    /// Whether the performance should keep running
    fn live(&self) -> bool {
        self.is_playing.load(Ordering::SeqCst)
    }

    /// Whether the performance is paused
    fn paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }
}

/// Runtime state owned exclusively by the worker
#[derive(Default)]
struct RuntimeState {
    /// Logical press count per key; superset of the dispatcher's counts
    active_counts: HashMap<String, u32>,

    /// Monotonic time of the last real press per key
    last_press: HashMap<String, f64>,

    /// Live chord keys and the press counts of their member pitch classes
    active_chord_pcs: HashMap<String, HashMap<u8, u32>>,

    /// Chord keys waiting out their minimum sustain, with their due time
    chord_pending_release: HashMap<String, f64>,
}

impl RuntimeState {
    /// Account one released pitch class against live chord keys
    ///
    /// When every member of a chord key hits zero the key either releases
    /// now (sustain satisfied) or moves to the pending-release table.
    fn release_pitch_class(
        &mut self,
        pc: u8,
        now: f64,
        min_sustain: f64,
        release_once: &mut Vec<String>,
    ) {
        let mut retired: Vec<(String, bool)> = Vec::new();
        for (chord_key, pc_counts) in self.active_chord_pcs.iter_mut() {
            let Some(count) = pc_counts.get_mut(&pc) else {
                continue;
            };
            if *count == 0 {
                continue;
            }
            *count -= 1;
            if pc_counts.values().all(|&c| c == 0) {
                let first_press = self.last_press.get(chord_key).copied().unwrap_or(now);
                retired.push((chord_key.clone(), now - first_press >= min_sustain));
            }
        }
        for (chord_key, release_now) in retired {
            self.active_chord_pcs.remove(&chord_key);
            if release_now {
                if !release_once.contains(&chord_key) {
                    release_once.push(chord_key.clone());
                }
                if let Some(count) = self.active_counts.get_mut(&chord_key) {
                    *count = count.saturating_sub(1);
                }
                self.chord_pending_release.remove(&chord_key);
            } else {
                let first_press = self.last_press.get(&chord_key).copied().unwrap_or(now);
                self.chord_pending_release
                    .insert(chord_key, first_press + min_sustain);
            }
        }
    }

    /// Move chord keys whose sustain has elapsed into the release list
    fn collect_due_chord_releases(&mut self, now: f64, release_once: &mut Vec<String>) {
        let due: Vec<String> = self
            .chord_pending_release
            .iter()
            .filter(|(_, &at)| now >= at)
            .map(|(key, _)| key.clone())
            .collect();
        for chord_key in due {
            if !release_once.contains(&chord_key) {
                release_once.push(chord_key.clone());
            }
            if let Some(count) = self.active_counts.get_mut(&chord_key) {
                *count = count.saturating_sub(1);
            }
            self.chord_pending_release.remove(&chord_key);
        }
    }
}

/// Deduplicate while keeping first occurrences
fn dedup_keys(keys: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}

/// The scheduler main loop
fn run_worker(ctx: WorkerContext) {
    let start = Instant::now();
    let mono = || start.elapsed().as_secs_f64();

    let options = ctx.options;
    let epsilon = (options.epsilon_ms / 1000.0).max(0.001);
    let send_ahead = options.send_ahead_ms / 1000.0;
    let spin_threshold = (options.spin_threshold_ms / 1000.0).max(0.0);
    let post_sleep = (options.post_action_sleep_ms / 1000.0).max(0.0);
    let retrigger_gap = (options.retrigger_min_gap_ms / 1000.0).max(0.0);
    let min_sustain = (options.chord_min_sustain_ms / 1000.0).max(0.0);

    let total_time = ctx.events.last().map(|event| event.time).unwrap_or(0.0);
    let mut state = RuntimeState::default();
    let mut index = 0;

    while index < ctx.events.len() && ctx.live() {
        // Pause parks the worker here; stop must still get through quickly.
        while ctx.paused() && ctx.live() {
            std::thread::sleep(PAUSE_SPIN);
        }
        if !ctx.live() {
            break;
        }

        let tempo = ctx.tempo();
        let group_time = ctx.events[index].time / tempo;
        let target = (group_time - send_ahead).max(0.0);

        // Hybrid wait: coarse sleep, fine sleep, then busy-wait. Coarse
        // sleeps are chunked so a stop() never waits behind a long gap.
        while ctx.live() && !ctx.paused() {
            let remaining = target - mono();
            if remaining <= 0.0 {
                break;
            }
            if remaining > 0.020 {
                std::thread::sleep(Duration::from_secs_f64((remaining - 0.010).min(0.020)));
            } else if remaining > spin_threshold {
                std::thread::sleep(Duration::from_micros(500));
            } else {
                while mono() < target && ctx.live() && !ctx.paused() {
                    std::hint::spin_loop();
                }
                break;
            }
        }
        if !ctx.live() {
            break;
        }
        if ctx.paused() {
            continue;
        }

        // Batch everything whose scaled time sits within epsilon.
        let mut j = index;
        while j < ctx.events.len() {
            let t = ctx.events[j].time / tempo;
            if (t - group_time).abs() <= epsilon {
                j += 1;
            } else {
                break;
            }
        }
        let batch = &ctx.events[index..j];

        let mut release_once: Vec<String> = Vec::new();
        let mut press_once: Vec<String> = Vec::new();
        let mut chord_press: Vec<String> = Vec::new();
        let mut retrigger_release: Vec<String> = Vec::new();
        let mut retrigger_press: Vec<String> = Vec::new();

        // Release phase first, so shared-time offs never eat fresh presses.
        for event in batch.iter().filter(|event| event.kind == EventKind::PressUp) {
            if let Some(count) = state.active_counts.get_mut(&event.key) {
                if *count > 0 {
                    *count -= 1;
                    if *count == 0 {
                        release_once.push(event.key.clone());
                    }
                }
            }
            state.release_pitch_class(event.note % 12, mono(), min_sustain, &mut release_once);
        }
        state.collect_due_chord_releases(mono(), &mut release_once);

        if !release_once.is_empty() {
            ctx.dispatcher.release(&release_once);
            if post_sleep > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(post_sleep));
            }
        }

        // Chord detection runs over the batch's fresh presses only.
        let pressed: Vec<&DispatchEvent> = batch
            .iter()
            .filter(|event| event.kind == EventKind::PressDown)
            .collect();
        let detected = if options.enable_chord_keys {
            let pitch_classes: HashSet<u8> =
                pressed.iter().map(|event| event.note % 12).collect();
            detect_chord(&pitch_classes, options.chord_mode)
        } else {
            None
        };
        let chord_key = detected.and_then(|chord| ctx.chord_keys.get(&chord).cloned());

        if let (Some(chord), Some(chord_key)) = (detected, chord_key.as_ref()) {
            let pc_counts = state
                .active_chord_pcs
                .entry(chord_key.clone())
                .or_insert_with(|| chord.pitch_classes().iter().map(|&pc| (pc, 0)).collect());
            for event in &pressed {
                if let Some(count) = pc_counts.get_mut(&(event.note % 12)) {
                    *count += 1;
                }
            }
        }

        // Press phase with refcount discipline and optional retriggering.
        let drop_root_pc = match (options.chord_drop_root, detected, chord_key.as_ref()) {
            (true, Some(chord), Some(_)) => Some(chord.root()),
            _ => None,
        };
        for event in &pressed {
            if drop_root_pc == Some(event.note % 12) {
                continue;
            }
            let count = state.active_counts.entry(event.key.clone()).or_insert(0);
            if *count == 0 {
                press_once.push(event.key.clone());
                *count = 1;
                state.last_press.insert(event.key.clone(), mono());
            } else {
                if options.allow_retrigger {
                    let now = mono();
                    let last = state
                        .last_press
                        .get(&event.key)
                        .copied()
                        .unwrap_or(f64::MIN);
                    if now - last >= retrigger_gap {
                        retrigger_release.push(event.key.clone());
                        retrigger_press.push(event.key.clone());
                        state.last_press.insert(event.key.clone(), now);
                    }
                }
                // Counted either way so later offs stay aligned.
                *count += 1;
            }
        }

        // The chord-row key follows the same discipline.
        if let Some(chord_key) = chord_key {
            let count = state.active_counts.entry(chord_key.clone()).or_insert(0);
            if *count == 0 {
                chord_press.push(chord_key.clone());
                *count = 1;
                state.last_press.insert(chord_key.clone(), mono());
            } else {
                *count += 1;
            }
            state.chord_pending_release.remove(&chord_key);
        }

        if !press_once.is_empty() {
            ctx.dispatcher.press(&press_once);
            let now = mono();
            for key in &press_once {
                state.last_press.insert(key.clone(), now);
            }
        }
        if !chord_press.is_empty() {
            ctx.dispatcher.press(&dedup_keys(chord_press));
        }
        if !retrigger_release.is_empty() {
            ctx.dispatcher.release(&dedup_keys(retrigger_release));
            if post_sleep > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(post_sleep));
            }
        }
        if !retrigger_press.is_empty() {
            ctx.dispatcher.press(&dedup_keys(retrigger_press));
        }

        if total_time > 0.0 {
            if let Some(on_progress) = &ctx.callbacks.on_progress {
                let progress = (mono() / (total_time / tempo) * 100.0).clamp(0.0, 100.0);
                on_progress(progress);
            }
        }

        index = j;
    }

    // A chord whose note-offs landed in the last batch may still owe its
    // minimum sustain. Hold it out before the drain; a stop() aborts the wait.
    if !state.chord_pending_release.is_empty() && ctx.live() {
        let due_latest = state
            .chord_pending_release
            .values()
            .fold(f64::MIN, |latest, &at| latest.max(at));
        while ctx.live() {
            let remaining = due_latest - mono();
            if remaining <= 0.0 {
                break;
            }
            std::thread::sleep(Duration::from_secs_f64(remaining.min(0.020)));
        }
        let mut release_once: Vec<String> = Vec::new();
        state.collect_due_chord_releases(mono(), &mut release_once);
        if !release_once.is_empty() {
            ctx.dispatcher.release(&release_once);
        }
    }

    // Drain everything that is still down, whatever path got us here.
    ctx.dispatcher.release_all();

    // Natural completion keeps the flag until here; a stop() already took it.
    if ctx.is_playing.swap(false, Ordering::SeqCst) {
        if let Some(on_progress) = &ctx.callbacks.on_progress {
            on_progress(100.0);
        }
        if let Some(on_complete) = &ctx.callbacks.on_complete {
            on_complete();
        }
        debug!("performance complete after {:.3}s", mono());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyboard::{CaptureBackend, CapturedKey};
    use crate::keymap::{map_events, KeyMap};
    use crate::note::NoteEvent;
    use std::sync::mpsc;

    /// Player wired to a capture backend, with a completion channel
    fn capture_player() -> (Arc<CaptureBackend>, AutoPlayer, mpsc::Receiver<()>) {
        let backend = Arc::new(CaptureBackend::default());
        let dispatcher = Arc::new(KeyDispatcher::new(backend.clone()));
        let player = AutoPlayer::new(dispatcher);
        let (tx, rx) = mpsc::channel();
        player.set_callbacks(PlayerCallbacks {
            on_complete: Some(Box::new(move || {
                let _ = tx.send(());
            })),
            ..PlayerCallbacks::default()
        });
        (backend, player, rx)
    }

    /// Dispatch events for plain notes through the default map
    fn events_for(notes: &[NoteEvent]) -> Vec<DispatchEvent> {
        map_events(notes, &KeyMap::default_21key(), &HashMap::new())
    }

    /// Wait for completion and join the worker
    fn finish(player: &AutoPlayer, rx: &mpsc::Receiver<()>) {
        rx.recv_timeout(Duration::from_secs(5)).expect("performance completes");
        player.stop();
    }

    #[test]
    fn chord_detection_is_order_sensitive() {
        let pcs: HashSet<u8> = [7, 11, 2, 5, 0, 4].into_iter().collect();
        // Both G7 and C are subsets; G7 must win under triad7.
        assert_eq!(detect_chord(&pcs, ChordMode::Triad7), Some(ChordName::G7));
        // Triad mode excludes G7 and falls through to C.
        assert_eq!(detect_chord(&pcs, ChordMode::Triad), Some(ChordName::C));
    }

    #[test]
    fn greedy_chord_detection_needs_two_members() {
        let pcs: HashSet<u8> = [0, 4].into_iter().collect();
        assert_eq!(detect_chord(&pcs, ChordMode::Greedy), Some(ChordName::C));
        let lonely: HashSet<u8> = [1].into_iter().collect();
        assert_eq!(detect_chord(&lonely, ChordMode::Greedy), None);
        assert_eq!(detect_chord(&HashSet::new(), ChordMode::Triad7), None);
    }

    #[test]
    fn single_note_presses_and_releases_its_key() {
        let (backend, player, rx) = capture_player();
        let events = events_for(&[NoteEvent::new(0.05, 0.25, 60, 0, 80)]);
        player.start(events, 1.0).unwrap();
        finish(&player, &rx);

        let q: Vec<CapturedKey> = backend.for_key("q");
        assert_eq!(q.len(), 2);
        assert!(q[0].down && !q[1].down);
        // The key was held roughly for the note's duration.
        let held = q[1].at - q[0].at;
        assert!(held > 0.1 && held < 0.5, "held {held:.3}s");
        assert!(!player.status().is_playing);
    }

    #[test]
    fn coincident_triad_emits_one_batch_with_the_chord_key() {
        let (backend, player, rx) = capture_player();
        let notes = vec![
            NoteEvent::new(0.05, 0.30, 60, 0, 80),
            NoteEvent::new(0.05, 0.30, 64, 0, 80),
            NoteEvent::new(0.05, 0.30, 67, 0, 80),
        ];
        player.start(events_for(&notes), 1.0).unwrap();
        finish(&player, &rx);

        let log = backend.snapshot();
        let downs: Vec<&CapturedKey> = log.iter().filter(|event| event.down).collect();
        let down_keys: HashSet<&str> = downs.iter().map(|event| event.key.as_str()).collect();
        assert_eq!(down_keys, HashSet::from(["q", "e", "t", "z"]));
        // The whole batch lands inside a handful of milliseconds.
        let first = downs.iter().map(|e| e.at).fold(f64::MAX, f64::min);
        let last = downs.iter().map(|e| e.at).fold(f64::MIN, f64::max);
        assert!(last - first < 0.05, "batch spread {:.4}s", last - first);

        // Chord key respected its minimum sustain.
        let z = backend.for_key("z");
        assert_eq!(z.len(), 2);
        assert!(z[1].at - z[0].at >= 0.1, "chord held {:.3}s", z[1].at - z[0].at);

        // Everything released at the end.
        let ups = log.iter().filter(|event| !event.down).count();
        assert_eq!(ups, downs.len());
    }

    #[test]
    fn trailing_chord_holds_its_minimum_sustain() {
        let (backend, player, rx) = capture_player();
        // The triad lasts 50ms, well under the 120ms default sustain, and
        // nothing comes after it: the deferred release matures past the end
        // of the stream.
        let notes = vec![
            NoteEvent::new(0.05, 0.10, 60, 0, 80),
            NoteEvent::new(0.05, 0.10, 64, 0, 80),
            NoteEvent::new(0.05, 0.10, 67, 0, 80),
        ];
        player.start(events_for(&notes), 1.0).unwrap();
        finish(&player, &rx);

        let z = backend.for_key("z");
        assert_eq!(z.len(), 2);
        assert!(z[0].down && !z[1].down);
        let held = z[1].at - z[0].at;
        assert!(held >= 0.11, "chord held only {held:.3}s");

        // The melody keys let go at the note end, before the chord key.
        let q = backend.for_key("q");
        assert_eq!(q.len(), 2);
        assert!(q[1].at < z[1].at, "melody releases first");

        let log = backend.snapshot();
        let downs = log.iter().filter(|event| event.down).count();
        let ups = log.iter().filter(|event| !event.down).count();
        assert_eq!(downs, ups);
    }

    #[test]
    fn retrigger_releases_and_represses_the_held_key() {
        let (backend, player, rx) = capture_player();
        let notes = vec![
            NoteEvent::new(0.0, 0.5, 60, 0, 80),
            NoteEvent::new(0.3, 0.8, 60, 0, 80),
        ];
        player.start(events_for(&notes), 1.0).unwrap();
        finish(&player, &rx);

        let q = backend.for_key("q");
        let pattern: Vec<bool> = q.iter().map(|event| event.down).collect();
        assert_eq!(pattern, [true, false, true, false], "down, retrigger pair, final up");
        // The retrigger pair sits near the second onset, not the first off.
        assert!((q[1].at - q[0].at - 0.3).abs() < 0.1);
    }

    #[test]
    fn retrigger_disabled_keeps_one_long_hold() {
        let (backend, player, rx) = capture_player();
        player.set_options(PlayerOptions {
            allow_retrigger: false,
            ..PlayerOptions::default()
        });
        let notes = vec![
            NoteEvent::new(0.0, 0.4, 60, 0, 80),
            NoteEvent::new(0.2, 0.6, 60, 0, 80),
        ];
        player.start(events_for(&notes), 1.0).unwrap();
        finish(&player, &rx);

        let q = backend.for_key("q");
        let pattern: Vec<bool> = q.iter().map(|event| event.down).collect();
        assert_eq!(pattern, [true, false]);
        // The single up happens at the second note's end, not the first's.
        assert!(q[1].at - q[0].at > 0.45);
    }

    #[test]
    fn stop_mid_stream_releases_everything_quickly() {
        let (backend, player, _rx) = capture_player();
        let notes = vec![
            NoteEvent::new(0.0, 3.0, 60, 0, 80),
            NoteEvent::new(0.1, 3.0, 64, 0, 80),
            NoteEvent::new(2.5, 3.0, 67, 0, 80),
        ];
        player.start(events_for(&notes), 1.0).unwrap();
        std::thread::sleep(Duration::from_millis(250));

        let stopping = Instant::now();
        player.stop();
        assert!(stopping.elapsed() < Duration::from_millis(150), "stop joins fast");
        assert!(!player.status().is_playing);

        let log = backend.snapshot();
        let downs = log.iter().filter(|event| event.down).count();
        let ups = log.iter().filter(|event| !event.down).count();
        assert_eq!(downs, ups, "every held key was released");

        // A second stop adds nothing.
        player.stop();
        assert_eq!(backend.snapshot().len(), log.len());
    }

    #[test]
    fn pause_freezes_dispatch_until_resume() {
        let (backend, player, rx) = capture_player();
        let notes = vec![
            NoteEvent::new(0.0, 0.1, 60, 0, 80),
            NoteEvent::new(0.35, 0.45, 64, 0, 80),
        ];
        player.start(events_for(&notes), 1.0).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        player.pause();
        let frozen = backend.snapshot().len();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(backend.snapshot().len(), frozen, "nothing dispatched while paused");
        player.resume();
        finish(&player, &rx);
        assert!(backend.for_key("e").len() == 2);
    }

    #[test]
    fn tempo_multiplier_scales_the_timeline() {
        let (backend, player, rx) = capture_player();
        let notes = vec![NoteEvent::new(0.0, 0.6, 60, 0, 80)];
        player.start(events_for(&notes), 2.0).unwrap();
        finish(&player, &rx);
        let q = backend.for_key("q");
        // 0.6s of material at double speed holds the key about 0.3s.
        let held = q[1].at - q[0].at;
        assert!(held < 0.45, "held {held:.3}s");
    }

    #[test]
    fn starting_twice_is_rejected() {
        let (_backend, player, rx) = capture_player();
        let notes = vec![NoteEvent::new(0.0, 0.4, 60, 0, 80)];
        player.start(events_for(&notes), 1.0).unwrap();
        let again = player.start(events_for(&notes), 1.0);
        assert!(matches!(again, Err(PlayerError::AlreadyPlaying)));
        finish(&player, &rx);
    }

    #[test]
    fn empty_event_list_is_rejected() {
        let (_backend, player, _rx) = capture_player();
        assert!(matches!(player.start(Vec::new(), 1.0), Err(PlayerError::NoEvents)));
        assert!(!player.status().is_playing);
    }

    #[test]
    fn progress_reaches_one_hundred() {
        let backend = Arc::new(CaptureBackend::default());
        let dispatcher = Arc::new(KeyDispatcher::new(backend));
        let player = AutoPlayer::new(dispatcher);
        let (tx, rx) = mpsc::channel();
        let progress = Arc::new(Mutex::new(0.0f64));
        let seen = progress.clone();
        player.set_callbacks(PlayerCallbacks {
            on_progress: Some(Box::new(move |value| {
                let mut last = seen.lock().unwrap();
                assert!(value + 1e-9 >= *last, "progress is monotonic");
                *last = value;
            })),
            on_complete: Some(Box::new(move || {
                let _ = tx.send(());
            })),
            ..PlayerCallbacks::default()
        });
        let notes = vec![
            NoteEvent::new(0.0, 0.1, 60, 0, 80),
            NoteEvent::new(0.2, 0.3, 62, 0, 80),
        ];
        player.start(events_for(&notes), 1.0).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        player.stop();
        assert_eq!(*progress.lock().unwrap(), 100.0);
    }

    #[test]
    fn tempo_floor_clamps_degenerate_multipliers() {
        let backend = Arc::new(CaptureBackend::default());
        let dispatcher = Arc::new(KeyDispatcher::new(backend));
        let player = AutoPlayer::new(dispatcher);
        player.set_tempo(0.0);
        assert_eq!(player.status().tempo, TEMPO_FLOOR);
        player.set_tempo(-3.0);
        assert_eq!(player.status().tempo, TEMPO_FLOOR);
        player.set_tempo(1.5);
        assert_eq!(player.status().tempo, 1.5);
    }
}
