//! Playback service - the seam between callers and the engine
//!
//! The service owns the pieces a performance needs: the analysis options, the
//! active key maps, the player with its dispatcher, and an optional shared
//! clock. Callers go through the narrow surface here (`load`,
//! `start_from_path`, `play_parts`, `pause`, `resume`, `stop_all`) and get
//! everything else back through the callback set; the service never reaches
//! into its caller.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::analysis::{analyze, AnalysisOptions};
use crate::clock::Clock;
use crate::keyboard::{KeyBackend, KeyDispatcher, LogBackend};
use crate::keymap::{map_events, KeyMap};
use crate::midi::{parse_file, ParsedMidi};
use crate::note::{NoteEvent, Role};
use crate::partition::{resolve_role, PartSection};
use crate::player::{AutoPlayer, PlayerCallbacks, PlayerOptions};
use crate::score;

/// Coordinates parsing, analysis, key mapping and the auto-player
pub struct PlaybackService {
    /// The scheduling engine
    player: Arc<AutoPlayer>,

    /// Key map melody events route through
    keymap: RwLock<KeyMap>,

    /// Role-specific key maps, substituted wholesale per event
    role_keymaps: RwLock<HashMap<Role, KeyMap>>,

    /// Analysis pipeline configuration used by `start_from_path`
    analysis: RwLock<AnalysisOptions>,

    /// Tempo used when a start call passes none
    default_tempo: RwLock<f64>,
}

impl PlaybackService {
    /// Service over the logging key backend
    pub fn new() -> Self {
        Self::with_backend(Arc::new(LogBackend))
    }

    /// Service over an explicit key backend
    pub fn with_backend(backend: Arc<dyn KeyBackend>) -> Self {
        let dispatcher = Arc::new(KeyDispatcher::new(backend));
        let player = Arc::new(AutoPlayer::new(dispatcher));
        let mut role_keymaps = HashMap::new();
        role_keymaps.insert(Role::Drums, KeyMap::drums());
        role_keymaps.insert(Role::Bass, KeyMap::bass());
        Self {
            player,
            keymap: RwLock::new(KeyMap::default_21key()),
            role_keymaps: RwLock::new(role_keymaps),
            analysis: RwLock::new(AnalysisOptions::default()),
            default_tempo: RwLock::new(1.0),
        }
    }

    /// The engine, for direct tuning
    pub fn player(&self) -> &Arc<AutoPlayer> {
        &self.player
    }

    /// Replace the melody key map; the chord row follows it
    pub fn set_keymap(&self, map: KeyMap) {
        self.player.set_chord_keymap(&map);
        *self.keymap.write().unwrap() = map;
    }

    /// Copy of the active melody key map
    pub fn keymap(&self) -> KeyMap {
        self.keymap.read().unwrap().clone()
    }

    /// Bind or replace a role-specific key map
    pub fn set_role_keymap(&self, role: Role, map: KeyMap) {
        self.role_keymaps.write().unwrap().insert(role, map);
    }

    /// Replace the analysis configuration
    pub fn set_analysis_options(&self, options: AnalysisOptions) {
        *self.analysis.write().unwrap() = options;
    }

    /// Replace the scheduler tuning
    pub fn set_options(&self, options: PlayerOptions) {
        self.player.set_options(options);
    }

    /// Replace the callback set
    pub fn set_callbacks(&self, callbacks: PlayerCallbacks) {
        self.player.set_callbacks(callbacks);
    }

    /// Set the default tempo multiplier and push it to a live performance
    pub fn set_tempo(&self, tempo: f64) {
        *self.default_tempo.write().unwrap() = tempo;
        self.player.set_tempo(tempo);
    }

    /// Inject a shared clock, forwarded to the player
    pub fn set_clock_provider(&self, clock: Arc<dyn Clock>) {
        self.player.set_clock_provider(clock);
    }

    /// Parse a MIDI file without starting anything
    pub fn load(&self, path: &Path) -> anyhow::Result<ParsedMidi> {
        parse_file(path).with_context(|| format!("loading {}", path.display()))
    }

    /// Parse, analyze, map and play a file
    pub fn start_from_path(&self, path: &Path, tempo: Option<f64>) -> anyhow::Result<()> {
        let parsed = match self.load(path) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.player.report_error(&format!("{error:#}"));
                return Err(error);
            }
        };
        if parsed.notes.is_empty() {
            let message = format!("{} contains no notes", path.display());
            self.player.report_error(&message);
            bail!(message);
        }

        let options = self.analysis.read().unwrap().clone();
        let report = analyze(parsed.notes, &options);
        if report.notes.is_empty() {
            let message = "analysis filtered every note away; not starting".to_string();
            warn!("{message}");
            self.player.report_error(&message);
            bail!(message);
        }
        info!(
            "starting {}: {} notes after analysis",
            path.display(),
            report.notes.len()
        );
        self.start_from_events(&report.notes, tempo)
    }

    /// Map pre-analyzed notes and play them as-is
    pub fn start_from_events(&self, notes: &[NoteEvent], tempo: Option<f64>) -> anyhow::Result<()> {
        if notes.is_empty() {
            let message = "no events to play".to_string();
            self.player.report_error(&message);
            bail!(message);
        }
        let events = {
            let keymap = self.keymap.read().unwrap();
            let role_keymaps = self.role_keymaps.read().unwrap();
            map_events(notes, &keymap, &role_keymaps)
        };
        let tempo = tempo.unwrap_or_else(|| *self.default_tempo.read().unwrap());
        self.player
            .start(events, tempo)
            .context("starting the performance")
    }

    /// Parse a text score file and play it through the active key map
    pub fn start_from_score_path(&self, path: &Path, tempo: Option<f64>) -> anyhow::Result<()> {
        let text = match std::fs::read_to_string(path)
            .with_context(|| format!("reading score {}", path.display()))
        {
            Ok(text) => text,
            Err(error) => {
                self.player.report_error(&format!("{error:#}"));
                return Err(error);
            }
        };
        let events = {
            let keymap = self.keymap.read().unwrap();
            score::to_dispatch_events(&score::parse_score(&text, &keymap))
        };
        if events.is_empty() {
            let message = format!("{} contains no playable score lines", path.display());
            self.player.report_error(&message);
            bail!(message);
        }
        let tempo = tempo.unwrap_or_else(|| *self.default_tempo.read().unwrap());
        self.player
            .start(events, tempo)
            .context("starting the score performance")
    }

    /// Play selected sections as one merged, role-routed stream
    ///
    /// Events take their role from the event itself, then from a per-section
    /// override, then from the section metadata, then from the heuristics.
    /// When `include_roles` is given, events outside the set are dropped.
    pub fn play_parts(
        &self,
        parts: &BTreeMap<String, PartSection>,
        selected_names: &[String],
        include_roles: Option<&[Role]>,
        role_overrides: &HashMap<String, Role>,
        tempo: Option<f64>,
    ) -> anyhow::Result<()> {
        let names: Vec<&String> = if selected_names.is_empty() {
            parts.keys().collect()
        } else {
            selected_names.iter().collect()
        };

        let mut merged: Vec<NoteEvent> = Vec::new();
        for name in names {
            let Some(section) = parts.get(name) else {
                warn!("unknown section {name}, skipping");
                continue;
            };
            let override_role = role_overrides.get(name.as_str()).copied();
            for note in &section.notes {
                let role = resolve_role(note, &section.meta, override_role);
                if let Some(include) = include_roles {
                    if !include.contains(&role) {
                        continue;
                    }
                }
                let mut routed = note.clone();
                routed.role = Some(role);
                merged.push(routed);
            }
        }

        if merged.is_empty() {
            let message = "selected sections contain no playable events".to_string();
            self.player.report_error(&message);
            bail!(message);
        }
        info!("playing {} events from {} sections", merged.len(), parts.len());
        self.start_from_events(&merged, tempo)
    }

    /// Pause the running performance
    pub fn pause(&self) {
        self.player.pause();
    }

    /// Resume the paused performance
    pub fn resume(&self) {
        self.player.resume();
    }

    /// Stop everything; idempotent, all keys released afterwards
    pub fn stop_all(&self) {
        self.player.stop();
    }
}

impl Default for PlaybackService {
    fn default() -> Self {
        Self::new()
    }
}
