//! Key maps - pitch to key symbol with a deterministic fallback cascade
//!
//! The default layout is the 21-key grid `{L,M,H} x {1..7}` plus a chord row
//! (`C Dm Em F G Am G7`). A map is just slot -> keysym, so users can edit and
//! persist it as JSON, and partial maps still play: when the ideal slot is
//! missing the mapper walks neighboring degrees, then neighboring registers,
//! and as a last resort returns any mapped key, always in the same order, so
//! a pitch never silently drops just because a slot is unbound.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::note::{
    sort_dispatch_events, DispatchEvent, EventKind, NoteEvent, Role, WHITE_PITCH_CLASSES,
};

/// Register prefixes in ascending pitch order
const REGISTERS: [char; 3] = ['L', 'M', 'H'];

/// Degree digits of one register row
const DEGREES: [char; 7] = ['1', '2', '3', '4', '5', '6', '7'];

/// The seven chord-row chords
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChordName {
    /// C major
    C,
    /// D minor
    Dm,
    /// E minor
    Em,
    /// F major
    F,
    /// G major
    G,
    /// A minor
    Am,
    /// G dominant seventh
    G7,
}

impl ChordName {
    /// Chord-row order, the way the keys sit on the keyboard
    pub const ROW_ORDER: [Self; 7] = [
        Self::C,
        Self::Dm,
        Self::Em,
        Self::F,
        Self::G,
        Self::Am,
        Self::G7,
    ];

    /// Slot name in a key map
    pub fn as_str(self) -> &'static str {
        match self {
            Self::C => "C",
            Self::Dm => "Dm",
            Self::Em => "Em",
            Self::F => "F",
            Self::G => "G",
            Self::Am => "Am",
            Self::G7 => "G7",
        }
    }

    /// Pitch classes that make the chord up
    pub fn pitch_classes(self) -> &'static [u8] {
        match self {
            Self::G7 => &[7, 11, 2, 5],
            Self::C => &[0, 4, 7],
            Self::Dm => &[2, 5, 9],
            Self::Em => &[4, 7, 11],
            Self::F => &[5, 9, 0],
            Self::G => &[7, 11, 2],
            Self::Am => &[9, 0, 4],
        }
    }

    /// Root pitch class of the chord
    pub fn root(self) -> u8 {
        match self {
            Self::C => 0,
            Self::Dm => 2,
            Self::Em => 4,
            Self::F => 5,
            Self::G => 7,
            Self::Am => 9,
            Self::G7 => 7,
        }
    }
}

impl std::fmt::Display for ChordName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from loading or saving key maps
#[derive(Debug, thiserror::Error)]
pub enum KeymapError {
    /// The file could not be read or written
    #[error("key map file {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not a JSON object of strings
    #[error("key map is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Slot -> keysym mapping, editable and JSON-persistable
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct KeyMap {
    /// Ordered slots; the order doubles as the last-resort fallback order
    slots: BTreeMap<String, String>,
}

impl KeyMap {
    /// The built-in 21-key layout with the chord row
    pub fn default_21key() -> Self {
        let mut slots = BTreeMap::new();
        for (row, keys) in [
            ('L', ["a", "s", "d", "f", "g", "h", "j"]),
            ('M', ["q", "w", "e", "r", "t", "y", "u"]),
            ('H', ["1", "2", "3", "4", "5", "6", "7"]),
        ] {
            for (degree, key) in DEGREES.iter().zip(keys) {
                slots.insert(format!("{row}{degree}"), key.to_string());
            }
        }
        for (chord, key) in ChordName::ROW_ORDER
            .iter()
            .zip(["z", "x", "c", "v", "b", "n", "m"])
        {
            slots.insert(chord.as_str().to_string(), key.to_string());
        }
        Self { slots }
    }

    /// The Genshin 21-key layout (rows shifted one register down)
    pub fn genshin_21key() -> Self {
        let mut slots = BTreeMap::new();
        for (row, keys) in [
            ('L', ["z", "x", "c", "v", "b", "n", "m"]),
            ('M', ["a", "s", "d", "f", "g", "h", "j"]),
            ('H', ["q", "w", "e", "r", "t", "y", "u"]),
        ] {
            for (degree, key) in DEGREES.iter().zip(keys) {
                slots.insert(format!("{row}{degree}"), key.to_string());
            }
        }
        Self { slots }
    }

    /// Built-in drum-role layout
    pub fn drums() -> Self {
        Self::genshin_21key()
    }

    /// Built-in bass-role layout: every register folds onto the bottom row
    pub fn bass() -> Self {
        let mut slots = BTreeMap::new();
        for row in REGISTERS {
            for (degree, key) in DEGREES.iter().zip(["z", "x", "c", "v", "b", "n", "m"]) {
                slots.insert(format!("{row}{degree}"), key.to_string());
            }
        }
        Self { slots }
    }

    /// Resolve a named profile; unknown names get the default layout
    pub fn profile(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "genshin" => Self::genshin_21key(),
            "drums" => Self::drums(),
            "bass" => Self::bass(),
            _ => Self::default_21key(),
        }
    }

    /// Key bound to a slot
    pub fn get(&self, slot: &str) -> Option<&str> {
        self.slots.get(slot).map(String::as_str)
    }

    /// Bind or rebind one slot
    pub fn set(&mut self, slot: &str, key: &str) {
        self.slots.insert(slot.to_string(), key.to_string());
    }

    /// Number of bound slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is bound
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Key of the chord-row slot for a chord
    pub fn chord_key(&self, chord: ChordName) -> Option<&str> {
        self.get(chord.as_str())
    }

    /// Load a map from a JSON file
    pub fn load(path: &Path) -> Result<Self, KeymapError> {
        let text = std::fs::read_to_string(path).map_err(|source| KeymapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Persist the map as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), KeymapError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| KeymapError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Map a pitch to a key, walking the fallback cascade when needed
    ///
    /// Returns `None` only for an empty map.
    pub fn map_note(&self, pitch: u8) -> Option<&str> {
        let register = register_for(pitch);
        let degree_index = nearest_degree_index(pitch);

        // The ideal slot.
        let slot = format!("{register}{}", DEGREES[degree_index]);
        if let Some(key) = self.get(&slot) {
            return Some(key);
        }

        // Neighboring degrees in the same register, spreading outward.
        if let Some(key) = self.scan_register(register, degree_index) {
            return Some(key);
        }

        // Neighboring registers, nearest first.
        let priority: [char; 2] = match register {
            'L' => ['M', 'H'],
            'H' => ['M', 'L'],
            _ => ['L', 'H'],
        };
        for fallback_register in priority {
            let slot = format!("{fallback_register}{}", DEGREES[degree_index]);
            if let Some(key) = self.get(&slot) {
                return Some(key);
            }
            if let Some(key) = self.scan_register(fallback_register, degree_index) {
                return Some(key);
            }
        }

        // Anything at all, in a fixed register order, then map order.
        for fallback_register in ['M', 'L', 'H'] {
            for degree in DEGREES {
                if let Some(key) = self.get(&format!("{fallback_register}{degree}")) {
                    return Some(key);
                }
            }
        }
        trace!("pitch {pitch} fell through to the first bound slot");
        self.slots.values().next().map(String::as_str)
    }

    /// Alternating left/right degree scan inside one register
    fn scan_register(&self, register: char, degree_index: usize) -> Option<&str> {
        for step in 1..DEGREES.len() {
            if degree_index >= step {
                let slot = format!("{register}{}", DEGREES[degree_index - step]);
                if let Some(key) = self.get(&slot) {
                    return Some(key);
                }
            }
            if degree_index + step < DEGREES.len() {
                let slot = format!("{register}{}", DEGREES[degree_index + step]);
                if let Some(key) = self.get(&slot) {
                    return Some(key);
                }
            }
        }
        None
    }
}

/// Register a pitch plays in: octave <= 3 low, 4 mid, higher high
fn register_for(pitch: u8) -> char {
    let octave = pitch as i32 / 12 - 1;
    if octave <= 3 {
        'L'
    } else if octave == 4 {
        'M'
    } else {
        'H'
    }
}

/// Index of the diatonic degree nearest to the pitch class
///
/// The scan order of the white pitch classes makes half-tone ties resolve
/// to the earlier degree, deterministically.
fn nearest_degree_index(pitch: u8) -> usize {
    let pc = (pitch % 12) as i32;
    let mut best_index = 0;
    let mut best_distance = i32::MAX;
    for (index, &white) in WHITE_PITCH_CLASSES.iter().enumerate() {
        let distance = (white as i32 - pc).abs();
        if distance < best_distance {
            best_distance = distance;
            best_index = index;
        }
    }
    best_index
}

/// Expand paired notes into sorted press/release dispatch events
///
/// Each note is routed through the role-specific map when its role has one,
/// else through the default map. Notes that cannot be mapped (empty map) are
/// dropped with a trace log.
pub fn map_events(
    notes: &[NoteEvent],
    default_map: &KeyMap,
    role_maps: &HashMap<Role, KeyMap>,
) -> Vec<DispatchEvent> {
    let mut events = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let map = note
            .role
            .and_then(|role| role_maps.get(&role))
            .unwrap_or(default_map);
        let Some(key) = map.map_note(note.note) else {
            trace!("dropping unmappable pitch {}", note.note);
            continue;
        };
        events.push(DispatchEvent {
            time: note.start_time,
            kind: EventKind::PressDown,
            key: key.to_string(),
            note: note.note,
            channel: note.channel,
            role: note.role,
        });
        events.push(DispatchEvent {
            time: note.end_time.max(note.start_time),
            kind: EventKind::PressUp,
            key: key.to_string(),
            note: note.note,
            channel: note.channel,
            role: note.role,
        });
    }
    sort_dispatch_events(&mut events);
    debug!("mapped {} notes into {} key events", notes.len(), events.len());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middle_c_maps_to_m1() {
        let map = KeyMap::default_21key();
        assert_eq!(map.map_note(60), Some("q"));
        // The C major triad of the chord scenario.
        assert_eq!(map.map_note(64), Some("e"));
        assert_eq!(map.map_note(67), Some("t"));
    }

    #[test]
    fn extreme_pitches_still_map() {
        let map = KeyMap::default_21key();
        // Pitch 0 is octave -1, register L, degree 1.
        assert_eq!(map.map_note(0), Some("a"));
        // Pitch 127 is register H; pitch class 7 is degree 5.
        assert_eq!(map.map_note(127), Some("5"));
    }

    #[test]
    fn half_tones_pick_the_nearest_degree_deterministically() {
        let map = KeyMap::default_21key();
        // C#4: tie between C and D resolves to the earlier degree.
        assert_eq!(map.map_note(61), Some("q"));
        // F#4: tie between F and G resolves to F.
        assert_eq!(map.map_note(66), Some("r"));
        // G#4 is nearer to G than to A.
        assert_eq!(map.map_note(68), Some("t"));
    }

    #[test]
    fn fallback_walks_neighbors_then_registers() {
        let mut map = KeyMap::default_21key();
        // Unbind M1; C4 should land on its neighbor M2.
        map.slots.remove("M1");
        assert_eq!(map.map_note(60), Some("w"));

        // Strip the whole M register; C4 falls to L1 first.
        let mut map = KeyMap::default_21key();
        for degree in DEGREES {
            map.slots.remove(&format!("M{degree}"));
        }
        assert_eq!(map.map_note(60), Some("a"));

        // A single bound slot catches everything.
        let mut tiny = KeyMap::default();
        tiny.set("H7", "7");
        assert_eq!(tiny.map_note(60), Some("7"));
        assert_eq!(tiny.map_note(0), Some("7"));

        // Nothing bound, nothing mapped.
        assert_eq!(KeyMap::default().map_note(60), None);
    }

    #[test]
    fn chord_row_resolves_through_chord_key() {
        let map = KeyMap::default_21key();
        assert_eq!(map.chord_key(ChordName::C), Some("z"));
        assert_eq!(map.chord_key(ChordName::G7), Some("m"));
        assert_eq!(KeyMap::genshin_21key().chord_key(ChordName::C), None);
    }

    #[test]
    fn json_round_trip_preserves_bindings() {
        let path = std::env::temp_dir().join(format!("pianola-keymap-{}.json", std::process::id()));
        let mut map = KeyMap::default_21key();
        map.set("M1", "p");
        map.save(&path).unwrap();
        let loaded = KeyMap::load(&path).unwrap();
        assert_eq!(loaded, map);
        assert_eq!(loaded.map_note(60), Some("p"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn map_events_expands_and_sorts() {
        let notes = vec![
            NoteEvent::new(1.0, 1.5, 60, 0, 80),
            NoteEvent::new(0.5, 1.0, 64, 0, 80),
        ];
        let events = map_events(&notes, &KeyMap::default_21key(), &HashMap::new());
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].key, "e");
        assert_eq!(events[0].kind, EventKind::PressDown);
        // At t=1.0 the release of "e" precedes the press of "q".
        assert_eq!(events[1].kind, EventKind::PressUp);
        assert_eq!(events[1].key, "e");
        assert_eq!(events[2].kind, EventKind::PressDown);
        assert_eq!(events[2].key, "q");
    }

    #[test]
    fn role_maps_substitute_wholesale() {
        let mut bass_note = NoteEvent::new(0.0, 0.5, 40, 0, 80);
        bass_note.role = Some(Role::Bass);
        let mut role_maps = HashMap::new();
        role_maps.insert(Role::Bass, KeyMap::bass());
        let events = map_events(&[bass_note], &KeyMap::default_21key(), &role_maps);
        // Pitch 40 is L row degree 3 in the bass layout.
        assert_eq!(events[0].key, "c");
    }
}
