//! Event definitions - basic units of everything pianola can analyze and play
//!
//! Two shapes of event flow through the engine. [NoteEvent] is the paired,
//! absolute-seconds note produced by the MIDI parser and consumed by the
//! analysis pipeline and the partitioner. [DispatchEvent] is the expanded
//! press/release form that the key mapper produces and the scheduler consumes.
//! Both are plain serde data, so tools can dump and reload event streams.

use serde::{Deserialize, Serialize};

/// A note with absolute start/end seconds, as produced by the MIDI parser
///
/// Invariant: `start_time <= end_time`. Unpaired note-ons are closed by the
/// parser with a default duration before a [NoteEvent] is ever emitted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NoteEvent {
    /// Start of the note in seconds from the beginning of the piece
    pub start_time: f64,

    /// End of the note in seconds, never before `start_time`
    pub end_time: f64,

    /// MIDI pitch, 0..=127
    pub note: u8,

    /// MIDI channel, 0..=15
    pub channel: u8,

    /// Note-on velocity, 0..=127
    pub velocity: u8,

    /// Index of the source track inside the MIDI file
    pub track: usize,

    /// Most recent program change seen for (track, channel) before the note
    #[serde(default)]
    pub program: Option<u8>,

    /// Instrument or track name from the source track metadata
    #[serde(default)]
    pub instrument_name: Option<String>,

    /// Pitch band the note belongs to, derived from `note`
    pub group: PitchGroup,

    /// Role assigned by the partitioner or an override; `None` until routed
    #[serde(default)]
    pub role: Option<Role>,

    /// Number of notes sharing this start time once chord tagging ran
    ///
    /// `1` means a single note, values >= 2 mean the note is part of a
    /// tagged chord. Annotation only; the analysis never drops notes here.
    #[serde(default = "chord_size_default")]
    pub chord_size: usize,
}

/// Serde default for [NoteEvent::chord_size]
fn chord_size_default() -> usize {
    1
}

impl NoteEvent {
    /// Create a note with the group derived from the pitch and no annotations
    pub fn new(start_time: f64, end_time: f64, note: u8, channel: u8, velocity: u8) -> Self {
        Self {
            start_time,
            end_time: end_time.max(start_time),
            note,
            channel,
            velocity,
            track: 0,
            program: None,
            instrument_name: None,
            group: PitchGroup::for_note(note),
            role: None,
            chord_size: 1,
        }
    }

    /// Length of the note in seconds
    pub fn duration(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }

    /// Pitch class of the note (pitch modulo 12)
    pub fn pitch_class(&self) -> u8 {
        self.note % 12
    }

    /// Whether chord tagging marked this note as part of a chord
    pub fn is_chord(&self) -> bool {
        self.chord_size >= 2
    }
}

/// Direction of a synthetic key event
///
/// The variant order encodes the dispatch rule: at equal times a release is
/// always handled before a press, so `PressUp` sorts first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// Key release
    PressUp,

    /// Key press
    PressDown,
}

impl EventKind {
    /// Rank used by the `(time, type_rank)` sort, release before press
    pub fn type_rank(self) -> u8 {
        match self {
            Self::PressUp => 0,
            Self::PressDown => 1,
        }
    }
}

/// A timed key press or release aimed at the key dispatcher
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DispatchEvent {
    /// Seconds from the beginning of the performance (before tempo scaling)
    pub time: f64,

    /// Press or release
    pub kind: EventKind,

    /// Key symbol handed to the OS backend, e.g. `"q"`
    pub key: String,

    /// Source MIDI pitch, kept for chord accounting in the scheduler
    pub note: u8,

    /// Source MIDI channel
    pub channel: u8,

    /// Role the event was routed under, if any
    #[serde(default)]
    pub role: Option<Role>,
}

/// Sort events by `(time, type_rank)` so shared-time releases precede presses
pub fn sort_dispatch_events(events: &mut [DispatchEvent]) {
    events.sort_by(|a, b| {
        a.time
            .total_cmp(&b.time)
            .then_with(|| a.kind.type_rank().cmp(&b.kind.type_rank()))
    });
}

/// Musical role a partition section or a single event can play
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Single-line lead voice
    Melody,

    /// Low register accompaniment
    Bass,

    /// Percussion (MIDI channel 10)
    Drums,

    /// Chord-row accompaniment key
    Chord,
}

impl Role {
    /// Lower-case name used in config files and CLI arguments
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Melody => "melody",
            Self::Bass => "bass",
            Self::Drums => "drums",
            Self::Chord => "chord",
        }
    }

    /// Parse the lower-case role name, `None` for anything unknown
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "melody" => Some(Self::Melody),
            "bass" => Some(Self::Bass),
            "drums" | "drum" | "percussion" => Some(Self::Drums),
            "chord" | "chords" => Some(Self::Chord),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named band of the 128-pitch space, used by the group filter
///
/// Bands sit on octave edges so that the filter composes with the register
/// choice of the key mapper.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PitchGroup {
    /// Pitches below 36 (below C2)
    VeryLow,

    /// 36..48 (C2..B2)
    Low,

    /// 48..60 (C3..B3)
    MidLow,

    /// 60..72 (C4..B4)
    Mid,

    /// 72..84 (C5..B5)
    MidHigh,

    /// 84..96 (C6..B6)
    High,

    /// 96 and above (C7 and up)
    VeryHigh,
}

impl PitchGroup {
    /// All bands in ascending pitch order
    pub const ALL: [Self; 7] = [
        Self::VeryLow,
        Self::Low,
        Self::MidLow,
        Self::Mid,
        Self::MidHigh,
        Self::High,
        Self::VeryHigh,
    ];

    /// Band the given MIDI pitch falls into
    pub fn for_note(note: u8) -> Self {
        match note {
            0..=35 => Self::VeryLow,
            36..=47 => Self::Low,
            48..=59 => Self::MidLow,
            60..=71 => Self::Mid,
            72..=83 => Self::MidHigh,
            84..=95 => Self::High,
            _ => Self::VeryHigh,
        }
    }

    /// Display name of the band
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VeryLow => "Very-low",
            Self::Low => "Low",
            Self::MidLow => "Mid-low",
            Self::Mid => "Mid",
            Self::MidHigh => "Mid-high",
            Self::High => "High",
            Self::VeryHigh => "Very-high",
        }
    }

    /// Parse a display name back into a band, `None` for anything unknown
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for PitchGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pitch classes of the C major scale, the "white keys"
pub const WHITE_PITCH_CLASSES: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];

/// Whether the pitch lands on a white key
pub fn is_white(note: u8) -> bool {
    WHITE_PITCH_CLASSES.contains(&(note % 12))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_cover_the_whole_pitch_space() {
        let mut previous = PitchGroup::for_note(0);
        for note in 0..=127u8 {
            let group = PitchGroup::for_note(note);
            assert!(group >= previous, "bands must be ascending at pitch {note}");
            previous = group;
        }
        assert_eq!(PitchGroup::for_note(0), PitchGroup::VeryLow);
        assert_eq!(PitchGroup::for_note(60), PitchGroup::Mid);
        assert_eq!(PitchGroup::for_note(127), PitchGroup::VeryHigh);
    }

    #[test]
    fn group_names_round_trip() {
        for group in PitchGroup::ALL {
            assert_eq!(PitchGroup::parse(group.as_str()), Some(group));
        }
        assert_eq!(PitchGroup::parse("mid-LOW"), Some(PitchGroup::MidLow));
        assert_eq!(PitchGroup::parse("bogus"), None);
    }

    #[test]
    fn dispatch_sort_puts_release_before_press_at_equal_time() {
        let press = DispatchEvent {
            time: 1.0,
            kind: EventKind::PressDown,
            key: "q".into(),
            note: 60,
            channel: 0,
            role: None,
        };
        let release = DispatchEvent {
            kind: EventKind::PressUp,
            ..press.clone()
        };
        let mut events = vec![press.clone(), release.clone()];
        sort_dispatch_events(&mut events);
        assert_eq!(events[0].kind, EventKind::PressUp);
        assert_eq!(events[1].kind, EventKind::PressDown);

        let mut events = vec![
            DispatchEvent {
                time: 2.0,
                ..release.clone()
            },
            press,
        ];
        sort_dispatch_events(&mut events);
        assert_eq!(events[0].kind, EventKind::PressDown);
    }

    #[test]
    fn note_event_clamps_reversed_times() {
        let note = NoteEvent::new(2.0, 1.0, 60, 0, 80);
        assert_eq!(note.end_time, 2.0);
        assert_eq!(note.duration(), 0.0);
    }
}
