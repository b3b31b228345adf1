//! MIDI parsing and writing - files to absolute-seconds notes, and back
//!
//! Parsing merges every track into one tick-ordered stream, builds a global
//! tempo map with precomputed cumulative seconds, and pairs note-ons with
//! their offs through a FIFO stack per (track, channel, pitch). The result is
//! a list of [NoteEvent]s carrying real seconds, so nothing downstream ever
//! thinks in ticks again.
//!
//! Writing goes the other way for the partition export: sections become
//! fixed-tempo type-1 files, one track per section, with releases sorted
//! before presses at equal ticks and a zero-delta end-of-track marker.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Fps, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use tracing::{debug, warn};

use crate::note::{NoteEvent, PitchGroup};

/// Microseconds per beat when a file never sets a tempo (120 BPM)
pub const DEFAULT_TEMPO: u32 = 500_000;

/// Ticks per beat used by the partition export
pub const EXPORT_TICKS_PER_BEAT: u16 = 480;

/// Duration given to note-ons that never see their note-off
const UNPAIRED_NOTE_SECONDS: f64 = 0.2;

/// Errors from reading or writing MIDI files
#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The bytes are not a standard MIDI file
    #[error("failed to parse MIDI data: {0}")]
    Parse(#[from] midly::Error),

    /// The export could not be written
    #[error("failed to write {path}: {source}")]
    Save {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// One tempo segment with its precomputed start in seconds
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TempoEntry {
    /// Absolute tick the tempo takes effect at
    pub tick: u64,

    /// Microseconds per beat from this tick on
    pub us_per_beat: u32,

    /// Cumulative seconds from tick zero to this entry
    pub acc_seconds: f64,
}

/// How ticks scale into seconds
#[derive(Clone, Copy, Debug)]
enum TickScale {
    /// Pulses-per-quarter-note; tempo dependent
    Metrical {
        /// Ticks per beat from the file header
        ticks_per_beat: u16,
    },

    /// SMPTE; constant seconds per tick, tempo independent
    Timecode {
        /// `1 / (fps * ticks_per_frame)`
        seconds_per_tick: f64,
    },
}

/// Tempo-segmented tick-to-seconds integration
///
/// Lookups binary-search the last entry at or before the tick and extend
/// linearly with that segment's tempo, so conversion is `O(log n)`.
pub struct TempoMap {
    /// Scaling mode from the file header
    scale: TickScale,

    /// Deduplicated tempo changes in ascending tick order
    entries: Vec<TempoEntry>,
}

impl TempoMap {
    /// Build a map from the header timing and the merged tempo changes
    ///
    /// Same-tick duplicates keep the last change. A degenerate SMPTE
    /// division (zero ticks per frame) falls back to 120 BPM over 480 PPQ.
    pub fn new(timing: Timing, changes: &[(u64, u32)]) -> Self {
        let scale = match timing {
            Timing::Metrical(ticks_per_beat) => TickScale::Metrical {
                ticks_per_beat: u16::from(ticks_per_beat).max(1),
            },
            Timing::Timecode(fps, ticks_per_frame) => {
                if ticks_per_frame == 0 {
                    warn!("SMPTE division with zero ticks per frame, assuming 120 BPM");
                    TickScale::Metrical {
                        ticks_per_beat: EXPORT_TICKS_PER_BEAT,
                    }
                } else {
                    let fps = match fps {
                        Fps::Fps24 => 24.0,
                        Fps::Fps25 => 25.0,
                        Fps::Fps29 => 29.97,
                        Fps::Fps30 => 30.0,
                    };
                    TickScale::Timecode {
                        seconds_per_tick: 1.0 / (fps * ticks_per_frame as f64),
                    }
                }
            }
        };

        let mut sorted: Vec<(u64, u32)> = changes.to_vec();
        sorted.sort_by_key(|(tick, _)| *tick);
        let mut deduped: Vec<TempoEntry> = Vec::with_capacity(sorted.len() + 1);
        for (tick, us_per_beat) in sorted {
            let same_tick = deduped.last().map(|last| last.tick) == Some(tick);
            if same_tick {
                if let Some(last) = deduped.last_mut() {
                    last.us_per_beat = us_per_beat;
                }
            } else {
                deduped.push(TempoEntry {
                    tick,
                    us_per_beat,
                    acc_seconds: 0.0,
                });
            }
        }
        if deduped.first().map(|entry| entry.tick) != Some(0) {
            deduped.insert(
                0,
                TempoEntry {
                    tick: 0,
                    us_per_beat: DEFAULT_TEMPO,
                    acc_seconds: 0.0,
                },
            );
        }

        let mut map = Self {
            scale,
            entries: deduped,
        };
        for i in 1..map.entries.len() {
            let prev = map.entries[i - 1];
            let delta_ticks = map.entries[i].tick - prev.tick;
            map.entries[i].acc_seconds =
                prev.acc_seconds + delta_ticks as f64 * map.seconds_per_tick(prev.us_per_beat);
        }
        map
    }

    /// Seconds covered by one tick under the given tempo
    fn seconds_per_tick(&self, us_per_beat: u32) -> f64 {
        match self.scale {
            TickScale::Metrical { ticks_per_beat } => {
                us_per_beat as f64 / 1_000_000.0 / ticks_per_beat as f64
            }
            TickScale::Timecode { seconds_per_tick } => seconds_per_tick,
        }
    }

    /// Absolute tick to absolute seconds; monotonic non-decreasing
    pub fn tick_to_seconds(&self, tick: u64) -> f64 {
        if let TickScale::Timecode { seconds_per_tick } = self.scale {
            return tick as f64 * seconds_per_tick;
        }
        let index = self
            .entries
            .partition_point(|entry| entry.tick <= tick)
            .saturating_sub(1);
        let base = self.entries[index];
        base.acc_seconds + (tick - base.tick) as f64 * self.seconds_per_tick(base.us_per_beat)
    }

    /// The tempo segments of the map
    pub fn entries(&self) -> &[TempoEntry] {
        &self.entries
    }
}

/// Result of parsing one MIDI file
pub struct ParsedMidi {
    /// Paired notes sorted by start time
    pub notes: Vec<NoteEvent>,

    /// Distinct channels that produced notes, ascending
    pub channels: Vec<u8>,

    /// The tempo map the conversion used
    pub tempo_map: TempoMap,

    /// Number of tracks in the file
    pub track_count: usize,

    /// Latest note end in seconds
    pub duration: f64,
}

/// Owned, minimal view of one merged track message
struct MergedMessage {
    /// Absolute tick inside its track
    tick: u64,

    /// Source track index
    track: usize,

    /// The part of the message the parser cares about
    kind: MessageKind,
}

/// Message payloads relevant to note extraction
enum MessageKind {
    /// Note-on with velocity > 0
    NoteOn {
        /// Channel
        channel: u8,
        /// Pitch
        note: u8,
        /// Velocity
        velocity: u8,
    },

    /// Note-off, or note-on with velocity 0
    NoteOff {
        /// Channel
        channel: u8,
        /// Pitch
        note: u8,
    },

    /// Program change
    Program {
        /// Channel
        channel: u8,
        /// Program number
        program: u8,
    },
}

/// Parse a MIDI file from disk
pub fn parse_file(path: &Path) -> Result<ParsedMidi, MidiError> {
    let bytes = std::fs::read(path).map_err(|source| MidiError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_bytes(&bytes)
}

/// Parse a MIDI file already in memory
pub fn parse_bytes(bytes: &[u8]) -> Result<ParsedMidi, MidiError> {
    let smf = Smf::parse(bytes)?;
    let track_count = smf.tracks.len();

    // Merge all tracks into one tick-ordered stream, remembering per-track
    // names so notes can carry their instrument label.
    let mut merged: Vec<MergedMessage> = Vec::new();
    let mut tempo_changes: Vec<(u64, u32)> = Vec::new();
    let mut track_names: HashMap<usize, String> = HashMap::new();

    for (track_index, track) in smf.tracks.iter().enumerate() {
        let mut tick: u64 = 0;
        for event in track {
            tick += u64::from(event.delta.as_int());
            match event.kind {
                TrackEventKind::Midi { channel, message } => match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        merged.push(MergedMessage {
                            tick,
                            track: track_index,
                            kind: MessageKind::NoteOn {
                                channel: channel.as_int(),
                                note: key.as_int(),
                                velocity: vel.as_int(),
                            },
                        });
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        merged.push(MergedMessage {
                            tick,
                            track: track_index,
                            kind: MessageKind::NoteOff {
                                channel: channel.as_int(),
                                note: key.as_int(),
                            },
                        });
                    }
                    MidiMessage::ProgramChange { program } => {
                        merged.push(MergedMessage {
                            tick,
                            track: track_index,
                            kind: MessageKind::Program {
                                channel: channel.as_int(),
                                program: program.as_int(),
                            },
                        });
                    }
                    _ => {}
                },
                TrackEventKind::Meta(MetaMessage::Tempo(us_per_beat)) => {
                    tempo_changes.push((tick, us_per_beat.as_int()));
                }
                TrackEventKind::Meta(MetaMessage::InstrumentName(name))
                | TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                    track_names
                        .entry(track_index)
                        .or_insert_with(|| String::from_utf8_lossy(name).trim().to_string());
                }
                _ => {}
            }
        }
    }
    merged.sort_by_key(|message| message.tick);

    let tempo_map = TempoMap::new(smf.header.timing, &tempo_changes);

    // Pair ons with offs; a FIFO per (track, channel, pitch) keeps overlapping
    // repeats of the same pitch in order.
    let mut on_stack: HashMap<(usize, u8, u8), VecDeque<(u64, u8, Option<u8>)>> = HashMap::new();
    let mut last_program: HashMap<(usize, u8), u8> = HashMap::new();
    let mut notes: Vec<NoteEvent> = Vec::new();

    let mut emit = |start_tick: u64,
                    end_tick: u64,
                    track: usize,
                    channel: u8,
                    note: u8,
                    velocity: u8,
                    program: Option<u8>,
                    names: &HashMap<usize, String>,
                    map: &TempoMap| {
        let start_time = map.tick_to_seconds(start_tick);
        let end_time = map.tick_to_seconds(end_tick).max(start_time);
        notes.push(NoteEvent {
            start_time,
            end_time,
            note,
            channel,
            velocity,
            track,
            program,
            instrument_name: names.get(&track).cloned(),
            group: PitchGroup::for_note(note),
            role: None,
            chord_size: 1,
        });
    };

    for message in &merged {
        match message.kind {
            MessageKind::Program { channel, program } => {
                last_program.insert((message.track, channel), program);
            }
            MessageKind::NoteOn {
                channel,
                note,
                velocity,
            } => {
                let program = last_program.get(&(message.track, channel)).copied();
                on_stack
                    .entry((message.track, channel, note))
                    .or_default()
                    .push_back((message.tick, velocity, program));
            }
            MessageKind::NoteOff { channel, note } => {
                if let Some(pending) = on_stack.get_mut(&(message.track, channel, note)) {
                    if let Some((start_tick, velocity, program)) = pending.pop_front() {
                        emit(
                            start_tick,
                            message.tick,
                            message.track,
                            channel,
                            note,
                            velocity,
                            program,
                            &track_names,
                            &tempo_map,
                        );
                    }
                }
            }
        }
    }

    // Close whatever never got a note-off with a default duration.
    for ((track, channel, note), pending) in on_stack {
        for (start_tick, velocity, program) in pending {
            let start_time = tempo_map.tick_to_seconds(start_tick);
            let end_time = start_time + UNPAIRED_NOTE_SECONDS;
            notes.push(NoteEvent {
                start_time,
                end_time,
                note,
                channel,
                velocity,
                track,
                program,
                instrument_name: track_names.get(&track).cloned(),
                group: PitchGroup::for_note(note),
                role: None,
                chord_size: 1,
            });
        }
    }

    notes.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then_with(|| a.track.cmp(&b.track))
            .then_with(|| a.note.cmp(&b.note))
    });

    let mut channels: Vec<u8> = notes.iter().map(|note| note.channel).collect();
    channels.sort_unstable();
    channels.dedup();

    let duration = notes
        .iter()
        .map(|note| note.end_time)
        .fold(0.0f64, f64::max);

    debug!(
        "parsed {count} notes over {duration:.3}s from {track_count} tracks",
        count = notes.len()
    );

    Ok(ParsedMidi {
        notes,
        channels,
        tempo_map,
        track_count,
        duration,
    })
}

/// Seconds to absolute export ticks under a fixed tempo
fn seconds_to_ticks(seconds: f64, us_per_beat: u32) -> u64 {
    let ticks = seconds.max(0.0) * EXPORT_TICKS_PER_BEAT as f64 * 1_000_000.0 / us_per_beat as f64;
    ticks.round() as u64
}

/// Tempo in microseconds per beat for a BPM value
fn bpm_to_tempo(bpm: u32) -> u32 {
    60_000_000 / bpm.max(1)
}

/// File-system safe rendition of a section name
fn safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build one export track from paired notes
///
/// Events are laid out at fixed tempo, sorted `(tick, off before on)`, and
/// closed with a zero-delta end-of-track.
fn notes_to_track(notes: &[NoteEvent], us_per_beat: u32, with_tempo: bool) -> Vec<TrackEvent<'static>> {
    // (tick, rank, kind); rank 0 = off, 1 = on
    let mut rows: Vec<(u64, u8, TrackEventKind<'static>)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let channel = u4::from(note.channel.min(15));
        let key = u7::from(note.note.min(127));
        rows.push((
            seconds_to_ticks(note.start_time, us_per_beat),
            1,
            TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn {
                    key,
                    vel: u7::from(note.velocity.clamp(1, 127)),
                },
            },
        ));
        rows.push((
            seconds_to_ticks(note.end_time, us_per_beat),
            0,
            TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOff {
                    key,
                    vel: u7::from(0),
                },
            },
        ));
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut track: Vec<TrackEvent<'static>> = Vec::with_capacity(rows.len() + 2);
    if with_tempo {
        track.push(TrackEvent {
            delta: u28::from(0u32),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(us_per_beat))),
        });
    }
    let mut previous_tick: u64 = 0;
    for (tick, _, kind) in rows {
        let delta = (tick - previous_tick.min(tick)) as u32;
        previous_tick = tick;
        track.push(TrackEvent {
            delta: u28::from(delta),
            kind,
        });
    }
    track.push(TrackEvent {
        delta: u28::from(0u32),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    track
}

/// Write one `.mid` per section into `out_dir`, returning the paths
pub fn export_partitions<'a, I>(
    sections: I,
    out_dir: &Path,
    tempo_bpm: u32,
) -> Result<Vec<PathBuf>, MidiError>
where
    I: IntoIterator<Item = (&'a str, &'a [NoteEvent])>,
{
    std::fs::create_dir_all(out_dir).map_err(|source| MidiError::Save {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let us_per_beat = bpm_to_tempo(tempo_bpm);
    let mut written = Vec::new();
    for (name, notes) in sections {
        let smf = Smf {
            header: Header::new(
                Format::Parallel,
                Timing::Metrical(u15::new(EXPORT_TICKS_PER_BEAT)),
            ),
            tracks: vec![notes_to_track(notes, us_per_beat, true)],
        };
        let path = out_dir.join(format!("{}.mid", safe_file_name(name)));
        smf.save(&path).map_err(|source| MidiError::Save {
            path: path.clone(),
            source,
        })?;
        written.push(path);
    }
    debug!("exported {} partition files", written.len());
    Ok(written)
}

/// Write selected sections as one multi-track type-1 file
pub fn export_sections_single<'a, I>(
    sections: I,
    path: &Path,
    tempo_bpm: u32,
) -> Result<(), MidiError>
where
    I: IntoIterator<Item = (&'a str, &'a [NoteEvent])>,
{
    let us_per_beat = bpm_to_tempo(tempo_bpm);
    let mut tracks = Vec::new();
    for (index, (_, notes)) in sections.into_iter().enumerate() {
        // Only the first track carries the global tempo.
        tracks.push(notes_to_track(notes, us_per_beat, index == 0));
    }
    let smf = Smf {
        header: Header::new(
            Format::Parallel,
            Timing::Metrical(u15::new(EXPORT_TICKS_PER_BEAT)),
        ),
        tracks,
    };
    smf.save(path).map_err(|source| MidiError::Save {
        path: path.to_path_buf(),
        source,
    })
}
