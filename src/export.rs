//! Event exports - the CSV table and the key-notation text
//!
//! The CSV mirrors the event table a UI shows: one `note_on` row carrying
//! end/duration/chord columns and one `note_off` row per note, UTF-8 with a
//! BOM so spreadsheet imports pick the encoding up.
//!
//! The key notation is a compact play-along string over 0.3 s time units:
//! keys that sound together are wrapped in brackets, chord-row symbols come
//! before melody keys inside a token, and the gap between tokens is written
//! as one space per elapsed unit.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::keymap::KeyMap;
use crate::note::{NoteEvent, WHITE_PITCH_CLASSES};
use crate::player::{detect_chord, ChordMode};

/// One space of the key notation covers this many seconds
const NOTATION_UNIT: f64 = 0.3;

/// CSV header of the event table
const CSV_HEADER: &str = "序号,开始(s),类型,音符,通道,组,结束(s),时长(s),和弦";

/// Errors from writing exports
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The output file could not be written
    #[error("export file {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Render the event table as CSV with a UTF-8 BOM
pub fn event_csv(notes: &[NoteEvent]) -> String {
    let mut sorted: Vec<&NoteEvent> = notes.iter().collect();
    sorted.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then_with(|| a.note.cmp(&b.note))
    });

    let mut out = String::from("\u{feff}");
    out.push_str(CSV_HEADER);
    out.push('\n');

    let mut seq = 1usize;
    for note in sorted {
        let start = note.start_time;
        let end = note.end_time.max(start);
        let chord_column = if note.is_chord() {
            format!("{}声部", note.chord_size)
        } else {
            String::new()
        };
        out.push_str(&format!(
            "{seq},{start:.3},note_on,{note_number},{channel},{group},{end:.3},{duration:.3},{chord_column}\n",
            note_number = note.note,
            channel = note.channel,
            group = note.group,
            duration = end - start,
        ));
        seq += 1;
        out.push_str(&format!(
            "{seq},{end:.3},note_off,{note_number},{channel},{group},{end:.3},,\n",
            note_number = note.note,
            channel = note.channel,
            group = note.group,
        ));
        seq += 1;
    }
    out
}

/// Write the CSV event table to a file
pub fn write_event_csv(notes: &[NoteEvent], path: &Path) -> Result<(), ExportError> {
    std::fs::write(path, event_csv(notes)).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Bucket key for microsecond-rounded start times
fn start_bucket(start_time: f64) -> i64 {
    (start_time * 1e6).round() as i64
}

/// Register letter and degree digit of one pitch, for notation purposes
///
/// Black keys probe up first, then down, widening once, which lands every
/// pitch class on a white neighbor.
fn notation_slot(note: u8) -> String {
    let mut pc = note % 12;
    if !WHITE_PITCH_CLASSES.contains(&pc) {
        for step in [1i32, -1, 2, -2] {
            let candidate = ((pc as i32 + step).rem_euclid(12)) as u8;
            if WHITE_PITCH_CLASSES.contains(&candidate) {
                pc = candidate;
                break;
            }
        }
    }
    let degree = WHITE_PITCH_CLASSES
        .iter()
        .position(|&white| white == pc)
        .unwrap_or(0)
        + 1;
    let register = if note < 60 {
        'L'
    } else if note <= 71 {
        'M'
    } else {
        'H'
    };
    format!("{register}{degree}")
}

/// Render note starts as the key-notation string
///
/// Keys come from the given map's 21-key slots and chord row; buckets with a
/// recognizable chord lead with its chord-row key.
pub fn key_notation(notes: &[NoteEvent], map: &KeyMap) -> String {
    let mut buckets: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
    for note in notes {
        buckets
            .entry(start_bucket(note.start_time))
            .or_default()
            .push(note.note);
    }
    if buckets.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let mut last_time: Option<f64> = None;
    for (bucket, mut pitches) in buckets {
        let time = bucket as f64 / 1e6;
        if let Some(last) = last_time {
            let gap = ((time - last).max(0.0) / NOTATION_UNIT).round() as usize;
            out.push_str(&" ".repeat(gap.max(1)));
        }
        pitches.sort_unstable();

        let mut keys: Vec<String> = Vec::new();
        let pitch_classes: HashSet<u8> = pitches.iter().map(|pitch| pitch % 12).collect();
        if let Some(chord) = detect_chord(&pitch_classes, ChordMode::Triad7) {
            if let Some(chord_key) = map.chord_key(chord) {
                keys.push(chord_key.to_string());
            }
        }
        for pitch in pitches {
            if let Some(key) = map.get(&notation_slot(pitch)) {
                keys.push(key.to_string());
            }
        }

        let token: String = keys.concat();
        if keys.len() > 1 {
            out.push('[');
            out.push_str(&token);
            out.push(']');
        } else {
            out.push_str(&token);
        }
        last_time = Some(time);
    }
    out
}

/// Write the key notation to a file
pub fn write_key_notation(
    notes: &[NoteEvent],
    map: &KeyMap,
    path: &Path,
) -> Result<(), ExportError> {
    std::fs::write(path, key_notation(notes, map)).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tag_chords;

    #[test]
    fn csv_has_bom_header_and_paired_rows() {
        let mut notes = vec![
            NoteEvent::new(0.0, 0.5, 60, 0, 80),
            NoteEvent::new(1.0, 1.2, 64, 0, 80),
            NoteEvent::new(1.0, 1.2, 67, 0, 80),
        ];
        tag_chords(&mut notes);
        let csv = event_csv(&notes);

        assert!(csv.starts_with('\u{feff}'));
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], format!("\u{feff}{CSV_HEADER}"));
        assert_eq!(lines.len(), 1 + notes.len() * 2);
        assert!(lines[1].contains("note_on"));
        assert!(lines[2].contains("note_off"));
        // The simultaneous pair is labeled with its chord size.
        assert!(csv.contains("2声部"));
        // Sequence numbers are consecutive.
        assert!(lines[1].starts_with('1') && lines[2].starts_with('2'));
    }

    #[test]
    fn csv_note_off_rows_leave_duration_and_chord_blank() {
        let notes = vec![NoteEvent::new(0.25, 0.75, 62, 1, 64)];
        let csv = event_csv(&notes);
        let off_row = csv.lines().nth(2).unwrap();
        assert!(off_row.ends_with(",,"));
        assert!(off_row.contains("0.750"));
    }

    #[test]
    fn key_notation_spaces_scale_with_the_gap() {
        let map = KeyMap::default_21key();
        let notes = vec![
            NoteEvent::new(0.0, 0.1, 60, 0, 80),
            NoteEvent::new(0.9, 1.0, 62, 0, 80),
        ];
        // 0.9 s gap is three 0.3 s units.
        assert_eq!(key_notation(&notes, &map), "q   w");

        let close = vec![
            NoteEvent::new(0.0, 0.1, 60, 0, 80),
            NoteEvent::new(0.05, 0.1, 62, 0, 80),
        ];
        // Gaps below one unit still get a single space.
        assert_eq!(key_notation(&close, &map), "q w");
    }

    #[test]
    fn key_notation_brackets_chords_with_the_symbol_first() {
        let map = KeyMap::default_21key();
        let notes = vec![
            NoteEvent::new(0.0, 0.1, 60, 0, 80),
            NoteEvent::new(0.6, 1.0, 60, 0, 80),
            NoteEvent::new(0.6, 1.0, 64, 0, 80),
            NoteEvent::new(0.6, 1.0, 67, 0, 80),
        ];
        // The triad bucket detects C and leads with its chord key "z".
        assert_eq!(key_notation(&notes, &map), "q  [zqet]");
    }

    #[test]
    fn key_notation_maps_black_keys_to_white_neighbors() {
        let map = KeyMap::default_21key();
        // C#4 probes up to D first under the notation rule.
        let notes = vec![NoteEvent::new(0.0, 0.1, 61, 0, 80)];
        assert_eq!(key_notation(&notes, &map), "w");
    }

    #[test]
    fn empty_input_renders_empty_outputs() {
        assert_eq!(key_notation(&[], &KeyMap::default_21key()), "");
        let csv = event_csv(&[]);
        assert_eq!(csv.lines().count(), 1);
    }
}
