//! Text scores - timestamped key lines, parsed and rendered
//!
//! The format is line oriented: one or two `[m:ss.mmm]` timestamps followed
//! by slot tokens (`L1..H7`) and chord names (`C Dm Em F G Am G7`). Two
//! ascending timestamps make a held group, a single timestamp a tap. Lines
//! starting with `#` and unknown tokens are skipped.
//!
//! Rendering goes the other way: note streams become token lines on a 30 ms
//! grid, simultaneous degrees collapse into one line, and a degree set that
//! spells one of the row chords gets the chord name in front with slightly
//! extended timing so the chord key speaks.

use tracing::debug;

use crate::keymap::{ChordName, KeyMap};
use crate::note::{sort_dispatch_events, DispatchEvent, EventKind, NoteEvent};

/// Quantization grid of rendered scores, seconds
const RENDER_GRID: f64 = 0.03;

/// Taps get this duration so their release is never lost in the same batch
const TAP_SECONDS: f64 = 0.03;

/// Chord lines start this much earlier
const CHORD_LEAD: f64 = 0.03;

/// Chord lines end this much later
const CHORD_TAIL: f64 = 0.07;

/// One parsed score line: keys pressed together over an interval
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreEvent {
    /// Press time in seconds
    pub start: f64,

    /// Release time; equal to `start` for taps
    pub end: f64,

    /// Key symbols pressed together
    pub keys: Vec<String>,
}

/// Parse a whole score, sorted by start time
pub fn parse_score(text: &str, map: &KeyMap) -> Vec<ScoreEvent> {
    let mut events: Vec<ScoreEvent> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        events.extend(parse_line(line, map));
    }
    events.sort_by(|a, b| a.start.total_cmp(&b.start));
    debug!("parsed {} score events", events.len());
    events
}

/// Parse one line into zero or more events
pub fn parse_line(line: &str, map: &KeyMap) -> Vec<ScoreEvent> {
    let (timestamps, rest) = leading_timestamps(line);
    if timestamps.is_empty() {
        return Vec::new();
    }

    let keys: Vec<String> = rest
        .split_whitespace()
        .filter(|token| is_valid_token(token))
        .filter_map(|token| map.get(token).map(str::to_string))
        .collect();
    if keys.is_empty() {
        return Vec::new();
    }

    // Exactly two ascending timestamps mean press-and-hold.
    if timestamps.len() == 2 && timestamps[1] > timestamps[0] {
        return vec![ScoreEvent {
            start: timestamps[0],
            end: timestamps[1],
            keys,
        }];
    }

    // Anything else is a series of independent taps.
    timestamps
        .into_iter()
        .map(|at| ScoreEvent {
            start: at,
            end: at,
            keys: keys.clone(),
        })
        .collect()
}

/// Collect the `[m:ss.mmm]` prefix of a line
fn leading_timestamps(line: &str) -> (Vec<f64>, &str) {
    let mut timestamps = Vec::new();
    let mut rest = line;
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else {
            break;
        };
        let Some(seconds) = parse_timestamp(&stripped[..close]) else {
            break;
        };
        timestamps.push(seconds);
        rest = stripped[close + 1..].trim_start();
    }
    (timestamps, rest)
}

/// Parse `m:ss` or `m:ss.mmm` into seconds
fn parse_timestamp(text: &str) -> Option<f64> {
    let (minutes, seconds) = text.split_once(':')?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    let seconds: f64 = seconds.trim().parse().ok()?;
    if !(0.0..60.0).contains(&seconds) {
        return None;
    }
    Some(minutes as f64 * 60.0 + seconds)
}

/// Whether a token is a 21-key slot or a chord-row name
fn is_valid_token(token: &str) -> bool {
    let mut chars = token.chars();
    if let (Some(register), Some(degree), None) = (chars.next(), chars.next(), chars.next()) {
        if matches!(register, 'L' | 'M' | 'H') && ('1'..='7').contains(&degree) {
            return true;
        }
    }
    ChordName::ROW_ORDER
        .iter()
        .any(|chord| chord.as_str() == token)
}

/// Expand score events into sorted press/release dispatch events
///
/// Taps are given a small duration so their release survives batching.
pub fn to_dispatch_events(events: &[ScoreEvent]) -> Vec<DispatchEvent> {
    let mut dispatch = Vec::with_capacity(events.len() * 2);
    for event in events {
        let end = if event.end > event.start {
            event.end
        } else {
            event.start + TAP_SECONDS
        };
        for key in &event.keys {
            dispatch.push(DispatchEvent {
                time: event.start,
                kind: EventKind::PressDown,
                key: key.clone(),
                note: 0,
                channel: 0,
                role: None,
            });
            dispatch.push(DispatchEvent {
                time: end,
                kind: EventKind::PressUp,
                key: key.clone(),
                note: 0,
                channel: 0,
                role: None,
            });
        }
    }
    sort_dispatch_events(&mut dispatch);
    dispatch
}

/// Token for one pitch, folded into the 21-key range C3..B5
fn token_for_note(note: u8) -> String {
    let mut pitch = note as i32;
    while pitch < 48 {
        pitch += 12;
    }
    while pitch > 83 {
        pitch -= 12;
    }
    let register = match pitch {
        48..=59 => 'L',
        60..=71 => 'M',
        _ => 'H',
    };
    let degree = match pitch % 12 {
        0 | 1 => '1',
        2 | 3 => '2',
        4 => '3',
        5 | 6 => '4',
        7 | 8 => '5',
        9 | 10 => '6',
        _ => '7',
    };
    format!("{register}{degree}")
}

/// Chord-row name spelled by a token group's degree set, if any
fn chord_label(tokens: &[String]) -> Option<&'static str> {
    let mut degrees: Vec<char> = tokens
        .iter()
        .filter_map(|token| {
            let mut chars = token.chars();
            match (chars.next(), chars.next()) {
                (Some('L' | 'M' | 'H'), Some(digit)) if digit.is_ascii_digit() => Some(digit),
                _ => None,
            }
        })
        .collect();
    degrees.sort_unstable();
    degrees.dedup();
    match degrees.as_slice() {
        ['1', '3', '5'] => Some("C"),
        ['2', '4', '6'] => Some("Dm"),
        ['3', '5', '7'] => Some("Em"),
        ['1', '4', '6'] => Some("F"),
        ['2', '5', '7'] => Some("G"),
        ['1', '3', '6'] => Some("Am"),
        ['2', '4', '5', '7'] => Some("G7"),
        _ => None,
    }
}

/// `m:ss.mmm` rendition of a time in seconds
fn seconds_to_timestamp(seconds: f64) -> String {
    let minutes = (seconds / 60.0).floor() as u64;
    let rest = seconds - minutes as f64 * 60.0;
    format!("{minutes}:{rest:06.3}")
}

/// Snap to the render grid
fn quantize_time(seconds: f64) -> f64 {
    (seconds / RENDER_GRID).round() * RENDER_GRID
}

/// Render a note stream as score text
pub fn to_lrcp(notes: &[NoteEvent]) -> String {
    use std::collections::BTreeMap;

    // Group by quantized (start, end); the key is in milliseconds to stay
    // hashable and ordered.
    let mut groups: BTreeMap<(i64, i64), Vec<String>> = BTreeMap::new();
    for note in notes {
        let start = quantize_time(note.start_time);
        let end = quantize_time(note.end_time.max(note.start_time));
        groups
            .entry(((start * 1000.0).round() as i64, (end * 1000.0).round() as i64))
            .or_default()
            .push(token_for_note(note.note));
    }

    let mut out = String::new();
    for ((start_ms, end_ms), mut tokens) in groups {
        let start = start_ms as f64 / 1000.0;
        let end = end_ms as f64 / 1000.0;
        tokens.sort();

        let label = chord_label(&tokens);
        let payload = match label {
            Some(label) => format!("{label} {}", tokens.join(" ")),
            None => tokens.join(" "),
        };
        let tap_threshold = if label.is_some() { 0.08 } else { RENDER_GRID };

        let (start, end) = if label.is_some() {
            ((start - CHORD_LEAD).max(0.0), end + CHORD_TAIL)
        } else {
            (start, end)
        };

        if (end - start).abs() <= tap_threshold {
            out.push_str(&format!("[{}] {payload}\n", seconds_to_timestamp(start)));
        } else {
            out.push_str(&format!(
                "[{}][{}] {payload}\n",
                seconds_to_timestamp(start),
                seconds_to_timestamp(end)
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_parse_with_and_without_millis() {
        assert_eq!(parse_timestamp("0:01.500"), Some(1.5));
        assert_eq!(parse_timestamp("2:30"), Some(150.0));
        assert_eq!(parse_timestamp("1:75"), None);
        assert_eq!(parse_timestamp("nonsense"), None);
    }

    #[test]
    fn hold_lines_make_one_event_tap_lines_many() {
        let map = KeyMap::default_21key();
        let held = parse_line("[0:01.000][0:02.000] M1 M3", &map);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].start, 1.0);
        assert_eq!(held[0].end, 2.0);
        assert_eq!(held[0].keys, ["q", "e"]);

        let taps = parse_line("[0:01.000][0:01.000] H5", &map);
        assert_eq!(taps.len(), 2);
        assert!(taps.iter().all(|event| event.start == event.end));
    }

    #[test]
    fn chord_tokens_resolve_through_the_chord_row() {
        let map = KeyMap::default_21key();
        let events = parse_line("[0:00.500] C M1", &map);
        assert_eq!(events[0].keys, ["z", "q"]);
    }

    #[test]
    fn comments_and_junk_are_skipped() {
        let map = KeyMap::default_21key();
        let text = "# header\n\n[0:00.100] M1\nnot a line\n[0:00.400] X9 M2\n";
        let events = parse_score(text, &map);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].keys, ["w"], "unknown token X9 dropped");
    }

    #[test]
    fn dispatch_expansion_gives_taps_a_duration() {
        let events = vec![ScoreEvent {
            start: 1.0,
            end: 1.0,
            keys: vec!["q".to_string()],
        }];
        let dispatch = to_dispatch_events(&events);
        assert_eq!(dispatch.len(), 2);
        assert_eq!(dispatch[0].kind, EventKind::PressDown);
        assert!(dispatch[1].time > dispatch[0].time);
    }

    #[test]
    fn note_tokens_fold_into_the_three_registers() {
        assert_eq!(token_for_note(60), "M1");
        assert_eq!(token_for_note(61), "M1");
        assert_eq!(token_for_note(36), "L1", "folded up an octave");
        assert_eq!(token_for_note(96), "H1", "folded down an octave");
        assert_eq!(token_for_note(71), "M7");
    }

    #[test]
    fn triads_get_their_chord_label_and_extended_timing() {
        let notes = vec![
            NoteEvent::new(1.0, 1.3, 60, 0, 80),
            NoteEvent::new(1.0, 1.3, 64, 0, 80),
            NoteEvent::new(1.0, 1.3, 67, 0, 80),
        ];
        let text = to_lrcp(&notes);
        assert!(text.contains("C M1 M3 M5"), "got {text:?}");
        // Start snaps to the 30 ms grid (0.99), then the chord lead comes off.
        assert!(text.starts_with("[0:00.960]"), "got {text:?}");
    }

    #[test]
    fn rendered_scores_parse_back_to_the_same_keys() {
        let map = KeyMap::default_21key();
        let notes = vec![
            NoteEvent::new(0.0, 0.5, 60, 0, 80),
            NoteEvent::new(0.6, 0.9, 64, 0, 80),
        ];
        let text = to_lrcp(&notes);
        let events = parse_score(&text, &map);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].keys, ["q"]);
        assert_eq!(events[1].keys, ["e"]);
        assert!((events[0].start - 0.0).abs() < 1e-9);
        assert!((events[0].end - 0.51).abs() < 0.03);
    }
}
