//! Analysis pipeline - musically-aware filters between parsing and playback
//!
//! Stages run in a fixed order, each optional: pitch-group filter,
//! transposition, melody extraction, black-key rewrite, start-time
//! quantization, chord tagging. Every stage consumes and produces plain
//! [NoteEvent] lists, so stages compose and none of them knows about keys or
//! scheduling.
//!
//! The melody extractor is the one stage with real heuristics inside: it
//! scores channels by how melodic they look (mid-register hits minus rhythm
//! entropy), then optionally thins the chosen channel by beat similarity or
//! pitch repetition, and finally collapses what is left into a single line.

use std::collections::HashMap;

use itertools::Itertools;
use tracing::debug;

use crate::note::{is_white, NoteEvent, PitchGroup, WHITE_PITCH_CLASSES};

/// Resolution of the rhythm-entropy histogram, seconds
const ENTROPY_BIN: f64 = 0.05;

/// Resolution of the dominant-period histogram, seconds
const PERIOD_BIN: f64 = 0.02;

/// Smallest population the repetition filter may leave behind
const REPETITION_MIN_KEEP: usize = 8;

/// How the whole-piece transposition is chosen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransposeMode {
    /// Leave pitches alone
    Off,

    /// Shift every pitch by this many semitones
    Manual(i32),

    /// Pick the shift in -6..=6 that maximizes the white-key ratio
    Auto,
}

/// What a monophonic cluster keeps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollapsePreference {
    /// Highest pitch wins
    #[default]
    Highest,

    /// Loudest note wins
    Loudest,

    /// Longest note wins
    Longest,
}

/// Strategy for rewriting black keys onto the white rows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlackKeyStrategy {
    /// Leave black keys alone
    Off,

    /// Rewrite to the nearest lower white key
    #[default]
    Down,

    /// Rewrite to the closer white neighbor, ties going down
    Nearest,
}

/// Melody extraction modes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MelodyMode {
    /// Channel selection only
    #[default]
    Entropy,

    /// Keep notes whose spacing matches the dominant inter-onset interval
    Beat,

    /// Drop notes whose pitch repeats too much across the piece
    Repetition,

    /// Repetition filter, then beat filter
    Hybrid,
}

/// Tuning for [extract_melody]
#[derive(Clone, Debug)]
pub struct MelodyOptions {
    /// Filter family
    pub mode: MelodyMode,

    /// Channel the user wants; falls back to scoring when empty
    pub prefer_channel: Option<u8>,

    /// Weight of rhythm entropy in the channel score
    pub entropy_weight: f64,

    /// Reject the piece entirely when the best channel scores below this
    pub min_score: Option<f64>,

    /// Filter strength in 0..=1; also drives the monophony window
    pub strength: f64,

    /// How hard repeated pitches are punished in repetition mode
    pub repetition_penalty: f64,

    /// Which note a simultaneous cluster keeps
    pub prefer: CollapsePreference,
}

impl Default for MelodyOptions {
    fn default() -> Self {
        Self {
            mode: MelodyMode::Entropy,
            prefer_channel: None,
            entropy_weight: 0.5,
            min_score: None,
            strength: 0.5,
            repetition_penalty: 1.0,
            prefer: CollapsePreference::Highest,
        }
    }
}

/// Complete pipeline configuration
#[derive(Clone, Debug)]
pub struct AnalysisOptions {
    /// Bands to keep; empty means no filtering
    pub groups: Vec<PitchGroup>,

    /// Whole-piece transposition
    pub transpose: TransposeMode,

    /// Melody extraction, when wanted
    pub melody: Option<MelodyOptions>,

    /// Black-key rewrite applied after melody extraction
    pub black_keys: BlackKeyStrategy,

    /// Start-time grid in milliseconds; `None` disables quantization
    pub quantize_grid_ms: Option<u32>,

    /// Whether simultaneous starts get chord annotations
    pub tag_chords: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            transpose: TransposeMode::Off,
            melody: None,
            black_keys: BlackKeyStrategy::Off,
            quantize_grid_ms: Some(30),
            tag_chords: true,
        }
    }
}

/// What the pipeline did, alongside the surviving notes
#[derive(Clone, Debug)]
pub struct AnalysisReport {
    /// Notes after all stages
    pub notes: Vec<NoteEvent>,

    /// Transposition that was applied
    pub transpose_semitones: i32,

    /// White-key ratio after transposition, when one was applied
    pub white_ratio: Option<f64>,

    /// Note count before the first stage
    pub input_count: usize,
}

/// Run the staged pipeline in its fixed order
pub fn analyze(notes: Vec<NoteEvent>, options: &AnalysisOptions) -> AnalysisReport {
    let input_count = notes.len();
    let mut notes = filter_by_groups(notes, &options.groups);

    let mut transpose_semitones = 0;
    let mut white_ratio = None;
    match options.transpose {
        TransposeMode::Off => {}
        TransposeMode::Manual(semitones) => {
            notes = transpose(&notes, semitones);
            transpose_semitones = semitones;
            white_ratio = Some(white_key_ratio(&notes));
        }
        TransposeMode::Auto => {
            let chosen = auto_transpose(&notes);
            transpose_semitones = chosen.semitones;
            white_ratio = Some(chosen.white_ratio);
            notes = chosen.notes;
        }
    }

    if let Some(melody) = &options.melody {
        notes = extract_melody(&notes, melody);
    }

    notes = transpose_black_keys(&notes, options.black_keys);

    if let Some(grid_ms) = options.quantize_grid_ms {
        notes = quantize(&notes, grid_ms.max(1));
    }

    if options.tag_chords {
        tag_chords(&mut notes);
    }

    debug!(
        "analysis kept {kept} of {input_count} notes (transpose {transpose_semitones})",
        kept = notes.len()
    );

    AnalysisReport {
        notes,
        transpose_semitones,
        white_ratio,
        input_count,
    }
}

/// Keep notes whose band is in the selection; empty selection keeps all
pub fn filter_by_groups(notes: Vec<NoteEvent>, selected: &[PitchGroup]) -> Vec<NoteEvent> {
    if selected.is_empty() {
        return notes;
    }
    notes
        .into_iter()
        .filter(|note| selected.contains(&note.group))
        .collect()
}

/// Shift every pitch by `semitones`, clamped to 0..=127
pub fn transpose(notes: &[NoteEvent], semitones: i32) -> Vec<NoteEvent> {
    notes
        .iter()
        .map(|note| {
            let pitch = (note.note as i32 + semitones).clamp(0, 127) as u8;
            let mut moved = note.clone();
            moved.note = pitch;
            moved.group = PitchGroup::for_note(pitch);
            moved
        })
        .collect()
}

/// Fraction of notes landing on white keys
pub fn white_key_ratio(notes: &[NoteEvent]) -> f64 {
    if notes.is_empty() {
        return 0.0;
    }
    let white = notes.iter().filter(|note| is_white(note.note)).count();
    white as f64 / notes.len() as f64
}

/// Outcome of the automatic transposition search
#[derive(Clone, Debug)]
pub struct AutoTranspose {
    /// Chosen shift in semitones
    pub semitones: i32,

    /// White-key ratio the shift achieves
    pub white_ratio: f64,

    /// The transposed sequence, cached so callers need not redo the shift
    pub notes: Vec<NoteEvent>,
}

/// Search -6..=6 for the shift with the best white-key ratio
///
/// Ties prefer the smaller absolute shift, then the non-negative one.
pub fn auto_transpose(notes: &[NoteEvent]) -> AutoTranspose {
    let mut best_semitones: i32 = 0;
    let mut best_ratio = -1.0f64;
    let mut best_notes: Vec<NoteEvent> = notes.to_vec();

    for semitones in -6i32..=6 {
        let candidate = transpose(notes, semitones);
        let ratio = white_key_ratio(&candidate);
        let better = if ratio > best_ratio + 1e-9 {
            true
        } else if (ratio - best_ratio).abs() <= 1e-9 {
            semitones.abs() < best_semitones.abs()
                || (semitones.abs() == best_semitones.abs()
                    && semitones >= 0
                    && best_semitones < 0)
        } else {
            false
        };
        if better {
            best_semitones = semitones;
            best_ratio = ratio;
            best_notes = candidate;
        }
    }

    AutoTranspose {
        semitones: best_semitones,
        white_ratio: best_ratio.max(0.0),
        notes: best_notes,
    }
}

/// Shannon entropy of inter-onset intervals over 50 ms bins
fn rhythm_entropy(intervals: &[f64]) -> f64 {
    let bins: Vec<i64> = intervals
        .iter()
        .filter(|&&dt| dt > 1e-4)
        .map(|&dt| ((dt / ENTROPY_BIN).round() as i64).max(1))
        .collect();
    if bins.is_empty() {
        return 0.0;
    }
    let counts = bins.iter().counts();
    let total = bins.len() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total;
            -p * (p + 1e-12).ln()
        })
        .sum()
}

/// Mode of the 20 ms-binned inter-onset histogram, as seconds
fn dominant_ioi_period(intervals: &[f64]) -> Option<f64> {
    let bins: Vec<i64> = intervals
        .iter()
        .filter(|&&dt| dt > 1e-3)
        .map(|&dt| ((dt / PERIOD_BIN).round() as i64).max(1))
        .collect();
    if bins.is_empty() {
        return None;
    }
    let counts = bins.iter().counts();
    counts
        .into_iter()
        // Deterministic mode: larger count wins, smaller bin breaks ties.
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(bin, _)| *bin as f64 * PERIOD_BIN)
}

/// Successive start-time gaps of a start-sorted slice
fn inter_onset_intervals(sorted: &[NoteEvent]) -> Vec<f64> {
    sorted
        .windows(2)
        .map(|pair| (pair[1].start_time - pair[0].start_time).max(0.0))
        .collect()
}

/// Score every channel by mid-register hits minus weighted rhythm entropy
fn channel_scores(notes: &[NoteEvent], entropy_weight: f64) -> HashMap<u8, f64> {
    let mut by_channel: HashMap<u8, Vec<&NoteEvent>> = HashMap::new();
    for note in notes {
        by_channel.entry(note.channel).or_default().push(note);
    }

    let mut scores = HashMap::new();
    for (channel, mut channel_notes) in by_channel {
        channel_notes.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        let focus_hits = channel_notes
            .iter()
            .filter(|note| (60..=84).contains(&note.note))
            .count();
        let intervals: Vec<f64> = channel_notes
            .windows(2)
            .map(|pair| (pair[1].start_time - pair[0].start_time).max(0.0))
            .collect();
        let entropy = rhythm_entropy(&intervals);
        scores.insert(channel, focus_hits as f64 - entropy_weight * entropy);
    }
    scores
}

/// Drop notes whose pitch repeats too much across the whole piece
///
/// Threshold scales with strength; when almost everything is dropped the
/// threshold relaxes once by x0.8, and as a last resort the head of the
/// input survives.
fn filter_by_repetition(notes: &[NoteEvent], strength: f64, penalty: f64) -> Vec<NoteEvent> {
    if notes.is_empty() {
        return Vec::new();
    }
    let counts = notes.iter().map(|note| note.note).counts();
    let total = notes.len() as f64;
    let threshold = 0.05 + 0.20 * strength.clamp(0.0, 1.0);

    let keep_with = |threshold: f64| -> Vec<NoteEvent> {
        notes
            .iter()
            .filter(|note| {
                let freq = counts[&note.note] as f64 / total;
                1.0 - penalty * freq > threshold
            })
            .cloned()
            .collect()
    };

    let kept = keep_with(threshold);
    if kept.len() >= REPETITION_MIN_KEEP {
        return kept;
    }
    let relaxed = keep_with(threshold * 0.8);
    if !relaxed.is_empty() {
        relaxed
    } else {
        notes[..notes.len().min(REPETITION_MIN_KEEP)].to_vec()
    }
}

/// Keep notes whose spacing stays close to the dominant inter-onset period
///
/// Tolerance shrinks with strength; when more than three quarters of the
/// notes fall away the tolerance relaxes once by x1.5.
fn filter_by_beat_similarity(notes: &[NoteEvent], strength: f64) -> Vec<NoteEvent> {
    if notes.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<NoteEvent> = notes.to_vec();
    sorted.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    let intervals = inter_onset_intervals(&sorted);
    let Some(period) = dominant_ioi_period(&intervals) else {
        return sorted;
    };
    let tolerance = 0.35 - 0.23 * strength.clamp(0.0, 1.0);

    let keep_with = |tolerance: f64| -> Vec<NoteEvent> {
        let mut kept = vec![sorted[0].clone()];
        for i in 1..sorted.len() {
            let dt = (sorted[i].start_time - sorted[i - 1].start_time).max(0.0);
            if (dt - period).abs() <= tolerance * period {
                kept.push(sorted[i].clone());
            }
        }
        kept
    };

    let kept = keep_with(tolerance);
    if kept.len() >= REPETITION_MIN_KEEP.max(sorted.len() / 4) {
        return kept;
    }
    let relaxed = keep_with(tolerance * 1.5);
    if relaxed.len() >= REPETITION_MIN_KEEP {
        relaxed
    } else {
        kept
    }
}

/// Collapse overlapping starts into one line and merge equal-pitch neighbors
fn enforce_monophony(
    notes: &[NoteEvent],
    window: f64,
    prefer: CollapsePreference,
) -> Vec<NoteEvent> {
    if notes.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<NoteEvent> = notes.to_vec();
    sorted.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then_with(|| b.note.cmp(&a.note))
    });

    let mut line: Vec<NoteEvent> = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let cluster_start = sorted[i].start_time;
        let mut j = i + 1;
        while j < sorted.len() && sorted[j].start_time - cluster_start <= window {
            j += 1;
        }
        let cluster = &sorted[i..j];
        let chosen = match prefer {
            CollapsePreference::Highest => cluster.iter().max_by_key(|note| note.note),
            CollapsePreference::Loudest => cluster.iter().max_by_key(|note| note.velocity),
            CollapsePreference::Longest => cluster
                .iter()
                .max_by(|a, b| a.duration().total_cmp(&b.duration())),
        };
        if let Some(chosen) = chosen {
            line.push(chosen.clone());
        }
        i = j;
    }

    let mut merged: Vec<NoteEvent> = Vec::with_capacity(line.len());
    for note in line {
        let joins_previous = merged
            .last()
            .is_some_and(|last| last.note == note.note && note.start_time - last.end_time <= window);
        if joins_previous {
            if let Some(last) = merged.last_mut() {
                last.end_time = last.end_time.max(note.end_time);
            }
        } else {
            merged.push(note);
        }
    }
    merged
}

/// Pull a single melody line out of a multi-channel note stream
pub fn extract_melody(notes: &[NoteEvent], options: &MelodyOptions) -> Vec<NoteEvent> {
    if notes.is_empty() {
        return Vec::new();
    }
    let scores = channel_scores(notes, options.entropy_weight);
    if scores.is_empty() {
        return Vec::new();
    }

    // Deterministic argmax: higher score wins, lower channel breaks ties.
    let best_channel = scores
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(channel, _)| *channel);

    let (chosen_channel, chosen): (u8, Vec<NoteEvent>) = match options.prefer_channel {
        Some(channel) => {
            let preferred: Vec<NoteEvent> = notes
                .iter()
                .filter(|note| note.channel == channel)
                .cloned()
                .collect();
            if preferred.is_empty() {
                let fallback = best_channel.unwrap_or(channel);
                (
                    fallback,
                    notes
                        .iter()
                        .filter(|note| note.channel == fallback)
                        .cloned()
                        .collect(),
                )
            } else {
                (channel, preferred)
            }
        }
        None => {
            let channel = best_channel.unwrap_or(0);
            (
                channel,
                notes
                    .iter()
                    .filter(|note| note.channel == channel)
                    .cloned()
                    .collect(),
            )
        }
    };

    if let Some(min_score) = options.min_score {
        let score = scores.get(&chosen_channel).copied().unwrap_or(f64::MIN);
        if score < min_score {
            debug!("melody rejected: channel {chosen_channel} scored {score:.2} < {min_score}");
            return Vec::new();
        }
    }

    let strength = options.strength.clamp(0.0, 1.0);
    let window = 0.06 + 0.04 * (1.0 - strength);
    match options.mode {
        MelodyMode::Beat => {
            let filtered = filter_by_beat_similarity(&chosen, strength);
            enforce_monophony(&filtered, window, options.prefer)
        }
        MelodyMode::Repetition => {
            let filtered = filter_by_repetition(&chosen, strength, options.repetition_penalty);
            enforce_monophony(&filtered, window, options.prefer)
        }
        MelodyMode::Hybrid => {
            let filtered = filter_by_repetition(&chosen, strength, options.repetition_penalty);
            let filtered = filter_by_beat_similarity(&filtered, strength);
            enforce_monophony(&filtered, window, options.prefer)
        }
        MelodyMode::Entropy => {
            if strength > 0.0 {
                let window = 0.08 + 0.05 * (1.0 - strength);
                enforce_monophony(&chosen, window, options.prefer)
            } else {
                chosen
            }
        }
    }
}

/// Rewrite black keys onto white ones according to the strategy
pub fn transpose_black_keys(notes: &[NoteEvent], strategy: BlackKeyStrategy) -> Vec<NoteEvent> {
    if matches!(strategy, BlackKeyStrategy::Off) {
        return notes.to_vec();
    }
    notes
        .iter()
        .map(|note| {
            let rewritten = rewrite_to_white(note.note, strategy);
            let mut moved = note.clone();
            moved.note = rewritten;
            moved.group = PitchGroup::for_note(rewritten);
            moved
        })
        .collect()
}

/// Move one pitch onto a white key
fn rewrite_to_white(note: u8, strategy: BlackKeyStrategy) -> u8 {
    let pc = (note % 12) as i32;
    if WHITE_PITCH_CLASSES.contains(&(pc as u8)) {
        return note;
    }
    let base = note as i32 - pc;
    match strategy {
        BlackKeyStrategy::Off => note,
        BlackKeyStrategy::Down => {
            for step in 1..7 {
                let candidate = (pc - step).rem_euclid(12);
                if WHITE_PITCH_CLASSES.contains(&(candidate as u8)) {
                    return (base + candidate).clamp(0, 127) as u8;
                }
            }
            note
        }
        BlackKeyStrategy::Nearest => {
            let mut best = pc;
            let mut best_distance = i32::MAX;
            for &white in &WHITE_PITCH_CLASSES {
                let white = white as i32;
                let distance = ((pc - white).rem_euclid(12)).min((white - pc).rem_euclid(12));
                // Scan order makes ties resolve downward.
                if distance < best_distance {
                    best_distance = distance;
                    best = white;
                }
            }
            (base + best).clamp(0, 127) as u8
        }
    }
}

/// Snap start times to the grid; end times stay untouched
pub fn quantize(notes: &[NoteEvent], grid_ms: u32) -> Vec<NoteEvent> {
    let grid = grid_ms.max(1) as f64 / 1000.0;
    notes
        .iter()
        .map(|note| {
            let mut snapped = note.clone();
            snapped.start_time = (note.start_time / grid).round() * grid;
            snapped.end_time = snapped.end_time.max(snapped.start_time);
            snapped
        })
        .collect()
}

/// Bucket key for microsecond-rounded start times
fn start_bucket(start_time: f64) -> i64 {
    (start_time * 1e6).round() as i64
}

/// Annotate notes that share a start time with their chord size
pub fn tag_chords(notes: &mut [NoteEvent]) {
    let mut buckets: HashMap<i64, usize> = HashMap::new();
    for note in notes.iter() {
        *buckets.entry(start_bucket(note.start_time)).or_insert(0) += 1;
    }
    for note in notes.iter_mut() {
        let size = buckets[&start_bucket(note.start_time)];
        note.chord_size = if size >= 2 { size } else { 1 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shorthand note on channel 0
    fn note(start: f64, end: f64, pitch: u8) -> NoteEvent {
        NoteEvent::new(start, end, pitch, 0, 80)
    }

    /// Shorthand note with channel and velocity
    fn channel_note(start: f64, pitch: u8, channel: u8, velocity: u8) -> NoteEvent {
        NoteEvent::new(start, start + 0.2, pitch, channel, velocity)
    }

    #[test]
    fn empty_group_selection_keeps_everything() {
        let notes = vec![note(0.0, 0.2, 30), note(0.2, 0.4, 60), note(0.4, 0.6, 100)];
        assert_eq!(filter_by_groups(notes.clone(), &[]).len(), 3);
        let only_mid = filter_by_groups(notes, &[PitchGroup::Mid]);
        assert_eq!(only_mid.len(), 1);
        assert_eq!(only_mid[0].note, 60);
    }

    #[test]
    fn transpose_clamps_and_updates_groups() {
        let moved = transpose(&[note(0.0, 0.1, 126)], 4);
        assert_eq!(moved[0].note, 127);
        assert_eq!(moved[0].group, PitchGroup::VeryHigh);
        let moved = transpose(&[note(0.0, 0.1, 2)], -5);
        assert_eq!(moved[0].note, 0);
    }

    #[test]
    fn auto_transpose_maximizes_white_ratio() {
        // 70 black notes (C#) and 30 white notes (D): shifting by -1 makes
        // the C#s white but the Ds black, shifting +1 turns C#->D white and
        // D->D# black. Both score 70%; the tie must go to the positive shift.
        let mut notes = Vec::new();
        for i in 0..70 {
            notes.push(note(i as f64 * 0.1, i as f64 * 0.1 + 0.05, 61));
        }
        for i in 0..30 {
            notes.push(note(7.0 + i as f64 * 0.1, 7.0 + i as f64 * 0.1 + 0.05, 62));
        }
        let chosen = auto_transpose(&notes);
        assert!(chosen.white_ratio >= 0.7);
        assert!(chosen.semitones >= 0, "tie breaks toward non-negative");
        let ratio_after = white_key_ratio(&chosen.notes);
        assert!((ratio_after - chosen.white_ratio).abs() < 1e-12);
    }

    #[test]
    fn auto_transpose_prefers_smaller_shift_on_ties() {
        // All white already: every candidate within -6..=6 that maps white
        // to white ties, and zero must win.
        let notes = vec![note(0.0, 0.1, 60), note(0.1, 0.2, 62)];
        let chosen = auto_transpose(&notes);
        assert_eq!(chosen.semitones, 0);
        assert_eq!(chosen.white_ratio, 1.0);
    }

    #[test]
    fn black_key_rewrite_down_and_nearest() {
        // C#4 (61): down -> C4 (60); nearest is a tie, resolved down.
        assert_eq!(rewrite_to_white(61, BlackKeyStrategy::Down), 60);
        assert_eq!(rewrite_to_white(61, BlackKeyStrategy::Nearest), 60);
        // F#4 (66): tie between F and G resolves down to F.
        assert_eq!(rewrite_to_white(66, BlackKeyStrategy::Nearest), 65);
        // White keys pass through.
        assert_eq!(rewrite_to_white(64, BlackKeyStrategy::Down), 64);

        let rewritten = transpose_black_keys(&[note(0.0, 0.1, 61)], BlackKeyStrategy::Down);
        assert_eq!(rewritten[0].group, PitchGroup::Mid);
    }

    #[test]
    fn quantize_snaps_starts_only_and_is_idempotent() {
        let notes = vec![note(0.044, 0.21, 60)];
        let snapped = quantize(&notes, 30);
        assert!((snapped[0].start_time - 0.03).abs() < 1e-9);
        assert!((snapped[0].end_time - 0.21).abs() < 1e-9);
        let twice = quantize(&snapped, 30);
        assert_eq!(snapped, twice);
    }

    #[test]
    fn chord_tagging_annotates_shared_starts() {
        let mut notes = vec![
            note(1.0, 1.4, 60),
            note(1.0, 1.4, 64),
            note(1.0, 1.4, 67),
            note(2.0, 2.2, 72),
        ];
        tag_chords(&mut notes);
        assert!(notes[0].is_chord() && notes[1].is_chord() && notes[2].is_chord());
        assert_eq!(notes[0].chord_size, 3);
        assert!(!notes[3].is_chord());
        assert_eq!(notes[3].chord_size, 1);
    }

    #[test]
    fn melody_chooses_the_mid_register_channel() {
        let mut notes = Vec::new();
        // Channel 2: a regular mid-register line.
        for i in 0..20 {
            notes.push(channel_note(i as f64 * 0.5, 64 + (i % 5) as u8, 2, 90));
        }
        // Channel 7: sparse rumble far below the focus register.
        for i in 0..6 {
            notes.push(channel_note(i as f64 * 1.3, 30, 7, 60));
        }
        let melody = extract_melody(&notes, &MelodyOptions::default());
        assert!(!melody.is_empty());
        assert!(melody.iter().all(|note| note.channel == 2));
    }

    #[test]
    fn melody_falls_back_when_preferred_channel_is_empty() {
        let notes = vec![
            channel_note(0.0, 70, 3, 90),
            channel_note(0.5, 72, 3, 90),
            channel_note(1.0, 74, 3, 90),
        ];
        let options = MelodyOptions {
            prefer_channel: Some(9),
            ..MelodyOptions::default()
        };
        let melody = extract_melody(&notes, &options);
        assert!(melody.iter().all(|note| note.channel == 3));
    }

    #[test]
    fn melody_min_score_rejects_weak_pieces() {
        let notes = vec![channel_note(0.0, 20, 0, 50)];
        let options = MelodyOptions {
            min_score: Some(5.0),
            ..MelodyOptions::default()
        };
        assert!(extract_melody(&notes, &options).is_empty());
    }

    #[test]
    fn monophony_keeps_the_highest_of_a_cluster() {
        let cluster = vec![
            note(1.0, 1.5, 60),
            note(1.02, 1.5, 72),
            note(1.03, 1.5, 64),
            note(2.0, 2.5, 62),
        ];
        let line = enforce_monophony(&cluster, 0.06, CollapsePreference::Highest);
        assert_eq!(line.len(), 2);
        assert_eq!(line[0].note, 72);
        assert_eq!(line[1].note, 62);
    }

    #[test]
    fn monophony_merges_adjacent_equal_pitches() {
        let split = vec![note(0.0, 0.5, 60), note(0.52, 1.0, 60), note(1.5, 2.0, 60)];
        let line = enforce_monophony(&split, 0.06, CollapsePreference::Highest);
        assert_eq!(line.len(), 2);
        assert!((line[0].end_time - 1.0).abs() < 1e-9, "gap within window merges");
    }

    #[test]
    fn beat_filter_drops_off_grid_notes() {
        let mut notes: Vec<NoteEvent> = (0..16)
            .map(|i| note(i as f64 * 0.5, i as f64 * 0.5 + 0.2, 60 + (i % 3) as u8))
            .collect();
        // Two stragglers squeezed between grid positions.
        notes.push(note(0.13, 0.2, 90));
        notes.push(note(3.61, 3.7, 91));
        let kept = filter_by_beat_similarity(&notes, 1.0);
        assert!(kept.iter().all(|note| note.note < 90 || note.start_time == 0.0));
        assert!(kept.len() >= 8);
    }

    #[test]
    fn repetition_filter_drops_the_dominant_pitch() {
        let mut notes = Vec::new();
        // Pitch 60 makes up 80% of the piece; everything else is rare.
        for i in 0..40 {
            notes.push(note(i as f64 * 0.2, i as f64 * 0.2 + 0.1, 60));
        }
        for i in 0..10 {
            notes.push(note(8.0 + i as f64 * 0.2, 8.0 + i as f64 * 0.2 + 0.1, 62 + i as u8));
        }
        let kept = filter_by_repetition(&notes, 1.0, 1.0);
        assert!(kept.iter().all(|note| note.note != 60));
        assert!(kept.len() >= REPETITION_MIN_KEEP);
    }

    #[test]
    fn full_pipeline_runs_all_stages() {
        let notes = vec![
            channel_note(0.011, 61, 0, 90),
            channel_note(0.012, 65, 0, 80),
            channel_note(0.61, 63, 0, 85),
            channel_note(1.19, 66, 0, 85),
        ];
        let options = AnalysisOptions {
            groups: vec![PitchGroup::Mid],
            transpose: TransposeMode::Auto,
            melody: None,
            black_keys: BlackKeyStrategy::Down,
            quantize_grid_ms: Some(30),
            tag_chords: true,
        };
        let report = analyze(notes, &options);
        assert_eq!(report.input_count, 4);
        assert!(!report.notes.is_empty());
        assert!(report.notes.iter().all(|note| is_white(note.note)));
        // Quantized starts sit on the 30 ms grid.
        for kept in &report.notes {
            let millis = kept.start_time * 1000.0;
            assert!((millis / 30.0 - (millis / 30.0).round()).abs() < 1e-6);
        }
    }
}
