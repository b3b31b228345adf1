//! Partitioner - split a note stream into routable sections
//!
//! Sections are the unit of ensemble routing: one per (track, channel,
//! program, instrument name) bucket, each with a synthesized stable name so
//! UIs and exports can refer to them across runs. Role inference is opt-in
//! and purely heuristic; an explicit role on a section's metadata always
//! wins over the heuristics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::note::{NoteEvent, Role};

/// Metadata carried by every section
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SectionMeta {
    /// Source track index
    pub track: usize,

    /// Source channel
    pub channel: u8,

    /// Program shared by the bucket, when one was seen
    pub program: Option<u8>,

    /// Instrument or track name, empty when the file had none
    pub instrument_name: String,

    /// Number of notes in the section
    pub count: usize,

    /// Which strategy produced the section
    pub hint: String,

    /// Explicit role; overrides inference everywhere
    #[serde(default)]
    pub role: Option<Role>,
}

/// A named slice of the piece, immutable once produced
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PartSection {
    /// Stable synthesized name, e.g. `track1_ch0_prog33_Bass`
    pub name: String,

    /// The notes of the bucket, in input order
    pub notes: Vec<NoteEvent>,

    /// Statistics and routing hints
    pub meta: SectionMeta,
}

/// Heuristic role of a single note, first match wins
pub fn infer_role(note: &NoteEvent) -> Role {
    let name = note
        .instrument_name
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    if note.channel == 9 {
        Role::Drums
    } else if matches!(note.program, Some(32..=39)) || name.contains("bass") {
        Role::Bass
    } else if note.note < 48 {
        Role::Bass
    } else {
        Role::Melody
    }
}

/// Effective role of one event inside a section
///
/// Priority: the event's own role, then a per-section override, then the
/// section's explicit meta role, then the heuristics.
pub fn resolve_role(
    note: &NoteEvent,
    meta: &SectionMeta,
    override_role: Option<Role>,
) -> Role {
    note.role
        .or(override_role)
        .or(meta.role)
        .unwrap_or_else(|| infer_role(note))
}

/// Splits by (track, channel, program, instrument name)
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackChannelPartitioner {
    /// Stamp inferred roles onto sections and their events
    pub infer_roles: bool,
}

impl TrackChannelPartitioner {
    /// Partitioner without role inference
    pub fn new() -> Self {
        Self::default()
    }

    /// Partitioner that also stamps inferred roles
    pub fn with_role_inference() -> Self {
        Self { infer_roles: true }
    }

    /// Group notes into named sections
    pub fn split(&self, notes: &[NoteEvent]) -> BTreeMap<String, PartSection> {
        let mut buckets: BTreeMap<(usize, u8, Option<u8>, String), Vec<NoteEvent>> =
            BTreeMap::new();
        for note in notes {
            let key = (
                note.track,
                note.channel,
                note.program,
                note.instrument_name.clone().unwrap_or_default(),
            );
            buckets.entry(key).or_default().push(note.clone());
        }

        let mut parts = BTreeMap::new();
        for ((track, channel, program, name), mut bucket_notes) in buckets {
            let mut part_name = format!(
                "track{track}_ch{channel}_prog{}",
                program.map_or_else(|| "NA".to_string(), |p| p.to_string())
            );
            if !name.is_empty() {
                part_name.push('_');
                part_name.push_str(&name);
            }

            let mut role = None;
            if self.infer_roles {
                role = Some(majority_role(&bucket_notes));
                for note in &mut bucket_notes {
                    if note.role.is_none() {
                        note.role = Some(infer_role(note));
                    }
                }
            }

            let meta = SectionMeta {
                track,
                channel,
                program,
                instrument_name: name,
                count: bucket_notes.len(),
                hint: "track_channel".to_string(),
                role,
            };
            parts.insert(
                part_name.clone(),
                PartSection {
                    name: part_name,
                    notes: bucket_notes,
                    meta,
                },
            );
        }
        debug!("partitioned into {} sections", parts.len());
        parts
    }
}

/// Most common inferred role of a bucket; melody on empty input
fn majority_role(notes: &[NoteEvent]) -> Role {
    let mut counts: BTreeMap<&'static str, (usize, Role)> = BTreeMap::new();
    for note in notes {
        let role = infer_role(note);
        let entry = counts.entry(role.as_str()).or_insert((0, role));
        entry.0 += 1;
    }
    counts
        .into_values()
        .max_by_key(|(count, _)| *count)
        .map(|(_, role)| role)
        .unwrap_or(Role::Melody)
}
