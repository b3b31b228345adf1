//! MIDI auto-performer engine
//!
//! pianola turns standard MIDI files into live-looking performances on a
//! virtual instrument: it parses the file into absolute-time notes, runs the
//! stream through musically-aware filters, maps pitches onto a 21-key layout
//! and dispatches synthetic keyboard events with tight timing, so that a game
//! listening to the system keyboard hears a player, not a file.
//!
//! The engine consists of four cooperating groups of modules:
//!
//! * Parsing and analysis: [midi] builds the tempo-segmented note stream,
//!   [analysis] filters and reshapes it, [partition] splits it into routable
//!   sections
//! * Key routing: [keymap] maps pitches to key symbols with a deterministic
//!   fallback cascade, [keyboard] owns the reference-counted OS dispatch
//! * Scheduling: [player] ripens batches on a dedicated worker thread with
//!   hybrid sleep/spin waits, chord detection and retriggering
//! * Timing: [clock] couples monotonic time to SNTP, [timing] keeps
//!   scheduled performance starts honest while the network drifts
//!
//! [service] wires everything together behind one narrow surface; [engine]
//! puts a command/event channel in front of it for UI embedders; [config],
//! [export] and [score] carry the persisted options and the export formats
//! around the core.

pub mod analysis;
pub mod clock;
pub mod config;
pub mod engine;
pub mod export;
pub mod keyboard;
pub mod keymap;
pub mod midi;
pub mod note;
pub mod partition;
pub mod player;
pub mod score;
pub mod service;
pub mod timing;
pub mod version;

pub use note::{DispatchEvent, EventKind, NoteEvent, PitchGroup, Role};
pub use player::AutoPlayer;
pub use service::PlaybackService;
