//! Key dispatcher - reference-counted synthetic key events
//!
//! The OS keyboard is a shared singleton, and several notes routinely map to
//! the same physical key. [KeyDispatcher] therefore keeps one reference count
//! per key symbol and only lets the 0->1 transition emit a real key-down and
//! the 1->0 transition a real key-up. Everything in between is bookkeeping.
//!
//! Actual injection is a capability behind [KeyBackend], so the engine runs
//! headless with the logging backend and only touches the OS input layer
//! when the `synthetic-input` feature provides the enigo-based backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Failure inside a key backend; never fatal to a performance
#[derive(Debug, thiserror::Error)]
#[error("key backend failure: {0}")]
pub struct BackendError(
    /// Human-readable cause reported by the backend
    pub String,
);

/// Capability interface to the OS input layer
pub trait KeyBackend: Send + Sync {
    /// Emit a real key-down for the key symbol
    fn key_down(&self, key: &str) -> Result<(), BackendError>;

    /// Emit a real key-up for the key symbol
    fn key_up(&self, key: &str) -> Result<(), BackendError>;
}

/// Backend that only logs; the default in headless builds
#[derive(Default, Clone, Copy)]
pub struct LogBackend;

impl KeyBackend for LogBackend {
    fn key_down(&self, key: &str) -> Result<(), BackendError> {
        debug!("key down {key}");
        Ok(())
    }

    fn key_up(&self, key: &str) -> Result<(), BackendError> {
        debug!("key up   {key}");
        Ok(())
    }
}

/// Real OS injection through enigo
#[cfg(feature = "synthetic-input")]
pub struct EnigoBackend {
    /// Exclusive access to the enigo session
    inner: Mutex<enigo::Enigo>,
}

#[cfg(feature = "synthetic-input")]
impl EnigoBackend {
    /// Open an injection session with the platform defaults
    pub fn new() -> Result<Self, BackendError> {
        let enigo = enigo::Enigo::new(&enigo::Settings::default())
            .map_err(|error| BackendError(error.to_string()))?;
        Ok(Self {
            inner: Mutex::new(enigo),
        })
    }

    /// Translate a key symbol into an enigo key
    fn translate(key: &str) -> Option<enigo::Key> {
        match key {
            "space" => Some(enigo::Key::Space),
            "shift" => Some(enigo::Key::Shift),
            "ctrl" => Some(enigo::Key::Control),
            "alt" => Some(enigo::Key::Alt),
            other => other.chars().next().map(enigo::Key::Unicode),
        }
    }

    /// Press or release one key through the session
    fn emit(&self, key: &str, direction: enigo::Direction) -> Result<(), BackendError> {
        use enigo::Keyboard;
        let Some(translated) = Self::translate(key) else {
            return Err(BackendError(format!("untranslatable key {key:?}")));
        };
        self.inner
            .lock()
            .unwrap()
            .key(translated, direction)
            .map_err(|error| BackendError(error.to_string()))
    }
}

#[cfg(feature = "synthetic-input")]
impl KeyBackend for EnigoBackend {
    fn key_down(&self, key: &str) -> Result<(), BackendError> {
        self.emit(key, enigo::Direction::Press)
    }

    fn key_up(&self, key: &str) -> Result<(), BackendError> {
        self.emit(key, enigo::Direction::Release)
    }
}

/// Reference-counted front of the OS keyboard
///
/// Requests for empty key symbols are dropped silently; releasing an unheld
/// key is a no-op; backend failures are logged and swallowed so a transient
/// OS hiccup never aborts a performance.
pub struct KeyDispatcher {
    /// Injection capability
    backend: Arc<dyn KeyBackend>,

    /// Active reference count per key symbol
    counts: Mutex<HashMap<String, u32>>,
}

impl KeyDispatcher {
    /// Dispatcher over the given backend
    pub fn new(backend: Arc<dyn KeyBackend>) -> Self {
        Self {
            backend,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Increment counts; emit a key-down only on 0->1 transitions
    pub fn press<S: AsRef<str>>(&self, keys: &[S]) {
        for key in keys {
            let key = key.as_ref();
            if key.is_empty() {
                continue;
            }
            let became_held = {
                let mut counts = self.counts.lock().unwrap();
                let count = counts.entry(key.to_string()).or_insert(0);
                *count += 1;
                *count == 1
            };
            if became_held {
                if let Err(error) = self.backend.key_down(key) {
                    warn!("key down failed for {key:?}: {error}");
                }
            }
        }
    }

    /// Decrement counts; emit a key-up only on 1->0 transitions
    pub fn release<S: AsRef<str>>(&self, keys: &[S]) {
        for key in keys {
            let key = key.as_ref();
            if key.is_empty() {
                continue;
            }
            let became_free = {
                let mut counts = self.counts.lock().unwrap();
                match counts.get_mut(key) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        *count == 0
                    }
                    _ => false,
                }
            };
            if became_free {
                if let Err(error) = self.backend.key_up(key) {
                    warn!("key up failed for {key:?}: {error}");
                }
            }
        }
    }

    /// Drive every count to zero, emitting the corresponding key-ups
    pub fn release_all(&self) {
        let held: Vec<String> = {
            let mut counts = self.counts.lock().unwrap();
            let held = counts
                .iter()
                .filter(|(_, &count)| count > 0)
                .map(|(key, _)| key.clone())
                .collect();
            counts.clear();
            held
        };
        for key in &held {
            if let Err(error) = self.backend.key_up(key) {
                warn!("key up failed for {key:?}: {error}");
            }
        }
    }

    /// Current reference count of one key
    pub fn active_count(&self, key: &str) -> u32 {
        self.counts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Keys currently held (count > 0), unordered
    pub fn held_keys(&self) -> Vec<String> {
        self.counts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// One key event captured by [CaptureBackend]
#[cfg(test)]
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedKey {
    /// Monotonic seconds when the event reached the backend
    pub at: f64,

    /// Key symbol
    pub key: String,

    /// `true` for key-down
    pub down: bool,
}

/// Recording backend used by the scheduler and dispatcher tests
#[cfg(test)]
#[derive(Default)]
pub struct CaptureBackend {
    /// Everything that reached the backend, in order
    events: Mutex<Vec<CapturedKey>>,
}

#[cfg(test)]
impl CaptureBackend {
    /// Copy of the capture log
    pub fn snapshot(&self) -> Vec<CapturedKey> {
        self.events.lock().unwrap().clone()
    }

    /// Down/up events for one key, in order
    pub fn for_key(&self, key: &str) -> Vec<CapturedKey> {
        self.snapshot()
            .into_iter()
            .filter(|event| event.key == key)
            .collect()
    }
}

#[cfg(test)]
impl KeyBackend for CaptureBackend {
    fn key_down(&self, key: &str) -> Result<(), BackendError> {
        self.events.lock().unwrap().push(CapturedKey {
            at: crate::clock::monotonic(),
            key: key.to_string(),
            down: true,
        });
        Ok(())
    }

    fn key_up(&self, key: &str) -> Result<(), BackendError> {
        self.events.lock().unwrap().push(CapturedKey {
            at: crate::clock::monotonic(),
            key: key.to_string(),
            down: false,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (Arc<CaptureBackend>, KeyDispatcher) {
        let backend = Arc::new(CaptureBackend::default());
        let dispatcher = KeyDispatcher::new(backend.clone());
        (backend, dispatcher)
    }

    #[test]
    fn only_zero_to_one_transitions_reach_the_backend() {
        let (backend, dispatcher) = dispatcher();
        dispatcher.press(&["q", "q", "q"]);
        assert_eq!(dispatcher.active_count("q"), 3);
        assert_eq!(backend.for_key("q").len(), 1);

        dispatcher.release(&["q"]);
        dispatcher.release(&["q"]);
        assert_eq!(backend.for_key("q").len(), 1, "key still held");
        dispatcher.release(&["q"]);
        let events = backend.for_key("q");
        assert_eq!(events.len(), 2);
        assert!(events[0].down && !events[1].down);
    }

    #[test]
    fn releasing_an_unheld_key_is_a_no_op() {
        let (backend, dispatcher) = dispatcher();
        dispatcher.release(&["w"]);
        assert!(backend.snapshot().is_empty());
        assert_eq!(dispatcher.active_count("w"), 0);
    }

    #[test]
    fn empty_key_symbols_are_dropped() {
        let (backend, dispatcher) = dispatcher();
        dispatcher.press(&["", "e"]);
        dispatcher.release(&["", "e"]);
        let keys: Vec<_> = backend.snapshot().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, ["e", "e"]);
    }

    #[test]
    fn release_all_is_idempotent() {
        let (backend, dispatcher) = dispatcher();
        dispatcher.press(&["q", "w", "q"]);
        dispatcher.release_all();
        let ups = backend
            .snapshot()
            .iter()
            .filter(|event| !event.down)
            .count();
        assert_eq!(ups, 2);
        dispatcher.release_all();
        let ups_after = backend
            .snapshot()
            .iter()
            .filter(|event| !event.down)
            .count();
        assert_eq!(ups_after, 2, "second release_all adds nothing");
        assert!(dispatcher.held_keys().is_empty());
    }

    #[test]
    fn key_down_count_equals_zero_to_one_transitions() {
        let (backend, dispatcher) = dispatcher();
        // Interleave a stream with overlap on one key.
        dispatcher.press(&["q"]);
        dispatcher.press(&["q"]);
        dispatcher.release(&["q"]);
        dispatcher.release(&["q"]);
        dispatcher.press(&["q"]);
        dispatcher.release(&["q"]);
        let downs = backend.for_key("q").iter().filter(|e| e.down).count();
        // Transitions 0->1 happened exactly twice.
        assert_eq!(downs, 2);
        assert_eq!(dispatcher.active_count("q"), 0);
    }
}
