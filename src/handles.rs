//! Short-lived integer references into transient engine state.

use std::collections::HashMap;

/// Arena-style registry of protocol handles.
///
/// Handles are opaque positive integers, unique within a session, each mapped
/// to exactly one payload. A handle stays resolvable until the next
/// [`HandleRegistry::reset`]: the table is cleared wholesale on every resume
/// because the frames and values it referenced may no longer exist. Handle
/// `0` is reserved to mean "no children" and is never allocated.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    next: i64,
    entries: HashMap<i64, T>,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        HandleRegistry {
            next: 0,
            entries: HashMap::new(),
        }
    }

    /// Allocates a fresh handle for `payload`.
    pub fn create(&mut self, payload: T) -> i64 {
        self.next += 1;
        self.entries.insert(self.next, payload);
        self.next
    }

    /// Pure lookup, no side effects.
    pub fn get(&self, handle: i64) -> Option<&T> {
        self.entries.get(&handle)
    }

    /// Invalidates every previously issued handle and restarts numbering.
    pub fn reset(&mut self) {
        self.next = 0;
        self.entries.clear();
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
