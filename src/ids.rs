//! Connection-owned identifier generators.
//!
//! Call ids, stream ids and ping nonces are unsigned 32-bit counters that
//! wrap from `u32::MAX` back to their starting value. Ids only need to be
//! unique among the values that are live at a given instant.

/// Wrapping `u32` id generator.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    start: u32,
    next: u32,
}

impl IdGenerator {
    /// Generator that yields `start`, `start + 1`, ..., `u32::MAX`, `start`, ...
    pub const fn new(start: u32) -> Self {
        Self { start, next: start }
    }

    /// Generator positioned at `next`, wrapping back to `start`.
    pub fn resume(start: u32, next: u32) -> Self {
        Self {
            start,
            next: next.max(start),
        }
    }

    /// Next id, wrapping at `u32::MAX`.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = if id == u32::MAX { self.start } else { id + 1 };
        id
    }

    /// Next id for which `is_live` returns false.
    ///
    /// Returns `None` only when every value in the range is live.
    pub fn next_unused(&mut self, mut is_live: impl FnMut(u32) -> bool) -> Option<u32> {
        let span = u64::from(u32::MAX - self.start) + 1;
        for _ in 0..span {
            let id = self.next_id();
            if !is_live(id) {
                return Some(id);
            }
        }
        None
    }

    /// The id the next call will return.
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Rewind to the starting value.
    pub fn reset(&mut self) {
        self.next = self.start;
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
