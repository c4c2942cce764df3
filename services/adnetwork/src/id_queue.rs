use crate::identifier::Identifier;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Unbounded FIFO buffer of identifiers waiting for an auction.
///
/// Any number of callers may enqueue concurrently. `drain_all` swaps the whole
/// buffer out under the lock, so an enqueue racing with a drain lands either in
/// the drained batch or in the next one, never both.
#[derive(Debug, Default)]
pub struct IdentifierQueue {
    ids: Mutex<VecDeque<Identifier>>,
}

impl IdentifierQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an identifier to the tail
    pub fn enqueue(&self, id: Identifier) {
        self.ids.lock().push_back(id);
    }

    /// Remove and return every queued identifier in arrival order
    pub fn drain_all(&self) -> Vec<Identifier> {
        let drained = std::mem::take(&mut *self.ids.lock());
        drained.into()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}
