/// A state transition applied before its confirming network call resolves.
///
/// The call site shows `applied` immediately, holds on to this value while
/// the call is in flight, then consumes it: `commit` keeps the new state,
/// `revert` hands back the old one. Carrying both values explicitly avoids
/// closures over shared mutable state deciding what "undo" means later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange<T> {
    previous: T,
    applied: T,
}

impl<T> PendingChange<T> {
    pub fn new(previous: T, applied: T) -> Self {
        PendingChange { previous, applied }
    }

    /// The optimistically visible value.
    pub fn applied(&self) -> &T {
        &self.applied
    }

    /// The value to restore on failure.
    pub fn previous(&self) -> &T {
        &self.previous
    }

    /// The confirming call succeeded; keep the new state.
    pub fn commit(self) -> T {
        self.applied
    }

    /// The confirming call failed; restore the prior state.
    pub fn revert(self) -> T {
        self.previous
    }
}
