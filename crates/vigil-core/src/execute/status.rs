//! Lifecycle of one child-process run.

use parking_lot::Mutex;

/// Where a run is in its lifecycle.
///
/// Variants are ordered; a run only ever moves forward and never leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RunStatus {
    #[default]
    None,
    Initializing,
    WaitingForExit,
    Finalizing,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

/// Shared, forward-only [`RunStatus`].
#[derive(Debug, Default)]
pub(crate) struct StatusCell(Mutex<RunStatus>);

impl StatusCell {
    pub(crate) fn get(&self) -> RunStatus {
        *self.0.lock()
    }

    /// Move to `next` if that is a step forward. Returns whether it moved.
    pub(crate) fn advance(&self, next: RunStatus) -> bool {
        let mut current = self.0.lock();
        if current.is_terminal() || next <= *current {
            tracing::debug!("Ignoring status change {:?} -> {:?}", *current, next);
            return false;
        }
        *current = next;
        true
    }
}
