//! Interpreter states for the transactional editor.

use serde::{Deserialize, Serialize};

/// States the configuration interpreter moves through while editing,
/// committing, aborting and rolling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterpState {
    /// Not yet initialized.
    Unknown,
    /// Loading a saved configuration at startup.
    Preload,
    /// Every operation commits immediately; the default.
    AutoCommit,
    /// Operations apply to a shadow only; nothing reaches the core.
    Dryrun,
    /// Operations accumulate in `modified` until commit or abort.
    Atomic,
    /// Commit in progress.
    Commiting,
    /// Commit finished.
    Commited,
    /// Commit failed; `modified` still holds the attempt.
    CommitFailure,
    /// Abort in progress.
    Aborting,
    /// Abort finished.
    Aborted,
    /// Rollback in progress.
    Rollbacking,
    /// Rollback finished.
    Rollbacked,
    /// Interpreter shutting down.
    Shutdown,
    /// Interpreter being destroyed.
    Destroying,
}

impl InterpState {
    /// True in the states where edits accumulate without touching the
    /// live core.
    pub fn is_deferred(&self) -> bool {
        matches!(self, InterpState::Atomic | InterpState::Dryrun)
    }
}
