use thiserror::Error;
use uuid::Uuid;

use super::participant::CallerState;

/// Guard violations and synchronous failures of lifecycle operations.
///
/// Transient transport faults never appear here; those are recovered
/// locally by the bridge and the reconciliation sweep.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition: cannot {action} a participant in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: CallerState,
    },

    #[error("screener {screener} is already screening an active call")]
    AlreadyScreening { screener: String },

    #[error("unknown participant {id}")]
    UnknownParticipant { id: Uuid },

    #[error("no live episode available for caller {caller_ref} within the admission window")]
    NoLiveEpisode { caller_ref: String },

    #[error("resource busy: {reason}")]
    ResourceBusy { reason: String },
}
