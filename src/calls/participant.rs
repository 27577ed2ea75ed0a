//! Participant records and the closed transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::audio::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallerState {
    /// Waiting in the lobby, muted.
    Queued,
    /// In a private room with a screener.
    Screening,
    /// Approved, parked in the on-air room, muted.
    Hold,
    /// Live in the broadcast mix.
    OnAir,
    /// Finished normally. Terminal.
    Completed,
    /// Declined by the screener. Terminal.
    Rejected,
}

impl CallerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallerState::Completed | CallerState::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallerState::Queued => "queued",
            CallerState::Screening => "screening",
            CallerState::Hold => "hold",
            CallerState::OnAir => "on-air",
            CallerState::Completed => "completed",
            CallerState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CallerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal lifecycle edge.
///
/// The ladder is monotonic except the reversible `hold⇄on-air` and
/// `screening⇄hold` edges; terminal states absorb everything. Any
/// non-terminal state may move to a terminal one.
pub fn transition_allowed(from: CallerState, to: CallerState) -> bool {
    use CallerState::*;

    if from.is_terminal() {
        return false;
    }
    if to.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Queued, Screening) | (Screening, Hold) | (Hold, Screening) | (Hold, OnAir) | (OnAir, Hold)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub state: CallerState,
    pub at: DateTime<Utc>,
}

/// A caller/guest tracked by the lifecycle state machine. Mutated only by
/// the state machine under its per-participant lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    /// Phone/network identifier (caller number, SIP URI, or manual entry).
    pub caller_ref: String,
    pub episode_id: String,
    pub state: CallerState,
    pub room: Option<String>,
    pub muted: bool,
    /// Screener identity while in (or returning to) screening.
    pub screener: Option<String>,
    /// Screener notes attached on approval (topic, name, anything the host
    /// should see before taking the call).
    pub approval_notes: Option<String>,
    /// Mixer sources this participant owns, detached on teardown.
    pub sources: Vec<SourceId>,
    pub history: Vec<StateChange>,
}

impl Participant {
    pub fn new(caller_ref: impl Into<String>, episode_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            caller_ref: caller_ref.into(),
            episode_id: episode_id.into(),
            state: CallerState::Queued,
            room: None,
            muted: true,
            screener: None,
            approval_notes: None,
            sources: Vec::new(),
            history: vec![StateChange {
                state: CallerState::Queued,
                at: now,
            }],
        }
    }

    /// Fabric identity of this participant's bridged leg.
    pub fn identity(&self) -> String {
        format!("caller-{}", self.id)
    }

    pub fn set_state(&mut self, state: CallerState) {
        self.state = state;
        self.history.push(StateChange {
            state,
            at: Utc::now(),
        });
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallerState::*;

    #[test]
    fn test_forward_ladder_allowed() {
        assert!(transition_allowed(Queued, Screening));
        assert!(transition_allowed(Screening, Hold));
        assert!(transition_allowed(Hold, OnAir));
    }

    #[test]
    fn test_reversible_edges() {
        assert!(transition_allowed(OnAir, Hold));
        assert!(transition_allowed(Hold, Screening));
    }

    #[test]
    fn test_skipping_states_rejected() {
        assert!(!transition_allowed(Queued, Hold));
        assert!(!transition_allowed(Queued, OnAir));
        assert!(!transition_allowed(Screening, OnAir));
        assert!(!transition_allowed(OnAir, Screening));
        assert!(!transition_allowed(Screening, Queued));
    }

    #[test]
    fn test_any_nonterminal_can_terminate() {
        for from in [Queued, Screening, Hold, OnAir] {
            assert!(transition_allowed(from, Completed));
            assert!(transition_allowed(from, Rejected));
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        for to in [Queued, Screening, Hold, OnAir, Completed, Rejected] {
            assert!(!transition_allowed(Completed, to));
            assert!(!transition_allowed(Rejected, to));
        }
    }

    #[test]
    fn test_new_participant_shape() {
        let p = Participant::new("+15550001", "ep-1");
        assert_eq!(p.state, Queued);
        assert!(p.muted);
        assert_eq!(p.history.len(), 1);
        assert!(p.identity().starts_with("caller-"));
    }
}
