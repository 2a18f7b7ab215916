use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a call attempt.
///
/// Transitions: `pending -> accepted | rejected`, `pending | accepted -> ended`.
/// `rejected` and `ended` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Accepted,
    Rejected,
    Ended,
}

impl CallStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Rejected | CallStatus::Ended)
    }

    /// A call is active while it still occupies both participants.
    pub fn is_active(self) -> bool {
        matches!(self, CallStatus::Pending | CallStatus::Accepted)
    }
}

/// Errors from call state transitions and registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call not found")]
    NotFound,
    #[error("only the call recipient may accept or reject")]
    Forbidden,
    #[error("call is already in a terminal state")]
    Terminal,
    #[error("user is busy with another call")]
    Busy,
}

/// One call attempt between two users. Created on `call-start`, mutated by
/// the coordinator on accept/reject/end, retained as history once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub from_id: String,
    pub to_id: String,
    pub status: CallStatus,
    /// Unix epoch milliseconds.
    pub started_at: u64,
    /// Set exactly when the status becomes terminal.
    pub ended_at: Option<u64>,
}

impl CallRecord {
    pub fn new(from_id: &str, to_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            status: CallStatus::Pending,
            started_at: now_ms(),
            ended_at: None,
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.from_id == user_id || self.to_id == user_id
    }

    /// The other participant, from `user_id`'s point of view.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.from_id == user_id {
            &self.to_id
        } else {
            &self.from_id
        }
    }

    /// Validate and apply a status transition requested by `actor`.
    ///
    /// Accept/reject are recipient-only. Ending requires being a participant;
    /// the disconnect cascade passes the disconnecting user as the actor.
    /// Terminal records never move.
    pub fn transition(&mut self, to: CallStatus, actor: &str) -> Result<(), CallError> {
        if self.status.is_terminal() {
            return Err(CallError::Terminal);
        }
        match to {
            CallStatus::Accepted | CallStatus::Rejected => {
                if self.status != CallStatus::Pending {
                    return Err(CallError::Terminal);
                }
                if self.to_id != actor {
                    return Err(CallError::Forbidden);
                }
            }
            CallStatus::Ended => {
                if !self.involves(actor) {
                    return Err(CallError::Forbidden);
                }
            }
            CallStatus::Pending => return Err(CallError::Forbidden),
        }

        self.status = to;
        if to.is_terminal() {
            self.ended_at = Some(now_ms());
        }
        Ok(())
    }
}

/// Current time as Unix epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
