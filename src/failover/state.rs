//! Failover State Machine
//!
//! ```text
//! PENDING -> PRE_CHECK -> IN_PROGRESS -> VALIDATING -> COMPLETED
//!    |           |            |              |             |
//!    +-----------+------------+--------------+--> FAILED   |
//!                                                 |        |
//!                                                 +--------+--> ROLLED_BACK
//! ```
//!
//! COMPLETED, FAILED and ROLLED_BACK are terminal; the first two still allow
//! a rollback. Transitions are explicit; nothing is inferred from time.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{FailoverError, FailoverResult};

/// Planned switchover or emergency failover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverType {
    #[default]
    Planned,
    Unplanned,
}

/// Status of a failover operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverStatus {
    /// Created, checks recorded, waiting for an operator.
    Pending,
    /// Execution accepted and queued.
    PreCheck,
    /// Side effects against Postgres are running.
    InProgress,
    /// Confirming the target accepts writes.
    Validating,
    Completed,
    Failed,
    RolledBack,
}

impl FailoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverStatus::Pending => "PENDING",
            FailoverStatus::PreCheck => "PRE_CHECK",
            FailoverStatus::InProgress => "IN_PROGRESS",
            FailoverStatus::Validating => "VALIDATING",
            FailoverStatus::Completed => "COMPLETED",
            FailoverStatus::Failed => "FAILED",
            FailoverStatus::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailoverStatus::Completed | FailoverStatus::Failed | FailoverStatus::RolledBack
        )
    }

    /// Execution was accepted but has not reached a terminal status.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            FailoverStatus::PreCheck | FailoverStatus::InProgress | FailoverStatus::Validating
        )
    }

    pub fn can_transition_to(&self, next: FailoverStatus) -> bool {
        use FailoverStatus::*;
        matches!(
            (self, next),
            (Pending, PreCheck)
                | (Pending, Failed)
                | (PreCheck, InProgress)
                | (PreCheck, Failed)
                | (InProgress, Validating)
                | (InProgress, Failed)
                | (Validating, Completed)
                | (Validating, Failed)
                | (Completed, RolledBack)
                | (Failed, RolledBack)
        )
    }

    /// Move to `next` if the edge exists.
    pub fn transition(self, next: FailoverStatus) -> FailoverResult<FailoverStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(FailoverError::ForbiddenTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for FailoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
