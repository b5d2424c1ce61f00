//! Failover operation record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::FailoverResult;
use super::state::{FailoverStatus, FailoverType};
use crate::store::Entity;

/// Result of one named pre-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl PreCheck {
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
        }
    }
}

/// One line of the append-only step log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Side-effecting stages of execution, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStep {
    TerminateConnections,
    Promote,
    UpdateRegistry,
    Validate,
    Finalize,
}

impl ExecutionStep {
    pub const ALL: [ExecutionStep; 5] = [
        ExecutionStep::TerminateConnections,
        ExecutionStep::Promote,
        ExecutionStep::UpdateRegistry,
        ExecutionStep::Validate,
        ExecutionStep::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStep::TerminateConnections => "TERMINATE_CONNECTIONS",
            ExecutionStep::Promote => "PROMOTE",
            ExecutionStep::UpdateRegistry => "UPDATE_REGISTRY",
            ExecutionStep::Validate => "VALIDATE",
            ExecutionStep::Finalize => "FINALIZE",
        }
    }
}

impl fmt::Display for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single failover attempt.
///
/// Identity fields never change after creation. The record doubles as the
/// durable job: `current_step` is saved before each side effect and the step
/// moves to `completed_steps` once it returns, so an interrupted run resumes
/// at the first incomplete step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverOperation {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    #[serde(rename = "type")]
    pub failover_type: FailoverType,
    pub status: FailoverStatus,
    pub reason: Option<String>,
    pub pre_checks: Vec<PreCheck>,
    pub steps: Vec<StepEntry>,
    pub initiated_by: String,
    #[serde(default)]
    pub current_step: Option<ExecutionStep>,
    #[serde(default)]
    pub completed_steps: Vec<ExecutionStep>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl FailoverOperation {
    pub fn new(
        cluster_id: Uuid,
        source_node_id: Uuid,
        target_node_id: Uuid,
        failover_type: FailoverType,
        reason: Option<String>,
        initiated_by: impl Into<String>,
        pre_checks: Vec<PreCheck>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            source_node_id,
            target_node_id,
            failover_type,
            status: FailoverStatus::Pending,
            reason,
            pre_checks,
            steps: Vec::new(),
            initiated_by: initiated_by.into(),
            current_step: None,
            completed_steps: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            rolled_back_at: None,
        }
    }

    /// Append a line to the step log.
    pub fn log(&mut self, message: impl Into<String>) {
        self.steps.push(StepEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    /// Apply a status transition.
    pub fn transition(&mut self, next: FailoverStatus) -> FailoverResult<()> {
        self.status = self.status.transition(next)?;
        Ok(())
    }

    pub fn failed_checks(&self) -> Vec<&PreCheck> {
        self.pre_checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn is_step_done(&self, step: ExecutionStep) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Whether this operation names `node_id` as source or target.
    pub fn references(&self, node_id: Uuid) -> bool {
        self.source_node_id == node_id || self.target_node_id == node_id
    }
}

impl Entity for FailoverOperation {
    const KIND: &'static str = "failovers";

    fn key(&self) -> String {
        self.id.to_string()
    }
}
