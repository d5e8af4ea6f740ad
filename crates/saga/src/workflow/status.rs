//! Workflow and step status enumerations
//!
//! Both enumerations are closed sets: parsing an unrecognized value is an
//! error, never "unknown but fine".

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when parsing an unrecognized status value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized {kind} status: {value}")]
pub struct StatusParseError {
    /// Which enumeration was being parsed ("workflow" or "step")
    pub kind: &'static str,

    /// The offending value
    pub value: String,
}

/// Workflow status
///
/// Lifecycle: `Pending → Running → {Completed | Failed} → RollingBack →
/// {RolledBack | Compensated | CompensationFailed}`, with `Cancelled`
/// reachable for workflows cancelled before any step ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow created but not started
    Pending,

    /// Forward execution in progress
    Running,

    /// All steps completed successfully
    Completed,

    /// A required step failed and there was nothing to compensate
    Failed,

    /// Cancelled before any step executed
    Cancelled,

    /// Compensation phase in progress
    RollingBack,

    /// Cancellation-triggered compensation finished, all undos succeeded
    RolledBack,

    /// Failure-triggered compensation finished, all undos succeeded
    Compensated,

    /// At least one compensation failed; requires operator intervention
    CompensationFailed,
}

impl WorkflowStatus {
    /// Whether no further automatic transition occurs from this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::RolledBack
                | Self::Compensated
                | Self::CompensationFailed
        )
    }

    /// Whether a whole-workflow retry may start from this status
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack | Self::Compensated)
    }

    /// The wire representation (matches the serde encoding)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "rolling_back" => Ok(Self::RollingBack),
            "rolled_back" => Ok(Self::RolledBack),
            "compensated" => Ok(Self::Compensated),
            "compensation_failed" => Ok(Self::CompensationFailed),
            other => Err(StatusParseError {
                kind: "workflow",
                value: other.to_string(),
            }),
        }
    }
}

/// Step status
///
/// Statuses form a one-way lattice per step:
/// `Pending → Running → {Completed | Failed | Skipped}`; `Completed` may
/// later move through `Compensating → {Compensated | CompensationFailed}`.
/// A step never re-enters `Completed` once compensation begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet executed
    Pending,

    /// Forward handler in flight
    Running,

    /// Forward handler succeeded
    Completed,

    /// Required step exhausted its retry budget
    Failed,

    /// Optional step exhausted its retry budget; forward execution continued
    Skipped,

    /// Compensation handler in flight
    Compensating,

    /// Compensation handler succeeded
    Compensated,

    /// Compensation handler failed; recorded, never retried automatically
    CompensationFailed,
}

impl StepStatus {
    /// Whether the forward phase is done with this step
    pub fn is_forward_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the step holds external state that compensation must undo
    ///
    /// `Compensating` counts: a crash mid-compensation leaves the step here
    /// and the (idempotent) compensation handler must run again on resume.
    pub fn needs_compensation(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensating)
    }

    /// The wire representation (matches the serde encoding)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "compensating" => Ok(Self::Compensating),
            "compensated" => Ok(Self::Compensated),
            "compensation_failed" => Ok(Self::CompensationFailed),
            other => Err(StatusParseError {
                kind: "step",
                value: other.to_string(),
            }),
        }
    }
}
