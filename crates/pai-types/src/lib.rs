//! Shared types, errors, run status, and session configuration for the PAI
//! pipeline SDK.
//!
//! This crate provides the foundational types used across all other crates:
//! - `PaiError`: unified error taxonomy
//! - `RunStatus`: lifecycle status of a remote pipeline run
//! - `SessionConfig`: explicit session configuration (no global default session)

pub mod config;

pub use config::SessionConfig;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error type for all PAI SDK subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PaiError {
    // === Binding / Validation Errors ===
    #[error("Invalid value {value} for {target}")]
    InvalidValue { target: String, value: String },

    #[error("Invalid assignment to {target}: left type {left}, right type {right}")]
    TypeMismatch {
        target: String,
        left: String,
        right: String,
    },

    #[error("Invalid parameter range '{range}': {message}")]
    InvalidInterval { range: String, message: String },

    #[error("Spec validation failed: {0}")]
    SpecValidation(String),

    #[error("Variable '{name}' is not attached to a component or step")]
    UnresolvedVariable { name: String },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Ambiguous output selection: {0}")]
    AmbiguousOutput(String),

    // === Run State Errors ===
    #[error("Run {run_id} is initialized but not started; start the run first")]
    RunNotStarted { run_id: String },

    #[error("Run {run_id} is stopped (status: {status}); resume or retry the run")]
    RunStopped { run_id: String, status: RunStatus },

    #[error("Run {run_id} failed: {detail}")]
    RunFailed { run_id: String, detail: String },

    #[error("Run {run_id} is in unexpected status {status}")]
    UnexpectedRunStatus { run_id: String, status: RunStatus },

    #[error("Run {run_id} has no root node")]
    MissingRootNode { run_id: String },

    #[error("Waiting on run {run_id} was cancelled")]
    Cancelled { run_id: String },

    // === Remote API Errors ===
    #[error("{action} returned HTTP {status}: {message}")]
    ApiError {
        action: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Authentication failed for {action}")]
    AuthError { action: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{action} timed out after {timeout_ms}ms")]
    RequestTimeout { action: String, timeout_ms: u64 },

    // === Configuration ===
    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl PaiError {
    /// Returns `true` for errors caused by the caller's input: bad bindings,
    /// malformed specs, or waiting on a run that is in the wrong state.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PaiError::InvalidValue { .. }
                | PaiError::TypeMismatch { .. }
                | PaiError::InvalidInterval { .. }
                | PaiError::SpecValidation(_)
                | PaiError::UnresolvedVariable { .. }
                | PaiError::ValidationError(_)
                | PaiError::AmbiguousOutput(_)
                | PaiError::RunNotStarted { .. }
                | PaiError::RunStopped { .. }
                | PaiError::UnexpectedRunStatus { .. }
        )
    }

    /// Returns `true` if the error is transient and the call may succeed on retry.
    ///
    /// Nothing in this SDK retries remote calls; the flag is for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaiError::RequestTimeout { .. } | PaiError::ApiError { retryable: true, .. }
        )
    }

    /// Maps the error to an HTTP status code.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PaiError::ApiError { status, .. } => Some(*status),
            PaiError::AuthError { .. } => Some(401),
            PaiError::NotFound { .. } => Some(404),
            PaiError::RequestTimeout { .. } => Some(504),
            e if e.is_user_error() => Some(400),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, PaiError>`.
pub type Result<T> = std::result::Result<T, PaiError>;

// ---------------------------------------------------------------------------
// RunStatus: lifecycle status of a pipeline run or run node
// ---------------------------------------------------------------------------

/// Status reported by the workflow service for a run or one of its nodes.
///
/// Strings the SDK does not know deserialize to [`RunStatus::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Initialized,
    ReadyToSchedule,
    Starting,
    WorkflowServiceStarting,
    Running,
    Succeeded,
    Failed,
    Terminated,
    Suspended,
    Skipped,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// True exactly for the scheduling and running phases.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            RunStatus::Starting
                | RunStatus::Running
                | RunStatus::WorkflowServiceStarting
                | RunStatus::ReadyToSchedule
        )
    }

    /// True when the run will not change state without user action.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Terminated
                | RunStatus::Suspended
                | RunStatus::Skipped
                | RunStatus::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Initialized => "Initialized",
            RunStatus::ReadyToSchedule => "ReadyToSchedule",
            RunStatus::Starting => "Starting",
            RunStatus::WorkflowServiceStarting => "WorkflowServiceStarting",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Terminated => "Terminated",
            RunStatus::Suspended => "Suspended",
            RunStatus::Skipped => "Skipped",
            RunStatus::Unknown => "Unknown",
        }
    }

    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 11] = [
        RunStatus::Initialized,
        RunStatus::ReadyToSchedule,
        RunStatus::Starting,
        RunStatus::WorkflowServiceStarting,
        RunStatus::Running,
        RunStatus::Succeeded,
        RunStatus::Failed,
        RunStatus::Terminated,
        RunStatus::Suspended,
        RunStatus::Skipped,
        RunStatus::Unknown,
    ];
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = PaiError;

    fn from_str(s: &str) -> Result<Self> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PaiError::Other(format!("Unknown run status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_value() {
        let err = PaiError::InvalidValue {
            target: "{{inputs.parameters.epoch}}".into(),
            value: "\"abc\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value \"abc\" for {{inputs.parameters.epoch}}"
        );
    }

    #[test]
    fn error_display_type_mismatch() {
        let err = PaiError::TypeMismatch {
            target: "pipelines.train.inputs.parameters.lr".into(),
            left: "Double".into(),
            right: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid assignment to pipelines.train.inputs.parameters.lr: left type Double, right type String"
        );
    }

    #[test]
    fn error_display_run_stopped() {
        let err = PaiError::RunStopped {
            run_id: "flow-1".into(),
            status: RunStatus::Suspended,
        };
        assert_eq!(
            err.to_string(),
            "Run flow-1 is stopped (status: Suspended); resume or retry the run"
        );
    }

    #[test]
    fn error_display_api_error() {
        let err = PaiError::ApiError {
            action: "GetRun".into(),
            status: 500,
            message: "internal error".into(),
            retryable: true,
        };
        assert_eq!(err.to_string(), "GetRun returned HTTP 500: internal error");
    }

    #[test]
    fn user_errors_are_flagged() {
        assert!(PaiError::SpecValidation("dup".into()).is_user_error());
        assert!(PaiError::RunNotStarted { run_id: "r".into() }.is_user_error());
        assert!(!PaiError::RunFailed {
            run_id: "r".into(),
            detail: "node failed".into()
        }
        .is_user_error());
        assert!(!PaiError::Other("x".into()).is_user_error());
    }

    #[test]
    fn retryable_only_for_transient_api_errors() {
        let transient = PaiError::ApiError {
            action: "ListRuns".into(),
            status: 503,
            message: "unavailable".into(),
            retryable: true,
        };
        let permanent = PaiError::ApiError {
            action: "ListRuns".into(),
            status: 400,
            message: "bad request".into(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(PaiError::RequestTimeout {
            action: "GetRun".into(),
            timeout_ms: 100
        }
        .is_retryable());
        assert!(!PaiError::AuthError { action: "GetRun".into() }.is_retryable());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(PaiError::AuthError { action: "x".into() }.http_status(), Some(401));
        assert_eq!(
            PaiError::NotFound { resource: "run r".into() }.http_status(),
            Some(404)
        );
        assert_eq!(PaiError::SpecValidation("x".into()).http_status(), Some(400));
        assert_eq!(PaiError::Other("x".into()).http_status(), None);
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: PaiError = json_err.into();
        assert!(matches!(err, PaiError::Json(_)));
    }

    // --- RunStatus ---

    #[test]
    fn is_running_only_for_running_phases() {
        let running: Vec<_> = RunStatus::ALL
            .into_iter()
            .filter(|s| s.is_running())
            .collect();
        assert_eq!(
            running,
            vec![
                RunStatus::ReadyToSchedule,
                RunStatus::Starting,
                RunStatus::WorkflowServiceStarting,
                RunStatus::Running,
            ]
        );
        assert!(!RunStatus::Initialized.is_running());
        assert!(!RunStatus::Succeeded.is_running());
        assert!(!RunStatus::Failed.is_running());
    }

    #[test]
    fn running_and_terminal_are_disjoint() {
        for status in RunStatus::ALL {
            assert!(!(status.is_running() && status.is_terminal()), "{status}");
        }
        assert!(!RunStatus::Initialized.is_terminal());
    }

    #[test]
    fn status_deserializes_from_wire_names() {
        let status: RunStatus = serde_json::from_str("\"WorkflowServiceStarting\"").unwrap();
        assert_eq!(status, RunStatus::WorkflowServiceStarting);
        let status: RunStatus = serde_json::from_str("\"SomethingNew\"").unwrap();
        assert_eq!(status, RunStatus::Unknown);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("succeeded".parse::<RunStatus>().unwrap(), RunStatus::Succeeded);
        assert_eq!("Running".parse::<RunStatus>().unwrap(), RunStatus::Running);
        assert!("bogus".parse::<RunStatus>().is_err());
    }
}
