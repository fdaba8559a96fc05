//! Public error envelope.
//!
//! Every call exposed to local CLIs and the bus carries failures as
//! `{ok, error_kind, message, retryable}` with a closed set of kinds.
//! The raw provider message is retained as a field, never as the only
//! signal.

use serde::{Deserialize, Serialize};

/// The closed set of error kinds crossing the public boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected at load; the affected subsystem refuses to start.
    ConfigInvalid,
    /// Adapter could not reach the underlying device or interface.
    ProbeUnavailable,
    /// Per-tick probe deadline exceeded.
    ProbeTimeout,
    /// Policy layer refused; the fallback path also failed.
    PolicyUnavailable,
    /// Post-verify readback disagreed with the intended ordering.
    PolicyMismatch,
    /// Overlapping controller action.
    Busy,
    /// Memory cap hit; the store trimmed.
    BudgetExceeded,
    /// Programmer error; the supervisor restarts the task.
    FatalInternal,
}

impl ErrorKind {
    /// Whether the caller may reasonably retry the same call.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProbeUnavailable
                | ErrorKind::ProbeTimeout
                | ErrorKind::PolicyUnavailable
                | ErrorKind::Busy
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::ProbeUnavailable => "probe_unavailable",
            ErrorKind::ProbeTimeout => "probe_timeout",
            ErrorKind::PolicyUnavailable => "policy_unavailable",
            ErrorKind::PolicyMismatch => "policy_mismatch",
            ErrorKind::Busy => "busy",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::FatalInternal => "fatal_internal",
        };
        write!(f, "{s}")
    }
}

/// Error payload for all exposed calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error_kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorEnvelope {
            ok: false,
            error_kind: kind,
            message: message.into(),
            retryable: kind.retryable(),
        }
    }
}
