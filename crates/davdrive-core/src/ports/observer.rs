//! Action observer port (driven/secondary port)
//!
//! Every remote-facing operation performed by the driver is reported as a
//! discrete `(method, path, outcome)` event, independent of what the
//! filesystem callback returned to the operating system. Hosts use the
//! stream for activity views and to offer recovery of files whose upload
//! failed.
//!
//! ## Design Notes
//!
//! - Observers are called synchronously from filesystem callbacks and
//!   must not block; forward to a channel for anything slow.
//! - `authentication_failed` is raised whenever the server rejects the
//!   configured credentials.

use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of one repository action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
pub enum ActionOutcome {
    Success,
    Failed(String),
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Success => write!(f, "success"),
            ActionOutcome::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

/// One operation against the repository, as reported to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryAction {
    /// When the action finished
    pub date: DateTime<Utc>,
    /// Object id of the node involved (0 if no node exists)
    pub object_id: u64,
    /// Driver operation name, e.g. `"Create"` or `"Cleanup"`
    pub method: String,
    /// Local path the operation targeted
    pub path: String,
    /// Whether it succeeded
    pub outcome: ActionOutcome,
    /// Recovery copy written after an unrecoverable flush failure
    pub local_temporary_path: Option<PathBuf>,
}

impl RepositoryAction {
    /// Creates a successful action record.
    pub fn success(object_id: u64, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            date: Utc::now(),
            object_id,
            method: method.into(),
            path: path.into(),
            outcome: ActionOutcome::Success,
            local_temporary_path: None,
        }
    }

    /// Creates a failed action record.
    pub fn failed(
        object_id: u64,
        method: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            outcome: ActionOutcome::Failed(message.into()),
            ..Self::success(object_id, method, path)
        }
    }

    /// Attaches the path of a local recovery copy.
    pub fn with_temporary_path(mut self, path: Option<PathBuf>) -> Self {
        self.local_temporary_path = path;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Success)
    }
}

/// Receives repository action events from the driver.
pub trait IActionObserver: Send + Sync {
    /// Reports one finished action
    fn action_performed(&self, action: RepositoryAction);

    /// Reports that the server rejected the configured credentials
    fn authentication_failed(&self);
}
