//! Typed error categories shared across the sync engine, daemon, and RPC transport.
//!
//! Library code returns [`BeadsError`] so callers can branch on category (is this
//! retryable? does the user need to see a remedy?) instead of matching on strings.
//! The CLI layer wraps these in `anyhow::Context` for human-facing messages.

use std::path::PathBuf;

/// A typed error category, matching the taxonomy in the core design notes.
#[derive(Debug, thiserror::Error)]
pub enum BeadsError {
    /// The user did something that has a concrete fix (bad JSONL, missing --force, etc).
    #[error("{message}")]
    User {
        message: String,
        /// A remedy the user can run verbatim, if one exists.
        hint: Option<String>,
    },

    /// Environment is missing a precondition (not a git repo, no upstream, ...).
    #[error("{message}")]
    Environment { message: String },

    /// Worth retrying: lock contention, push rejected, daemon not ready yet.
    #[error("{message}")]
    Transient { message: String },

    /// The store's on-disk state disagrees with what we expected (hash mismatch, etc).
    #[error("integrity fault in {component} during {operation}: {message}")]
    IntegrityFault {
        component: &'static str,
        operation: &'static str,
        message: String,
    },

    /// Lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two writers disagree about the right outcome (id collision, concurrent remap).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Fatal to the process: schema mismatch without override, lost lock, nested .beads.
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl BeadsError {
    pub fn user(message: impl Into<String>) -> Self {
        BeadsError::User {
            message: message.into(),
            hint: None,
        }
    }

    pub fn user_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        BeadsError::User {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        BeadsError::Environment {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        BeadsError::Transient {
            message: message.into(),
        }
    }

    pub fn integrity(component: &'static str, operation: &'static str, message: impl Into<String>) -> Self {
        BeadsError::IntegrityFault {
            component,
            operation,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        BeadsError::Fatal {
            message: message.into(),
        }
    }

    /// True for categories the daemon's top-level `recover` should treat as fatal
    /// (everything else is caught, logged, and the operation simply fails).
    pub fn is_fatal(&self) -> bool {
        matches!(self, BeadsError::Fatal { .. })
    }

    /// True for categories worth an automatic retry inside the component.
    pub fn is_transient(&self) -> bool {
        matches!(self, BeadsError::Transient { .. })
    }
}

/// Structured context attached to an error crossing a component boundary, per
/// the propagation rule: component, operation, path, cause.
#[derive(Debug, thiserror::Error)]
#[error("{component}/{operation}{}: {source}", path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
pub struct ContextualError {
    pub component: &'static str,
    pub operation: &'static str,
    pub path: Option<PathBuf>,
    #[source]
    pub source: BeadsError,
}

impl ContextualError {
    pub fn new(component: &'static str, operation: &'static str, source: BeadsError) -> Self {
        ContextualError {
            component,
            operation,
            path: None,
            source,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl From<rusqlite::Error> for BeadsError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => BeadsError::NotFound(e.to_string()),
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                BeadsError::transient(format!("database busy: {e}"))
            }
            other => BeadsError::integrity("store", "query", other.to_string()),
        }
    }
}

impl From<std::io::Error> for BeadsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => BeadsError::environment(format!("permission denied: {e}")),
            std::io::ErrorKind::NotFound => BeadsError::NotFound(e.to_string()),
            _ => BeadsError::integrity("file-io", "io", e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BeadsError {
    fn from(e: serde_json::Error) -> Self {
        BeadsError::user(format!("invalid JSON: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, BeadsError>;
