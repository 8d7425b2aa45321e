//! Unified error type for control-plane failures.
//!
//! Item-level failures (an unreachable provider, a corrupt file, a timeout)
//! never surface here: they are recorded on the item itself. Everything in
//! [`Error`] is a fault the caller of an operation has to deal with.

use std::fmt;
use std::time::Duration;

use crate::item::ItemState;

/// Unified error type covering all control-plane failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An item with the same id was already enqueued in this run.
    #[error("Duplicate item: {id}")]
    DuplicateItem {
        /// The id that collided.
        id: String,
    },

    /// A compare-and-set transition did not match the item's current state,
    /// or the requested edge is not part of the state machine.
    #[error("Invalid transition for {id}: {from:?} -> {to:?} (current state {actual:?})")]
    InvalidTransition {
        /// The item that was targeted.
        id: String,
        /// The state the caller expected the item to be in.
        from: ItemState,
        /// The state the caller asked for.
        to: ItemState,
        /// The state the item was actually in.
        actual: ItemState,
    },

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "item", "run").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// A persisted checkpoint is inconsistent and must not be resumed.
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Writing a checkpoint failed; the run can no longer guarantee recovery.
    #[error("Checkpoint write failed for run {run_id}: {message}")]
    Checkpoint {
        /// The run whose checkpoint could not be written.
        run_id: String,
        /// Human-readable error description.
        message: String,
    },

    /// Another live controller already owns this run id.
    #[error("Run {run_id} is already held by a live controller")]
    RunLocked {
        /// The run that is locked.
        run_id: String,
    },

    /// The operation conflicts with the current state of a run.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller-supplied data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Encoding or decoding JSON failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An external tool (ffmpeg, etc.) could not be located.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// An external tool ran past its deadline and was killed.
    #[error("Tool error [{tool}]: timed out after {after:?}")]
    ToolTimeout {
        /// Name of the tool.
        tool: String,
        /// The deadline that expired.
        after: Duration,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Checkpoint`].
    pub fn checkpoint(run_id: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::Checkpoint {
            run_id: run_id.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether this error breaks the crash-recovery guarantee of a run.
    pub fn is_run_fault(&self) -> bool {
        matches!(self, Error::Checkpoint { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_item_display() {
        let err = Error::DuplicateItem { id: "abc".into() };
        assert_eq!(err.to_string(), "Duplicate item: abc");
    }

    #[test]
    fn invalid_transition_display() {
        let err = Error::InvalidTransition {
            id: "a1".into(),
            from: ItemState::Pending,
            to: ItemState::Processing,
            actual: ItemState::Done,
        };
        let msg = err.to_string();
        assert!(msg.contains("a1"));
        assert!(msg.contains("Done"));
    }

    #[test]
    fn not_found_display() {
        let err = Error::not_found("run", "r-1");
        assert_eq!(err.to_string(), "run not found: r-1");
    }

    #[test]
    fn checkpoint_is_run_fault() {
        let err = Error::checkpoint("r-1", "disk full");
        assert!(err.is_run_fault());
        assert_eq!(
            err.to_string(),
            "Checkpoint write failed for run r-1: disk full"
        );
        assert!(!Error::Conflict("x".into()).is_run_fault());
    }

    #[test]
    fn tool_timeout_display() {
        let err = Error::ToolTimeout {
            tool: "ffmpeg".into(),
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "Tool error [ffmpeg]: timed out after 30s");
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn serde_json_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err = Error::from(parse.unwrap_err());
        assert!(matches!(err, Error::Serialization(_)));
    }
}
