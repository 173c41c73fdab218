use std::path::PathBuf;

use thiserror::Error;
use workbench_common::command::CommandName;
use workbench_common::slug::SlugError;
use workbench_common::types::{DeltaId, WorkflowId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to prepare database directory `{}`: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("failed to apply schema migration v{version}: {source}")]
    Migration { version: i64, source: rusqlite::Error },

    #[error("workflow {0} does not exist")]
    WorkflowNotFound(WorkflowId),

    #[error("history entry {0} does not exist")]
    DeltaNotFound(DeltaId),

    #[error("stored timestamp {0:?} is not RFC 3339")]
    InvalidTimestamp(String),

    #[error("document lock already held for workflow {held} on this thread (requested {requested})")]
    LockReentered { held: WorkflowId, requested: WorkflowId },
}

/// Bad caller input. Reported verbatim and never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid slug {slug:?}: {source}")]
    InvalidSlug { slug: String, source: SlugError },

    #[error("tab slug {0:?} is already used in this workflow")]
    DuplicateTabSlug(String),

    #[error("step slug {0:?} is already used in this workflow")]
    DuplicateStepSlug(String),

    #[error("tab {0:?} does not exist")]
    TabNotFound(String),

    #[error("step {0:?} does not exist")]
    StepNotFound(String),

    #[error("new order lists {0:?} more than once")]
    DuplicateInOrder(String),

    #[error("new order has {actual} entries; expected {expected}")]
    WrongCount { expected: usize, actual: usize },

    #[error("new order mentions unknown slug {0:?}")]
    UnknownInOrder(String),

    #[error("position {position} is outside 0..={max}")]
    PositionOutOfRange { position: i64, max: i64 },

    #[error("params must be a JSON object")]
    ParamsNotObject,

    #[error("{0} cannot be created by a caller")]
    NotCreatable(CommandName),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{command} received arguments for {received}")]
    ArgsMismatch { command: CommandName, received: CommandName },

    #[error("stored payload for {command} is malformed: {source}")]
    Payload { command: CommandName, source: serde_json::Error },

    #[error("{command} entry has no {what} reference")]
    MissingReference { command: CommandName, what: &'static str },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error(transparent)]
    Validation(ValidationError),

    #[error("workflow {0} does not exist")]
    WorkflowNotFound(WorkflowId),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Command(CommandError),

    #[error("mutation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::WorkflowNotFound(_) => ErrorCode::NotFound,
            Self::Store(StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)))
                if failure.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                ErrorCode::Busy
            }
            Self::Store(_) | Self::Command(_) | Self::Join(_) => ErrorCode::InternalError,
        }
    }

    /// True for the race where the target vanished before the lock was taken.
    /// Best-effort callers may treat this as "nothing to do".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::WorkflowNotFound(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::WorkflowNotFound(id) => Self::WorkflowNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<crate::commands::UnknownCommand> for EngineError {
    fn from(error: crate::commands::UnknownCommand) -> Self {
        Self::UnknownCommand(error.0)
    }
}

impl From<CommandError> for EngineError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::Validation(validation) => Self::Validation(validation),
            CommandError::Store(store) => store.into(),
            other => Self::Command(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    NotFound,
    UnknownCommand,
    Busy,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::Busy => "BUSY",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::Busy)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "command arguments failed validation",
            Self::NotFound => "requested workflow not found",
            Self::UnknownCommand => "command identifier is not registered",
            Self::Busy => "database is busy; try again",
            Self::InternalError => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_surface_verbatim() {
        let error: EngineError =
            CommandError::from(ValidationError::DuplicateTabSlug("tab-1".into())).into();

        assert_eq!(error.code(), ErrorCode::ValidationFailed);
        assert!(!error.code().retryable());
        assert_eq!(error.to_string(), "tab slug \"tab-1\" is already used in this workflow");
    }

    #[test]
    fn missing_workflow_maps_to_not_found() {
        let error: EngineError = CommandError::from(StoreError::WorkflowNotFound(7)).into();

        assert!(error.is_not_found());
        assert_eq!(error.code().as_str(), "NOT_FOUND");
    }

    #[test]
    fn busy_database_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let error = EngineError::from(StoreError::from(busy));

        assert_eq!(error.code(), ErrorCode::Busy);
        assert!(error.code().retryable());
    }

    #[test]
    fn other_store_errors_are_internal() {
        let error = EngineError::from(StoreError::DeltaNotFound(7));
        assert_eq!(error.code(), ErrorCode::InternalError);
        assert_eq!(error.code().default_message(), "internal error");
    }
}
