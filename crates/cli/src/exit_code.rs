// Consistent exit codes for the workbench CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error (including rejected command arguments)
//   3  = workflow not found
//   4  = configuration error
//   10 = database busy, safe to retry

use std::process;

use workbench_engine::config::ConfigError;
use workbench_engine::{EngineError, ErrorCode, StoreError};

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    NotFound = 3,
    Config = 4,
    Busy = 10,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(engine) = cause.downcast_ref::<EngineError>() {
                return Self::from_engine_code(engine.code());
            }
            if let Some(StoreError::WorkflowNotFound(_)) = cause.downcast_ref::<StoreError>() {
                return Self::NotFound;
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return Self::Config;
            }
            if cause.downcast_ref::<serde_json::Error>().is_some() {
                return Self::Usage;
            }
        }
        Self::Error
    }

    pub fn from_engine_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationFailed | ErrorCode::UnknownCommand => Self::Usage,
            ErrorCode::NotFound => Self::NotFound,
            ErrorCode::Busy => Self::Busy,
            ErrorCode::InternalError => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workbench_engine::ValidationError;

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::Usage.code(), 2);
        assert_eq!(ExitCode::NotFound.code(), 3);
        assert_eq!(ExitCode::Config.code(), 4);
        assert_eq!(ExitCode::Busy.code(), 10);
    }

    #[test]
    fn engine_codes_map_to_exit_codes() {
        assert_eq!(ExitCode::from_engine_code(ErrorCode::ValidationFailed), ExitCode::Usage);
        assert_eq!(ExitCode::from_engine_code(ErrorCode::UnknownCommand), ExitCode::Usage);
        assert_eq!(ExitCode::from_engine_code(ErrorCode::NotFound), ExitCode::NotFound);
        assert_eq!(ExitCode::from_engine_code(ErrorCode::Busy), ExitCode::Busy);
        assert_eq!(ExitCode::from_engine_code(ErrorCode::InternalError), ExitCode::Error);
    }

    #[test]
    fn from_error_finds_engine_error_under_context() {
        let err = anyhow::Error::new(EngineError::Validation(ValidationError::ParamsNotObject))
            .context("applying command");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);

        let err = anyhow::Error::new(EngineError::WorkflowNotFound(9));
        assert_eq!(ExitCode::from_error(&err), ExitCode::NotFound);
    }

    #[test]
    fn from_error_store_not_found() {
        let err = anyhow::Error::new(StoreError::WorkflowNotFound(3)).context("loading workflow");
        assert_eq!(ExitCode::from_error(&err), ExitCode::NotFound);
    }

    #[test]
    fn from_error_bad_json_is_usage() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = anyhow::Error::new(json_err).context("invalid command JSON");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);
    }

    #[test]
    fn from_error_generic_is_error() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Error);
    }
}
