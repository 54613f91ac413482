//! Error taxonomy shared by the dispatcher, services, and the web bridge.

use crate::commands::ErrorCode;
use crate::payload::Mode;
use thiserror::Error;

/// Why a command was rejected or a pipeline stage failed.
///
/// Validation and wrong-mode errors are reported to the originator and never
/// touch the bus; transient external failures get one retry before the owning
/// component degrades; fatal startup errors shut the process down with exit
/// code 1.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("invalid command: {message}")]
    Validation { message: String },

    #[error("wrong mode: requires {required}, currently {current}")]
    WrongMode { current: Mode, required: Mode },

    #[error("unknown command: {line}")]
    Unknown { line: String },

    #[error("{service} failed: {message}")]
    TransientExternal { service: String, message: String },

    #[error("{resource} unavailable: {message}")]
    ResourceUnavailable { resource: String, message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("startup failed: {message}")]
    FatalStartup { message: String },
}

impl CommandError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn wrong_mode(current: Mode, required: Mode) -> Self {
        Self::WrongMode { current, required }
    }

    pub fn unknown(line: impl Into<String>) -> Self {
        Self::Unknown { line: line.into() }
    }

    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientExternal {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// The wire error code for acks.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::WrongMode { .. } => ErrorCode::WrongMode,
            Self::Unknown { .. } => ErrorCode::UnknownAction,
            Self::TransientExternal { .. } | Self::ResourceUnavailable { .. } => {
                ErrorCode::ProcessingError
            }
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::FatalStartup { .. } => ErrorCode::ProcessingError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map() {
        assert_eq!(
            CommandError::validation("x").error_code(),
            ErrorCode::ValidationError
        );
        assert_eq!(
            CommandError::wrong_mode(Mode::Idle, Mode::Interactive).error_code(),
            ErrorCode::WrongMode
        );
        assert_eq!(
            CommandError::unknown("dance").error_code(),
            ErrorCode::UnknownAction
        );
        assert_eq!(
            CommandError::timeout("llm_turn", 20_000).error_code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn display_includes_context() {
        let err = CommandError::wrong_mode(Mode::Idle, Mode::Interactive);
        assert_eq!(
            err.to_string(),
            "wrong mode: requires INTERACTIVE, currently IDLE"
        );
    }
}
