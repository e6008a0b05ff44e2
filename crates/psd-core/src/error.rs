//! Unified error types for the simulation core
//!
//! [`PsdError`] covers the error classes the engine can surface: parameter
//! rejection, file operations, solver bridge misuse, and non-zero function
//! return codes. Domain crates convert these into `anyhow` errors at API
//! boundaries.

use thiserror::Error;

/// Unified error type for core operations.
#[derive(Error, Debug)]
pub enum PsdError {
    /// A parameter name was not recognized by the component or any sub-object
    #[error("unrecognized parameter '{0}'")]
    UnrecognizedParameter(String),

    /// A parameter name was recognized but the value was rejected
    #[error("invalid value for parameter '{0}'")]
    InvalidParameterValue(String),

    /// I/O errors (file access, etc.)
    #[error("file operation error: {0}")]
    FileOperation(#[from] std::io::Error),

    /// A persistence file had unexpected structure or content
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// A solver handle was misused or the solver layer reported a code
    #[error("invalid solver operation: {reason} (code {code})")]
    InvalidSolverOperation { reason: String, code: i32 },

    /// Non-zero return code from a residual/Jacobian/init/run path
    #[error("function execution failure (code {0})")]
    FunctionExecutionFailure(i32),

    /// Object lookup failures (bad path, missing id)
    #[error("object error: {0}")]
    Object(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using PsdError.
pub type PsdResult<T> = Result<T, PsdError>;

impl PsdError {
    /// The numeric code carried by solver-adjacent errors, or a generic failure code.
    pub fn code(&self) -> i32 {
        match self {
            PsdError::InvalidSolverOperation { code, .. } => *code,
            PsdError::FunctionExecutionFailure(code) => *code,
            _ => crate::change::FUNCTION_EXECUTION_FAILURE,
        }
    }
}

// Conversion from anyhow::Error for wrapping external errors
impl From<anyhow::Error> for PsdError {
    fn from(err: anyhow::Error) -> Self {
        PsdError::Other(err.to_string())
    }
}

impl From<String> for PsdError {
    fn from(s: String) -> Self {
        PsdError::Other(s)
    }
}

impl From<&str> for PsdError {
    fn from(s: &str) -> Self {
        PsdError::Other(s.to_string())
    }
}

impl From<csv::Error> for PsdError {
    fn from(err: csv::Error) -> Self {
        PsdError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PsdError::UnrecognizedParameter("dutycycle".into());
        assert!(err.to_string().contains("unrecognized parameter"));
        assert!(err.to_string().contains("dutycycle"));
    }

    #[test]
    fn test_solver_code_accessor() {
        let err = PsdError::InvalidSolverOperation {
            reason: "solve before allocate".into(),
            code: -38,
        };
        assert_eq!(err.code(), -38);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PsdError = io_err.into();
        assert!(matches!(err, PsdError::FileOperation(_)));
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> PsdResult<()> {
            Err(PsdError::InvalidParameterValue("period".into()))
        }

        fn outer() -> PsdResult<()> {
            inner()?;
            Ok(())
        }

        assert!(outer().is_err());
    }
}
