//! Command result type

use serde::Serialize;

use crate::context::ContextError;
use crate::error::ExecError;

/// Sentinel exit code for commands that could not start or were cancelled.
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;

/// Outcome of a single `execute` call.
///
/// `output` holds stdout followed by stderr; the streams are captured
/// separately and are not interleaved by time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub output: String,
    pub exit_code: i32,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ExecError>,
}

impl CommandResult {
    /// Build a result from a finished command's exit code.
    pub fn from_exit(output: String, exit_code: i32) -> Self {
        let error = (exit_code != 0).then_some(ExecError::ExitStatus(exit_code));
        Self {
            output,
            exit_code,
            error,
        }
    }

    pub fn cancelled(output: String, reason: ContextError) -> Self {
        Self {
            output,
            exit_code: EXIT_CODE_UNAVAILABLE,
            error: Some(ExecError::Context(reason)),
        }
    }

    pub fn failed(output: String, error: ExecError) -> Self {
        Self {
            output,
            exit_code: EXIT_CODE_UNAVAILABLE,
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    /// True when the command was stopped by its context rather than exiting.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(ExecError::Context(_)))
    }

    /// Convert into a `Result`, keeping the full result on success.
    pub fn into_result(self) -> Result<Self, ExecError> {
        match self.error.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

fn serialize_error<S>(error: &Option<ExecError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}
