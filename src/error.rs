//! Evaluation errors
//!
//! Every failure of a request ends up as one [`EvaluationError`] stored on
//! the result set. I/O errors are wrapped in `Arc` so the error stays
//! `Clone` and can travel inside notifications.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::regex_error::RegexDiagnostic;

/// Errors raised while building, running or parsing an evaluation
#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    /// The evaluator program cannot be built; no process was spawned
    #[error("cannot build evaluator program: {message}")]
    Configuration {
        /// What made the request unrepresentable
        message: String,
    },

    /// The evaluator executable could not be launched
    #[error("failed to launch evaluator '{command}': {message}")]
    Spawn {
        /// Executable that was launched
        command: String,
        /// Human-readable failure description
        message: String,
        /// Underlying I/O error
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The evaluator rejected the pattern
    #[error("invalid regular expression: {message}")]
    RegexInvalid {
        /// Compile message reported by the evaluator
        message: String,
        /// Classified form of the message
        diagnostic: RegexDiagnostic,
    },

    /// The evaluator failed without a recognisable regex error
    #[error("evaluator failed{}: {message}", status_suffix(.status))]
    Evaluator {
        /// Exit status, when the process exited normally
        status: Option<i32>,
        /// Captured stderr or a description of the failure
        message: String,
    },

    /// The evaluator output did not follow the record format
    #[error("malformed evaluator output at record {record}: {message}")]
    Parse {
        /// 1-based index of the offending record
        record: usize,
        /// Description of the protocol violation
        message: String,
    },
}

fn status_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" with status {}", code),
        None => String::new(),
    }
}

/// Error category, for presentation layers that only need to branch on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Spawn,
    RegexInvalid,
    Evaluator,
    Parse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Spawn => "spawn error",
            ErrorKind::RegexInvalid => "invalid pattern",
            ErrorKind::Evaluator => "evaluator error",
            ErrorKind::Parse => "parse error",
        };
        f.write_str(name)
    }
}

impl EvaluationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvaluationError::Configuration { .. } => ErrorKind::Configuration,
            EvaluationError::Spawn { .. } => ErrorKind::Spawn,
            EvaluationError::RegexInvalid { .. } => ErrorKind::RegexInvalid,
            EvaluationError::Evaluator { .. } => ErrorKind::Evaluator,
            EvaluationError::Parse { .. } => ErrorKind::Parse,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        EvaluationError::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn parse(record: usize, message: impl Into<String>) -> Self {
        EvaluationError::Parse {
            record,
            message: message.into(),
        }
    }

    /// Pattern rejection, classified against the pattern that caused it
    pub(crate) fn regex_invalid(message: impl Into<String>, pattern: &str) -> Self {
        let message = message.into();
        let diagnostic = RegexDiagnostic::from_evaluator_message(&message, pattern);
        EvaluationError::RegexInvalid {
            message,
            diagnostic,
        }
    }
}
