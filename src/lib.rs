//! rexhibit: regular expression tester backed by an external Perl evaluator
//!
//! A [`MatchRequest`] is turned into a Perl program by [`ProgramBuilder`],
//! run by [`ProcessOrchestrator`], and the records it prints are parsed by
//! [`ResultParser`] into a [`ResultSet`]. [`Session`] drives that lifecycle
//! and the `outline` module exposes the finished tree to renderers.
//! The main binary is at src/main.rs.

pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod error_helpers;
pub mod logger;
pub mod match_result;
pub mod outline;
pub mod parser;
pub mod process;
pub mod program;
pub mod regex_error;
pub mod render;
pub mod request;
pub mod result_set;
pub mod session;
pub mod span;
pub mod version;

// Re-export commonly used types for convenience
pub use capture::Capture;
pub use error::{ErrorKind, EvaluationError};
pub use match_result::Match;
pub use outline::{OutlineNode, ReplacementDisplay};
pub use parser::{ParseOutcome, ResultParser};
pub use process::{EvaluatorCommand, ProcessEvent, ProcessHandle, ProcessOrchestrator, RequestId};
pub use program::ProgramBuilder;
pub use regex_error::RegexDiagnostic;
pub use request::{Encoding, MatchRequest, Mode, Modifier, ModifierSet};
pub use result_set::{ResultSet, ResultState};
pub use session::{Notification, Session};
pub use span::{Label, LabelRole, TextSpan};
pub use version::EvaluatorVersion;
