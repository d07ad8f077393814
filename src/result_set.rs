//! Result tree root
//!
//! A [`ResultSet`] owns the outcome of one evaluation: the request it was
//! started with, its lifecycle state and, on success, either the matches or
//! the split segments. Presentation code only reads it; every transition is
//! `pub(crate)` and driven by [`crate::session::Session`].

use std::fmt;

use serde::Serialize;

use crate::error::{ErrorKind, EvaluationError};
use crate::match_result::Match;
use crate::outline::OutlineNode;
use crate::parser::ParseOutcome;
use crate::process::{ProcessHandle, RequestId};
use crate::request::{MatchRequest, Mode};
use crate::span::TextSpan;

/// Lifecycle of a result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultState::Idle => "idle",
            ResultState::Running => "running",
            ResultState::Succeeded => "succeeded",
            ResultState::Failed => "failed",
            ResultState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Everything one evaluation produced
#[derive(Debug, Default)]
pub struct ResultSet {
    request: Option<MatchRequest>,
    request_id: Option<RequestId>,
    state: ResultState,
    matches: Vec<Match>,
    splits: Vec<TextSpan>,
    replaced_text: Option<String>,
    error: Option<EvaluationError>,
    process: Option<ProcessHandle>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ResultState {
        self.state
    }

    /// True iff the last evaluation failed
    pub fn is_error(&self) -> bool {
        self.state == ResultState::Failed
    }

    pub fn is_running(&self) -> bool {
        self.state == ResultState::Running
    }

    pub fn error(&self) -> Option<&EvaluationError> {
        self.error.as_ref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(EvaluationError::kind)
    }

    pub fn request(&self) -> Option<&MatchRequest> {
        self.request.as_ref()
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn mode(&self) -> Option<Mode> {
        self.request.as_ref().map(|r| r.mode)
    }

    /// Subject of the current request, empty when there is none
    pub fn subject(&self) -> &str {
        self.request.as_ref().map_or("", |r| r.subject.as_str())
    }

    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    /// Match at `index` (0-based; its `number()` is `index + 1`)
    pub fn match_at(&self, index: usize) -> Option<&Match> {
        self.matches.get(index)
    }

    /// Mutable access for the renderer's `rendered` flag
    pub fn match_at_mut(&mut self, index: usize) -> Option<&mut Match> {
        self.matches.get_mut(index)
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn split_count(&self) -> usize {
        self.splits.len()
    }

    pub fn split_at(&self, index: usize) -> Option<&str> {
        self.splits.get(index).map(TextSpan::text)
    }

    pub fn splits(&self) -> &[TextSpan] {
        &self.splits
    }

    /// Fully substituted subject after a successful Replace
    pub fn replaced_text(&self) -> Option<&str> {
        self.replaced_text.as_deref()
    }

    /// Root node of the outline protocol
    pub fn outline(&self) -> OutlineNode<'_> {
        OutlineNode::Root(self)
    }

    /// Enters Running for a freshly started request, dropping the old tree
    pub(crate) fn begin(&mut self, request: MatchRequest, handle: ProcessHandle) {
        self.clear_results();
        self.request_id = Some(handle.request());
        self.request = Some(request);
        self.process = Some(handle);
        self.state = ResultState::Running;
    }

    /// Gives up ownership of the running process
    pub(crate) fn take_process(&mut self) -> Option<ProcessHandle> {
        self.process.take()
    }

    pub(crate) fn succeed(&mut self, outcome: ParseOutcome) {
        self.clear_results();
        self.process = None;
        match outcome {
            ParseOutcome::Matches {
                matches,
                replaced_text,
            } => {
                self.matches = matches;
                self.replaced_text = replaced_text;
            }
            ParseOutcome::Splits(splits) => self.splits = splits,
            // Rejections are turned into errors before they get here
            ParseOutcome::Rejected(_) => {}
        }
        self.state = ResultState::Succeeded;
    }

    #[cfg(test)]
    pub(crate) fn succeed_with(&mut self, request: MatchRequest, outcome: ParseOutcome) {
        self.request = Some(request);
        self.succeed(outcome);
    }

    /// Failure of the current request, or of one that never started
    pub(crate) fn fail(&mut self, request: MatchRequest, error: EvaluationError) {
        self.clear_results();
        self.process = None;
        self.request_id = None;
        self.request = Some(request);
        self.error = Some(error);
        self.state = ResultState::Failed;
    }

    pub(crate) fn fail_running(&mut self, error: EvaluationError) {
        self.clear_results();
        self.process = None;
        self.error = Some(error);
        self.state = ResultState::Failed;
    }

    pub(crate) fn abort(&mut self) {
        self.clear_results();
        self.process = None;
        self.state = ResultState::Aborted;
    }

    fn clear_results(&mut self) {
        self.matches.clear();
        self.splits.clear();
        self.replaced_text = None;
        self.error = None;
    }
}
