//! Request lifecycle
//!
//! A [`Session`] ties the pieces together for one [`ResultSet`]: it builds
//! the program, hands it to the orchestrator, turns the process event into
//! a parse result and tells subscribers how the request ended.
//!
//! The session is driven from a single thread. [`Session::pump`] never
//! blocks; [`Session::wait`] blocks up to a timeout. Each finished request
//! produces exactly one [`Notification`], delivered to every subscriber and
//! returned to the caller that observed it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ErrorKind, EvaluationError};
use crate::parser::{ParseOutcome, ResultParser};
use crate::process::{ProcessEvent, ProcessOrchestrator, RawOutput, RequestId};
use crate::program::ProgramBuilder;
use crate::request::MatchRequest;
use crate::result_set::ResultSet;

/// Marker Perl puts into compile errors
const COMPILE_ERROR_MARKER: &str = "<-- HERE";

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Completed { request: RequestId },
    Aborted { request: RequestId },
    /// `request` is `None` when no process was ever started
    Failed {
        request: Option<RequestId>,
        kind: ErrorKind,
    },
}

/// One result set and the machinery that fills it
#[derive(Debug)]
pub struct Session {
    builder: ProgramBuilder,
    orchestrator: ProcessOrchestrator,
    results: ResultSet,
    subscribers: Vec<Sender<Notification>>,
}

impl Session {
    pub fn new(builder: ProgramBuilder, orchestrator: ProcessOrchestrator) -> Self {
        Self {
            builder,
            orchestrator,
            results: ResultSet::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    /// Mutable results, for renderers that track the `rendered` flag
    pub fn results_mut(&mut self) -> &mut ResultSet {
        &mut self.results
    }

    pub fn builder(&self) -> &ProgramBuilder {
        &self.builder
    }

    /// A receiver that gets every future notification once
    pub fn subscribe(&mut self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Starts evaluating `request`
    ///
    /// A running evaluation is interrupted first, and is confirmed dead
    /// before the new process is spawned. Build and spawn failures leave
    /// the result set `Failed` and are also returned.
    pub fn start(&mut self, request: MatchRequest) -> Result<RequestId, EvaluationError> {
        self.interrupt();

        let launched = self.builder.build(&request).and_then(|program| {
            self.orchestrator
                .start(&program, request.stdin_payload())
        });

        match launched {
            Ok(handle) => {
                let id = handle.request();
                info!(request = %id, mode = %request.mode, pattern = %request.pattern, "evaluation started");
                self.results.begin(request, handle);
                Ok(id)
            }
            Err(err) => {
                info!(kind = %err.kind(), error = %err, "evaluation could not start");
                self.results.fail(request, err.clone());
                self.notify(Notification::Failed {
                    request: None,
                    kind: err.kind(),
                });
                Err(err)
            }
        }
    }

    /// Stops the running evaluation, if any
    ///
    /// The result set is `Aborted` before this returns, whether or not the
    /// process had already produced its output. Returns `false` when
    /// nothing was running.
    pub fn interrupt(&mut self) -> bool {
        if !self.results.is_running() {
            return false;
        }
        let Some(handle) = self.results.take_process() else {
            return false;
        };
        let request = handle.request();

        self.results.abort();
        self.orchestrator.interrupt(handle);
        info!(%request, "evaluation aborted");
        self.notify(Notification::Aborted { request });
        true
    }

    /// Handles a completion that already arrived, without blocking
    pub fn pump(&mut self) -> Option<Notification> {
        if !self.results.is_running() {
            return None;
        }
        let event = self.orchestrator.try_next_event()?;
        Some(self.complete(event))
    }

    /// Waits up to `timeout` for the running evaluation to end
    pub fn wait(&mut self, timeout: Duration) -> Option<Notification> {
        if !self.results.is_running() {
            return None;
        }
        let event = self.orchestrator.next_event_timeout(timeout)?;
        Some(self.complete(event))
    }

    /// Starts `request` and blocks until it ends
    pub fn evaluate(&mut self, request: MatchRequest) -> Notification {
        if let Err(err) = self.start(request) {
            return Notification::Failed {
                request: None,
                kind: err.kind(),
            };
        }
        loop {
            if let Some(notification) = self.wait(Duration::from_millis(100)) {
                return notification;
            }
        }
    }

    fn complete(&mut self, event: ProcessEvent) -> Notification {
        let request = event.request();
        self.orchestrator.begin_completion(request);
        if let Some(handle) = self.results.take_process() {
            self.orchestrator.finish(handle);
        }

        let outcome = match event {
            ProcessEvent::Exited { output, .. } => match self.results.request() {
                Some(started) => interpret(started, &output),
                None => Err(EvaluationError::configuration("result set lost its request")),
            },
            ProcessEvent::Failed { error, .. } => Err(error),
            ProcessEvent::Terminated { .. } => {
                self.results.abort();
                let notification = Notification::Aborted { request };
                self.notify(notification);
                return notification;
            }
        };

        let notification = match outcome {
            Ok(outcome) => {
                self.results.succeed(outcome);
                info!(
                    %request,
                    matches = self.results.match_count(),
                    splits = self.results.split_count(),
                    "evaluation completed"
                );
                Notification::Completed { request }
            }
            Err(err) => {
                info!(%request, kind = %err.kind(), error = %err, "evaluation failed");
                let kind = err.kind();
                self.results.fail_running(err);
                Notification::Failed {
                    request: Some(request),
                    kind,
                }
            }
        };
        self.notify(notification);
        notification
    }

    fn notify(&mut self, notification: Notification) {
        debug!(?notification, subscribers = self.subscribers.len(), "notifying");
        self.subscribers.retain(|tx| tx.send(notification).is_ok());
    }
}

/// Maps a finished process to a parse result or an error
fn interpret(request: &MatchRequest, output: &RawOutput) -> Result<ParseOutcome, EvaluationError> {
    if !output.success() {
        let stderr = output.stderr_text();
        if stderr.contains(COMPILE_ERROR_MARKER) {
            return Err(EvaluationError::regex_invalid(stderr, &request.pattern));
        }
        let message = if stderr.is_empty() {
            "evaluator exited without a diagnostic".to_string()
        } else {
            stderr
        };
        return Err(EvaluationError::Evaluator {
            status: output.status,
            message,
        });
    }

    if !output.stderr.is_empty() {
        debug!(stderr = %output.stderr_text(), "evaluator warnings");
    }

    let parser = ResultParser::new(request.mode, request.encoding, &request.subject);
    match parser.parse(&output.stdout)? {
        ParseOutcome::Rejected(message) => {
            Err(EvaluationError::regex_invalid(message, &request.pattern))
        }
        outcome => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::EvaluatorCommand;
    use crate::result_set::ResultState;
    use crate::version::EvaluatorVersion;

    fn output(stdout: &str, stderr: &str, status: Option<i32>) -> RawOutput {
        RawOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            status,
        }
    }

    #[test]
    fn test_interpret_success() {
        let request = MatchRequest::matching("a", "aa");
        let outcome = interpret(&request, &output("M\t0\t1\nD\t1\n", "", Some(0))).unwrap();
        assert!(matches!(outcome, ParseOutcome::Matches { ref matches, .. } if matches.len() == 1));
    }

    #[test]
    fn test_interpret_rejection_record() {
        let request = MatchRequest::matching("(", "a");
        let err = interpret(&request, &output("X\t20:Unmatched ( in regex\n", "", Some(0))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegexInvalid);
    }

    #[test]
    fn test_interpret_compile_error_on_stderr() {
        let request = MatchRequest::matching("(", "a").with_allow_code(true);
        let stderr = "Unmatched ( in regex; marked by <-- HERE in m/( <-- HERE / at /tmp/p.pl line 9.";
        let err = interpret(&request, &output("", stderr, Some(255))).unwrap_err();
        match err {
            EvaluationError::RegexInvalid { diagnostic, .. } => assert_eq!(diagnostic.position, Some(0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_interpret_abnormal_exit() {
        let request = MatchRequest::matching("a", "a");
        let err = interpret(&request, &output("M\t0\t1\n", "Out of memory!", Some(1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Evaluator);
        assert!(err.to_string().contains("Out of memory!"));

        let err = interpret(&request, &output("", "", None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Evaluator);
    }

    #[test]
    fn test_interpret_malformed_output() {
        let request = MatchRequest::matching("a", "a");
        let err = interpret(&request, &output("M\t0\t1\n", "", Some(0))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_build_failure_fails_without_process() {
        let mut session = Session::new(
            ProgramBuilder::new(EvaluatorVersion::MODERN),
            ProcessOrchestrator::new(EvaluatorCommand::new("perl"), None),
        );
        let notifications = session.subscribe();

        let request = MatchRequest::matching("a{", "a").with_allow_code(true);
        let err = session.start(request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(session.results().state(), ResultState::Failed);
        assert_eq!(session.results().error_kind(), Some(ErrorKind::Configuration));
        assert_eq!(
            notifications.try_recv().ok(),
            Some(Notification::Failed {
                request: None,
                kind: ErrorKind::Configuration
            })
        );
        assert!(notifications.try_recv().is_err());
    }

    #[test]
    fn test_interrupt_when_idle_is_a_no_op() {
        let mut session = Session::new(
            ProgramBuilder::new(EvaluatorVersion::MODERN),
            ProcessOrchestrator::new(EvaluatorCommand::new("perl"), None),
        );
        let notifications = session.subscribe();
        assert!(!session.interrupt());
        assert!(!session.interrupt());
        assert_eq!(session.results().state(), ResultState::Idle);
        assert!(notifications.try_recv().is_err());
        assert!(session.pump().is_none());
    }
}
