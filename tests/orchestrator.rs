//! Process lifecycle tests driven by `sh` scripts standing in for perl
//!
//! The generated program file is appended to the command line as usual; the
//! scripts ignore it and print canned records.

#![cfg(unix)]

use std::time::{Duration, Instant};

use rexhibit::process::OrchestratorState;
use rexhibit::{
    ErrorKind, EvaluationError, EvaluatorCommand, EvaluatorVersion, MatchRequest, Notification,
    ProcessEvent, ProcessOrchestrator, ProgramBuilder, ResultState, Session,
};

fn fake_evaluator(script: &str) -> EvaluatorCommand {
    EvaluatorCommand::new("sh").with_args(["-c", script, "fake-perl"])
}

fn session_with(script: &str, timeout: Option<Duration>) -> Session {
    let orchestrator = ProcessOrchestrator::new(fake_evaluator(script), timeout)
        .with_grace(Duration::from_millis(100));
    Session::new(ProgramBuilder::new(EvaluatorVersion::MODERN), orchestrator)
}

#[test]
fn test_orchestrator_feeds_stdin_and_collects_output() {
    let mut orchestrator = ProcessOrchestrator::new(EvaluatorCommand::new("sh"), None);
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);

    let handle = orchestrator.start("cat; echo oops >&2", b"hello".to_vec()).unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::Running);
    assert_eq!(orchestrator.current_request(), Some(handle.request()));

    let event = orchestrator
        .next_event_timeout(Duration::from_secs(10))
        .expect("evaluator should exit");
    assert_eq!(event.request(), handle.request());
    let ProcessEvent::Exited { output, .. } = event else {
        panic!("expected an exit, got {:?}", event);
    };
    assert!(output.success());
    assert_eq!(output.stdout, b"hello");
    assert_eq!(output.stderr_text(), "oops");

    assert!(orchestrator.begin_completion(handle.request()));
    assert_eq!(orchestrator.state(), OrchestratorState::Completing);
    orchestrator.finish(handle);
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    assert_eq!(orchestrator.current_request(), None);
}

#[test]
fn test_orchestrator_refuses_second_start() {
    let mut orchestrator = ProcessOrchestrator::new(EvaluatorCommand::new("sh"), None);
    let handle = orchestrator.start("exec sleep 10", Vec::new()).unwrap();
    let err = orchestrator.start("true", Vec::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(orchestrator.interrupt(handle));
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
}

#[test]
fn test_completed_evaluation() {
    let mut session = session_with(r#"printf 'M\t1\t3\nC\t1\t2\nD\t1\n'"#, None);
    let notifications = session.subscribe();

    let notification = session.evaluate(MatchRequest::matching("(b)c", "abcd"));
    let Notification::Completed { request } = notification else {
        panic!("expected completion, got {:?}", notification);
    };

    let results = session.results();
    assert_eq!(results.state(), ResultState::Succeeded);
    assert_eq!(results.request_id(), Some(request));
    assert_eq!(results.match_count(), 1);
    let m = results.match_at(0).unwrap();
    assert_eq!(m.text(), "bc");
    assert_eq!(m.capture(1).map(|c| c.text()), Some("b"));

    // Exactly one notification per request
    let received: Vec<_> = notifications.try_iter().collect();
    assert_eq!(received, vec![Notification::Completed { request }]);
}

#[test]
fn test_interrupt_before_output() {
    let mut session = session_with("exec sleep 10", None);
    let notifications = session.subscribe();

    let request = session.start(MatchRequest::matching("a", "aaa")).unwrap();
    assert!(session.results().is_running());

    let started = Instant::now();
    assert!(session.interrupt());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(session.results().state(), ResultState::Aborted);
    assert_eq!(session.results().match_count(), 0);
    assert!(session.wait(Duration::from_millis(200)).is_none());
    assert!(!session.interrupt());

    let received: Vec<_> = notifications.try_iter().collect();
    assert_eq!(received, vec![Notification::Aborted { request }]);
}

#[test]
fn test_stale_exit_is_discarded() {
    let mut session = session_with(r#"printf 'M\t0\t1\nD\t1\n'"#, None);
    let notifications = session.subscribe();

    let first = session.start(MatchRequest::matching("a", "abc")).unwrap();
    // Let the first evaluator finish without collecting its output
    std::thread::sleep(Duration::from_millis(300));

    let notification = session.evaluate(MatchRequest::matching("x", "xyz"));
    let Notification::Completed { request: second } = notification else {
        panic!("expected completion, got {:?}", notification);
    };
    assert_ne!(first, second);

    let results = session.results();
    assert_eq!(results.request_id(), Some(second));
    assert_eq!(results.match_count(), 1);
    assert_eq!(results.match_at(0).map(|m| m.text()), Some("x"));

    let received: Vec<_> = notifications.try_iter().collect();
    assert_eq!(
        received,
        vec![
            Notification::Aborted { request: first },
            Notification::Completed { request: second },
        ]
    );
}

#[test]
fn test_spawn_failure() {
    let orchestrator = ProcessOrchestrator::new(EvaluatorCommand::new("/nonexistent/rexhibit-perl"), None);
    let mut session = Session::new(ProgramBuilder::new(EvaluatorVersion::MODERN), orchestrator);
    let notifications = session.subscribe();

    let err = session.start(MatchRequest::matching("a", "a")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Spawn);
    assert!(err.to_string().contains("/nonexistent/rexhibit-perl"));
    assert_eq!(session.results().state(), ResultState::Failed);
    assert!(!session.results().is_running());

    let received: Vec<_> = notifications.try_iter().collect();
    assert_eq!(
        received,
        vec![Notification::Failed {
            request: None,
            kind: ErrorKind::Spawn
        }]
    );
}

#[test]
fn test_timeout_fails_evaluation() {
    let mut session = session_with("exec sleep 10", Some(Duration::from_millis(300)));

    let started = Instant::now();
    let notification = session.evaluate(MatchRequest::matching("(a+)+$", "aaaaaaaaaaaaaaaaaaaaaaaab"));
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(matches!(
        notification,
        Notification::Failed {
            request: Some(_),
            kind: ErrorKind::Evaluator
        }
    ));
    let error = session.results().error().unwrap();
    assert!(error.to_string().contains("time limit"));
}

#[test]
fn test_compile_error_on_stderr_is_regex_invalid() {
    let script = "echo 'Unmatched ( in regex; marked by <-- HERE in m/a( <-- HERE / at prog.pl line 3.' >&2; exit 255";
    let mut session = session_with(script, None);

    let request = MatchRequest::matching("a(", "a").with_allow_code(true);
    let notification = session.evaluate(request);
    assert!(matches!(
        notification,
        Notification::Failed {
            kind: ErrorKind::RegexInvalid,
            ..
        }
    ));
    match session.results().error() {
        Some(EvaluationError::RegexInvalid { diagnostic, .. }) => {
            assert_eq!(diagnostic.position, Some(1));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_malformed_output_is_parse_error() {
    let mut session = session_with(r#"printf 'M\t0\t1\n'"#, None);
    let notification = session.evaluate(MatchRequest::matching("a", "a"));
    assert!(matches!(
        notification,
        Notification::Failed {
            kind: ErrorKind::Parse,
            ..
        }
    ));
    assert_eq!(session.results().match_count(), 0);
}

#[test]
fn test_abnormal_exit_is_evaluator_error() {
    let mut session = session_with("echo 'Out of memory!' >&2; exit 1", None);
    let notification = session.evaluate(MatchRequest::matching("a", "a"));
    assert!(matches!(
        notification,
        Notification::Failed {
            kind: ErrorKind::Evaluator,
            ..
        }
    ));
    assert!(session.results().error().unwrap().to_string().contains("Out of memory!"));
}

#[test]
fn test_interrupt_does_not_wait_for_forked_processes() {
    let mut session = session_with("sleep 6 & exit 0", None);
    let request = session.start(MatchRequest::matching("a", "a")).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    assert!(session.interrupt());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.results().state(), ResultState::Aborted);
    assert_eq!(session.results().request_id(), Some(request));
}

#[test]
fn test_timeout_covers_forked_processes() {
    let mut session = session_with("sleep 6 & exit 0", Some(Duration::from_millis(300)));

    let started = Instant::now();
    let notification = session.evaluate(MatchRequest::matching("a", "a"));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(
        notification,
        Notification::Failed {
            request: Some(_),
            kind: ErrorKind::Evaluator
        }
    ));
    assert!(session.results().error().unwrap().to_string().contains("time limit"));
}

#[test]
fn test_output_of_forked_process_is_collected() {
    let script = r#"(sleep 0.2; printf 'M\t0\t1\nD\t1\n') & exit 0"#;
    let mut session = session_with(script, Some(Duration::from_secs(10)));
    let notification = session.evaluate(MatchRequest::matching("a", "a"));
    assert!(matches!(notification, Notification::Completed { .. }), "{:?}", notification);
    assert_eq!(session.results().match_count(), 1);
}

#[test]
fn test_interrupt_stops_the_whole_process_group() {
    let marker = tempfile::NamedTempFile::new().unwrap();
    let path = marker.path().to_path_buf();
    drop(marker);

    // The forked child would create the marker file if it outlived the interrupt
    let script = format!("(sleep 1; touch '{}') & wait", path.display());
    let mut session = session_with(&script, None);
    session.start(MatchRequest::matching("a", "a")).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(session.interrupt());

    std::thread::sleep(Duration::from_millis(1500));
    assert!(!path.exists());
}
