//! Evaluator process lifecycle
//!
//! [`ProcessOrchestrator`] runs one evaluator program at a time. The calling
//! thread never blocks on the child: a writer thread feeds stdin, two reader
//! threads drain stdout and stderr, and a supervisor thread owns the
//! [`Child`] and reports how it ended as a [`ProcessEvent`].
//!
//! The child leads its own process group, and termination signals the whole
//! group, so anything the program forks dies with it.
//!
//! Every start gets a fresh [`RequestId`]. Events whose id is no longer the
//! current one are dropped when they are received, which is how a late exit
//! of an interrupted process is kept away from the next request.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::EvaluationError;

/// Tracing target for evaluator process operations
const PROCESS_TARGET: &str = "rexhibit::process";

/// How often the supervisor checks the child
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Time between the polite and the forced termination
pub const DEFAULT_GRACE: Duration = Duration::from_millis(200);

/// Executable and leading arguments used to run evaluator programs
///
/// The program file path is appended as the last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl EvaluatorCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for EvaluatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Identifies one started evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestratorState {
    #[default]
    Idle,
    /// Program file written, process being launched
    Starting,
    Running,
    /// Output received, being parsed
    Completing,
    /// Termination requested, waiting for the process to die
    Aborting,
}

/// Everything a finished evaluator produced
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` when the process was ended by a signal
    pub status: Option<i32>,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// How a supervised process ended
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// The process exited on its own
    Exited { request: RequestId, output: RawOutput },
    /// Running the process failed (timeout, I/O error)
    Failed {
        request: RequestId,
        error: EvaluationError,
    },
    /// The process was terminated on request
    Terminated { request: RequestId },
}

impl ProcessEvent {
    pub fn request(&self) -> RequestId {
        match self {
            ProcessEvent::Exited { request, .. }
            | ProcessEvent::Failed { request, .. }
            | ProcessEvent::Terminated { request } => *request,
        }
    }
}

/// Ownership of one running evaluator process
///
/// Dropping a handle without passing it to [`ProcessOrchestrator::interrupt`]
/// or [`ProcessOrchestrator::finish`] still terminates the process, in the
/// background.
#[derive(Debug)]
pub struct ProcessHandle {
    request: RequestId,
    pid: u32,
    cancel: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn join(mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            if supervisor.join().is_err() {
                warn!(target: PROCESS_TARGET, request = %self.request, "supervisor thread panicked");
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.supervisor.take().is_some() {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Runs evaluator programs, one at a time
#[derive(Debug)]
pub struct ProcessOrchestrator {
    command: EvaluatorCommand,
    timeout: Option<Duration>,
    grace: Duration,
    state: OrchestratorState,
    current: Option<RequestId>,
    next_request: u64,
    events_tx: Sender<ProcessEvent>,
    events_rx: Receiver<ProcessEvent>,
}

impl ProcessOrchestrator {
    /// `timeout` bounds the run time of each process; `None` waits forever
    pub fn new(command: EvaluatorCommand, timeout: Option<Duration>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            command,
            timeout,
            grace: DEFAULT_GRACE,
            state: OrchestratorState::Idle,
            current: None,
            next_request: 1,
            events_tx,
            events_rx,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn command(&self) -> &EvaluatorCommand {
        &self.command
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Request whose events are currently accepted
    pub fn current_request(&self) -> Option<RequestId> {
        self.current
    }

    /// Launches `program_text` and feeds it `stdin_payload`
    ///
    /// Only valid while idle; interrupt or finish the previous process first.
    pub fn start(
        &mut self,
        program_text: &str,
        stdin_payload: Vec<u8>,
    ) -> Result<ProcessHandle, EvaluationError> {
        if self.state != OrchestratorState::Idle {
            return Err(EvaluationError::configuration(format!(
                "cannot start while the previous evaluation is {:?}",
                self.state
            )));
        }

        let request = RequestId(self.next_request);
        self.next_request += 1;
        self.state = OrchestratorState::Starting;

        match self.launch(request, program_text, stdin_payload) {
            Ok(handle) => {
                self.current = Some(request);
                self.state = OrchestratorState::Running;
                Ok(handle)
            }
            Err(err) => {
                self.state = OrchestratorState::Idle;
                Err(err)
            }
        }
    }

    fn launch(
        &self,
        request: RequestId,
        program_text: &str,
        stdin_payload: Vec<u8>,
    ) -> Result<ProcessHandle, EvaluationError> {
        let command_line = self.command.to_string();
        let spawn_failure = |message: String, source: Option<io::Error>| EvaluationError::Spawn {
            command: command_line.clone(),
            message,
            source: source.map(Arc::new),
        };

        let mut program_file = tempfile::Builder::new()
            .prefix("rexhibit-")
            .suffix(".pl")
            .tempfile()
            .map_err(|e| spawn_failure(format!("cannot create program file: {}", e), Some(e)))?;
        program_file
            .write_all(program_text.as_bytes())
            .and_then(|()| program_file.flush())
            .map_err(|e| spawn_failure(format!("cannot write program file: {}", e), Some(e)))?;

        debug!(
            target: PROCESS_TARGET,
            %request,
            command = %command_line,
            program = %program_file.path().display(),
            bytes = stdin_payload.len(),
            "spawning evaluator"
        );

        let mut command = Command::new(self.command.program());
        command
            .args(self.command.args())
            .arg(program_file.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| {
                let message = crate::error_helpers::spawn_error(self.command.program(), &e);
                spawn_failure(message, Some(e))
            })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            terminate(&mut child, Duration::ZERO);
            return Err(spawn_failure("failed to capture evaluator stdio".to_string(), None));
        };

        let writer = thread::spawn(move || write_payload(stdin, &stdin_payload));
        let stdout_reader = thread::spawn(move || drain(stdout));
        let stderr_reader = thread::spawn(move || drain(stderr));

        let cancel = Arc::new(AtomicBool::new(false));
        let supervision = Supervision {
            request,
            child,
            program_file,
            cancel: Arc::clone(&cancel),
            timeout: self.timeout,
            grace: self.grace,
            events: self.events_tx.clone(),
            writer,
            stdout_reader,
            stderr_reader,
        };

        // The child is handed over only once the thread exists, so a failed
        // thread start can still reap it here
        let (handoff_tx, handoff_rx) = mpsc::sync_channel::<Supervision>(1);
        let spawned = thread::Builder::new()
            .name(format!("evaluator-{}", request.get()))
            .spawn(move || {
                if let Ok(supervision) = handoff_rx.recv() {
                    supervision.run();
                }
            });
        let supervisor = match spawned {
            Ok(supervisor) => supervisor,
            Err(e) => {
                supervision.abandon();
                return Err(spawn_failure(format!("cannot start supervisor thread: {}", e), Some(e)));
            }
        };
        if let Err(mpsc::SendError(supervision)) = handoff_tx.send(supervision) {
            supervision.abandon();
            let _ = supervisor.join();
            return Err(spawn_failure("supervisor thread exited early".to_string(), None));
        }

        info!(target: PROCESS_TARGET, %request, pid, "evaluator running");
        Ok(ProcessHandle {
            request,
            pid,
            cancel,
            supervisor: Some(supervisor),
        })
    }

    /// Terminates the process behind `handle` and waits until it is gone
    ///
    /// Returns `false` without doing anything when `handle` is not the
    /// running request.
    pub fn interrupt(&mut self, handle: ProcessHandle) -> bool {
        let request = handle.request();
        if self.current != Some(request)
            || !matches!(
                self.state,
                OrchestratorState::Running | OrchestratorState::Completing
            )
        {
            debug!(target: PROCESS_TARGET, %request, "interrupt ignored, not running");
            return false;
        }

        self.state = OrchestratorState::Aborting;
        handle.cancel.store(true, Ordering::SeqCst);
        handle.join();

        self.current = None;
        self.state = OrchestratorState::Idle;
        info!(target: PROCESS_TARGET, %request, "evaluator interrupted");
        true
    }

    /// Next event for the current request, without blocking
    pub fn try_next_event(&mut self) -> Option<ProcessEvent> {
        while let Ok(event) = self.events_rx.try_recv() {
            if self.is_current(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Next event for the current request, waiting up to `timeout`
    pub fn next_event_timeout(&mut self, timeout: Duration) -> Option<ProcessEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events_rx.recv_timeout(remaining) {
                Ok(event) if self.is_current(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn is_current(&self, event: &ProcessEvent) -> bool {
        let current = self.current == Some(event.request());
        if !current {
            debug!(target: PROCESS_TARGET, request = %event.request(), "discarding stale event");
        }
        current
    }

    /// Marks the output of `request` as being parsed
    pub fn begin_completion(&mut self, request: RequestId) -> bool {
        if self.current == Some(request) && self.state == OrchestratorState::Running {
            self.state = OrchestratorState::Completing;
            true
        } else {
            false
        }
    }

    /// Releases a process whose event has been received and returns to idle
    pub fn finish(&mut self, handle: ProcessHandle) {
        let request = handle.request();
        handle.join();
        if self.current == Some(request) {
            self.current = None;
            self.state = OrchestratorState::Idle;
        }
        debug!(target: PROCESS_TARGET, %request, "evaluator released");
    }
}

/// State moved into the supervisor thread
struct Supervision {
    request: RequestId,
    child: Child,
    /// Deleted once the process is gone
    program_file: NamedTempFile,
    cancel: Arc<AtomicBool>,
    timeout: Option<Duration>,
    grace: Duration,
    events: Sender<ProcessEvent>,
    writer: JoinHandle<()>,
    stdout_reader: JoinHandle<io::Result<Vec<u8>>>,
    stderr_reader: JoinHandle<io::Result<Vec<u8>>>,
}

impl Supervision {
    fn run(self) {
        let Supervision {
            request,
            mut child,
            program_file,
            cancel,
            timeout,
            grace,
            events,
            writer,
            stdout_reader,
            stderr_reader,
        } = self;
        let started = Instant::now();
        let pid = child.id();
        let interrupted = || Interruption::check(&cancel, started, timeout);

        // Ok: natural exit with its code; Err: the event to report instead
        let ended: Result<Option<i32>, ProcessEvent> = loop {
            if let Some(interruption) = interrupted() {
                terminate(&mut child, grace);
                break Err(interruption.into_event(request));
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(
                        target: PROCESS_TARGET,
                        %request,
                        ?status,
                        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "evaluator exited"
                    );
                    break Ok(status.code());
                }
                Ok(None) => {}
                Err(err) => {
                    terminate(&mut child, Duration::ZERO);
                    break Err(ProcessEvent::Failed {
                        request,
                        error: EvaluationError::Evaluator {
                            status: None,
                            message: format!("cannot observe evaluator process: {}", err),
                        },
                    });
                }
            }

            thread::sleep(POLL_INTERVAL);
        };

        // Processes forked by the program can hold the pipes open after the
        // child itself exited, so interruption is still honoured here
        let event = match ended {
            Ok(status) => loop {
                if writer.is_finished() && stdout_reader.is_finished() && stderr_reader.is_finished() {
                    let _ = writer.join();
                    break collect(request, status, stdout_reader, stderr_reader);
                }
                if let Some(interruption) = interrupted() {
                    debug!(target: PROCESS_TARGET, %request, "evaluator left processes behind");
                    terminate_group(pid, grace, || {
                        stdout_reader.is_finished() && stderr_reader.is_finished()
                    });
                    break interruption.into_event(request);
                }
                thread::sleep(POLL_INTERVAL);
            },
            // Readers of a terminated process are left to finish on their own
            Err(event) => event,
        };

        drop(program_file);
        // The receiver is gone only when the orchestrator was dropped
        let _ = events.send(event);
    }

    /// Kills and reaps a child that never got a supervisor
    fn abandon(mut self) {
        warn!(target: PROCESS_TARGET, request = %self.request, "abandoning evaluator without supervision");
        terminate(&mut self.child, Duration::ZERO);
    }
}

/// Why supervision stopped waiting for the evaluator
#[derive(Debug, Clone, Copy)]
enum Interruption {
    Cancelled,
    TimedOut(Duration),
}

impl Interruption {
    fn check(cancel: &AtomicBool, started: Instant, timeout: Option<Duration>) -> Option<Self> {
        if cancel.load(Ordering::SeqCst) {
            return Some(Interruption::Cancelled);
        }
        match timeout {
            Some(timeout) if started.elapsed() > timeout => Some(Interruption::TimedOut(timeout)),
            _ => None,
        }
    }

    fn into_event(self, request: RequestId) -> ProcessEvent {
        match self {
            Interruption::Cancelled => ProcessEvent::Terminated { request },
            Interruption::TimedOut(timeout) => {
                warn!(
                    target: PROCESS_TARGET,
                    %request,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "evaluator timed out, terminated"
                );
                ProcessEvent::Failed {
                    request,
                    error: EvaluationError::Evaluator {
                        status: None,
                        message: format!(
                            "evaluation exceeded the time limit of {:.1}s",
                            timeout.as_secs_f64()
                        ),
                    },
                }
            }
        }
    }
}

/// Gathers the reader threads after a natural exit
fn collect(
    request: RequestId,
    status: Option<i32>,
    stdout_reader: JoinHandle<io::Result<Vec<u8>>>,
    stderr_reader: JoinHandle<io::Result<Vec<u8>>>,
) -> ProcessEvent {
    match (join_reader(stdout_reader), join_reader(stderr_reader)) {
        (Ok(stdout), Ok(stderr)) => ProcessEvent::Exited {
            request,
            output: RawOutput {
                stdout,
                stderr,
                status,
            },
        },
        (Err(err), _) | (_, Err(err)) => ProcessEvent::Failed {
            request,
            error: EvaluationError::Evaluator {
                status,
                message: format!("cannot read evaluator output: {}", err),
            },
        },
    }
}

fn join_reader(reader: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    reader
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")))
}

/// Writes the payload and closes stdin
fn write_payload(mut stdin: impl Write, payload: &[u8]) {
    let result = stdin.write_all(payload).and_then(|()| stdin.flush());
    match result {
        Ok(()) => {}
        // The evaluator may exit before reading everything
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
        Err(err) => warn!(target: PROCESS_TARGET, error = %err, "failed to write evaluator input"),
    }
}

fn drain(mut pipe: impl Read) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    pipe.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Asks the child's process group to stop, then kills it once `grace` has passed
fn terminate(child: &mut Child, grace: Duration) {
    let pid = child.id();
    if !grace.is_zero() && signal_group(pid, Stop::Polite) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(_) => break,
            }
        }
    }
    signal_group(pid, Stop::Forced);
    let _ = child.kill();
    let _ = child.wait();
}

/// Like [`terminate`], for a group whose leader has already been reaped
fn terminate_group(pid: u32, grace: Duration, drained: impl Fn() -> bool) {
    if !grace.is_zero() && signal_group(pid, Stop::Polite) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !drained() {
            thread::sleep(POLL_INTERVAL);
        }
    }
    signal_group(pid, Stop::Forced);
}

#[derive(Debug, Clone, Copy)]
enum Stop {
    Polite,
    Forced,
}

/// Signals every process in the group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, stop: Stop) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let signal = match stop {
        Stop::Polite => libc::SIGTERM,
        Stop::Forced => libc::SIGKILL,
    };
    // SAFETY: `kill` touches no memory of ours. The child was spawned as
    // leader of group `pid`, and the group id stays reserved while any of
    // its members is alive.
    unsafe { libc::kill(-pid, signal) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _stop: Stop) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display() {
        let command = EvaluatorCommand::new("/usr/bin/perl").with_args(["-CS", "-w"]);
        assert_eq!(command.to_string(), "/usr/bin/perl -CS -w");
        assert_eq!(command.args(), ["-CS", "-w"]);
    }

    #[test]
    fn test_raw_output_success() {
        let output = RawOutput {
            status: Some(0),
            ..RawOutput::default()
        };
        assert!(output.success());
        assert!(!RawOutput::default().success());
    }

    #[test]
    fn test_event_request() {
        let event = ProcessEvent::Terminated {
            request: RequestId(7),
        };
        assert_eq!(event.request(), RequestId(7));
        assert_eq!(RequestId(7).to_string(), "#7");
    }

    #[test]
    fn test_spawn_failure_returns_to_idle() {
        let mut orchestrator = ProcessOrchestrator::new(
            EvaluatorCommand::new("/nonexistent/rexhibit-evaluator"),
            None,
        );
        let err = orchestrator.start("print 1;", Vec::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Spawn);
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        assert!(orchestrator.current_request().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_abandoned_child_is_killed_and_reaped() {
        use std::os::unix::process::CommandExt;

        let mut child = Command::new("sh")
            .args(["-c", "exec sleep 10"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = libc::pid_t::try_from(child.id()).unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        let (events, _events_rx) = mpsc::channel();

        let supervision = Supervision {
            request: RequestId(1),
            child,
            program_file: NamedTempFile::new().unwrap(),
            cancel: Arc::new(AtomicBool::new(false)),
            timeout: None,
            grace: DEFAULT_GRACE,
            events,
            writer: thread::spawn(move || write_payload(stdin, b"")),
            stdout_reader: thread::spawn(move || drain(stdout)),
            stderr_reader: thread::spawn(move || drain(stderr)),
        };
        supervision.abandon();

        // SAFETY: signal 0 only checks whether the pid still exists
        let exists = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!exists, "abandoned evaluator {} is still around", pid);
    }

    #[test]
    fn test_stale_events_are_discarded() {
        let mut orchestrator = ProcessOrchestrator::new(EvaluatorCommand::new("perl"), None);
        orchestrator
            .events_tx
            .send(ProcessEvent::Terminated {
                request: RequestId(99),
            })
            .unwrap();
        assert!(orchestrator.try_next_event().is_none());
    }
}
