use anyhow::{Context, Result};
use rexhibit::cli::{parse_args, Action, Args, ColorChoice, EvaluateArgs, LiveArgs, OutputFormat, SubjectSource};
use rexhibit::config::{self, Config};
use rexhibit::error_helpers::{is_not_found, is_permission_denied, not_found_error, permission_error};
use rexhibit::logger;
use rexhibit::render::Renderer;
use rexhibit::{
    Encoding, EvaluatorCommand, EvaluatorVersion, MatchRequest, Notification, ProcessOrchestrator,
    ProgramBuilder, Session,
};
use std::fs;
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// How long live mode waits for input before polling the running evaluation
const LIVE_POLL: Duration = Duration::from_millis(20);

/// How often a blocking evaluation checks for a shutdown signal
const SIGNAL_POLL: Duration = Duration::from_millis(50);

fn main() -> Result<ExitCode> {
    let Args {
        evaluator,
        timeout,
        color,
        verbose,
        action,
    } = parse_args()?;

    // Editing must work even when the current file does not validate
    if let Action::Config { show } = action {
        edit_config(show)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = config::load_config()?;
    config::validate_config(&config).context("Invalid configuration in ~/.rexhibit/config.toml")?;
    let _log_guard = logger::init_logging(&config.logging, verbose)?;

    let color = color.unwrap_or_else(|| ColorChoice::from_config(config.display.color.as_deref()));
    let use_color = Renderer::should_use_color(color);
    colored::control::set_override(use_color);
    let renderer = Renderer::new(use_color).with_summary_lengths(
        config.display.match_summary_length.unwrap_or(rexhibit::outline::MATCH_SUMMARY_LENGTH),
        config.display.capture_summary_length.unwrap_or(rexhibit::outline::CAPTURE_SUMMARY_LENGTH),
    );

    let command = evaluator_command(evaluator.as_deref(), &config)?;
    let timeout = evaluation_timeout(timeout, &config)?;
    debug!(evaluator = %command, ?timeout, "evaluator configured");

    match action {
        Action::Version => show_version(&command),
        Action::Evaluate(eval) => {
            let version = evaluator_version(&command, &config)?;
            let shutdown = watch_shutdown()?;
            let mut session = Session::new(ProgramBuilder::new(version), ProcessOrchestrator::new(command, timeout));
            evaluate(eval, &mut session, &renderer, &config, &shutdown)
        }
        Action::Live(live) => {
            let version = evaluator_version(&command, &config)?;
            let shutdown = watch_shutdown()?;
            let mut session = Session::new(ProgramBuilder::new(version), ProcessOrchestrator::new(command, timeout));
            run_live(live, &mut session, &renderer, &config, &shutdown)
        }
        Action::Config { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn evaluator_command(override_path: Option<&str>, config: &Config) -> Result<EvaluatorCommand> {
    let path = match override_path {
        Some(path) => PathBuf::from(path),
        None => config.evaluator.resolve_path()?,
    };
    Ok(EvaluatorCommand::new(path).with_args(config.evaluator.args.iter().cloned()))
}

fn evaluation_timeout(flag: Option<f64>, config: &Config) -> Result<Option<Duration>> {
    match flag {
        Some(secs) if !(secs >= 0.0 && secs.is_finite()) => {
            anyhow::bail!("Invalid timeout: {} (must be 0 or positive)", secs)
        }
        Some(secs) if secs == 0.0 => Ok(None),
        Some(secs) => Ok(Some(Duration::from_secs_f64(secs))),
        None => Ok(config.evaluator.timeout()),
    }
}

fn evaluator_version(command: &EvaluatorCommand, config: &Config) -> Result<EvaluatorVersion> {
    if !config.evaluator.check_version.unwrap_or(true) {
        return Ok(EvaluatorVersion::MODERN);
    }
    let version = EvaluatorVersion::detect(command.program())?;
    if !version.is_supported() {
        anyhow::bail!(
            "perl {} is too old: rexhibit needs {} or newer",
            version,
            EvaluatorVersion::MINIMUM
        );
    }
    Ok(version)
}

fn show_version(command: &EvaluatorCommand) -> Result<ExitCode> {
    let version = EvaluatorVersion::detect(command.program())?;
    println!("rexhibit {}", env!("CARGO_PKG_VERSION"));
    println!("Evaluator: {}", command);
    println!("Perl version: {}", version);

    if !version.is_supported() {
        println!("⚠️  Perl {} or newer is required", EvaluatorVersion::MINIMUM);
        return Ok(ExitCode::FAILURE);
    }
    println!("  /u modifier: {}", if version.has_unicode_flag() { "yes" } else { "no" });
    println!("  Unicode strings: {}", if version.has_unicode_strings_feature() { "yes" } else { "no" });
    Ok(ExitCode::SUCCESS)
}

/// Raises a flag on SIGINT, SIGTERM or SIGHUP
///
/// Evaluators run in their own process group and do not see the terminal's
/// Ctrl-C, so the running evaluation is interrupted from here instead.
#[cfg(unix)]
fn watch_shutdown() -> Result<Arc<AtomicBool>> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let flag = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP]).context("Failed to install signal handlers")?;
    let raised = Arc::clone(&flag);
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "shutdown signal received");
            raised.store(true, Ordering::SeqCst);
        }
    });
    Ok(flag)
}

#[cfg(not(unix))]
fn watch_shutdown() -> Result<Arc<AtomicBool>> {
    Ok(Arc::new(AtomicBool::new(false)))
}

/// Runs `request` to its end, or interrupts it once `shutdown` is raised
fn evaluate_until_shutdown(session: &mut Session, request: MatchRequest, shutdown: &AtomicBool) -> Notification {
    let id = match session.start(request) {
        Ok(id) => id,
        Err(err) => {
            return Notification::Failed {
                request: None,
                kind: err.kind(),
            };
        }
    };
    loop {
        if shutdown.load(Ordering::SeqCst) && session.interrupt() {
            return Notification::Aborted { request: id };
        }
        if let Some(notification) = session.wait(SIGNAL_POLL) {
            return notification;
        }
    }
}

fn evaluate(
    eval: EvaluateArgs,
    session: &mut Session,
    renderer: &Renderer,
    config: &Config,
    shutdown: &AtomicBool,
) -> Result<ExitCode> {
    let subject = read_subject(&eval.subject)?;
    let format = eval.output;

    let mut request = MatchRequest::new(eval.mode, eval.pattern, subject).with_modifiers(eval.modifiers);
    if let Some(replacement) = eval.replacement {
        request = request.with_replacement(replacement);
    }
    let request = apply_defaults(request, config, eval.allow_code, eval.encoding)?;

    let notification = evaluate_until_shutdown(session, request, shutdown);
    debug!(?notification, "evaluation finished");

    let output = renderer.render(session.results_mut(), format)?;
    print!("{}", output);
    if format == OutputFormat::Json {
        println!();
    }

    Ok(match notification {
        Notification::Completed { .. } => ExitCode::SUCCESS,
        Notification::Aborted { .. } | Notification::Failed { .. } => ExitCode::FAILURE,
    })
}

/// Fills in what the command line left open from `[matching]`
fn apply_defaults(
    request: MatchRequest,
    config: &Config,
    allow_code: Option<bool>,
    encoding: Option<Encoding>,
) -> Result<MatchRequest> {
    let allow_code = allow_code.unwrap_or(config.matching.allow_code.unwrap_or(false));
    let encoding = match encoding {
        Some(encoding) => encoding,
        None => config.matching.encoding()?,
    };
    Ok(request
        .with_modifiers(config.matching.modifier_set()?)
        .with_allow_code(allow_code)
        .with_encoding(encoding))
}

fn read_subject(source: &SubjectSource) -> Result<String> {
    match source {
        SubjectSource::Text(text) => Ok(text.clone()),
        SubjectSource::File(path) => read_subject_file(path),
        SubjectSource::Stdin => {
            let mut subject = String::new();
            io::stdin()
                .read_to_string(&mut subject)
                .context("Failed to read subject text from stdin")?;
            Ok(subject)
        }
    }
}

fn read_subject_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| {
        if is_not_found(&err) {
            anyhow::anyhow!(not_found_error(path, "reading subject text"))
        } else if is_permission_denied(&err) {
            anyhow::anyhow!(permission_error(path, "reading"))
        } else {
            anyhow::Error::new(err).context(format!("Failed to read subject file: {}", path.display()))
        }
    })
}

/// Evaluates every stdin line as a pattern; a new line interrupts the previous one
fn run_live(
    live: LiveArgs,
    session: &mut Session,
    renderer: &Renderer,
    config: &Config,
    shutdown: &AtomicBool,
) -> Result<ExitCode> {
    let subject = read_subject_file(&live.file)?;

    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    eprintln!("Reading patterns from stdin, one per line (Ctrl-D to finish)");
    let mut input_open = true;
    while input_open || session.results().is_running() {
        if shutdown.load(Ordering::SeqCst) {
            session.interrupt();
            break;
        }
        if input_open {
            match rx.recv_timeout(LIVE_POLL) {
                Ok(pattern) if pattern.is_empty() => {}
                Ok(pattern) => {
                    let mut request = MatchRequest::new(live.mode, pattern, subject.clone())
                        .with_modifiers(live.modifiers.iter().copied());
                    if let Some(replacement) = &live.replacement {
                        request = request.with_replacement(replacement.clone());
                    }
                    let request = apply_defaults(request, config, None, None)?;
                    debug!(pattern = %request.pattern, "live pattern");
                    if session.start(request).is_err() {
                        print_live(session, renderer)?;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => input_open = false,
            }
            if session.pump().is_some() {
                print_live(session, renderer)?;
            }
        } else if session.wait(LIVE_POLL).is_some() {
            print_live(session, renderer)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_live(session: &mut Session, renderer: &Renderer) -> Result<()> {
    let pattern = session
        .results()
        .request()
        .map(|r| r.pattern.clone())
        .unwrap_or_default();
    println!("── /{}/ ──", pattern);
    print!("{}", renderer.render(session.results_mut(), OutputFormat::Highlight)?);
    Ok(())
}

/// Open the configuration file in an editor, or print it with `--show`
fn edit_config(show: bool) -> Result<()> {
    let path = config::config_file_path()?;
    if !path.exists() {
        config::save_default_config()?;
    }

    if show {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        print!("{}", content);
        return Ok(());
    }

    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());
    let mut parts = editor.split_whitespace();
    let program = parts.next().unwrap_or("vi");
    let status = std::process::Command::new(program)
        .args(parts)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to launch editor: {}", editor))?;
    if !status.success() {
        anyhow::bail!("Editor exited with {}", status);
    }

    // Parse directly so a broken edit is reported instead of replaced by defaults
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let edited: Config = toml::from_str(&content)
        .with_context(|| format!("Configuration is not valid TOML: {}", path.display()))?;
    config::validate_config(&edited)?;
    println!("✓ Configuration saved: {}", path.display());
    Ok(())
}
