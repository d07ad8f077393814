use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::request::{Encoding, Mode, Modifier};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "

Evaluator: perl 5.8 or newer
Rust Edition: 2024"
);

#[derive(Parser)]
#[command(name = "rexhibit")]
#[command(about = "Test Perl regular expressions against sample text")]
#[command(long_about = "rexhibit runs a regular expression against sample text and shows
every match, capture group, replacement and split segment.

Matching is done by perl itself, so the results are exactly what a Perl
program would see. Patterns are passed to perl as data; they can only run
code when --allow-code is given.

SUBJECT TEXT:
  --text TEXT     Use TEXT as the subject
  --file PATH     Read the subject from PATH
  (neither)       Read the subject from stdin

MODIFIERS:
  -g  find all matches        -s  . matches newline
  -i  case insensitive        -m  ^ and $ match at line breaks
  -x  extended whitespace     -u  Unicode rules

EXAMPLES:
  rexhibit match -g 'a+' --text 'aaa bb aa'          Every run of a's
  rexhibit match '(\\w+)@(\\w+)' --file mail.txt      Captures of the first match
  rexhibit replace -g '(\\w+)@(\\w+)' '$2 at $1' --file mail.txt
  rexhibit split ',' --text 'x,y,,z'                 Split segments
  echo 'abc' | rexhibit match --json 'b'             Machine-readable output
  rexhibit live --file notes.txt                     One pattern per stdin line")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_version = LONG_VERSION)]
#[command(propagate_version = true)]
struct Cli {
    /// Perl executable to use instead of the configured one
    #[arg(long, global = true, value_name = "PATH")]
    evaluator: Option<String>,

    /// Stop evaluations after SECS seconds (0 = never)
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<f64>,

    /// Colored output: auto, always or never
    #[arg(long, global = true, value_name = "WHEN")]
    color: Option<String>,

    /// Log engine activity at debug level
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every evaluating subcommand
#[derive(clap::Args, Debug)]
struct EvalOptions {
    /// Subject text
    #[arg(long, conflicts_with = "file", value_name = "TEXT")]
    text: Option<String>,

    /// Read the subject from a file
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Find all matches
    #[arg(short = 'g', long = "global")]
    find_all: bool,

    /// Case insensitive
    #[arg(short = 'i', long = "ignore-case")]
    case_insensitive: bool,

    /// Ignore whitespace and comments in the pattern
    #[arg(short = 'x', long = "extended")]
    extended: bool,

    /// Let . match a newline
    #[arg(short = 's', long = "dot-all")]
    dot_all: bool,

    /// Let ^ and $ match at line breaks
    #[arg(short = 'm', long = "multiline")]
    multiline: bool,

    /// Unicode rules for classes and case folding
    #[arg(short = 'u', long = "unicode")]
    unicode: bool,

    #[arg(long)]
    #[arg(help ="Let the pattern and replacement run Perl code\n⚠️  Only use with patterns you trust")]
    allow_code: bool,

    /// Match raw bytes instead of characters
    #[arg(long)]
    bytes: bool,

    /// Print results as JSON
    #[arg(long, conflicts_with = "outline")]
    json: bool,

    /// Print the result tree
    #[arg(long)]
    outline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the matches of a pattern
    #[command(long_about = "Show the matches of PATTERN and their capture groups.

Without -g only the first match is reported.

EXAMPLES:
  rexhibit match 'b+' --text 'abbbc'
  rexhibit match -gi 'the' --file book.txt
  rexhibit match --outline '(a)|(b)' --text 'b'")]
    Match {
        /// Regular expression, in Perl syntax
        #[arg(value_name = "PATTERN")]
        pattern: String,

        #[command(flatten)]
        options: EvalOptions,
    },

    /// Replace matches of a pattern
    #[command(long_about = "Replace matches of PATTERN with REPLACEMENT.

The replacement understands $1..$N, ${N}, $& (the whole match), \\n and \\t.
With --allow-code it is a Perl double-quoted string instead.

EXAMPLES:
  rexhibit replace -g 'o' '0' --text 'foo boo'
  rexhibit replace '(\\w+) (\\w+)' '$2 $1' --text 'hello world'")]
    Replace {
        /// Regular expression, in Perl syntax
        #[arg(value_name = "PATTERN")]
        pattern: String,

        /// Replacement template
        #[arg(value_name = "REPLACEMENT")]
        replacement: String,

        #[command(flatten)]
        options: EvalOptions,
    },

    /// Split text on a pattern
    #[command(long_about = "Split the subject on PATTERN, like Perl's split.

Captured groups in PATTERN are kept as segments; trailing empty segments
are dropped.

EXAMPLES:
  rexhibit split ',' --text 'x,y,,z'
  rexhibit split '\\s*;\\s*' --file list.txt")]
    Split {
        /// Regular expression, in Perl syntax
        #[arg(value_name = "PATTERN")]
        pattern: String,

        #[command(flatten)]
        options: EvalOptions,
    },

    /// Re-evaluate as patterns are typed
    #[command(long_about = "Read patterns from stdin, one per line, and evaluate each
against the subject file.

A new line interrupts the evaluation still running for the previous
one, so slow patterns never hold up the next attempt.

EXAMPLES:
  rexhibit live --file notes.txt
  rexhibit live --mode replace --replacement '[$&]' --file notes.txt")]
    Live {
        /// Subject file
        #[arg(long, value_name = "PATH")]
        file: PathBuf,

        /// match, replace or split
        #[arg(long, default_value = "match")]
        mode: String,

        /// Replacement template for replace mode
        #[arg(long, value_name = "REPLACEMENT")]
        replacement: Option<String>,

        /// Modifier letters, e.g. gi
        #[arg(long, value_name = "LETTERS")]
        modifiers: Option<String>,
    },

    /// Show the evaluator and its version
    Version,

    /// Edit configuration file
    #[command(long_about = "Open configuration file in text editor.

Opens the rexhibit configuration file (~/.rexhibit/config.toml) in your
default editor ($VISUAL, then $EDITOR, then vi). If the file doesn't exist,
a default one will be created. After the editor exits the configuration
is validated and any errors are displayed.

CONFIGURATION OPTIONS:
  [evaluator]
    path = \"/usr/bin/perl\"       # Perl executable (default: from PATH)
    args = []                    # Extra perl arguments
    timeout_secs = 10            # Run-time limit, 0 = none
    check_version = true         # Refuse perl older than 5.8

  [matching]
    encoding = \"utf8\"            # utf8 or bytes
    allow_code = false           # Allow (?{ ... }) and friends
    modifiers = \"g\"              # Default modifier letters

  [display]
    match_summary_length = 40    # Outline preview lengths
    capture_summary_length = 30
    color = \"auto\"               # auto, always or never

  [logging]
    filter = \"warn\"              # tracing filter (RUST_LOG wins)
    log_file = \"/tmp/rx.log\"     # Log to a file (optional)

EXAMPLES:
  rexhibit config                 Edit configuration
  rexhibit config --show          Show current configuration")]
    Config {
        /// Show current configuration without editing
        #[arg(long = "show")]
        show: bool,
    },
}

pub fn parse_args() -> Result<Args> {
    let cli = Cli::parse();

    let action = match cli.command {
        Commands::Match { pattern, options } => {
            Action::Evaluate(options.into_evaluate(Mode::Match, pattern, None))
        }
        Commands::Replace {
            pattern,
            replacement,
            options,
        } => Action::Evaluate(options.into_evaluate(Mode::Replace, pattern, Some(replacement))),
        Commands::Split { pattern, options } => {
            Action::Evaluate(options.into_evaluate(Mode::Split, pattern, None))
        }
        Commands::Live {
            file,
            mode,
            replacement,
            modifiers,
        } => {
            let mode = parse_mode(&mode)?;
            let modifiers = modifiers
                .as_deref()
                .map(parse_modifier_letters)
                .transpose()?
                .unwrap_or_default();
            if mode == Mode::Replace && replacement.is_none() {
                anyhow::bail!("Missing replacement. Usage: rexhibit live --mode replace --replacement R --file PATH");
            }
            Action::Live(LiveArgs {
                file,
                mode,
                replacement,
                modifiers,
            })
        }
        Commands::Version => Action::Version,
        Commands::Config { show } => Action::Config { show },
    };

    let color = cli
        .color
        .as_deref()
        .map(parse_color)
        .transpose()?;

    Ok(Args {
        evaluator: cli.evaluator,
        timeout: cli.timeout,
        color,
        verbose: cli.verbose,
        action,
    })
}

impl EvalOptions {
    fn into_evaluate(self, mode: Mode, pattern: String, replacement: Option<String>) -> EvaluateArgs {
        let modifiers = [
            (self.find_all, Modifier::FindAll),
            (self.case_insensitive, Modifier::CaseInsensitive),
            (self.extended, Modifier::ExtendedWhitespace),
            (self.dot_all, Modifier::DotMatchesNewline),
            (self.multiline, Modifier::Multiline),
            (self.unicode, Modifier::Unicode),
        ]
        .into_iter()
        .filter_map(|(set, modifier)| set.then_some(modifier))
        .collect();

        let subject = match (self.text, self.file) {
            (Some(text), _) => SubjectSource::Text(text),
            (None, Some(path)) => SubjectSource::File(path),
            (None, None) => SubjectSource::Stdin,
        };

        let output = if self.json {
            OutputFormat::Json
        } else if self.outline {
            OutputFormat::Outline
        } else {
            OutputFormat::Highlight
        };

        EvaluateArgs {
            mode,
            pattern,
            replacement,
            subject,
            modifiers,
            // Flags only ever switch these on; config supplies the default
            allow_code: self.allow_code.then_some(true),
            encoding: self.bytes.then_some(Encoding::Bytes),
            output,
        }
    }
}

fn parse_mode(mode: &str) -> Result<Mode> {
    match mode {
        "match" => Ok(Mode::Match),
        "replace" => Ok(Mode::Replace),
        "split" => Ok(Mode::Split),
        other => anyhow::bail!("Invalid mode: {} (must be 'match', 'replace', or 'split')", other),
    }
}

/// Parses letters such as `gi` into modifiers
pub fn parse_modifier_letters(letters: &str) -> Result<Vec<Modifier>> {
    letters
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| {
            c.to_string()
                .parse::<Modifier>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid modifier letters: {}", letters))
        })
        .collect()
}

fn parse_color(when: &str) -> Result<ColorChoice> {
    match when {
        "auto" => Ok(ColorChoice::Auto),
        "always" => Ok(ColorChoice::Always),
        "never" => Ok(ColorChoice::Never),
        other => anyhow::bail!("Invalid color: {} (must be 'auto', 'always', or 'never')", other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    /// Parses the `[display] color` value, treating unknown values as auto
    pub fn from_config(value: Option<&str>) -> Self {
        value.and_then(|v| parse_color(v).ok()).unwrap_or(ColorChoice::Auto)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectSource {
    Text(String),
    File(PathBuf),
    Stdin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colored subject with matches marked
    Highlight,
    Json,
    Outline,
}

#[derive(Debug)]
pub struct EvaluateArgs {
    pub mode: Mode,
    pub pattern: String,
    pub replacement: Option<String>,
    pub subject: SubjectSource,
    pub modifiers: Vec<Modifier>,
    pub allow_code: Option<bool>,
    pub encoding: Option<Encoding>,
    pub output: OutputFormat,
}

#[derive(Debug)]
pub struct LiveArgs {
    pub file: PathBuf,
    pub mode: Mode,
    pub replacement: Option<String>,
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug)]
pub enum Action {
    Evaluate(EvaluateArgs),
    Live(LiveArgs),
    Version,
    Config { show: bool },
}

#[derive(Debug)]
pub struct Args {
    pub evaluator: Option<String>,
    pub timeout: Option<f64>,
    pub color: Option<ColorChoice>,
    pub verbose: bool,
    pub action: Action,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_match_flags_become_modifiers() {
        let cli = parse(&["rexhibit", "match", "-gi", "a+", "--text", "aaa"]);
        let Commands::Match { pattern, options } = cli.command else {
            panic!("expected match");
        };
        let eval = options.into_evaluate(Mode::Match, pattern, None);
        assert_eq!(eval.pattern, "a+");
        assert_eq!(eval.modifiers, vec![Modifier::FindAll, Modifier::CaseInsensitive]);
        assert_eq!(eval.subject, SubjectSource::Text("aaa".to_string()));
        assert_eq!(eval.output, OutputFormat::Highlight);
        assert_eq!(eval.allow_code, None);
    }

    #[test]
    fn test_replace_takes_two_positionals() {
        let cli = parse(&["rexhibit", "replace", "(a)", "<$1>", "--file", "in.txt", "--json"]);
        let Commands::Replace {
            pattern,
            replacement,
            options,
        } = cli.command
        else {
            panic!("expected replace");
        };
        let eval = options.into_evaluate(Mode::Replace, pattern, Some(replacement));
        assert_eq!(eval.replacement.as_deref(), Some("<$1>"));
        assert_eq!(eval.subject, SubjectSource::File(PathBuf::from("in.txt")));
        assert_eq!(eval.output, OutputFormat::Json);
    }

    #[test]
    fn test_text_and_file_conflict() {
        assert!(Cli::try_parse_from(["rexhibit", "split", ",", "--text", "a", "--file", "b"]).is_err());
    }

    #[test]
    fn test_bytes_and_allow_code_flags() {
        let cli = parse(&["rexhibit", "match", "--bytes", "--allow-code", "a"]);
        let Commands::Match { pattern, options } = cli.command else {
            panic!("expected match");
        };
        let eval = options.into_evaluate(Mode::Match, pattern, None);
        assert_eq!(eval.encoding, Some(Encoding::Bytes));
        assert_eq!(eval.allow_code, Some(true));
        assert_eq!(eval.subject, SubjectSource::Stdin);
    }

    #[test]
    fn test_global_options() {
        let cli = parse(&["rexhibit", "version", "--evaluator", "/opt/perl", "--timeout", "2.5"]);
        assert_eq!(cli.evaluator.as_deref(), Some("/opt/perl"));
        assert_eq!(cli.timeout, Some(2.5));
    }

    #[test]
    fn test_parse_modifier_letters() {
        assert_eq!(
            parse_modifier_letters("gs").unwrap(),
            vec![Modifier::FindAll, Modifier::DotMatchesNewline]
        );
        assert!(parse_modifier_letters("gz").is_err());
    }

    #[test]
    fn test_parse_mode_and_color() {
        assert_eq!(parse_mode("split").unwrap(), Mode::Split);
        assert!(parse_mode("grep").is_err());
        assert_eq!(parse_color("never").unwrap(), ColorChoice::Never);
        assert_eq!(ColorChoice::from_config(Some("bogus")), ColorChoice::Auto);
    }
}
