/// Configuration management for rexhibit
///
/// rexhibit stores configuration in ~/.rexhibit/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error_helpers::dir_create_error;
use crate::request::{Encoding, Modifier, ModifierSet};

/// rexhibit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Evaluator settings
    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    /// Request defaults
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Output settings
    #[serde(default)]
    pub display: DisplayConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Perl executable; looked up on PATH when unset
    #[serde(default)]
    pub path: Option<String>,

    /// Extra arguments placed before the program file
    #[serde(default)]
    pub args: Vec<String>,

    /// Run-time limit per evaluation in seconds (0 disables it)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: Option<f64>,

    /// Ask the evaluator for its version before the first request
    #[serde(default = "default_check_version")]
    pub check_version: Option<bool>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            timeout_secs: Some(10.0),
            check_version: Some(true),
        }
    }
}

impl EvaluatorConfig {
    /// The configured executable, or `perl` found on PATH
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(PathBuf::from(path)),
            None => which::which("perl").context(
                "Cannot find 'perl' on PATH; set [evaluator] path in ~/.rexhibit/config.toml",
            ),
        }
    }

    /// Run-time limit, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Subject encoding: "utf8" or "bytes"
    #[serde(default = "default_encoding")]
    pub encoding: Option<String>,

    /// Let patterns carry evaluator code
    #[serde(default = "default_allow_code")]
    pub allow_code: Option<bool>,

    /// Modifier letters applied to every request, e.g. "gi"
    #[serde(default)]
    pub modifiers: Option<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            encoding: Some("utf8".to_string()),
            allow_code: Some(false),
            modifiers: None,
        }
    }
}

impl MatchingConfig {
    pub fn encoding(&self) -> Result<Encoding> {
        match &self.encoding {
            Some(name) => name.parse::<Encoding>().map_err(anyhow::Error::msg),
            None => Ok(Encoding::default()),
        }
    }

    pub fn modifier_set(&self) -> Result<ModifierSet> {
        let letters = self.modifiers.as_deref().unwrap_or("");
        letters
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_string().parse::<Modifier>().map_err(anyhow::Error::msg))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Preview length of match summaries
    #[serde(default = "default_match_summary_length")]
    pub match_summary_length: Option<usize>,

    /// Preview length of capture summaries
    #[serde(default = "default_capture_summary_length")]
    pub capture_summary_length: Option<usize>,

    /// "auto", "always" or "never"
    #[serde(default = "default_color")]
    pub color: Option<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            match_summary_length: Some(40),
            capture_summary_length: Some(30),
            color: Some("auto".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive; RUST_LOG takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: Option<String>,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: Some("warn".to_string()),
            log_file: None,
        }
    }
}

// Default functions for serde
fn default_timeout_secs() -> Option<f64> { Some(10.0) }
fn default_check_version() -> Option<bool> { Some(true) }
fn default_encoding() -> Option<String> { Some("utf8".to_string()) }
fn default_allow_code() -> Option<bool> { Some(false) }
fn default_match_summary_length() -> Option<usize> { Some(40) }
fn default_capture_summary_length() -> Option<usize> { Some(30) }
fn default_color() -> Option<String> { Some("auto".to_string()) }
fn default_log_filter() -> Option<String> { Some("warn".to_string()) }

/// Get the configuration file path
pub fn config_file_path() -> Result<PathBuf> {
    let home_dir = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;

    let config_dir = home_dir.join(".rexhibit");
    fs::create_dir_all(&config_dir)
        .map_err(|e| anyhow::anyhow!(dir_create_error(&config_dir, &e)))?;

    Ok(config_dir.join("config.toml"))
}

/// Get the default configuration file content with comments
fn get_default_config_content() -> &'static str {
    r#"# rexhibit Configuration File
#
# Values set here can be overridden by command-line flags.
#
# For more information, run: rexhibit config --help

[evaluator]
# Perl executable (default: the first 'perl' on PATH)
#path = "/usr/bin/perl"

# Extra arguments passed to perl before the generated program
#args = ["-w"]

# Stop evaluations that run longer than this many seconds (default: 10, 0 = never)
# Protects against catastrophic backtracking.
timeout_secs = 10

# Check that perl is at least 5.8 before the first evaluation (default: true)
check_version = true

[matching]
# Subject encoding: "utf8" (default) or "bytes"
# utf8  - match characters; offsets count characters
# bytes - match raw bytes; offsets count bytes and are mapped back to characters
encoding = "utf8"

# Let patterns and replacements run Perl code, e.g. (?{ ... }) (default: false)
# Only enable this for patterns you trust.
allow_code = false

# Modifiers applied to every request (letters g, i, x, s, m, u)
#modifiers = "g"

[display]
# Preview lengths used by --outline (defaults: 40 and 30)
match_summary_length = 40
capture_summary_length = 30

# Colored output: "auto" (default), "always" or "never"
color = "auto"

[logging]
# tracing filter, e.g. "info" or "rexhibit::process=debug" (default: "warn")
# The RUST_LOG environment variable takes precedence.
filter = "warn"

# Write logs to a file instead of stderr (optional)
#log_file = "/tmp/rexhibit.log"
"#
}

/// Save the default commented configuration file
pub fn save_default_config() -> Result<()> {
    save_default_config_to(&config_file_path()?)
}

fn save_default_config_to(config_path: &Path) -> Result<()> {
    fs::write(config_path, get_default_config_content())
        .with_context(|| format!("Failed to write default config file: {}", config_path.display()))
}

/// Load configuration from file, creating default if needed
///
/// If the config file doesn't exist, creates it with defaults and returns them.
/// If the config file is malformed, recreates it with defaults.
pub fn load_config() -> Result<Config> {
    load_config_from(&config_file_path()?)
}

/// [`load_config`] against an explicit path
pub fn load_config_from(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        save_default_config_to(config_path)?;
    }

    let config_str = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    let config: Config = match toml::from_str(&config_str) {
        Ok(config) => config,
        Err(_) => {
            // Config is malformed, recreate with defaults
            save_default_config_to(config_path)?;
            return Ok(Config::default());
        }
    };

    Ok(config)
}

/// Validate configuration values
pub fn validate_config(config: &Config) -> Result<()> {
    if let Some(timeout) = config.evaluator.timeout_secs {
        if !(timeout >= 0.0 && timeout.is_finite()) {
            anyhow::bail!("Invalid timeout_secs: {} (must be 0 or positive)", timeout);
        }
    }

    if let Some(path) = &config.evaluator.path {
        if path.trim().is_empty() {
            anyhow::bail!("Invalid evaluator path: must not be empty");
        }
    }

    config
        .matching
        .encoding()
        .context("Invalid [matching] encoding")?;
    config
        .matching
        .modifier_set()
        .context("Invalid [matching] modifiers")?;

    for (name, length) in [
        ("match_summary_length", config.display.match_summary_length),
        ("capture_summary_length", config.display.capture_summary_length),
    ] {
        if length == Some(0) {
            anyhow::bail!("Invalid {}: 0 (must be at least 1)", name);
        }
    }

    if let Some(color) = &config.display.color {
        if !["auto", "always", "never"].contains(&color.as_str()) {
            anyhow::bail!("Invalid color: {} (must be 'auto', 'always', or 'never')", color);
        }
    }

    if let Some(filter) = &config.logging.filter {
        tracing_subscriber::EnvFilter::try_new(filter)
            .with_context(|| format!("Invalid logging filter: {}", filter))?;
    }

    Ok(())
}
