//! Evaluator version detection
//!
//! Perl reports its version through `$]` as a decimal such as `5.036000`
//! (major 5, minor 36, patch 0). The program builder gates syntax on this.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EvaluationError;

static DECIMAL_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\.(\d{1,3})(\d{0,3})\s*$").expect("static regex")
});

static DOTTED_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*v?(\d+)\.(\d+)(?:\.(\d+))?\s*$").expect("static regex")
});

/// Version of the external evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvaluatorVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EvaluatorVersion {
    /// Oldest evaluator the generated programs run on
    pub const MINIMUM: EvaluatorVersion = EvaluatorVersion::new(5, 8, 0);

    /// Assumed when detection is skipped
    pub const MODERN: EvaluatorVersion = EvaluatorVersion::new(5, 36, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn at_least(self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    pub fn is_supported(self) -> bool {
        self >= Self::MINIMUM
    }

    /// Has the `//` defined-or operator
    pub fn has_defined_or(self) -> bool {
        self.at_least(5, 10)
    }

    /// Accepts `feature 'unicode_strings'`
    pub fn has_unicode_strings_feature(self) -> bool {
        self.at_least(5, 12)
    }

    /// Accepts the `/u` pattern flag
    pub fn has_unicode_flag(self) -> bool {
        self.at_least(5, 14)
    }

    /// Runs `evaluator -e 'print $]'` and parses the answer
    pub fn detect(evaluator: &Path) -> Result<Self, EvaluationError> {
        let command = evaluator.display().to_string();
        let output = Command::new(evaluator)
            .arg("-e")
            .arg("print $]")
            .output()
            .map_err(|err| EvaluationError::Spawn {
                command: command.clone(),
                message: crate::error_helpers::spawn_error(evaluator, &err),
                source: Some(Arc::new(err)),
            })?;

        if !output.status.success() {
            return Err(EvaluationError::Evaluator {
                status: output.status.code(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let reported = String::from_utf8_lossy(&output.stdout);
        let version = reported.parse::<EvaluatorVersion>().map_err(|message| {
            EvaluationError::Evaluator {
                status: output.status.code(),
                message,
            }
        })?;

        debug!(evaluator = %command, %version, "detected evaluator version");
        Ok(version)
    }
}

impl FromStr for EvaluatorVersion {
    type Err = String;

    /// Parses `5.036000`, `v5.36.0` or `5.36.0`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(caps) = DOTTED_VERSION.captures(s) {
            if let Some(patch) = caps.get(3) {
                return Ok(Self::new(
                    number(&caps[1])?,
                    number(&caps[2])?,
                    number(patch.as_str())?,
                ));
            }
        }

        if let Some(caps) = DECIMAL_VERSION.captures(s) {
            // `$]` may drop trailing zeros: 5.01 is 5.010
            let minor = format!("{:0<3}", &caps[2]);
            let patch = if caps[3].is_empty() {
                0
            } else {
                number(&format!("{:0<3}", &caps[3]))?
            };
            return Ok(Self::new(number(&caps[1])?, number(&minor)?, patch));
        }

        Err(format!("unrecognised evaluator version '{}'", s.trim()))
    }
}

fn number(digits: &str) -> Result<u32, String> {
    digits
        .parse::<u32>()
        .map_err(|e| format!("bad version component '{}': {}", digits, e))
}

impl fmt::Display for EvaluatorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
