//! Request model
//!
//! A [`MatchRequest`] is everything the initiator hands over when an
//! evaluation starts: the subject text, the pattern, its modifiers, an
//! optional replacement template and the trust/encoding switches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// What the evaluator is asked to do with the pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Enumerate matches and their capture groups
    #[default]
    Match,
    /// Substitute every match with the replacement template
    Replace,
    /// Split the subject on the pattern
    Split,
}

impl Mode {
    /// Whether results are reported as matches (as opposed to split segments)
    pub fn yields_matches(self) -> bool {
        matches!(self, Mode::Match | Mode::Replace)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Match => "match",
            Mode::Replace => "replace",
            Mode::Split => "split",
        };
        f.write_str(name)
    }
}

/// A toggle affecting match semantics
///
/// The declaration order is the order flags are emitted in, which keeps the
/// generated program text stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    /// Report every non-overlapping match instead of only the first
    FindAll,
    /// `i`
    CaseInsensitive,
    /// `x`: whitespace and comments in the pattern are ignored
    ExtendedWhitespace,
    /// `s`: `.` also matches a newline
    DotMatchesNewline,
    /// `m`: `^` and `$` match at line boundaries
    Multiline,
    /// `u`: Unicode rules for character classes and case folding
    Unicode,
}

impl Modifier {
    /// All modifiers, in emission order
    pub const ALL: [Modifier; 6] = [
        Modifier::FindAll,
        Modifier::CaseInsensitive,
        Modifier::ExtendedWhitespace,
        Modifier::DotMatchesNewline,
        Modifier::Multiline,
        Modifier::Unicode,
    ];
}

impl FromStr for Modifier {
    type Err = String;

    /// Accepts the snake_case name or the single Perl-style letter (`g` for find-all)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "find_all" | "g" => Ok(Modifier::FindAll),
            "case_insensitive" | "i" => Ok(Modifier::CaseInsensitive),
            "extended_whitespace" | "x" => Ok(Modifier::ExtendedWhitespace),
            "dot_matches_newline" | "s" => Ok(Modifier::DotMatchesNewline),
            "multiline" | "m" => Ok(Modifier::Multiline),
            "unicode" | "u" => Ok(Modifier::Unicode),
            other => Err(format!("unknown modifier '{}'", other)),
        }
    }
}

/// An ordered set of modifiers
pub type ModifierSet = BTreeSet<Modifier>;

/// How the subject is presented to the evaluator
///
/// Offsets in the result tree are always character offsets; the encoding
/// only changes what the evaluator counts and matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// The subject is decoded as UTF-8; the evaluator reports character offsets
    #[default]
    Utf8,
    /// The subject is matched as raw bytes; the evaluator reports byte offsets
    Bytes,
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "bytes" | "raw" => Ok(Encoding::Bytes),
            other => Err(format!("unknown encoding '{}' (expected 'utf8' or 'bytes')", other)),
        }
    }
}

/// One evaluation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub mode: Mode,
    pub subject: String,
    pub pattern: String,
    pub modifiers: ModifierSet,
    pub replacement: Option<String>,
    /// Lets pattern and replacement carry evaluator code. Nothing is escaped.
    pub allow_code: bool,
    pub encoding: Encoding,
}

impl MatchRequest {
    pub fn new(mode: Mode, pattern: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            mode,
            subject: subject.into(),
            pattern: pattern.into(),
            modifiers: ModifierSet::new(),
            replacement: None,
            allow_code: false,
            encoding: Encoding::Utf8,
        }
    }

    /// Shorthand for a Match-mode request
    pub fn matching(pattern: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(Mode::Match, pattern, subject)
    }

    /// Shorthand for a Replace-mode request
    pub fn replacing(
        pattern: impl Into<String>,
        replacement: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self::new(Mode::Replace, pattern, subject).with_replacement(replacement)
    }

    /// Shorthand for a Split-mode request
    pub fn splitting(pattern: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(Mode::Split, pattern, subject)
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.insert(modifier);
        self
    }

    pub fn with_modifiers(mut self, modifiers: impl IntoIterator<Item = Modifier>) -> Self {
        self.modifiers.extend(modifiers);
        self
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = Some(replacement.into());
        self
    }

    pub fn with_allow_code(mut self, allow_code: bool) -> Self {
        self.allow_code = allow_code;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn has_modifier(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }

    /// Whether every match is enumerated. Split mode always splits on every match.
    pub fn finds_all(&self) -> bool {
        self.mode == Mode::Split || self.has_modifier(Modifier::FindAll)
    }

    /// The replacement template, empty when none was given
    pub fn replacement_template(&self) -> &str {
        self.replacement.as_deref().unwrap_or("")
    }

    /// Bytes written to the evaluator's standard input
    pub fn stdin_payload(&self) -> Vec<u8> {
        self.subject.as_bytes().to_vec()
    }
}
