//! Regex Error Diagnostics
//!
//! The evaluator reports a rejected pattern as a free-form Perl message such
//! as `Unmatched ( in regex; marked by <-- HERE in m/( <-- HERE a/`. This
//! module classifies those messages, recovers the position Perl marked, and
//! attaches a suggestion the presentation layer can show next to "invalid
//! pattern".

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Locates Perl's `<-- HERE` marker; group 1 is the pattern text before it
static HERE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)marked by <-- HERE in m/(.*?) <-- HERE").expect("static regex")
});

/// Trailing ` at FILE line N.` location Perl appends to every message
static LOCATION_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\s+at \S+ line \d+.*$").expect("static regex")
});

/// Classified regex rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegexDiagnostic {
    /// The type of error that occurred
    pub error_type: RegexErrorType,
    /// Character offset in the pattern where the evaluator stopped
    pub position: Option<usize>,
    /// The message without its location suffix and marker excerpt
    pub summary: String,
    /// Suggested fix for the error
    pub suggestion: Option<String>,
}

/// Types of pattern rejections
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegexErrorType {
    /// `(` or `[` without its closing partner
    UnclosedDelimiter { delimiter: char },
    /// `)` without an opening `(`
    UnmatchedClose { delimiter: char },
    /// Quantifier with nothing to repeat, nested or inverted quantifiers
    InvalidQuantifier,
    /// Reference to a group that does not exist
    InvalidBackreference,
    /// Lookbehind the evaluator cannot compile
    LookaroundError,
    /// Embedded code refused because code is not allowed
    CodeNotAllowed,
    /// Character class range such as `[z-a]`
    InvalidRange,
    /// Anything else
    Syntax,
}

impl RegexDiagnostic {
    /// Classify an evaluator message produced while compiling `pattern`
    pub fn from_evaluator_message(message: &str, pattern: &str) -> Self {
        let marker = HERE_MARKER
            .captures(message)
            .and_then(|caps| caps.get(1))
            .map(|prefix| prefix.as_str().chars().count());
        let summary = summarize(message);
        let error_type = classify(&summary);

        let position = match &error_type {
            RegexErrorType::UnclosedDelimiter { delimiter } => marker
                .map(|m| m.saturating_sub(1))
                .or_else(|| find_unclosed_delimiter(pattern, *delimiter)),
            _ => marker,
        };

        let suggestion = generate_suggestion(&error_type, pattern);

        Self {
            error_type,
            position,
            summary,
            suggestion,
        }
    }

    /// Format the diagnostic as a multi-line, user-facing message
    pub fn display(&self, pattern: &str) -> String {
        let mut output = String::from("Invalid pattern\n");
        output.push_str(&format!("  Pattern: \"{}\"\n", pattern));
        output.push_str(&format!("  Type: {}\n", self.type_name()));
        output.push_str(&format!("  Details: {}\n", self.summary));

        if let Some(position) = self.position {
            output.push_str(&format!("  Position: {}\n", position));
            output.push_str(&format!("    {}\n", pattern.replace('\n', " ")));
            output.push_str(&format!("    {}^\n", " ".repeat(position)));
        }

        if let Some(ref suggestion) = self.suggestion {
            output.push_str(&format!("  Suggestion: {}\n", suggestion));
        }

        output
    }

    fn type_name(&self) -> &'static str {
        match self.error_type {
            RegexErrorType::UnclosedDelimiter { .. } => "Unclosed delimiter",
            RegexErrorType::UnmatchedClose { .. } => "Unmatched closing delimiter",
            RegexErrorType::InvalidQuantifier => "Invalid quantifier",
            RegexErrorType::InvalidBackreference => "Backreference error",
            RegexErrorType::LookaroundError => "Lookaround error",
            RegexErrorType::CodeNotAllowed => "Code not allowed",
            RegexErrorType::InvalidRange => "Invalid range",
            RegexErrorType::Syntax => "Syntax error",
        }
    }
}

/// First line of the message, without `; marked by ...` and ` at FILE line N.`
fn summarize(message: &str) -> String {
    let without_location = LOCATION_SUFFIX.replace(message.trim(), "");
    let head = without_location
        .split("; marked by")
        .next()
        .unwrap_or_default();
    head.lines().next().unwrap_or_default().trim().to_string()
}

fn classify(summary: &str) -> RegexErrorType {
    let lower = summary.to_lowercase();

    if let Some(rest) = lower.strip_prefix("unmatched ") {
        match rest.chars().next() {
            Some(open @ ('(' | '[')) => return RegexErrorType::UnclosedDelimiter { delimiter: open },
            Some(close @ (')' | ']')) => return RegexErrorType::UnmatchedClose { delimiter: close },
            _ => {}
        }
    }
    if lower.contains("not terminated") || lower.contains("missing right") {
        return RegexErrorType::UnclosedDelimiter { delimiter: '(' };
    }
    if lower.contains("quantifier") || lower.contains("can't do {n,m}") {
        return RegexErrorType::InvalidQuantifier;
    }
    if lower.contains("nonexistent group") || lower.contains("reference to") {
        return RegexErrorType::InvalidBackreference;
    }
    if lower.contains("lookbehind") {
        return RegexErrorType::LookaroundError;
    }
    if lower.contains("eval-group") {
        return RegexErrorType::CodeNotAllowed;
    }
    if lower.contains("invalid [] range") {
        return RegexErrorType::InvalidRange;
    }
    RegexErrorType::Syntax
}

fn generate_suggestion(error_type: &RegexErrorType, pattern: &str) -> Option<String> {
    match error_type {
        RegexErrorType::UnclosedDelimiter { delimiter } => {
            let closer = match delimiter {
                '(' => ')',
                '[' => ']',
                _ => return None,
            };
            Some(format!(
                "Add a closing '{}' to match the opening '{}', or escape it as '\\{}' for a literal.",
                closer, delimiter, delimiter
            ))
        }
        RegexErrorType::UnmatchedClose { delimiter } => Some(format!(
            "Remove the stray '{}' or escape it as '\\{}'.",
            delimiter, delimiter
        )),
        RegexErrorType::InvalidQuantifier => Some(
            "A quantifier (*, +, ?, {n,m}) must follow something to repeat, e.g. 'a*', '(foo)+', 'x{2,5}'."
                .to_string(),
        ),
        RegexErrorType::InvalidBackreference => {
            let groups = count_groups(pattern);
            Some(format!(
                "The pattern defines {} capture group{}; backreferences must refer to an existing group.",
                groups,
                if groups == 1 { "" } else { "s" }
            ))
        }
        RegexErrorType::LookaroundError => Some(
            "Lookbehind must have a bounded length; try a fixed-width alternative or \\K.".to_string(),
        ),
        RegexErrorType::CodeNotAllowed => Some(
            "Embedded code such as (?{ ... }) only runs when code is allowed (--allow-code)."
                .to_string(),
        ),
        RegexErrorType::InvalidRange => {
            Some("Character class ranges must run from low to high, e.g. [a-z] not [z-a].".to_string())
        }
        RegexErrorType::Syntax => None,
    }
}

/// Helper: Find the position of the last unclosed opening delimiter
fn find_unclosed_delimiter(pattern: &str, open: char) -> Option<usize> {
    let close = match open {
        '(' => ')',
        '[' => ']',
        _ => return None,
    };
    let mut stack = Vec::new();
    let mut in_char_class = false;
    let mut escaped = false;

    for (i, c) in pattern.chars().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '[' if !in_char_class => {
                in_char_class = true;
                if open == '[' {
                    stack.push(i);
                }
            }
            ']' if in_char_class => {
                in_char_class = false;
                if open == '[' {
                    stack.pop();
                }
            }
            c if c == open && !in_char_class => stack.push(i),
            c if c == close && !in_char_class => {
                stack.pop();
            }
            _ => {}
        }
    }

    stack.last().copied()
}

/// Helper: Count capturing groups, ignoring `(?...)` constructs and escapes
fn count_groups(pattern: &str) -> usize {
    let chars: Vec<char> = pattern.chars().collect();
    let mut count = 0;
    let mut in_char_class = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '[' => in_char_class = true,
            ']' => in_char_class = false,
            '(' if !in_char_class => {
                let named = chars.get(i + 1) == Some(&'?')
                    && matches!(chars.get(i + 2), Some('<') | Some('\'') | Some('P'))
                    && !matches!(chars.get(i + 3), Some('=') | Some('!'));
                if chars.get(i + 1) != Some(&'?') || named {
                    count += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    count
}
