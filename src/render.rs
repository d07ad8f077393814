//! Terminal and JSON presentation of a result set

use std::io::IsTerminal;

use anyhow::{Context, Result};
use colored::*;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};

use crate::cli::{ColorChoice, OutputFormat};
use crate::error::{ErrorKind, EvaluationError};
use crate::match_result::Match;
use crate::outline::{preview, OutlineNode, ReplacementDisplay, CAPTURE_SUMMARY_LENGTH, MATCH_SUMMARY_LENGTH};
use crate::regex_error::RegexDiagnostic;
use crate::request::Mode;
use crate::result_set::{ResultSet, ResultState};

const INDENT: &str = "  ";

pub struct Renderer {
    use_color: bool,
    match_summary_length: usize,
    capture_summary_length: usize,
}

impl Renderer {
    pub fn new(use_color: bool) -> Self {
        Self {
            use_color,
            match_summary_length: MATCH_SUMMARY_LENGTH,
            capture_summary_length: CAPTURE_SUMMARY_LENGTH,
        }
    }

    pub fn with_summary_lengths(mut self, matches: usize, captures: usize) -> Self {
        self.match_summary_length = matches;
        self.capture_summary_length = captures;
        self
    }

    /// Auto-detect if we should use colors
    pub fn should_use_color(choice: ColorChoice) -> bool {
        match choice {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => {
                // Check NO_COLOR env var (https://no-color.org/)
                if std::env::var_os("NO_COLOR").is_some() {
                    return false;
                }
                std::io::stdout().is_terminal()
            }
        }
    }

    /// Renders `results` and marks every shown match as rendered
    pub fn render(&self, results: &mut ResultSet, format: OutputFormat) -> Result<String> {
        let output = match format {
            OutputFormat::Json => json_report(results)?,
            OutputFormat::Outline => self.outline(results),
            OutputFormat::Highlight => self.report(results),
        };
        for index in 0..results.match_count() {
            if let Some(m) = results.match_at_mut(index) {
                m.set_rendered(true);
            }
        }
        Ok(output)
    }

    fn report(&self, results: &ResultSet) -> String {
        match results.state() {
            ResultState::Failed => self.error(results),
            ResultState::Aborted => self.notice("Evaluation aborted"),
            ResultState::Idle | ResultState::Running => self.notice("No results yet"),
            ResultState::Succeeded => match results.mode() {
                Some(Mode::Split) => self.splits(results),
                Some(Mode::Replace) => {
                    let mut output = self.matches(results);
                    output.push('\n');
                    output.push_str(&self.replacement_diff(results));
                    output
                }
                Some(Mode::Match) | None => self.matches(results),
            },
        }
    }

    fn notice(&self, text: &str) -> String {
        if self.use_color {
            format!("{}\n", text.yellow())
        } else {
            format!("{}\n", text)
        }
    }

    /// The failure of a `Failed` result set, with the pattern diagnostic when there is one
    pub fn error(&self, results: &ResultSet) -> String {
        let Some(error) = results.error() else {
            return String::new();
        };
        let body = match error {
            EvaluationError::RegexInvalid { diagnostic, .. } => {
                let pattern = results.request().map(|r| r.pattern.as_str()).unwrap_or("");
                diagnostic.display(pattern)
            }
            other => format!("{}\n", other),
        };
        if self.use_color {
            format!("{} {}", "error:".red().bold(), body)
        } else {
            format!("error: {}", body)
        }
    }

    fn matches(&self, results: &ResultSet) -> String {
        let subject = results.subject();
        let mut output = String::new();

        if results.match_count() == 0 {
            output.push_str(&self.notice("No match"));
            return output;
        }

        if self.use_color {
            output.push_str(&self.highlight(subject, results.matches()));
            output.push_str("\n\n");
        }

        for m in results.matches() {
            output.push_str(&self.match_entry(m));
        }

        let count = results.match_count();
        let noun = if count == 1 { "match" } else { "matches" };
        if self.use_color {
            output.push_str(&format!("\nTotal: {} {}\n", count.to_string().bold().white(), noun));
        } else {
            output.push_str(&format!("\nTotal: {} {}\n", count, noun));
        }
        output
    }

    /// The subject with every match marked; overlapping spans are skipped
    fn highlight(&self, subject: &str, matches: &[Match]) -> String {
        let chars: Vec<char> = subject.chars().collect();
        let mut output = String::new();
        let mut cursor = 0;

        for (begin, end) in matches.iter().filter_map(|m| m.span().range()) {
            if begin < cursor || end > chars.len() {
                continue;
            }
            let before: String = chars[cursor..begin].iter().collect();
            let matched: String = chars[begin..end].iter().collect();
            output.push_str(&before);
            if matched.is_empty() {
                output.push_str(&"|".cyan().to_string());
            } else {
                output.push_str(&matched.green().bold().underline().to_string());
            }
            cursor = end;
        }
        let rest: String = chars[cursor.min(chars.len())..].iter().collect();
        output.push_str(&rest);
        output
    }

    fn match_entry(&self, m: &Match) -> String {
        let mut output = String::new();
        let range = range_text(m.span().range());
        if self.use_color {
            output.push_str(&format!(
                "{} {}: {}\n",
                format!("Match {}", m.number()).bold().cyan(),
                range.dimmed(),
                quoted(m.text()).green()
            ));
        } else {
            output.push_str(&format!("Match {} {}: {}\n", m.number(), range, quoted(m.text())));
        }

        if let Some(replacement) = m.replacement() {
            if self.use_color {
                output.push_str(&format!("{}{} {}\n", INDENT, "=>".dimmed(), quoted(replacement.text()).yellow()));
            } else {
                output.push_str(&format!("{}=> {}\n", INDENT, quoted(replacement.text())));
            }
        }

        for capture in m.captures() {
            let line = if capture.participated() {
                format!(
                    "${} {}: {}",
                    capture.number(),
                    range_text(capture.span().range()),
                    quoted(capture.text())
                )
            } else {
                format!("${}: (no match)", capture.number())
            };
            if self.use_color && !capture.participated() {
                output.push_str(&format!("{}{}\n", INDENT, line.dimmed()));
            } else {
                output.push_str(&format!("{}{}\n", INDENT, line));
            }
        }
        output
    }

    fn replacement_diff(&self, results: &ResultSet) -> String {
        let Some(replaced) = results.replaced_text() else {
            return String::new();
        };
        let subject = results.subject();
        if subject == replaced {
            return self.notice("Text unchanged");
        }

        let mut output = String::new();
        let diff = TextDiff::from_lines(subject, replaced);
        for change in diff.iter_all_changes() {
            let line = change.value().trim_end_matches('\n');
            let formatted = match (change.tag(), self.use_color) {
                (ChangeTag::Equal, true) => format!("  {}", line.dimmed()),
                (ChangeTag::Equal, false) => format!("  {}", line),
                (ChangeTag::Delete, true) => format!("{} {}", "-".red().bold(), line.red()),
                (ChangeTag::Delete, false) => format!("- {}", line),
                (ChangeTag::Insert, true) => format!("{} {}", "+".green().bold(), line.green().bold()),
                (ChangeTag::Insert, false) => format!("+ {}", line),
            };
            output.push_str(&formatted);
            output.push('\n');
        }
        output
    }

    fn splits(&self, results: &ResultSet) -> String {
        let mut output = String::new();
        for (index, segment) in results.splits().iter().enumerate() {
            let label = format!("Segment {}", index + 1);
            if self.use_color {
                output.push_str(&format!("{}: {}\n", label.bold().cyan(), quoted(segment.text())));
            } else {
                output.push_str(&format!("{}: {}\n", label, quoted(segment.text())));
            }
        }
        let count = results.split_count();
        output.push_str(&format!(
            "\nTotal: {} segment{}\n",
            count,
            if count == 1 { "" } else { "s" }
        ));
        output
    }

    /// The result tree, one node per line, children indented under their parent
    pub fn outline(&self, results: &ResultSet) -> String {
        if results.state() != ResultState::Succeeded {
            return self.report(results);
        }
        let display = results
            .mode()
            .map(ReplacementDisplay::for_mode)
            .unwrap_or_default();
        let mut output = String::new();
        self.outline_node(results.outline(), results.subject(), display, 0, &mut output);
        output
    }

    fn outline_node(
        &self,
        node: OutlineNode<'_>,
        source: &str,
        display: ReplacementDisplay,
        depth: usize,
        output: &mut String,
    ) {
        let length = match node {
            OutlineNode::Capture(_) => self.capture_summary_length,
            _ => self.match_summary_length,
        };
        let summary = node.summary(source, length);
        output.push_str(&INDENT.repeat(depth));
        if self.use_color && matches!(node, OutlineNode::Match(_)) {
            output.push_str(&summary.bold().to_string());
        } else {
            output.push_str(&summary);
        }
        let positioned = match node {
            OutlineNode::Root(_) => None,
            _ => node.range(),
        };
        if let Some(range) = positioned {
            let range = range_text(Some(range));
            if self.use_color {
                output.push_str(&format!(" {}", range.dimmed()));
            } else {
                output.push_str(&format!(" {}", range));
            }
        }
        output.push('\n');

        for index in 0..node.child_count(display) {
            if let Some(child) = node.child_at(index, display) {
                self.outline_node(child, source, display, depth + 1, output);
            }
        }
    }
}

fn range_text(range: Option<(usize, usize)>) -> String {
    match range {
        Some((begin, end)) => format!("[{}..{}]", begin, end),
        None => "[-]".to_string(),
    }
}

fn quoted(text: &str) -> String {
    format!("\"{}\"", preview(text, usize::MAX))
}

#[derive(Serialize)]
struct JsonReport<'a> {
    state: String,
    mode: Option<Mode>,
    pattern: Option<&'a str>,
    matches: Vec<JsonMatch<'a>>,
    splits: Vec<&'a str>,
    replaced_text: Option<&'a str>,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
    diagnostic: Option<&'a RegexDiagnostic>,
}

#[derive(Serialize)]
struct JsonMatch<'a> {
    number: usize,
    begin: Option<usize>,
    end: Option<usize>,
    text: &'a str,
    replacement: Option<&'a str>,
    captures: Vec<JsonCapture<'a>>,
}

#[derive(Serialize)]
struct JsonCapture<'a> {
    number: usize,
    begin: Option<usize>,
    end: Option<usize>,
    /// `null` when the group did not participate
    text: Option<&'a str>,
}

/// Pretty-printed JSON of the whole result set
pub fn json_report(results: &ResultSet) -> Result<String> {
    let matches = results
        .matches()
        .iter()
        .map(|m| {
            let range = m.span().range();
            JsonMatch {
                number: m.number(),
                begin: range.map(|r| r.0),
                end: range.map(|r| r.1),
                text: m.text(),
                replacement: m.replacement().map(|label| label.text()),
                captures: m
                    .captures()
                    .iter()
                    .map(|capture| {
                        let range = capture.span().range();
                        JsonCapture {
                            number: capture.number(),
                            begin: range.map(|r| r.0),
                            end: range.map(|r| r.1),
                            text: capture.participated().then(|| capture.text()),
                        }
                    })
                    .collect(),
            }
        })
        .collect();

    let diagnostic = match results.error() {
        Some(EvaluationError::RegexInvalid { diagnostic, .. }) => Some(diagnostic),
        _ => None,
    };

    let report = JsonReport {
        state: results.state().to_string(),
        mode: results.mode(),
        pattern: results.request().map(|r| r.pattern.as_str()),
        matches,
        splits: results.splits().iter().map(|s| s.text()).collect(),
        replaced_text: results.replaced_text(),
        error: results.error().map(|e| e.to_string()),
        error_kind: results.error_kind(),
        diagnostic,
    };

    serde_json::to_string_pretty(&report).context("Failed to serialize results")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ResultParser;
    use crate::request::{Encoding, MatchRequest};

    fn succeeded(request: MatchRequest, raw: &str) -> ResultSet {
        let outcome = ResultParser::new(request.mode, request.encoding, &request.subject)
            .parse(raw.as_bytes())
            .unwrap();
        let mut results = ResultSet::new();
        results.succeed_with(request, outcome);
        results
    }

    #[test]
    fn test_plain_match_report() {
        let results = succeeded(
            MatchRequest::matching("(a)|(b)", "xb"),
            "M\t1\t2\nC\t-1\t-1\nC\t1\t2\nD\t1\n",
        );
        let text = Renderer::new(false).report(&results);
        assert!(text.contains("Match 1 [1..2]: \"b\""));
        assert!(text.contains("$1: (no match)"));
        assert!(text.contains("$2 [1..2]: \"b\""));
        assert!(text.contains("Total: 1 match"));
    }

    #[test]
    fn test_no_match_report() {
        let results = succeeded(MatchRequest::matching("z", "abc"), "D\t0\n");
        assert_eq!(Renderer::new(false).report(&results), "No match\n");
    }

    #[test]
    fn test_replace_diff() {
        let request = MatchRequest::replacing("o", "0", "foo\nbar").with_modifier(crate::request::Modifier::FindAll);
        let raw = "M\t1\t2\nR\t1:0\nM\t2\t3\nR\t1:0\nT\t7:f00\nbar\nD\t2\n";
        let results = succeeded(request, raw);
        let text = Renderer::new(false).report(&results);
        assert!(text.contains("=> \"0\""));
        assert!(text.contains("- foo"));
        assert!(text.contains("+ f00"));
        assert!(text.contains("  bar"));
    }

    #[test]
    fn test_split_report() {
        let results = succeeded(
            MatchRequest::splitting(",", "x,y"),
            "S\t1:x\nS\t1:y\nD\t2\n",
        );
        let text = Renderer::new(false).report(&results);
        assert!(text.contains("Segment 1: \"x\""));
        assert!(text.contains("Segment 2: \"y\""));
        assert!(text.contains("Total: 2 segments"));
    }

    #[test]
    fn test_outline_walks_tree() {
        let results = succeeded(
            MatchRequest::matching("(b+)", "abbbc").with_encoding(Encoding::Utf8),
            "M\t1\t4\nC\t1\t4\nD\t1\n",
        );
        let text = Renderer::new(false).outline(&results);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "abbbc");
        assert_eq!(lines[1], "  Match 1: bbb [1..4]");
        assert_eq!(lines[2], "    Match: bbb [1..4]");
        assert_eq!(lines[3], "    $1: bbb [1..4]");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_outline_uses_configured_lengths() {
        let results = succeeded(
            MatchRequest::matching("a+", "aaaaaa"),
            "M\t0\t6\nD\t1\n",
        );
        let text = Renderer::new(false).with_summary_lengths(3, 3).outline(&results);
        assert!(text.contains("Match 1: aaa…"));
    }

    #[test]
    fn test_render_marks_matches() {
        let mut results = succeeded(MatchRequest::matching("a", "a"), "M\t0\t1\nD\t1\n");
        assert!(!results.match_at(0).unwrap().is_rendered());
        Renderer::new(false).render(&mut results, OutputFormat::Highlight).unwrap();
        assert!(results.match_at(0).unwrap().is_rendered());
    }

    #[test]
    fn test_json_report() {
        let results = succeeded(
            MatchRequest::matching("(x)?a", "a"),
            "M\t0\t1\nC\t-1\t-1\nD\t1\n",
        );
        let json: serde_json::Value = serde_json::from_str(&json_report(&results).unwrap()).unwrap();
        assert_eq!(json["state"], "succeeded");
        assert_eq!(json["mode"], "match");
        assert_eq!(json["matches"][0]["begin"], 0);
        assert_eq!(json["matches"][0]["captures"][0]["text"], serde_json::Value::Null);
        assert_eq!(json["error"], serde_json::Value::Null);
    }

    #[test]
    fn test_error_report_shows_diagnostic() {
        let mut results = ResultSet::new();
        let request = MatchRequest::matching("a(b", "ab");
        let error = EvaluationError::regex_invalid(
            "Unmatched ( in regex; marked by <-- HERE in m/a( <-- HERE b/ at - line 1.",
            &request.pattern,
        );
        results.fail(request, error);
        let text = Renderer::new(false).report(&results);
        assert!(text.starts_with("error: Invalid pattern"));
        assert!(text.contains("Position: 1"));

        let json: serde_json::Value = serde_json::from_str(&json_report(&results).unwrap()).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error_kind"], "regex_invalid");
        assert_eq!(json["diagnostic"]["position"], 1);
    }

    #[test]
    fn test_color_choice_overrides() {
        assert!(Renderer::should_use_color(ColorChoice::Always));
        assert!(!Renderer::should_use_color(ColorChoice::Never));
    }
}
