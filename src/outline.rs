//! Outline protocol over the result tree
//!
//! Every node kind answers the same four questions, so a generic renderer
//! can walk a [`ResultSet`] without knowing what it is looking at. The
//! replacement label of a match is only a child when replacements are shown.

use crate::capture::Capture;
use crate::match_result::Match;
use crate::request::Mode;
use crate::result_set::ResultSet;
use crate::span::{Label, TextSpan};

/// Preview length for match summaries
pub const MATCH_SUMMARY_LENGTH: usize = 40;

/// Preview length for capture summaries
pub const CAPTURE_SUMMARY_LENGTH: usize = 30;

const ELLIPSIS: char = '…';
const LINE_BREAK: char = '⏎';

/// Whether replacement labels take part in the outline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementDisplay {
    WithReplacements,
    #[default]
    WithoutReplacements,
}

impl ReplacementDisplay {
    /// Replace mode shows replacements; the other modes have none to show
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Replace => ReplacementDisplay::WithReplacements,
            Mode::Match | Mode::Split => ReplacementDisplay::WithoutReplacements,
        }
    }
}

/// A borrowed node of the result tree
#[derive(Debug, Clone, Copy)]
pub enum OutlineNode<'a> {
    /// Split segment
    Span(&'a TextSpan),
    Label(&'a Label),
    Capture(&'a Capture),
    Match(&'a Match),
    Root(&'a ResultSet),
}

impl<'a> OutlineNode<'a> {
    pub fn child_count(&self, display: ReplacementDisplay) -> usize {
        match self {
            OutlineNode::Root(results) => match results.mode() {
                Some(Mode::Split) => results.split_count(),
                Some(Mode::Match | Mode::Replace) => results.match_count(),
                None => 0,
            },
            OutlineNode::Match(m) => 1 + usize::from(shows_replacement(m, display)) + m.capture_count(),
            OutlineNode::Span(_) | OutlineNode::Label(_) | OutlineNode::Capture(_) => 0,
        }
    }

    /// Child number `index`, or `None` past the last child
    pub fn child_at(&self, index: usize, display: ReplacementDisplay) -> Option<OutlineNode<'a>> {
        match *self {
            OutlineNode::Root(results) => match results.mode()? {
                Mode::Split => results.splits().get(index).map(OutlineNode::Span),
                Mode::Match | Mode::Replace => results.match_at(index).map(OutlineNode::Match),
            },
            OutlineNode::Match(m) => {
                if index == 0 {
                    return Some(OutlineNode::Label(m.matched()));
                }
                let mut index = index - 1;
                if shows_replacement(m, display) {
                    if index == 0 {
                        return m.replacement().map(OutlineNode::Label);
                    }
                    index -= 1;
                }
                m.captures().get(index).map(OutlineNode::Capture)
            }
            OutlineNode::Span(_) | OutlineNode::Label(_) | OutlineNode::Capture(_) => None,
        }
    }

    /// Character range covered by the node; the root covers the whole subject
    pub fn range(&self) -> Option<(usize, usize)> {
        match self {
            OutlineNode::Span(span) => span.range(),
            OutlineNode::Label(label) => label.span().range(),
            OutlineNode::Capture(capture) => capture.span().range(),
            OutlineNode::Match(m) => m.span().range(),
            OutlineNode::Root(results) => Some((0, results.subject().chars().count())),
        }
    }

    /// One-line preview of at most `max_length` characters of content
    ///
    /// Positioned nodes are previewed from `source`; literal ones from their
    /// own text.
    pub fn summary(&self, source: &str, max_length: usize) -> String {
        match self {
            OutlineNode::Span(span) => preview(&span_text(span, source), max_length),
            OutlineNode::Label(label) => format!(
                "{}: {}",
                label.role().title(),
                preview(&span_text(label.span(), source), max_length)
            ),
            OutlineNode::Capture(capture) if !capture.participated() => {
                format!("${}: (no match)", capture.number())
            }
            OutlineNode::Capture(capture) => format!(
                "${}: {}",
                capture.number(),
                preview(&span_text(capture.span(), source), max_length)
            ),
            OutlineNode::Match(m) => format!(
                "Match {}: {}",
                m.number(),
                preview(&span_text(m.span(), source), max_length)
            ),
            OutlineNode::Root(_) => preview(source, max_length),
        }
    }
}

fn shows_replacement(m: &Match, display: ReplacementDisplay) -> bool {
    display == ReplacementDisplay::WithReplacements && m.replacement().is_some()
}

fn span_text(span: &TextSpan, source: &str) -> String {
    match span.range() {
        Some((begin, end)) if end <= source.chars().count() => {
            source.chars().skip(begin).take(end - begin).collect()
        }
        _ => span.text().to_string(),
    }
}

/// Caps `text` at `max_length` characters and makes line breaks visible
pub fn preview(text: &str, max_length: usize) -> String {
    let mut out = String::new();
    let mut chars = text.chars();
    for c in chars.by_ref().take(max_length) {
        out.push(if c == '\n' { LINE_BREAK } else { c });
    }
    if chars.next().is_some() {
        out.push(ELLIPSIS);
    }
    out
}
