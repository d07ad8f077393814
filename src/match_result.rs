//! Match occurrences
//!
//! A [`Match`] owns its matched-text label, its captures and, in Replace
//! mode, the replacement label. The only mutable piece is the `rendered`
//! flag, which belongs to whoever draws the match.

use serde::{Deserialize, Serialize};

use crate::capture::Capture;
use crate::span::{Label, TextSpan};

/// One match occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    number: usize,
    matched: Label,
    captures: Vec<Capture>,
    replacement: Option<Label>,
    #[serde(skip)]
    rendered: bool,
}

impl Match {
    /// Creates a match; `number` is its 1-based position in the result set
    pub fn new(number: usize, matched: Label) -> Self {
        Self {
            number,
            matched,
            captures: Vec::new(),
            replacement: None,
            rendered: false,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    /// Label holding the matched text
    pub fn matched(&self) -> &Label {
        &self.matched
    }

    /// Span of the whole match
    pub fn span(&self) -> &TextSpan {
        self.matched.span()
    }

    pub fn text(&self) -> &str {
        self.matched.text()
    }

    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }

    /// Capture group `number` (1-based)
    pub fn capture(&self, number: usize) -> Option<&Capture> {
        self.captures.iter().find(|c| c.number() == number)
    }

    pub fn capture_count(&self) -> usize {
        self.captures.len()
    }

    pub fn replacement(&self) -> Option<&Label> {
        self.replacement.as_ref()
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered
    }

    /// Marks the match as drawn by the presentation layer
    pub fn set_rendered(&mut self, rendered: bool) {
        self.rendered = rendered;
    }

    pub(crate) fn push_capture(&mut self, capture: Capture) {
        self.captures.push(capture);
    }

    pub(crate) fn set_replacement(&mut self, replacement: Label) {
        self.replacement = Some(replacement);
    }
}
