//! Capture groups

use serde::{Deserialize, Serialize};

use crate::span::TextSpan;

/// One numbered capture group inside a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    number: usize,
    span: TextSpan,
    participated: bool,
}

impl Capture {
    /// A group whose span has positions participated; one without did not
    pub fn new(number: usize, span: TextSpan) -> Self {
        let participated = span.has_positions();
        Self {
            number,
            span,
            participated,
        }
    }

    /// A group that took part but captured text outside its match, as with
    /// `\K` or a group inside lookaround. Only the text is kept.
    pub fn detached(number: usize, text: impl Into<String>) -> Self {
        Self {
            number,
            span: TextSpan::literal(text),
            participated: true,
        }
    }

    /// Group number as reported by the evaluator, starting at 1
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn span(&self) -> &TextSpan {
        &self.span
    }

    pub fn text(&self) -> &str {
        self.span.text()
    }

    /// Whether the group took part in the match
    pub fn participated(&self) -> bool {
        self.participated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participating_capture() {
        let capture = Capture::new(1, TextSpan::positioned(0, 1, "a"));
        assert_eq!(capture.number(), 1);
        assert!(capture.participated());
        assert_eq!(capture.text(), "a");
    }

    #[test]
    fn test_unmatched_capture() {
        let capture = Capture::new(2, TextSpan::unmatched());
        assert!(!capture.participated());
        assert_eq!(capture.text(), "");
        assert_eq!(capture.span().range(), None);
    }

    #[test]
    fn test_detached_capture_keeps_text_without_positions() {
        let capture = Capture::detached(1, "a");
        assert!(capture.participated());
        assert_eq!(capture.text(), "a");
        assert_eq!(capture.span().range(), None);
    }
}
