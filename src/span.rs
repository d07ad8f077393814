//! Text spans and labels
//!
//! A [`TextSpan`] is the leaf of the result tree: a half-open character
//! range into the subject together with the text it covers. Spans without
//! positions only carry literal text (replacement previews, split segments,
//! groups that did not take part in a match).

use serde::{Deserialize, Serialize};

/// A slice of the subject text, or a piece of literal text
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextSpan {
    begin: usize,
    end: usize,
    has_positions: bool,
    text: String,
}

impl TextSpan {
    /// Span over `[begin, end)` whose text was sliced from the subject
    ///
    /// # Panics
    ///
    /// Debug builds assert `begin <= end`.
    pub fn positioned(begin: usize, end: usize, text: impl Into<String>) -> Self {
        debug_assert!(begin <= end, "span begins after it ends: {}..{}", begin, end);
        Self {
            begin,
            end,
            has_positions: true,
            text: text.into(),
        }
    }

    /// Span carrying only literal text
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            begin: 0,
            end: 0,
            has_positions: false,
            text: text.into(),
        }
    }

    /// An optional group that did not participate in the match
    pub fn unmatched() -> Self {
        Self::literal(String::new())
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn has_positions(&self) -> bool {
        self.has_positions
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in characters of the covered range (or of the literal text)
    pub fn len(&self) -> usize {
        if self.has_positions {
            self.end - self.begin
        } else {
            self.text.chars().count()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(begin, end)` when the span has positions
    pub fn range(&self) -> Option<(usize, usize)> {
        self.has_positions.then_some((self.begin, self.end))
    }

    /// Whether `other` lies within this span. Spans without positions are never contained.
    pub fn contains(&self, other: &TextSpan) -> bool {
        self.has_positions
            && other.has_positions
            && self.begin <= other.begin
            && other.end <= self.end
    }
}

/// What a [`Label`] stands for inside a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelRole {
    /// The text the whole pattern matched
    Match,
    /// The text the match is replaced with
    Replacement,
}

impl LabelRole {
    pub fn title(self) -> &'static str {
        match self {
            LabelRole::Match => "Match",
            LabelRole::Replacement => "Replacement",
        }
    }
}

/// A span that stands alone as a named sub-result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    role: LabelRole,
    span: TextSpan,
}

impl Label {
    pub fn new(role: LabelRole, span: TextSpan) -> Self {
        Self { role, span }
    }

    /// Matched-text label over `[begin, end)`
    pub fn matched(begin: usize, end: usize, text: impl Into<String>) -> Self {
        Self::new(LabelRole::Match, TextSpan::positioned(begin, end, text))
    }

    /// Literal replacement preview
    pub fn replacement(text: impl Into<String>) -> Self {
        Self::new(LabelRole::Replacement, TextSpan::literal(text))
    }

    pub fn role(&self) -> LabelRole {
        self.role
    }

    pub fn span(&self) -> &TextSpan {
        &self.span
    }

    pub fn text(&self) -> &str {
        self.span.text()
    }
}
