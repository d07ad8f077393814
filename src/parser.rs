//! Evaluator output parsing
//!
//! [`ResultParser`] reads the record stream written by programs from
//! [`crate::program`] and builds the match tree (or the list of split
//! segments). Span text is always sliced from the subject; the evaluator
//! only reports offsets. Any protocol violation fails the whole parse, so
//! a partial tree never escapes.

use std::borrow::Cow;

use tracing::trace;

use crate::capture::Capture;
use crate::error::EvaluationError;
use crate::match_result::Match;
use crate::request::{Encoding, Mode};
use crate::span::{Label, TextSpan};

/// What a successful parse produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Match and Replace mode
    Matches {
        matches: Vec<Match>,
        /// The fully substituted subject, Replace mode only
        replaced_text: Option<String>,
    },
    /// Split mode
    Splits(Vec<TextSpan>),
    /// The evaluator refused to compile the pattern
    Rejected(String),
}

/// Parses the output of one evaluation against its subject
#[derive(Debug)]
pub struct ResultParser<'a> {
    mode: Mode,
    encoding: Encoding,
    subject: &'a str,
    /// Byte index of every character, plus the subject length
    char_starts: Vec<usize>,
}

impl<'a> ResultParser<'a> {
    pub fn new(mode: Mode, encoding: Encoding, subject: &'a str) -> Self {
        let mut char_starts: Vec<usize> = subject.char_indices().map(|(i, _)| i).collect();
        char_starts.push(subject.len());
        Self {
            mode,
            encoding,
            subject,
            char_starts,
        }
    }

    /// Parses raw evaluator stdout
    pub fn parse(&self, raw: &[u8]) -> Result<ParseOutcome, EvaluationError> {
        let mut reader = RecordReader::new(raw);
        let mut matches: Vec<Match> = Vec::new();
        let mut splits: Vec<TextSpan> = Vec::new();
        let mut replaced_text: Option<String> = None;
        let mut replacement_pending = false;

        loop {
            let record = reader.index + 1;
            let Some(tag) = reader.next_tag()? else {
                return Err(EvaluationError::parse(
                    record,
                    "output ended without a terminator record",
                ));
            };
            trace!(record, tag = %char::from(tag), "parsing record");

            match tag {
                b'X' => {
                    let message = reader.payload()?;
                    if record != 1 {
                        return Err(EvaluationError::parse(
                            record,
                            "rejection record after other records",
                        ));
                    }
                    reader.expect_end()?;
                    return Ok(ParseOutcome::Rejected(self.decode(message, record)?.into_owned()));
                }
                b'M' => {
                    self.require(self.mode.yields_matches(), record, "match record in split output")?;
                    if replacement_pending {
                        return Err(EvaluationError::parse(
                            record,
                            "previous match has no replacement record",
                        ));
                    }
                    let (begin, end) = self.span_bounds(reader.offsets()?, record)?;
                    let text = self.slice(begin, end);
                    matches.push(Match::new(matches.len() + 1, Label::matched(begin, end, text)));
                    replacement_pending = self.mode == Mode::Replace;
                }
                b'C' => {
                    let offsets = reader.offsets()?;
                    let Some(current) = matches.last_mut() else {
                        return Err(EvaluationError::parse(record, "capture record before any match"));
                    };
                    if self.mode == Mode::Replace && !replacement_pending {
                        return Err(EvaluationError::parse(
                            record,
                            "capture record after the replacement of its match",
                        ));
                    }
                    let number = current.capture_count() + 1;
                    let capture = match offsets {
                        (-1, -1) => Capture::new(number, TextSpan::unmatched()),
                        _ => {
                            let (begin, end) = self.span_bounds(offsets, record)?;
                            let span = TextSpan::positioned(begin, end, self.slice(begin, end));
                            if current.span().contains(&span) {
                                Capture::new(number, span)
                            } else {
                                // \K and lookaround can capture outside the match
                                trace!(record, begin, end, "capture lies outside its match");
                                Capture::detached(number, span.text())
                            }
                        }
                    };
                    current.push_capture(capture);
                }
                b'R' => {
                    let payload = reader.payload()?;
                    self.require(self.mode == Mode::Replace, record, "replacement record outside replace output")?;
                    if !replacement_pending {
                        return Err(EvaluationError::parse(
                            record,
                            "replacement record without a preceding match",
                        ));
                    }
                    let text = self.decode(payload, record)?.into_owned();
                    if let Some(current) = matches.last_mut() {
                        current.set_replacement(Label::replacement(text));
                    }
                    replacement_pending = false;
                }
                b'T' => {
                    let payload = reader.payload()?;
                    self.require(self.mode == Mode::Replace, record, "replaced-text record outside replace output")?;
                    if replaced_text.is_some() || replacement_pending {
                        return Err(EvaluationError::parse(record, "unexpected replaced-text record"));
                    }
                    replaced_text = Some(self.decode(payload, record)?.into_owned());
                }
                b'S' => {
                    let payload = reader.payload()?;
                    self.require(self.mode == Mode::Split, record, "split record outside split output")?;
                    splits.push(TextSpan::literal(self.decode(payload, record)?.into_owned()));
                }
                b'D' => {
                    let count = reader.count()?;
                    reader.expect_end()?;
                    if replacement_pending {
                        return Err(EvaluationError::parse(
                            record,
                            "last match has no replacement record",
                        ));
                    }
                    return self.finish(record, count, matches, splits, replaced_text);
                }
                other => {
                    return Err(EvaluationError::parse(
                        record,
                        format!("unknown record tag '{}'", char::from(other).escape_default()),
                    ));
                }
            }
        }
    }

    fn finish(
        &self,
        record: usize,
        count: usize,
        matches: Vec<Match>,
        splits: Vec<TextSpan>,
        replaced_text: Option<String>,
    ) -> Result<ParseOutcome, EvaluationError> {
        let reported = if self.mode == Mode::Split {
            splits.len()
        } else {
            matches.len()
        };
        if count != reported {
            return Err(EvaluationError::parse(
                record,
                format!("terminator counts {} results but {} were emitted", count, reported),
            ));
        }

        match self.mode {
            Mode::Split => Ok(ParseOutcome::Splits(splits)),
            Mode::Match => Ok(ParseOutcome::Matches {
                matches,
                replaced_text: None,
            }),
            Mode::Replace => {
                let Some(replaced_text) = replaced_text else {
                    return Err(EvaluationError::parse(record, "replace output has no replaced-text record"));
                };
                Ok(ParseOutcome::Matches {
                    matches,
                    replaced_text: Some(replaced_text),
                })
            }
        }
    }

    fn require(&self, condition: bool, record: usize, message: &str) -> Result<(), EvaluationError> {
        if condition {
            Ok(())
        } else {
            Err(EvaluationError::parse(record, message))
        }
    }

    /// Converts evaluator offsets into character offsets into the subject
    fn span_bounds(&self, (begin, end): (i64, i64), record: usize) -> Result<(usize, usize), EvaluationError> {
        if begin < 0 || end < 0 {
            return Err(EvaluationError::parse(
                record,
                format!("negative offset in {}..{}", begin, end),
            ));
        }
        if begin > end {
            return Err(EvaluationError::parse(
                record,
                format!("span begins after it ends: {}..{}", begin, end),
            ));
        }
        let begin = self.to_char_offset(begin as u64, record)?;
        let end = self.to_char_offset(end as u64, record)?;
        Ok((begin, end))
    }

    fn to_char_offset(&self, offset: u64, record: usize) -> Result<usize, EvaluationError> {
        let char_count = self.char_starts.len() - 1;
        let out_of_range = || {
            EvaluationError::parse(
                record,
                format!("offset {} lies outside the subject", offset),
            )
        };
        let offset = usize::try_from(offset).map_err(|_| out_of_range())?;

        match self.encoding {
            Encoding::Utf8 if offset <= char_count => Ok(offset),
            Encoding::Utf8 => Err(out_of_range()),
            Encoding::Bytes => {
                if offset > self.subject.len() {
                    return Err(out_of_range());
                }
                self.char_starts.binary_search(&offset).map_err(|_| {
                    EvaluationError::parse(
                        record,
                        format!("byte offset {} splits a character", offset),
                    )
                })
            }
        }
    }

    /// Subject text between two character offsets
    fn slice(&self, begin: usize, end: usize) -> &'a str {
        &self.subject[self.char_starts[begin]..self.char_starts[end]]
    }

    /// Payload text; byte-mode payloads may cut characters apart
    fn decode<'p>(&self, payload: &'p [u8], record: usize) -> Result<Cow<'p, str>, EvaluationError> {
        match self.encoding {
            Encoding::Utf8 => std::str::from_utf8(payload)
                .map(Cow::Borrowed)
                .map_err(|e| EvaluationError::parse(record, format!("payload is not UTF-8: {}", e))),
            Encoding::Bytes => Ok(String::from_utf8_lossy(payload)),
        }
    }
}

/// Cursor over the raw record stream
struct RecordReader<'r> {
    raw: &'r [u8],
    pos: usize,
    /// Number of records started so far
    index: usize,
}

impl<'r> RecordReader<'r> {
    fn new(raw: &'r [u8]) -> Self {
        Self { raw, pos: 0, index: 0 }
    }

    fn error(&self, message: impl Into<String>) -> EvaluationError {
        EvaluationError::parse(self.index.max(1), message)
    }

    /// Reads `TAG\t`; `None` at end of input
    fn next_tag(&mut self) -> Result<Option<u8>, EvaluationError> {
        if self.pos >= self.raw.len() {
            return Ok(None);
        }
        self.index += 1;
        let tag = self.raw[self.pos];
        if self.raw.get(self.pos + 1) != Some(&b'\t') {
            return Err(self.error("record tag is not followed by a tab"));
        }
        self.pos += 2;
        Ok(Some(tag))
    }

    /// Rest of the current line, consuming the newline
    fn line(&mut self) -> Result<&'r [u8], EvaluationError> {
        let rest = &self.raw[self.pos..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            return Err(self.error("record is not terminated by a newline"));
        };
        self.pos += newline + 1;
        Ok(&rest[..newline])
    }

    fn fields(&mut self) -> Result<Vec<&'r str>, EvaluationError> {
        let line = self.line()?;
        let line = std::str::from_utf8(line).map_err(|_| self.error("numeric record is not ASCII"))?;
        Ok(line.split('\t').collect())
    }

    /// `begin\tend`
    fn offsets(&mut self) -> Result<(i64, i64), EvaluationError> {
        let fields = self.fields()?;
        if fields.len() != 2 {
            return Err(self.error(format!("expected 2 offset fields, found {}", fields.len())));
        }
        let begin = self.integer(fields[0])?;
        let end = self.integer(fields[1])?;
        if (begin == -1) != (end == -1) {
            return Err(self.error(format!("half-missing offsets {}..{}", begin, end)));
        }
        Ok((begin, end))
    }

    fn count(&mut self) -> Result<usize, EvaluationError> {
        let fields = self.fields()?;
        if fields.len() != 1 {
            return Err(self.error(format!("expected 1 count field, found {}", fields.len())));
        }
        fields[0]
            .parse::<usize>()
            .map_err(|_| self.error(format!("count '{}' is not a number", fields[0])))
    }

    fn integer(&self, field: &str) -> Result<i64, EvaluationError> {
        // Reject "+3" and friends that str::parse would accept
        let digits = field.strip_prefix('-').unwrap_or(field);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(self.error(format!("offset '{}' is not a number", field)));
        }
        field
            .parse::<i64>()
            .map_err(|_| self.error(format!("offset '{}' is out of range", field)))
    }

    /// `len:bytes\n`
    fn payload(&mut self) -> Result<&'r [u8], EvaluationError> {
        let rest = &self.raw[self.pos..];
        let Some(colon) = rest.iter().position(|&b| b == b':') else {
            return Err(self.error("text record has no length prefix"));
        };
        let digits = &rest[..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(self.error("text record length is not a number"));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| self.error("text record length is out of range"))?;

        let start = colon + 1;
        let Some(end) = start.checked_add(len).filter(|&end| end < rest.len()) else {
            return Err(self.error(format!("text record announces {} bytes past the end of output", len)));
        };
        if rest[end] != b'\n' {
            return Err(self.error("text record is longer than its length prefix"));
        }
        self.pos += end + 1;
        Ok(&rest[start..end])
    }

    fn expect_end(&self) -> Result<(), EvaluationError> {
        if self.pos < self.raw.len() {
            return Err(EvaluationError::parse(
                self.index + 1,
                "output continues after the final record",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::rstest;

    fn parse(mode: Mode, subject: &str, raw: &str) -> Result<ParseOutcome, EvaluationError> {
        ResultParser::new(mode, Encoding::Utf8, subject).parse(raw.as_bytes())
    }

    fn matches_of(outcome: ParseOutcome) -> Vec<Match> {
        match outcome {
            ParseOutcome::Matches { matches, .. } => matches,
            other => panic!("expected matches, got {:?}", other),
        }
    }

    #[test]
    fn test_find_all_matches() {
        let outcome = parse(Mode::Match, "aaa bb aa", "M\t0\t3\nM\t7\t9\nD\t2\n").unwrap();
        let matches = matches_of(outcome);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].number(), 1);
        assert_eq!(matches[0].span().range(), Some((0, 3)));
        assert_eq!(matches[0].text(), "aaa");
        assert_eq!(matches[1].number(), 2);
        assert_eq!(matches[1].text(), "aa");
    }

    #[test]
    fn test_captures_are_numbered_in_order() {
        let outcome = parse(Mode::Match, "ab", "M\t0\t2\nC\t0\t1\nC\t1\t2\nD\t1\n").unwrap();
        let matches = matches_of(outcome);
        let captures = matches[0].captures();
        assert_eq!(captures.len(), 2);
        assert_eq!((captures[0].number(), captures[0].text()), (1, "a"));
        assert_eq!((captures[1].number(), captures[1].text()), (2, "b"));
    }

    #[test]
    fn test_non_participating_capture() {
        let outcome = parse(Mode::Match, "b", "M\t0\t1\nC\t-1\t-1\nC\t0\t1\nD\t1\n").unwrap();
        let matches = matches_of(outcome);
        let first = &matches[0].captures()[0];
        assert!(!first.participated());
        assert_eq!(first.text(), "");
        assert_eq!(matches[0].captures()[1].number(), 2);
    }

    #[rstest]
    #[case::keep_out(r"(a)\Kb", "ab", "M\t1\t2\nC\t0\t1\nD\t1\n", "a")]
    #[case::lookahead(r"(?=(ab))a", "ab", "M\t0\t1\nC\t0\t2\nD\t1\n", "ab")]
    #[case::lookbehind(r"(?<=(x))y", "xy", "M\t1\t2\nC\t0\t1\nD\t1\n", "x")]
    fn test_capture_outside_match_loses_positions(
        #[case] _pattern: &str,
        #[case] subject: &str,
        #[case] raw: &str,
        #[case] text: &str,
    ) {
        let matches = matches_of(parse(Mode::Match, subject, raw).unwrap());
        let capture = &matches[0].captures()[0];
        assert!(capture.participated());
        assert_eq!(capture.span().range(), None);
        assert_eq!(capture.text(), text);
    }

    #[test]
    fn test_capture_on_match_boundary_keeps_positions() {
        let matches = matches_of(parse(Mode::Match, "abc", "M\t1\t3\nC\t1\t1\nC\t3\t3\nD\t1\n").unwrap());
        let ranges: Vec<_> = matches[0].captures().iter().map(|c| c.span().range()).collect();
        assert_eq!(ranges, vec![Some((1, 1)), Some((3, 3))]);
    }

    #[test]
    fn test_no_matches() {
        let outcome = parse(Mode::Match, "xyz", "D\t0\n").unwrap();
        assert!(matches_of(outcome).is_empty());
    }

    #[test]
    fn test_offsets_are_characters_in_utf8_mode() {
        let outcome = parse(Mode::Match, "héllo wörld", "M\t6\t11\nD\t1\n").unwrap();
        assert_eq!(matches_of(outcome)[0].text(), "wörld");
    }

    #[test]
    fn test_byte_offsets_convert_to_characters() {
        let parser = ResultParser::new(Mode::Match, Encoding::Bytes, "héllo wörld");
        let outcome = parser.parse(b"M\t7\t13\nD\t1\n").unwrap();
        let matches = matches_of(outcome);
        assert_eq!(matches[0].span().range(), Some((6, 11)));
        assert_eq!(matches[0].text(), "wörld");
    }

    #[test]
    fn test_byte_offset_inside_character_is_rejected() {
        let parser = ResultParser::new(Mode::Match, Encoding::Bytes, "é");
        let err = parser.parse(b"M\t0\t1\nD\t1\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_replace_output() {
        let raw = "M\t0\t1\nR\t1:X\nM\t2\t3\nR\t3:\tY\n\nT\t7:X-\tY\n-b\nD\t2\n";
        let outcome = parse(Mode::Replace, "a-a-b", raw).unwrap();
        let ParseOutcome::Matches { matches, replaced_text } = outcome else {
            panic!("expected matches");
        };
        assert_eq!(matches[0].replacement().map(Label::text), Some("X"));
        assert_eq!(matches[1].replacement().map(Label::text), Some("\tY\n"));
        assert_eq!(replaced_text.as_deref(), Some("X-\tY\n-b"));
    }

    #[test]
    fn test_replacement_payload_counts_bytes() {
        let outcome = parse(Mode::Replace, "a", "M\t0\t1\nR\t2:é\nT\t2:é\nD\t1\n").unwrap();
        let matches = matches_of(outcome);
        assert_eq!(matches[0].replacement().map(Label::text), Some("é"));
    }

    #[test]
    fn test_split_output_keeps_empty_segments() {
        let raw = "S\t1:x\nS\t1:y\nS\t0:\nS\t1:z\nD\t4\n";
        let outcome = parse(Mode::Split, "x,y,,z", raw).unwrap();
        let ParseOutcome::Splits(splits) = outcome else {
            panic!("expected splits");
        };
        let texts: Vec<&str> = splits.iter().map(TextSpan::text).collect();
        assert_eq!(texts, vec!["x", "y", "", "z"]);
        assert!(splits.iter().all(|s| !s.has_positions()));
    }

    #[test]
    fn test_rejection() {
        let raw = "X\t20:Unmatched ( in regex\n";
        assert_eq!(
            parse(Mode::Match, "a", raw).unwrap(),
            ParseOutcome::Rejected("Unmatched ( in regex".to_string())
        );
    }

    #[rstest]
    #[case::empty_output(Mode::Match, "")]
    #[case::missing_terminator(Mode::Match, "M\t0\t1\n")]
    #[case::unknown_tag(Mode::Match, "Q\t0\t1\nD\t0\n")]
    #[case::wrong_field_count(Mode::Match, "M\t0\nD\t1\n")]
    #[case::extra_field(Mode::Match, "M\t0\t1\t2\nD\t1\n")]
    #[case::non_numeric(Mode::Match, "M\ta\t1\nD\t1\n")]
    #[case::plus_sign(Mode::Match, "M\t+0\t1\nD\t1\n")]
    #[case::inverted(Mode::Match, "M\t1\t0\nD\t1\n")]
    #[case::past_subject(Mode::Match, "M\t0\t4\nD\t1\n")]
    #[case::negative_match(Mode::Match, "M\t-1\t-1\nD\t1\n")]
    #[case::half_missing_capture(Mode::Match, "M\t0\t1\nC\t-1\t0\nD\t1\n")]
    #[case::capture_first(Mode::Match, "C\t0\t1\nD\t0\n")]
    #[case::count_mismatch(Mode::Match, "M\t0\t1\nD\t2\n")]
    #[case::after_terminator(Mode::Match, "D\t0\nM\t0\t1\n")]
    #[case::no_newline(Mode::Match, "D\t0")]
    #[case::no_tab(Mode::Match, "D0\n")]
    #[case::split_in_match(Mode::Match, "S\t1:a\nD\t0\n")]
    #[case::match_in_split(Mode::Split, "M\t0\t1\nD\t0\n")]
    #[case::short_payload(Mode::Split, "S\t5:ab\nD\t1\n")]
    #[case::long_payload(Mode::Split, "S\t1:ab\nD\t1\n")]
    #[case::no_length(Mode::Split, "S\tab\nD\t1\n")]
    #[case::missing_replacement(Mode::Replace, "M\t0\t1\nM\t1\t2\nR\t1:x\nT\t2:xx\nD\t2\n")]
    #[case::missing_replaced_text(Mode::Replace, "M\t0\t1\nR\t1:x\nD\t1\n")]
    #[case::late_rejection(Mode::Match, "D\t0\nX\t1:x\n")]
    #[case::rejection_then_more(Mode::Match, "X\t1:x\nD\t0\n")]
    fn test_malformed_output_is_rejected(#[case] mode: Mode, #[case] raw: &str) {
        let err = parse(mode, "abc", raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse, "raw: {:?}", raw);
    }

    #[test]
    fn test_parse_error_names_the_record() {
        let err = parse(Mode::Match, "abc", "M\t0\t1\nM\t0\t9\nD\t2\n").unwrap_err();
        match err {
            EvaluationError::Parse { record, .. } => assert_eq!(record, 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_invalid_utf8_payload_is_rejected_in_utf8_mode() {
        let parser = ResultParser::new(Mode::Split, Encoding::Utf8, "a");
        let err = parser.parse(b"S\t1:\xff\nD\t1\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);

        let parser = ResultParser::new(Mode::Split, Encoding::Bytes, "a");
        assert!(parser.parse(b"S\t1:\xff\nD\t1\n").is_ok());
    }
}
