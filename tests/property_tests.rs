//! Property-based tests for rexhibit
//!
//! This module uses proptest to verify core invariants of the result parser
//! and the program builder over generated subjects and record streams.

use proptest::prelude::*;

use rexhibit::program::quote_literal;
use rexhibit::{
    Encoding, EvaluatorVersion, MatchRequest, Mode, Modifier, ParseOutcome, ProgramBuilder,
    ResultParser,
};

/// A subject and non-overlapping, ascending character spans inside it
fn subject_and_spans() -> impl Strategy<Value = (String, Vec<(usize, usize)>)> {
    "[a-zé中 \n]{0,24}".prop_flat_map(|subject| {
        let len = subject.chars().count();
        let cuts = prop::collection::vec(0..=len, 0..8);
        (Just(subject), cuts).prop_map(|(subject, mut cuts)| {
            cuts.sort_unstable();
            let spans = cuts.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect();
            (subject, spans)
        })
    })
}

fn char_slice(subject: &str, begin: usize, end: usize) -> String {
    subject.chars().skip(begin).take(end - begin).collect()
}

fn byte_offset(subject: &str, chars: usize) -> usize {
    subject
        .char_indices()
        .nth(chars)
        .map(|(offset, _)| offset)
        .unwrap_or(subject.len())
}

fn match_records(spans: &[(usize, usize)]) -> String {
    let mut raw = String::new();
    for (begin, end) in spans {
        raw.push_str(&format!("M\t{}\t{}\n", begin, end));
    }
    raw.push_str(&format!("D\t{}\n", spans.len()));
    raw
}

// ============================================================================
// Property 1: Match records slice the subject
// ============================================================================

proptest! {
    /// Each reported match carries exactly the subject text between its offsets,
    /// numbered from 1 in emission order
    #[test]
    fn prop_matches_slice_subject((subject, spans) in subject_and_spans()) {
        let raw = match_records(&spans);
        let outcome = ResultParser::new(Mode::Match, Encoding::Utf8, &subject)
            .parse(raw.as_bytes())
            .unwrap();

        let ParseOutcome::Matches { matches, replaced_text } = outcome else {
            panic!("match mode produced a non-match outcome");
        };
        prop_assert!(replaced_text.is_none());
        prop_assert_eq!(matches.len(), spans.len());
        for (index, (m, (begin, end))) in matches.iter().zip(&spans).enumerate() {
            prop_assert_eq!(m.number(), index + 1);
            prop_assert_eq!(m.span().range(), Some((*begin, *end)));
            prop_assert_eq!(m.text(), char_slice(&subject, *begin, *end));
        }
    }

    /// Byte offsets from a bytes-mode evaluator land on the same characters
    #[test]
    fn prop_byte_offsets_map_to_characters((subject, spans) in subject_and_spans()) {
        let byte_spans: Vec<(usize, usize)> = spans
            .iter()
            .map(|(b, e)| (byte_offset(&subject, *b), byte_offset(&subject, *e)))
            .collect();
        let raw = match_records(&byte_spans);
        let outcome = ResultParser::new(Mode::Match, Encoding::Bytes, &subject)
            .parse(raw.as_bytes())
            .unwrap();

        let ParseOutcome::Matches { matches, .. } = outcome else {
            panic!("match mode produced a non-match outcome");
        };
        let ranges: Vec<_> = matches.iter().filter_map(|m| m.span().range()).collect();
        prop_assert_eq!(ranges, spans);
    }
}

/// A subject, one match span and capture spans anywhere in the subject
fn subject_match_and_captures() -> impl Strategy<Value = (String, (usize, usize), Vec<(usize, usize)>)> {
    "[a-zé中 ]{1,24}".prop_flat_map(|subject| {
        let len = subject.chars().count();
        let span = || (0..=len, 0..=len).prop_map(|(a, b)| (a.min(b), a.max(b)));
        (Just(subject), span(), prop::collection::vec(span(), 0..6))
    })
}

proptest! {
    /// Every positioned capture lies within its match; captures reported
    /// outside it keep their text but lose their positions
    #[test]
    fn prop_positioned_captures_lie_within_match(
        (subject, (begin, end), captures) in subject_match_and_captures()
    ) {
        let mut raw = format!("M\t{}\t{}\n", begin, end);
        for (capture_begin, capture_end) in &captures {
            raw.push_str(&format!("C\t{}\t{}\n", capture_begin, capture_end));
        }
        raw.push_str("D\t1\n");

        let outcome = ResultParser::new(Mode::Match, Encoding::Utf8, &subject)
            .parse(raw.as_bytes())
            .unwrap();
        let ParseOutcome::Matches { matches, .. } = outcome else {
            panic!("match mode produced a non-match outcome");
        };
        let m = &matches[0];
        prop_assert_eq!(m.capture_count(), captures.len());

        for (index, (c, (capture_begin, capture_end))) in m.captures().iter().zip(&captures).enumerate() {
            prop_assert_eq!(c.number(), index + 1);
            prop_assert!(c.participated());
            prop_assert_eq!(c.text(), char_slice(&subject, *capture_begin, *capture_end));
            let inside = begin <= *capture_begin && *capture_end <= end;
            match c.span().range() {
                Some((b, e)) => {
                    prop_assert!(inside);
                    prop_assert!(begin <= b && b <= e && e <= end);
                    prop_assert!(m.span().contains(c.span()));
                }
                None => prop_assert!(!inside),
            }
        }
    }
}

// ============================================================================
// Property 2: Damaged output never yields a partial tree
// ============================================================================

proptest! {
    /// Any strict prefix of valid output is rejected
    #[test]
    fn prop_truncated_output_is_rejected(
        (subject, spans) in subject_and_spans(),
        cut in any::<prop::sample::Index>()
    ) {
        let raw = match_records(&spans);
        let cut = cut.index(raw.len());
        let result = ResultParser::new(Mode::Match, Encoding::Utf8, &subject)
            .parse(&raw.as_bytes()[..cut]);
        prop_assert!(result.is_err());
    }

    /// Flipping one byte either fails the parse or still yields a consistent tree
    #[test]
    fn prop_corrupted_output_is_all_or_nothing(
        (subject, spans) in subject_and_spans(),
        position in any::<prop::sample::Index>(),
        byte in any::<u8>()
    ) {
        let mut raw = match_records(&spans).into_bytes();
        let position = position.index(raw.len());
        raw[position] = byte;

        if let Ok(ParseOutcome::Matches { matches, .. }) =
            ResultParser::new(Mode::Match, Encoding::Utf8, &subject).parse(&raw)
        {
            let len = subject.chars().count();
            for (index, m) in matches.iter().enumerate() {
                prop_assert_eq!(m.number(), index + 1);
                let (begin, end) = m.span().range().unwrap();
                prop_assert!(begin <= end && end <= len);
                prop_assert_eq!(m.text(), char_slice(&subject, begin, end));
            }
        }
    }

    /// Split segments keep their order and text
    #[test]
    fn prop_split_segments_in_order(segments in prop::collection::vec("[a-z,é]{0,6}", 0..6)) {
        let mut raw = String::new();
        for segment in &segments {
            raw.push_str(&format!("S\t{}:{}\n", segment.len(), segment));
        }
        raw.push_str(&format!("D\t{}\n", segments.len()));

        let outcome = ResultParser::new(Mode::Split, Encoding::Utf8, "")
            .parse(raw.as_bytes())
            .unwrap();
        let ParseOutcome::Splits(spans) = outcome else {
            panic!("split mode produced a non-split outcome");
        };
        let texts: Vec<&str> = spans.iter().map(|s| s.text()).collect();
        prop_assert_eq!(texts, segments.iter().map(String::as_str).collect::<Vec<_>>());
    }
}

// ============================================================================
// Property 3: Program building
// ============================================================================

/// Reads back a literal produced by `quote_literal` in UTF-8 mode
fn unquote(literal: &str) -> Option<String> {
    let body = literal.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::new();
    let mut rest = body;
    while let Some(c) = rest.chars().next() {
        if c == '\\' {
            let hex_start = rest.strip_prefix("\\x{")?;
            let close = hex_start.find('}')?;
            let code = u32::from_str_radix(&hex_start[..close], 16).ok()?;
            out.push(char::from_u32(code)?);
            rest = &hex_start[close + 1..];
        } else {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    Some(out)
}

proptest! {
    /// Quoted literals never carry interpolating characters and decode to the input
    #[test]
    fn prop_quote_literal_is_inert(text in any::<String>()) {
        let literal = quote_literal(&text, Encoding::Utf8);
        let body = &literal[1..literal.len() - 1];
        prop_assert!(!body.contains('$'));
        prop_assert!(!body.contains('@'));
        prop_assert!(!body.contains('"'));
        prop_assert_eq!(unquote(&literal), Some(text));
    }

    /// Bytes-mode literals are pure ASCII
    #[test]
    fn prop_bytes_literal_is_ascii(text in any::<String>()) {
        prop_assert!(quote_literal(&text, Encoding::Bytes).is_ascii());
    }

    /// Safe-mode programs never contain the pattern or replacement verbatim
    /// when they hold interpolating characters
    #[test]
    fn prop_safe_program_hides_sigils(
        pattern in "[A-Z]{1,4}[$@][A-Z]{2,4}",
        replacement in "[A-Z]{1,4}@[A-Z]{2,4}"
    ) {
        let request = MatchRequest::replacing(pattern.clone(), replacement.clone(), "subject")
            .with_modifier(Modifier::FindAll);
        let program = ProgramBuilder::new(EvaluatorVersion::MODERN).build(&request).unwrap();
        prop_assert!(!program.contains(&pattern));
        prop_assert!(!program.contains(&replacement));
    }

    /// The same request always produces the same program
    #[test]
    fn prop_build_is_deterministic(
        pattern in "[a-z().*+?|]{0,10}",
        subject in "[a-z ]{0,20}",
        find_all in any::<bool>(),
        case_insensitive in any::<bool>()
    ) {
        let mut request = MatchRequest::matching(pattern, subject);
        if find_all {
            request = request.with_modifier(Modifier::FindAll);
        }
        if case_insensitive {
            request = request.with_modifier(Modifier::CaseInsensitive);
        }
        let builder = ProgramBuilder::new(EvaluatorVersion::MODERN);
        prop_assert_eq!(builder.build(&request).unwrap(), builder.build(&request).unwrap());
    }
}
