//! Evaluator program generation
//!
//! [`ProgramBuilder`] turns a [`MatchRequest`] into the text of a Perl
//! program. The subject text is not part of the program; it arrives on
//! standard input. The program answers with the record stream read back by
//! [`crate::parser::ResultParser`]:
//!
//! ```text
//! M <tab> begin <tab> end        one match
//! C <tab> begin <tab> end        capture of the preceding match (-1 -1: did not participate)
//! R <tab> len:bytes              replacement of the preceding match
//! S <tab> len:bytes              split segment
//! T <tab> len:bytes              full replaced text
//! X <tab> len:bytes              pattern rejected; no other record follows
//! D <tab> count                  end of output
//! ```
//!
//! Unless the request allows code, pattern and replacement only ever reach
//! Perl as hex-escaped string literals, so no character the user types is
//! read as Perl source.

use tracing::debug;

use crate::error::EvaluationError;
use crate::request::{Encoding, MatchRequest, Mode, Modifier};
use crate::version::EvaluatorVersion;

/// Builds evaluator programs for one evaluator version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramBuilder {
    version: EvaluatorVersion,
}

impl ProgramBuilder {
    pub fn new(version: EvaluatorVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> EvaluatorVersion {
        self.version
    }

    /// Generates the program for `request`
    ///
    /// The same request and version always give the same text. Fails with
    /// [`EvaluationError::Configuration`] when the evaluator is too old or a
    /// code-mode pattern or replacement cannot be delimited.
    pub fn build(&self, request: &MatchRequest) -> Result<String, EvaluationError> {
        if !self.version.is_supported() {
            return Err(EvaluationError::configuration(format!(
                "evaluator version {} is older than the minimum supported {}",
                self.version,
                EvaluatorVersion::MINIMUM
            )));
        }

        if request.allow_code {
            check_delimitable("pattern", &request.pattern)?;
            if request.mode == Mode::Replace {
                check_delimitable("replacement", request.replacement_template())?;
            }
        }

        let mut program = String::new();
        self.push_preamble(&mut program, request);
        self.push_helpers(&mut program, request);
        self.push_pattern(&mut program, request);

        match request.mode {
            Mode::Match => push_match_loop(&mut program, request),
            Mode::Replace => push_replace_loop(&mut program, request),
            Mode::Split => push_split(&mut program),
        }
        program.push_str("exit 0;\n");

        debug!(
            mode = %request.mode,
            allow_code = request.allow_code,
            flags = %self.flags(request),
            bytes = program.len(),
            "built evaluator program"
        );
        Ok(program)
    }

    /// Pattern flags in emission order, e.g. `ixsm`
    ///
    /// `FindAll` is not a flag; it selects the enumeration loop instead.
    pub fn flags(&self, request: &MatchRequest) -> String {
        let mut flags = String::new();
        for modifier in &request.modifiers {
            let flag = match modifier {
                Modifier::FindAll => continue,
                Modifier::CaseInsensitive => 'i',
                Modifier::ExtendedWhitespace => 'x',
                Modifier::DotMatchesNewline => 's',
                Modifier::Multiline => 'm',
                Modifier::Unicode if self.version.has_unicode_flag() => 'u',
                Modifier::Unicode => continue,
            };
            flags.push(flag);
        }
        flags
    }

    fn push_preamble(&self, program: &mut String, request: &MatchRequest) {
        program.push_str("use strict;\nuse warnings;\n");
        if request.allow_code {
            program.push_str("use re 'eval';\n");
            if request.encoding == Encoding::Utf8 {
                program.push_str("use utf8;\n");
            }
        }
        if request.has_modifier(Modifier::Unicode)
            && !self.version.has_unicode_flag()
            && self.version.has_unicode_strings_feature()
        {
            program.push_str("use feature 'unicode_strings';\n");
        }

        program.push_str("binmode(STDIN, ':raw');\nbinmode(STDOUT, ':raw');\n");
        program.push_str("my $text = do { local $/; <STDIN> };\n");
        program.push_str("$text = '' unless defined $text;\n");
        if request.encoding == Encoding::Utf8 {
            program.push_str("utf8::decode($text);\n");
        }
    }

    fn push_helpers(&self, program: &mut String, request: &MatchRequest) {
        program.push_str("sub emit { print join(\"\\t\", @_), \"\\n\"; }\n");
        program.push_str("sub literal {\n    my ($s) = @_;\n");
        if request.encoding == Encoding::Utf8 {
            program.push_str("    utf8::encode($s);\n");
        }
        program.push_str("    return length($s) . ':' . $s;\n}\n");

        if request.mode == Mode::Replace && !request.allow_code {
            program.push_str(&expand_routine(self.version));
        }
    }

    fn push_pattern(&self, program: &mut String, request: &MatchRequest) {
        let flags = self.flags(request);
        if request.allow_code {
            // Compile errors surface on stderr with Perl's own marker
            program.push_str(&format!("my $re = qr{{{}}}{};\n", request.pattern, flags));
            if request.mode == Mode::Replace {
                program.push_str(&format!(
                    "sub replacement {{ return qq{{{}}}; }}\n",
                    request.replacement_template()
                ));
            }
        } else {
            program.push_str(&format!(
                "my $pattern = {};\n",
                quote_literal(&request.pattern, request.encoding)
            ));
            program.push_str(&format!("my $re = eval {{ qr/$pattern/{} }};\n", flags));
            program.push_str("if (!defined $re) {\n");
            program.push_str("    my $err = $@;\n    $err =~ s/\\s+\\z//;\n");
            program.push_str("    emit('X', literal($err));\n    exit 0;\n}\n");
            if request.mode == Mode::Replace {
                program.push_str(&format!(
                    "my $template = {};\n",
                    quote_literal(request.replacement_template(), request.encoding)
                ));
            }
        }
    }
}

/// Opens the match loop and emits the M and C records of each match
fn push_match_head(program: &mut String, request: &MatchRequest) {
    program.push_str("my $count = 0;\n");
    if request.finds_all() {
        program.push_str("while ($text =~ /$re/g) {\n");
    } else {
        program.push_str("if ($text =~ $re) {\n");
    }
    program.push_str("    my @start = @-;\n    my @end = @+;\n    $count++;\n");
    if request.allow_code && request.mode == Mode::Replace {
        // Must run before any other regex resets $1 and friends
        program.push_str("    my $rep = replacement();\n");
    }
    program.push_str("    emit('M', $start[0], $end[0]);\n");
    program.push_str("    for my $i (1 .. $#end) {\n");
    program.push_str(
        "        emit('C', defined $start[$i] ? ($start[$i], $end[$i]) : (-1, -1));\n",
    );
    program.push_str("    }\n");
}

fn push_match_loop(program: &mut String, request: &MatchRequest) {
    push_match_head(program, request);
    program.push_str("}\nemit('D', $count);\n");
}

fn push_replace_loop(program: &mut String, request: &MatchRequest) {
    program.push_str("my $out = '';\nmy $last = 0;\n");
    push_match_head(program, request);
    if !request.allow_code {
        program.push_str(
            "    my @groups = map { defined $start[$_] ? substr($text, $start[$_], $end[$_] - $start[$_]) : undef } 1 .. $#end;\n",
        );
        program.push_str(
            "    my $rep = expand($template, substr($text, $start[0], $end[0] - $start[0]), @groups);\n",
        );
    }
    program.push_str("    emit('R', literal($rep));\n");
    program.push_str("    $out .= substr($text, $last, $start[0] - $last) . $rep;\n");
    program.push_str("    $last = $end[0];\n");
    program.push_str("}\n$out .= substr($text, $last);\n");
    program.push_str("emit('T', literal($out));\nemit('D', $count);\n");
}

fn push_split(program: &mut String) {
    program.push_str("my @parts = split $re, $text;\n");
    program.push_str("for my $part (@parts) {\n");
    program.push_str("    emit('S', literal(defined $part ? $part : ''));\n");
    program.push_str("}\nemit('D', scalar @parts);\n");
}

/// Perl routine expanding `$N`, `${N}`, `$&`, `\n`, `\t` and `\<char>`
fn expand_routine(version: EvaluatorVersion) -> String {
    let group = if version.has_defined_or() {
        "$n == 0 ? $whole : ($groups[$n - 1] // '')"
    } else {
        "$n == 0 ? $whole : (defined $groups[$n - 1] ? $groups[$n - 1] : '')"
    };

    let mut routine = String::new();
    routine.push_str("sub expand {\n");
    routine.push_str("    my ($template, $whole, @groups) = @_;\n");
    routine.push_str("    my $out = '';\n");
    routine.push_str("    while (length $template) {\n");
    routine.push_str("        if ($template =~ s/^\\$\\{(\\d+)\\}// || $template =~ s/^\\$(\\d+)//) {\n");
    routine.push_str("            my $n = $1;\n");
    routine.push_str(&format!("            $out .= {};\n", group));
    routine.push_str("        } elsif ($template =~ s/^\\$&//) {\n");
    routine.push_str("            $out .= $whole;\n");
    routine.push_str("        } elsif ($template =~ s/^\\\\n//) {\n");
    routine.push_str("            $out .= \"\\n\";\n");
    routine.push_str("        } elsif ($template =~ s/^\\\\t//) {\n");
    routine.push_str("            $out .= \"\\t\";\n");
    routine.push_str("        } elsif ($template =~ s/^\\\\(.)//s) {\n");
    routine.push_str("            $out .= $1;\n");
    routine.push_str("        } else {\n");
    routine.push_str("            $template =~ s/^(.)//s;\n");
    routine.push_str("            $out .= $1;\n");
    routine.push_str("        }\n");
    routine.push_str("    }\n");
    routine.push_str("    return $out;\n");
    routine.push_str("}\n");
    routine
}

/// Double-quoted Perl literal whose value is exactly `text`
///
/// Characters outside a conservative safe set are written as `\x{HEX}`, so
/// `$`, `@`, `\` and `"` never appear raw. In [`Encoding::Bytes`] every
/// UTF-8 byte of a non-safe character is escaped on its own.
pub fn quote_literal(text: &str, encoding: Encoding) -> String {
    let mut literal = String::with_capacity(text.len() + 2);
    literal.push('"');
    for c in text.chars() {
        if is_literal_safe(c) {
            literal.push(c);
            continue;
        }
        match encoding {
            Encoding::Utf8 => literal.push_str(&format!("\\x{{{:X}}}", c as u32)),
            Encoding::Bytes => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    literal.push_str(&format!("\\x{{{:X}}}", byte));
                }
            }
        }
    }
    literal.push('"');
    literal
}

fn is_literal_safe(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            ' ' | '_' | '-' | '.' | ',' | ':' | ';' | '!' | '?' | '#' | '%' | '&' | '\''
                | '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>' | '=' | '+' | '*' | '/'
                | '|' | '^' | '~' | '`'
        )
}

/// Code mode embeds text between braces; it must not close them early
fn check_delimitable(what: &str, text: &str) -> Result<(), EvaluationError> {
    let mut depth: usize = 0;
    let mut escaped = false;
    for (index, c) in text.chars().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    EvaluationError::configuration(format!(
                        "{} closes a brace it never opened at character {}",
                        what, index
                    ))
                })?;
            }
            _ => {}
        }
    }

    if depth > 0 {
        return Err(EvaluationError::configuration(format!(
            "{} leaves {} brace{} open; code mode needs balanced braces",
            what,
            depth,
            if depth == 1 { "" } else { "s" }
        )));
    }
    if escaped {
        return Err(EvaluationError::configuration(format!(
            "{} ends with a lone backslash",
            what
        )));
    }
    Ok(())
}
