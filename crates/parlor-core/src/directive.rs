//! Control directives embedded in generated text.
//!
//! The provider is told to prefix a rename request with
//! `<<NAME_CHANGE:NewName>>`.  The grammar is a generic `<<KEYWORD:argument>>`
//! frame; [`KEYWORDS`] lists the keywords that are understood today.  Anything
//! that does not parse as a known, well-formed directive stays literal text.
//!
//! [`scan`] runs over the whole accumulated buffer every time it grows, so it
//! must be deterministic: as text is appended the first complete directive
//! never moves.

use std::ops::Range;

/// Opening delimiter of every directive frame.
pub const OPEN: &str = "<<";
/// Closing delimiter of every directive frame.
pub const CLOSE: &str = ">>";
/// Keyword of the rename directive.
pub const NAME_CHANGE: &str = "NAME_CHANGE";

/// Longest assistant name a rename directive may carry, in characters.
pub const MAX_NAME_CHARS: usize = 64;

/// Keywords understood by the parser, with the constructor for each.
const KEYWORDS: &[(&str, fn(&str) -> Option<Directive>)] = &[(NAME_CHANGE, rename)];

/// A parsed control directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Rename the assistant identity for this user.
    Rename { name: String },
}

/// Result of scanning an accumulated buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// Both delimiters present; `span` covers the whole marker.
    Complete { directive: Directive, span: Range<usize> },
    /// An opening frame was seen but the closing delimiter has not arrived.
    Incomplete { start: usize },
    /// No directive in the text.
    Absent,
}

/// Text with the first complete directive removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub clean_text: String,
    pub directive: Option<Directive>,
}

/// Locate the first complete directive in `text`.
pub fn scan(text: &str) -> Scan {
    let mut from = 0;
    while let Some(offset) = text[from..].find(OPEN) {
        let start = from + offset;
        let rest = &text[start + OPEN.len()..];

        for (keyword, build) in KEYWORDS {
            match frame_argument(rest, keyword) {
                Frame::Argument(arg_end) => {
                    let arg = &rest[keyword.len() + 1..arg_end];
                    if let Some(directive) = build(arg) {
                        let end = start + OPEN.len() + arg_end + CLOSE.len();
                        return Scan::Complete {
                            directive,
                            span: start..end,
                        };
                    }
                }
                Frame::Unterminated | Frame::Truncated => return Scan::Incomplete { start },
                Frame::Mismatch => {}
            }
        }

        // `<<<NAME_CHANGE:…>>` must still match at the second `<`.
        from = start + 1;
    }

    if ends_with_lone_open_bracket(text) {
        return Scan::Incomplete {
            start: text.len() - 1,
        };
    }

    Scan::Absent
}

/// Strip the first complete directive from `text`.
pub fn parse(text: &str) -> Parsed {
    match scan(text) {
        Scan::Complete { directive, span } => {
            let mut clean_text = String::with_capacity(text.len() - span.len());
            clean_text.push_str(&text[..span.start]);
            clean_text.push_str(&text[span.end..]);
            Parsed {
                clean_text,
                directive: Some(directive),
            }
        }
        Scan::Incomplete { .. } | Scan::Absent => Parsed {
            clean_text: text.to_owned(),
            directive: None,
        },
    }
}

/// System instructions telling the provider who it is and how to rename itself.
pub fn system_instructions(base_prompt: &str, assistant_name: &str) -> String {
    let mut out = String::new();
    let base = base_prompt.trim();
    if !base.is_empty() {
        out.push_str(base);
        out.push_str("\n\n");
    }
    out.push_str(&format!("Your name is {assistant_name}.\n"));
    out.push_str(&format!(
        "If the user asks you to change your name, begin your reply with \
         {OPEN}{NAME_CHANGE}:NewName{CLOSE} before any other content, \
         then continue your answer normally. Never emit the marker otherwise."
    ));
    out
}

enum Frame {
    /// Keyword and `:` matched; the value is the offset of `CLOSE` in `rest`.
    Argument(usize),
    /// Keyword and `:` matched but `CLOSE` never follows.
    Unterminated,
    /// `rest` is a strict prefix of `KEYWORD:`; more text may complete it.
    Truncated,
    /// Not this keyword.
    Mismatch,
}

fn frame_argument(rest: &str, keyword: &str) -> Frame {
    let head_len = keyword.len() + 1;
    if rest.len() < head_len {
        let head = format!("{keyword}:");
        return if head.starts_with(rest) {
            Frame::Truncated
        } else {
            Frame::Mismatch
        };
    }
    if !rest.starts_with(keyword) || rest.as_bytes()[keyword.len()] != b':' {
        return Frame::Mismatch;
    }
    match rest[head_len..].find(CLOSE) {
        Some(pos) => Frame::Argument(head_len + pos),
        None => Frame::Unterminated,
    }
}

fn rename(arg: &str) -> Option<Directive> {
    let name = arg.trim();
    let valid = !name.is_empty()
        && name.chars().count() <= MAX_NAME_CHARS
        && !name.chars().any(|c| c.is_control() || c == '<' || c == '>');
    valid.then(|| Directive::Rename {
        name: name.to_owned(),
    })
}

/// A single trailing `<` may be the start of a frame; `<<` is handled by the
/// main loop in [`scan`].
fn ends_with_lone_open_bracket(text: &str) -> bool {
    text.ends_with('<') && !text.ends_with(OPEN)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rename_to(name: &str) -> Option<Directive> {
        Some(Directive::Rename { name: name.into() })
    }

    #[test]
    fn complete_marker_is_extracted_and_stripped() {
        let parsed = parse("<<NAME_CHANGE:Jarvis>>Hello there");
        assert_eq!(parsed.clean_text, "Hello there");
        assert_eq!(parsed.directive, rename_to("Jarvis"));
    }

    #[test]
    fn name_is_trimmed() {
        let parsed = parse("<<NAME_CHANGE:  Ada Lovelace \t>>Hi");
        assert_eq!(parsed.directive, rename_to("Ada Lovelace"));
        assert_eq!(parsed.clean_text, "Hi");
    }

    #[test]
    fn marker_is_accepted_mid_text() {
        let parsed = parse("Sure! <<NAME_CHANGE:Max>>Done.");
        assert_eq!(parsed.directive, rename_to("Max"));
        assert_eq!(parsed.clean_text, "Sure! Done.");
    }

    #[test]
    fn truncated_keyword_is_incomplete() {
        assert_eq!(scan("<<NAME_CHA"), Scan::Incomplete { start: 0 });
        let parsed = parse("<<NAME_CHA");
        assert_eq!(parsed.clean_text, "<<NAME_CHA");
        assert_eq!(parsed.directive, None);
    }

    #[test]
    fn missing_close_is_incomplete() {
        assert_eq!(scan("ok <<NAME_CHANGE:Jar"), Scan::Incomplete { start: 3 });
        assert_eq!(parse("ok <<NAME_CHANGE:Jar").clean_text, "ok <<NAME_CHANGE:Jar");
    }

    #[test]
    fn trailing_open_delimiter_is_incomplete() {
        assert_eq!(scan("Hello <"), Scan::Incomplete { start: 6 });
        assert_eq!(scan("Hello <<"), Scan::Incomplete { start: 6 });
    }

    #[test]
    fn plain_text_is_absent() {
        assert_eq!(scan("just a reply"), Scan::Absent);
        assert_eq!(scan("a << b >> c"), Scan::Absent);
        assert_eq!(scan(""), Scan::Absent);
    }

    #[test]
    fn only_first_complete_marker_is_taken() {
        let text = "<<NAME_CHANGE:A>>x<<NAME_CHANGE:B>>";
        let parsed = parse(text);
        assert_eq!(parsed.directive, rename_to("A"));
        assert_eq!(parsed.clean_text, "x<<NAME_CHANGE:B>>");
    }

    #[test]
    fn first_marker_does_not_move_as_text_grows() {
        let mut buffer = String::new();
        let mut first = None;
        for piece in ["<<NAME_", "CHANGE:Jar", "vis>>", "Hi ", "<<NAME_CHANGE:Other>>"] {
            buffer.push_str(piece);
            if let Scan::Complete { span, .. } = scan(&buffer) {
                first.get_or_insert(span.clone());
                assert_eq!(Some(span), first.clone());
            }
        }
        assert_eq!(first, Some(0..22));
    }

    #[test]
    fn invalid_names_stay_literal() {
        assert_eq!(scan("<<NAME_CHANGE:   >>hi"), Scan::Absent);
        let long = format!("<<NAME_CHANGE:{}>>", "x".repeat(MAX_NAME_CHARS + 1));
        assert_eq!(scan(&long), Scan::Absent);
        assert_eq!(scan("<<NAME_CHANGE:a\nb>>"), Scan::Absent);
    }

    #[test]
    fn scanning_continues_past_invalid_marker() {
        let parsed = parse("<<NAME_CHANGE: >> then <<NAME_CHANGE:Bo>>!");
        assert_eq!(parsed.directive, rename_to("Bo"));
        assert_eq!(parsed.clean_text, "<<NAME_CHANGE: >> then !");
    }

    #[test]
    fn extra_leading_bracket_still_matches() {
        let parsed = parse("<<<NAME_CHANGE:Zed>>");
        assert_eq!(parsed.directive, rename_to("Zed"));
        assert_eq!(parsed.clean_text, "<");
    }

    #[test]
    fn unknown_keyword_is_literal() {
        assert_eq!(scan("<<COLOR:blue>>"), Scan::Absent);
    }

    #[test]
    fn instructions_mention_name_and_marker() {
        let text = system_instructions("Be brief.", "Jarvis");
        assert!(text.starts_with("Be brief."));
        assert!(text.contains("Your name is Jarvis."));
        assert!(text.contains("<<NAME_CHANGE:NewName>>"));
    }
}
