use std::{fmt::Debug, ops::Range};

use ariadne::{CharSet, Label, Report, ReportKind};
use thiserror::Error;

use crate::{Expr, Grammar, Rule};

/// Error when reading a grammar
#[derive(Error)]
#[error("{source:}")]
pub struct GrammarParseError {
    source: GrammarParseErrorInfo,
    report: Report<(String, Range<usize>)>,
}

impl GrammarParseError {
    fn new<'a>(s: &'a str, source: String, err: GrammarParseErrorLimited<'a>) -> GrammarParseError {
        let (start, end) = string_pos(s, err.offender);

        let mut report = Report::build(ReportKind::Error, &source, start)
            .with_config(ariadne::Config::default().with_char_set(CharSet::Ascii))
            .with_message(err.data.to_string());

        let all = (source.clone(), start..end);

        match &err.data {
            GrammarParseErrorInfo::ExpectedRuleName => {
                report = report
                    .with_label(Label::new(all).with_message("a rule should start here"))
                    .with_note("rules look like `Name = expression`");
            }
            GrammarParseErrorInfo::ExpectedRuleDef { rule } => {
                report = report
                    .with_label(Label::new(all).with_message(format!(
                        "the rule {:?} needs a '=' before its expression",
                        rule
                    )))
                    .with_note("'<-' and '←' work too");
            }
            GrammarParseErrorInfo::ExpectedExpression => {
                report = report
                    .with_label(Label::new(all).with_message("expected an expression here"))
            }
            GrammarParseErrorInfo::ExpectedCloseParen => {
                report = report
                    .with_label(
                        Label::new(all)
                            .with_message("this '(' expects a ')' to close it, but there wasn't one"),
                    )
                    .with_note("try putting a ')' at the end");
            }
            GrammarParseErrorInfo::ExpectedCloseQuote { quote } => {
                report = report
                    .with_label(Label::new(all).with_message(format!(
                        "this {:?} expects a {:?} to close it, but none was found on this line (or it was escaped)",
                        quote, quote
                    )))
                    .with_note(format!("try putting a {:?} at the end", quote));
            }
            GrammarParseErrorInfo::InvalidEscape(_, problem) => {
                report = report.with_label(Label::new(all).with_message(problem.to_string()));
            }
            GrammarParseErrorInfo::ExpectedCloseBracket => {
                report = report
                    .with_label(
                        Label::new(all)
                            .with_message("this character class never ends"),
                    )
                    .with_note("try putting a ']' at the end");
            }
            GrammarParseErrorInfo::ExpectedCloseBrace => {
                report = report
                    .with_label(Label::new(all).with_message("this code block never ends"))
                    .with_note("braces inside code blocks must be balanced");
            }
            GrammarParseErrorInfo::ExpectedCloseBlockComment => {
                report = report
                    .with_label(Label::new(all).with_message("this block comment never ends"))
                    .with_note("try putting a \"*/\" at the end");
            }
            GrammarParseErrorInfo::MisplacedCode => {
                report = report
                    .with_label(Label::new(all).with_message("a code block can't go here"))
                    .with_note(
                        "code goes at the start of the grammar, after a sequence, or after '&' or '!'",
                    );
            }
            GrammarParseErrorInfo::IndeterminableToken => {
                report = report
                    .with_label(Label::new(all).with_message("this is unintelligible"))
                    .with_note(format!("the problem is {:?}", err.offender));
            }
        }

        GrammarParseError {
            report: report.finish(),
            source: err.data,
        }
    }

    pub fn report(&self) -> &Report<(String, Range<usize>)> {
        &self.report
    }

    pub fn source(&self) -> &GrammarParseErrorInfo {
        &self.source
    }
}

impl Debug for GrammarParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GrammarParseError")
            .field(&self.source)
            .finish()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GrammarParseErrorInfo {
    #[error("expected the name of a rule")]
    ExpectedRuleName,
    #[error("expected '=' after the name of rule {rule:?}")]
    ExpectedRuleDef { rule: String },
    #[error("expected an expression")]
    ExpectedExpression,
    /// This error should span from the opening paren to where the closer was expected
    #[error("expected a closing ')'")]
    ExpectedCloseParen,
    #[error("expected a closing {quote:?}")]
    ExpectedCloseQuote { quote: char },
    /// The usize is the position from the start of the string including the quote
    /// where the bad is
    #[error("bad escape sequence")]
    InvalidEscape(usize, InvalidEscape),
    #[error("expected a closing ']' to this character class")]
    ExpectedCloseBracket,
    #[error("expected a closing '}}' to this code block")]
    ExpectedCloseBrace,
    #[error("expected a closing \"*/\" to this block comment")]
    ExpectedCloseBlockComment,
    #[error("found a code block where none can go")]
    MisplacedCode,
    #[error("could not figure out what kind of token this was meant to be")]
    IndeterminableToken,
}

struct GrammarParseErrorLimited<'a> {
    data: GrammarParseErrorInfo,
    offender: &'a str,
}

/// Ok case means "we read this and had this string leftover";
/// Err case means "oh no we couldn't read the thing"
type ReadResult<'a, T> = Result<(T, &'a str), GrammarParseErrorLimited<'a>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEscape {
    #[error("{0:?} cannot be escaped")]
    BadChar(char),
    #[error("cannot escape the end of file")]
    Eof,
}

/// Read a whole grammar.
pub fn read_grammar(whole: &str, source: String) -> Result<Grammar, GrammarParseError> {
    read_grammar_limited(whole).map_err(|err| GrammarParseError::new(whole, source, err))
}

fn read_grammar_limited(whole: &str) -> Result<Grammar, GrammarParseErrorLimited<'_>> {
    let mut s = skip_trivia(whole)?;

    let init = if let Some(code) = try_read_code(s) {
        let (code, rest) = code?;
        s = rest;
        Some(code)
    } else {
        None
    };

    let mut rules = Vec::new();
    loop {
        s = skip_trivia(s)?;
        if s.is_empty() {
            break;
        }
        let (rule, rest) = read_rule(s)?;
        rules.push(rule);
        s = rest;
    }

    Ok(Grammar { init, rules })
}

fn read_rule(s: &str) -> ReadResult<'_, Rule> {
    let (name, rest) = match read_ident(s) {
        Some(it) => it,
        None if s.starts_with('{') => {
            return Err(GrammarParseErrorLimited {
                data: GrammarParseErrorInfo::MisplacedCode,
                offender: first_char(s),
            })
        }
        None => {
            return Err(GrammarParseErrorLimited {
                data: GrammarParseErrorInfo::ExpectedRuleName,
                offender: first_line(s),
            })
        }
    };

    let mut rest = skip_trivia(rest)?;
    let display_name = if let Some(display_name) = try_read_string(rest) {
        let (display_name, after) = display_name?;
        rest = skip_trivia(after)?;
        Some(display_name)
    } else {
        None
    };

    let rest = match strip_rule_def(rest) {
        Some(rest) => rest,
        None => {
            return Err(GrammarParseErrorLimited {
                data: GrammarParseErrorInfo::ExpectedRuleDef {
                    rule: name.to_owned(),
                },
                offender: first_char(rest),
            })
        }
    };

    let (expr, rest) = read_choice(rest)?;
    let rest = skip_trivia(rest)?;
    let rest = rest.strip_prefix(';').unwrap_or(rest);

    Ok((
        Rule {
            name: name.to_owned(),
            display_name,
            expr,
        },
        rest,
    ))
}

fn strip_rule_def(s: &str) -> Option<&str> {
    ["=", "<-", "←"]
        .iter()
        .find_map(|&def| s.strip_prefix(def))
}

fn read_choice(s: &str) -> ReadResult<'_, Expr> {
    let (first, mut rest) = read_action(s)?;
    let mut alts = vec![first];
    loop {
        let after = skip_trivia(rest)?;
        // comments are gone by now, so a slash is always a choice
        match after.strip_prefix('/') {
            Some(next) => {
                let (alt, after) = read_action(next)?;
                alts.push(alt);
                rest = after;
            }
            None => break,
        }
    }

    if alts.len() == 1 {
        Ok((alts.remove(0), rest))
    } else {
        Ok((Expr::Choice(alts), rest))
    }
}

fn read_action(s: &str) -> ReadResult<'_, Expr> {
    let (expr, rest) = read_sequence(s)?;
    let after = skip_trivia(rest)?;
    if let Some(code) = try_read_code(after) {
        let (code, rest) = code?;
        Ok((Expr::action(expr, code), rest))
    } else {
        Ok((expr, rest))
    }
}

fn read_sequence(s: &str) -> ReadResult<'_, Expr> {
    let mut items = Vec::new();
    let mut rest = s;
    loop {
        let here = skip_trivia(rest)?;
        if ends_sequence(here)? {
            break;
        }
        let (item, after) = read_labeled(here)?;
        items.push(item);
        rest = after;
    }

    match items.len() {
        0 => {
            let here = skip_trivia(s)?;
            Err(GrammarParseErrorLimited {
                data: GrammarParseErrorInfo::ExpectedExpression,
                offender: first_char(here),
            })
        }
        1 => Ok((items.remove(0), rest)),
        _ => Ok((Expr::Sequence(items), rest)),
    }
}

/// Whether the sequence being read stops before `s`.
///
/// Besides punctuation, a sequence stops where the next rule's header starts,
/// since rules are not otherwise delimited.
fn ends_sequence(s: &str) -> Result<bool, GrammarParseErrorLimited<'_>> {
    if s.is_empty() || s.starts_with(&['/', ')', ';', '{'][..]) {
        return Ok(true);
    }

    let rest = match read_ident(s) {
        Some((_, rest)) => skip_trivia(rest)?,
        None => return Ok(false),
    };
    if strip_rule_def(rest).is_some() {
        return Ok(true);
    }
    match try_read_string(rest) {
        Some(Ok((_, after))) => Ok(strip_rule_def(skip_trivia(after)?).is_some()),
        _ => Ok(false),
    }
}

fn read_labeled(s: &str) -> ReadResult<'_, Expr> {
    if let Some((label, rest)) = read_ident(s) {
        let after = skip_trivia(rest)?;
        if let Some(after) = after.strip_prefix(':') {
            let (expr, rest) = read_prefixed(skip_trivia(after)?)?;
            return Ok((Expr::labeled(label, expr), rest));
        }
    }
    read_prefixed(s)
}

fn read_prefixed(s: &str) -> ReadResult<'_, Expr> {
    let (prefix, rest) = match s.chars().next() {
        Some(c @ '&') | Some(c @ '!') => (c, skip_trivia(&s[1..])?),
        _ => return read_suffixed(s),
    };

    if let Some(code) = try_read_code(rest) {
        let (code, rest) = code?;
        let predicate = Expr::predicate(code);
        return Ok(match prefix {
            '&' => (predicate, rest),
            _ => (Expr::NotPredicate(Box::new(predicate)), rest),
        });
    }

    let (expr, rest) = read_suffixed(rest)?;
    let expr = Box::new(expr);
    Ok(match prefix {
        '&' => (Expr::AndPredicate(expr), rest),
        _ => (Expr::NotPredicate(expr), rest),
    })
}

fn read_suffixed(s: &str) -> ReadResult<'_, Expr> {
    let (expr, rest) = read_primary(s)?;
    let expr = Box::new(expr);
    Ok(match rest.chars().next() {
        Some('*') => (Expr::ZeroOrMore(expr), &rest[1..]),
        Some('+') => (Expr::OneOrMore(expr), &rest[1..]),
        Some('?') => (Expr::Optional(expr), &rest[1..]),
        _ => (*expr, rest),
    })
}

fn read_primary(s: &str) -> ReadResult<'_, Expr> {
    if let Some(inner) = s.strip_prefix('(') {
        let (expr, rest) = read_choice(inner)?;
        let rest = skip_trivia(rest)?;
        return match rest.strip_prefix(')') {
            Some(rest) => Ok((expr, rest)),
            None => {
                let (start, _) = string_pos(s, rest);
                Err(GrammarParseErrorLimited {
                    data: GrammarParseErrorInfo::ExpectedCloseParen,
                    offender: &s[..start],
                })
            }
        };
    }

    if let Some(string) = try_read_string(s) {
        let (text, rest) = string?;
        let (ignore_case, rest) = strip_ignore_case(rest);
        return Ok((Expr::Literal { text, ignore_case }, rest));
    }

    if let Some(class) = try_read_class(s) {
        let (pattern, rest) = class?;
        return Ok((Expr::class(pattern), rest));
    }

    if let Some(rest) = s.strip_prefix('.') {
        return Ok((Expr::AnyChar, rest));
    }

    if let Some((name, rest)) = read_ident(s) {
        return Ok((Expr::rule_ref(name), rest));
    }

    Err(GrammarParseErrorLimited {
        data: if s.starts_with('{') {
            GrammarParseErrorInfo::MisplacedCode
        } else {
            GrammarParseErrorInfo::IndeterminableToken
        },
        offender: first_char(s),
    })
}

/// A trailing `i` marks a terminal as case-insensitive, as long as it isn't the start of a name.
fn strip_ignore_case(s: &str) -> (bool, &str) {
    match s.strip_prefix('i') {
        Some(rest) if !rest.starts_with(is_ident_char) => (true, rest),
        _ => (false, s),
    }
}

fn read_ident(s: &str) -> Option<(&str, &str)> {
    if !s.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        return None;
    }
    let end = s.find(|c: char| !is_ident_char(c)).unwrap_or_else(|| s.len());
    Some(s.split_at(end))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Skip whitespace and comments.
fn skip_trivia(s: &str) -> Result<&str, GrammarParseErrorLimited<'_>> {
    let mut s = s.trim_start();
    loop {
        if let Some(comment) = s.strip_prefix("//") {
            s = match comment.find('\n') {
                // one byte to skip the line feed
                Some(idx) => &comment[idx + 1..],
                None => comment.split_at(comment.len()).1,
            };
        } else if let Some(comment) = s.strip_prefix("/*") {
            s = match comment.find("*/") {
                Some(idx) => &comment[idx + 2..],
                None => {
                    return Err(GrammarParseErrorLimited {
                        data: GrammarParseErrorInfo::ExpectedCloseBlockComment,
                        offender: first_line(s),
                    })
                }
            };
        } else {
            return Ok(s);
        }
        s = s.trim_start();
    }
}

fn try_read_string(whole: &str) -> Option<ReadResult<'_, String>> {
    let quote = whole.chars().next().filter(|&c| c == '"' || c == '\'')?;
    let mut s = &whole[1..];
    let mut accumulated = String::new();
    loop {
        let stop = s.find(|c: char| c == '\\' || c == quote || c == '\n');
        match stop.map(|idx| (idx, s[idx..].chars().next())) {
            Some((idx, Some('\\'))) => {
                // add 1 to skip the backslash
                let rest = &s[idx + 1..];
                let (esc, rest) = match escape(rest) {
                    Ok(it) => it,
                    Err(ono) => {
                        let (badpos, _) = string_pos(whole, rest);
                        let bad_end = badpos + rest.chars().next().map_or(0, char::len_utf8);
                        return Some(Err(GrammarParseErrorLimited {
                            data: GrammarParseErrorInfo::InvalidEscape(badpos, ono),
                            offender: &whole[..bad_end],
                        }));
                    }
                };
                accumulated.push_str(&s[..idx]);
                accumulated.push(esc);
                s = rest;
            }
            Some((idx, Some(c))) if c == quote => {
                accumulated.push_str(&s[..idx]);
                return Some(Ok((accumulated, &s[idx + 1..])));
            }
            _ => {
                return Some(Err(GrammarParseErrorLimited {
                    data: GrammarParseErrorInfo::ExpectedCloseQuote { quote },
                    offender: first_line(whole),
                }));
            }
        }
    }
}

/// Consume an escape sequence with the backslash already gone.
fn escape(s: &str) -> Result<(char, &str), InvalidEscape> {
    match s.chars().next() {
        None => Err(InvalidEscape::Eof),
        Some(sentinel) => {
            // the rest, assuming only 1 char escape
            let naive_rest = &s[sentinel.len_utf8()..];
            let escaped = match sentinel {
                '\\' => '\\',
                '"' => '"',
                '\'' => '\'',
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                _ => return Err(InvalidEscape::BadChar(sentinel)),
            };
            Ok((escaped, naive_rest))
        }
    }
}

/// Read a character class as written. Its insides are checked when the class is compiled.
fn try_read_class(whole: &str) -> Option<ReadResult<'_, String>> {
    if !whole.starts_with('[') {
        return None;
    }
    let mut chars = whole.char_indices().skip(1);
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '\n' => break,
            ']' => {
                let (ignore_case, rest) = strip_ignore_case(&whole[idx + 1..]);
                let end = idx + 1 + if ignore_case { 1 } else { 0 };
                return Some(Ok((whole[..end].to_owned(), rest)));
            }
            _ => {}
        }
    }
    Some(Err(GrammarParseErrorLimited {
        data: GrammarParseErrorInfo::ExpectedCloseBracket,
        offender: first_line(whole),
    }))
}

/// Read a `{ ... }` block, returning the trimmed code inside.
///
/// Braces inside string and character literals and inside comments don't count.
fn try_read_code(whole: &str) -> Option<ReadResult<'_, String>> {
    if !whole.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut quote = None;
    let mut chars = whole.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match (quote, c) {
            (Some(_), '\\') => {
                chars.next();
            }
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '/') if whole[idx..].starts_with("//") => {
                while chars.next_if(|&(_, c)| c != '\n').is_some() {}
            }
            (None, '/') if whole[idx..].starts_with("/*") => {
                // an unclosed comment swallows the rest, which leaves the block unclosed too
                let end = whole[idx + 2..]
                    .find("*/")
                    .map_or(whole.len(), |at| idx + 2 + at + 2);
                while chars.next_if(|&(at, _)| at < end).is_some() {}
            }
            (None, '"') | (None, '\'') | (None, '`') => quote = Some(c),
            (None, '{') => depth += 1,
            (None, '}') => {
                depth -= 1;
                if depth == 0 {
                    let code = whole[1..idx].trim().to_owned();
                    return Some(Ok((code, &whole[idx + 1..])));
                }
            }
            (None, _) => {}
        }
    }
    Some(Err(GrammarParseErrorLimited {
        data: GrammarParseErrorInfo::ExpectedCloseBrace,
        offender: first_char(whole),
    }))
}

/// The first character of the string, or the empty end of it.
fn first_char(s: &str) -> &str {
    let len = s.chars().next().map_or(0, char::len_utf8);
    &s[..len]
}

fn first_line(s: &str) -> &str {
    match s.find(&['\n', '\r'][..]) {
        Some(idx) => &s[..idx],
        None => s,
    }
}

/// Find the byte positions of the child string's start and end in the parent string.
/// Start is inclusive, end is exclusive.
///
/// Panics if any part of the child string is outside the parent.
fn string_pos<'a>(parent: &'a str, child: &'a str) -> (usize, usize) {
    // this should go down with no unsafe code, even though it involves pointers.
    let pparent = parent.as_ptr() as usize;
    let pchild = child.as_ptr() as usize;

    debug_assert!(
        pparent <= pchild,
        "the child string {:?} started before the parent string {:?} ({:#x} < {:#x})",
        child,
        parent,
        pchild,
        pparent
    );
    let start = pchild - pparent;

    let end = start + child.len();
    debug_assert!(
        end <= parent.len(),
        "the end of the child string {:?} ended after the parent string {:?} ({:#x} > {:#x})",
        child,
        parent,
        pchild + child.len(),
        pparent + parent.len()
    );

    (start, end)
}

#[test]
fn test_string_pos() {
    let s = "True, nervous, dreadfully nervous I have been, and am.";

    let child = &s[3..13];
    let bounds = string_pos(s, child);
    assert_eq!(bounds, (3, 13));

    let bounds = string_pos(s, s);
    assert_eq!(bounds, (0, s.len()));
}
