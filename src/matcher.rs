//! Terminal matchers: the leaves of a grammar that actually look at input.

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

/// How a terminal is stored in a program's matcher table.
///
/// Equal descriptors share one table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher {
    Literal { text: String, ignore_case: bool },
    /// The class as written, brackets and trailing `i` included.
    CharClass { pattern: String },
    Any,
}

impl Matcher {
    /// Turn this into something that can be run against input.
    pub fn compile(&self) -> Result<CompiledMatcher, MatcherError> {
        Ok(match self {
            Matcher::Literal { text, ignore_case } => CompiledMatcher::Literal {
                text: text.clone(),
                ignore_case: *ignore_case,
            },
            Matcher::CharClass { pattern } => CompiledMatcher::Class(CharClass::new(pattern)?),
            Matcher::Any => CompiledMatcher::Any,
        })
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Literal { text, ignore_case } => {
                crate::display::write_quoted(f, text)?;
                if *ignore_case {
                    f.write_str("i")?;
                }
                Ok(())
            }
            Matcher::CharClass { pattern } => f.write_str(pattern),
            Matcher::Any => f.write_str("."),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatcherError {
    #[error("character class {pattern:?} must be surrounded by brackets")]
    Unbracketed { pattern: String },
    #[error("character class {pattern:?} ends in the middle of an escape")]
    DanglingEscape { pattern: String },
    #[error("character class {pattern:?} cannot escape {escaped:?}")]
    BadEscape { pattern: String, escaped: char },
    #[error("character class {pattern:?} has a backwards range {lo:?}-{hi:?}")]
    BackwardsRange { pattern: String, lo: char, hi: char },
}

#[derive(Debug, Clone)]
pub enum CompiledMatcher {
    Literal { text: String, ignore_case: bool },
    Class(CharClass),
    Any,
}

impl CompiledMatcher {
    /// Try to match at byte offset `pos`, returning how many bytes were consumed.
    pub fn match_at(&self, input: &str, pos: usize) -> Option<usize> {
        let rest = input.get(pos..)?;
        match self {
            CompiledMatcher::Literal {
                text,
                ignore_case: false,
            } => {
                if rest.starts_with(text.as_str()) {
                    Some(text.len())
                } else {
                    None
                }
            }
            CompiledMatcher::Literal {
                text,
                ignore_case: true,
            } => {
                let mut consumed = 0;
                let mut chars = rest.chars();
                for want in text.chars() {
                    let got = chars.next()?;
                    if !got.to_lowercase().eq(want.to_lowercase()) {
                        return None;
                    }
                    consumed += got.len_utf8();
                }
                Some(consumed)
            }
            CompiledMatcher::Class(class) => {
                let c = rest.chars().next()?;
                if class.contains(c) {
                    Some(c.len_utf8())
                } else {
                    None
                }
            }
            CompiledMatcher::Any => rest.chars().next().map(char::len_utf8),
        }
    }
}

/// A set of characters, written like `[a-z_]`, `[^\n]` or `[a-f]i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharClass {
    /// Sorted, non-overlapping inclusive ranges.
    ranges: Vec<(char, char)>,
    negated: bool,
    ignore_case: bool,
}

impl CharClass {
    pub fn new(pattern: &str) -> Result<CharClass, MatcherError> {
        let (body, ignore_case) = match pattern.strip_suffix('i') {
            Some(body) if body.ends_with(']') => (body, true),
            _ => (pattern, false),
        };
        let body = body
            .strip_prefix('[')
            .and_then(|b| b.strip_suffix(']'))
            .ok_or_else(|| MatcherError::Unbracketed {
                pattern: pattern.to_owned(),
            })?;
        let (body, negated) = match body.strip_prefix('^') {
            Some(body) => (body, true),
            None => (body, false),
        };

        let mut singles = Vec::new();
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            let c = if c == '\\' {
                let escaped = chars.next().ok_or_else(|| MatcherError::DanglingEscape {
                    pattern: pattern.to_owned(),
                })?;
                unescape(escaped).ok_or_else(|| MatcherError::BadEscape {
                    pattern: pattern.to_owned(),
                    escaped,
                })?
            } else {
                c
            };
            singles.push(c);
        }

        // Now fold `x - y` triples into ranges. A dash at either end is literal.
        let mut ranges = Vec::new();
        let mut idx = 0;
        while idx < singles.len() {
            let lo = singles[idx];
            let is_range = idx + 2 < singles.len()
                && singles[idx + 1] == '-'
                && !is_escaped_dash(body, idx + 1);
            if is_range {
                let hi = singles[idx + 2];
                if hi < lo {
                    return Err(MatcherError::BackwardsRange {
                        pattern: pattern.to_owned(),
                        lo,
                        hi,
                    });
                }
                ranges.push((lo, hi));
                idx += 3;
            } else {
                ranges.push((lo, lo));
                idx += 1;
            }
        }

        ranges.sort_unstable();
        let ranges = ranges
            .into_iter()
            .coalesce(|(alo, ahi), (blo, bhi)| {
                if (blo as u32) <= (ahi as u32).saturating_add(1) {
                    Ok((alo, ahi.max(bhi)))
                } else {
                    Err(((alo, ahi), (blo, bhi)))
                }
            })
            .collect_vec();

        Ok(CharClass {
            ranges,
            negated,
            ignore_case,
        })
    }

    pub fn contains(&self, c: char) -> bool {
        let hit = self.contains_exactly(c)
            || (self.ignore_case
                && (c.to_lowercase().any(|l| self.contains_exactly(l))
                    || c.to_uppercase().any(|u| self.contains_exactly(u))));
        hit != self.negated
    }

    fn contains_exactly(&self, c: char) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi)
    }
}

/// Whether the `nth` unescaped character of a class body was written as `\-`.
fn is_escaped_dash(body: &str, nth: usize) -> bool {
    let mut count = 0;
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        let escaped = c == '\\';
        let c = if escaped { chars.next() } else { Some(c) };
        if count == nth {
            return escaped && c == Some('-');
        }
        count += 1;
    }
    false
}

fn unescape(c: char) -> Option<char> {
    Some(match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        '\\' | ']' | '[' | '-' | '^' => c,
        _ => return None,
    })
}
