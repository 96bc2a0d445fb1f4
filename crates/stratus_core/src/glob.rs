//! Glob patterns matched against archive-relative paths.
//!
//! Supported syntax:
//! - `*` any run of characters within one path segment, `?` one character
//! - `[abc]`, `[a-z]`, `[!abc]`/`[^abc]` character classes
//! - `**` as a whole segment matches any number of directories (`**/x`, `x/**`)
//! - `{a,b,c}` brace expansion, nesting allowed
//! - extglob groups `@(a|b)`, `?(a|b)`, `*(a|b)`, `+(a|b)`, `!(a|b)`
//! - a leading `!` negates the pattern inside a [`PatternSet`]
//! - `\` escapes the next character
//!
//! Only `**` crosses `/`; every other wildcard stays within a segment.

use crate::error::UsageError;

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound on recursive match steps. Patterns like `*a*a*a*...*b` would
/// otherwise backtrack exponentially.
const MAX_MATCH_CALLS: usize = 100_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: &'static str,
}

impl From<PatternError> for UsageError {
    fn from(err: PatternError) -> Self {
        UsageError::Pattern {
            pattern: err.pattern,
            reason: err.reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    Star,
    /// `**/`: nothing, or any run of whole directories.
    GlobStarDir,
    /// Trailing `**`: everything below.
    GlobStarAll,
    Class(CharClass),
    Ext(ExtGlob),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn matches(&self, ch: char) -> bool {
        let hit = self.ranges.iter().any(|(lo, hi)| *lo <= ch && ch <= *hi);
        hit != self.negated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtKind {
    One,
    ZeroOrOne,
    ZeroOrMore,
    OneOrMore,
    Not,
}

impl ExtKind {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '@' => Some(Self::One),
            '?' => Some(Self::ZeroOrOne),
            '*' => Some(Self::ZeroOrMore),
            '+' => Some(Self::OneOrMore),
            '!' => Some(Self::Not),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExtGlob {
    kind: ExtKind,
    alternatives: Vec<Vec<Token>>,
}

impl ExtGlob {
    fn any_alternative(&self, input: &[char], calls: &Cell<usize>) -> bool {
        self.alternatives
            .iter()
            .any(|alt| match_tokens(alt, input, calls))
    }

    fn repeated(&self, input: &[char], calls: &Cell<usize>) -> bool {
        if input.is_empty() {
            return true;
        }
        (1..=input.len()).any(|split| {
            self.any_alternative(&input[..split], calls) && self.repeated(&input[split..], calls)
        })
    }

    fn matches(&self, input: &[char], calls: &Cell<usize>) -> bool {
        match self.kind {
            ExtKind::One => self.any_alternative(input, calls),
            ExtKind::ZeroOrOne => input.is_empty() || self.any_alternative(input, calls),
            ExtKind::ZeroOrMore => self.repeated(input, calls),
            ExtKind::OneOrMore => !input.is_empty() && self.repeated(input, calls),
            ExtKind::Not => !self.any_alternative(input, calls),
        }
    }
}

/// A single compiled glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    source: String,
    negated: bool,
    alternatives: Vec<Vec<Token>>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let error = |reason| PatternError {
            pattern: pattern.to_string(),
            reason,
        };

        let trimmed = pattern.trim();
        let (negated, body) = match trimmed.strip_prefix('!') {
            Some(rest) if !rest.starts_with('(') => (true, rest),
            _ => (false, trimmed),
        };

        let body = normalize(body);
        if body.is_empty() {
            return Err(error("pattern is empty"));
        }

        let alternatives = expand_braces(body)
            .iter()
            .map(|expanded| {
                let chars: Vec<char> = expanded.chars().collect();
                tokenize(&chars).map_err(error)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: pattern.to_string(),
            negated,
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Whether `path` matches the pattern body. Negation is applied by [`PatternSet`].
    pub fn matches(&self, path: &str) -> bool {
        let input: Vec<char> = normalize(path).chars().collect();
        let calls = Cell::new(0usize);
        self.alternatives
            .iter()
            .any(|tokens| match_tokens(tokens, &input, &calls))
    }
}

impl FromStr for GlobPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// An ordered collection of patterns, some possibly negated.
///
/// - no patterns: matches nothing
/// - only negated patterns: matches every path none of them matches
/// - otherwise: matches when any positive pattern matches and no negated one does
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<GlobPattern>,
}

impl PatternSet {
    pub fn new(patterns: impl IntoIterator<Item = GlobPattern>) -> Self {
        Self {
            patterns: patterns.into_iter().collect(),
        }
    }

    pub fn parse<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns
            .into_iter()
            .map(|p| GlobPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn push(&mut self, pattern: GlobPattern) {
        self.patterns.push(pattern);
    }

    pub fn extend(&mut self, other: PatternSet) {
        self.patterns.extend(other.patterns);
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlobPattern> {
        self.patterns.iter()
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let mut has_positive = false;
        let mut positive_hit = false;
        for pattern in &self.patterns {
            if pattern.is_negated() {
                if pattern.matches(path) {
                    return false;
                }
            } else {
                has_positive = true;
                positive_hit = positive_hit || pattern.matches(path);
            }
        }

        !has_positive || positive_hit
    }
}

fn normalize(path: &str) -> &str {
    let mut path = path;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            return path;
        }
    }
}

/// Expands `{a,b}` groups into every combination. Nested groups are supported.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let chars: Vec<char> = pattern.chars().collect();

    let mut depth = 0usize;
    let mut start = None;
    let mut end = None;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let (Some(start), Some(end)) = (start, end) else {
        return vec![pattern.to_string()];
    };

    let prefix: String = chars[..start].iter().collect();
    let suffix: String = chars[end + 1..].iter().collect();
    let content: String = chars[start + 1..end].iter().collect();

    split_top_level(&content, ',', '{', '}')
        .into_iter()
        .flat_map(|alt| expand_braces(&format!("{prefix}{alt}{suffix}")))
        .collect()
}

/// Splits on `sep` where not nested inside `open`/`close` and not escaped.
fn split_top_level(content: &str, sep: char, open: char, close: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut escaped = false;

    for c in content.chars() {
        if escaped {
            escaped = false;
            current.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                current.push(c);
            }
            c if c == open => {
                depth += 1;
                current.push(c);
            }
            c if c == close => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == sep && depth == 0 => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Index of the `)` closing the `(` at `open`.
fn find_close(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn tokenize(chars: &[char]) -> Result<Vec<Token>, &'static str> {
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        let ext = ExtKind::from_char(c).filter(|_| chars.get(i + 1) == Some(&'('));
        if let Some(kind) = ext {
            let close = find_close(chars, i + 1).ok_or("unbalanced parenthesis")?;
            let inner: String = chars[i + 2..close].iter().collect();
            let alternatives = split_top_level(&inner, '|', '(', ')')
                .iter()
                .map(|alt| {
                    let alt: Vec<char> = alt.chars().collect();
                    tokenize(&alt)
                })
                .collect::<Result<Vec<_>, _>>()?;
            tokens.push(Token::Ext(ExtGlob { kind, alternatives }));
            i = close + 1;
            continue;
        }

        match c {
            '\\' => match chars.get(i + 1) {
                Some(&next) => {
                    tokens.push(Token::Literal(next));
                    i += 2;
                }
                None => {
                    tokens.push(Token::Literal('\\'));
                    i += 1;
                }
            },
            '*' => {
                let mut j = i;
                while chars.get(j) == Some(&'*') {
                    j += 1;
                }
                let whole_segment = j - i >= 2 && (i == 0 || chars[i - 1] == '/');
                match chars.get(j) {
                    Some('/') if whole_segment => {
                        tokens.push(Token::GlobStarDir);
                        i = j + 1;
                    }
                    None if whole_segment => {
                        tokens.push(Token::GlobStarAll);
                        i = j;
                    }
                    _ => {
                        tokens.push(Token::Star);
                        i = j;
                    }
                }
            }
            '?' => {
                tokens.push(Token::AnyChar);
                i += 1;
            }
            '[' => match parse_class(&chars[i..]) {
                Some((class, consumed)) => {
                    tokens.push(Token::Class(class));
                    i += consumed;
                }
                None => {
                    tokens.push(Token::Literal('['));
                    i += 1;
                }
            },
            other => {
                tokens.push(Token::Literal(other));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Parses `[...]` at the start of `chars`. `None` when unclosed, in which case
/// the bracket is taken literally.
fn parse_class(chars: &[char]) -> Option<(CharClass, usize)> {
    let mut i = 1;
    let mut negated = false;
    if matches!(chars.get(i), Some('!') | Some('^')) {
        negated = true;
        i += 1;
    }

    // `]` right after the opening bracket is a literal member.
    let first = i;
    let mut ranges = Vec::new();
    loop {
        let mut c = *chars.get(i)?;
        if c == ']' && i > first {
            return Some((CharClass { negated, ranges }, i + 1));
        }
        if c == '\\' {
            i += 1;
            c = *chars.get(i)?;
        }

        match (chars.get(i + 1), chars.get(i + 2)) {
            (Some('-'), Some(&hi)) if hi != ']' => {
                ranges.push((c, hi));
                i += 3;
            }
            _ => {
                ranges.push((c, c));
                i += 1;
            }
        }
    }
}

fn match_tokens(tokens: &[Token], input: &[char], calls: &Cell<usize>) -> bool {
    let count = calls.get() + 1;
    calls.set(count);
    if count > MAX_MATCH_CALLS {
        return false;
    }

    let Some((token, rest)) = tokens.split_first() else {
        return input.is_empty();
    };

    match token {
        Token::Literal(c) => {
            input.first() == Some(c) && match_tokens(rest, &input[1..], calls)
        }
        Token::AnyChar => {
            matches!(input.first(), Some(c) if *c != '/') && match_tokens(rest, &input[1..], calls)
        }
        Token::Class(class) => {
            matches!(input.first(), Some(c) if *c != '/' && class.matches(*c))
                && match_tokens(rest, &input[1..], calls)
        }
        Token::Star => {
            let limit = segment_end(input);
            (0..=limit).any(|skip| match_tokens(rest, &input[skip..], calls))
        }
        Token::GlobStarAll => (0..=input.len()).any(|skip| match_tokens(rest, &input[skip..], calls)),
        Token::GlobStarDir => {
            match_tokens(rest, input, calls)
                || (1..=input.len())
                    .any(|skip| input[skip - 1] == '/' && match_tokens(rest, &input[skip..], calls))
        }
        Token::Ext(ext) => {
            let limit = segment_end(input);
            (0..=limit).any(|split| {
                ext.matches(&input[..split], calls) && match_tokens(rest, &input[split..], calls)
            })
        }
    }
}

fn segment_end(input: &[char]) -> usize {
    input.iter().position(|c| *c == '/').unwrap_or(input.len())
}
