//! Field paths, field patterns and glob matching.
//!
//! Paths address a node inside a parsed manifest, e.g.
//! `spec.containers[0].image` or `metadata.annotations."app.io/owner"`.
//! Patterns use the same syntax plus `*` globs inside key segments, `[*]`
//! for any array index and `[field=glob]` for the array elements whose string
//! `field` matches. A pattern matches a path when it matches a prefix of the
//! path, so ignoring a field ignores its whole subtree. Element selectors
//! depend on values, not paths, and are applied with [`FieldPattern::prune`].

use std::fmt;
use std::str::FromStr;

use glob::Pattern;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Match `text` against a glob where `*` matches any run of characters.
/// Every other character is literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let mut escaped = pattern
        .split('*')
        .map(Pattern::escape)
        .collect::<Vec<_>>()
        .join("*");
    while escaped.contains("**") {
        escaped = escaped.replace("**", "*");
    }
    Pattern::new(&escaped).is_ok_and(|p| p.matches(text))
}

/// Match against an optional glob; `None` and the empty string match anything.
pub fn optional_glob_match(pattern: Option<&str>, text: &str) -> bool {
    match pattern {
        None => true,
        Some(p) if p.is_empty() => true,
        Some(p) => glob_match(p, text),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid field pattern `{pattern}`: {reason}")]
pub struct PatternError {
    pattern: String,
    reason: &'static str,
}

/// One step of a path into a structural tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A concrete location inside a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn key(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.0.push(Segment::Key(key.to_owned()));
        next
    }

    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.0.push(Segment::Index(index));
        next
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Index(n) => write!(f, "[{n}]")?,
                Segment::Key(k) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    write_key(f, k)?;
                }
            }
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for FieldPath {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = tokenize(s)?
            .into_iter()
            .map(|token| match token {
                Token::Key(k) => Ok(Segment::Key(k)),
                Token::Index(n) => Ok(Segment::Index(n)),
                Token::AnyIndex | Token::Element { .. } => Err(PatternError {
                    pattern: s.to_owned(),
                    reason: "wildcard or selector in a concrete path",
                }),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self(segments))
    }
}

fn write_key(f: &mut fmt::Formatter<'_>, key: &str) -> fmt::Result {
    let needs_quotes = key.is_empty()
        || key
            .chars()
            .any(|c| matches!(c, '.' | '[' | ']' | '"' | '\\') || c.is_whitespace());
    if !needs_quotes {
        return f.write_str(key);
    }
    f.write_str("\"")?;
    for c in key.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Key(String),
    Index(usize),
    AnyIndex,
    Element { field: String, glob: String },
}

impl Token {
    fn selects_element(&self, index: usize, item: &Value) -> bool {
        match self {
            Token::Key(glob) => glob_match(glob, &index.to_string()),
            Token::Index(want) => *want == index,
            Token::AnyIndex => true,
            Token::Element { field, glob } => item
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|v| glob_match(glob, v)),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, PatternError> {
    let fail = |reason| PatternError {
        pattern: input.to_owned(),
        reason,
    };
    if input.is_empty() {
        return Err(fail("empty pattern"));
    }

    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut expect_segment = true;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if expect_segment {
                    return Err(fail("empty segment"));
                }
                expect_segment = true;
                i += 1;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .ok_or_else(|| fail("unterminated index"))?;
                let inner: String = chars[i + 1..i + close].iter().collect();
                let token = if inner == "*" {
                    Token::AnyIndex
                } else if let Some((field, glob)) = inner.split_once('=') {
                    if field.is_empty() {
                        return Err(fail("empty element field"));
                    }
                    Token::Element {
                        field: field.to_owned(),
                        glob: glob.to_owned(),
                    }
                } else {
                    Token::Index(inner.parse().map_err(|_| fail("non-numeric index"))?)
                };
                tokens.push(token);
                i += close + 1;
                expect_segment = false;
            }
            '"' => {
                if !expect_segment {
                    return Err(fail("missing separator before quoted key"));
                }
                let mut key = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(fail("unterminated quote")),
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| fail("dangling escape"))?;
                            key.push(*escaped);
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            key.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Key(key));
                expect_segment = false;
            }
            _ => {
                if !expect_segment {
                    return Err(fail("missing separator"));
                }
                let start = i;
                while i < chars.len() && !matches!(chars[i], '.' | '[' | '"') {
                    i += 1;
                }
                tokens.push(Token::Key(chars[start..i].iter().collect()));
                expect_segment = false;
            }
        }
    }
    if expect_segment {
        return Err(fail("trailing separator"));
    }
    Ok(tokens)
}

/// A field-path pattern from an ignore rule.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPattern {
    source: String,
    tokens: Vec<Token>,
}

impl FieldPattern {
    /// True if this pattern covers `path` or one of its ancestors.
    pub fn matches(&self, path: &FieldPath) -> bool {
        let segments = path.segments();
        if self.tokens.len() > segments.len() {
            return false;
        }
        self.tokens
            .iter()
            .zip(segments)
            .all(|(token, segment)| match (token, segment) {
                (Token::Key(glob), Segment::Key(key)) => glob_match(glob, key),
                (Token::Key(glob), Segment::Index(n)) => glob_match(glob, &n.to_string()),
                (Token::Index(want), Segment::Index(n)) => want == n,
                (Token::AnyIndex, Segment::Index(_)) => true,
                _ => false,
            })
    }

    /// True if the pattern selects array elements by value.
    pub fn selects_elements(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, Token::Element { .. }))
    }

    /// Remove every node of `tree` this pattern selects. Objects and arrays
    /// emptied by the removal are removed as well. Returns whether anything
    /// was removed.
    pub fn prune(&self, tree: &mut Value) -> bool {
        prune_node(tree, &self.tokens)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn prune_node(node: &mut Value, tokens: &[Token]) -> bool {
    let Some((head, rest)) = tokens.split_first() else {
        return false;
    };
    let mut removed = false;
    match node {
        Value::Object(map) => {
            let Token::Key(glob) = head else {
                return false;
            };
            let keys: Vec<String> = map.keys().filter(|k| glob_match(glob, k)).cloned().collect();
            for key in keys {
                if rest.is_empty() {
                    map.remove(&key);
                    removed = true;
                    continue;
                }
                let Some(child) = map.get_mut(&key) else {
                    continue;
                };
                if prune_node(child, rest) {
                    removed = true;
                    if is_empty_container(child) {
                        map.remove(&key);
                    }
                }
            }
        }
        Value::Array(items) => {
            let mut doomed = Vec::with_capacity(items.len());
            for (index, item) in items.iter_mut().enumerate() {
                let remove = if !head.selects_element(index, item) {
                    false
                } else if rest.is_empty() {
                    removed = true;
                    true
                } else if prune_node(item, rest) {
                    removed = true;
                    is_empty_container(item)
                } else {
                    false
                };
                doomed.push(remove);
            }
            let mut flags = doomed.into_iter();
            items.retain(|_| !flags.next().unwrap_or(false));
        }
        _ => {}
    }
    removed
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

impl FromStr for FieldPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            source: s.to_owned(),
            tokens: tokenize(s)?,
        })
    }
}

impl TryFrom<String> for FieldPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldPattern> for String {
    fn from(pattern: FieldPattern) -> Self {
        pattern.source
    }
}

impl fmt::Display for FieldPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
