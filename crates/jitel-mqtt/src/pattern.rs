//! Subscription pattern compiler and matcher.
//!
//! A pattern is a `/`-separated topic template:
//!
//! - a literal segment must equal the topic segment exactly
//! - `+name` matches exactly one segment and binds it to `name` (`+` alone matches without binding)
//! - a final `#name` or `#` matches one or more remaining segments and binds the suffix
//!
//! ```
//! use jitel_mqtt::TopicPattern;
//!
//! let pattern = TopicPattern::compile("JI/v2/+nodeId/command").unwrap();
//! assert_eq!(pattern.compiled_topic(), "JI/v2/+/command");
//! let params = pattern.extract("JI/v2/N1/command").unwrap();
//! assert_eq!(params.get("nodeId"), Some("N1"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Topic level separator.
pub const SEPARATOR: char = '/';
/// Single-level wildcard sigil.
pub const SINGLE_LEVEL: char = '+';
/// Multi-level wildcard sigil.
pub const MULTI_LEVEL: char = '#';
/// Key under which an anonymous multi-level wildcard binds its suffix.
pub const ANONYMOUS_MULTI_KEY: &str = "#";

/// Errors produced while compiling or filling a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,

    #[error("pattern '{pattern}' has an empty segment at position {position}")]
    EmptySegment { pattern: String, position: usize },

    #[error("pattern '{pattern}' uses the multi-level wildcard before the last segment")]
    MultiLevelNotLast { pattern: String },

    #[error("pattern '{pattern}' has a wildcard inside segment '{segment}'")]
    WildcardInLiteral { pattern: String, segment: String },

    #[error("pattern '{pattern}' binds '{name}' more than once")]
    DuplicateName { pattern: String, name: String },

    #[error("no value for parameter '{name}' in '{pattern}'")]
    MissingParameter { pattern: String, name: String },

    #[error("cannot fill anonymous wildcard in '{pattern}'")]
    AnonymousWildcard { pattern: String },

    #[error("value '{value}' for parameter '{name}' is not a valid topic segment")]
    InvalidValue { name: String, value: String },
}

/// One segment of a compiled pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Single(Option<String>),
    Multi(Option<String>),
}

impl Segment {
    fn parse(pattern: &str, raw: &str, position: usize, last: bool) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Err(PatternError::EmptySegment {
                pattern: pattern.to_string(),
                position,
            });
        }

        let mut chars = raw.chars();
        let kind = chars.next();
        let name = chars.as_str();
        let wildcard_in = |s: &str| s.contains(SINGLE_LEVEL) || s.contains(MULTI_LEVEL);

        match kind {
            Some(SINGLE_LEVEL) | Some(MULTI_LEVEL) if wildcard_in(name) => {
                Err(PatternError::WildcardInLiteral {
                    pattern: pattern.to_string(),
                    segment: raw.to_string(),
                })
            }
            Some(SINGLE_LEVEL) => Ok(Segment::Single(non_empty(name))),
            Some(MULTI_LEVEL) if !last => Err(PatternError::MultiLevelNotLast {
                pattern: pattern.to_string(),
            }),
            Some(MULTI_LEVEL) => Ok(Segment::Multi(non_empty(name))),
            _ if wildcard_in(raw) => Err(PatternError::WildcardInLiteral {
                pattern: pattern.to_string(),
                segment: raw.to_string(),
            }),
            _ => Ok(Segment::Literal(raw.to_string())),
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            Segment::Literal(_) => None,
            Segment::Single(name) | Segment::Multi(name) => name.as_deref(),
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    (!name.is_empty()).then(|| name.to_string())
}

/// Parameters extracted from a topic, keyed by wildcard name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TopicParams(BTreeMap<String, String>);

impl TopicParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, returning `self` for chaining.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TopicParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A compiled subscription pattern.
///
/// Immutable once compiled; cheap to match repeatedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<Segment>,
    compiled: String,
}

impl TopicPattern {
    /// Compile a pattern string.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let raw: Vec<&str> = pattern.split(SEPARATOR).collect();
        let last = raw.len() - 1;
        let mut segments = Vec::with_capacity(raw.len());
        for (position, segment) in raw.iter().enumerate() {
            segments.push(Segment::parse(pattern, segment, position, position == last)?);
        }

        let mut seen: Vec<&str> = Vec::new();
        for name in segments.iter().filter_map(Segment::name) {
            if seen.contains(&name) {
                return Err(PatternError::DuplicateName {
                    pattern: pattern.to_string(),
                    name: name.to_string(),
                });
            }
            seen.push(name);
        }

        let compiled = segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.as_str(),
                Segment::Single(_) => "+",
                Segment::Multi(_) => "#",
            })
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            source: pattern.to_string(),
            segments,
            compiled,
        })
    }

    /// The pattern as declared.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Wire-level subscription filter with anonymous wildcards.
    pub fn compiled_topic(&self) -> &str {
        &self.compiled
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of single-level wildcards, plus one if a multi-level wildcard is present.
    pub fn wildcard_arity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Names bound by this pattern, in segment order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Literal(_) => None,
            Segment::Single(name) => name.as_deref(),
            Segment::Multi(name) => Some(name.as_deref().unwrap_or(ANONYMOUS_MULTI_KEY)),
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.walk(topic, |_, _| {})
    }

    /// Match `topic` and return the bound parameters, or `None` when it does not match.
    pub fn extract(&self, topic: &str) -> Option<TopicParams> {
        let mut params = TopicParams::new();
        let matched = self.walk(topic, |name, value| params.insert(name, value));
        matched.then_some(params)
    }

    /// Build a concrete topic by substituting named wildcards.
    pub fn fill(&self, params: &TopicParams) -> Result<String, PatternError> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => parts.push(literal.as_str()),
                Segment::Single(None) | Segment::Multi(None) => {
                    return Err(PatternError::AnonymousWildcard {
                        pattern: self.source.clone(),
                    })
                }
                Segment::Single(Some(name)) | Segment::Multi(Some(name)) => {
                    let value = params.get(name).ok_or_else(|| PatternError::MissingParameter {
                        pattern: self.source.clone(),
                        name: name.clone(),
                    })?;
                    let multi = matches!(segment, Segment::Multi(_));
                    if !valid_fill_value(value, multi) {
                        return Err(PatternError::InvalidValue {
                            name: name.clone(),
                            value: value.to_string(),
                        });
                    }
                    parts.push(value);
                }
            }
        }
        Ok(parts.join("/"))
    }

    /// Walk the topic against the pattern, reporting each binding.
    fn walk<'t>(&self, topic: &'t str, mut bind: impl FnMut(&str, &'t str)) -> bool {
        let mut remaining = topic;
        let mut exhausted = false;
        let last = self.segments.len() - 1;

        for (i, segment) in self.segments.iter().enumerate() {
            if exhausted {
                return false;
            }

            if let Segment::Multi(name) = segment {
                // Needs at least one trailing segment; `x/#` does not match `x`.
                debug_assert_eq!(i, last);
                bind(name.as_deref().unwrap_or(ANONYMOUS_MULTI_KEY), remaining);
                return true;
            }

            let current = match remaining.split_once(SEPARATOR) {
                Some((head, tail)) => {
                    remaining = tail;
                    head
                }
                None => {
                    exhausted = true;
                    remaining
                }
            };

            match segment {
                Segment::Literal(literal) if literal != current => return false,
                Segment::Single(Some(name)) => bind(name, current),
                _ => {}
            }
        }

        exhausted
    }
}

fn valid_fill_value(value: &str, multi: bool) -> bool {
    if value.is_empty() || value.contains(SINGLE_LEVEL) || value.contains(MULTI_LEVEL) {
        return false;
    }
    multi || !value.contains(SEPARATOR)
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}
