//! Tag filter expressions
//!
//! A query condition is a tree of leaf predicates (`=`, `in`, `like`, `=~`)
//! combined with `not`, parentheses and `and`/`or`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Binary operators that may appear in a condition tree.
///
/// Only `And` and `Or` are valid between tag predicates; the arithmetic
/// operators exist so a malformed tree can be represented and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// Tag filter expression tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagFilter {
    /// Exact match: tag = value
    Equals { key: String, value: String },
    /// Any of values: tag IN (v1, v2, ...)
    In { key: String, values: Vec<String> },
    /// Glob match: tag LIKE 'pattern', `*` matches any run of characters
    Like { key: String, pattern: String },
    /// Regex match: tag =~ /pattern/
    Regex { key: String, pattern: String },
    /// Negation
    Not(Box<TagFilter>),
    /// Parenthesized expression
    Paren(Box<TagFilter>),
    /// Binary combination
    Binary {
        op: BinaryOp,
        left: Box<TagFilter>,
        right: Box<TagFilter>,
    },
}

impl TagFilter {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagFilter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `tag != value`, expressed as `not (tag = value)`
    pub fn not_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagFilter::Not(Box::new(TagFilter::equals(key, value)))
    }

    pub fn in_values<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TagFilter::In {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn like(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        TagFilter::Like {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    pub fn regex(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        TagFilter::Regex {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    pub fn not(inner: TagFilter) -> Self {
        TagFilter::Not(Box::new(inner))
    }

    pub fn paren(inner: TagFilter) -> Self {
        TagFilter::Paren(Box::new(inner))
    }

    pub fn and(left: TagFilter, right: TagFilter) -> Self {
        TagFilter::binary(BinaryOp::And, left, right)
    }

    pub fn or(left: TagFilter, right: TagFilter) -> Self {
        TagFilter::binary(BinaryOp::Or, left, right)
    }

    pub fn binary(op: BinaryOp, left: TagFilter, right: TagFilter) -> Self {
        TagFilter::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Whether this node is a leaf predicate
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            TagFilter::Equals { .. }
                | TagFilter::In { .. }
                | TagFilter::Like { .. }
                | TagFilter::Regex { .. }
        )
    }

    /// Tag key of a leaf predicate, looking through parentheses
    pub fn tag_key(&self) -> Option<&str> {
        match self {
            TagFilter::Equals { key, .. }
            | TagFilter::In { key, .. }
            | TagFilter::Like { key, .. }
            | TagFilter::Regex { key, .. } => Some(key),
            TagFilter::Paren(inner) => inner.tag_key(),
            TagFilter::Not(_) | TagFilter::Binary { .. } => None,
        }
    }

    /// The leaf predicate below any parentheses, if there is one
    pub fn leaf(&self) -> Option<&TagFilter> {
        match self {
            TagFilter::Paren(inner) => inner.leaf(),
            leaf if leaf.is_leaf() => Some(leaf),
            _ => None,
        }
    }

    /// Canonical string form; keys the tag search results
    pub fn rewrite(&self) -> String {
        match self {
            TagFilter::Equals { key, value } => format!("{}='{}'", key, value),
            TagFilter::In { key, values } => {
                let values: Vec<String> = values.iter().map(|v| format!("'{}'", v)).collect();
                format!("{} in ({})", key, values.join(","))
            }
            TagFilter::Like { key, pattern } => format!("{} like '{}'", key, pattern),
            TagFilter::Regex { key, pattern } => format!("{}=~'{}'", key, pattern),
            TagFilter::Not(inner) => format!("not ({})", inner.rewrite()),
            TagFilter::Paren(inner) => format!("({})", inner.rewrite()),
            TagFilter::Binary { op, left, right } => {
                format!("{} {} {}", left.rewrite(), op.as_str(), right.rewrite())
            }
        }
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rewrite())
    }
}

/// Glob match where `*` matches any run of characters, anchored at both ends
pub fn like_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !value.starts_with(first) {
        return false;
    }
    let mut rest = &value[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite() {
        assert_eq!(TagFilter::equals("host", "h1").rewrite(), "host='h1'");
        assert_eq!(TagFilter::in_values("host", ["a", "b"]).rewrite(), "host in ('a','b')");
        assert_eq!(TagFilter::like("host", "a*").rewrite(), "host like 'a*'");
        assert_eq!(TagFilter::regex("host", "^a").rewrite(), "host=~'^a'");
        assert_eq!(TagFilter::not_equals("path", "p1").rewrite(), "not (path='p1')");

        let expr = TagFilter::and(
            TagFilter::equals("host", "h1"),
            TagFilter::paren(TagFilter::or(
                TagFilter::equals("a", "1"),
                TagFilter::equals("b", "2"),
            )),
        );
        assert_eq!(expr.rewrite(), "host='h1' and (a='1' or b='2')");
        assert_eq!(expr.to_string(), expr.rewrite());
    }

    #[test]
    fn test_tag_key_and_leaf() {
        let expr = TagFilter::paren(TagFilter::paren(TagFilter::equals("host", "h1")));
        assert_eq!(expr.tag_key(), Some("host"));
        assert_eq!(expr.leaf(), Some(&TagFilter::equals("host", "h1")));

        let not = TagFilter::not_equals("host", "h1");
        assert_eq!(not.tag_key(), None);
        assert!(not.leaf().is_none());

        let binary = TagFilter::and(TagFilter::equals("a", "1"), TagFilter::equals("b", "2"));
        assert!(binary.leaf().is_none());
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("*", "anything"));
        assert!(like_match("*", ""));
        assert!(like_match("abc", "abc"));
        assert!(!like_match("abc", "abcd"));
        assert!(like_match("ab*", "abcd"));
        assert!(!like_match("ab*", "xabcd"));
        assert!(like_match("*cd", "abcd"));
        assert!(!like_match("*cd", "abcde"));
        assert!(like_match("*bc*", "abcd"));
        assert!(like_match("a*c*e", "abcde"));
        assert!(!like_match("a*c*e", "abde"));
        assert!(!like_match("ab*ba", "aba"));
    }
}
