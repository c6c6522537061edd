#![forbid(unsafe_code)]

//! Dotted property paths and the reserved-key guard.
//!
//! A [`PropertyPath`] addresses a node in the state tree as a sequence of
//! keys from the root. Its canonical string form joins the keys with `.`
//! (`"user.profile.name"`); the root is the empty path and renders as `""`.
//!
//! Keys that themselves contain a `.` are still addressable through the
//! wrapper API, but their dotted form is ambiguous and [`PropertyPath::parse`]
//! will split them.

use std::fmt;

/// Key names that never go through interception.
///
/// Reads of these keys return the raw stored value and writes are refused,
/// so attacker-controlled key names cannot reach the bookkeeping of the
/// wrapper layer.
pub const RESERVED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Whether `key` is one of [`RESERVED_KEYS`].
#[must_use]
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// A sequence of keys from the root of the state tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyPath {
    segments: Vec<String>,
}

impl PropertyPath {
    /// The root path (no segments).
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a dotted path. The empty string is the root; empty segments
    /// (`"a..b"`, a trailing `.`) are dropped.
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        Self {
            segments: dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// The path of `key` beneath this one.
    #[must_use]
    pub fn child(&self, key: &str) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.extend(self.segments.iter().cloned());
        segments.push(key.to_owned());
        Self { segments }
    }

    /// Push a key onto the end of this path.
    pub fn push(&mut self, key: &str) {
        self.segments.push(key.to_owned());
    }

    /// Remove and return the last key.
    pub fn pop(&mut self) -> Option<String> {
        self.segments.pop()
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last key of the path, `None` at the root.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The enclosing path, `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl From<&str> for PropertyPath {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

impl<S: AsRef<str>> FromIterator<S> for PropertyPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().map(|s| s.as_ref().to_owned()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_renders_empty() {
        let root = PropertyPath::root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "");
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn child_joins_with_dots() {
        let path = PropertyPath::root().child("user").child("profile").child("name");
        assert_eq!(path.to_string(), "user.profile.name");
        assert_eq!(path.len(), 3);
        assert_eq!(path.last(), Some("name"));
    }

    #[test]
    fn parse_matches_display() {
        let path = PropertyPath::parse("a.b.c");
        assert_eq!(path.segments(), ["a", "b", "c"]);
        assert_eq!(path, PropertyPath::from_iter(["a", "b", "c"]));
        assert_eq!(PropertyPath::parse(""), PropertyPath::root());
        assert_eq!(PropertyPath::parse("a..b.").to_string(), "a.b");
    }

    #[test]
    fn parent_and_pop() {
        let mut path = PropertyPath::parse("settings.theme.accent");
        assert_eq!(path.parent(), Some(PropertyPath::parse("settings.theme")));
        assert_eq!(path.pop().as_deref(), Some("accent"));
        path.push("mode");
        assert_eq!(path.to_string(), "settings.theme.mode");
    }

    #[test]
    fn reserved_keys() {
        assert!(is_reserved_key("__proto__"));
        assert!(is_reserved_key("constructor"));
        assert!(is_reserved_key("prototype"));
        assert!(!is_reserved_key("proto"));
        assert!(!is_reserved_key("user"));
    }
}
