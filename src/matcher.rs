use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Predicate over group names. `Equals` is the only operator the store may
/// serve with a direct index lookup; the others scan group names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMatcher {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Anything,
}

impl GroupMatcher {
    pub fn equals(group: impl Into<String>) -> Self {
        Self::Equals(group.into())
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self::StartsWith(prefix.into())
    }

    pub fn ends_with(suffix: impl Into<String>) -> Self {
        Self::EndsWith(suffix.into())
    }

    pub fn contains(fragment: impl Into<String>) -> Self {
        Self::Contains(fragment.into())
    }

    pub fn matches(&self, group: &str) -> bool {
        match self {
            | Self::Equals(g) => group == g,
            | Self::StartsWith(p) => group.starts_with(p.as_str()),
            | Self::EndsWith(s) => group.ends_with(s.as_str()),
            | Self::Contains(c) => group.contains(c.as_str()),
            | Self::Anything => true,
        }
    }

    /// The exact group this matcher selects, when it is an equality match.
    pub fn as_equals(&self) -> Option<&str> {
        match self {
            | Self::Equals(g) => Some(g),
            | _ => None,
        }
    }
}

/// Predicate over full keys, used to scope listener registrations. Composes
/// with `And` / `Or` / `Not`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Matcher {
    Everything,
    Group(GroupMatcher),
    KeyEquals(Key),
    NameEquals(String),
    And(Box<Matcher>, Box<Matcher>),
    Or(Box<Matcher>, Box<Matcher>),
    Not(Box<Matcher>),
}

impl Matcher {
    pub fn key_equals(key: Key) -> Self {
        Self::KeyEquals(key)
    }

    pub fn group_equals(group: impl Into<String>) -> Self {
        Self::Group(GroupMatcher::equals(group))
    }

    pub fn name_equals(name: impl Into<String>) -> Self {
        Self::NameEquals(name.into())
    }

    pub fn and(self, other: Matcher) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Matcher) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn matches(&self, key: &Key) -> bool {
        match self {
            | Self::Everything => true,
            | Self::Group(m) => m.matches(key.group()),
            | Self::KeyEquals(k) => k == key,
            | Self::NameEquals(n) => key.name() == n,
            | Self::And(a, b) => a.matches(key) && b.matches(key),
            | Self::Or(a, b) => a.matches(key) || b.matches(key),
            | Self::Not(inner) => !inner.matches(key),
        }
    }
}
