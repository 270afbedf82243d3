use std::cmp::Ordering;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Group applied when a key is created without one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// A `(group, name)` pair identifying a job or a trigger. Both components are
/// non-empty and compared case-sensitively. Keys order with the `DEFAULT`
/// group before any other group, then lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    group: String,
    name: String,
}

impl Key {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        let group = group.into();
        let group = if group.is_empty() {
            DEFAULT_GROUP.to_owned()
        } else {
            group
        };
        Self {
            group,
            name: name.into(),
        }
    }

    /// A key in the `DEFAULT` group.
    pub fn of_name(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_GROUP, name)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.group == DEFAULT_GROUP, other.group == DEFAULT_GROUP) {
            | (true, false) => Ordering::Less,
            | (false, true) => Ordering::Greater,
            | _ => self
                .group
                .cmp(&other.group)
                .then_with(|| self.name.cmp(&other.name)),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
            derive_more::Display,
        )]
        pub struct $name(Key);

        impl $name {
            pub fn new(
                group: impl Into<String>,
                name: impl Into<String>,
            ) -> Self {
                Self(Key::new(group, name))
            }

            /// A key in the `DEFAULT` group.
            pub fn of_name(name: impl Into<String>) -> Self {
                Self(Key::of_name(name))
            }

            pub fn group(&self) -> &str {
                self.0.group()
            }

            pub fn name(&self) -> &str {
                self.0.name()
            }

            pub fn as_key(&self) -> &Key {
                &self.0
            }
        }

        impl From<Key> for $name {
            fn from(key: Key) -> Self {
                Self(key)
            }
        }
    };
}

define_key! {
    /// Identity of a stored job.
    JobKey
}

define_key! {
    /// Identity of a stored trigger. Same shape as [`JobKey`] but the two are
    /// deliberately distinct types.
    TriggerKey
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_group_applies_when_omitted() {
        let key = Key::of_name("reconcile");
        assert_eq!(DEFAULT_GROUP, key.group());
        assert_eq!("reconcile", key.name());
        assert_eq!(Key::new("", "reconcile"), key);
    }

    #[test]
    fn default_group_sorts_first() {
        let a = Key::of_name("zz");
        let b = Key::new("AAA", "aa");
        assert!(a < b);

        let c = Key::new("batch", "a");
        let d = Key::new("batch", "b");
        assert!(c < d);
        assert!(b < c);
    }

    #[test]
    fn equality_is_case_sensitive() {
        assert_ne!(Key::new("batch", "Load"), Key::new("batch", "load"));
        assert_ne!(Key::new("Batch", "load"), Key::new("batch", "load"));
    }

    #[test]
    fn job_and_trigger_keys_display_dotted() {
        assert_eq!(
            "ingest.rollup",
            JobKey::new("ingest", "rollup").to_string()
        );
        assert_eq!(
            "DEFAULT.rollup",
            TriggerKey::of_name("rollup").to_string()
        );
    }
}
