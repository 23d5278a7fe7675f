//! Entity identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Project identifier
    ProjectId
);

uuid_id!(
    /// Section identifier, stable across edits that keep the section
    SectionId
);

uuid_id!(
    /// Preference identifier
    PreferenceId
);

impl PreferenceId {
    /// Name-based identifier: the same key always yields the same id, which
    /// keeps preference inference reproducible across replays.
    #[must_use]
    pub fn derived(key: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_preference_ids_are_stable() {
        assert_eq!(PreferenceId::derived("style/code"), PreferenceId::derived("style/code"));
        assert_ne!(PreferenceId::derived("style/code"), PreferenceId::derived("style/title"));
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = SectionId::new();
        let parsed: SectionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
