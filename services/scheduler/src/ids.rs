//! Typed identifiers.
//!
//! Identifiers handed out by the master (agents, offers, the framework) are
//! opaque strings, so they are wrapped rather than parsed. Task IDs are
//! minted locally as `{name}.{ulid}`.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Define a newtype over an opaque string identifier.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier of a task.
    TaskId
);
string_id!(
    /// Agent (host) identifier assigned by the master.
    AgentId
);
string_id!(
    /// Resource offer identifier assigned by the master.
    OfferId
);
string_id!(
    /// Identity the master assigns to this scheduler on subscription.
    FrameworkId
);

impl TaskId {
    /// Mint a fresh ID for a task called `name`.
    pub fn generate(name: &str) -> Self {
        Self(format!("{}.{}", name, Ulid::new()))
    }

    /// ID of the `n`th instance of a multi-instance task.
    pub fn instance(&self, n: u32) -> Self {
        Self(format!("{}-{}", self.0, n))
    }
}
