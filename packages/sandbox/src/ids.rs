// ABOUTME: Opaque identifier types for sandboxes, exec sessions and transfers
// ABOUTME: Each id is a prefixed random UUID so ids of different kinds never collide in logs

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(
    /// Identifier assigned to a sandbox when its create request is accepted
    SandboxId,
    "sbx"
);
opaque_id!(
    /// Identifier of one interactive exec session
    SessionId,
    "ses"
);
opaque_id!(
    /// Identifier of one filesystem import or export
    TransferId,
    "xfer"
);
