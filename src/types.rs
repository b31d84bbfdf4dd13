//! NewType wrappers for strong typing throughout the orchestrator.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a host name where a client role is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role prefix shared by every filesystem client in a cluster.
pub const CLIENT_ROLE_PREFIX: &str = "client.";

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Role name of a filesystem client (e.g., "client.0").
    ///
    /// This is the identity passed to the client daemon via `--name` and the
    /// key of the daemon registry.
    ClientId
);

newtype_string!(
    /// Address of a remote host as understood by the transport
    /// (e.g., "ubuntu@node1.example.com").
    HostName
);

newtype_string!(
    /// Absolute path of a mount point on a remote host.
    MountPoint
);

impl ClientId {
    /// The part of the role after `client.`, used to derive per-client paths.
    ///
    /// Falls back to the whole role when it has no client prefix.
    pub fn short(&self) -> &str {
        self.0.strip_prefix(CLIENT_ROLE_PREFIX).unwrap_or(&self.0)
    }

    /// True when the role names a filesystem client.
    pub fn is_client_role(&self) -> bool {
        self.0.starts_with(CLIENT_ROLE_PREFIX) && self.0.len() > CLIENT_ROLE_PREFIX.len()
    }
}

impl MountPoint {
    /// Deterministic mount point for a client under the test directory.
    pub fn for_client(test_dir: &str, prefix: &str, client: &ClientId) -> Self {
        let dir = test_dir.trim_end_matches('/');
        Self(format!("{}/{}{}", dir, prefix, client.short()))
    }
}
