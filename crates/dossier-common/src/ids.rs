//! Opaque identifier newtypes.
//!
//! All identifiers are uuid-v7 strings (time-ordered, like the evidence
//! bundle ids elsewhere in the stack). Foreign references between record
//! sets are always by identifier, never by embedding.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Mint a fresh time-ordered identifier.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, uuid::Uuid::now_v7()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_newtype!(
    /// Identifier of a decision run.
    RunId,
    "run"
);
id_newtype!(
    /// Identifier of one reasoning move event.
    MoveEventId,
    "mv"
);
id_newtype!(
    /// Identifier of an executed tool/model invocation.
    InvocationId,
    "inv"
);
id_newtype!(
    /// Identifier of a queued tool request.
    RequestId,
    "req"
);
id_newtype!(
    /// Identifier of a retrieval frame version.
    FrameId,
    "frm"
);
id_newtype!(
    /// Identifier of an audit log entry.
    AuditEventId,
    "aud"
);

/// Opaque, globally unique pointer to a citable fragment of external
/// material. Minted by the evidence-producing subsystem, never by this
/// engine; we only store and index it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceRef(pub String);

impl EvidenceRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EvidenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EvidenceRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EvidenceRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}
