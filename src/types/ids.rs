//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.
//! Fresh ids come from an injected [`IdGenerator`](crate::kernel::clock::IdGenerator)
//! so tests can use deterministic sequences.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::kernel::clock::IdGenerator;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `generate()`, `new()` (UUID v4), `from_string()`,
/// `as_str()`, Display, Serialize, Deserialize. The literal is the prefix used
/// when ids are minted by an [`IdGenerator`].
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Id prefix handed to the generator.
            pub const PREFIX: &'static str = $prefix;

            /// Mint an id from the injected generator.
            pub fn generate(ids: &dyn IdGenerator) -> Self {
                Self(ids.next_id(Self::PREFIX))
            }

            /// Random UUID-backed id, independent of any generator.
            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, uuid::Uuid::new_v4()))
            }

            pub fn from_string(s: impl Into<String>) -> Result<Self, &'static str> {
                let s = s.into();
                if s.trim().is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[cfg(test)]
            pub(crate) fn must(s: &str) -> Self {
                Self(s.to_string())
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
    };
}

define_id!(TaskId, "task");
define_id!(ProcessId, "proc");
define_id!(RequestId, "req");
define_id!(PoolId, "pool");
define_id!(PrincipalId, "principal");
define_id!(CapabilityId, "cap");
define_id!(SandboxId, "sandbox");
define_id!(PolicyId, "policy");
define_id!(RuleId, "rule");
define_id!(AuditEntryId, "audit");
define_id!(CheckpointId, "ckpt");
define_id!(GroupId, "group");
define_id!(MessageId, "msg");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::clock::SequentialIdGenerator;

    #[test]
    fn test_from_string_rejects_empty() {
        assert!(TaskId::from_string("").is_err());
        assert!(TaskId::from_string("   ").is_err());
        assert_eq!(TaskId::from_string("t-1").unwrap().as_str(), "t-1");
    }

    #[test]
    fn test_generate_uses_prefix() {
        let ids = SequentialIdGenerator::new();
        let a = ProcessId::generate(&ids);
        let b = ProcessId::generate(&ids);
        assert_eq!(a.as_str(), "proc_1");
        assert_eq!(b.as_str(), "proc_2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("req_"));
    }
}
