//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! MessageId where a UserId is expected) and make the code more
//! self-documenting. All of them wrap opaque provider-issued strings; no
//! format is assumed beyond non-emptiness at the call sites that care.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque tenant identifier issued by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(s: impl Into<String>) -> Self {
        TenantId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId(s.to_string())
    }
}

/// A mailbox user identifier.
///
/// The provider accepts either the directory GUID or the principal address
/// here, so this type carries whichever the caller had.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(s: impl Into<String>) -> Self {
        UserId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// A provider-assigned subscription identifier (globally unique).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new(s: impl Into<String>) -> Self {
        SubscriptionId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        SubscriptionId(s)
    }
}

/// A provider message identifier within a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(s: impl Into<String>) -> Self {
        MessageId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod tenant_id {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serde_roundtrip(s in "[a-z0-9-]{1,64}") {
                let id = TenantId::new(&s);
                let json = serde_json::to_string(&id).unwrap();
                let parsed: TenantId = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(id, parsed);
            }

            #[test]
            fn serializes_transparently(s in "[a-z0-9-]{1,64}") {
                let id = TenantId::new(&s);
                let json = serde_json::to_string(&id).unwrap();
                prop_assert_eq!(json, format!("\"{}\"", s));
            }
        }
    }

    mod user_id {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serde_roundtrip(s in "[a-z0-9.@-]{1,64}") {
                let id = UserId::new(&s);
                let json = serde_json::to_string(&id).unwrap();
                let parsed: UserId = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(id, parsed);
            }

            #[test]
            fn display_is_verbatim(s in "[a-z0-9.@-]{1,64}") {
                let id = UserId::new(&s);
                prop_assert_eq!(format!("{}", id), s);
            }
        }
    }

    mod message_id {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serde_roundtrip(s in "[A-Za-z0-9_=-]{1,120}") {
                let id = MessageId::new(&s);
                let json = serde_json::to_string(&id).unwrap();
                let parsed: MessageId = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(id, parsed);
            }
        }
    }

    #[test]
    fn subscription_id_accessors() {
        let id = SubscriptionId::new("sub-1");
        assert_eq!(id.as_str(), "sub-1");
        assert_eq!(format!("{}", id), "sub-1");
    }
}
