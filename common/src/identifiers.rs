//! Identifier types for ledger records.
//!
//! All identifiers wrap UUID v7 values, so they sort by creation time and
//! carry a stable total order. The ledger relies on that order when it has
//! to lock more than one account.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
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
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_identifier!(
    /// Unique identifier for an account.
    AccountId
);

uuid_identifier!(
    /// Unique identifier for a ledger transaction (transfer, deposit or withdrawal).
    TransactionId
);

uuid_identifier!(
    /// Unique identifier for a single ledger entry.
    EntryId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_creation() {
        let id1 = AccountId::new();
        let id2 = AccountId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_transaction_id_parse() {
        let uuid_str = "019456ab-1234-7def-8901-234567890abc";
        let id = TransactionId::parse(uuid_str).unwrap();
        assert_eq!(id.to_string(), uuid_str);
        assert_eq!(uuid_str.parse::<TransactionId>().unwrap(), id);
    }

    #[test]
    fn test_account_id_total_order() {
        let low = AccountId::parse("00000000-0000-7000-8000-000000000001").unwrap();
        let high = AccountId::parse("00000000-0000-7000-8000-000000000002").unwrap();
        assert!(low < high);
        assert_eq!(low.max(high), high);
    }

    #[test]
    fn test_serializes_as_plain_uuid() {
        let id = EntryId::parse("019456ab-1234-7def-8901-234567890abc").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"019456ab-1234-7def-8901-234567890abc\"");
    }
}
