//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Primary key of a queue record, assigned by the store on insert.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

/// Identifier of a savepoint inside one open transaction.
///
/// Ids are allocated from a per-handle counter and never reused, so the
/// derived SQL name is unique for the lifetime of the transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SavepointId(u64);

macro_rules! impl_int_newtype {
    ($t:ty, $inner:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> $inner {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$inner> for $t {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl From<$t> for $inner {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = <$inner>::from_str(s)
                    .map_err(|e| StoreError::decode(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

impl_int_newtype!(RecordId, i64, "RecordId");
impl_int_newtype!(SavepointId, u64, "SavepointId");

impl SavepointId {
    /// SQL identifier used for `SAVEPOINT` / `ROLLBACK TO SAVEPOINT`.
    pub fn sql_name(&self) -> String {
        format!("sp_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_parses_and_displays() {
        let id: RecordId = "42".parse().unwrap();
        assert_eq!(id, RecordId::new(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn record_id_rejects_garbage() {
        let err = "abc".parse::<RecordId>().unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn savepoint_names_are_sql_safe() {
        assert_eq!(SavepointId::new(7).sql_name(), "sp_7");
    }
}
