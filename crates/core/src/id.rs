//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a warehouse (stock location).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarehouseId(i64);

/// Identifier of a product (stock keeping unit).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(i64);

/// Identifier of a committed inventory transaction header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

/// Identifier of a user (actor identity recorded as `created_by`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

macro_rules! impl_serial_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Build an identifier from a raw database key.
            ///
            /// No validation happens here; use [`Self::parse`] or
            /// [`Self::ensure_valid`] at input boundaries.
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> i64 {
                self.0
            }

            pub fn is_valid(self) -> bool {
                self.0 > 0
            }

            /// Reject zero/negative keys (the "missing" value of form inputs).
            pub fn ensure_valid(self) -> Result<Self, DomainError> {
                if self.is_valid() {
                    Ok(self)
                } else {
                    Err(DomainError::invalid_id(format!(
                        "{} must be a positive integer (got {})",
                        $name, self.0
                    )))
                }
            }

            pub fn parse(raw: i64) -> Result<Self, DomainError> {
                Self(raw).ensure_valid()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Self::parse(raw)
            }
        }
    };
}

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_serial_newtype!(WarehouseId, "WarehouseId");
impl_serial_newtype!(ProductId, "ProductId");
impl_uuid_newtype!(TransactionId, "TransactionId");
impl_uuid_newtype!(UserId, "UserId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_ids_reject_zero_and_negative() {
        assert!(WarehouseId::parse(0).is_err());
        assert!(ProductId::parse(-3).is_err());
        assert_eq!(WarehouseId::parse(7).unwrap().get(), 7);
    }

    #[test]
    fn serial_ids_parse_from_form_strings() {
        let wh: WarehouseId = " 12 ".parse().unwrap();
        assert_eq!(wh, WarehouseId::new(12));

        let err = "abc".parse::<ProductId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("ProductId")));
    }

    #[test]
    fn uuid_ids_round_trip_through_display() {
        let id = TransactionId::new();
        let parsed: TransactionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
