//! Movement kinds, movement codes and idempotency keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{DomainError, ProductId, WarehouseId};

/// Kind of a committed inventory transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    In,
    Out,
    Transfer,
    Adjust,
}

impl MovementType {
    /// Stable code persisted in the `tx_type` columns.
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::In => "IN",
            MovementType::Out => "OUT",
            MovementType::Transfer => "TRANSFER",
            MovementType::Adjust => "ADJUST",
        }
    }

    /// Prefix used for auto-generated movement codes.
    pub fn code_prefix(self) -> &'static str {
        match self {
            MovementType::In => "IN",
            MovementType::Out => "OUT",
            MovementType::Transfer => "TRF",
            MovementType::Adjust => "ADJ",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(MovementType::In),
            "OUT" => Ok(MovementType::Out),
            "TRANSFER" => Ok(MovementType::Transfer),
            "ADJUST" => Ok(MovementType::Adjust),
            other => Err(DomainError::validation(format!("unknown movement type '{other}'"))),
        }
    }
}

/// Which end of a transfer a line belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferSide {
    Source,
    Destination,
}

impl TransferSide {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferSide::Source => "SRC",
            TransferSide::Destination => "DST",
        }
    }

    fn code_suffix(self) -> &'static str {
        match self {
            TransferSide::Source => "OUT",
            TransferSide::Destination => "IN",
        }
    }
}

impl core::str::FromStr for TransferSide {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SRC" => Ok(TransferSide::Source),
            "DST" => Ok(TransferSide::Destination),
            other => Err(DomainError::validation(format!("unknown transfer side '{other}'"))),
        }
    }
}

/// Longest code accepted from a caller. Leaves room for the transfer leg suffix
/// inside the 64-character column.
pub const MAX_CALLER_CODE_LEN: usize = 60;

/// Unique business code of a transaction header (e.g. `GRN-2024-0001`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovementCode(String);

impl MovementCode {
    /// Validate a caller-supplied code.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let code = raw.trim();
        if code.is_empty() {
            return Err(DomainError::validation("movement code cannot be blank"));
        }
        if code.len() > MAX_CALLER_CODE_LEN {
            return Err(DomainError::validation(format!(
                "movement code longer than {MAX_CALLER_CODE_LEN} characters"
            )));
        }
        if let Some(bad) = code
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')))
        {
            return Err(DomainError::validation(format!(
                "movement code contains invalid character '{bad}'"
            )));
        }
        Ok(Self(code.to_string()))
    }

    /// Timestamp-based code for callers that did not supply one.
    ///
    /// The random tail of a UUIDv7 keeps codes generated in the same
    /// microsecond apart. Two calls never share a generated code, so such
    /// movements are not protected against resubmission.
    pub fn generate(movement_type: MovementType, at: DateTime<Utc>) -> Self {
        let nonce = Uuid::now_v7().simple().to_string();
        Self(format!(
            "{}-{}-{}",
            movement_type.code_prefix(),
            at.format("%Y%m%d%H%M%S%6f"),
            &nonce[nonce.len() - 12..]
        ))
    }

    /// Code of one leg of a transfer (`<code>-OUT` / `<code>-IN`).
    pub fn leg(&self, side: TransferSide) -> Self {
        Self(format!("{}-{}", self.0, side.code_suffix()))
    }

    /// Transfer code a leg code was derived from, if this is a code of `side`.
    pub fn transfer_code(&self, side: TransferSide) -> Option<Self> {
        self.0
            .strip_suffix(side.code_suffix())?
            .strip_suffix('-')
            .filter(|base| !base.is_empty())
            .map(|base| Self(base.to_string()))
    }

    /// Rebuild from a persisted value (already validated on the way in).
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for MovementCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scope under which movement keys are reserved in the idempotency store.
pub const IDEMPOTENCY_SCOPE: &str = "inventory.movement";

/// Deterministic key identifying one logical movement:
/// `(type, code, warehouse, product)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_movement(
        movement_type: MovementType,
        code: &MovementCode,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Self {
        Self(format!(
            "inventory:{}:{}:{}:{}",
            movement_type.as_str(),
            code.as_str(),
            warehouse_id,
            product_id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn movement_type_serializes_as_ledger_code() {
        let json = serde_json::to_string(&MovementType::Adjust).unwrap();
        assert_eq!(json, "\"ADJUST\"");
        assert_eq!("TRANSFER".parse::<MovementType>().unwrap(), MovementType::Transfer);
        assert!("adjust".parse::<MovementType>().is_err());
    }

    #[test]
    fn caller_codes_are_trimmed_and_checked() {
        assert_eq!(MovementCode::parse("  GRN-001 ").unwrap().as_str(), "GRN-001");
        assert!(MovementCode::parse("   ").is_err());
        assert!(MovementCode::parse("GRN 001").is_err());
        assert!(MovementCode::parse(&"X".repeat(MAX_CALLER_CODE_LEN + 1)).is_err());
    }

    #[test]
    fn generated_codes_embed_prefix_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let code = MovementCode::generate(MovementType::Adjust, at);
        assert!(code.as_str().starts_with("ADJ-20240309140507000000-"), "{code}");
        assert!(MovementCode::parse(code.leg(TransferSide::Source).as_str()).is_ok());
    }

    #[test]
    fn generated_codes_differ_within_one_instant() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let codes: std::collections::HashSet<_> = (0..1_000)
            .map(|_| MovementCode::generate(MovementType::In, at))
            .collect();
        assert_eq!(codes.len(), 1_000);
    }

    #[test]
    fn transfer_legs_get_distinct_codes() {
        let code = MovementCode::parse("TRF-7").unwrap();
        assert_eq!(code.leg(TransferSide::Source).as_str(), "TRF-7-OUT");
        assert_eq!(code.leg(TransferSide::Destination).as_str(), "TRF-7-IN");
    }

    #[test]
    fn leg_codes_lead_back_to_transfer_code() {
        let code = MovementCode::parse("TRF-7").unwrap();
        let out = code.leg(TransferSide::Source);

        assert_eq!(out.transfer_code(TransferSide::Source), Some(code));
        assert_eq!(out.transfer_code(TransferSide::Destination), None);
        assert_eq!(MovementCode::from_stored("-OUT").transfer_code(TransferSide::Source), None);
        assert_eq!(MovementCode::from_stored("GRN-1").transfer_code(TransferSide::Source), None);
    }

    #[test]
    fn idempotency_key_covers_type_code_warehouse_and_product() {
        let code = MovementCode::parse("GRN-1").unwrap();
        let a = IdempotencyKey::for_movement(MovementType::In, &code, WarehouseId::new(1), ProductId::new(2));
        let b = IdempotencyKey::for_movement(MovementType::In, &code, WarehouseId::new(1), ProductId::new(3));
        let c = IdempotencyKey::for_movement(MovementType::Adjust, &code, WarehouseId::new(1), ProductId::new(2));

        assert_eq!(a.as_str(), "inventory:IN:GRN-1:1:2");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
