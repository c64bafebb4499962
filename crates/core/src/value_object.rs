//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. In the
/// ledger, validated movement inputs and balance keys are value objects: two
/// `(warehouse, product)` keys with the same ids address the same balance row.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
