//! Aggregate root trait.

/// Aggregate root marker + minimal interface.
///
/// In the inventory ledger the only mutable aggregate is the per
/// `(warehouse, product)` balance. Everything else is an insert-only fact.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// For a balance this is the number of committed movements applied to it.
    fn version(&self) -> u64;
}
