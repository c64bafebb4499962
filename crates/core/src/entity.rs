//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Ledger headers and card rows are entities: two movements with identical
/// quantities are still different facts.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
