//! Per-(warehouse, product) balance and the weighted-average costing rule.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockledger_core::{AggregateRoot, ProductId, ValueObject, WarehouseId};

/// Numeric policy applied to every movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostingPolicy {
    /// Permit balances below `-qty_epsilon`.
    pub allow_negative_stock: bool,
    /// Quantities with an absolute value at or below this are treated as zero.
    pub qty_epsilon: Decimal,
    /// Maximum fractional digits of a quantity.
    pub qty_scale: u32,
    /// Fractional digits of a unit cost; weighted averages are rounded to it.
    pub cost_scale: u32,
}

impl Default for CostingPolicy {
    fn default() -> Self {
        Self {
            allow_negative_stock: false,
            qty_epsilon: Decimal::new(1, 6),
            qty_scale: 4,
            cost_scale: 2,
        }
    }
}

impl CostingPolicy {
    pub fn is_zero_qty(&self, qty: Decimal) -> bool {
        qty.abs() <= self.qty_epsilon
    }

    pub fn round_cost(&self, cost: Decimal) -> Decimal {
        cost.round_dp_with_strategy(self.cost_scale, RoundingStrategy::MidpointAwayFromZero)
    }
}

/// Address of a balance row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
}

impl BalanceKey {
    pub fn new(warehouse_id: WarehouseId, product_id: ProductId) -> Self {
        Self {
            warehouse_id,
            product_id,
        }
    }
}

impl ValueObject for BalanceKey {}

impl core::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "wh={} product={}", self.warehouse_id, self.product_id)
    }
}

/// Materialised quantity and weighted-average cost for one key.
///
/// The stock card is the source of truth; a balance is the running result of
/// applying every committed card entry for its key, in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub key: BalanceKey,
    pub qty: Decimal,
    pub avg_cost: Decimal,
    pub updated_at: DateTime<Utc>,
    /// Number of movements applied.
    pub version: u64,
}

impl Balance {
    /// Implicit balance of a key that has never moved.
    pub fn empty(key: BalanceKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            qty: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
            updated_at: at,
            version: 0,
        }
    }

    /// Apply one signed quantity delta.
    ///
    /// `inbound_unit_cost` is only read when `delta > 0`; outbound movements are
    /// valued at the current average. A receipt onto a balance at or below zero
    /// takes its own unit cost as the new average, so the average never goes
    /// negative. The receiver is not modified: the caller
    /// persists [`AppliedMovement::balance`] once the whole movement is written.
    pub fn apply(
        &self,
        delta: Decimal,
        inbound_unit_cost: Decimal,
        policy: &CostingPolicy,
        at: DateTime<Utc>,
    ) -> Result<AppliedMovement, CostingError> {
        let new_qty = self
            .qty
            .checked_add(delta)
            .ok_or(CostingError::Overflow("quantity"))?;

        if new_qty < -policy.qty_epsilon && !policy.allow_negative_stock {
            return Err(CostingError::NegativeStock(NegativeStockError {
                key: self.key,
                on_hand: self.qty,
                requested: delta,
            }));
        }

        let (unit_cost, new_avg) = if delta > Decimal::ZERO {
            let avg = if policy.is_zero_qty(new_qty) {
                Decimal::ZERO
            } else if self.qty <= policy.qty_epsilon {
                // Nothing valued on hand (empty or short): the receipt sets the cost.
                policy.round_cost(inbound_unit_cost)
            } else {
                let prior_value = self
                    .qty
                    .checked_mul(self.avg_cost)
                    .ok_or(CostingError::Overflow("stock value"))?;
                let inbound_value = delta
                    .checked_mul(inbound_unit_cost)
                    .ok_or(CostingError::Overflow("inbound value"))?;
                let total = prior_value
                    .checked_add(inbound_value)
                    .ok_or(CostingError::Overflow("stock value"))?;
                let avg = total
                    .checked_div(new_qty)
                    .ok_or(CostingError::Overflow("average cost"))?;
                policy.round_cost(avg)
            };
            (inbound_unit_cost, avg)
        } else {
            let avg = if policy.is_zero_qty(new_qty) {
                Decimal::ZERO
            } else {
                self.avg_cost
            };
            (self.avg_cost, avg)
        };

        Ok(AppliedMovement {
            delta,
            unit_cost,
            qty_in: delta.max(Decimal::ZERO),
            qty_out: (-delta).max(Decimal::ZERO),
            balance: Balance {
                key: self.key,
                qty: new_qty,
                avg_cost: new_avg,
                updated_at: at,
                version: self.version + 1,
            },
        })
    }
}

impl AggregateRoot for Balance {
    type Id = BalanceKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Result of applying a movement to a balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMovement {
    pub delta: Decimal,
    /// Unit cost the movement was valued at.
    pub unit_cost: Decimal,
    pub qty_in: Decimal,
    pub qty_out: Decimal,
    /// Balance after the movement.
    pub balance: Balance,
}

/// A movement would take stock below zero while negative stock is disallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient stock at {key}: on hand {on_hand}, movement {requested}")]
pub struct NegativeStockError {
    pub key: BalanceKey,
    pub on_hand: Decimal,
    pub requested: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CostingError {
    #[error(transparent)]
    NegativeStock(#[from] NegativeStockError),

    #[error("decimal overflow computing {0}")]
    Overflow(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn key() -> BalanceKey {
        BalanceKey::new(WarehouseId::new(1), ProductId::new(1))
    }

    fn post(balance: &Balance, delta: Decimal, cost: Decimal, policy: &CostingPolicy) -> Balance {
        balance.apply(delta, cost, policy, Utc::now()).unwrap().balance
    }

    #[test]
    fn inbound_blends_into_weighted_average() {
        let policy = CostingPolicy::default();
        let b = Balance::empty(key(), Utc::now());

        let b = post(&b, dec!(10), dec!(100000), &policy);
        assert_eq!((b.qty, b.avg_cost), (dec!(10), dec!(100000)));

        let applied = b.apply(dec!(5), dec!(120000), &policy, Utc::now()).unwrap();
        assert_eq!(applied.unit_cost, dec!(120000));
        assert_eq!(applied.qty_in, dec!(5));
        assert_eq!(applied.qty_out, Decimal::ZERO);
        assert_eq!(applied.balance.qty, dec!(15));
        assert_eq!(applied.balance.avg_cost, dec!(106666.67));
        assert_eq!(applied.balance.version, 2);
    }

    #[test]
    fn outbound_is_valued_at_average_and_keeps_it() {
        let policy = CostingPolicy::default();
        let b = Balance {
            key: key(),
            qty: dec!(15),
            avg_cost: dec!(106666.67),
            updated_at: Utc::now(),
            version: 2,
        };

        let applied = b.apply(dec!(-8), dec!(999), &policy, Utc::now()).unwrap();
        assert_eq!(applied.unit_cost, dec!(106666.67));
        assert_eq!(applied.qty_out, dec!(8));
        assert_eq!(applied.balance.qty, dec!(7));
        assert_eq!(applied.balance.avg_cost, dec!(106666.67));
    }

    #[test]
    fn draining_to_zero_resets_average() {
        let policy = CostingPolicy::default();
        let b = post(&Balance::empty(key(), Utc::now()), dec!(3), dec!(50), &policy);
        let b = post(&b, dec!(-3), Decimal::ZERO, &policy);

        assert_eq!(b.qty, Decimal::ZERO);
        assert_eq!(b.avg_cost, Decimal::ZERO);
    }

    #[test]
    fn negative_stock_is_rejected_unless_allowed() {
        let strict = CostingPolicy::default();
        let empty = Balance::empty(key(), Utc::now());

        let err = empty.apply(dec!(-1), Decimal::ZERO, &strict, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            CostingError::NegativeStock(NegativeStockError {
                key: key(),
                on_hand: Decimal::ZERO,
                requested: dec!(-1),
            })
        );

        let lenient = CostingPolicy {
            allow_negative_stock: true,
            ..CostingPolicy::default()
        };
        let b = post(&empty, dec!(-1), Decimal::ZERO, &lenient);
        assert_eq!(b.qty, dec!(-1));
        assert_eq!(b.avg_cost, Decimal::ZERO);
    }

    #[test]
    fn receipt_onto_negative_balance_takes_receipt_cost() {
        let lenient = CostingPolicy {
            allow_negative_stock: true,
            ..CostingPolicy::default()
        };
        let short = post(&Balance::empty(key(), Utc::now()), dec!(-5), Decimal::ZERO, &lenient);

        let applied = short.apply(dec!(3), dec!(10), &lenient, Utc::now()).unwrap();
        assert_eq!(applied.balance.qty, dec!(-2));
        assert_eq!(applied.balance.avg_cost, dec!(10));
        assert_eq!(applied.unit_cost, dec!(10));

        let b = post(&applied.balance, dec!(4), dec!(16), &lenient);
        assert_eq!((b.qty, b.avg_cost), (dec!(2), dec!(16)));

        // Once positive, receipts blend again.
        let b = post(&b, dec!(2), dec!(10), &lenient);
        assert_eq!((b.qty, b.avg_cost), (dec!(4), dec!(13)));
    }

    #[test]
    fn shortfall_within_epsilon_is_tolerated() {
        let policy = CostingPolicy::default();
        let b = post(&Balance::empty(key(), Utc::now()), dec!(1), dec!(10), &policy);

        let b = post(&b, dec!(-1.0000005), Decimal::ZERO, &policy);
        assert_eq!(b.qty, dec!(-0.0000005));
        assert_eq!(b.avg_cost, Decimal::ZERO);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the balance quantity is the exact signed sum of the
        /// accepted deltas, and outbound deltas never move the average.
        #[test]
        fn qty_is_exact_sum_and_outbound_keeps_average(
            moves in prop::collection::vec((-500i64..1_000i64, 0i64..10_000_000i64), 1..60)
        ) {
            let policy = CostingPolicy::default();
            let mut balance = Balance::empty(key(), Utc::now());
            let mut expected = Decimal::ZERO;

            for (raw_qty, raw_cost) in moves {
                if raw_qty == 0 {
                    continue;
                }
                let delta = Decimal::new(raw_qty, 2);
                let cost = Decimal::new(raw_cost, 2);
                match balance.apply(delta, cost, &policy, Utc::now()) {
                    Ok(applied) => {
                        if delta < Decimal::ZERO && !policy.is_zero_qty(applied.balance.qty) {
                            prop_assert_eq!(applied.balance.avg_cost, balance.avg_cost);
                        }
                        expected += delta;
                        balance = applied.balance;
                    }
                    Err(CostingError::NegativeStock(_)) => {
                        prop_assert!(balance.qty + delta < -policy.qty_epsilon);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {e}"),
                }
                prop_assert_eq!(balance.qty, expected);
                prop_assert!(balance.qty >= -policy.qty_epsilon);
            }
        }

        /// Property: with negative stock allowed, the average cost never
        /// drops below zero whatever the order of receipts and issues.
        #[test]
        fn average_cost_is_never_negative(
            moves in prop::collection::vec((-1_000i64..1_000i64, 0i64..10_000_000i64), 1..60)
        ) {
            let policy = CostingPolicy { allow_negative_stock: true, ..CostingPolicy::default() };
            let mut balance = Balance::empty(key(), Utc::now());

            for (raw_qty, raw_cost) in moves {
                if raw_qty == 0 {
                    continue;
                }
                balance = balance
                    .apply(Decimal::new(raw_qty, 2), Decimal::new(raw_cost, 2), &policy, Utc::now())
                    .unwrap()
                    .balance;
                prop_assert!(balance.avg_cost >= Decimal::ZERO, "{balance:?}");
            }
        }

        /// Property: a single inbound blend matches (q0*c0 + q*c) / (q0+q)
        /// rounded to the cost scale.
        #[test]
        fn inbound_blend_matches_formula(
            q0 in 1i64..100_000i64, c0 in 0i64..10_000_000i64,
            q in 1i64..100_000i64, c in 0i64..10_000_000i64,
        ) {
            let policy = CostingPolicy::default();
            let (q0, c0, q, c) = (Decimal::new(q0, 2), Decimal::new(c0, 2), Decimal::new(q, 2), Decimal::new(c, 2));
            let start = Balance { key: key(), qty: q0, avg_cost: c0, updated_at: Utc::now(), version: 1 };

            let applied = start.apply(q, c, &policy, Utc::now()).unwrap();
            let expected = policy.round_cost((q0 * c0 + q * c) / (q0 + q));
            prop_assert_eq!(applied.balance.avg_cost, expected);
        }
    }
}
