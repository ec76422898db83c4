use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Minimum distinguishable gap between two order keys. An allocation into a
/// gap at or below this width reports `Exhausted` instead of producing a key
/// that may collide with a bound after rounding.
pub const GAP_EPSILON: f64 = 1e-6;

/// Spacing assigned by renormalization and used as the fixed step for
/// open-boundary inserts (before the first rule / after the last rule).
pub const KEY_SPACING: f64 = 1024.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LedgerError {
    #[error("rule not found: {0}")]
    NotFound(RuleId),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("key gap exhausted between {lower} and {upper}")]
    Exhausted { lower: f64, upper: f64 },
    #[error("write conflict: the collection changed concurrently")]
    Conflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RuleId(pub Ulid);

impl RuleId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Identity of the virtual terminal row. It never has a persisted key and
    /// never participates in allocation or renormalization.
    #[must_use]
    pub fn sentinel() -> Self {
        Self(Ulid::nil())
    }

    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self.0.is_nil()
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RuleId {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = Ulid::from_string(value)
            .map_err(|err| LedgerError::Validation(format!("invalid rule id `{value}`: {err}")))?;
        Ok(Self(parsed))
    }
}

/// A position in the densely orderable key domain. Always finite; total order
/// via `f64::total_cmp`. The key carries no meaning beyond relative position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderKey(f64);

impl OrderKey {
    /// # Errors
    /// Returns [`LedgerError::Validation`] for NaN or infinite input.
    pub fn new(value: f64) -> Result<Self, LedgerError> {
        if value.is_finite() {
            Ok(Self(value))
        } else {
            Err(LedgerError::Validation(format!("order key MUST be finite, got {value}")))
        }
    }

    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for OrderKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrderKey {}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for OrderKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One side of a target gap. `End` stands for the sentinel's position; the
/// sentinel is never passed around as a literal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    Key(OrderKey),
    End,
}

/// Compute a key strictly inside the gap bounded by `lower` and `upper`.
///
/// Open boundaries take a fixed generous step instead of bisecting, since
/// there is no opposing bound to converge toward. A closed gap at or below
/// [`GAP_EPSILON`], or a midpoint that rounds onto a bound, reports
/// [`LedgerError::Exhausted`] rather than returning a duplicate key.
///
/// # Errors
/// [`LedgerError::InvalidOperation`] for inverted or nonsensical bounds,
/// [`LedgerError::Exhausted`] when the gap cannot hold another key.
pub fn allocate_between(lower: Anchor, upper: Anchor) -> Result<OrderKey, LedgerError> {
    match (lower, upper) {
        (Anchor::Start, Anchor::End) => OrderKey::new(KEY_SPACING),
        (Anchor::Start, Anchor::Key(upper)) => {
            let candidate = OrderKey::new(upper.value() - KEY_SPACING)?;
            if candidate >= upper {
                return Err(LedgerError::Exhausted {
                    lower: f64::NEG_INFINITY,
                    upper: upper.value(),
                });
            }
            Ok(candidate)
        }
        (Anchor::Key(lower), Anchor::End) => {
            let candidate = OrderKey::new(lower.value() + KEY_SPACING)?;
            if candidate <= lower {
                return Err(LedgerError::Exhausted { lower: lower.value(), upper: f64::INFINITY });
            }
            Ok(candidate)
        }
        (Anchor::Key(lower), Anchor::Key(upper)) => {
            if lower >= upper {
                return Err(LedgerError::InvalidOperation(format!(
                    "allocation bounds are not ordered: {lower} >= {upper}"
                )));
            }
            let low = lower.value();
            let high = upper.value();
            if high - low <= GAP_EPSILON {
                return Err(LedgerError::Exhausted { lower: low, upper: high });
            }
            let midpoint = OrderKey::new(low + (high - low) / 2.0)?;
            if midpoint <= lower || midpoint >= upper {
                return Err(LedgerError::Exhausted { lower: low, upper: high });
            }
            Ok(midpoint)
        }
        (Anchor::End, _) | (_, Anchor::Start) => Err(LedgerError::InvalidOperation(
            "list ends cannot bound the wrong side of a gap".to_string(),
        )),
    }
}

/// Plan evenly spaced replacement keys for an already-ordered sequence.
/// Pure planning; the caller applies the result as one atomic write so a
/// failure mid-way never leaves a half-renumbered collection.
#[must_use]
pub fn renormalize_plan(ordered_ids: &[RuleId]) -> Vec<(RuleId, OrderKey)> {
    ordered_ids
        .iter()
        .enumerate()
        .map(|(index, id)| {
            let position = f64::from(u32::try_from(index + 1).unwrap_or(u32::MAX));
            (*id, OrderKey(position * KEY_SPACING))
        })
        .collect()
}

/// Whether `key` already lies strictly inside the gap `(lower, upper)`.
/// Used to detect no-op moves before any key is allocated.
#[must_use]
pub fn gap_contains(lower: Anchor, upper: Anchor, key: OrderKey) -> bool {
    let above_lower = match lower {
        Anchor::Start => true,
        Anchor::Key(bound) => bound < key,
        Anchor::End => false,
    };
    let below_upper = match upper {
        Anchor::End => true,
        Anchor::Key(bound) => key < bound,
        Anchor::Start => false,
    };
    above_lower && below_upper
}

/// Smallest adjacent gap in an ascending key sequence, or `None` for fewer
/// than two keys.
#[must_use]
pub fn min_adjacent_gap(keys: &[OrderKey]) -> Option<f64> {
    keys.windows(2).map(|pair| pair[1].value() - pair[0].value()).min_by(f64::total_cmp)
}

#[must_use]
pub fn needs_renormalization(keys: &[OrderKey]) -> bool {
    min_adjacent_gap(keys).is_some_and(|gap| gap <= GAP_EPSILON)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Endpoint {
    pub name: String,
    pub email: String,
}

/// Rule payload. Opaque to the ordering mechanism; only shape constraints are
/// validated before a write.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RulePayload {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<Endpoint>,
    #[serde(default)]
    pub destinations: Vec<Endpoint>,
}

impl RulePayload {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the rule or any endpoint
    /// carries an empty name.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::Validation("rule name MUST be non-empty".to_string()));
        }

        for endpoint in self.sources.iter().chain(self.destinations.iter()) {
            if endpoint.name.trim().is_empty() {
                return Err(LedgerError::Validation(
                    "endpoint name MUST be non-empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: RuleId,
    pub key: OrderKey,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub payload: RulePayload,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(value: f64) -> OrderKey {
        match OrderKey::new(value) {
            Ok(key) => key,
            Err(err) => panic!("fixture key should be finite: {err}"),
        }
    }

    #[test]
    fn order_key_rejects_non_finite_values() {
        assert!(OrderKey::new(f64::NAN).is_err());
        assert!(OrderKey::new(f64::INFINITY).is_err());
        assert!(OrderKey::new(f64::NEG_INFINITY).is_err());
        assert!(OrderKey::new(0.0).is_ok());
    }

    #[test]
    fn order_key_total_order_is_strict() {
        assert!(key(1.0) < key(2.0));
        assert!(key(-1023.0) < key(1.0));
        assert_eq!(key(3.5), key(3.5));
    }

    #[test]
    fn sentinel_id_is_stable_and_recognizable() {
        assert!(RuleId::sentinel().is_sentinel());
        assert_eq!(RuleId::sentinel(), RuleId::sentinel());
        assert!(!RuleId::new().is_sentinel());
    }

    #[test]
    fn first_allocation_into_empty_collection_uses_spacing() {
        let allocated = match allocate_between(Anchor::Start, Anchor::End) {
            Ok(key) => key,
            Err(err) => panic!("empty-collection allocation should succeed: {err}"),
        };
        assert_eq!(allocated, key(KEY_SPACING));
    }

    #[test]
    fn head_allocation_steps_generously_below_minimum() {
        let allocated = match allocate_between(Anchor::Start, Anchor::Key(key(1.0))) {
            Ok(key) => key,
            Err(err) => panic!("head allocation should succeed: {err}"),
        };
        assert!(allocated < key(1.0));
        assert_eq!(allocated, key(1.0 - KEY_SPACING));
    }

    #[test]
    fn tail_allocation_steps_generously_above_maximum() {
        let allocated = match allocate_between(Anchor::Key(key(3000.0)), Anchor::End) {
            Ok(key) => key,
            Err(err) => panic!("tail allocation should succeed: {err}"),
        };
        assert_eq!(allocated, key(3000.0 + KEY_SPACING));
    }

    #[test]
    fn midpoint_allocation_bisects_the_gap() {
        let allocated = match allocate_between(Anchor::Key(key(1000.0)), Anchor::Key(key(2000.0))) {
            Ok(key) => key,
            Err(err) => panic!("midpoint allocation should succeed: {err}"),
        };
        assert!(key(1000.0) < allocated && allocated < key(2000.0));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let result = allocate_between(Anchor::Key(key(5.0)), Anchor::Key(key(1.0)));
        assert!(matches!(result, Err(LedgerError::InvalidOperation(_))));

        let equal = allocate_between(Anchor::Key(key(5.0)), Anchor::Key(key(5.0)));
        assert!(matches!(equal, Err(LedgerError::InvalidOperation(_))));
    }

    #[test]
    fn wrong_sided_end_anchors_are_rejected() {
        assert!(matches!(
            allocate_between(Anchor::End, Anchor::Key(key(1.0))),
            Err(LedgerError::InvalidOperation(_))
        ));
        assert!(matches!(
            allocate_between(Anchor::Key(key(1.0)), Anchor::Start),
            Err(LedgerError::InvalidOperation(_))
        ));
    }

    #[test]
    fn collapsed_gap_reports_exhausted_not_a_duplicate() {
        let result = allocate_between(
            Anchor::Key(key(1.0)),
            Anchor::Key(key(1.000_000_000_1)),
        );
        assert!(matches!(result, Err(LedgerError::Exhausted { .. })));
    }

    #[test]
    fn repeated_bisection_eventually_exhausts() {
        let upper = key(1.0);
        let mut lower = key(0.0);
        for _ in 0..200 {
            match allocate_between(Anchor::Key(lower), Anchor::Key(upper)) {
                Ok(allocated) => {
                    assert!(lower < allocated && allocated < upper);
                    lower = allocated;
                }
                Err(LedgerError::Exhausted { .. }) => return,
                Err(err) => panic!("unexpected allocation error: {err}"),
            }
        }
        panic!("bisection into a fixed gap never exhausted");
    }

    #[test]
    fn renormalize_plan_preserves_order_and_restores_generous_gaps() {
        let ids = vec![RuleId::new(), RuleId::new(), RuleId::new()];
        let plan = renormalize_plan(&ids);

        assert_eq!(plan.len(), ids.len());
        for (planned, id) in plan.iter().zip(&ids) {
            assert_eq!(planned.0, *id);
        }
        for pair in plan.windows(2) {
            let gap = pair[1].1.value() - pair[0].1.value();
            assert!(gap > GAP_EPSILON);
            assert!((gap - KEY_SPACING).abs() < f64::EPSILON);
        }

        let allocated = match allocate_between(Anchor::Key(plan[0].1), Anchor::Key(plan[1].1)) {
            Ok(key) => key,
            Err(err) => panic!("allocation after renormalization should succeed: {err}"),
        };
        assert!(plan[0].1 < allocated && allocated < plan[1].1);
    }

    #[test]
    fn renormalize_plan_of_empty_sequence_is_empty() {
        assert!(renormalize_plan(&[]).is_empty());
    }

    #[test]
    fn gap_containment_detects_no_op_positions() {
        assert!(gap_contains(Anchor::Start, Anchor::End, key(42.0)));
        assert!(gap_contains(Anchor::Key(key(1.0)), Anchor::Key(key(3.0)), key(2.0)));
        assert!(!gap_contains(Anchor::Key(key(1.0)), Anchor::Key(key(3.0)), key(3.0)));
        assert!(!gap_contains(Anchor::Key(key(1.0)), Anchor::Key(key(3.0)), key(1.0)));
        assert!(!gap_contains(Anchor::Key(key(5.0)), Anchor::End, key(4.0)));
    }

    #[test]
    fn renormalization_need_tracks_the_minimum_gap() {
        assert!(!needs_renormalization(&[]));
        assert!(!needs_renormalization(&[key(1.0)]));
        assert!(!needs_renormalization(&[key(1.0), key(2.0), key(3.0)]));
        assert!(needs_renormalization(&[key(1.0), key(1.000_000_000_1), key(3.0)]));
        assert_eq!(min_adjacent_gap(&[key(1.0), key(3.0), key(4.0)]), Some(1.0));
    }

    #[test]
    fn payload_validation_rejects_empty_names() {
        let payload = RulePayload { name: "  ".to_string(), sources: vec![], destinations: vec![] };
        assert!(matches!(payload.validate(), Err(LedgerError::Validation(_))));

        let payload = RulePayload {
            name: "block usb".to_string(),
            sources: vec![Endpoint { name: String::new(), email: "a@example.com".to_string() }],
            destinations: vec![],
        };
        assert!(matches!(payload.validate(), Err(LedgerError::Validation(_))));

        let payload = RulePayload {
            name: "block usb".to_string(),
            sources: vec![Endpoint { name: "ops".to_string(), email: "ops@example.com".to_string() }],
            destinations: vec![],
        };
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn rule_id_round_trips_through_strings() {
        let id = RuleId::new();
        let parsed = match RuleId::from_str(&id.to_string()) {
            Ok(parsed) => parsed,
            Err(err) => panic!("rule id should parse back: {err}"),
        };
        assert_eq!(parsed, id);
        assert!(RuleId::from_str("not-a-ulid").is_err());
    }

    proptest! {
        #[test]
        fn property_allocation_stays_strictly_between_bounds(
            lower in -1.0e9f64..1.0e9f64,
            width in 1.0e-3f64..1.0e6f64,
        ) {
            let lower_key = key(lower);
            let upper_key = key(lower + width);
            let allocated = match allocate_between(Anchor::Key(lower_key), Anchor::Key(upper_key)) {
                Ok(allocated) => allocated,
                Err(err) => panic!("gap of width {width} should allocate: {err}"),
            };
            prop_assert!(lower_key < allocated);
            prop_assert!(allocated < upper_key);
        }

        #[test]
        fn property_insert_sequences_keep_keys_strictly_increasing(
            slots in proptest::collection::vec(0usize..=128, 1..64),
        ) {
            let mut ids: Vec<RuleId> = Vec::new();
            let mut keys: Vec<OrderKey> = Vec::new();

            for raw in slots {
                let slot = raw % (keys.len() + 1);
                let anchors = |keys: &[OrderKey], slot: usize| {
                    let lower =
                        if slot == 0 { Anchor::Start } else { Anchor::Key(keys[slot - 1]) };
                    let upper =
                        if slot == keys.len() { Anchor::End } else { Anchor::Key(keys[slot]) };
                    (lower, upper)
                };

                let (lower, upper) = anchors(&keys, slot);
                let allocated = match allocate_between(lower, upper) {
                    Ok(allocated) => allocated,
                    Err(LedgerError::Exhausted { .. }) => {
                        for (index, planned) in renormalize_plan(&ids).iter().enumerate() {
                            keys[index] = planned.1;
                        }
                        let (lower, upper) = anchors(&keys, slot);
                        match allocate_between(lower, upper) {
                            Ok(allocated) => allocated,
                            Err(err) => {
                                panic!("allocation after renormalization should succeed: {err}")
                            }
                        }
                    }
                    Err(err) => panic!("unexpected allocation error: {err}"),
                };

                ids.insert(slot, RuleId::new());
                keys.insert(slot, allocated);
                prop_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
            }
        }

        #[test]
        fn property_renormalization_preserves_relative_order(count in 1usize..256) {
            let ids: Vec<RuleId> = (0..count).map(|_| RuleId::new()).collect();
            let plan = renormalize_plan(&ids);

            prop_assert_eq!(plan.len(), ids.len());
            for (planned, id) in plan.iter().zip(&ids) {
                prop_assert_eq!(planned.0, *id);
            }
            prop_assert!(plan
                .windows(2)
                .all(|pair| pair[1].1.value() - pair[0].1.value() > GAP_EPSILON));
        }
    }
}
