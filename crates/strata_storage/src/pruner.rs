//! Scan-key pruning against row-group zone maps.
//!
//! A scan key is `column <op> literal` with the column on the left. The
//! zone-map test is conservative: it answers "may match" whenever it cannot
//! prove otherwise, so a group holding a satisfying row is never skipped.

use std::cmp::Ordering;

use strata_common::datum::Datum;

use crate::column_vector::ZoneMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl Strategy {
    /// The operator that gives the same result with operands swapped.
    pub fn commute(self) -> Self {
        match self {
            Strategy::Lt => Strategy::Gt,
            Strategy::Le => Strategy::Ge,
            Strategy::Eq => Strategy::Eq,
            Strategy::Ge => Strategy::Le,
            Strategy::Gt => Strategy::Lt,
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Strategy::Lt => ord == Ordering::Less,
            Strategy::Le => ord != Ordering::Greater,
            Strategy::Eq => ord == Ordering::Equal,
            Strategy::Ge => ord != Ordering::Less,
            Strategy::Gt => ord == Ordering::Greater,
        }
    }
}

/// One side of a comparison handed in by the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(usize),
    Literal(Datum),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanKey {
    pub column: usize,
    pub strategy: Strategy,
    pub literal: Datum,
}

impl ScanKey {
    pub fn new(column: usize, strategy: Strategy, literal: Datum) -> Self {
        Self {
            column,
            strategy,
            literal,
        }
    }

    /// Put the column on the left, commuting the operator if needed.
    /// Anything other than column-vs-non-null-literal yields `None`.
    pub fn normalize(left: Operand, strategy: Strategy, right: Operand) -> Option<Self> {
        match (left, right) {
            (Operand::Column(c), Operand::Literal(lit)) if !lit.is_null() => {
                Some(Self::new(c, strategy, lit))
            }
            (Operand::Literal(lit), Operand::Column(c)) if !lit.is_null() => {
                Some(Self::new(c, strategy.commute(), lit))
            }
            _ => None,
        }
    }

    /// Row-level test; NULL never satisfies a comparison.
    pub fn matches(&self, value: &Datum) -> bool {
        compare(value, &self.literal).is_some_and(|ord| self.strategy.accepts(ord))
    }

    /// Whether any row in the zone could satisfy the key.
    pub fn may_match(&self, zone: &ZoneMap) -> bool {
        if zone.row_count == 0 || zone.all_null() {
            return false;
        }
        let lit = &self.literal;
        // Text bounds are stored as byte prefixes; compare the literal as bytes.
        let lower = zone.min.as_ref().map(|m| compare(m, lit));
        let upper = zone.max.as_ref().map(|m| compare(m, lit));
        let (lower, upper) = match (lower, upper) {
            (Some(None), _) | (_, Some(None)) => return true,
            (l, u) => (l.flatten(), u.flatten()),
        };
        // `None` below means the bound is unknown, which never prunes.
        match self.strategy {
            Strategy::Lt => lower.map_or(true, |o| o == Ordering::Less),
            Strategy::Le => lower.map_or(true, |o| o != Ordering::Greater),
            Strategy::Eq => {
                lower.map_or(true, |o| o != Ordering::Greater)
                    && upper.map_or(true, |o| o != Ordering::Less)
            }
            Strategy::Ge => upper.map_or(true, |o| o != Ordering::Less),
            Strategy::Gt => upper.map_or(true, |o| o == Ordering::Greater),
        }
    }
}

/// Compare a stored value with a literal; text and bytea compare bytewise
/// against each other so prefix bounds stay comparable.
fn compare(value: &Datum, literal: &Datum) -> Option<Ordering> {
    match (value.as_bytes(), literal.as_bytes()) {
        (Some(a), Some(b)) => Some(a.cmp(b)),
        (None, None) => value.sql_cmp(literal),
        _ => None,
    }
}

/// All keys must admit the zone maps of their columns for the group to be read.
pub fn row_group_may_match(
    keys: &[ScanKey],
    mut zone_for: impl FnMut(usize) -> Option<ZoneMap>,
) -> bool {
    keys.iter().all(|k| zone_for(k.column).map_or(true, |z| k.may_match(&z)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Strategy;
    use proptest::prelude::*;
    use proptest::strategy::Strategy as _;
    use strata_common::types::DataType;

    use crate::column_vector::ColumnVector;

    const STRATEGIES: [Strategy; 5] = [Strategy::Lt, Strategy::Le, Strategy::Eq, Strategy::Ge, Strategy::Gt];

    /// A group holding `values` is kept whenever one of its rows matches.
    fn keeps_every_match(data_type: DataType, values: &[Datum], key: &ScanKey, prefix_len: usize) -> bool {
        let zone = ColumnVector::from_datums(data_type, values)
            .unwrap()
            .zone_map(prefix_len);
        let any_match = values.iter().any(|v| key.matches(v));
        !any_match || key.may_match(&zone)
    }

    /// Long strings that mostly share a prefix wider than the zone-map cap.
    fn long_text() -> impl proptest::strategy::Strategy<Value = String> {
        "(shared-prefix-){0,2}[a-c~]{0,20}"
    }

    fn edge_bytes() -> impl proptest::strategy::Strategy<Value = Vec<u8>> {
        proptest::collection::vec(proptest::sample::select(vec![0u8, 0x61, 0xfe, 0xff]), 0..24)
    }

    fn small_float() -> impl proptest::strategy::Strategy<Value = f64> {
        prop_oneof![(-4i8..4).prop_map(|v| v as f64 / 2.0), Just(f64::NAN), Just(-0.0)]
    }

    fn zone(min: i64, max: i64) -> ZoneMap {
        ZoneMap {
            min: Some(Datum::Int64(min)),
            max: Some(Datum::Int64(max)),
            null_count: 0,
            row_count: 10,
        }
    }

    #[test]
    fn test_gt_prunes_disjoint_zone_only() {
        let key = ScanKey::new(0, Strategy::Gt, Datum::Int64(100));
        assert!(!key.may_match(&zone(50, 90)));
        assert!(key.may_match(&zone(50, 150)));
        assert!(!key.may_match(&zone(50, 100)));
    }

    #[test]
    fn test_each_strategy_interval_rule() {
        let z = zone(10, 20);
        let lit = |s, v| ScanKey::new(0, s, Datum::Int64(v)).may_match(&z);
        assert!(!lit(Strategy::Lt, 10) && lit(Strategy::Lt, 11));
        assert!(!lit(Strategy::Le, 9) && lit(Strategy::Le, 10));
        assert!(!lit(Strategy::Eq, 21) && lit(Strategy::Eq, 20) && !lit(Strategy::Eq, 9));
        assert!(!lit(Strategy::Ge, 21) && lit(Strategy::Ge, 20));
        assert!(!lit(Strategy::Gt, 20) && lit(Strategy::Gt, 19));
    }

    #[test]
    fn test_normalize_commutes_literal_on_left() {
        let k = ScanKey::normalize(
            Operand::Literal(Datum::Int32(5)),
            Strategy::Lt,
            Operand::Column(2),
        )
        .unwrap();
        assert_eq!(k, ScanKey::new(2, Strategy::Gt, Datum::Int32(5)));
        assert!(ScanKey::normalize(Operand::Column(0), Strategy::Eq, Operand::Column(1)).is_none());
        assert!(ScanKey::normalize(
            Operand::Column(0),
            Strategy::Eq,
            Operand::Literal(Datum::Null)
        )
        .is_none());
    }

    #[test]
    fn test_all_null_group_is_pruned() {
        let z = ZoneMap {
            min: None,
            max: None,
            null_count: 4,
            row_count: 4,
        };
        assert!(!ScanKey::new(0, Strategy::Ge, Datum::Int64(0)).may_match(&z));
    }

    #[test]
    fn test_text_prefix_bounds_are_conservative() {
        // zone over ["applesauce", "banana-split"] with 4-byte prefixes
        let z = ZoneMap {
            min: Some(Datum::Bytea(b"appl".to_vec())),
            max: Some(Datum::Bytea(b"banb".to_vec())),
            null_count: 0,
            row_count: 2,
        };
        let eq = |s: &str| ScanKey::new(0, Strategy::Eq, Datum::Text(s.into())).may_match(&z);
        assert!(eq("applesauce"));
        assert!(eq("banana-split"));
        assert!(!eq("zebra"));
        assert!(!eq("aaa"));
        // unknown upper bound never prunes from above
        let open = ZoneMap { max: None, ..z };
        assert!(ScanKey::new(0, Strategy::Gt, Datum::Text("zzz".into())).may_match(&open));
    }

    #[test]
    fn test_incomparable_literal_keeps_group() {
        let key = ScanKey::new(0, Strategy::Eq, Datum::Text("x".into()));
        assert!(key.may_match(&zone(1, 2)));
        assert!(!key.matches(&Datum::Int64(1)));
    }

    proptest! {
        #[test]
        fn prop_pruning_is_sound(
            values in proptest::collection::vec(-50i64..50, 1..40),
            lit in -60i64..60,
            s in 0usize..5,
        ) {
            let strategy = [Strategy::Lt, Strategy::Le, Strategy::Eq, Strategy::Ge, Strategy::Gt][s];
            let key = ScanKey::new(0, strategy, Datum::Int64(lit));
            let min = *values.iter().min().unwrap();
            let max = *values.iter().max().unwrap();
            let any_match = values.iter().any(|v| key.matches(&Datum::Int64(*v)));
            let kept = key.may_match(&zone(min, max));
            // sound: never drop a group with a match
            prop_assert!(!any_match || kept);
            // exact for min/max intervals: the bounds themselves are values
            let bound_match = key.matches(&Datum::Int64(min)) || key.matches(&Datum::Int64(max));
            if strategy != Strategy::Eq {
                prop_assert_eq!(kept, bound_match);
            }
        }

        #[test]
        fn prop_text_prefix_pruning_is_sound(
            values in proptest::collection::vec(proptest::option::of(long_text()), 1..30),
            lit in long_text(),
            s in 0usize..5,
            prefix_len in 1usize..24,
        ) {
            let values: Vec<Datum> = values.into_iter().map(|v| v.map_or(Datum::Null, Datum::Text)).collect();
            let key = ScanKey::new(0, STRATEGIES[s], Datum::Text(lit));
            prop_assert!(keeps_every_match(DataType::Text, &values, &key, prefix_len));
        }

        #[test]
        fn prop_bytea_prefix_pruning_is_sound(
            values in proptest::collection::vec(edge_bytes(), 1..30),
            lit in edge_bytes(),
            s in 0usize..5,
            prefix_len in 1usize..8,
        ) {
            let values: Vec<Datum> = values.into_iter().map(Datum::Bytea).collect();
            let key = ScanKey::new(0, STRATEGIES[s], Datum::Bytea(lit));
            prop_assert!(keeps_every_match(DataType::Bytea, &values, &key, prefix_len));
        }

        #[test]
        fn prop_float_pruning_is_sound(
            values in proptest::collection::vec(small_float(), 1..20),
            lit in small_float(),
            s in 0usize..5,
        ) {
            let values: Vec<Datum> = values.into_iter().map(Datum::Float64).collect();
            let key = ScanKey::new(0, STRATEGIES[s], Datum::Float64(lit));
            prop_assert!(keeps_every_match(DataType::Float64, &values, &key, 16));
        }
    }
}
