use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use ordered_float::OrderedFloat;
use roaring::RoaringTreemap;

use super::{Constraint, ConstraintOp, Indexer, IndexStat, Operand};
use crate::document::Document;
use crate::error::UserError;
use crate::{DocumentId, Result};

/// A key type usable in an ordered value→bitmap map.
///
/// Besides ordering, a key knows how to read itself out of a document and
/// how to turn a pushed-down operand into a lookup key or a range bound,
/// applying the numeric coercion rules of the index. `Ok(None)` from the
/// operand conversions means the predicate cannot match any stored key.
pub(crate) trait OrderedKey: Ord + Clone + Send + Sync + 'static {
    fn read(doc: &Document<'_>, tokens: &[String], index: &str) -> Result<Self>;
    fn eq_key(operand: &Operand, index: &str) -> Result<Option<Self>>;
    fn lower_bound(operand: &Operand, inclusive: bool, index: &str) -> Result<Option<Bound<Self>>>;
    fn upper_bound(operand: &Operand, inclusive: bool, index: &str) -> Result<Option<Bound<Self>>>;
}

fn unsupported_operand(index: &str, operand: &Operand) -> crate::Error {
    UserError::UnsupportedOperand { index: index.to_string(), operand: operand.kind_str() }.into()
}

impl OrderedKey for i64 {
    fn read(doc: &Document<'_>, tokens: &[String], _index: &str) -> Result<i64> {
        doc.int64_by_path(tokens)
    }

    fn eq_key(operand: &Operand, index: &str) -> Result<Option<i64>> {
        match operand {
            Operand::Integer(value) => Ok(Some(*value)),
            // A double operand matches integer keys only when it is itself
            // an exactly representable integer.
            Operand::Double(value) => {
                let in_range = *value >= i64::MIN as f64 && *value < i64::MAX as f64;
                if value.fract() == 0.0 && in_range {
                    Ok(Some(*value as i64))
                } else {
                    Ok(None)
                }
            }
            operand => Err(unsupported_operand(index, operand)),
        }
    }

    fn lower_bound(operand: &Operand, inclusive: bool, index: &str) -> Result<Option<Bound<i64>>> {
        match operand {
            Operand::Integer(value) => {
                Ok(Some(if inclusive { Bound::Included(*value) } else { Bound::Excluded(*value) }))
            }
            Operand::Double(value) => Ok(integer_lower_bound(*value, inclusive)),
            operand => Err(unsupported_operand(index, operand)),
        }
    }

    fn upper_bound(operand: &Operand, inclusive: bool, index: &str) -> Result<Option<Bound<i64>>> {
        match operand {
            Operand::Integer(value) => {
                Ok(Some(if inclusive { Bound::Included(*value) } else { Bound::Excluded(*value) }))
            }
            Operand::Double(value) => Ok(integer_upper_bound(*value, inclusive)),
            operand => Err(unsupported_operand(index, operand)),
        }
    }
}

/// `keys > d` / `keys >= d` over integer keys, for a double operand.
/// `None` means no key can satisfy the predicate.
fn integer_lower_bound(value: f64, inclusive: bool) -> Option<Bound<i64>> {
    if value.is_nan() || value == f64::INFINITY {
        return None;
    }
    if value == f64::NEG_INFINITY {
        return Some(Bound::Unbounded);
    }
    let floor = value.floor();
    if floor >= i64::MAX as f64 {
        return None;
    }
    if floor < i64::MIN as f64 {
        return Some(Bound::Unbounded);
    }
    let key = floor as i64;
    if value.fract() == 0.0 {
        Some(if inclusive { Bound::Included(key) } else { Bound::Excluded(key) })
    } else {
        // keys > 2.5 and keys >= 2.5 both mean keys >= 3.
        Some(Bound::Excluded(key))
    }
}

/// `keys < d` / `keys <= d` over integer keys, for a double operand.
fn integer_upper_bound(value: f64, inclusive: bool) -> Option<Bound<i64>> {
    if value.is_nan() || value == f64::NEG_INFINITY {
        return None;
    }
    if value == f64::INFINITY {
        return Some(Bound::Unbounded);
    }
    let floor = value.floor();
    if floor >= i64::MAX as f64 {
        return Some(Bound::Unbounded);
    }
    if floor < i64::MIN as f64 {
        return None;
    }
    let key = floor as i64;
    if value.fract() == 0.0 {
        Some(if inclusive { Bound::Included(key) } else { Bound::Excluded(key) })
    } else {
        // keys < 2.5 and keys <= 2.5 both mean keys <= 2.
        Some(Bound::Included(key))
    }
}

impl OrderedKey for OrderedFloat<f64> {
    fn read(doc: &Document<'_>, tokens: &[String], index: &str) -> Result<OrderedFloat<f64>> {
        let value = doc.f64_by_path(tokens)?;
        if value.is_nan() {
            return Err(UserError::InvalidArgument(format!(
                "index `{index}` cannot index NaN values"
            ))
            .into());
        }
        Ok(OrderedFloat(value))
    }

    fn eq_key(operand: &Operand, index: &str) -> Result<Option<OrderedFloat<f64>>> {
        match operand {
            Operand::Integer(value) => Ok(Some(OrderedFloat(*value as f64))),
            // NaN is never equal to anything.
            Operand::Double(value) if value.is_nan() => Ok(None),
            Operand::Double(value) => Ok(Some(OrderedFloat(*value))),
            operand => Err(unsupported_operand(index, operand)),
        }
    }

    fn lower_bound(
        operand: &Operand,
        inclusive: bool,
        index: &str,
    ) -> Result<Option<Bound<OrderedFloat<f64>>>> {
        double_bound(operand, inclusive, index)
    }

    fn upper_bound(
        operand: &Operand,
        inclusive: bool,
        index: &str,
    ) -> Result<Option<Bound<OrderedFloat<f64>>>> {
        double_bound(operand, inclusive, index)
    }
}

fn double_bound(
    operand: &Operand,
    inclusive: bool,
    index: &str,
) -> Result<Option<Bound<OrderedFloat<f64>>>> {
    let value = match operand {
        Operand::Integer(value) => *value as f64,
        Operand::Double(value) => *value,
        operand => return Err(unsupported_operand(index, operand)),
    };
    // NaN never bounds a range.
    if value.is_nan() {
        return Ok(None);
    }
    let key = OrderedFloat(value);
    Ok(Some(if inclusive { Bound::Included(key) } else { Bound::Excluded(key) }))
}

impl OrderedKey for String {
    fn read(doc: &Document<'_>, tokens: &[String], _index: &str) -> Result<String> {
        doc.string_by_path(tokens).map(str::to_string)
    }

    fn eq_key(operand: &Operand, index: &str) -> Result<Option<String>> {
        match operand {
            Operand::String(value) => Ok(Some(value.clone())),
            operand => Err(unsupported_operand(index, operand)),
        }
    }

    fn lower_bound(operand: &Operand, inclusive: bool, index: &str) -> Result<Option<Bound<String>>> {
        string_bound(operand, inclusive, index)
    }

    fn upper_bound(operand: &Operand, inclusive: bool, index: &str) -> Result<Option<Bound<String>>> {
        string_bound(operand, inclusive, index)
    }
}

fn string_bound(
    operand: &Operand,
    inclusive: bool,
    index: &str,
) -> Result<Option<Bound<String>>> {
    match operand {
        Operand::String(value) => Ok(Some(if inclusive {
            Bound::Included(value.clone())
        } else {
            Bound::Excluded(value.clone())
        })),
        operand => Err(unsupported_operand(index, operand)),
    }
}

/// Range-capable bitmap indexer: an ordered map from field value to the
/// bitmap of documents holding that value. Ascending key order is what makes
/// range predicates a bounded map scan.
pub(crate) struct OrderedIndexer<K: OrderedKey> {
    stat: IndexStat,
    tokens: Vec<String>,
    map: RwLock<BTreeMap<K, RoaringTreemap>>,
}

impl<K: OrderedKey> OrderedIndexer<K> {
    pub(crate) fn new(stat: IndexStat, tokens: Vec<String>) -> OrderedIndexer<K> {
        OrderedIndexer { stat, tokens, map: RwLock::new(BTreeMap::new()) }
    }

    fn scan(&self, lower: Bound<K>, upper: Bound<K>) -> RoaringTreemap {
        if range_is_empty(&lower, &upper) {
            return RoaringTreemap::new();
        }
        let map = self.map.read().unwrap();
        let mut union = RoaringTreemap::new();
        for (_, bitmap) in map.range((lower, upper)) {
            union |= bitmap;
        }
        union
    }
}

/// `BTreeMap::range` panics on inverted bounds; an inverted range simply
/// matches nothing.
fn range_is_empty<K: Ord>(lower: &Bound<K>, upper: &Bound<K>) -> bool {
    match (lower, upper) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

impl<K: OrderedKey> Indexer for OrderedIndexer<K> {
    fn stats(&self) -> &IndexStat {
        &self.stat
    }

    fn supports(&self, op: ConstraintOp) -> bool {
        matches!(
            op,
            ConstraintOp::Equal
                | ConstraintOp::LessThan
                | ConstraintOp::LessThanOrEqual
                | ConstraintOp::GreaterThan
                | ConstraintOp::GreaterThanOrEqual
        )
    }

    fn validate_for_insert(&self, doc: &Document<'_>) -> Result<()> {
        K::read(doc, &self.tokens, &self.stat.name).map(drop)
    }

    fn insert(&self, id: DocumentId, doc: &Document<'_>) -> Result<()> {
        let key = K::read(doc, &self.tokens, &self.stat.name)?;
        self.map.write().unwrap().entry(key).or_default().insert(id);
        Ok(())
    }

    fn filter(&self, constraint: &Constraint) -> Result<RoaringTreemap> {
        let index = &self.stat.name;
        match constraint.op {
            ConstraintOp::Equal => match K::eq_key(&constraint.operand, index)? {
                Some(key) => {
                    Ok(self.map.read().unwrap().get(&key).cloned().unwrap_or_default())
                }
                None => Ok(RoaringTreemap::new()),
            },
            ConstraintOp::LessThan | ConstraintOp::LessThanOrEqual => {
                let inclusive = constraint.op == ConstraintOp::LessThanOrEqual;
                match K::upper_bound(&constraint.operand, inclusive, index)? {
                    Some(upper) => Ok(self.scan(Bound::Unbounded, upper)),
                    None => Ok(RoaringTreemap::new()),
                }
            }
            ConstraintOp::GreaterThan | ConstraintOp::GreaterThanOrEqual => {
                let inclusive = constraint.op == ConstraintOp::GreaterThanOrEqual;
                match K::lower_bound(&constraint.operand, inclusive, index)? {
                    Some(lower) => Ok(self.scan(lower, Bound::Unbounded)),
                    None => Ok(RoaringTreemap::new()),
                }
            }
            ConstraintOp::Match => Err(UserError::UnsupportedOperator {
                index: index.clone(),
                op: constraint.op,
            }
            .into()),
        }
    }

    /// One bounded scan for `lower.op` ∧ `upper.op` on this column.
    fn filter_range(&self, lower: &Constraint, upper: &Constraint) -> Result<RoaringTreemap> {
        debug_assert!(lower.op.is_lower_bound() && upper.op.is_upper_bound());
        let index = &self.stat.name;
        let lower_inclusive = lower.op == ConstraintOp::GreaterThanOrEqual;
        let upper_inclusive = upper.op == ConstraintOp::LessThanOrEqual;
        match (
            K::lower_bound(&lower.operand, lower_inclusive, index)?,
            K::upper_bound(&upper.operand, upper_inclusive, index)?,
        ) {
            (Some(lower), Some(upper)) => Ok(self.scan(lower, upper)),
            _ => Ok(RoaringTreemap::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use big_s::S;

    use super::*;
    use crate::document::DocumentBuilder;
    use crate::index::IndexKind;
    use crate::schema::{Field, FieldKind, Schema};

    fn price_schema() -> Schema {
        Schema::new(vec![Field::required("price", FieldKind::Double)]).unwrap()
    }

    fn stat(column: &str, kind: FieldKind) -> IndexStat {
        IndexStat {
            name: format!("{column}_ord"),
            kind: IndexKind::Ordered,
            column: column.to_string(),
            field_kind: kind,
            ascending: true,
        }
    }

    fn price_doc(schema: &Schema, price: f64) -> Vec<u8> {
        let mut builder = DocumentBuilder::new(schema);
        builder.set_f64("price", price).unwrap();
        builder.build().unwrap()
    }

    fn double_indexer(prices: &[f64]) -> OrderedIndexer<OrderedFloat<f64>> {
        let schema = price_schema();
        let indexer = OrderedIndexer::new(stat("price", FieldKind::Double), vec![S("price")]);
        for (id, price) in prices.iter().enumerate() {
            let bytes = price_doc(&schema, *price);
            let doc = Document::from_bytes(&schema, &bytes).unwrap();
            indexer.insert(id as u64, &doc).unwrap();
        }
        indexer
    }

    fn ids(bitmap: RoaringTreemap) -> Vec<u64> {
        bitmap.iter().collect()
    }

    #[test]
    fn equality_and_bounds_on_doubles() {
        let indexer = double_indexer(&[1.0, 2.5, 3.5, 5.0]);
        let eq = |v: f64| {
            Constraint::new("price", ConstraintOp::Equal, Operand::Double(v))
        };

        assert_eq!(ids(indexer.filter(&eq(2.5)).unwrap()), vec![1]);
        assert!(indexer.filter(&eq(2.6)).unwrap().is_empty());

        let lt = Constraint::new("price", ConstraintOp::LessThan, Operand::Double(3.5));
        assert_eq!(ids(indexer.filter(&lt).unwrap()), vec![0, 1]);
        let le = Constraint::new("price", ConstraintOp::LessThanOrEqual, Operand::Double(3.5));
        assert_eq!(ids(indexer.filter(&le).unwrap()), vec![0, 1, 2]);
        let gt = Constraint::new("price", ConstraintOp::GreaterThan, Operand::Integer(1));
        assert_eq!(ids(indexer.filter(&gt).unwrap()), vec![1, 2, 3]);
        let ge = Constraint::new("price", ConstraintOp::GreaterThanOrEqual, Operand::Double(1.0));
        assert_eq!(ids(indexer.filter(&ge).unwrap()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn range_scan_is_one_bounded_walk() {
        let indexer = double_indexer(&[1.0, 2.5, 3.5, 5.0]);
        let lower = Constraint::new("price", ConstraintOp::GreaterThan, Operand::Double(1.5));
        let upper = Constraint::new("price", ConstraintOp::LessThanOrEqual, Operand::Double(3.5));
        assert_eq!(ids(indexer.filter_range(&lower, &upper).unwrap()), vec![1, 2]);

        // Inverted bounds match nothing instead of panicking.
        let lower = Constraint::new("price", ConstraintOp::GreaterThan, Operand::Double(9.0));
        let upper = Constraint::new("price", ConstraintOp::LessThan, Operand::Double(2.0));
        assert!(indexer.filter_range(&lower, &upper).unwrap().is_empty());
    }

    #[test]
    fn nan_is_rejected_and_never_bounds() {
        let schema = price_schema();
        let indexer = double_indexer(&[1.0]);

        let bytes = price_doc(&schema, f64::NAN);
        let doc = Document::from_bytes(&schema, &bytes).unwrap();
        assert!(matches!(
            indexer.validate_for_insert(&doc).unwrap_err(),
            crate::Error::UserError(UserError::InvalidArgument(_))
        ));

        let eq = Constraint::new("price", ConstraintOp::Equal, Operand::Double(f64::NAN));
        assert!(indexer.filter(&eq).unwrap().is_empty());
        let gt = Constraint::new("price", ConstraintOp::GreaterThan, Operand::Double(f64::NAN));
        assert!(indexer.filter(&gt).unwrap().is_empty());
    }

    #[test]
    fn string_operand_is_rejected_on_numeric_keys() {
        let indexer = double_indexer(&[1.0]);
        let eq = Constraint::new("price", ConstraintOp::Equal, Operand::String(S("1.0")));
        assert!(matches!(
            indexer.filter(&eq).unwrap_err(),
            crate::Error::UserError(UserError::UnsupportedOperand { .. })
        ));
    }

    #[test]
    fn double_operands_on_integer_keys() {
        let schema = Schema::new(vec![Field::required("count", FieldKind::Int64)]).unwrap();
        let indexer: OrderedIndexer<i64> =
            OrderedIndexer::new(stat("count", FieldKind::Int64), vec![S("count")]);
        for (id, count) in [1i64, 2, 3, 4].iter().enumerate() {
            let mut builder = DocumentBuilder::new(&schema);
            builder.set_int64("count", *count).unwrap();
            let bytes = builder.build().unwrap();
            let doc = Document::from_bytes(&schema, &bytes).unwrap();
            indexer.insert(id as u64, &doc).unwrap();
        }

        // 2.0 is integral: matches the key 2 exactly.
        let eq = Constraint::new("count", ConstraintOp::Equal, Operand::Double(2.0));
        assert_eq!(ids(indexer.filter(&eq).unwrap()), vec![1]);
        // 2.5 is not: equality matches nothing.
        let eq = Constraint::new("count", ConstraintOp::Equal, Operand::Double(2.5));
        assert!(indexer.filter(&eq).unwrap().is_empty());

        // count > 2.5 means count >= 3; count >= 2.5 means the same.
        let gt = Constraint::new("count", ConstraintOp::GreaterThan, Operand::Double(2.5));
        assert_eq!(ids(indexer.filter(&gt).unwrap()), vec![2, 3]);
        let ge = Constraint::new("count", ConstraintOp::GreaterThanOrEqual, Operand::Double(2.5));
        assert_eq!(ids(indexer.filter(&ge).unwrap()), vec![2, 3]);
        // count < 2.5 and count <= 2.5 both mean count <= 2.
        let lt = Constraint::new("count", ConstraintOp::LessThan, Operand::Double(2.5));
        assert_eq!(ids(indexer.filter(&lt).unwrap()), vec![0, 1]);
        let le = Constraint::new("count", ConstraintOp::LessThanOrEqual, Operand::Double(2.5));
        assert_eq!(ids(indexer.filter(&le).unwrap()), vec![0, 1]);
    }

    #[test]
    fn every_document_lands_under_exactly_one_key() {
        let indexer = double_indexer(&[2.0, 1.0, 2.0, 3.0, 1.0]);
        let map = indexer.map.read().unwrap();

        let mut total = RoaringTreemap::new();
        for bitmap in map.values() {
            // Pairwise disjoint: the union grows by exactly |bitmap|.
            let before = total.len();
            total |= bitmap;
            assert_eq!(total.len(), before + bitmap.len());
        }
        assert_eq!(ids(total), vec![0, 1, 2, 3, 4]);
    }
}
