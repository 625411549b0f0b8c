mod constraint;
mod hash;
mod ordered;
mod vector;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ordered_float::OrderedFloat;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

pub use self::constraint::{Constraint, ConstraintOp, Operand};
use self::hash::EqualityIndexer;
use self::ordered::OrderedIndexer;
use self::vector::VectorIndexer;
use crate::document::Document;
use crate::error::UserError;
use crate::schema::{split_column_path, FieldKind};
use crate::{bitmap, DocumentId, Result};

/// The closed set of indexer families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexKind {
    /// Hash map from value to bitmap; equality predicates only.
    Equality,
    /// Ordered map from value to bitmap; equality and range predicates.
    Ordered,
    /// Positional id→value array; projection fast path only.
    Vector,
}

/// A user index declaration, as stored in the schema registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub kind: IndexKind,
    /// Dotted column path, e.g. `user.id`.
    pub column: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_ascending() -> bool {
    true
}

impl IndexInfo {
    pub fn new(name: impl Into<String>, kind: IndexKind, column: impl Into<String>) -> IndexInfo {
        IndexInfo { name: name.into(), kind, column: column.into(), ascending: true }
    }
}

/// Static metadata of a live indexer; what the manager matches columns and
/// operators against.
#[derive(Debug, Clone)]
pub struct IndexStat {
    pub name: String,
    pub kind: IndexKind,
    pub column: String,
    pub field_kind: FieldKind,
    pub ascending: bool,
}

impl IndexStat {
    fn new(info: &IndexInfo, field_kind: FieldKind) -> IndexStat {
        IndexStat {
            name: info.name.clone(),
            kind: info.kind,
            column: info.column.clone(),
            field_kind,
            ascending: info.ascending,
        }
    }
}

/// Contract of every concrete indexer variant.
///
/// The two-phase ingestion guarantee: when `validate_for_insert` succeeds on
/// a document, `insert` on the same document must succeed too.
pub(crate) trait Indexer: Send + Sync {
    fn stats(&self) -> &IndexStat;
    fn supports(&self, op: ConstraintOp) -> bool;
    fn validate_for_insert(&self, doc: &Document<'_>) -> Result<()>;
    fn insert(&self, id: DocumentId, doc: &Document<'_>) -> Result<()>;
    fn filter(&self, constraint: &Constraint) -> Result<RoaringTreemap>;

    fn filter_range(&self, lower: &Constraint, _upper: &Constraint) -> Result<RoaringTreemap> {
        Err(UserError::UnsupportedOperator {
            index: self.stats().name.clone(),
            op: lower.op,
        }
        .into())
    }

    fn try_get_integer(&self, _id: DocumentId) -> Option<i64> {
        None
    }
    fn try_get_double(&self, _id: DocumentId) -> Option<f64> {
        None
    }
    fn try_get_string(&self, _id: DocumentId) -> Option<String> {
        None
    }
    fn try_get_integer_vector(&self, _ids: &[DocumentId]) -> Option<Vec<i64>> {
        None
    }
    fn try_get_double_vector(&self, _ids: &[DocumentId]) -> Option<Vec<f64>> {
        None
    }
}

/// Builds the concrete indexer variant for `(index kind, field kind)`.
fn create_indexer(info: &IndexInfo, field_kind: FieldKind) -> Result<Box<dyn Indexer>> {
    if info.name.is_empty() {
        return Err(UserError::InvalidArgument("index name is empty".into()).into());
    }
    if info.column.is_empty() {
        return Err(UserError::InvalidArgument(format!(
            "index `{}` has an empty column name",
            info.name
        ))
        .into());
    }

    let stat = IndexStat::new(info, field_kind);
    let tokens = split_column_path(&info.column);
    let invalid_kind = || {
        UserError::InvalidArgument(format!(
            "field kind {field_kind:?} is not valid for a {:?} index (`{}`)",
            info.kind, info.name
        ))
        .into()
    };

    let indexer: Box<dyn Indexer> = match info.kind {
        IndexKind::Equality => match field_kind {
            k if k.is_integer() => Box::new(EqualityIndexer::<i64>::new(stat, tokens)),
            FieldKind::String => Box::new(EqualityIndexer::<String>::new(stat, tokens)),
            FieldKind::Blob => Box::new(EqualityIndexer::<Vec<u8>>::new(stat, tokens)),
            _ => return Err(invalid_kind()),
        },
        IndexKind::Ordered => match field_kind {
            k if k.is_integer() => Box::new(OrderedIndexer::<i64>::new(stat, tokens)),
            k if k.is_float() => Box::new(OrderedIndexer::<OrderedFloat<f64>>::new(stat, tokens)),
            FieldKind::String => Box::new(OrderedIndexer::<String>::new(stat, tokens)),
            _ => return Err(invalid_kind()),
        },
        IndexKind::Vector => match field_kind {
            k if k.is_integer() => Box::new(VectorIndexer::<i64>::new(stat, tokens)),
            k if k.is_float() => Box::new(VectorIndexer::<f64>::new(stat, tokens)),
            FieldKind::String => Box::new(VectorIndexer::<String>::new(stat, tokens)),
            _ => return Err(invalid_kind()),
        },
    };
    Ok(indexer)
}

/// The single per-collection identifier counter. Allocation happens here;
/// publication of the committed bound is the collection's job.
#[derive(Debug, Default)]
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub(crate) fn new() -> IdGenerator {
        IdGenerator::default()
    }

    /// Reserves a contiguous block of `count` identifiers and returns the
    /// first one.
    pub(crate) fn reserve(&self, count: u64) -> DocumentId {
        self.next.fetch_add(count, Ordering::SeqCst)
    }

    pub(crate) fn current(&self) -> DocumentId {
        self.next.load(Ordering::SeqCst)
    }
}

/// Owns every indexer of a collection; routes ingestion and predicates.
pub(crate) struct IndexManager {
    /// Indexers per column path, in registration order. Registration order
    /// is also the best-index preference order, which keeps plan selection
    /// deterministic.
    columns: HashMap<String, Vec<Box<dyn Indexer>>>,
}

impl IndexManager {
    pub(crate) fn new() -> IndexManager {
        IndexManager { columns: HashMap::new() }
    }

    pub(crate) fn register(&mut self, info: &IndexInfo, field_kind: FieldKind) -> Result<()> {
        let duplicate =
            self.columns.values().flatten().any(|indexer| indexer.stats().name == info.name);
        if duplicate {
            return Err(UserError::InvalidArgument(format!(
                "an index named `{}` is already registered",
                info.name
            ))
            .into());
        }
        let indexer = create_indexer(info, field_kind)?;
        self.columns.entry(info.column.clone()).or_default().push(indexer);
        Ok(())
    }

    fn all(&self) -> impl Iterator<Item = &dyn Indexer> {
        self.columns.values().flatten().map(|indexer| &**indexer)
    }

    /// Pre-commit check: when this returns `Ok`, indexing the same batch
    /// must succeed.
    pub(crate) fn validate_for_indexing(&self, docs: &[Document<'_>]) -> Result<()> {
        for doc in docs {
            for indexer in self.all() {
                indexer.validate_for_insert(doc)?;
            }
        }
        Ok(())
    }

    /// Allocates a contiguous identifier block and inserts every document
    /// into every indexer, in input order. Returns the first allocated id.
    pub(crate) fn index_documents(
        &self,
        id_generator: &IdGenerator,
        docs: &[Document<'_>],
    ) -> Result<DocumentId> {
        let start = id_generator.reserve(docs.len() as u64);
        for (offset, doc) in docs.iter().enumerate() {
            let id = start + offset as u64;
            for indexer in self.all() {
                indexer.insert(id, doc)?;
            }
        }
        Ok(start)
    }

    /// First registered indexer on `column` that supports `op`.
    pub(crate) fn try_get_best_index(&self, column: &str, op: ConstraintOp) -> Option<IndexStat> {
        self.columns
            .get(column)?
            .iter()
            .find(|indexer| indexer.supports(op))
            .map(|indexer| indexer.stats().clone())
    }

    fn indexer_for(&self, constraint: &Constraint) -> Result<&dyn Indexer> {
        self.columns
            .get(&constraint.column)
            .and_then(|indexers| indexers.iter().find(|ix| ix.supports(constraint.op)))
            .map(|indexer| &**indexer)
            .ok_or_else(|| {
                UserError::UnsupportedOperator {
                    index: constraint.column.clone(),
                    op: constraint.op,
                }
                .into()
            })
    }

    /// Evaluates every constraint and ANDs the resulting bitmaps.
    ///
    /// Adjacent opposite-direction bounds on the same ordered column are
    /// folded into a single `filter_range` scan.
    pub(crate) fn filter(&self, constraints: &[Constraint]) -> Result<RoaringTreemap> {
        let mut bitmaps = Vec::with_capacity(constraints.len());

        let mut i = 0;
        while i < constraints.len() {
            let constraint = &constraints[i];
            let indexer = self.indexer_for(constraint)?;

            if let Some(next) = constraints.get(i + 1) {
                if next.column == constraint.column
                    && indexer.stats().kind == IndexKind::Ordered
                    && indexer.supports(next.op)
                    && opposite_bounds(constraint.op, next.op)
                {
                    let (lower, upper) = if constraint.op.is_lower_bound() {
                        (constraint, next)
                    } else {
                        (next, constraint)
                    };
                    bitmaps.push(indexer.filter_range(lower, upper)?);
                    i += 2;
                    continue;
                }
            }

            bitmaps.push(indexer.filter(constraint)?);
            i += 1;
        }

        if bitmaps.iter().any(RoaringTreemap::is_empty) {
            return Ok(RoaringTreemap::new());
        }
        Ok(bitmap::intersect_all(bitmaps))
    }

    pub(crate) fn try_get_integer_value(&self, id: DocumentId, column: &str) -> Option<i64> {
        self.columns.get(column)?.iter().find_map(|ix| ix.try_get_integer(id))
    }

    pub(crate) fn try_get_double_value(&self, id: DocumentId, column: &str) -> Option<f64> {
        self.columns.get(column)?.iter().find_map(|ix| ix.try_get_double(id))
    }

    pub(crate) fn try_get_string_value(&self, id: DocumentId, column: &str) -> Option<String> {
        self.columns.get(column)?.iter().find_map(|ix| ix.try_get_string(id))
    }

    pub(crate) fn try_get_integer_vector(
        &self,
        ids: &[DocumentId],
        column: &str,
    ) -> Option<Vec<i64>> {
        self.columns.get(column)?.iter().find_map(|ix| ix.try_get_integer_vector(ids))
    }

    pub(crate) fn try_get_double_vector(
        &self,
        ids: &[DocumentId],
        column: &str,
    ) -> Option<Vec<f64>> {
        self.columns.get(column)?.iter().find_map(|ix| ix.try_get_double_vector(ids))
    }
}

fn opposite_bounds(a: ConstraintOp, b: ConstraintOp) -> bool {
    (a.is_lower_bound() && b.is_upper_bound()) || (a.is_upper_bound() && b.is_lower_bound())
}

#[cfg(test)]
mod test {
    use big_s::S;

    use super::*;
    use crate::document::DocumentBuilder;
    use crate::schema::{Field, Schema};

    fn listing_schema() -> Schema {
        Schema::new(vec![
            Field::required("sku", FieldKind::Int64),
            Field::required("price", FieldKind::Double),
            Field::required("label", FieldKind::String),
        ])
        .unwrap()
    }

    fn manager() -> IndexManager {
        let mut manager = IndexManager::new();
        manager
            .register(&IndexInfo::new("sku_eq", IndexKind::Equality, "sku"), FieldKind::Int64)
            .unwrap();
        manager
            .register(&IndexInfo::new("sku_ord", IndexKind::Ordered, "sku"), FieldKind::Int64)
            .unwrap();
        manager
            .register(&IndexInfo::new("price_ord", IndexKind::Ordered, "price"), FieldKind::Double)
            .unwrap();
        manager
            .register(&IndexInfo::new("label_eq", IndexKind::Equality, "label"), FieldKind::String)
            .unwrap();
        manager
    }

    fn listing(schema: &Schema, sku: i64, price: f64, label: &str) -> Vec<u8> {
        let mut builder = DocumentBuilder::new(schema);
        builder
            .set_int64("sku", sku)
            .unwrap()
            .set_f64("price", price)
            .unwrap()
            .set_string("label", label)
            .unwrap();
        builder.build().unwrap()
    }

    fn populated() -> (IndexManager, IdGenerator) {
        let schema = listing_schema();
        let manager = manager();
        let generator = IdGenerator::new();
        let rows: Vec<Vec<u8>> = [
            (10, 1.0, "a"),
            (20, 2.5, "b"),
            (30, 3.5, "a"),
            (40, 5.0, "c"),
        ]
        .iter()
        .map(|(sku, price, label)| listing(&schema, *sku, *price, label))
        .collect();
        let docs: Vec<Document> =
            rows.iter().map(|bytes| Document::from_bytes(&schema, bytes).unwrap()).collect();
        manager.validate_for_indexing(&docs).unwrap();
        let start = manager.index_documents(&generator, &docs).unwrap();
        assert_eq!(start, 0);
        assert_eq!(generator.current(), 4);
        // rows must outlive docs only within this function; indexers own
        // their keys by now.
        (manager, generator)
    }

    #[test]
    fn best_index_follows_registration_order() {
        let (manager, _) = populated();

        let best = manager.try_get_best_index("sku", ConstraintOp::Equal).unwrap();
        assert_eq!(best.name, "sku_eq");
        let best = manager.try_get_best_index("sku", ConstraintOp::GreaterThan).unwrap();
        assert_eq!(best.name, "sku_ord");
        assert!(manager.try_get_best_index("label", ConstraintOp::LessThan).is_none());
        assert!(manager.try_get_best_index("missing", ConstraintOp::Equal).is_none());
    }

    #[test]
    fn filter_ands_across_columns() {
        let (manager, _) = populated();
        let constraints = vec![
            Constraint::new("label", ConstraintOp::Equal, Operand::String(S("a"))),
            Constraint::new("price", ConstraintOp::GreaterThan, Operand::Double(2.0)),
        ];
        let ids: Vec<u64> = manager.filter(&constraints).unwrap().iter().collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn range_fold_equals_intersection() {
        let (manager, _) = populated();
        let lower = Constraint::new("price", ConstraintOp::GreaterThan, Operand::Double(1.5));
        let upper = Constraint::new("price", ConstraintOp::LessThanOrEqual, Operand::Double(3.5));

        let folded = manager.filter(&[lower.clone(), upper.clone()]).unwrap();
        let separate = manager.filter(&[lower]).unwrap() & manager.filter(&[upper]).unwrap();
        assert_eq!(folded, separate);
        assert_eq!(folded.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn upper_then_lower_still_folds() {
        let (manager, _) = populated();
        let constraints = vec![
            Constraint::new("sku", ConstraintOp::LessThan, Operand::Integer(40)),
            Constraint::new("sku", ConstraintOp::GreaterThanOrEqual, Operand::Integer(20)),
        ];
        let ids: Vec<u64> = manager.filter(&constraints).unwrap().iter().collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn empty_constraint_short_circuits() {
        let (manager, _) = populated();
        let constraints = vec![
            Constraint::new("label", ConstraintOp::Equal, Operand::String(S("nope"))),
            Constraint::new("price", ConstraintOp::GreaterThan, Operand::Double(0.0)),
        ];
        assert!(manager.filter(&constraints).unwrap().is_empty());
    }

    #[test]
    fn unindexed_predicates_are_rejected() {
        let (manager, _) = populated();
        let constraint =
            Constraint::new("label", ConstraintOp::GreaterThan, Operand::String(S("a")));
        assert!(matches!(
            manager.filter(&[constraint]).unwrap_err(),
            crate::Error::UserError(UserError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn duplicate_index_names_are_rejected() {
        let mut manager = manager();
        let err = manager
            .register(&IndexInfo::new("sku_eq", IndexKind::Equality, "sku"), FieldKind::Int64)
            .unwrap_err();
        assert!(matches!(err, crate::Error::UserError(UserError::InvalidArgument(_))));
    }
}
