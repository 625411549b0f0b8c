use std::sync::RwLock;

use roaring::RoaringTreemap;

use super::{Constraint, ConstraintOp, Indexer, IndexStat};
use crate::document::Document;
use crate::error::UserError;
use crate::{DocumentId, Result};

/// Positional `id → value` indexer. It answers no predicate at all; its job
/// is the projection fast path, serving field reads in O(1) without touching
/// the blob store.
pub(crate) struct VectorIndexer<V> {
    stat: IndexStat,
    tokens: Vec<String>,
    values: RwLock<Vec<V>>,
}

impl<V> VectorIndexer<V> {
    pub(crate) fn new(stat: IndexStat, tokens: Vec<String>) -> VectorIndexer<V> {
        VectorIndexer { stat, tokens, values: RwLock::new(Vec::new()) }
    }

    fn unsupported(&self, op: ConstraintOp) -> crate::Error {
        UserError::UnsupportedOperator { index: self.stat.name.clone(), op }.into()
    }
}

macro_rules! vector_indexer_common {
    () => {
        fn stats(&self) -> &IndexStat {
            &self.stat
        }

        fn supports(&self, _op: ConstraintOp) -> bool {
            false
        }

        fn filter(&self, constraint: &Constraint) -> Result<RoaringTreemap> {
            Err(self.unsupported(constraint.op))
        }
    };
}

impl Indexer for VectorIndexer<i64> {
    vector_indexer_common!();

    fn validate_for_insert(&self, doc: &Document<'_>) -> Result<()> {
        doc.int64_by_path(&self.tokens).map(drop)
    }

    fn insert(&self, id: DocumentId, doc: &Document<'_>) -> Result<()> {
        let value = doc.int64_by_path(&self.tokens)?;
        let mut values = self.values.write().unwrap();
        debug_assert_eq!(values.len() as u64, id);
        values.push(value);
        Ok(())
    }

    fn try_get_integer(&self, id: DocumentId) -> Option<i64> {
        self.values.read().unwrap().get(id as usize).copied()
    }

    fn try_get_integer_vector(&self, ids: &[DocumentId]) -> Option<Vec<i64>> {
        let values = self.values.read().unwrap();
        ids.iter().map(|id| values.get(*id as usize).copied()).collect()
    }
}

impl Indexer for VectorIndexer<f64> {
    vector_indexer_common!();

    fn validate_for_insert(&self, doc: &Document<'_>) -> Result<()> {
        doc.f64_by_path(&self.tokens).map(drop)
    }

    fn insert(&self, id: DocumentId, doc: &Document<'_>) -> Result<()> {
        let value = doc.f64_by_path(&self.tokens)?;
        let mut values = self.values.write().unwrap();
        debug_assert_eq!(values.len() as u64, id);
        values.push(value);
        Ok(())
    }

    fn try_get_double(&self, id: DocumentId) -> Option<f64> {
        self.values.read().unwrap().get(id as usize).copied()
    }

    fn try_get_double_vector(&self, ids: &[DocumentId]) -> Option<Vec<f64>> {
        let values = self.values.read().unwrap();
        ids.iter().map(|id| values.get(*id as usize).copied()).collect()
    }
}

impl Indexer for VectorIndexer<String> {
    vector_indexer_common!();

    fn validate_for_insert(&self, doc: &Document<'_>) -> Result<()> {
        doc.string_by_path(&self.tokens).map(drop)
    }

    fn insert(&self, id: DocumentId, doc: &Document<'_>) -> Result<()> {
        let value = doc.string_by_path(&self.tokens)?;
        let mut values = self.values.write().unwrap();
        debug_assert_eq!(values.len() as u64, id);
        values.push(value.to_string());
        Ok(())
    }

    fn try_get_string(&self, id: DocumentId) -> Option<String> {
        self.values.read().unwrap().get(id as usize).cloned()
    }
}

#[cfg(test)]
mod test {
    use big_s::S;

    use super::*;
    use crate::document::DocumentBuilder;
    use crate::index::{IndexKind, Operand};
    use crate::schema::{Field, FieldKind, Schema};

    fn counted(values: &[i64]) -> VectorIndexer<i64> {
        let schema = Schema::new(vec![Field::required("count", FieldKind::Int64)]).unwrap();
        let stat = IndexStat {
            name: S("count_values"),
            kind: IndexKind::Vector,
            column: S("count"),
            field_kind: FieldKind::Int64,
            ascending: true,
        };
        let indexer = VectorIndexer::new(stat, vec![S("count")]);
        for (id, value) in values.iter().enumerate() {
            let mut builder = DocumentBuilder::new(&schema);
            builder.set_int64("count", *value).unwrap();
            let bytes = builder.build().unwrap();
            let doc = Document::from_bytes(&schema, &bytes).unwrap();
            indexer.insert(id as u64, &doc).unwrap();
        }
        indexer
    }

    #[test]
    fn point_and_batched_reads() {
        let indexer = counted(&[10, 20, 30]);
        assert_eq!(indexer.try_get_integer(1), Some(20));
        assert_eq!(indexer.try_get_integer(3), None);
        assert_eq!(indexer.try_get_integer_vector(&[2, 0]), Some(vec![30, 10]));
        // One out-of-range id makes the whole batch miss.
        assert_eq!(indexer.try_get_integer_vector(&[0, 9]), None);
        // Kind-mismatched reads miss instead of erroring.
        assert_eq!(indexer.try_get_double(0), None);
    }

    #[test]
    fn no_predicate_support() {
        let indexer = counted(&[1]);
        assert!(!indexer.supports(ConstraintOp::Equal));
        let eq = Constraint::new("count", ConstraintOp::Equal, Operand::Integer(1));
        assert!(matches!(
            indexer.filter(&eq).unwrap_err(),
            crate::Error::UserError(UserError::UnsupportedOperator { .. })
        ));
    }
}
