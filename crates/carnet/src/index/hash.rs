use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use roaring::RoaringTreemap;

use super::{Constraint, ConstraintOp, Indexer, IndexStat, Operand};
use crate::document::Document;
use crate::error::UserError;
use crate::{DocumentId, Result};

/// A key type usable in an equality (hash) value→bitmap map.
pub(crate) trait EqualityKey: Eq + Hash + Clone + Send + Sync + 'static {
    fn read(doc: &Document<'_>, tokens: &[String], index: &str) -> Result<Self>;
    /// `Ok(None)` when no stored key can equal the operand.
    fn eq_key(operand: &Operand, index: &str) -> Result<Option<Self>>;
}

fn unsupported_operand(index: &str, operand: &Operand) -> crate::Error {
    UserError::UnsupportedOperand { index: index.to_string(), operand: operand.kind_str() }.into()
}

impl EqualityKey for i64 {
    fn read(doc: &Document<'_>, tokens: &[String], _index: &str) -> Result<i64> {
        doc.int64_by_path(tokens)
    }

    fn eq_key(operand: &Operand, index: &str) -> Result<Option<i64>> {
        match operand {
            Operand::Integer(value) => Ok(Some(*value)),
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
}

impl EqualityKey for String {
    fn read(doc: &Document<'_>, tokens: &[String], _index: &str) -> Result<String> {
        doc.string_by_path(tokens).map(str::to_string)
    }

    fn eq_key(operand: &Operand, index: &str) -> Result<Option<String>> {
        match operand {
            Operand::String(value) => Ok(Some(value.clone())),
            operand => Err(unsupported_operand(index, operand)),
        }
    }
}

impl EqualityKey for Vec<u8> {
    fn read(doc: &Document<'_>, tokens: &[String], _index: &str) -> Result<Vec<u8>> {
        doc.blob_by_path(tokens).map(<[u8]>::to_vec)
    }

    fn eq_key(operand: &Operand, index: &str) -> Result<Option<Vec<u8>>> {
        match operand {
            Operand::Blob(value) => Ok(Some(value.clone())),
            // SQL text literals compare byte-wise against blob keys.
            Operand::String(value) => Ok(Some(value.as_bytes().to_vec())),
            operand => Err(unsupported_operand(index, operand)),
        }
    }
}

/// Equality-only bitmap indexer: a hash map from field value to the bitmap
/// of documents holding that value. Key order is irrelevant; range
/// operators are unsupported.
pub(crate) struct EqualityIndexer<K: EqualityKey> {
    stat: IndexStat,
    tokens: Vec<String>,
    map: RwLock<HashMap<K, RoaringTreemap>>,
}

impl<K: EqualityKey> EqualityIndexer<K> {
    pub(crate) fn new(stat: IndexStat, tokens: Vec<String>) -> EqualityIndexer<K> {
        EqualityIndexer { stat, tokens, map: RwLock::new(HashMap::new()) }
    }
}

impl<K: EqualityKey> Indexer for EqualityIndexer<K> {
    fn stats(&self) -> &IndexStat {
        &self.stat
    }

    fn supports(&self, op: ConstraintOp) -> bool {
        op == ConstraintOp::Equal
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
        match constraint.op {
            ConstraintOp::Equal => match K::eq_key(&constraint.operand, &self.stat.name)? {
                Some(key) => {
                    Ok(self.map.read().unwrap().get(&key).cloned().unwrap_or_default())
                }
                None => Ok(RoaringTreemap::new()),
            },
            op => Err(UserError::UnsupportedOperator { index: self.stat.name.clone(), op }.into()),
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

    fn name_indexer(names: &[&str]) -> EqualityIndexer<String> {
        let schema = Schema::new(vec![Field::required("name", FieldKind::String)]).unwrap();
        let stat = IndexStat {
            name: S("by_name"),
            kind: IndexKind::Equality,
            column: S("name"),
            field_kind: FieldKind::String,
            ascending: true,
        };
        let indexer = EqualityIndexer::new(stat, vec![S("name")]);
        for (id, name) in names.iter().enumerate() {
            let mut builder = DocumentBuilder::new(&schema);
            builder.set_string("name", name).unwrap();
            let bytes = builder.build().unwrap();
            let doc = Document::from_bytes(&schema, &bytes).unwrap();
            indexer.insert(id as u64, &doc).unwrap();
        }
        indexer
    }

    #[test]
    fn equality_lookup() {
        let indexer = name_indexer(&["x", "y", "z", "y"]);
        let eq = Constraint::new("name", ConstraintOp::Equal, Operand::String(S("y")));
        assert_eq!(indexer.filter(&eq).unwrap().iter().collect::<Vec<_>>(), vec![1, 3]);

        let eq = Constraint::new("name", ConstraintOp::Equal, Operand::String(S("w")));
        assert!(indexer.filter(&eq).unwrap().is_empty());
    }

    #[test]
    fn range_and_match_are_unsupported() {
        let indexer = name_indexer(&["x"]);
        for op in [ConstraintOp::LessThan, ConstraintOp::GreaterThanOrEqual, ConstraintOp::Match] {
            let constraint = Constraint::new("name", op, Operand::String(S("x")));
            assert!(matches!(
                indexer.filter(&constraint).unwrap_err(),
                crate::Error::UserError(UserError::UnsupportedOperator { .. })
            ));
        }
        assert!(!indexer.supports(ConstraintOp::Match));
    }
}
