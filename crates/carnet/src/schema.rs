use serde::{Deserialize, Serialize};

use crate::error::UserError;
use crate::{FieldId, Result};

/// Declared kind of a schema field. Integer widths are storage widths; every
/// integer reads back as `i64` and `Float32` reads back as `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Double,
    String,
    Blob,
    Document,
}

impl FieldKind {
    /// Encoded width for fixed-width kinds.
    pub(crate) fn fixed_width(self) -> Option<usize> {
        match self {
            FieldKind::Int8 => Some(1),
            FieldKind::Int16 => Some(2),
            FieldKind::Int32 => Some(4),
            FieldKind::Int64 => Some(8),
            FieldKind::Float32 => Some(4),
            FieldKind::Double => Some(8),
            FieldKind::String | FieldKind::Blob | FieldKind::Document => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, FieldKind::Int8 | FieldKind::Int16 | FieldKind::Int32 | FieldKind::Int64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, FieldKind::Float32 | FieldKind::Double)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Sub-schema, present exactly for `Document` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Schema>,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Field {
        Field { name: name.into(), kind, required: false, fields: None }
    }

    pub fn required(name: impl Into<String>, kind: FieldKind) -> Field {
        Field { name: name.into(), kind, required: true, fields: None }
    }

    pub fn nested(name: impl Into<String>, fields: Schema) -> Field {
        Field { name: name.into(), kind: FieldKind::Document, required: false, fields: Some(fields) }
    }
}

/// An immutable, ordered field declaration. Field ids are declaration
/// positions and never change for the lifetime of a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Result<Schema> {
        if fields.len() > FieldId::MAX as usize {
            return Err(UserError::InvalidArgument(format!(
                "a schema cannot declare more than {} fields",
                FieldId::MAX
            ))
            .into());
        }
        for (i, field) in fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(UserError::InvalidArgument("field names cannot be empty".into()).into());
            }
            if field.name.contains('.') {
                return Err(UserError::InvalidArgument(format!(
                    "field name `{}` cannot contain `.`",
                    field.name
                ))
                .into());
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(UserError::InvalidArgument(format!(
                    "field `{}` is declared twice",
                    field.name
                ))
                .into());
            }
            match (field.kind, &field.fields) {
                (FieldKind::Document, None) => {
                    return Err(UserError::InvalidArgument(format!(
                        "document field `{}` is missing its sub-schema",
                        field.name
                    ))
                    .into())
                }
                (FieldKind::Document, Some(_)) => {}
                (_, Some(_)) => {
                    return Err(UserError::InvalidArgument(format!(
                        "scalar field `{}` cannot carry a sub-schema",
                        field.name
                    ))
                    .into())
                }
                (_, None) => {}
            }
        }
        Ok(Schema { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, id: FieldId) -> Option<&Field> {
        self.fields.get(id as usize)
    }

    pub fn field_by_name(&self, name: &str) -> Option<(FieldId, &Field)> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| (i as FieldId, &self.fields[i]))
    }

    /// Resolves a dotted column path to its leaf field, descending one
    /// sub-schema per token.
    pub fn leaf_at_path(&self, tokens: &[String]) -> Result<&Field> {
        let (last, prefix) = tokens
            .split_last()
            .ok_or_else(|| UserError::InvalidArgument("column path is empty".into()))?;

        let mut schema = self;
        for token in prefix {
            let (_, field) = schema
                .field_by_name(token)
                .ok_or_else(|| UserError::FieldMissing(token.clone()))?;
            schema = field.fields.as_ref().ok_or_else(|| UserError::TypeMismatch {
                field: token.clone(),
                kind: field.kind,
                requested: "document",
            })?;
        }

        let (_, field) =
            schema.field_by_name(last).ok_or_else(|| UserError::FieldMissing(last.clone()))?;
        Ok(field)
    }
}

/// Splits a dotted column path (`user.id`) into its tokens.
pub fn split_column_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

#[cfg(test)]
mod test {
    use big_s::S;

    use super::*;

    fn tweet_schema() -> Schema {
        let user = Schema::new(vec![
            Field::required("id", FieldKind::Int64),
            Field::new("name", FieldKind::String),
        ])
        .unwrap();
        Schema::new(vec![
            Field::required("id", FieldKind::Int64),
            Field::new("text", FieldKind::String),
            Field::new("rating", FieldKind::Double),
            Field::nested("user", user),
        ])
        .unwrap()
    }

    #[test]
    fn field_ids_follow_declaration_order() {
        let schema = tweet_schema();
        assert_eq!(schema.field_by_name("id").unwrap().0, 0);
        assert_eq!(schema.field_by_name("user").unwrap().0, 3);
        assert!(schema.field_by_name("missing").is_none());
    }

    #[test]
    fn path_resolution_descends_sub_schemas() {
        let schema = tweet_schema();
        let field = schema.leaf_at_path(&[S("user"), S("name")]).unwrap();
        assert_eq!(field.kind, FieldKind::String);

        let err = schema.leaf_at_path(&[S("text"), S("name")]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::UserError(UserError::TypeMismatch { .. })
        ));
        let err = schema.leaf_at_path(&[S("user"), S("missing")]).unwrap_err();
        assert!(matches!(err, crate::Error::UserError(UserError::FieldMissing(_))));
    }

    #[test]
    fn duplicate_and_dotted_names_are_rejected() {
        let err = Schema::new(vec![
            Field::new("a", FieldKind::Int32),
            Field::new("a", FieldKind::Int32),
        ])
        .unwrap_err();
        assert!(matches!(err, crate::Error::UserError(UserError::InvalidArgument(_))));

        let err = Schema::new(vec![Field::new("a.b", FieldKind::Int32)]).unwrap_err();
        assert!(matches!(err, crate::Error::UserError(UserError::InvalidArgument(_))));
    }
}
