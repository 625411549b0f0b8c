use std::collections::BTreeMap;
use std::str;

use byteorder::{ByteOrder, LittleEndian};
use obkv::{KvReaderU16, KvWriter};

use crate::error::UserError;
use crate::schema::{Field, FieldKind, Schema};
use crate::{FieldId, Result};

/// A decoded document: a validated obkv buffer plus the schema it was
/// validated against. Field values are read in place; nothing is copied
/// until a caller asks for an owned value.
#[derive(Debug, Clone, Copy)]
pub struct Document<'a> {
    schema: &'a Schema,
    obkv: &'a KvReaderU16,
}

impl<'a> Document<'a> {
    /// Validates `bytes` against `schema` and wraps it. Offsets, widths,
    /// UTF-8 of string fields, required fields and nested documents are all
    /// checked here once; later reads trust the buffer.
    pub fn from_bytes(schema: &'a Schema, bytes: &'a [u8]) -> Result<Document<'a>> {
        let obkv = KvReaderU16::from_slice(bytes);
        validate(schema, obkv)?;
        Ok(Document { schema, obkv })
    }

    fn from_validated(schema: &'a Schema, bytes: &'a [u8]) -> Document<'a> {
        Document { schema, obkv: KvReaderU16::from_slice(bytes) }
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    fn raw(&self, name: &str) -> Result<(&'a Field, &'a [u8])> {
        let (id, field) = self
            .schema
            .field_by_name(name)
            .ok_or_else(|| UserError::FieldMissing(name.to_string()))?;
        let value =
            self.obkv.get(id).ok_or_else(|| UserError::FieldMissing(name.to_string()))?;
        Ok((field, value))
    }

    /// Reads an integer field, widening from its declared width.
    pub fn get_int64(&self, name: &str) -> Result<i64> {
        let (field, value) = self.raw(name)?;
        match field.kind {
            FieldKind::Int8 => Ok(value[0] as i8 as i64),
            FieldKind::Int16 => Ok(LittleEndian::read_i16(value) as i64),
            FieldKind::Int32 => Ok(LittleEndian::read_i32(value) as i64),
            FieldKind::Int64 => Ok(LittleEndian::read_i64(value)),
            kind => Err(UserError::TypeMismatch {
                field: name.to_string(),
                kind,
                requested: "an integer",
            }
            .into()),
        }
    }

    pub fn get_f64(&self, name: &str) -> Result<f64> {
        let (field, value) = self.raw(name)?;
        match field.kind {
            FieldKind::Float32 => Ok(LittleEndian::read_f32(value) as f64),
            FieldKind::Double => Ok(LittleEndian::read_f64(value)),
            kind => Err(UserError::TypeMismatch {
                field: name.to_string(),
                kind,
                requested: "a double",
            }
            .into()),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<&'a str> {
        let (field, value) = self.raw(name)?;
        match field.kind {
            // UTF-8 was checked when the buffer was validated.
            FieldKind::String => Ok(unsafe { str::from_utf8_unchecked(value) }),
            kind => Err(UserError::TypeMismatch {
                field: name.to_string(),
                kind,
                requested: "a string",
            }
            .into()),
        }
    }

    pub fn get_blob(&self, name: &str) -> Result<&'a [u8]> {
        let (field, value) = self.raw(name)?;
        match field.kind {
            FieldKind::Blob => Ok(value),
            kind => Err(UserError::TypeMismatch {
                field: name.to_string(),
                kind,
                requested: "a blob",
            }
            .into()),
        }
    }

    /// Borrows a nested document. No allocation: the view shares the parent
    /// buffer.
    pub fn get_subdocument(&self, name: &str) -> Result<Document<'a>> {
        let (field, value) = self.raw(name)?;
        match &field.fields {
            Some(sub_schema) => Ok(Document::from_validated(sub_schema, value)),
            None => Err(UserError::TypeMismatch {
                field: name.to_string(),
                kind: field.kind,
                requested: "a document",
            }
            .into()),
        }
    }

    fn descend(&self, prefix: &[String]) -> Result<Document<'a>> {
        let mut doc = *self;
        for token in prefix {
            doc = doc.get_subdocument(token)?;
        }
        Ok(doc)
    }

    fn split_path<'t>(tokens: &'t [String]) -> Result<(&'t String, &'t [String])> {
        tokens
            .split_last()
            .ok_or_else(|| UserError::InvalidArgument("column path is empty".into()).into())
    }

    pub fn int64_by_path(&self, tokens: &[String]) -> Result<i64> {
        let (last, prefix) = Self::split_path(tokens)?;
        self.descend(prefix)?.get_int64(last)
    }

    pub fn f64_by_path(&self, tokens: &[String]) -> Result<f64> {
        let (last, prefix) = Self::split_path(tokens)?;
        self.descend(prefix)?.get_f64(last)
    }

    pub fn string_by_path(&self, tokens: &[String]) -> Result<&'a str> {
        let (last, prefix) = Self::split_path(tokens)?;
        self.descend(prefix)?.get_string(last)
    }

    pub fn blob_by_path(&self, tokens: &[String]) -> Result<&'a [u8]> {
        let (last, prefix) = Self::split_path(tokens)?;
        self.descend(prefix)?.get_blob(last)
    }
}

fn validate(schema: &Schema, obkv: &KvReaderU16) -> Result<()> {
    let mut previous: Option<FieldId> = None;
    let mut seen = vec![false; schema.fields().len()];

    for (id, value) in obkv.iter() {
        if previous.is_some_and(|p| p >= id) {
            return Err(UserError::SchemaMismatch("field ids are out of order".into()).into());
        }
        previous = Some(id);

        let field = schema.field(id).ok_or_else(|| {
            UserError::SchemaMismatch(format!("field id {id} is not declared by the schema"))
        })?;
        seen[id as usize] = true;

        if let Some(width) = field.kind.fixed_width() {
            if value.len() != width {
                return Err(UserError::SchemaMismatch(format!(
                    "field `{}` must hold {width} bytes, found {}",
                    field.name,
                    value.len()
                ))
                .into());
            }
        }
        match field.kind {
            FieldKind::String if str::from_utf8(value).is_err() => {
                return Err(UserError::SchemaMismatch(format!(
                    "field `{}` is not valid UTF-8",
                    field.name
                ))
                .into())
            }
            FieldKind::Document => {
                let sub_schema = match &field.fields {
                    Some(sub_schema) => sub_schema,
                    None => {
                        return Err(UserError::SchemaMismatch(format!(
                            "field `{}` has no sub-schema",
                            field.name
                        ))
                        .into())
                    }
                };
                validate(sub_schema, KvReaderU16::from_slice(value))?;
            }
            _ => {}
        }
    }

    for (field, seen) in schema.fields().iter().zip(seen) {
        if field.required && !seen {
            return Err(UserError::SchemaMismatch(format!(
                "required field `{}` is missing",
                field.name
            ))
            .into());
        }
    }

    Ok(())
}

/// Encodes typed values into a document payload, checking each value against
/// the declared field kind and width.
#[derive(Debug)]
pub struct DocumentBuilder<'a> {
    schema: &'a Schema,
    values: BTreeMap<FieldId, Vec<u8>>,
}

impl<'a> DocumentBuilder<'a> {
    pub fn new(schema: &'a Schema) -> DocumentBuilder<'a> {
        DocumentBuilder { schema, values: BTreeMap::new() }
    }

    fn field(&self, name: &str) -> Result<(FieldId, &'a Field)> {
        self.schema
            .field_by_name(name)
            .ok_or_else(|| UserError::FieldMissing(name.to_string()).into())
    }

    pub fn set_int64(&mut self, name: &str, value: i64) -> Result<&mut Self> {
        let (id, field) = self.field(name)?;
        let narrowed = |kind: FieldKind| UserError::InvalidArgument(format!(
            "value {value} does not fit in field `{name}` declared as {kind:?}"
        ));
        let bytes = match field.kind {
            FieldKind::Int8 => {
                i8::try_from(value).map_err(|_| narrowed(field.kind))?.to_le_bytes().to_vec()
            }
            FieldKind::Int16 => {
                i16::try_from(value).map_err(|_| narrowed(field.kind))?.to_le_bytes().to_vec()
            }
            FieldKind::Int32 => {
                i32::try_from(value).map_err(|_| narrowed(field.kind))?.to_le_bytes().to_vec()
            }
            FieldKind::Int64 => value.to_le_bytes().to_vec(),
            kind => {
                return Err(UserError::TypeMismatch {
                    field: name.to_string(),
                    kind,
                    requested: "an integer",
                }
                .into())
            }
        };
        self.values.insert(id, bytes);
        Ok(self)
    }

    pub fn set_f64(&mut self, name: &str, value: f64) -> Result<&mut Self> {
        let (id, field) = self.field(name)?;
        let bytes = match field.kind {
            FieldKind::Float32 => (value as f32).to_le_bytes().to_vec(),
            FieldKind::Double => value.to_le_bytes().to_vec(),
            kind => {
                return Err(UserError::TypeMismatch {
                    field: name.to_string(),
                    kind,
                    requested: "a double",
                }
                .into())
            }
        };
        self.values.insert(id, bytes);
        Ok(self)
    }

    pub fn set_string(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        let (id, field) = self.field(name)?;
        match field.kind {
            FieldKind::String => {
                self.values.insert(id, value.as_bytes().to_vec());
                Ok(self)
            }
            kind => Err(UserError::TypeMismatch {
                field: name.to_string(),
                kind,
                requested: "a string",
            }
            .into()),
        }
    }

    pub fn set_blob(&mut self, name: &str, value: &[u8]) -> Result<&mut Self> {
        let (id, field) = self.field(name)?;
        match field.kind {
            FieldKind::Blob => {
                self.values.insert(id, value.to_vec());
                Ok(self)
            }
            kind => Err(UserError::TypeMismatch {
                field: name.to_string(),
                kind,
                requested: "a blob",
            }
            .into()),
        }
    }

    /// Encodes a nested document through a builder scoped to the field's
    /// sub-schema.
    pub fn set_document(
        &mut self,
        name: &str,
        build: impl FnOnce(&mut DocumentBuilder) -> Result<()>,
    ) -> Result<&mut Self> {
        let (id, field) = self.field(name)?;
        let sub_schema = match &field.fields {
            Some(sub_schema) => sub_schema,
            None => {
                return Err(UserError::TypeMismatch {
                    field: name.to_string(),
                    kind: field.kind,
                    requested: "a document",
                }
                .into())
            }
        };
        let mut sub = DocumentBuilder::new(sub_schema);
        build(&mut sub)?;
        let bytes = sub.build()?;
        self.values.insert(id, bytes);
        Ok(self)
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        for (id, field) in self.schema.fields().iter().enumerate() {
            if field.required && !self.values.contains_key(&(id as FieldId)) {
                return Err(UserError::SchemaMismatch(format!(
                    "required field `{}` is missing",
                    field.name
                ))
                .into());
            }
        }

        let mut writer = KvWriter::<_, FieldId>::memory();
        for (id, bytes) in &self.values {
            writer.insert(*id, bytes)?;
        }
        Ok(writer.into_inner()?)
    }
}

#[cfg(test)]
mod test {
    use big_s::S;

    use super::*;
    use crate::schema::Field;

    fn tweet_schema() -> Schema {
        let user = Schema::new(vec![
            Field::required("id", FieldKind::Int64),
            Field::new("name", FieldKind::String),
        ])
        .unwrap();
        Schema::new(vec![
            Field::required("id", FieldKind::Int32),
            Field::new("text", FieldKind::String),
            Field::new("rating", FieldKind::Double),
            Field::nested("user", user),
            Field::new("raw", FieldKind::Blob),
        ])
        .unwrap()
    }

    fn tweet(schema: &Schema) -> Vec<u8> {
        let mut builder = DocumentBuilder::new(schema);
        builder
            .set_int64("id", 42)
            .unwrap()
            .set_string("text", "an owl hooted twice")
            .unwrap()
            .set_f64("rating", 4.5)
            .unwrap()
            .set_blob("raw", &[0xDE, 0xAD])
            .unwrap()
            .set_document("user", |user| {
                user.set_int64("id", 7)?.set_string("name", "athena")?;
                Ok(())
            })
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn typed_reads_and_widening() {
        let schema = tweet_schema();
        let bytes = tweet(&schema);
        let doc = Document::from_bytes(&schema, &bytes).unwrap();

        // id is declared Int32 and widens to i64 on read.
        assert_eq!(doc.get_int64("id").unwrap(), 42);
        assert_eq!(doc.get_string("text").unwrap(), "an owl hooted twice");
        assert_eq!(doc.get_f64("rating").unwrap(), 4.5);
        assert_eq!(doc.get_blob("raw").unwrap(), &[0xDE, 0xAD]);

        let user = doc.get_subdocument("user").unwrap();
        assert_eq!(user.get_int64("id").unwrap(), 7);
        assert_eq!(user.get_string("name").unwrap(), "athena");

        assert_eq!(doc.int64_by_path(&[S("user"), S("id")]).unwrap(), 7);
        assert_eq!(doc.string_by_path(&[S("user"), S("name")]).unwrap(), "athena");
    }

    #[test]
    fn typed_read_errors() {
        let schema = tweet_schema();
        let bytes = tweet(&schema);
        let doc = Document::from_bytes(&schema, &bytes).unwrap();

        assert!(matches!(
            doc.get_int64("text").unwrap_err(),
            crate::Error::UserError(UserError::TypeMismatch { .. })
        ));
        assert!(matches!(
            doc.get_string("unknown").unwrap_err(),
            crate::Error::UserError(UserError::FieldMissing(_))
        ));
    }

    #[test]
    fn missing_optional_field_reads_as_missing() {
        let schema = tweet_schema();
        let mut builder = DocumentBuilder::new(&schema);
        builder.set_int64("id", 1).unwrap();
        let bytes = builder.build().unwrap();
        let doc = Document::from_bytes(&schema, &bytes).unwrap();

        assert!(matches!(
            doc.get_string("text").unwrap_err(),
            crate::Error::UserError(UserError::FieldMissing(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_buffers() {
        let schema = tweet_schema();

        // Wrong width for the Int32 `id` field.
        let mut writer = KvWriter::<_, FieldId>::memory();
        writer.insert(0u16, [1u8, 2]).unwrap();
        let bytes = writer.into_inner().unwrap();
        assert!(matches!(
            Document::from_bytes(&schema, &bytes).unwrap_err(),
            crate::Error::UserError(UserError::SchemaMismatch(_))
        ));

        // Field id not declared by the schema.
        let mut writer = KvWriter::<_, FieldId>::memory();
        writer.insert(0u16, 7i32.to_le_bytes()).unwrap();
        writer.insert(9u16, [0u8]).unwrap();
        let bytes = writer.into_inner().unwrap();
        assert!(matches!(
            Document::from_bytes(&schema, &bytes).unwrap_err(),
            crate::Error::UserError(UserError::SchemaMismatch(_))
        ));

        // Required field missing.
        let mut writer = KvWriter::<_, FieldId>::memory();
        writer.insert(1u16, b"hello".as_slice()).unwrap();
        let bytes = writer.into_inner().unwrap();
        assert!(matches!(
            Document::from_bytes(&schema, &bytes).unwrap_err(),
            crate::Error::UserError(UserError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn builder_rejects_out_of_range_values() {
        let schema = Schema::new(vec![Field::new("tiny", FieldKind::Int8)]).unwrap();
        let mut builder = DocumentBuilder::new(&schema);
        assert!(matches!(
            builder.set_int64("tiny", 300).unwrap_err(),
            crate::Error::UserError(UserError::InvalidArgument(_))
        ));
        builder.set_int64("tiny", -128).unwrap();
        let bytes = builder.build().unwrap();
        let doc = Document::from_bytes(&schema, &bytes).unwrap();
        assert_eq!(doc.get_int64("tiny").unwrap(), -128);
    }
}
