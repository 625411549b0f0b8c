use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::UserError;
use crate::index::IndexInfo;
use crate::schema::Schema;
use crate::Result;

const METADATA_FILE: &str = "carnet.meta.json";

/// Everything needed to rebuild one collection at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CollectionMetadata {
    pub name: String,
    pub schema: Schema,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    collections: Vec<CollectionMetadata>,
}

/// The schema registry: a JSON metadata file listing collection names, their
/// schemas and their declared indexes. The engine proper never parses it; it
/// receives the decoded values.
#[derive(Debug)]
pub(crate) struct Registry {
    path: PathBuf,
    collections: Vec<CollectionMetadata>,
}

impl Registry {
    pub(crate) fn open(dir: &Path, create_if_missing: bool) -> Result<Registry> {
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            if !create_if_missing {
                return Err(
                    UserError::MissingDatabaseFile(path.display().to_string()).into()
                );
            }
            let registry = Registry { path, collections: Vec::new() };
            registry.save()?;
            return Ok(registry);
        }

        let file = File::open(&path)?;
        let content: RegistryFile = serde_json::from_reader(BufReader::new(file))?;
        Ok(Registry { path, collections: content.collections })
    }

    pub(crate) fn collections(&self) -> &[CollectionMetadata] {
        &self.collections
    }

    pub(crate) fn add(&mut self, metadata: CollectionMetadata) -> Result<()> {
        self.collections.push(metadata);
        self.save()
    }

    /// Writes the whole file through a temp file rename so a crash never
    /// leaves a half-written registry behind.
    fn save(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        let content = RegistryFile { collections: self.collections.clone() };
        serde_json::to_writer_pretty(&mut file, &content)?;
        file.flush()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::index::IndexKind;
    use crate::schema::{Field, FieldKind};

    #[test]
    fn roundtrips_collection_metadata() {
        let dir = TempDir::new().unwrap();
        let schema = Schema::new(vec![Field::required("id", FieldKind::Int64)]).unwrap();

        let mut registry = Registry::open(dir.path(), true).unwrap();
        registry
            .add(CollectionMetadata {
                name: "tweet".into(),
                schema,
                indexes: vec![IndexInfo::new("id_eq", IndexKind::Equality, "id")],
            })
            .unwrap();

        let registry = Registry::open(dir.path(), false).unwrap();
        let collections = registry.collections();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].name, "tweet");
        assert_eq!(collections[0].indexes[0].column, "id");
        assert_eq!(collections[0].schema.fields()[0].kind, FieldKind::Int64);
    }

    #[test]
    fn missing_metadata_file_is_an_error_without_create() {
        let dir = TempDir::new().unwrap();
        let err = Registry::open(dir.path(), false).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::UserError(UserError::MissingDatabaseFile(_))
        ));
    }
}
