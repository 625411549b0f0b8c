use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::collection::DocumentCollection;
use crate::error::UserError;
use crate::index::IndexInfo;
use crate::registry::{CollectionMetadata, Registry};
use crate::schema::Schema;
use crate::sql::{QueryProcessor, ResultSet};
use crate::{Options, Result};

/// The live collections, shared with the SQL layer (virtual tables resolve
/// their collection through this map).
pub(crate) type CollectionSet = Arc<RwLock<HashMap<String, Arc<DocumentCollection>>>>;

/// The embedder-facing facade: owns the registry, every collection and the
/// SQL front end.
pub struct Database {
    dir: PathBuf,
    options: Options,
    registry: Mutex<Registry>,
    collections: CollectionSet,
    query: QueryProcessor,
}

impl Database {
    /// Opens (or creates, per `options.create_if_missing`) the database at
    /// `dir`, rebuilding every registered collection by replaying its data
    /// files.
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<Database> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            if !options.create_if_missing {
                return Err(UserError::MissingDatabaseFile(dir.display().to_string()).into());
            }
            fs::create_dir_all(&dir)?;
        }

        let registry = Registry::open(&dir, options.create_if_missing)?;
        let collections: CollectionSet = Arc::new(RwLock::new(HashMap::new()));
        let query = QueryProcessor::new(&options, collections.clone())?;

        for metadata in registry.collections() {
            let collection = DocumentCollection::open(
                &metadata.name,
                metadata.schema.clone(),
                &metadata.indexes,
                &dir,
                &options,
            )?;
            collections.write().unwrap().insert(metadata.name.clone(), Arc::new(collection));
            query.add_collection(&metadata.name)?;
        }

        tracing::debug!(
            path = %dir.display(),
            collections = registry.collections().len(),
            "database opened"
        );
        Ok(Database { dir, options, registry: Mutex::new(registry), collections, query })
    }

    /// Registers a new collection: persists its metadata, builds its state
    /// and exposes it as a virtual table.
    pub fn create_collection(
        &self,
        name: &str,
        schema: Schema,
        indexes: Vec<IndexInfo>,
    ) -> Result<()> {
        validate_collection_name(name)?;
        if self.collections.read().unwrap().contains_key(name) {
            return Err(UserError::CollectionAlreadyExists(name.to_string()).into());
        }

        let collection =
            DocumentCollection::open(name, schema.clone(), &indexes, &self.dir, &self.options)?;
        self.registry.lock().unwrap().add(CollectionMetadata {
            name: name.to_string(),
            schema,
            indexes,
        })?;
        self.collections.write().unwrap().insert(name.to_string(), Arc::new(collection));
        self.query.add_collection(name)?;
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Result<Arc<DocumentCollection>> {
        self.collections
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| UserError::UnknownCollection(name.to_string()).into())
    }

    /// Runs a SELECT against the virtual tables and returns its rows.
    pub fn execute_select(&self, sql: &str) -> Result<ResultSet> {
        self.query.execute_select(sql)
    }
}

/// Collection names become SQL table names; keep them identifier-shaped.
fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(UserError::InvalidArgument(format!("`{name}` is not a valid collection name")).into())
    }
}
