use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use blob_store::{BlobHandle, BlobStore, BlobStoreOptions};
use roaring::RoaringTreemap;

use crate::document::Document;
use crate::error::{InternalError, UserError};
use crate::index::{Constraint, ConstraintOp, IdGenerator, IndexInfo, IndexManager, IndexStat};
use crate::schema::{split_column_path, Schema};
use crate::{bitmap, DocumentId, Options, Result};

/// One named collection: a schema, an identifier space, the id→handle map,
/// the index manager and the blob store, glued by the ingestion pipeline.
///
/// Ingestion is single-writer; queries run concurrently against the
/// committed bound. The id→handle append is the commit point: the published
/// bound moves only once the handles are durable in the map, so a reader
/// observes an ingestion entirely or not at all.
pub struct DocumentCollection {
    name: String,
    schema: Schema,
    index_manager: IndexManager,
    blob_store: BlobStore,
    id_generator: IdGenerator,
    /// Ids below this bound are visible to readers.
    committed: AtomicU64,
    id_to_handle: RwLock<Vec<BlobHandle>>,
    /// Set when indexing and storage diverged; every later call fails.
    poisoned: AtomicBool,
}

impl DocumentCollection {
    /// Builds the collection and replays any existing data files in file
    /// order, reconstructing identifiers and indexes.
    pub(crate) fn open(
        name: &str,
        schema: Schema,
        indexes: &[IndexInfo],
        dir: &Path,
        options: &Options,
    ) -> Result<DocumentCollection> {
        if name.is_empty() {
            return Err(UserError::InvalidArgument("collection name is empty".into()).into());
        }

        let mut index_manager = IndexManager::new();
        for info in indexes {
            let tokens = split_column_path(&info.column);
            let field = schema.leaf_at_path(&tokens)?;
            index_manager.register(info, field.kind)?;
        }

        let store_options = BlobStoreOptions {
            datafile_max_bytes: options.datafile_max_bytes,
            max_mapped_regions: options.max_mapped_regions,
        };
        let blob_store = BlobStore::open(dir, name, store_options)?;

        let collection = DocumentCollection {
            name: name.to_string(),
            schema,
            index_manager,
            blob_store,
            id_generator: IdGenerator::new(),
            committed: AtomicU64::new(0),
            id_to_handle: RwLock::new(Vec::new()),
            poisoned: AtomicBool::new(false),
        };
        collection.replay(options.blob_batch_size)?;
        Ok(collection)
    }

    /// Replays persisted blobs through the ingestion path, minus the blob
    /// append.
    fn replay(&self, batch_size: usize) -> Result<()> {
        let mut payloads = Vec::new();
        let mut handles = Vec::new();
        let mut total = 0u64;

        for file_id in self.blob_store.data_file_ids()? {
            let mut iter = self.blob_store.iterate(file_id)?;
            loop {
                let read = iter.next_batch(batch_size, &mut payloads, &mut handles)?;
                if read == 0 {
                    break;
                }
                let docs = payloads
                    .iter()
                    .map(|bytes| Document::from_bytes(&self.schema, bytes))
                    .collect::<Result<Vec<_>>>()?;
                self.index_manager.validate_for_indexing(&docs)?;
                let start = self.index_manager.index_documents(&self.id_generator, &docs)?;

                let mut map = self.id_to_handle.write().unwrap();
                debug_assert_eq!(map.len() as u64, start);
                map.extend_from_slice(&handles);
                drop(map);
                self.committed.store(start + read as u64, Ordering::Release);
                total += read as u64;
            }
        }

        if total > 0 {
            tracing::debug!(collection = %self.name, documents = total, "replayed data files");
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of committed documents; also the next identifier.
    pub fn document_count(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(InternalError::IndexCorrupted {
                collection: self.name.clone(),
                cause: "a previous ingestion failed after indexing".into(),
            }
            .into());
        }
        Ok(())
    }

    fn poison(&self, cause: String) -> crate::Error {
        self.poisoned.store(true, Ordering::Release);
        tracing::error!(
            collection = %self.name,
            %cause,
            "in-memory indexes diverged from storage, marking collection unusable"
        );
        InternalError::IndexCorrupted { collection: self.name.clone(), cause }.into()
    }

    pub fn insert(&self, buffer: &[u8]) -> Result<()> {
        self.multi_insert(&[buffer])
    }

    /// Ingests a batch. Decoding and index validation happen before any
    /// state changes; once indexing has started the batch must reach the
    /// blob store, otherwise the collection is poisoned.
    pub fn multi_insert(&self, buffers: &[&[u8]]) -> Result<()> {
        self.ensure_usable()?;
        if buffers.is_empty() {
            return Ok(());
        }

        let docs = buffers
            .iter()
            .map(|bytes| Document::from_bytes(&self.schema, bytes))
            .collect::<Result<Vec<_>>>()?;
        self.index_manager.validate_for_indexing(&docs)?;

        // Infallible by the two-phase contract; a failure here means an
        // indexer broke it.
        let start = match self.index_manager.index_documents(&self.id_generator, &docs) {
            Ok(start) => start,
            Err(error) => return Err(self.poison(error.to_string())),
        };
        let handles = match self.blob_store.put_many(buffers) {
            Ok(handles) => handles,
            Err(error) => return Err(self.poison(error.to_string())),
        };

        let mut map = self.id_to_handle.write().unwrap();
        debug_assert_eq!(map.len() as u64, start);
        map.extend(handles);
        drop(map);
        self.committed.store(start + buffers.len() as u64, Ordering::Release);

        tracing::debug!(
            collection = %self.name,
            first_id = start,
            count = buffers.len(),
            "documents ingested"
        );
        Ok(())
    }

    /// Evaluates the pushed-down constraints, or materializes the whole
    /// identifier range when there are none. The result never contains ids
    /// past the bound committed at call time.
    pub fn filter(&self, constraints: &[Constraint]) -> Result<RoaringTreemap> {
        self.ensure_usable()?;
        let bound = self.committed.load(Ordering::Acquire);
        if constraints.is_empty() {
            return Ok(bitmap::universe(bound));
        }
        let mut result = self.index_manager.filter(constraints)?;
        result.remove_range(bound..);
        Ok(result)
    }

    pub fn try_get_best_index(&self, column: &str, op: ConstraintOp) -> Option<IndexStat> {
        self.index_manager.try_get_best_index(column, op)
    }

    fn check_field_request(&self, id: DocumentId, tokens: &[String]) -> Result<()> {
        if tokens.is_empty() {
            return Err(UserError::InvalidArgument("column path is empty".into()).into());
        }
        self.ensure_usable()?;
        if id >= self.committed.load(Ordering::Acquire) {
            return Err(UserError::MissingDocument { id, collection: self.name.clone() }.into());
        }
        Ok(())
    }

    fn fetch_document_bytes(&self, id: DocumentId, out: &mut Vec<u8>) -> Result<()> {
        let handle = self.id_to_handle.read().unwrap()[id as usize];
        self.blob_store.get(handle, out)?;
        Ok(())
    }

    /// Reads one field of one document, as an integer. Served from an index
    /// when one covers the column, otherwise from the blob.
    pub fn get_field_as_int(
        &self,
        id: DocumentId,
        column: &str,
        tokens: &[String],
    ) -> Result<i64> {
        self.check_field_request(id, tokens)?;
        if let Some(value) = self.index_manager.try_get_integer_value(id, column) {
            return Ok(value);
        }
        let mut buffer = Vec::new();
        self.fetch_document_bytes(id, &mut buffer)?;
        Document::from_bytes(&self.schema, &buffer)?.int64_by_path(tokens)
    }

    pub fn get_field_as_double(
        &self,
        id: DocumentId,
        column: &str,
        tokens: &[String],
    ) -> Result<f64> {
        self.check_field_request(id, tokens)?;
        if let Some(value) = self.index_manager.try_get_double_value(id, column) {
            return Ok(value);
        }
        let mut buffer = Vec::new();
        self.fetch_document_bytes(id, &mut buffer)?;
        Document::from_bytes(&self.schema, &buffer)?.f64_by_path(tokens)
    }

    pub fn get_field_as_string(
        &self,
        id: DocumentId,
        column: &str,
        tokens: &[String],
    ) -> Result<String> {
        self.check_field_request(id, tokens)?;
        if let Some(value) = self.index_manager.try_get_string_value(id, column) {
            return Ok(value);
        }
        let mut buffer = Vec::new();
        self.fetch_document_bytes(id, &mut buffer)?;
        Document::from_bytes(&self.schema, &buffer)?.string_by_path(tokens).map(str::to_string)
    }

    pub fn get_field_as_blob(
        &self,
        id: DocumentId,
        _column: &str,
        tokens: &[String],
    ) -> Result<Vec<u8>> {
        self.check_field_request(id, tokens)?;
        let mut buffer = Vec::new();
        self.fetch_document_bytes(id, &mut buffer)?;
        Document::from_bytes(&self.schema, &buffer)?.blob_by_path(tokens).map(<[u8]>::to_vec)
    }

    /// Batched field materialization; one blob fetch per document on the
    /// slow path.
    pub fn get_fields_as_int_vector(
        &self,
        ids: &[DocumentId],
        column: &str,
        tokens: &[String],
    ) -> Result<Vec<i64>> {
        if tokens.is_empty() {
            return Err(UserError::InvalidArgument("column path is empty".into()).into());
        }
        self.ensure_usable()?;
        let bound = self.committed.load(Ordering::Acquire);
        for &id in ids {
            if id >= bound {
                return Err(
                    UserError::MissingDocument { id, collection: self.name.clone() }.into()
                );
            }
        }
        if let Some(values) = self.index_manager.try_get_integer_vector(ids, column) {
            return Ok(values);
        }

        let handles: Vec<BlobHandle> = {
            let map = self.id_to_handle.read().unwrap();
            ids.iter().map(|id| map[*id as usize]).collect()
        };
        let mut buffer = Vec::new();
        let mut values = Vec::with_capacity(ids.len());
        for handle in handles {
            self.blob_store.get(handle, &mut buffer)?;
            values.push(Document::from_bytes(&self.schema, &buffer)?.int64_by_path(tokens)?);
        }
        Ok(values)
    }

    pub fn get_fields_as_double_vector(
        &self,
        ids: &[DocumentId],
        column: &str,
        tokens: &[String],
    ) -> Result<Vec<f64>> {
        if tokens.is_empty() {
            return Err(UserError::InvalidArgument("column path is empty".into()).into());
        }
        self.ensure_usable()?;
        let bound = self.committed.load(Ordering::Acquire);
        for &id in ids {
            if id >= bound {
                return Err(
                    UserError::MissingDocument { id, collection: self.name.clone() }.into()
                );
            }
        }
        if let Some(values) = self.index_manager.try_get_double_vector(ids, column) {
            return Ok(values);
        }

        let handles: Vec<BlobHandle> = {
            let map = self.id_to_handle.read().unwrap();
            ids.iter().map(|id| map[*id as usize]).collect()
        };
        let mut buffer = Vec::new();
        let mut values = Vec::with_capacity(ids.len());
        for handle in handles {
            self.blob_store.get(handle, &mut buffer)?;
            values.push(Document::from_bytes(&self.schema, &buffer)?.f64_by_path(tokens)?);
        }
        Ok(values)
    }

    /// Memory-pressure hint forwarded to the blob store.
    pub fn unmap_lru(&self, n: usize) {
        self.blob_store.unmap_lru(n);
    }
}
