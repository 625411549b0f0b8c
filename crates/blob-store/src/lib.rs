use std::collections::VecDeque;
use std::fs::{File as StdFile, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use memmap2::Mmap;

/// Every record starts with this tag so that a reader landing on a wrong
/// offset fails loudly instead of decoding garbage.
const RECORD_MAGIC: &[u8; 4] = b"cndf";
/// magic(4) | length(4) | crc32(4)
const RECORD_HEADER_LEN: u64 = 12;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("corrupt blob record in data file {file_id} at offset {offset}")]
    CorruptBlob { file_id: u32, offset: u64 },
    #[error("data file {0} does not exist")]
    MissingDataFile(u32),
    #[error("blob handle points past the end of data file {file_id} (offset {offset})")]
    HandleOutOfBounds { file_id: u32, offset: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable locator of one persisted payload: the byte range it occupies and
/// the checksum it must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHandle {
    pub file_id: u32,
    pub offset: u64,
    pub length: u32,
    pub crc: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BlobStoreOptions {
    /// Rollover threshold for the current write file.
    pub datafile_max_bytes: u64,
    /// Maximum number of files kept mapped at once.
    pub max_mapped_regions: usize,
}

impl Default for BlobStoreOptions {
    fn default() -> Self {
        BlobStoreOptions { datafile_max_bytes: 256 * 1024 * 1024, max_mapped_regions: 8 }
    }
}

/// Append-only store for document payloads.
///
/// Payloads are appended to `<collection>.<seq>.dat` files as
/// `magic | length | crc32 | payload` records. Writes are serialized behind a
/// mutex; reads go through an LRU cache of memory-mapped files and verify the
/// handle's checksum.
pub struct BlobStore {
    dir: PathBuf,
    collection: String,
    datafile_max_bytes: u64,
    writer: Mutex<Writer>,
    regions: Mutex<MappedRegions>,
}

struct Writer {
    file: BufWriter<StdFile>,
    file_id: u32,
    offset: u64,
}

impl BlobStore {
    /// Opens the store for `collection` under `dir`, resuming at the end of
    /// the highest-numbered existing data file.
    pub fn open(dir: impl AsRef<Path>, collection: &str, options: BlobStoreOptions) -> Result<BlobStore> {
        let dir = dir.as_ref().to_path_buf();
        let file_id = existing_file_ids(&dir, collection)?.last().copied().unwrap_or(0);
        let path = data_file_path(&dir, collection, file_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();

        Ok(BlobStore {
            dir,
            collection: collection.to_string(),
            datafile_max_bytes: options.datafile_max_bytes,
            writer: Mutex::new(Writer { file: BufWriter::new(file), file_id, offset }),
            regions: Mutex::new(MappedRegions::new(options.max_mapped_regions)),
        })
    }

    /// Appends all payloads and returns their handles, in input order.
    ///
    /// The batch is flushed to the OS once at the end; the current file rolls
    /// over to a new one when it would grow past the size threshold.
    pub fn put_many(&self, buffers: &[&[u8]]) -> Result<Vec<BlobHandle>> {
        let mut writer = self.writer.lock().unwrap();
        let mut handles = Vec::with_capacity(buffers.len());

        for payload in buffers {
            let record_len = RECORD_HEADER_LEN + payload.len() as u64;
            if writer.offset > 0 && writer.offset + record_len > self.datafile_max_bytes {
                self.roll_over(&mut writer)?;
            }

            let crc = CRC32.checksum(payload);
            let mut header = [0u8; RECORD_HEADER_LEN as usize];
            header[..4].copy_from_slice(RECORD_MAGIC);
            LittleEndian::write_u32(&mut header[4..8], payload.len() as u32);
            LittleEndian::write_u32(&mut header[8..12], crc);
            writer.file.write_all(&header)?;
            writer.file.write_all(payload)?;

            handles.push(BlobHandle {
                file_id: writer.file_id,
                offset: writer.offset + RECORD_HEADER_LEN,
                length: payload.len() as u32,
                crc,
            });
            writer.offset += record_len;
        }

        writer.file.flush()?;
        Ok(handles)
    }

    fn roll_over(&self, writer: &mut Writer) -> Result<()> {
        writer.file.flush()?;
        writer.file.get_ref().sync_data()?;

        let file_id = writer.file_id + 1;
        let path = data_file_path(&self.dir, &self.collection, file_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(file = %path.display(), "rolling over to new data file");

        writer.file = BufWriter::new(file);
        writer.file_id = file_id;
        writer.offset = 0;
        Ok(())
    }

    /// Reads the payload a handle points at into `out`, verifying its crc.
    pub fn get(&self, handle: BlobHandle, out: &mut Vec<u8>) -> Result<()> {
        let mmap = self.mapped(handle.file_id)?;
        let end = handle.offset + handle.length as u64;
        let mmap = if (mmap.len() as u64) < end {
            // The file grew past this mapping; drop it and map again.
            self.regions.lock().unwrap().remove(handle.file_id);
            self.mapped(handle.file_id)?
        } else {
            mmap
        };
        if (mmap.len() as u64) < end {
            return Err(Error::HandleOutOfBounds { file_id: handle.file_id, offset: handle.offset });
        }

        let payload = &mmap[handle.offset as usize..end as usize];
        if CRC32.checksum(payload) != handle.crc {
            tracing::error!(
                file_id = handle.file_id,
                offset = handle.offset,
                "crc mismatch while reading blob"
            );
            return Err(Error::CorruptBlob { file_id: handle.file_id, offset: handle.offset });
        }

        out.clear();
        out.extend_from_slice(payload);
        Ok(())
    }

    fn mapped(&self, file_id: u32) -> Result<Arc<Mmap>> {
        let mut regions = self.regions.lock().unwrap();
        if let Some(mmap) = regions.get(file_id) {
            return Ok(mmap);
        }

        let path = data_file_path(&self.dir, &self.collection, file_id);
        let file = StdFile::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::MissingDataFile(file_id),
            _ => Error::IoError(e),
        })?;
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });
        regions.insert(file_id, mmap.clone());
        Ok(mmap)
    }

    /// Drops up to `n` least-recently-used mappings. Upper layers call this
    /// under memory pressure.
    pub fn unmap_lru(&self, n: usize) {
        self.regions.lock().unwrap().evict(n);
    }

    /// Number of files currently kept mapped.
    pub fn mapped_region_count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    /// Ids of all data files on disk, in file order.
    pub fn data_file_ids(&self) -> Result<Vec<u32>> {
        existing_file_ids(&self.dir, &self.collection)
    }

    /// Sequential reader over one data file, for replay.
    pub fn iterate(&self, file_id: u32) -> Result<BlobIterator> {
        let path = data_file_path(&self.dir, &self.collection, file_id);
        let file = StdFile::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::MissingDataFile(file_id),
            _ => Error::IoError(e),
        })?;
        Ok(BlobIterator { file_id, reader: BufReader::new(file), offset: 0 })
    }
}

/// Pull iterator yielding `(payload, handle)` pairs in file order.
///
/// Callers provide the batch buffers so replay reuses allocations across
/// batches.
pub struct BlobIterator {
    file_id: u32,
    reader: BufReader<StdFile>,
    offset: u64,
}

impl BlobIterator {
    /// Fills `payloads`/`handles` with up to `batch_size` records and returns
    /// how many were read. Returns 0 at end of file.
    pub fn next_batch(
        &mut self,
        batch_size: usize,
        payloads: &mut Vec<Vec<u8>>,
        handles: &mut Vec<BlobHandle>,
    ) -> Result<usize> {
        payloads.clear();
        handles.clear();

        while payloads.len() < batch_size {
            let mut header = [0u8; RECORD_HEADER_LEN as usize];
            match self.reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if &header[..4] != RECORD_MAGIC {
                return Err(Error::CorruptBlob { file_id: self.file_id, offset: self.offset });
            }
            let length = LittleEndian::read_u32(&header[4..8]);
            let crc = LittleEndian::read_u32(&header[8..12]);

            let mut payload = vec![0u8; length as usize];
            self.reader.read_exact(&mut payload).map_err(|e| match e.kind() {
                // A torn trailing record reads as corruption, not clean EOF.
                ErrorKind::UnexpectedEof => {
                    Error::CorruptBlob { file_id: self.file_id, offset: self.offset }
                }
                _ => Error::IoError(e),
            })?;
            if CRC32.checksum(&payload) != crc {
                return Err(Error::CorruptBlob { file_id: self.file_id, offset: self.offset });
            }

            handles.push(BlobHandle {
                file_id: self.file_id,
                offset: self.offset + RECORD_HEADER_LEN,
                length,
                crc,
            });
            payloads.push(payload);
            self.offset += RECORD_HEADER_LEN + length as u64;
        }

        Ok(payloads.len())
    }
}

/// Mapped files in most-recently-used-first order; eviction drops one file
/// per overflow.
struct MappedRegions {
    capacity: usize,
    entries: VecDeque<(u32, Arc<Mmap>)>,
}

impl MappedRegions {
    fn new(capacity: usize) -> Self {
        MappedRegions { capacity: capacity.max(1), entries: VecDeque::new() }
    }

    fn get(&mut self, file_id: u32) -> Option<Arc<Mmap>> {
        let pos = self.entries.iter().position(|(id, _)| *id == file_id)?;
        let entry = self.entries.remove(pos).unwrap();
        let mmap = entry.1.clone();
        self.entries.push_front(entry);
        Some(mmap)
    }

    fn insert(&mut self, file_id: u32, mmap: Arc<Mmap>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front((file_id, mmap));
    }

    fn remove(&mut self, file_id: u32) {
        self.entries.retain(|(id, _)| *id != file_id);
    }

    fn evict(&mut self, n: usize) {
        for _ in 0..n {
            if self.entries.pop_back().is_none() {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn data_file_path(dir: &Path, collection: &str, file_id: u32) -> PathBuf {
    dir.join(format!("{collection}.{file_id:06}.dat"))
}

fn existing_file_ids(dir: &Path, collection: &str) -> Result<Vec<u32>> {
    let prefix = format!("{collection}.");
    let mut ids = Vec::new();
    for entry in dir.read_dir()? {
        let file_name = entry?.file_name();
        let Some(name) = file_name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&prefix) else { continue };
        let Some(seq) = rest.strip_suffix(".dat") else { continue };
        if let Ok(id) = seq.parse::<u32>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
