//! Block storage engine
//!
//! Appends serialized records into fixed-size blocks inside per-partition
//! data files, scoped to a storage path of the form
//! `<root>/YYYY/MM/DD/counter_<id>/`. Each partition directory holds a
//! memory-mapped `data.bin` and an `index.json` mapping objects to their
//! blocks. An object's records land in its one open block until the block
//! is full, at which point a fresh block is allocated from the end of the
//! file and the previous one is sealed in the index.
//!
//! The engine is a cheap cloneable handle: the current storage path is
//! handle-local while partition state (mappings, allocation tables, locks)
//! is shared process-wide, keyed by absolute partition directory.

use crate::storage::block::BlockHeader;
use crate::storage::index::{self, IndexEntry};
use crate::storage::mmap::MappedFile;
use crate::{defaults, Config, CounterRegistry, Error, Result, Timestamp, ValueType};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage tuning, fixed at construction time
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub block_size: usize,
    pub num_partitions: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            block_size: defaults::BLOCK_SIZE,
            num_partitions: defaults::NUM_PARTITIONS,
        }
    }
}

impl From<&Config> for StorageOptions {
    fn from(config: &Config) -> Self {
        Self {
            block_size: config.block_size,
            num_partitions: config.num_of_partitions,
        }
    }
}

/// Partitioned block storage over memory-mapped data files
pub struct StorageEngine {
    shared: Arc<Shared>,
    storage_path: RwLock<Option<PathBuf>>,
}

struct Shared {
    opts: StorageOptions,
    registry: Arc<CounterRegistry>,
    partitions: Mutex<HashMap<PathBuf, Arc<Partition>>>,
}

struct Partition {
    dir: PathBuf,
    inner: RwLock<PartitionInner>,
}

struct PartitionInner {
    data: Option<Arc<MappedFile>>,
    entries: Vec<IndexEntry>,
    alloc: HashMap<u32, ObjectAlloc>,
    /// Next free block offset in this partition's data file
    tail: i64,
}

#[derive(Default)]
struct ObjectAlloc {
    current_block: Option<i64>,
    /// Payload bytes already written into the open block
    usage: usize,
}

/// Estimated record width used when recovering the open-block usage of a
/// numeric counter from its header (u32 timestamp + 8-byte value).
const NUMERIC_RECORD_SIZE: usize = 12;

/// Storage engine statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub partitions: usize,
    pub open_files: usize,
    pub blocks: usize,
}

impl StorageEngine {
    pub fn new(opts: StorageOptions, registry: Arc<CounterRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                opts,
                registry,
                partitions: Mutex::new(HashMap::new()),
            }),
            storage_path: RwLock::new(None),
        }
    }

    /// Point the handle at a `<root>/YYYY/MM/DD/counter_<id>/` directory,
    /// creating it if missing.
    pub fn set_storage_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        *self.storage_path.write() = Some(path.to_path_buf());
        Ok(())
    }

    /// Append one serialized record (timestamp + value bytes) for an
    /// object, allocating a fresh block when the open one lacks room.
    pub fn put(&self, object_id: u32, counter_id: u16, record: &[u8]) -> Result<()> {
        let base = self.current_path()?;
        let block_size = self.shared.opts.block_size;
        let capacity = block_size - BlockHeader::SIZE;

        if record.len() > capacity {
            return Err(Error::RecordTooLarge {
                len: record.len(),
                capacity,
            });
        }
        let value_type = self.shared.registry.value_type(counter_id)?;

        let partition = self.partition(&base, object_id);
        let mut inner = partition.inner.write();

        let data = match &inner.data {
            Some(data) => data.clone(),
            None => {
                std::fs::create_dir_all(&partition.dir)?;
                let file = Arc::new(open_data_file(
                    &partition.dir.join("data.bin"),
                    block_size,
                )?);
                inner.data = Some(file.clone());
                file
            }
        };

        let timestamp = record_timestamp(record);

        // Reuse the open block when the record fits, else allocate from
        // the partition tail.
        let reusable = inner.alloc.get(&object_id).and_then(|a| {
            a.current_block
                .filter(|_| a.usage + record.len() <= capacity)
        });
        let (offset, is_new) = match reusable {
            Some(offset) => (offset, false),
            None => {
                let offset = inner.tail;
                inner.tail += block_size as i64;
                (offset, true)
            }
        };

        let required = (offset as usize) + block_size;
        if required > data.len() {
            data.grow(
                required + defaults::GROW_SLACK_BLOCKS * block_size,
                block_size,
            )?;
        }

        if is_new {
            let header = BlockHeader::new(object_id, value_type, timestamp);
            data.write_at(&header.to_bytes(), offset as u64)?;
        } else {
            let mut buf = [0u8; BlockHeader::SIZE];
            data.read_at(&mut buf, offset as u64)?;
            let mut header = BlockHeader::from_bytes(&buf)?;
            header.absorb(timestamp);
            data.write_at(&header.to_bytes(), offset as u64)?;
        }

        let usage = if is_new {
            0
        } else {
            inner.alloc.get(&object_id).map(|a| a.usage).unwrap_or(0)
        };
        let record_offset = offset as u64 + BlockHeader::SIZE as u64 + usage as u64;
        data.write_at(record, record_offset)?;

        let alloc = inner.alloc.entry(object_id).or_default();
        if is_new {
            alloc.current_block = Some(offset);
            alloc.usage = record.len();
        } else {
            alloc.usage += record.len();
        }

        // A new allocation seals the previously open block in the index.
        if is_new {
            for entry in inner.entries.iter_mut() {
                if entry.device_id == object_id {
                    entry.current_offset = 0;
                }
            }
            inner.entries.push(IndexEntry {
                device_id: object_id,
                block_offset: offset,
                current_offset: offset,
            });
            index::write_index(&partition.dir.join("index.json"), &inner.entries)?;
        }

        Ok(())
    }

    /// Return every block payload (block bytes minus the header) the index
    /// reports for this object in the current partition. The caller
    /// filters records by timestamp and decodes them.
    pub fn get(&self, object_id: u32) -> Result<Vec<Vec<u8>>> {
        let base = self.current_path()?;
        self.get_in(&base, object_id)
    }

    /// Set the storage path and read in one call
    pub fn get_by_path(&self, object_id: u32, path: impl AsRef<Path>) -> Result<Vec<Vec<u8>>> {
        self.set_storage_path(path)?;
        let base = self.current_path()?;
        self.get_in(&base, object_id)
    }

    fn get_in(&self, base: &Path, object_id: u32) -> Result<Vec<Vec<u8>>> {
        let partition = self.partition(base, object_id);
        let inner = partition.inner.read();

        let data = match &inner.data {
            Some(data) => data.clone(),
            // No data file yet: nothing stored in this partition.
            None => return Ok(Vec::new()),
        };

        let block_size = self.shared.opts.block_size;
        let mut results = Vec::new();
        for entry in inner.entries.iter().filter(|e| e.device_id == object_id) {
            let mut block = vec![0u8; block_size];
            match data.read_at(&mut block, entry.block_offset as u64) {
                Ok(()) => {
                    let payload = block.split_off(BlockHeader::SIZE);
                    results.push(payload);
                }
                Err(e) => {
                    warn!(
                        object_id,
                        offset = entry.block_offset,
                        error = %e,
                        "failed to read block, skipping"
                    );
                }
            }
        }

        Ok(results)
    }

    /// Union of device ids present in any partition index under the
    /// current storage path. Missing partitions or files are empty.
    pub fn all_object_ids(&self) -> Result<BTreeSet<u32>> {
        let base = self.current_path()?;
        let mut ids = BTreeSet::new();

        for p in 0..self.shared.opts.num_partitions {
            let dir = base.join(format!("partition_{p}"));
            if !dir.exists() {
                continue;
            }
            match index::read_index(&dir.join("index.json")) {
                Ok(entries) => ids.extend(entries.iter().map(|e| e.device_id)),
                Err(e) => warn!(partition = p, error = %e, "skipping unreadable index"),
            }
        }

        Ok(ids)
    }

    /// Sync and unmap every tracked data file. Idempotent; partitions
    /// re-open their files lazily if used again.
    pub fn close(&self) -> Result<()> {
        let partitions: Vec<Arc<Partition>> =
            self.shared.partitions.lock().values().cloned().collect();

        let mut first_err = None;
        for partition in partitions {
            let mut inner = partition.inner.write();
            if let Some(data) = inner.data.take() {
                if let Err(e) = data.close() {
                    warn!(path = %data.path().display(), error = %e, "failed to close data file");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Aggregate view of the partitions this process has touched
    pub fn stats(&self) -> StorageStats {
        let partitions: Vec<Arc<Partition>> =
            self.shared.partitions.lock().values().cloned().collect();

        let mut stats = StorageStats {
            partitions: partitions.len(),
            open_files: 0,
            blocks: 0,
        };
        for partition in partitions {
            let inner = partition.inner.read();
            if inner.data.is_some() {
                stats.open_files += 1;
            }
            stats.blocks += inner.entries.len();
        }
        stats
    }

    fn current_path(&self) -> Result<PathBuf> {
        self.storage_path
            .read()
            .clone()
            .ok_or(Error::StoragePathNotSet)
    }

    fn partition(&self, base: &Path, object_id: u32) -> Arc<Partition> {
        let p = object_id as usize % self.shared.opts.num_partitions;
        let dir = base.join(format!("partition_{p}"));

        let mut partitions = self.shared.partitions.lock();
        partitions
            .entry(dir.clone())
            .or_insert_with(|| Arc::new(Partition::open(dir, self.shared.opts.block_size)))
            .clone()
    }
}

impl Clone for StorageEngine {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            storage_path: RwLock::new(self.storage_path.read().clone()),
        }
    }
}

impl Partition {
    /// Load a partition's index and recover allocation state.
    ///
    /// The tail is seeded past the highest indexed block. For every entry
    /// still marked open, the block header decides whether appends may
    /// continue: numeric blocks resume at `record_count x 12` bytes used;
    /// string blocks are variable-length, so a restart always starts them
    /// a fresh block.
    fn open(dir: PathBuf, block_size: usize) -> Self {
        let entries = match index::read_index(&dir.join("index.json")) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "unreadable index, starting empty");
                Vec::new()
            }
        };

        let tail = entries
            .iter()
            .map(|e| e.block_offset + block_size as i64)
            .max()
            .unwrap_or(0);

        let mut inner = PartitionInner {
            data: None,
            entries,
            alloc: HashMap::new(),
            tail,
        };

        let data_path = dir.join("data.bin");
        if data_path.exists() {
            match open_data_file(&data_path, block_size) {
                Ok(file) => {
                    recover_allocations(&file, &mut inner);
                    inner.data = Some(Arc::new(file));
                }
                Err(e) => {
                    warn!(path = %data_path.display(), error = %e, "failed to map data file");
                }
            }
        }

        debug!(
            dir = %dir.display(),
            blocks = inner.entries.len(),
            tail = inner.tail,
            "opened partition"
        );

        Self {
            dir,
            inner: RwLock::new(inner),
        }
    }
}

fn recover_allocations(data: &MappedFile, inner: &mut PartitionInner) {
    for entry in &inner.entries {
        if entry.current_offset == 0 {
            continue;
        }

        let mut buf = [0u8; BlockHeader::SIZE];
        if let Err(e) = data.read_at(&mut buf, entry.block_offset as u64) {
            warn!(offset = entry.block_offset, error = %e, "cannot read open block header");
            continue;
        }
        let header = match BlockHeader::from_bytes(&buf) {
            Ok(header) => header,
            Err(e) => {
                warn!(offset = entry.block_offset, error = %e, "bad open block header");
                continue;
            }
        };

        match ValueType::from_tag(header.data_type) {
            Some(ValueType::Int) | Some(ValueType::Float) => {
                inner.alloc.insert(
                    entry.device_id,
                    ObjectAlloc {
                        current_block: Some(entry.block_offset),
                        usage: header.record_count as usize * NUMERIC_RECORD_SIZE,
                    },
                );
            }
            Some(ValueType::Str) => {
                // Variable-length records: the usage estimate is not
                // trustworthy, leave the block sealed.
            }
            None => {
                warn!(
                    offset = entry.block_offset,
                    tag = header.data_type,
                    "unknown data type tag in open block"
                );
            }
        }
    }
}

fn open_data_file(path: &Path, block_size: usize) -> Result<MappedFile> {
    let mut initial = block_size * defaults::INITIAL_MAP_BLOCKS;
    if let Ok(meta) = std::fs::metadata(path) {
        let size = meta.len() as usize;
        if size > initial {
            initial = size + block_size * defaults::INITIAL_MAP_BLOCKS;
        }
    }
    MappedFile::open(path, initial)
}

fn record_timestamp(record: &[u8]) -> Timestamp {
    match record.get(..4) {
        Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        None => 0,
    }
}
