//! Resizable memory-mapped file

use crate::{Error, Result};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// A growable file with a shared read/write memory mapping.
///
/// All access goes through a reader-writer lock: `read_at` takes a shared
/// lock, `write_at`, `grow`, `sync` and `close` take the exclusive lock.
/// Callers never retain slices into the mapping, so a grow (which unmaps,
/// truncates and re-maps) invalidates nothing.
pub struct MappedFile {
    path: PathBuf,
    inner: RwLock<MappedInner>,
}

struct MappedInner {
    file: File,
    map: Option<MmapMut>,
    size: usize,
}

impl MappedFile {
    /// Open (creating if missing) and map a file.
    ///
    /// If the file is smaller than `initial_size` it is truncated up to
    /// that size before mapping.
    pub fn open(path: impl AsRef<Path>, initial_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut size = file.metadata()?.len() as usize;
        if size < initial_size {
            file.set_len(initial_size as u64)?;
            size = initial_size;
        }

        // SAFETY: the file is open read/write and set_len above guarantees
        // the mapping range is fully allocated.
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            path,
            inner: RwLock::new(MappedInner {
                file,
                map: Some(map),
                size,
            }),
        })
    }

    /// Current mapped size in bytes
    pub fn len(&self) -> usize {
        self.inner.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File path backing this mapping
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy `buf.len()` bytes at `offset` out of the mapping
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let inner = self.inner.read();
        let map = inner.map.as_ref().ok_or(Error::FileClosed)?;

        let end = offset as usize + buf.len();
        if end > inner.size {
            return Err(Error::OutOfRange {
                offset,
                len: buf.len(),
                size: inner.size,
            });
        }

        buf.copy_from_slice(&map[offset as usize..end]);
        Ok(())
    }

    /// Blit `data` into the mapping at `offset`.
    ///
    /// Visibility to other processes is only guaranteed after a later
    /// `sync`; readers in this process observe the write immediately.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let size = inner.size;
        let map = inner.map.as_mut().ok_or(Error::FileClosed)?;

        let end = offset as usize + data.len();
        if end > size {
            return Err(Error::OutOfRange {
                offset,
                len: data.len(),
                size,
            });
        }

        map[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    /// Grow the mapping to hold at least `new_size` bytes, rounded up to a
    /// multiple of `block_size`. A no-op when already large enough.
    pub fn grow(&self, new_size: usize, block_size: usize) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.map.is_none() {
            return Err(Error::FileClosed);
        }

        let rounded = new_size.div_ceil(block_size) * block_size;
        if rounded <= inner.size {
            return Ok(());
        }

        // Flush and drop the current mapping before extending the file.
        if let Some(map) = inner.map.take() {
            map.flush()?;
        }
        inner.file.set_len(rounded as u64)?;

        // SAFETY: set_len above allocated the full range.
        inner.map = Some(unsafe { MmapMut::map_mut(&inner.file)? });
        inner.size = rounded;
        Ok(())
    }

    /// Flush the mapping to stable storage synchronously
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        let map = inner.map.as_ref().ok_or(Error::FileClosed)?;
        map.flush()?;
        Ok(())
    }

    /// Sync and unmap. Idempotent; later reads and writes fail.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(map) = inner.map.take() {
            map.flush()?;
        }
        Ok(())
    }
}
