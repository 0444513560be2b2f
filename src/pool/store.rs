//! Locked mutable state of a pool: the mapping, the frame log, and the
//! in-process index over it
//!
//! All methods assume the caller holds the advisory file lock. The index
//! is a cache: whenever the header generation diverges from the cached
//! one, another attached process has mutated the log and the store
//! rescans before serving the operation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{MventError, Result};
use crate::lock::FileLock;

use super::layout::{
    self,
    constants::{FRAME_FIXED_SIZE, HEADER_SIZE, MAX_KEY_LEN},
    FrameKind, PoolHeader,
};

/// Metadata of a live entry, returned beside the value bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    /// Wall-clock UNIX epoch nanoseconds at creation
    pub created_ns: u64,
    /// TTL in nanoseconds; 0 means never expires
    pub ttl_ns: u64,
    /// Version counter, strictly increasing per key
    pub version: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    offset: usize,
    value_offset: usize,
    value_len: usize,
    total_len: usize,
    created_ns: u64,
    ttl_ns: u64,
    version: u64,
}

impl IndexEntry {
    fn expired(&self, now_ns: u64) -> bool {
        self.ttl_ns != 0 && now_ns.saturating_sub(self.created_ns) >= self.ttl_ns
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta {
            created_ns: self.created_ns,
            ttl_ns: self.ttl_ns,
            version: self.version,
        }
    }
}

/// Mutable pool state guarded by the in-process mutex and the file lock
pub(crate) struct PoolStore {
    file: File,
    mmap: MmapMut,
    capacity: u64,
    cursor: u64,
    generation: u64,
    /// Live frames by key
    index: HashMap<String, IndexEntry>,
    /// Latest version per key seen in the log, tombstones included
    versions: HashMap<String, u64>,
    /// Bytes of superseded and tombstone frames, for the compaction trigger
    dead_bytes: u64,
}

impl PoolStore {
    /// Open or create the backing file and build the initial index
    ///
    /// Initialization happens under the file lock so concurrent attachers
    /// race-freely agree on the first header.
    pub fn open(
        path: &Path,
        requested_capacity: usize,
        lock_timeout: Option<std::time::Duration>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MventError::from_io(e, "failed to create pool directory"))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| MventError::from_io(e, "failed to create/open pool file"))?;

        let _guard = FileLock::new(file.as_raw_fd(), lock_timeout).acquire()?;

        let len = file
            .metadata()
            .map_err(|e| MventError::from_io(e, "failed to stat pool file"))?
            .len();

        if len < HEADER_SIZE as u64 {
            // Fresh file: size it and lay down the header
            file.set_len(requested_capacity as u64)
                .map_err(|e| MventError::from_io(e, "failed to size pool file"))?;

            // Safety: the mapping is private to this store; concurrent
            // processes coordinate through the advisory file lock.
            let mut mmap = unsafe {
                MmapOptions::new()
                    .len(requested_capacity)
                    .map_mut(&file)
                    .map_err(|e| MventError::from_io(e, "failed to map pool file"))?
            };
            let header = PoolHeader::new(requested_capacity as u64);
            header.encode(&mut mmap[..HEADER_SIZE]);

            return Ok(Self {
                file,
                mmap,
                capacity: header.capacity,
                cursor: header.cursor,
                generation: header.generation,
                index: HashMap::new(),
                versions: HashMap::new(),
                dead_bytes: 0,
            });
        }

        // Existing file: its recorded capacity wins over the requested one
        // Safety: see above.
        let mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(&file)
                .map_err(|e| MventError::from_io(e, "failed to map pool file"))?
        };
        let header = PoolHeader::decode(&mmap[..HEADER_SIZE.min(mmap.len())])?;
        if header.capacity > len {
            return Err(MventError::corrupt("recorded capacity exceeds file size"));
        }

        let mut store = Self {
            file,
            mmap,
            capacity: header.capacity,
            cursor: header.cursor,
            // Force the initial rescan
            generation: header.generation.wrapping_add(1),
            index: HashMap::new(),
            versions: HashMap::new(),
            dead_bytes: 0,
        };
        store.sync()?;
        Ok(store)
    }

    /// Raw descriptor of the backing file, for the advisory lock
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Recorded capacity of the pool
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Re-read the header and rebuild the index if another attached
    /// process has mutated the log
    pub fn sync(&mut self) -> Result<()> {
        let header = PoolHeader::decode(&self.mmap[..HEADER_SIZE])?;
        if header.generation == self.generation {
            return Ok(());
        }

        self.index.clear();
        self.versions.clear();
        self.dead_bytes = 0;

        let cursor = header.cursor as usize;
        let log = &self.mmap[..cursor];
        let mut offset = HEADER_SIZE;
        while offset < cursor {
            let frame = layout::read_frame(log, offset)?;
            self.versions.insert(frame.key.clone(), frame.version);
            match frame.kind {
                FrameKind::Live => {
                    let entry = IndexEntry {
                        offset,
                        value_offset: frame.value_offset,
                        value_len: frame.value_len,
                        total_len: frame.total_len,
                        created_ns: frame.created_ns,
                        ttl_ns: frame.ttl_ns,
                        version: frame.version,
                    };
                    if let Some(old) = self.index.insert(frame.key, entry) {
                        self.dead_bytes += old.total_len as u64;
                    }
                }
                FrameKind::Tomb => {
                    if let Some(old) = self.index.remove(&frame.key) {
                        self.dead_bytes += old.total_len as u64;
                    }
                    self.dead_bytes += frame.total_len as u64;
                }
            }
            offset += frame.total_len;
        }

        self.capacity = header.capacity;
        self.cursor = header.cursor;
        self.generation = header.generation;
        Ok(())
    }

    fn write_header(&mut self) {
        let header = PoolHeader {
            capacity: self.capacity,
            cursor: self.cursor,
            entry_count: self.index.len() as u32,
            generation: self.generation,
        };
        header.encode(&mut self.mmap[..HEADER_SIZE]);
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.write_header();
    }

    fn free_bytes(&self) -> u64 {
        self.capacity - self.cursor
    }

    fn log_bytes(&self) -> u64 {
        self.cursor - HEADER_SIZE as u64
    }

    /// Store a value, returning the version assigned to it
    pub fn set(&mut self, key: &str, value: &[u8], ttl_ns: u64, now_ns: u64) -> Result<u64> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(MventError::invalid_parameter(
                "key",
                format!("key length must be 1..={} bytes", MAX_KEY_LEN),
            ));
        }

        let needed = layout::frame_len(key.len(), value.len());

        // Tombstone density trigger
        if self.dead_bytes * 2 > self.log_bytes() {
            self.compact(now_ns)?;
        }
        if self.cursor + needed as u64 > self.capacity {
            self.compact(now_ns)?;
        }
        if self.cursor + needed as u64 > self.capacity {
            return Err(MventError::full(needed, self.free_bytes() as usize));
        }

        let version = self.versions.get(key).copied().unwrap_or(0) + 1;
        let offset = self.cursor as usize;
        let total = layout::write_frame(
            &mut self.mmap,
            offset,
            FrameKind::Live,
            key,
            now_ns,
            ttl_ns,
            version,
            value,
        );

        let entry = IndexEntry {
            offset,
            value_offset: offset + FRAME_FIXED_SIZE + key.len(),
            value_len: value.len(),
            total_len: total,
            created_ns: now_ns,
            ttl_ns,
            version,
        };
        if let Some(old) = self.index.insert(key.to_string(), entry) {
            self.dead_bytes += old.total_len as u64;
        }
        self.versions.insert(key.to_string(), version);
        self.cursor += total as u64;
        self.bump();
        Ok(version)
    }

    /// Copy out the value bytes and metadata of a live, unexpired entry
    pub fn get(&self, key: &str, now_ns: u64) -> Option<(Vec<u8>, EntryMeta)> {
        let entry = self.index.get(key)?;
        if entry.expired(now_ns) {
            return None;
        }
        let bytes = self.mmap[entry.value_offset..entry.value_offset + entry.value_len].to_vec();
        Some((bytes, entry.meta()))
    }

    /// Remove an entry; true iff a live entry was present
    pub fn delete(&mut self, key: &str, now_ns: u64) -> Result<bool> {
        match self.index.get(key) {
            None => Ok(false),
            Some(entry) if entry.expired(now_ns) => Ok(false),
            Some(_) => {
                self.tombstone(key, now_ns)?;
                self.bump();
                Ok(true)
            }
        }
    }

    /// Remove all entries
    pub fn clear(&mut self) {
        self.index.clear();
        self.versions.clear();
        self.dead_bytes = 0;
        self.cursor = HEADER_SIZE as u64;
        self.bump();
    }

    /// Tombstone every expired entry; returns the number swept
    pub fn sweep(&mut self, now_ns: u64) -> Result<usize> {
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|(_, e)| e.expired(now_ns))
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        for key in &expired {
            // A compaction along the way may already have reaped it
            if self.index.contains_key(key) {
                self.tombstone(key, now_ns)?;
            }
        }
        self.bump();
        Ok(expired.len())
    }

    /// Append a tombstone for `key`, falling back to compaction when the
    /// log has no room for one (compaction drops the key outright)
    fn tombstone(&mut self, key: &str, now_ns: u64) -> Result<()> {
        let tomb_len = layout::frame_len(key.len(), 0);
        if self.cursor + tomb_len as u64 > self.capacity {
            if self.index.remove(key).is_some() {
                self.compact_retained(now_ns)?;
            }
            return Ok(());
        }

        let version = self.versions.get(key).copied().unwrap_or(0) + 1;
        let offset = self.cursor as usize;
        let total = layout::write_frame(
            &mut self.mmap,
            offset,
            FrameKind::Tomb,
            key,
            now_ns,
            0,
            version,
            &[],
        );
        if let Some(old) = self.index.remove(key) {
            self.dead_bytes += old.total_len as u64;
        }
        self.versions.insert(key.to_string(), version);
        self.dead_bytes += total as u64;
        self.cursor += total as u64;
        Ok(())
    }

    /// Rewrite the log keeping only the latest live, unexpired frame per key
    pub fn compact(&mut self, now_ns: u64) -> Result<()> {
        self.index.retain(|_, e| !e.expired(now_ns));
        self.compact_retained(now_ns)
    }

    fn compact_retained(&mut self, _now_ns: u64) -> Result<()> {
        let mut survivors: Vec<(String, IndexEntry)> = self
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        survivors.sort_by_key(|(_, e)| e.offset);

        // Frames carry no internal offsets, so surviving bytes move verbatim
        let mut rewritten = Vec::with_capacity(self.log_bytes() as usize);
        let mut new_index = HashMap::with_capacity(survivors.len());
        for (key, entry) in survivors {
            let new_offset = HEADER_SIZE + rewritten.len();
            rewritten.extend_from_slice(&self.mmap[entry.offset..entry.offset + entry.total_len]);
            let key_len = key.len();
            new_index.insert(
                key,
                IndexEntry {
                    offset: new_offset,
                    value_offset: new_offset + FRAME_FIXED_SIZE + key_len,
                    ..entry
                },
            );
        }

        self.mmap[HEADER_SIZE..HEADER_SIZE + rewritten.len()].copy_from_slice(&rewritten);
        self.cursor = (HEADER_SIZE + rewritten.len()) as u64;
        self.index = new_index;
        // Dropped tombstones end the version lineage of their keys
        self.versions = self
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.version))
            .collect();
        self.dead_bytes = 0;
        self.bump();
        Ok(())
    }

    /// Cheap map of live, unexpired keys to their versions
    pub fn snapshot(&self, now_ns: u64) -> HashMap<String, u64> {
        self.index
            .iter()
            .filter(|(_, e)| !e.expired(now_ns))
            .map(|(k, e)| (k.clone(), e.version))
            .collect()
    }

    /// (entry_count, bytes_used, bytes_free)
    pub fn stats(&self) -> (usize, u64, u64) {
        (self.index.len(), self.log_bytes(), self.free_bytes())
    }
}

impl std::fmt::Debug for PoolStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolStore")
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .field("generation", &self.generation)
            .field("entries", &self.index.len())
            .field("dead_bytes", &self.dead_bytes)
            .finish()
    }
}
