use std::collections::HashMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use memmap2::MmapMut;
use tracing::{debug, info, instrument, warn};

use super::StorageEngine;
use crate::error::{KvdError, Result};
use crate::protocol::{ErrorCode, MAX_WIRE_STRING};

// name of the container inside the mapped segment, written into the header
// and checked when an existing file is reopened
const SEGMENT_TAG: &[u8; 16] = b"DATABASE_NAME\0\0\0";

// name of the machine-wide mutex serialising access across processes
const MUTEX_NAME: &str = "DATABASE_MUTEX";

const FORMAT_VERSION: u32 = 1;

// header layout: tag, version, reserved, generation, item count, used watermark
const TAG_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 16;
const GENERATION_OFFSET: usize = 24;
const ITEM_COUNT_OFFSET: usize = 32;
const USED_OFFSET: usize = 40;
const HEADER_LEN: usize = 64;

// record layout: flags u8, key_len u16 LE, value_len u32 LE, key, value
const RECORD_HEADER_LEN: usize = 7;
const FLAG_DEAD: u8 = 0;
const FLAG_LIVE: u8 = 1;

// the storage file starts at one segment page and doubles as it fills
const SEGMENT_PAGE: u64 = 4096;

/// The primary storage engine: a key/value index persisted in a
/// memory-mapped file.
///
/// The file holds a fixed header followed by append-only records; updates and
/// deletes tombstone the superseded record. An in-memory map indexes the live
/// records. The file is created on first open, reopened afterwards, and never
/// truncated; it grows by remapping when an append does not fit.
///
/// Every operation runs under a machine-wide named mutex, so any number of
/// threads and processes sharing the same storage file observe a consistent
/// view: the header carries a generation counter, and a handle whose index is
/// behind the mapped generation rescans the segment before acting.
///
/// `MappedStore` is a cheap-to-clone handle; the server opens one store and
/// hands clones to its worker pool.
#[derive(Clone, Debug)]
pub struct MappedStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MappedStore {
    /// opens the store backed by the file at `path`, creating the file (and
    /// any missing parent directories) on first use
    #[instrument]
    pub fn open<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<MappedStore> {
        let inner = StoreInner::open(path.as_ref())?;
        Ok(MappedStore {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// runs `f` with the store's state while holding both the handle lock and
    /// the cross-process named mutex, after syncing the view of the segment
    fn with_store<T>(&self, f: impl FnOnce(&mut StoreInner) -> Result<T>) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| KvdError::Locking("storage handle mutex is poisoned".to_string()))?;
        let _guard = inner.mutex.acquire()?;
        inner.sync_view()?;
        f(&mut *inner)
    }
}

impl StorageEngine for MappedStore {
    fn ins(&self, key: &str, value: &str) -> Result<ErrorCode> {
        self.with_store(|store| store.ins(key, value))
    }

    fn upd(&self, key: &str, value: &str) -> Result<ErrorCode> {
        self.with_store(|store| store.upd(key, value))
    }

    fn del(&self, key: &str) -> Result<ErrorCode> {
        self.with_store(|store| store.del(key))
    }

    fn get(&self, key: &str) -> Result<(ErrorCode, String)> {
        self.with_store(|store| store.get(key))
    }

    fn size(&self) -> Result<u64> {
        self.with_store(|store| Ok(store.item_count))
    }
}

/// position of a live record within the mapped segment
#[derive(Debug, Clone, Copy)]
struct RecordPos {
    offset: usize,
    key_len: usize,
    value_len: usize,
}

#[derive(Debug)]
struct StoreInner {
    path: PathBuf,
    file: File,
    map: MmapMut,
    // maps keys to the position of their live record
    index: HashMap<String, RecordPos>,
    // the segment generation the index reflects
    generation: u64,
    item_count: u64,
    // offset of the first free byte in the segment
    used: u64,
    mutex: NamedMutex,
}

impl StoreInner {
    fn open(path: &Path) -> Result<StoreInner> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(SEGMENT_PAGE)?;
        } else if len < HEADER_LEN as u64 {
            return Err(KvdError::Storage(format!(
                "storage file {} is truncated ({} bytes)",
                path.display(),
                len
            )));
        }

        // SAFETY: the segment is only written through this mapping, and only
        // while the named mutex is held
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        let mutex = NamedMutex::open_or_create(MUTEX_NAME)?;
        let _guard = mutex.acquire()?;

        // find-or-create the container inside the segment
        if map[TAG_OFFSET..TAG_OFFSET + SEGMENT_TAG.len()] == [0u8; 16] {
            info!("initializing new storage segment at {}", path.display());
            map[TAG_OFFSET..TAG_OFFSET + SEGMENT_TAG.len()].copy_from_slice(SEGMENT_TAG);
            map[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            write_u64(&mut map, GENERATION_OFFSET, 1);
            write_u64(&mut map, ITEM_COUNT_OFFSET, 0);
            write_u64(&mut map, USED_OFFSET, HEADER_LEN as u64);
            map.flush_range(0, HEADER_LEN)?;
        } else if map[TAG_OFFSET..TAG_OFFSET + SEGMENT_TAG.len()] != SEGMENT_TAG[..] {
            return Err(KvdError::Storage(format!(
                "{} is not a recognized storage file",
                path.display()
            )));
        } else {
            let mut version = [0u8; 4];
            version.copy_from_slice(&map[VERSION_OFFSET..VERSION_OFFSET + 4]);
            let version = u32::from_le_bytes(version);
            if version != FORMAT_VERSION {
                return Err(KvdError::Storage(format!(
                    "unsupported storage format version: {}",
                    version
                )));
            }
        }

        let generation = read_u64(&map, GENERATION_OFFSET);
        let item_count = read_u64(&map, ITEM_COUNT_OFFSET);
        let used = read_u64(&map, USED_OFFSET);
        let index = scan_records(&map, used)?;
        debug!(
            generation,
            item_count,
            used,
            "opened storage segment"
        );

        Ok(StoreInner {
            path: path.to_path_buf(),
            file,
            map,
            index,
            generation,
            item_count,
            used,
            mutex,
        })
    }

    /// brings this handle's view of the segment up to date. Must be called
    /// with the named mutex held, before any read or write of the segment.
    fn sync_view(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        if file_len as usize > self.map.len() {
            // another process grew the segment
            // SAFETY: same mapping discipline as in open()
            self.map = unsafe { MmapMut::map_mut(&self.file)? };
        }

        let generation = read_u64(&self.map, GENERATION_OFFSET);
        if generation != self.generation {
            debug!(
                from = self.generation,
                to = generation,
                "segment generation moved, rebuilding index"
            );
            self.used = read_u64(&self.map, USED_OFFSET);
            self.item_count = read_u64(&self.map, ITEM_COUNT_OFFSET);
            self.index = scan_records(&self.map, self.used)?;
            self.generation = generation;
        }
        Ok(())
    }

    fn ins(&mut self, key: &str, value: &str) -> Result<ErrorCode> {
        if let Some(code) = refuse_unstorable(key, value) {
            return Ok(code);
        }
        if self.index.contains_key(key) {
            return Ok(ErrorCode::InsertKeyAlreadyExists);
        }

        let pos = self.append_record(key, value)?;
        self.index.insert(key.to_string(), pos);
        self.item_count += 1;
        self.publish()?;
        Ok(ErrorCode::None)
    }

    fn upd(&mut self, key: &str, value: &str) -> Result<ErrorCode> {
        if let Some(code) = refuse_unstorable(key, value) {
            return Ok(code);
        }
        let old = match self.index.get(key) {
            Some(&pos) => pos,
            None => return Ok(ErrorCode::UpdateKeyNotFound),
        };
        if self.value_at(&old) == value.as_bytes() {
            return Ok(ErrorCode::UpdateValueAlreadyExists);
        }

        let pos = self.append_record(key, value)?;
        self.publish()?;
        self.tombstone(old.offset)?;
        self.index.insert(key.to_string(), pos);
        Ok(ErrorCode::None)
    }

    fn del(&mut self, key: &str) -> Result<ErrorCode> {
        let pos = match self.index.remove(key) {
            Some(pos) => pos,
            None => return Ok(ErrorCode::DeleteKeyNotFound),
        };

        self.tombstone(pos.offset)?;
        self.item_count = self.item_count.saturating_sub(1);
        self.publish()?;
        Ok(ErrorCode::None)
    }

    fn get(&mut self, key: &str) -> Result<(ErrorCode, String)> {
        match self.index.get(key) {
            Some(&pos) => {
                let value = String::from_utf8(self.value_at(&pos).to_vec())?;
                Ok((ErrorCode::None, value))
            }
            None => Ok((ErrorCode::GetKeyNotFound, String::new())),
        }
    }

    fn value_at(&self, pos: &RecordPos) -> &[u8] {
        let start = pos.offset + RECORD_HEADER_LEN + pos.key_len;
        &self.map[start..start + pos.value_len]
    }

    /// writes a live record for (key, value) at the used watermark, growing
    /// the segment if it does not fit
    fn append_record(&mut self, key: &str, value: &str) -> Result<RecordPos> {
        let record_len = RECORD_HEADER_LEN + key.len() + value.len();
        let required = self.used + record_len as u64;
        if required > self.map.len() as u64 {
            self.grow(required)?;
        }

        let offset = self.used as usize;
        self.map[offset] = FLAG_LIVE;
        self.map[offset + 1..offset + 3].copy_from_slice(&(key.len() as u16).to_le_bytes());
        self.map[offset + 3..offset + 7].copy_from_slice(&(value.len() as u32).to_le_bytes());
        let key_start = offset + RECORD_HEADER_LEN;
        self.map[key_start..key_start + key.len()].copy_from_slice(key.as_bytes());
        let value_start = key_start + key.len();
        self.map[value_start..value_start + value.len()].copy_from_slice(value.as_bytes());
        self.map.flush_range(offset, record_len)?;

        self.used += record_len as u64;
        Ok(RecordPos {
            offset,
            key_len: key.len(),
            value_len: value.len(),
        })
    }

    /// doubles the segment until `required` bytes fit, then remaps
    fn grow(&mut self, required: u64) -> Result<()> {
        let mut new_len = (self.map.len() as u64).max(SEGMENT_PAGE);
        while new_len < required {
            new_len *= 2;
        }
        debug!(new_len, "growing storage segment");
        self.file.set_len(new_len)?;
        // SAFETY: same mapping discipline as in open()
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    fn tombstone(&mut self, offset: usize) -> Result<()> {
        self.map[offset] = FLAG_DEAD;
        self.map.flush_range(offset, 1)?;
        Ok(())
    }

    /// bumps the generation and writes the header back, making this
    /// operation's effects visible to other handles
    fn publish(&mut self) -> Result<()> {
        self.generation += 1;
        write_u64(&mut self.map, GENERATION_OFFSET, self.generation);
        write_u64(&mut self.map, ITEM_COUNT_OFFSET, self.item_count);
        write_u64(&mut self.map, USED_OFFSET, self.used);
        self.map.flush_range(0, HEADER_LEN)?;
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        debug!("closing storage segment at {}", self.path.display());
        if let Err(e) = self.map.flush() {
            warn!("could not flush storage segment on close: {}", e);
        }
    }
}

/// refuses keys and values the wire codec cannot round-trip
fn refuse_unstorable(key: &str, value: &str) -> Option<ErrorCode> {
    if key.len() > MAX_WIRE_STRING {
        return Some(ErrorCode::InvalidKeyLength);
    }
    if value.len() > MAX_WIRE_STRING {
        return Some(ErrorCode::InvalidValueLength);
    }
    None
}

/// walks the records between the header and the used watermark and builds the
/// index of live records. A later live record for a key supersedes an earlier
/// one, which covers the window where an update has appended but not yet
/// tombstoned.
fn scan_records(map: &MmapMut, used: u64) -> Result<HashMap<String, RecordPos>> {
    let used = used as usize;
    if used < HEADER_LEN || used > map.len() {
        return Err(KvdError::Storage(format!(
            "used watermark {} is outside the segment",
            used
        )));
    }

    let mut index = HashMap::new();
    let mut offset = HEADER_LEN;
    while offset < used {
        if offset + RECORD_HEADER_LEN > used {
            return Err(KvdError::Storage(format!(
                "record header at {} runs past the used watermark",
                offset
            )));
        }
        let flags = map[offset];
        let mut key_len = [0u8; 2];
        key_len.copy_from_slice(&map[offset + 1..offset + 3]);
        let key_len = u16::from_le_bytes(key_len) as usize;
        let mut value_len = [0u8; 4];
        value_len.copy_from_slice(&map[offset + 3..offset + 7]);
        let value_len = u32::from_le_bytes(value_len) as usize;

        let end = offset + RECORD_HEADER_LEN + key_len + value_len;
        if end > used {
            return Err(KvdError::Storage(format!(
                "record at {} runs past the used watermark",
                offset
            )));
        }

        if flags == FLAG_LIVE {
            let key_start = offset + RECORD_HEADER_LEN;
            let key = String::from_utf8(map[key_start..key_start + key_len].to_vec())?;
            index.insert(
                key,
                RecordPos {
                    offset,
                    key_len,
                    value_len,
                },
            );
        }
        offset = end;
    }
    Ok(index)
}

fn read_u64(map: &MmapMut, offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&map[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(map: &mut MmapMut, offset: usize, value: u64) {
    map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// A machine-wide mutex identified by a string name, usable by cooperating
/// processes. Realised as an exclusive advisory lock on a file in the system
/// temp directory; the lock is released on every exit path by the guard.
///
/// The advisory lock contends on the lock file's inode, so the file must stay
/// linked for as long as any handle in any process holds it. Handles to one
/// path are reference-counted process-wide and the file is unlinked only when
/// the process closes its last handle; an unlink while other handles are live
/// would leave them locking an orphaned inode, excluded from nothing.
#[derive(Debug)]
struct NamedMutex {
    path: PathBuf,
    file: Arc<File>,
}

/// process-wide count of open [`NamedMutex`] handles per lock-file path
static LOCK_REGISTRY: OnceLock<Mutex<HashMap<PathBuf, usize>>> = OnceLock::new();

fn lock_registry() -> &'static Mutex<HashMap<PathBuf, usize>> {
    LOCK_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl NamedMutex {
    fn open_or_create(name: &str) -> Result<NamedMutex> {
        let path = env::temp_dir().join(name);
        // the file is opened with the registry held, so a concurrent drop of
        // the process's last other handle cannot unlink it in between
        let mut registry = lock_registry()
            .lock()
            .map_err(|_| KvdError::Locking("named mutex registry is poisoned".to_string()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        *registry.entry(path.clone()).or_insert(0) += 1;
        Ok(NamedMutex {
            path,
            file: Arc::new(file),
        })
    }

    /// blocks until the lock is granted
    fn acquire(&self) -> Result<NamedMutexGuard> {
        self.file
            .lock()
            .map_err(|e| KvdError::Locking(format!("could not take {}: {}", MUTEX_NAME, e)))?;
        Ok(NamedMutexGuard {
            file: Arc::clone(&self.file),
        })
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        if let Ok(mut registry) = lock_registry().lock() {
            if let Some(count) = registry.get_mut(&self.path) {
                *count -= 1;
                if *count == 0 {
                    registry.remove(&self.path);
                    let _ = fs::remove_file(&self.path);
                }
            }
        }
    }
}

struct NamedMutexGuard {
    file: Arc<File>,
}

impl Drop for NamedMutexGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
