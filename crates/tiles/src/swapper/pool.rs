//! Growable per-size backing files and their free lists.
//!
//! Every tile byte size gets its own chain of files. Slots are page-aligned
//! ranges handed out by growing the newest file with `set_len` until it
//! reaches the per-file cap, after which the next file is started. Slots of
//! destroyed tiles go to the size's free list and are handed out again
//! before any file grows.
//!
//! The pool lock only covers slot bookkeeping. Files are created outside
//! it, and growth is serialized by a lock on each file.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::SwapError;

/// Alignment of every slot within a backing file
pub const SLOT_ALIGNMENT: u64 = 4096;

static NEXT_POOL_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// One private scratch file holding slots of a single byte size.
///
/// The file is removed from disk when the last reference goes away.
pub struct SwapFile {
    id: u64,
    path: PathBuf,
    file: File,
    slot_len: usize,
    /// Current length on disk
    len: Mutex<u64>,
}

impl SwapFile {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Byte size of the tiles stored in this file
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Extends the file to at least `size` bytes. Never shrinks it.
    fn grow_to(&self, size: u64) -> Result<(), SwapError> {
        let mut len = self.len.lock();
        if *len < size {
            self.file.set_len(size).map_err(|source| SwapError::Grow {
                path: self.path.clone(),
                size,
                source,
            })?;
            *len = size;
        }
        Ok(())
    }
}

impl fmt::Debug for SwapFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("slot_len", &self.slot_len)
            .finish()
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                file = self.id,
                path = %self.path.display(),
                error = %e,
                "Failed to remove swap file"
            );
        }
    }
}

/// A reserved byte range inside a backing file.
#[derive(Debug, Clone)]
pub struct SwapSlot {
    file: Arc<SwapFile>,
    offset: u64,
    len: usize,
}

impl SwapSlot {
    pub fn file(&self) -> &Arc<SwapFile> {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl PartialEq for SwapSlot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.file, &other.file) && self.offset == other.offset
    }
}

impl Eq for SwapSlot {}

#[derive(Debug, Default)]
struct SizeClass {
    files: Vec<Arc<SwapFile>>,
    /// Bytes handed out from the newest file
    used: u64,
    /// Bytes handed out across all files
    allocated: u64,
    free: Vec<SwapSlot>,
}

impl SizeClass {
    /// Claims the next `stride` bytes of the newest file if they fit.
    fn claim(&mut self, stride: u64, max_file_size: u64) -> Option<(Arc<SwapFile>, u64)> {
        let file = self.files.last()?;
        if self.used + stride > max_file_size {
            return None;
        }
        let claimed = (Arc::clone(file), self.used);
        self.used += stride;
        self.allocated += stride;
        Some(claimed)
    }

    /// Makes `file` the newest file and claims its first slot.
    fn start_file(&mut self, file: Arc<SwapFile>, stride: u64) -> (Arc<SwapFile>, u64) {
        self.files.push(Arc::clone(&file));
        self.used = stride;
        self.allocated += stride;
        (file, 0)
    }
}

/// Where a reservation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reservation {
    Reused,
    Grown,
}

/// All backing files of one swapper.
#[derive(Debug)]
pub(crate) struct SwapFilePool {
    dir: PathBuf,
    max_file_size: u64,
    instance: u64,
    next_file_id: AtomicU64,
    classes: Mutex<HashMap<usize, SizeClass>>,
}

impl SwapFilePool {
    pub(crate) fn new(dir: PathBuf, max_file_size: u64) -> Self {
        Self {
            dir,
            max_file_size,
            instance: NEXT_POOL_INSTANCE.fetch_add(1, Ordering::Relaxed),
            next_file_id: AtomicU64::new(0),
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Hands out a slot for a tile of `len` bytes, preferring the free list.
    ///
    /// The offset is claimed under the pool lock; creating and growing the
    /// file happen after it is released.
    pub(crate) fn reserve(&self, len: usize) -> Result<(SwapSlot, Reservation), SwapError> {
        let stride = align_up(len as u64);
        let claimed = {
            let mut classes = self.classes.lock();
            let class = classes.entry(len).or_default();
            if let Some(slot) = class.free.pop() {
                debug!(
                    file = slot.file.id(),
                    offset = slot.offset,
                    len,
                    "Reusing free swap slot"
                );
                return Ok((slot, Reservation::Reused));
            }
            if stride > self.max_file_size {
                return Err(SwapError::SlotTooLarge {
                    size: stride,
                    max_file_size: self.max_file_size,
                });
            }
            class.claim(stride, self.max_file_size)
        };

        let (file, offset) = match claimed {
            Some(claimed) => claimed,
            None => {
                let file = self.create_file(len)?;
                self.classes
                    .lock()
                    .entry(len)
                    .or_default()
                    .start_file(file, stride)
            }
        };

        file.grow_to(offset + stride)?;
        Ok((SwapSlot { file, offset, len }, Reservation::Grown))
    }

    /// Puts the slot of a destroyed tile on its size's free list.
    pub(crate) fn release(&self, slot: SwapSlot) {
        self.classes.lock().entry(slot.len).or_default().free.push(slot);
    }

    pub(crate) fn file_count(&self) -> usize {
        self.classes.lock().values().map(|class| class.files.len()).sum()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.classes.lock().values().map(|class| class.free.len()).sum()
    }

    pub(crate) fn free_slots_for(&self, len: usize) -> usize {
        self.classes
            .lock()
            .get(&len)
            .map_or(0, |class| class.free.len())
    }

    /// Total bytes handed out across all files
    pub(crate) fn disk_bytes(&self) -> u64 {
        self.classes.lock().values().map(|class| class.allocated).sum()
    }

    fn create_file(&self, slot_len: usize) -> Result<Arc<SwapFile>, SwapError> {
        fs::create_dir_all(&self.dir).map_err(|source| SwapError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(
            "tiles-{}-{}-{}.swap",
            std::process::id(),
            self.instance,
            id
        ));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| SwapError::CreateFile {
                path: path.clone(),
                source,
            })?;

        info!(file = id, path = %path.display(), slot_len, "Created swap file");

        Ok(Arc::new(SwapFile {
            id,
            path,
            file,
            slot_len,
            len: Mutex::new(0),
        }))
    }
}

fn align_up(len: u64) -> u64 {
    len.div_ceil(SLOT_ALIGNMENT) * SLOT_ALIGNMENT
}
