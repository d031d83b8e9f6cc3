//! Shared, reference-counted pixel storage for one tile.
//!
//! A [`TileData`] is aliased by every [`Tile`](crate::Tile) handle that
//! shares it. Two locks guard it: the state lock covers counters and store
//! bookkeeping, the pixel lock covers the buffer itself. Pin holders take
//! the pixel lock and may then pin other tiles, so the pixel lock is only
//! taken under the state lock while no pin holder can be using the buffer.
//!
//! Lifecycle counters:
//! - `ref_count`: live `Tile` handles
//! - `pin_count`: readers/writers needing the buffer resident, plus one
//!   while the tile waits in the swap queue
//! - `deletable`: false while an eviction still needs the data
//!
//! The data is destroyed exactly when `ref_count == 0`, `pin_count == 0`
//! and it is deletable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::TileError;
use crate::store::{StoreMetadata, TileStore};

static NEXT_TILE_DATA_ID: AtomicU64 = AtomicU64::new(1);

/// Lock guard over a tile's [`TileState`].
pub type TileStateGuard<'a> = MutexGuard<'a, TileState>;

/// Mutable bookkeeping of a [`TileData`], guarded by its state lock.
#[derive(Debug)]
pub struct TileState {
    pub(crate) ref_count: usize,
    pub(crate) pin_count: usize,
    pub(crate) deletable: bool,
    /// A store or the swapper moves the buffer with the lock released
    pub(crate) io_pending: bool,
    pub(crate) destroyed: bool,
    pub(crate) last_use: Instant,
    pub(crate) metadata: StoreMetadata,
}

impl TileState {
    fn new() -> Self {
        Self {
            ref_count: 1,
            pin_count: 0,
            deletable: true,
            io_pending: false,
            destroyed: false,
            last_use: Instant::now(),
            metadata: StoreMetadata::Unregistered,
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut StoreMetadata {
        &mut self.metadata
    }

    /// Pins held by readers and writers, excluding the swap queue's pin.
    pub(crate) fn held_pins(&self) -> usize {
        self.pin_count - self.metadata.queue_pins()
    }

    pub(crate) fn can_finalize(&self) -> bool {
        self.ref_count == 0
            && self.pin_count == 0
            && self.deletable
            && !self.io_pending
            && !self.destroyed
    }
}

/// Point-in-time view of a [`TileData`] for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct TileDataInfo {
    pub id: u64,
    pub pixel_size: usize,
    pub ref_count: usize,
    pub pin_count: usize,
    pub deletable: bool,
    pub destroyed: bool,
    /// Whether the buffer is currently allocated
    pub resident: bool,
    pub last_use: Instant,
    pub metadata: StoreMetadata,
}

/// Pixel buffer of one tile plus its residency bookkeeping.
pub struct TileData {
    id: u64,
    pixel_size: usize,
    store: Arc<dyn TileStore>,
    state: Mutex<TileState>,
    pixels: Mutex<Option<Box<[u8]>>>,
    io_done: Condvar,
}

impl fmt::Debug for TileData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileData")
            .field("id", &self.id)
            .field("pixel_size", &self.pixel_size)
            .finish_non_exhaustive()
    }
}

impl TileData {
    /// Allocates a buffer from `store` and fills every pixel with
    /// `default_pixel`. The pixel size is the length of `default_pixel`.
    pub fn new(store: Arc<dyn TileStore>, default_pixel: &[u8]) -> Result<Arc<Self>, TileError> {
        if default_pixel.is_empty() {
            return Err(TileError::EmptyPixel);
        }

        let pixel_size = default_pixel.len();
        let mut buffer = store.allocate(pixel_size);
        for pixel in buffer.chunks_exact_mut(pixel_size) {
            pixel.copy_from_slice(default_pixel);
        }

        Ok(Self::build(store, pixel_size, Some(buffer)))
    }

    /// Allocated data whose contents the caller overwrites.
    pub(crate) fn blank(store: Arc<dyn TileStore>, pixel_size: usize) -> Arc<Self> {
        let buffer = store.allocate(pixel_size);
        Self::build(store, pixel_size, Some(buffer))
    }

    /// Registers new data with its store and offers it for swapping.
    pub(crate) fn build(
        store: Arc<dyn TileStore>,
        pixel_size: usize,
        pixels: Option<Box<[u8]>>,
    ) -> Arc<Self> {
        let data = Arc::new(Self {
            id: NEXT_TILE_DATA_ID.fetch_add(1, Ordering::Relaxed),
            pixel_size,
            store,
            state: Mutex::new(TileState::new()),
            pixels: Mutex::new(pixels),
            io_done: Condvar::new(),
        });

        let metadata = data.store.register(&data);
        let mut state = data.state.lock();
        state.metadata = metadata;
        data.store.may_swap(&data, &mut state);
        drop(state);

        data
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn store(&self) -> &Arc<dyn TileStore> {
        &self.store
    }

    /// Byte length of the buffer
    pub fn byte_len(&self) -> usize {
        self.store.tile_bytes(self.pixel_size)
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn pin_count(&self) -> usize {
        self.state.lock().pin_count
    }

    pub fn is_resident(&self) -> bool {
        self.pixels.lock().is_some()
    }

    pub fn info(&self) -> TileDataInfo {
        let resident = self.is_resident();
        let state = self.state.lock();
        TileDataInfo {
            id: self.id,
            pixel_size: self.pixel_size,
            ref_count: state.ref_count,
            pin_count: state.pin_count,
            deletable: state.deletable,
            destroyed: state.destroyed,
            resident,
            last_use: state.last_use,
            metadata: state.metadata.clone(),
        }
    }

    /// Moves the last-use timestamp back by `age`, making the tile look idle.
    pub fn backdate(&self, age: Duration) {
        let mut state = self.state.lock();
        if let Some(earlier) = state.last_use.checked_sub(age) {
            state.last_use = earlier;
        }
    }

    pub(crate) fn lock_state(&self) -> TileStateGuard<'_> {
        self.state.lock()
    }

    pub(crate) fn add_ref(&self) {
        let mut state = self.state.lock();
        assert!(
            !state.destroyed && state.ref_count > 0,
            "cannot share tile data {} that has no owner",
            self.id
        );
        state.ref_count += 1;
    }

    pub(crate) fn release_ref(self: &Arc<Self>) {
        let mut state = self.state.lock();
        assert!(
            state.ref_count > 0,
            "tile data {} released more often than referenced",
            self.id
        );
        state.ref_count -= 1;
        if state.can_finalize() {
            self.finalize(&mut state);
        }
    }

    pub(crate) fn add_pin(self: &Arc<Self>) {
        let mut state = self.state.lock();
        assert!(!state.destroyed, "cannot pin destroyed tile data {}", self.id);

        let first = state.held_pins() == 0;
        state.pin_count += 1;
        self.wait_for_io(&mut state);
        if first {
            self.store.ensure_loaded(self, &mut state);
        }
        self.wait_for_io(&mut state);
    }

    pub(crate) fn remove_pin(self: &Arc<Self>) {
        let mut state = self.state.lock();
        assert!(
            state.held_pins() > 0,
            "tile data {} unpinned more often than pinned",
            self.id
        );
        state.pin_count -= 1;

        if state.pin_count == 0 {
            state.last_use = Instant::now();
            if state.can_finalize() {
                self.finalize(&mut state);
            } else if state.ref_count > 0 {
                self.store.may_swap(self, &mut state);
            }
        }
    }

    /// Destroys the data: deregisters it and hands the buffer back.
    pub(crate) fn finalize(self: &Arc<Self>, state: &mut TileState) {
        assert!(!state.destroyed, "tile data {} finalized twice", self.id);
        state.destroyed = true;
        self.store.deregister(self, state);
        if let Some(buffer) = self.take_pixels() {
            self.store.release(buffer, self.pixel_size);
        }
    }

    pub(crate) fn take_pixels(&self) -> Option<Box<[u8]>> {
        self.pixels.lock().take()
    }

    pub(crate) fn put_pixels(&self, buffer: Box<[u8]>) {
        let previous = self.pixels.lock().replace(buffer);
        assert!(
            previous.is_none(),
            "tile data {} already had a resident buffer",
            self.id
        );
    }

    pub(crate) fn lock_pixels(&self) -> MutexGuard<'_, Option<Box<[u8]>>> {
        self.pixels.lock()
    }

    /// Blocks while another thread moves this tile's buffer.
    pub(crate) fn wait_for_io(&self, state: &mut TileStateGuard<'_>) {
        while state.io_pending {
            self.io_done.wait(state);
        }
    }

    pub(crate) fn notify_io(&self) {
        self.io_done.notify_all();
    }
}
