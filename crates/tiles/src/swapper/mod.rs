//! Background eviction of idle tiles to disk.
//!
//! One [`TileSwapper`] is shared by every [`MemoryTileStore`] that should
//! swap. Stores hand unpinned tiles to its queue; a single worker thread
//! walks the queue oldest-first and writes each tile that stayed idle past
//! the threshold into a slot of a per-size backing file. Pinning a tile
//! again takes it out of the queue or reads it back from its slot.
//!
//! Lock order is tile state, then queue, then pool. The worker only peeks
//! at the queue front, drops the queue lock, and then locks the tile; the
//! tile's recorded queue ticket tells it whether the entry is still valid.
//! Reserving a slot and writing it both happen with the tile lock released.
//!
//! Any I/O failure turns swapping off for good. Tiles that are resident
//! stay resident and new tiles are no longer queued.
//!
//! Queued tiles keep their store, and therefore the swapper, alive. Call
//! [`TileSwapper::stop`] at teardown to drain the queue.
//!
//! [`MemoryTileStore`]: crate::MemoryTileStore

pub mod io;
pub mod pool;
mod queue;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::budget::MemoryBudget;
use crate::config::SwapConfig;
use crate::error::SwapError;
use crate::memory_store::MemoryTileMeta;
use crate::tile_data::{TileData, TileState, TileStateGuard};

pub use io::{FileSwapIo, MmapSwapIo, SwapIo};
pub use pool::{SwapFile, SwapSlot, SLOT_ALIGNMENT};
pub use stats::SwapStats;

use pool::{Reservation, SwapFilePool};
use queue::EvictionQueue;
use stats::SwapCounters;

/// Outcome of one pass over the front of the eviction queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStep {
    /// The queue is empty
    Idle,
    /// The front entry was dequeued by another thread before it was examined
    Stale,
    /// The front tile is still warm; retry after the given time
    Wait(Duration),
    /// The front tile was written to disk and its buffer released
    Evicted,
    /// The tile was written to disk but pinned meanwhile, so it stays resident
    Interrupted,
    /// The front tile had no handles left and was destroyed
    Finalized,
    /// Swapping is disabled; the front tile was dropped from the queue
    Released,
    /// Reserving or writing a slot failed and swapping was disabled
    Disabled,
}

/// A failed eviction write, with the slot if one was reserved.
type WriteFailure = (Option<SwapSlot>, SwapError);

struct Inner {
    config: SwapConfig,
    queue: Mutex<EvictionQueue>,
    /// Signalled on enqueue and on stop
    wakeup: Condvar,
    pool: SwapFilePool,
    io: Box<dyn SwapIo>,
    budget: MemoryBudget,
    disabled: AtomicBool,
    counters: SwapCounters,
}

/// Shared eviction engine for memory tile stores.
pub struct TileSwapper {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TileSwapper {
    /// Creates a swapper using the configured I/O backend. No thread is
    /// started until [`TileSwapper::start`].
    pub fn new(config: SwapConfig) -> Self {
        let io = io::for_backend(config.backend);
        Self::with_io(config, io)
    }

    /// Creates a swapper with a custom slot I/O implementation.
    pub fn with_io(config: SwapConfig, io: Box<dyn SwapIo>) -> Self {
        let pool = SwapFilePool::new(config.swap_dir.clone(), config.max_file_size);
        let inner = Inner {
            budget: MemoryBudget::new(config.memory_budget),
            disabled: AtomicBool::new(!config.enabled),
            queue: Mutex::new(EvictionQueue::new()),
            wakeup: Condvar::new(),
            pool,
            io,
            counters: SwapCounters::default(),
            config,
        };

        Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the background worker. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns [`SwapError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), SwapError> {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.inner.queue.lock().is_closed() {
            return Ok(());
        }
        if self.is_disabled() {
            info!("Tile swapping is disabled, not starting swapper");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("tile-swapper".to_string())
            .spawn(move || inner.run())
            .map_err(SwapError::Spawn)?;
        *worker = Some(handle);

        info!(
            swap_dir = %self.inner.config.swap_dir.display(),
            idle_threshold_ms = self.inner.config.idle_threshold.as_millis() as u64,
            backend = ?self.inner.config.backend,
            "Tile swapper started"
        );
        Ok(())
    }

    /// Stops the worker, waits for it, and drains the queue.
    ///
    /// Queued tiles lose their queue pin; tiles with no handles left are
    /// destroyed. Afterwards no tile is queued again. Idempotent.
    pub fn stop(&self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.close();
        }
        self.inner.wakeup.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            // The worker may drop the last store reference itself
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Tile swapper thread panicked");
            }
            info!("Tile swapper stopped");
        }

        self.inner.drain();
    }

    /// Whether the background worker is running.
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Whether swapping has been turned off, by configuration or by an I/O
    /// failure.
    pub fn is_disabled(&self) -> bool {
        self.inner.is_disabled()
    }

    /// Whether new tiles are currently accepted into the queue.
    pub fn accepts_tiles(&self) -> bool {
        !self.is_disabled() && !self.inner.queue.lock().is_closed()
    }

    pub fn config(&self) -> &SwapConfig {
        &self.inner.config
    }

    /// Resident-bytes accounting shared by all stores using this swapper.
    pub fn budget(&self) -> &MemoryBudget {
        &self.inner.budget
    }

    /// Runs one iteration of the eviction algorithm on the calling thread.
    pub fn run_eviction_step(&self) -> EvictionStep {
        self.inner.step()
    }

    /// Brings a swapped-out tile back into memory. No-op when resident.
    pub fn restore(&self, data: &Arc<TileData>) {
        let mut state = data.lock_state();
        self.inner.restore(data, &mut state);
        // Handles may have been dropped while the bytes were read
        self.inner.finalize_orphan(data, &mut state);
    }

    /// Number of free-listed slots for tiles of `len` bytes.
    pub fn free_slots_for(&self, len: usize) -> usize {
        self.inner.pool.free_slots_for(len)
    }

    pub fn stats(&self) -> SwapStats {
        let mut stats = SwapStats {
            queued: self.inner.queue.lock().len(),
            resident_bytes: self.inner.budget.current_usage(),
            disabled: self.is_disabled(),
            ..Default::default()
        };
        stats.swap_files = self.inner.pool.file_count();
        stats.disk_bytes = self.inner.pool.disk_bytes();
        stats.free_slots = self.inner.pool.free_slots();
        self.inner.counters.fill(&mut stats);
        stats
    }

    /// Queues `data` for eviction and takes the queue's pin on it.
    pub(crate) fn enqueue(&self, data: &Arc<TileData>, state: &mut TileState) {
        if self.is_disabled() {
            return;
        }
        let Some(meta) = state.metadata.memory_mut() else {
            return;
        };
        if meta.queue_ticket.is_some() {
            return;
        }
        assert_eq!(
            state.pin_count, 0,
            "tile data {} queued while pinned",
            data.id()
        );

        let mut queue = self.inner.queue.lock();
        if queue.is_closed() {
            return;
        }
        meta.queue_ticket = Some(queue.push(Arc::clone(data)));
        drop(queue);

        state.pin_count = 1;
        self.inner.wakeup.notify_one();
    }

    /// Takes `data` out of the queue and drops the queue's pin.
    pub(crate) fn dequeue(&self, data: &TileData, state: &mut TileState) {
        self.inner.dequeue(data, state);
    }

    /// Restores `data` with its state lock held. The lock is released
    /// during the read.
    pub(crate) fn restore_locked(&self, data: &Arc<TileData>, state: &mut TileStateGuard<'_>) {
        self.inner.restore(data, state);
    }

    /// Returns the slot of a destroyed tile to the free list.
    pub(crate) fn release_slot(&self, slot: SwapSlot) {
        self.inner.pool.release(slot);
    }
}

impl Drop for TileSwapper {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TileSwapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileSwapper")
            .field("config", &self.inner.config)
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    fn disable(&self, err: &SwapError) {
        error!(error = %err, "Tile swap I/O failed");
        if !self.disabled.swap(true, Ordering::AcqRel) {
            info!("Tile swapping disabled, all tiles stay resident");
        }
    }

    fn run(&self) {
        loop {
            {
                let mut queue = self.queue.lock();
                while queue.is_empty() && !queue.is_closed() {
                    self.wakeup.wait(&mut queue);
                }
                if queue.is_closed() {
                    break;
                }
            }

            if let EvictionStep::Wait(remaining) = self.step() {
                let mut queue = self.queue.lock();
                if !queue.is_closed() {
                    self.wakeup.wait_for(&mut queue, remaining);
                }
            }
        }
    }

    fn step(&self) -> EvictionStep {
        let Some((ticket, data)) = self.queue.lock().front() else {
            return EvictionStep::Idle;
        };

        let mut state = data.lock_state();
        if state.metadata.memory().and_then(|meta| meta.queue_ticket) != Some(ticket) {
            return EvictionStep::Stale;
        }
        assert_eq!(
            state.pin_count, 1,
            "queued tile data {} must hold only the queue's pin",
            data.id()
        );

        if self.is_disabled() {
            self.dequeue(&data, &mut state);
            memory_meta(&data, &mut state).swappable = false;
            self.finalize_orphan(&data, &mut state);
            return EvictionStep::Released;
        }

        if state.ref_count == 0 {
            self.dequeue(&data, &mut state);
            self.finalize_orphan(&data, &mut state);
            return EvictionStep::Finalized;
        }

        let threshold = if self.budget.needs_eviction() {
            Duration::ZERO
        } else {
            self.config.idle_threshold
        };
        let age = state.last_use.elapsed();
        if age < threshold {
            return EvictionStep::Wait(threshold - age);
        }

        self.evict(&data, state)
    }

    fn evict(&self, data: &Arc<TileData>, mut state: TileStateGuard<'_>) -> EvictionStep {
        self.dequeue(data, &mut state);
        let len = data.byte_len();

        let meta = memory_meta(data, &mut state);
        meta.swappable = false;
        let kept = meta.slot.clone();

        let Some(buffer) = data.take_pixels() else {
            panic!("queued tile data {} is not resident", data.id());
        };

        state.deletable = false;
        state.io_pending = true;
        let written = TileStateGuard::unlocked(&mut state, || -> Result<SwapSlot, WriteFailure> {
            let slot = match kept {
                Some(slot) => slot,
                None => self.reserve(len).map_err(|e| (None, e))?,
            };
            match self.io.write_slot(&slot, &buffer) {
                Ok(()) => Ok(slot),
                Err(e) => Err((Some(slot), e)),
            }
        });
        state.io_pending = false;
        state.deletable = true;

        let step = match written {
            Ok(slot) if state.pin_count > 0 => {
                data.put_pixels(buffer);
                let meta = memory_meta(data, &mut state);
                meta.slot = Some(slot);
                meta.on_disk = true;
                EvictionStep::Interrupted
            }
            Ok(slot) => {
                data.store().release(buffer, data.pixel_size());
                SwapCounters::bump(&self.counters.evictions);
                debug!(
                    tile = data.id(),
                    bytes = len,
                    file = slot.file().id(),
                    offset = slot.offset(),
                    "Evicted tile"
                );
                let meta = memory_meta(data, &mut state);
                meta.slot = Some(slot);
                meta.on_disk = true;
                meta.in_memory = false;
                EvictionStep::Evicted
            }
            Err((slot, e)) => {
                data.put_pixels(buffer);
                let meta = memory_meta(data, &mut state);
                // A reserved slot goes back to the free list with the tile
                meta.slot = slot;
                meta.on_disk = false;
                self.disable(&e);
                EvictionStep::Disabled
            }
        };
        data.notify_io();

        // Every handle went away while the bytes were being written
        self.finalize_orphan(data, &mut state);
        step
    }

    fn reserve(&self, len: usize) -> Result<SwapSlot, SwapError> {
        let (slot, how) = self.pool.reserve(len)?;
        if how == Reservation::Reused {
            SwapCounters::bump(&self.counters.slots_reused);
        }
        Ok(slot)
    }

    fn restore(&self, data: &Arc<TileData>, state: &mut TileStateGuard<'_>) {
        data.wait_for_io(state);

        let meta = memory_meta(data, state);
        if meta.in_memory {
            return;
        }
        let slot = match (meta.on_disk, meta.slot.clone()) {
            (true, Some(slot)) => slot,
            _ => panic!("tile data {} is neither resident nor on disk", data.id()),
        };

        let mut buffer = data.store().allocate(data.pixel_size());
        state.io_pending = true;
        let read = TileStateGuard::unlocked(state, || self.io.read_slot(&slot, &mut buffer));
        state.io_pending = false;

        match read {
            Ok(()) => {
                SwapCounters::bump(&self.counters.restores);
                debug!(
                    tile = data.id(),
                    bytes = buffer.len(),
                    path = %slot.path().display(),
                    offset = slot.offset(),
                    "Restored tile"
                );
            }
            Err(e) => {
                error!(tile = data.id(), error = %e, "Failed to restore tile, contents lost");
                buffer.fill(0);
                SwapCounters::bump(&self.counters.restore_failures);
                self.disable(&e);
            }
        }

        data.put_pixels(buffer);
        memory_meta(data, state).in_memory = true;
        data.notify_io();
    }

    fn dequeue(&self, data: &TileData, state: &mut TileState) {
        let Some(ticket) = state
            .metadata
            .memory_mut()
            .and_then(|meta| meta.queue_ticket.take())
        else {
            return;
        };

        self.queue.lock().remove(ticket);
        assert!(
            state.pin_count > 0,
            "queued tile data {} lost its queue pin",
            data.id()
        );
        state.pin_count -= 1;
    }

    fn finalize_orphan(&self, data: &Arc<TileData>, state: &mut TileState) {
        if state.can_finalize() {
            data.finalize(state);
            SwapCounters::bump(&self.counters.finalized);
        }
    }

    fn drain(&self) {
        loop {
            let Some((ticket, data)) = self.queue.lock().front() else {
                break;
            };
            let mut state = data.lock_state();
            if state.metadata.memory().and_then(|meta| meta.queue_ticket) != Some(ticket) {
                continue;
            }
            self.dequeue(&data, &mut state);
            memory_meta(&data, &mut state).swappable = false;
            self.finalize_orphan(&data, &mut state);
        }
    }
}

fn memory_meta<'a>(data: &TileData, state: &'a mut TileState) -> &'a mut MemoryTileMeta {
    match state.metadata.memory_mut() {
        Some(meta) => meta,
        None => panic!("tile data {} is not held by a memory store", data.id()),
    }
}
