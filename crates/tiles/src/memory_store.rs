//! Resident tile store backed by the swapper.
//!
//! Tiles live in memory by default. When a tile's last pin goes away the
//! store hands it to the [`TileSwapper`], which may write it to disk once it
//! has been idle long enough. Pinning it again restores it.

use std::sync::Arc;

use tracing::debug;

use crate::buffer_pool::BufferPool;
use crate::config::TilesConfig;
use crate::error::TileError;
use crate::store::{StoreMetadata, TileStore};
use crate::swapper::{SwapSlot, TileSwapper};
use crate::tile::Tile;
use crate::tile_data::{TileData, TileState, TileStateGuard};

/// Residency and swap bookkeeping of one memory-store tile.
#[derive(Debug, Clone, Default)]
pub struct MemoryTileMeta {
    pub(crate) swappable: bool,
    /// Ticket of the tile's queue entry while it waits for eviction
    pub(crate) queue_ticket: Option<u64>,
    pub(crate) in_memory: bool,
    pub(crate) on_disk: bool,
    /// Reserved on first eviction and kept until the tile is destroyed
    pub(crate) slot: Option<SwapSlot>,
}

impl MemoryTileMeta {
    /// Eligible for eviction right now
    pub fn is_swappable(&self) -> bool {
        self.swappable
    }

    /// Waiting in the swapper's eviction queue
    pub fn is_queued(&self) -> bool {
        self.queue_ticket.is_some()
    }

    pub fn in_memory(&self) -> bool {
        self.in_memory
    }

    pub fn on_disk(&self) -> bool {
        self.on_disk
    }

    pub fn slot(&self) -> Option<&SwapSlot> {
        self.slot.as_ref()
    }
}

/// Tile store keeping buffers in memory and swapping idle ones to disk.
#[derive(Debug)]
pub struct MemoryTileStore {
    tile_width: u32,
    tile_height: u32,
    shares_on_copy: bool,
    swapper: Arc<TileSwapper>,
    buffers: BufferPool,
}

impl MemoryTileStore {
    /// Creates a store whose tile copies share their data.
    pub fn new(config: &TilesConfig, swapper: Arc<TileSwapper>) -> Arc<Self> {
        Self::with_sharing(config, swapper, true)
    }

    /// Creates a store; with `shares_on_copy == false` cloning a tile copies
    /// its pixels instead of sharing them.
    pub fn with_sharing(
        config: &TilesConfig,
        swapper: Arc<TileSwapper>,
        shares_on_copy: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            tile_width: config.tile_width,
            tile_height: config.tile_height,
            shares_on_copy,
            swapper,
            buffers: BufferPool::new(config.buffer_pool_limit),
        })
    }

    /// Creates a tile at `(col, row)` filled with `default_pixel`.
    pub fn create_tile(
        self: &Arc<Self>,
        col: i32,
        row: i32,
        default_pixel: &[u8],
    ) -> Result<Tile, TileError> {
        Tile::new(Arc::clone(self) as Arc<dyn TileStore>, col, row, default_pixel)
    }

    pub fn swapper(&self) -> &Arc<TileSwapper> {
        &self.swapper
    }

    /// Released buffers held for reuse
    pub fn pooled_buffers(&self) -> usize {
        self.buffers.pooled()
    }
}

fn meta_mut<'a>(data: &TileData, state: &'a mut TileState) -> &'a mut MemoryTileMeta {
    match state.metadata.memory_mut() {
        Some(meta) => meta,
        None => panic!("tile data {} was not registered by a memory store", data.id()),
    }
}

impl TileStore for MemoryTileStore {
    fn tile_width(&self) -> u32 {
        self.tile_width
    }

    fn tile_height(&self) -> u32 {
        self.tile_height
    }

    fn register(&self, _data: &Arc<TileData>) -> StoreMetadata {
        StoreMetadata::Memory(MemoryTileMeta {
            in_memory: true,
            ..Default::default()
        })
    }

    fn deregister(&self, data: &Arc<TileData>, state: &mut TileState) {
        let meta = meta_mut(data, state);
        assert!(
            !meta.is_queued(),
            "tile data {} deregistered while queued for eviction",
            data.id()
        );
        if let Some(slot) = meta.slot.take() {
            debug!(
                tile = data.id(),
                path = %slot.path().display(),
                offset = slot.offset(),
                "Reclaiming swap slot"
            );
            self.swapper.release_slot(slot);
        }
        meta.on_disk = false;
    }

    fn ensure_loaded(&self, data: &Arc<TileData>, state: &mut TileStateGuard<'_>) {
        self.swapper.dequeue(data, state);

        let meta = meta_mut(data, state);
        meta.swappable = false;
        if !meta.in_memory {
            self.swapper.restore_locked(data, state);
        }
    }

    fn may_swap(&self, data: &Arc<TileData>, state: &mut TileState) {
        if !self.swapper.accepts_tiles() {
            return;
        }
        let meta = meta_mut(data, state);
        if !meta.in_memory {
            return;
        }
        meta.swappable = true;
        self.swapper.enqueue(data, state);
    }

    fn degraded_for_sharing(&self, data: &Arc<TileData>) -> Arc<TileData> {
        TileData::blank(Arc::clone(data.store()), data.pixel_size())
    }

    fn allocate(&self, pixel_size: usize) -> Box<[u8]> {
        let len = self.tile_bytes(pixel_size);
        self.swapper.budget().record_allocation(len);
        self.buffers.take(len)
    }

    fn release(&self, buffer: Box<[u8]>, _pixel_size: usize) {
        self.swapper.budget().record_deallocation(buffer.len());
        self.buffers.put(buffer);
    }

    fn shares_on_copy(&self) -> bool {
        self.shares_on_copy
    }
}
