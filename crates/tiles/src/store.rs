//! The backend contract every tile store implements.
//!
//! A store provisions raw buffers, keeps per-tile bookkeeping in
//! [`StoreMetadata`], and decides when a tile's buffer is resident. Hooks
//! that receive a [`TileState`] run with that tile's lock held.

use std::sync::Arc;

use crate::memory_store::MemoryTileMeta;
use crate::source_store::SourceTileMeta;
use crate::tile::Tile;
use crate::tile_data::{TileData, TileState, TileStateGuard};

/// Per-tile bookkeeping owned by the tile's store.
#[derive(Debug, Clone, Default)]
pub enum StoreMetadata {
    /// The store has not registered the tile yet
    #[default]
    Unregistered,
    /// Residency and swap state of a [`MemoryTileStore`](crate::MemoryTileStore) tile
    Memory(MemoryTileMeta),
    /// Source coordinates of a [`SourceTileStore`](crate::SourceTileStore) tile
    Source(SourceTileMeta),
}

impl StoreMetadata {
    pub fn memory(&self) -> Option<&MemoryTileMeta> {
        match self {
            StoreMetadata::Memory(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn memory_mut(&mut self) -> Option<&mut MemoryTileMeta> {
        match self {
            StoreMetadata::Memory(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<&SourceTileMeta> {
        match self {
            StoreMetadata::Source(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn source_mut(&mut self) -> Option<&mut SourceTileMeta> {
        match self {
            StoreMetadata::Source(meta) => Some(meta),
            _ => None,
        }
    }

    /// Pins held on behalf of the swap queue rather than a reader or writer.
    pub(crate) fn queue_pins(&self) -> usize {
        match self {
            StoreMetadata::Memory(meta) if meta.is_queued() => 1,
            _ => 0,
        }
    }
}

/// Pluggable storage backend for tile buffers.
pub trait TileStore: Send + Sync {
    /// Tile width in pixels
    fn tile_width(&self) -> u32;

    /// Tile height in pixels
    fn tile_height(&self) -> u32;

    /// Size in bytes of one tile buffer with the given pixel size
    fn tile_bytes(&self, pixel_size: usize) -> usize {
        self.tile_width() as usize * self.tile_height() as usize * pixel_size
    }

    /// Called once when `data` is constructed. Returns the tile's bookkeeping.
    fn register(&self, data: &Arc<TileData>) -> StoreMetadata;

    /// Called once when `data` is destroyed. The buffer, if any, is released
    /// separately through [`TileStore::release`]; implementations must not
    /// try to destroy the tile again.
    fn deregister(&self, data: &Arc<TileData>, state: &mut TileState);

    /// Called when the first reader or writer pins `data`. Must return only
    /// once the buffer is resident and may block on I/O.
    fn ensure_loaded(&self, data: &Arc<TileData>, state: &mut TileStateGuard<'_>);

    /// Advisory hint that `data` is unpinned and may be evicted later.
    /// Must not free the buffer synchronously.
    fn may_swap(&self, data: &Arc<TileData>, state: &mut TileState);

    /// Returns private storage for a tile that stops sharing `data`. The
    /// result may live in another store; returning `data` itself means no
    /// divergence is needed.
    fn degraded_for_sharing(&self, data: &Arc<TileData>) -> Arc<TileData>;

    /// Provisions a buffer of exactly `tile_bytes(pixel_size)` bytes.
    /// Contents are unspecified.
    fn allocate(&self, pixel_size: usize) -> Box<[u8]>;

    /// Takes back a buffer obtained from [`TileStore::allocate`].
    fn release(&self, buffer: Box<[u8]>, pixel_size: usize);

    /// Whether cloning a tile aliases its data (the default) or deep-copies it.
    fn shares_on_copy(&self) -> bool {
        true
    }
}

/// A store that produces tiles by grid position, such as a decoder reading
/// tiles from an image file.
pub trait TileSource: TileStore {
    /// Returns the tile at `(col, row)`. Positions the source has no content
    /// for are served from `default_tile`. With `for_write` the returned tile
    /// owns private, writable storage.
    fn tile_at(&self, col: i32, row: i32, for_write: bool, default_tile: &Tile) -> Tile;
}
