//! Read-only tiles produced by an external provider.
//!
//! A [`SourceTileStore`] serves tiles whose bytes come from somewhere else,
//! such as a decoder reading an image file. Bytes are fetched the first time
//! a tile is pinned. Writable tiles always live in the target
//! [`MemoryTileStore`].

use std::fmt;
use std::sync::{Arc, Weak};

use crate::memory_store::MemoryTileStore;
use crate::store::{StoreMetadata, TileSource, TileStore};
use crate::tile::{Tile, TilePin};
use crate::tile_data::{TileData, TileState, TileStateGuard};

/// Supplies tile bytes by grid position.
pub trait TileProvider: Send + Sync {
    /// Bytes per pixel of every tile the provider produces
    fn pixel_size(&self) -> usize;

    /// Whether the provider has content at `(col, row)`.
    fn has_tile(&self, col: i32, row: i32) -> bool;

    /// Fills `buffer` with the tile at `(col, row)`.
    fn read_tile(&self, col: i32, row: i32, buffer: &mut [u8]);
}

/// Grid position of a source tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceTileMeta {
    pub col: i32,
    pub row: i32,
    /// Whether the provider has been read for this tile
    pub loaded: bool,
}

/// Tile store over a [`TileProvider`] that degrades to a memory store.
pub struct SourceTileStore {
    this: Weak<SourceTileStore>,
    provider: Box<dyn TileProvider>,
    target: Arc<MemoryTileStore>,
}

impl SourceTileStore {
    /// Creates a store reading from `provider`. Private copies are created
    /// in `target`, which also fixes the tile dimensions.
    pub fn new(provider: Box<dyn TileProvider>, target: Arc<MemoryTileStore>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            provider,
            target,
        })
    }

    pub fn target(&self) -> &Arc<MemoryTileStore> {
        &self.target
    }

    fn shared(&self) -> Arc<dyn TileStore> {
        match self.this.upgrade() {
            Some(store) => store as Arc<dyn TileStore>,
            None => panic!("source tile store used while being dropped"),
        }
    }

    /// A private, writable copy of the provider's tile in the target store.
    fn writable_tile(&self, col: i32, row: i32) -> Tile {
        let target = Arc::clone(&self.target) as Arc<dyn TileStore>;
        let data = TileData::blank(target, self.provider.pixel_size());
        {
            let pin = TilePin::new(&data);
            self.provider.read_tile(col, row, &mut pin.pixels());
        }
        Tile::from_data(col, row, data)
    }
}

impl fmt::Debug for SourceTileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceTileStore")
            .field("pixel_size", &self.provider.pixel_size())
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl TileSource for SourceTileStore {
    fn tile_at(&self, col: i32, row: i32, for_write: bool, default_tile: &Tile) -> Tile {
        if !self.provider.has_tile(col, row) {
            let mut tile = default_tile.copy_to(col, row);
            if for_write {
                tile.detach();
            }
            return tile;
        }

        if for_write {
            return self.writable_tile(col, row);
        }

        let data = TileData::build(self.shared(), self.provider.pixel_size(), None);
        if let Some(meta) = data.lock_state().metadata_mut().source_mut() {
            meta.col = col;
            meta.row = row;
        }
        Tile::from_data(col, row, data)
    }
}

impl TileStore for SourceTileStore {
    fn tile_width(&self) -> u32 {
        self.target.tile_width()
    }

    fn tile_height(&self) -> u32 {
        self.target.tile_height()
    }

    fn register(&self, _data: &Arc<TileData>) -> StoreMetadata {
        StoreMetadata::Source(SourceTileMeta::default())
    }

    fn deregister(&self, _data: &Arc<TileData>, _state: &mut TileState) {}

    fn ensure_loaded(&self, data: &Arc<TileData>, state: &mut TileStateGuard<'_>) {
        let Some(meta) = state.metadata.source().copied() else {
            panic!("tile data {} was not registered by a source store", data.id());
        };
        if meta.loaded {
            return;
        }

        let mut buffer = self.allocate(data.pixel_size());
        state.io_pending = true;
        TileStateGuard::unlocked(state, || {
            self.provider.read_tile(meta.col, meta.row, &mut buffer)
        });
        state.io_pending = false;

        data.put_pixels(buffer);
        if let Some(meta) = state.metadata.source_mut() {
            meta.loaded = true;
        }
        data.notify_io();
    }

    fn may_swap(&self, _data: &Arc<TileData>, _state: &mut TileState) {}

    fn degraded_for_sharing(&self, data: &Arc<TileData>) -> Arc<TileData> {
        let target = Arc::clone(&self.target) as Arc<dyn TileStore>;
        TileData::blank(target, data.pixel_size())
    }

    fn allocate(&self, pixel_size: usize) -> Box<[u8]> {
        vec![0u8; self.tile_bytes(pixel_size)].into_boxed_slice()
    }

    fn release(&self, _buffer: Box<[u8]>, _pixel_size: usize) {}
}
