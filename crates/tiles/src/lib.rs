//! Paint Editor Tile Storage Library
//!
//! Tiled pixel buffers for paint surfaces. Tiles share their data
//! copy-on-write, live in pluggable stores, and are swapped to disk by a
//! background worker when they sit idle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use paint_editor_tiles::{MemoryTileStore, TileSwapper, TilesConfig};
//!
//! let config = TilesConfig::default();
//! let swapper = Arc::new(TileSwapper::new(config.swap.clone()));
//! swapper.start()?;
//!
//! let store = MemoryTileStore::new(&config, Arc::clone(&swapper));
//! let tile = store.create_tile(0, 0, &[0, 0, 0, 255])?;
//! let mut copy = tile.clone();
//! copy.detach();
//! copy.pin().set_pixel(3, 4, &[255, 0, 0, 255])?;
//!
//! drop((tile, copy));
//! swapper.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod budget;
mod buffer_pool;
pub mod config;
pub mod error;
pub mod memory_store;
pub mod source_store;
pub mod store;
pub mod swapper;
pub mod tile;
pub mod tile_data;

pub use budget::{MemoryBudget, MemoryPressure};
pub use config::{ConfigError, SwapBackend, SwapConfig, TilesConfig};
pub use error::{SwapError, TileError};
pub use memory_store::{MemoryTileMeta, MemoryTileStore};
pub use source_store::{SourceTileMeta, SourceTileStore, TileProvider};
pub use store::{StoreMetadata, TileSource, TileStore};
pub use swapper::{EvictionStep, SwapIo, SwapSlot, SwapStats, TileSwapper};
pub use tile::{Tile, TilePin};
pub use tile_data::{TileData, TileDataInfo, TileState, TileStateGuard};
