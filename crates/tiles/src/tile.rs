//! Copy-on-write tile handles.

use std::fmt;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, MutexGuard};

use crate::error::TileError;
use crate::store::TileStore;
use crate::tile_data::{TileData, TileDataInfo};

/// Handle to the pixels of the tile at `(col, row)`.
///
/// Cloning a tile aliases its [`TileData`]; [`Tile::detach`] gives the
/// handle a private copy before it is written to. Dropping the handle
/// releases its reference.
pub struct Tile {
    col: i32,
    row: i32,
    pixel_size: usize,
    data: Arc<TileData>,
}

impl Tile {
    /// Creates a tile in `store` with every pixel set to `default_pixel`.
    pub fn new(
        store: Arc<dyn TileStore>,
        col: i32,
        row: i32,
        default_pixel: &[u8],
    ) -> Result<Self, TileError> {
        let data = TileData::new(store, default_pixel)?;
        Ok(Self::from_data(col, row, data))
    }

    /// Wraps data whose reference count already accounts for this handle.
    pub(crate) fn from_data(col: i32, row: i32, data: Arc<TileData>) -> Self {
        Self {
            col,
            row,
            pixel_size: data.pixel_size(),
            data,
        }
    }

    pub fn col(&self) -> i32 {
        self.col
    }

    pub fn row(&self) -> i32 {
        self.row
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn width(&self) -> u32 {
        self.data.store().tile_width()
    }

    pub fn height(&self) -> u32 {
        self.data.store().tile_height()
    }

    pub fn data(&self) -> &Arc<TileData> {
        &self.data
    }

    pub fn info(&self) -> TileDataInfo {
        self.data.info()
    }

    pub fn is_resident(&self) -> bool {
        self.data.is_resident()
    }

    /// Whether both handles alias the same data.
    pub fn shares_data_with(&self, other: &Tile) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Keeps the buffer resident until the returned guard is dropped,
    /// restoring it from disk first if it was swapped out.
    pub fn pin(&self) -> TilePin<'_> {
        TilePin::new(&self.data)
    }

    /// A handle to the same data at another grid position.
    pub fn copy_to(&self, col: i32, row: i32) -> Tile {
        self.data.add_ref();
        Tile::from_data(col, row, Arc::clone(&self.data))
    }

    /// A handle with its own copy of the pixels, in the same store.
    pub fn deep_copy(&self) -> Tile {
        let fresh = TileData::blank(Arc::clone(self.data.store()), self.pixel_size);
        {
            let source = self.pin();
            copy_pixels(&source, &fresh);
        }
        Tile::from_data(self.col, self.row, fresh)
    }

    /// Gives this handle private data if it currently shares it.
    ///
    /// The store picks where the private copy lives. The source stays
    /// pinned while its bytes are copied so it cannot be swapped out.
    pub fn detach(&mut self) {
        if self.data.ref_count() <= 1 {
            return;
        }

        let fresh = {
            let source = TilePin::new(&self.data);
            let fresh = self.data.store().degraded_for_sharing(&self.data);
            if Arc::ptr_eq(&fresh, &self.data) {
                return;
            }
            copy_pixels(&source, &fresh);
            fresh
        };

        let shared = std::mem::replace(&mut self.data, fresh);
        shared.release_ref();
    }
}

impl Clone for Tile {
    fn clone(&self) -> Self {
        if self.data.store().shares_on_copy() {
            self.copy_to(self.col, self.row)
        } else {
            self.deep_copy()
        }
    }
}

impl Drop for Tile {
    fn drop(&mut self) {
        self.data.release_ref();
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("col", &self.col)
            .field("row", &self.row)
            .field("pixel_size", &self.pixel_size)
            .field("data", &self.data.id())
            .finish()
    }
}

fn copy_pixels(source: &TilePin<'_>, target: &Arc<TileData>) {
    let target = TilePin::new(target);
    target.pixels().copy_from_slice(&source.pixels());
}

/// Guard that keeps a tile's buffer resident.
///
/// Any number of pins may coexist; access to the bytes is serialized by
/// the tile's pixel lock. Callers are responsible for not writing the same
/// tile from several threads at once.
pub struct TilePin<'a> {
    data: &'a Arc<TileData>,
}

impl<'a> TilePin<'a> {
    pub(crate) fn new(data: &'a Arc<TileData>) -> Self {
        data.add_pin();
        Self { data }
    }

    /// Locks and returns the tile's bytes.
    ///
    /// The lock is not reentrant. While the guard is alive, the same thread
    /// must not call [`as_ptr`](Self::as_ptr), [`pixel`](Self::pixel),
    /// [`set_pixel`](Self::set_pixel), [`fill`](Self::fill) or
    /// [`Tile::is_resident`] for this tile, nor take a second guard from any
    /// pin on the same data. Pinning other tiles is fine.
    pub fn pixels(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.data.lock_pixels(), |pixels| match pixels {
            Some(buffer) => &mut buffer[..],
            None => panic!("pinned tile data {} has no resident buffer", self.data.id()),
        })
    }

    /// Address of the resident buffer, stable until the tile is swapped out.
    pub fn as_ptr(&self) -> *const u8 {
        self.pixels().as_ptr()
    }

    /// Bytes of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Result<Vec<u8>, TileError> {
        let range = self.pixel_range(x, y)?;
        Ok(self.pixels()[range].to_vec())
    }

    /// Overwrites the pixel at `(x, y)`.
    pub fn set_pixel(&self, x: u32, y: u32, value: &[u8]) -> Result<(), TileError> {
        self.check_pixel_size(value)?;
        let range = self.pixel_range(x, y)?;
        self.pixels()[range].copy_from_slice(value);
        Ok(())
    }

    /// Sets every pixel to `value`.
    pub fn fill(&self, value: &[u8]) -> Result<(), TileError> {
        self.check_pixel_size(value)?;
        let pixel_size = self.data.pixel_size();
        for pixel in self.pixels().chunks_exact_mut(pixel_size) {
            pixel.copy_from_slice(value);
        }
        Ok(())
    }

    fn check_pixel_size(&self, value: &[u8]) -> Result<(), TileError> {
        let expected = self.data.pixel_size();
        if value.len() != expected {
            return Err(TileError::PixelSizeMismatch {
                expected,
                actual: value.len(),
            });
        }
        Ok(())
    }

    fn pixel_range(&self, x: u32, y: u32) -> Result<std::ops::Range<usize>, TileError> {
        let store = self.data.store();
        let (width, height) = (store.tile_width(), store.tile_height());
        if x >= width || y >= height {
            return Err(TileError::OutOfBounds {
                x,
                y,
                width,
                height,
            });
        }
        let pixel_size = self.data.pixel_size();
        let start = (y as usize * width as usize + x as usize) * pixel_size;
        Ok(start..start + pixel_size)
    }
}

impl Drop for TilePin<'_> {
    fn drop(&mut self) {
        self.data.remove_pin();
    }
}
