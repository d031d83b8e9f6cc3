//! Error types for tile construction and the swap engine.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by tile construction and pixel access.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// The default pixel used to fill a new tile had no bytes
    #[error("default pixel must contain at least one byte")]
    EmptyPixel,

    /// A pixel of the wrong size was supplied for this tile
    #[error("pixel size mismatch: tile uses {expected} bytes per pixel, got {actual}")]
    PixelSizeMismatch { expected: usize, actual: usize },

    /// A coordinate lies outside the tile
    #[error("pixel ({x}, {y}) is outside the {width}x{height} tile")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// The swap engine could not be started
    #[error(transparent)]
    Swap(#[from] SwapError),
}

/// Failures of the disk-backed swap engine.
///
/// None of these reach tile users directly: the swapper logs them and
/// switches itself into the permanent disabled state.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("failed to create swap directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to create swap file {path}: {source}")]
    CreateFile { path: PathBuf, source: io::Error },

    #[error("failed to grow swap file {path} to {size} bytes: {source}")]
    Grow {
        path: PathBuf,
        size: u64,
        source: io::Error,
    },

    #[error("failed to map {len} bytes at offset {offset} of {path}: {source}")]
    Map {
        path: PathBuf,
        offset: u64,
        len: usize,
        source: io::Error,
    },

    #[error("failed to write {len} bytes at offset {offset} of {path}: {source}")]
    Write {
        path: PathBuf,
        offset: u64,
        len: usize,
        source: io::Error,
    },

    #[error("failed to read {len} bytes at offset {offset} of {path}: {source}")]
    Read {
        path: PathBuf,
        offset: u64,
        len: usize,
        source: io::Error,
    },

    /// A single tile does not fit into one backing file
    #[error("tile of {size} bytes does not fit in a swap file capped at {max_file_size} bytes")]
    SlotTooLarge { size: u64, max_file_size: u64 },

    #[error("failed to spawn swapper thread: {0}")]
    Spawn(#[source] io::Error),
}
