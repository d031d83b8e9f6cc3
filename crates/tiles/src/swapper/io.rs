//! Moving tile bytes between memory and reserved slots.

use std::io;

use memmap2::MmapOptions;

use crate::config::SwapBackend;
use crate::error::SwapError;
use crate::swapper::pool::SwapSlot;

/// Copies tile bytes into and out of reserved slots.
///
/// Implementations are called without any tile, queue or pool lock held.
pub trait SwapIo: Send + Sync {
    /// Writes `bytes` (exactly `slot.len()` long) into `slot`.
    fn write_slot(&self, slot: &SwapSlot, bytes: &[u8]) -> Result<(), SwapError>;

    /// Fills `bytes` (exactly `slot.len()` long) from `slot`.
    fn read_slot(&self, slot: &SwapSlot, bytes: &mut [u8]) -> Result<(), SwapError>;
}

/// Returns the I/O strategy for `backend`.
pub fn for_backend(backend: SwapBackend) -> Box<dyn SwapIo> {
    match backend {
        SwapBackend::Mmap => Box::new(MmapSwapIo),
        SwapBackend::File => Box::new(FileSwapIo),
    }
}

/// Maps exactly the slot's range, copies, and unmaps again.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSwapIo;

impl SwapIo for MmapSwapIo {
    fn write_slot(&self, slot: &SwapSlot, bytes: &[u8]) -> Result<(), SwapError> {
        // SAFETY: swap files are private to this process and the slot range
        // is owned by a single tile whose I/O is serialized by `io_pending`.
        let mut map = unsafe {
            MmapOptions::new()
                .offset(slot.offset())
                .len(slot.len())
                .map_mut(slot.file().file())
        }
        .map_err(|source| map_error(slot, source))?;

        map.copy_from_slice(bytes);
        Ok(())
    }

    fn read_slot(&self, slot: &SwapSlot, bytes: &mut [u8]) -> Result<(), SwapError> {
        // SAFETY: see `write_slot`.
        let map = unsafe {
            MmapOptions::new()
                .offset(slot.offset())
                .len(slot.len())
                .map(slot.file().file())
        }
        .map_err(|source| map_error(slot, source))?;

        bytes.copy_from_slice(&map);
        Ok(())
    }
}

fn map_error(slot: &SwapSlot, source: io::Error) -> SwapError {
    SwapError::Map {
        path: slot.path().to_path_buf(),
        offset: slot.offset(),
        len: slot.len(),
        source,
    }
}

/// Positional `pwrite`/`pread` style I/O without mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSwapIo;

impl SwapIo for FileSwapIo {
    fn write_slot(&self, slot: &SwapSlot, bytes: &[u8]) -> Result<(), SwapError> {
        write_at(slot, bytes).map_err(|source| SwapError::Write {
            path: slot.path().to_path_buf(),
            offset: slot.offset(),
            len: slot.len(),
            source,
        })
    }

    fn read_slot(&self, slot: &SwapSlot, bytes: &mut [u8]) -> Result<(), SwapError> {
        read_at(slot, bytes).map_err(|source| SwapError::Read {
            path: slot.path().to_path_buf(),
            offset: slot.offset(),
            len: slot.len(),
            source,
        })
    }
}

#[cfg(unix)]
fn write_at(slot: &SwapSlot, bytes: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    slot.file().file().write_all_at(bytes, slot.offset())
}

#[cfg(unix)]
fn read_at(slot: &SwapSlot, bytes: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    slot.file().file().read_exact_at(bytes, slot.offset())
}

#[cfg(windows)]
fn write_at(slot: &SwapSlot, mut bytes: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut offset = slot.offset();
    while !bytes.is_empty() {
        match slot.file().file().seek_write(bytes, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                bytes = &bytes[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_at(slot: &SwapSlot, mut bytes: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut offset = slot.offset();
    while !bytes.is_empty() {
        match slot.file().file().seek_read(bytes, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                bytes = &mut std::mem::take(&mut bytes)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
