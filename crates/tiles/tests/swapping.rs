use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use paint_editor_tiles::swapper::FileSwapIo;
use paint_editor_tiles::{
    EvictionStep, MemoryTileMeta, MemoryTileStore, SwapBackend, SwapConfig, SwapError, SwapIo,
    SwapSlot, Tile, TileSwapper, TilesConfig,
};
use tempfile::TempDir;

const TILE_BYTES: usize = 64 * 64;

fn swap_config(dir: &TempDir) -> SwapConfig {
    SwapConfig::default()
        .with_swap_dir(dir.path())
        .with_idle_threshold(Duration::from_millis(500))
}

fn setup(config: SwapConfig) -> (Arc<TileSwapper>, Arc<MemoryTileStore>) {
    let swapper = Arc::new(TileSwapper::new(config));
    let store = MemoryTileStore::new(&TilesConfig::default(), Arc::clone(&swapper));
    (swapper, store)
}

fn meta(tile: &Tile) -> MemoryTileMeta {
    tile.info()
        .metadata
        .memory()
        .cloned()
        .expect("memory store tile")
}

fn make_idle(tile: &Tile) {
    tile.data().backdate(Duration::from_secs(1));
}

fn evict(swapper: &TileSwapper, tile: &Tile) {
    make_idle(tile);
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Evicted);
}

#[test]
fn end_to_end_evict_and_restore() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let tile = store.create_tile(0, 0, &[145]).unwrap();
    {
        let pin = tile.pin();
        let mut pixels = pin.pixels();
        pixels[0] = 125;
        pixels[4095] = 45;
    }

    make_idle(&tile);
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Evicted);

    let evicted = meta(&tile);
    assert!(!evicted.in_memory());
    assert!(evicted.on_disk());
    assert!(!evicted.is_queued());
    assert!(!tile.is_resident());

    swapper.restore(tile.data());
    let restored = meta(&tile);
    assert!(restored.in_memory());
    assert!(restored.on_disk());

    let pin = tile.pin();
    let pixels = pin.pixels();
    assert_eq!(pixels[0], 125);
    assert_eq!(pixels[4095], 45);
    assert_eq!(pixels[1], 145);
}

fn round_trip(backend: SwapBackend) {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir).with_backend(backend));

    let tile = store.create_tile(0, 0, &[0, 0, 0, 0]).unwrap();
    let expected: Vec<u8> = (0..TILE_BYTES * 4).map(|i| (i % 251) as u8).collect();
    tile.pin().pixels().copy_from_slice(&expected);

    evict(&swapper, &tile);
    assert!(!tile.is_resident());

    // Pinning restores transparently
    assert_eq!(*tile.pin().pixels(), expected[..]);
    assert_eq!(swapper.stats().restores, 1);
}

#[test]
fn round_trip_mmap_backend() {
    round_trip(SwapBackend::Mmap);
}

#[test]
fn round_trip_file_backend() {
    round_trip(SwapBackend::File);
}

#[test]
fn young_tiles_wait() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let tile = store.create_tile(0, 0, &[1]).unwrap();
    match swapper.run_eviction_step() {
        EvictionStep::Wait(remaining) => assert!(remaining <= Duration::from_millis(500)),
        other => panic!("expected wait, got {other:?}"),
    }
    assert!(meta(&tile).is_queued());
    assert!(tile.is_resident());
    assert_eq!(tile.data().pin_count(), 1);
}

#[test]
fn empty_queue_is_idle() {
    let dir = TempDir::new().unwrap();
    let (swapper, _store) = setup(swap_config(&dir));
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Idle);
}

#[test]
fn shared_tiles_swap_together() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let t1 = store.create_tile(0, 0, &[3]).unwrap();
    let t2 = t1.clone();
    t1.pin().set_pixel(10, 10, &[99]).unwrap();

    evict(&swapper, &t1);
    assert!(!meta(&t1).in_memory());
    assert!(!meta(&t2).in_memory());
    assert!(!t2.is_resident());

    let p2 = t2.pin();
    let p1 = t1.pin();
    assert!(meta(&t1).in_memory());
    assert_eq!(p1.as_ptr(), p2.as_ptr());
    assert_eq!(p1.pixel(10, 10).unwrap(), vec![99]);
}

#[test]
fn detach_restores_swapped_source() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let t1 = store.create_tile(0, 0, &[8]).unwrap();
    let mut t2 = t1.clone();
    evict(&swapper, &t1);

    t2.detach();
    assert!(!t2.shares_data_with(&t1));
    assert_eq!(t2.pin().pixel(63, 63).unwrap(), vec![8]);
    assert_eq!(t1.pin().pixel(0, 0).unwrap(), vec![8]);
}

#[test]
fn pins_stay_balanced_across_swaps() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let tile = store.create_tile(0, 0, &[0]).unwrap();
    // Queued tiles carry the queue's pin only
    assert_eq!(tile.data().pin_count(), 1);
    {
        let _a = tile.pin();
        let _b = tile.pin();
        assert_eq!(tile.data().pin_count(), 2);
    }
    assert_eq!(tile.data().pin_count(), 1);

    evict(&swapper, &tile);
    assert_eq!(tile.data().pin_count(), 0);
    {
        let _pin = tile.pin();
        assert_eq!(tile.data().pin_count(), 1);
    }
    assert_eq!(tile.data().pin_count(), 1);
    assert!(meta(&tile).is_queued());
}

#[test]
fn second_eviction_reuses_own_slot() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let tile = store.create_tile(0, 0, &[0]).unwrap();
    evict(&swapper, &tile);
    let first: SwapSlot = meta(&tile).slot().cloned().unwrap();
    let disk_bytes = swapper.stats().disk_bytes;

    tile.pin().set_pixel(0, 0, &[77]).unwrap();
    evict(&swapper, &tile);
    assert_eq!(meta(&tile).slot(), Some(&first));
    assert_eq!(swapper.stats().disk_bytes, disk_bytes);
    assert_eq!(swapper.stats().slots_reused, 0);

    assert_eq!(tile.pin().pixel(0, 0).unwrap(), vec![77]);
}

#[test]
fn freed_slot_is_handed_out_next() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let a = store.create_tile(0, 0, &[1]).unwrap();
    evict(&swapper, &a);
    let slot = meta(&a).slot().cloned().unwrap();

    let b = store.create_tile(1, 0, &[2]).unwrap();
    let disk_bytes = swapper.stats().disk_bytes;

    drop(a);
    assert_eq!(swapper.free_slots_for(TILE_BYTES), 1);

    evict(&swapper, &b);
    assert_eq!(meta(&b).slot(), Some(&slot));
    assert_eq!(swapper.free_slots_for(TILE_BYTES), 0);

    let stats = swapper.stats();
    assert_eq!(stats.slots_reused, 1);
    assert_eq!(stats.disk_bytes, disk_bytes);
    assert_eq!(stats.swap_files, 1);

    assert_eq!(b.pin().pixel(5, 5).unwrap(), vec![2]);
}

#[test]
fn new_file_started_at_cap() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir).with_max_file_size(2 * TILE_BYTES as u64));

    let tiles: Vec<Tile> = (0..3)
        .map(|i| store.create_tile(i, 0, &[i as u8]).unwrap())
        .collect();
    for tile in &tiles {
        evict(&swapper, tile);
    }

    let stats = swapper.stats();
    assert_eq!(stats.evictions, 3);
    assert_eq!(stats.swap_files, 2);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);

    for (i, tile) in tiles.iter().enumerate() {
        assert_eq!(tile.pin().pixel(1, 1).unwrap(), vec![i as u8]);
    }
}

#[test]
fn orphaned_tile_finalized_by_swapper() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let tile = store.create_tile(0, 0, &[0]).unwrap();
    let data = Arc::clone(tile.data());
    drop(tile);

    // The queue's pin keeps the data alive
    assert!(!data.info().destroyed);
    assert_eq!(swapper.budget().current_usage(), TILE_BYTES);

    assert_eq!(swapper.run_eviction_step(), EvictionStep::Finalized);
    assert!(data.info().destroyed);
    assert_eq!(swapper.stats().finalized, 1);
    assert_eq!(swapper.budget().current_usage(), 0);
}

#[test]
fn memory_pressure_skips_idle_threshold() {
    let dir = TempDir::new().unwrap();
    let config = swap_config(&dir)
        .with_idle_threshold(Duration::from_secs(3600))
        .with_memory_budget(TILE_BYTES);
    let (swapper, store) = setup(config);

    let tile = store.create_tile(0, 0, &[4]).unwrap();
    assert!(swapper.budget().needs_eviction());
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Evicted);
    assert_eq!(swapper.stats().resident_bytes, 0);
    assert!(!tile.is_resident());
}

#[test]
fn unusable_swap_dir_disables_swapping() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, b"not a directory").unwrap();
    let (swapper, store) = setup(swap_config(&dir).with_swap_dir(blocker.join("swap")));

    let tile = store.create_tile(0, 0, &[6]).unwrap();
    make_idle(&tile);
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Disabled);
    assert!(swapper.is_disabled());

    // Everything stays resident from now on
    let m = meta(&tile);
    assert!(m.in_memory());
    assert!(!m.on_disk());
    assert!(!m.is_queued());
    assert_eq!(tile.pin().pixel(0, 0).unwrap(), vec![6]);

    let other = store.create_tile(1, 0, &[7]).unwrap();
    assert!(!meta(&other).is_queued());
    assert_eq!(other.data().pin_count(), 0);
    assert_eq!(swapper.stats().queued, 0);
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Idle);
}

struct FailingIo {
    fail_writes: bool,
}

impl SwapIo for FailingIo {
    fn write_slot(&self, slot: &SwapSlot, bytes: &[u8]) -> Result<(), SwapError> {
        if self.fail_writes {
            return Err(SwapError::Write {
                path: slot.path().to_path_buf(),
                offset: slot.offset(),
                len: slot.len(),
                source: io::Error::other("disk full"),
            });
        }
        FileSwapIo.write_slot(slot, bytes)
    }

    fn read_slot(&self, slot: &SwapSlot, _bytes: &mut [u8]) -> Result<(), SwapError> {
        Err(SwapError::Read {
            path: slot.path().to_path_buf(),
            offset: slot.offset(),
            len: slot.len(),
            source: io::Error::other("bad sector"),
        })
    }
}

fn setup_with_io(dir: &TempDir, io: FailingIo) -> (Arc<TileSwapper>, Arc<MemoryTileStore>) {
    let swapper = Arc::new(TileSwapper::with_io(swap_config(dir), Box::new(io)));
    let store = MemoryTileStore::new(&TilesConfig::default(), Arc::clone(&swapper));
    (swapper, store)
}

#[test]
fn failed_write_keeps_tile_resident() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup_with_io(&dir, FailingIo { fail_writes: true });

    let tile = store.create_tile(0, 0, &[12]).unwrap();
    make_idle(&tile);
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Disabled);
    assert!(swapper.is_disabled());

    let m = meta(&tile);
    assert!(m.in_memory());
    assert!(!m.on_disk());
    assert!(tile.is_resident());
    assert_eq!(tile.pin().pixel(2, 2).unwrap(), vec![12]);
    assert_eq!(swapper.stats().evictions, 0);
}

#[test]
fn failed_restore_yields_zeroed_tile() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup_with_io(&dir, FailingIo { fail_writes: false });

    let tile = store.create_tile(0, 0, &[12]).unwrap();
    evict(&swapper, &tile);

    let pin = tile.pin();
    assert!(pin.pixels().iter().all(|&b| b == 0));
    let stats = swapper.stats();
    assert_eq!(stats.restore_failures, 1);
    assert!(stats.disabled);
}

/// Holds the first write until the test lets it go.
struct Gate {
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

struct GatedIo(Arc<Gate>);

impl SwapIo for GatedIo {
    fn write_slot(&self, slot: &SwapSlot, bytes: &[u8]) -> Result<(), SwapError> {
        if self.0.armed.swap(false, Ordering::SeqCst) {
            self.0.entered.wait();
            self.0.release.wait();
        }
        FileSwapIo.write_slot(slot, bytes)
    }

    fn read_slot(&self, slot: &SwapSlot, bytes: &mut [u8]) -> Result<(), SwapError> {
        FileSwapIo.read_slot(slot, bytes)
    }
}

#[test]
fn pin_during_write_keeps_tile_resident() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Gate {
        armed: AtomicBool::new(true),
        entered: Barrier::new(2),
        release: Barrier::new(2),
    });
    let io = GatedIo(Arc::clone(&gate));
    let swapper = Arc::new(TileSwapper::with_io(swap_config(&dir), Box::new(io)));
    let store = MemoryTileStore::new(&TilesConfig::default(), Arc::clone(&swapper));

    let tile = store.create_tile(0, 0, &[42]).unwrap();
    make_idle(&tile);

    thread::scope(|s| {
        let evictor = s.spawn(|| swapper.run_eviction_step());
        gate.entered.wait();

        // The tile lock is free while the slot is reserved and written
        assert_eq!(tile.data().pin_count(), 0);
        let reader = s.spawn(|| tile.pin().pixel(7, 7).unwrap());
        while tile.data().pin_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        gate.release.wait();

        assert_eq!(evictor.join().unwrap(), EvictionStep::Interrupted);
        assert_eq!(reader.join().unwrap(), vec![42]);
    });

    let m = meta(&tile);
    assert!(m.in_memory());
    assert!(m.on_disk());
    assert!(m.is_queued());
    assert!(tile.is_resident());
    assert_eq!(tile.data().pin_count(), 1);
    assert_eq!(swapper.stats().evictions, 0);
    let slot = m.slot().cloned().unwrap();

    // The next eviction writes into the slot the tile already holds
    evict(&swapper, &tile);
    assert_eq!(meta(&tile).slot(), Some(&slot));
    assert_eq!(swapper.stats().swap_files, 1);
    assert_eq!(tile.pin().pixel(0, 0).unwrap(), vec![42]);
}

#[test]
fn queued_tiles_released_after_disable() {
    let dir = TempDir::new().unwrap();
    // No tile fits in a swap file
    let (swapper, store) = setup(swap_config(&dir).with_max_file_size(1024));

    let first = store.create_tile(0, 0, &[1]).unwrap();
    let second = store.create_tile(1, 0, &[2]).unwrap();
    make_idle(&first);
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Disabled);
    assert!(meta(&second).is_queued());
    assert_eq!(second.data().pin_count(), 1);

    assert_eq!(swapper.run_eviction_step(), EvictionStep::Released);
    assert_eq!(second.data().pin_count(), 0);
    let m = meta(&second);
    assert!(!m.is_queued());
    assert!(m.in_memory());
    assert!(!m.on_disk());
    assert_eq!(swapper.stats().queued, 0);
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Idle);

    assert_eq!(second.pin().pixel(3, 3).unwrap(), vec![2]);
    assert!(!meta(&second).is_queued());
    assert_eq!(meta(&first).slot(), None);
}

#[test]
fn disabled_by_config() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir).with_enabled(false));

    let tile = store.create_tile(0, 0, &[0]).unwrap();
    assert!(!meta(&tile).is_queued());
    assert!(swapper.start().is_ok());
    assert!(!swapper.is_running());
    assert_eq!(swapper.run_eviction_step(), EvictionStep::Idle);
}

#[test]
fn stop_drains_queue_and_removes_files() {
    let dir = TempDir::new().unwrap();
    let (swapper, store) = setup(swap_config(&dir));

    let kept = store.create_tile(0, 0, &[1]).unwrap();
    evict(&swapper, &kept);
    let queued = store.create_tile(1, 0, &[2]).unwrap();
    let orphan = store.create_tile(2, 0, &[3]).unwrap();
    let orphan_data = Arc::clone(orphan.data());
    drop(orphan);
    assert_eq!(swapper.stats().queued, 2);

    swapper.stop();
    assert_eq!(swapper.stats().queued, 0);
    assert_eq!(queued.data().pin_count(), 0);
    assert!(orphan_data.info().destroyed);
    assert!(!swapper.accepts_tiles());

    // Restores still work after stop, but nothing is queued again
    assert_eq!(kept.pin().pixel(0, 0).unwrap(), vec![1]);
    assert!(!meta(&kept).is_queued());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

    drop((kept, queued, orphan_data, store, swapper));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}
