use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use paint_editor_tiles::{MemoryTileStore, SwapConfig, Tile, TileSwapper, TilesConfig};
use rand::Rng;
use tempfile::TempDir;

const THREADS: usize = 4;
const TILES_PER_THREAD: usize = 8;
const ROUNDS: usize = 200;

/// Pixel value written at `(x, x)` of tile `tile` in `round`.
fn stamp(tile: usize, round: usize) -> u8 {
    (tile * 31 + round) as u8
}

#[test]
fn tiles_survive_background_swapping() {
    let dir = TempDir::new().unwrap();
    let config = SwapConfig::default()
        .with_swap_dir(dir.path())
        .with_idle_threshold(Duration::from_millis(2));
    let swapper = Arc::new(TileSwapper::new(config));
    swapper.start().unwrap();
    assert!(swapper.is_running());

    let store = MemoryTileStore::new(&TilesConfig::default(), Arc::clone(&swapper));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let tiles: Vec<Tile> = (0..TILES_PER_THREAD)
                    .map(|i| store.create_tile(i as i32, t as i32, &[0, 0]).unwrap())
                    .collect();
                let mut last = vec![None; TILES_PER_THREAD];

                for round in 0..ROUNDS {
                    let i = rng.gen_range(0..TILES_PER_THREAD);
                    let pin = tiles[i].pin();
                    if let Some(expected) = last[i] {
                        assert_eq!(pin.pixel(7, 7).unwrap(), vec![expected, expected]);
                    }
                    let value = stamp(i, round);
                    pin.set_pixel(7, 7, &[value, value]).unwrap();
                    last[i] = Some(value);
                    drop(pin);

                    if rng.gen_bool(0.1) {
                        thread::sleep(Duration::from_millis(3));
                    }
                }

                // Shared copies diverge without disturbing the original
                let mut copy = tiles[0].clone();
                copy.detach();
                copy.pin().set_pixel(0, 0, &[1, 1]).unwrap();
                assert_eq!(tiles[0].pin().pixel(0, 0).unwrap(), vec![0, 0]);

                (tiles, last)
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    // Give the worker time to evict the now idle tiles
    let deadline = Instant::now() + Duration::from_secs(5);
    while swapper.stats().evictions == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(swapper.stats().evictions > 0);
    assert!(!swapper.is_disabled());

    for (tiles, last) in &results {
        for (tile, expected) in tiles.iter().zip(last) {
            if let Some(value) = expected {
                assert_eq!(tile.pin().pixel(7, 7).unwrap(), vec![*value, *value]);
            }
        }
    }

    swapper.stop();
    assert!(!swapper.is_running());
    assert_eq!(swapper.stats().queued, 0);

    drop(results);
    assert_eq!(swapper.budget().current_usage(), 0);
}
