//! Tile storage configuration: tile geometry, buffer recycling and swapping.
//!
//! Configuration can be created programmatically, loaded from environment
//! variables, or read from a flat `key = value` file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Default edge length of a square tile in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 64;

/// Default idle time before a tile may be swapped out.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_millis(500);

/// Default cap for a single backing file (1 GiB).
pub const DEFAULT_MAX_SWAP_FILE_SIZE: u64 = 1024 * MB;

/// How evicted tile bytes travel between memory and the backing files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapBackend {
    /// Map exactly the slot range, copy, unmap
    #[default]
    Mmap,
    /// Positional read/write syscalls
    File,
}

impl SwapBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mmap" => Some(SwapBackend::Mmap),
            "file" | "pread" => Some(SwapBackend::File),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SwapBackend::Mmap => "mmap",
            SwapBackend::File => "file",
        }
    }
}

/// Settings for the background swapper.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapConfig {
    /// When false the swapper starts out disabled and every tile stays resident
    pub enabled: bool,
    /// Directory holding the private backing files
    pub swap_dir: PathBuf,
    /// Minimum unused time before a queued tile is evicted
    pub idle_threshold: Duration,
    /// Size at which a backing file stops growing and a new one is started
    pub max_file_size: u64,
    /// Slot I/O strategy
    pub backend: SwapBackend,
    /// Resident-bytes budget; above its high-water mark idle time is ignored
    pub memory_budget: Option<usize>,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            swap_dir: Self::default_swap_dir(),
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            max_file_size: DEFAULT_MAX_SWAP_FILE_SIZE,
            backend: SwapBackend::default(),
            memory_budget: None,
        }
    }
}

impl SwapConfig {
    /// Returns the default swap directory for the current platform.
    ///
    /// - Linux: ~/.cache/paint-editor/swap
    /// - macOS: ~/Library/Caches/paint-editor/swap
    /// - Windows: %LOCALAPPDATA%\paint-editor\swap
    pub fn default_swap_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("paint-editor").join("swap")
        } else {
            std::env::temp_dir().join("paint-editor-swap")
        }
    }

    /// Sets the swap directory.
    pub fn with_swap_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.swap_dir = path.as_ref().to_path_buf();
        self
    }

    /// Sets the idle threshold.
    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    /// Sets the per-file size cap in bytes.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Sets the slot I/O backend.
    pub fn with_backend(mut self, backend: SwapBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the resident-bytes budget.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Turns swapping on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Configuration for the tile storage engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TilesConfig {
    /// Tile width in pixels
    pub tile_width: u32,
    /// Tile height in pixels
    pub tile_height: u32,
    /// Released buffers kept per byte size for reuse (0 disables recycling)
    pub buffer_pool_limit: usize,
    /// Swapper settings
    pub swap: SwapConfig,
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            buffer_pool_limit: 0,
            swap: SwapConfig::default(),
        }
    }
}

impl TilesConfig {
    /// Sets the tile dimensions in pixels.
    pub fn with_tile_size(mut self, width: u32, height: u32) -> Self {
        self.tile_width = width;
        self.tile_height = height;
        self
    }

    /// Sets how many released buffers are kept per byte size.
    pub fn with_buffer_pool_limit(mut self, limit: usize) -> Self {
        self.buffer_pool_limit = limit;
        self
    }

    /// Replaces the swapper settings.
    pub fn with_swap(mut self, swap: SwapConfig) -> Self {
        self.swap = swap;
        self
    }

    /// Number of bytes of one tile with the given pixel size.
    pub fn tile_bytes(&self, pixel_size: usize) -> usize {
        self.tile_width as usize * self.tile_height as usize * pixel_size
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PAINT_EDITOR_TILE_WIDTH` / `PAINT_EDITOR_TILE_HEIGHT`: tile size in pixels
    /// - `PAINT_EDITOR_TILE_POOL`: recycled buffers per byte size
    /// - `PAINT_EDITOR_SWAP_ENABLED`: `true` / `false`
    /// - `PAINT_EDITOR_SWAP_DIR`: swap directory path
    /// - `PAINT_EDITOR_SWAP_IDLE_MS`: idle threshold in milliseconds
    /// - `PAINT_EDITOR_SWAP_FILE_MB`: backing file cap in MB
    /// - `PAINT_EDITOR_SWAP_BACKEND`: `mmap` or `file`
    /// - `PAINT_EDITOR_TILE_MEMORY_MB`: resident tile budget in MB
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (var, key) in ENV_KEYS {
            if let Ok(val) = std::env::var(var) {
                config
                    .apply(key, &val)
                    .map_err(|_| ConfigError::InvalidValue(var.to_string()))?;
            }
        }

        Ok(config)
    }

    /// Loads configuration from a file.
    ///
    /// Expected file format:
    /// ```toml
    /// tile_width = 64
    /// tile_height = 64
    /// swap_idle_ms = 500
    /// swap_dir = "/path/to/swap"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;

        Self::from_toml(&contents)
    }

    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');
                config.apply(key, value)?;
            }
        }

        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue(key.to_string());

        match key {
            "tile_width" => self.tile_width = parse_nonzero(value).ok_or_else(invalid)?,
            "tile_height" => self.tile_height = parse_nonzero(value).ok_or_else(invalid)?,
            "buffer_pool_limit" => {
                self.buffer_pool_limit = value.parse().map_err(|_| invalid())?;
            }
            "swap_enabled" => self.swap.enabled = value.parse().map_err(|_| invalid())?,
            "swap_dir" => self.swap.swap_dir = PathBuf::from(value),
            "swap_idle_ms" => {
                let ms: u64 = value.parse().map_err(|_| invalid())?;
                self.swap.idle_threshold = Duration::from_millis(ms);
            }
            "swap_file_mb" => {
                let mb: u64 = parse_nonzero(value).ok_or_else(invalid)?;
                self.swap.max_file_size = mb * MB;
            }
            "swap_backend" => self.swap.backend = SwapBackend::parse(value).ok_or_else(invalid)?,
            "tile_memory_mb" => {
                let mb: usize = value.parse().map_err(|_| invalid())?;
                self.swap.memory_budget = Some(mb * MB as usize);
            }
            _ => {} // Ignore unknown keys
        }

        Ok(())
    }

    /// Saves configuration to a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml())?;
        Ok(())
    }

    fn to_toml(&self) -> String {
        let mut out = format!(
            "# Paint Editor Tile Storage Configuration\n\
             tile_width = {}\n\
             tile_height = {}\n\
             buffer_pool_limit = {}\n\
             swap_enabled = {}\n\
             swap_dir = \"{}\"\n\
             swap_idle_ms = {}\n\
             swap_file_mb = {}\n\
             swap_backend = \"{}\"\n",
            self.tile_width,
            self.tile_height,
            self.buffer_pool_limit,
            self.swap.enabled,
            self.swap.swap_dir.display(),
            self.swap.idle_threshold.as_millis(),
            self.swap.max_file_size / MB,
            self.swap.backend.as_str(),
        );
        if let Some(budget) = self.swap.memory_budget {
            out.push_str(&format!("tile_memory_mb = {}\n", budget / MB as usize));
        }
        out
    }
}

const ENV_KEYS: [(&str, &str); 9] = [
    ("PAINT_EDITOR_TILE_WIDTH", "tile_width"),
    ("PAINT_EDITOR_TILE_HEIGHT", "tile_height"),
    ("PAINT_EDITOR_TILE_POOL", "buffer_pool_limit"),
    ("PAINT_EDITOR_SWAP_ENABLED", "swap_enabled"),
    ("PAINT_EDITOR_SWAP_DIR", "swap_dir"),
    ("PAINT_EDITOR_SWAP_IDLE_MS", "swap_idle_ms"),
    ("PAINT_EDITOR_SWAP_FILE_MB", "swap_file_mb"),
    ("PAINT_EDITOR_SWAP_BACKEND", "swap_backend"),
    ("PAINT_EDITOR_TILE_MEMORY_MB", "tile_memory_mb"),
];

fn parse_nonzero<T>(value: &str) -> Option<T>
where
    T: std::str::FromStr + Default + PartialEq,
{
    value.parse::<T>().ok().filter(|v| *v != T::default())
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = TilesConfig::default();
        assert_eq!(config.tile_width, 64);
        assert_eq!(config.tile_height, 64);
        assert_eq!(config.tile_bytes(1), 4096);
        assert_eq!(config.buffer_pool_limit, 0);
        assert!(config.swap.enabled);
        assert_eq!(config.swap.idle_threshold, Duration::from_millis(500));
        assert_eq!(config.swap.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(config.swap.backend, SwapBackend::Mmap);
        assert_eq!(config.swap.memory_budget, None);
    }

    #[test]
    fn test_builder_methods() {
        let config = TilesConfig::default()
            .with_tile_size(32, 16)
            .with_buffer_pool_limit(8)
            .with_swap(
                SwapConfig::default()
                    .with_swap_dir("/custom/swap")
                    .with_idle_threshold(Duration::from_millis(20))
                    .with_max_file_size(4096)
                    .with_backend(SwapBackend::File)
                    .with_memory_budget(1 << 20)
                    .with_enabled(false),
            );

        assert_eq!(config.tile_bytes(4), 32 * 16 * 4);
        assert_eq!(config.buffer_pool_limit, 8);
        assert_eq!(config.swap.swap_dir, PathBuf::from("/custom/swap"));
        assert_eq!(config.swap.idle_threshold, Duration::from_millis(20));
        assert_eq!(config.swap.max_file_size, 4096);
        assert_eq!(config.swap.backend, SwapBackend::File);
        assert_eq!(config.swap.memory_budget, Some(1 << 20));
        assert!(!config.swap.enabled);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_KEYS.map(|(var, _)| var));

        env::set_var("PAINT_EDITOR_TILE_WIDTH", "128");
        env::set_var("PAINT_EDITOR_SWAP_DIR", "/tmp/test-swap");
        env::set_var("PAINT_EDITOR_SWAP_IDLE_MS", "250");
        env::set_var("PAINT_EDITOR_SWAP_FILE_MB", "16");
        env::set_var("PAINT_EDITOR_SWAP_BACKEND", "file");
        env::set_var("PAINT_EDITOR_TILE_MEMORY_MB", "64");

        let config = TilesConfig::from_env().unwrap();
        assert_eq!(config.tile_width, 128);
        assert_eq!(config.tile_height, 64); // default
        assert_eq!(config.swap.swap_dir, PathBuf::from("/tmp/test-swap"));
        assert_eq!(config.swap.idle_threshold, Duration::from_millis(250));
        assert_eq!(config.swap.max_file_size, 16 * 1024 * 1024);
        assert_eq!(config.swap.backend, SwapBackend::File);
        assert_eq!(config.swap.memory_budget, Some(64 * 1024 * 1024));
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_KEYS.map(|(var, _)| var));

        env::set_var("PAINT_EDITOR_SWAP_BACKEND", "tape");
        match TilesConfig::from_env() {
            Err(ConfigError::InvalidValue(key)) => assert_eq!(key, "PAINT_EDITOR_SWAP_BACKEND"),
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_tile_size() {
        let _guard = EnvGuard::new(&ENV_KEYS.map(|(var, _)| var));

        env::set_var("PAINT_EDITOR_TILE_HEIGHT", "0");
        assert!(TilesConfig::from_env().is_err());
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in var_names {
                env::remove_var(name);
            }
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TilesConfig::default()
            .with_tile_size(128, 128)
            .with_swap(
                SwapConfig::default()
                    .with_swap_dir("/tmp/swap")
                    .with_memory_budget(256 * 1024 * 1024),
            );
        let parsed = TilesConfig::from_toml(&config.to_toml()).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
            # only the swap knobs
            swap_idle_ms = 1000
            swap_enabled = false
            unknown_key = 3
        "#;

        let config = TilesConfig::from_toml(toml).unwrap();
        assert_eq!(config.swap.idle_threshold, Duration::from_secs(1));
        assert!(!config.swap.enabled);
        assert_eq!(config.tile_width, 64);
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tiles.toml");

        let config = TilesConfig::default().with_buffer_pool_limit(4);
        config.save_to_file(&config_path).unwrap();

        let loaded = TilesConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = TilesConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
