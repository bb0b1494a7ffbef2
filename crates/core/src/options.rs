//! Loader configuration.
//!
//! [`Options`] is fixed when a loader is built, apart from the eviction
//! switch and the texture memory budget which can be changed at runtime.
//! Options can be created programmatically, read from environment variables,
//! or loaded from a JSON file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const MB: usize = 1024 * 1024;

/// Configuration shared by every device loader of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Size of the page id space
    pub num_pages: u32,
    /// Capacity of a device context's request list
    pub max_requested_pages: usize,
    /// Fills dispatched per pull at most
    pub max_filled_pages: usize,
    /// Reference samples used to refresh the usage signal per pull
    pub max_stale_pages: usize,
    /// Pages queued for eviction per cycle at most
    pub max_evictable_pages: usize,
    /// Pages examined by invalidation per cycle at most
    pub max_invalidated_pages: usize,
    /// Whether eviction runs at all
    pub eviction_active: bool,
    /// Resident byte budget in bytes; 0 means unlimited
    pub max_texture_memory: usize,
    /// Size of each device's tile memory pool in bytes
    pub device_memory_capacity: usize,
    /// Size of each device's staging pool in bytes
    pub staging_memory_capacity: usize,
    /// Allocation granularity of both pools
    pub block_size: usize,
    /// Fill worker threads per device; 0 means one per core
    pub max_threads: usize,
    /// Device contexts per device, the bound on concurrent launches
    pub max_active_streams: usize,
    /// Record a replayable trace of the session here
    pub trace_file: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_pages: 1 << 20,
            max_requested_pages: 8192,
            max_filled_pages: 8192,
            max_stale_pages: 8192,
            max_evictable_pages: 1024,
            max_invalidated_pages: 8192,
            eviction_active: true,
            max_texture_memory: 2048 * MB,
            device_memory_capacity: 4096 * MB,
            staging_memory_capacity: 64 * MB,
            block_size: 64 * 1024,
            max_threads: 0,
            max_active_streams: 4,
            trace_file: None,
        }
    }
}

impl Options {
    /// Sets the size of the page id space.
    pub fn with_num_pages(mut self, num_pages: u32) -> Self {
        self.num_pages = num_pages;
        self
    }

    /// Sets the per-context request list capacity.
    pub fn with_max_requested_pages(mut self, pages: usize) -> Self {
        self.max_requested_pages = pages;
        self
    }

    /// Sets the per-pull fill limit.
    pub fn with_max_filled_pages(mut self, pages: usize) -> Self {
        self.max_filled_pages = pages;
        self
    }

    /// Sets the per-cycle eviction limit.
    pub fn with_max_evictable_pages(mut self, pages: usize) -> Self {
        self.max_evictable_pages = pages;
        self
    }

    /// Sets the per-cycle invalidation limit.
    pub fn with_max_invalidated_pages(mut self, pages: usize) -> Self {
        self.max_invalidated_pages = pages;
        self
    }

    /// Turns eviction on or off.
    pub fn with_eviction(mut self, active: bool) -> Self {
        self.eviction_active = active;
        self
    }

    /// Sets the resident byte budget; 0 disables the limit.
    pub fn with_max_texture_memory(mut self, bytes: usize) -> Self {
        self.max_texture_memory = bytes;
        self
    }

    /// Sets the device tile pool capacity in bytes.
    pub fn with_device_memory_capacity(mut self, bytes: usize) -> Self {
        self.device_memory_capacity = bytes;
        self
    }

    /// Sets the staging pool capacity in bytes.
    pub fn with_staging_memory_capacity(mut self, bytes: usize) -> Self {
        self.staging_memory_capacity = bytes;
        self
    }

    /// Sets the pool block size in bytes.
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the number of fill workers per device.
    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    /// Sets the number of device contexts per device.
    pub fn with_max_active_streams(mut self, streams: usize) -> Self {
        self.max_active_streams = streams;
        self
    }

    /// Records a trace of the session to `path`.
    pub fn with_trace_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.trace_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Returns the default location for trace files.
    ///
    /// - macOS: ~/Library/Caches/demand-loading/trace.jsonl
    /// - Linux: ~/.cache/demand-loading/trace.jsonl
    /// - Windows: %LOCALAPPDATA%\demand-loading\trace.jsonl
    pub fn default_trace_path() -> PathBuf {
        match dirs::cache_dir() {
            Some(cache_dir) => cache_dir.join("demand-loading").join("trace.jsonl"),
            None => PathBuf::from("demand-loading-trace.jsonl"),
        }
    }

    /// Loads options from environment variables, starting from the defaults.
    ///
    /// Environment variables:
    /// - `DEMAND_LOADING_NUM_PAGES`: size of the page id space
    /// - `DEMAND_LOADING_MAX_TEXTURE_MEMORY_MB`: resident budget in MB (0 = unlimited)
    /// - `DEMAND_LOADING_MAX_THREADS`: fill workers per device (0 = auto)
    /// - `DEMAND_LOADING_MAX_ACTIVE_STREAMS`: device contexts per device
    /// - `DEMAND_LOADING_EVICTION`: `1`/`true` or `0`/`false`
    /// - `DEMAND_LOADING_TRACE_FILE`: record a trace to this path
    ///
    /// # Errors
    /// Returns an error if any variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Some(pages) = env_number::<u32>("DEMAND_LOADING_NUM_PAGES")? {
            options.num_pages = pages;
        }
        if let Some(mb) = env_number::<usize>("DEMAND_LOADING_MAX_TEXTURE_MEMORY_MB")? {
            options.max_texture_memory = mb * MB;
        }
        if let Some(threads) = env_number::<usize>("DEMAND_LOADING_MAX_THREADS")? {
            options.max_threads = threads;
        }
        if let Some(streams) = env_number::<usize>("DEMAND_LOADING_MAX_ACTIVE_STREAMS")? {
            options.max_active_streams = streams;
        }
        if let Ok(value) = std::env::var("DEMAND_LOADING_EVICTION") {
            options.eviction_active = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => return Err(ConfigError::InvalidValue("DEMAND_LOADING_EVICTION".to_string())),
            };
        }
        if let Ok(path) = std::env::var("DEMAND_LOADING_TRACE_FILE") {
            options.trace_file = Some(PathBuf::from(path));
        }

        Ok(options)
    }

    /// Loads options from a JSON file. Missing fields take their defaults.
    ///
    /// ```json
    /// { "num_pages": 65536, "max_texture_memory": 268435456, "max_threads": 4 }
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Saves options to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Checks the limits a loader cannot work without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_pages == 0 {
            return Err(ConfigError::Invalid("num_pages must be positive".to_string()));
        }
        if self.max_requested_pages == 0 {
            return Err(ConfigError::Invalid(
                "max_requested_pages must be positive".to_string(),
            ));
        }
        if self.max_filled_pages == 0 {
            return Err(ConfigError::Invalid("max_filled_pages must be positive".to_string()));
        }
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be positive".to_string()));
        }
        if self.max_active_streams == 0 {
            return Err(ConfigError::Invalid(
                "max_active_streams must be positive".to_string(),
            ));
        }
        if self.device_memory_capacity < self.block_size
            || self.staging_memory_capacity < self.block_size
        {
            return Err(ConfigError::Invalid(
                "memory pools must hold at least one block".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the texture memory budget in megabytes.
    pub fn max_texture_memory_mb(&self) -> usize {
        self.max_texture_memory / MB
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur while building or loading [`Options`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration key
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// Options that cannot drive a loader
    #[error("Invalid options: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed options file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: &[&str] = &[
        "DEMAND_LOADING_NUM_PAGES",
        "DEMAND_LOADING_MAX_TEXTURE_MEMORY_MB",
        "DEMAND_LOADING_MAX_THREADS",
        "DEMAND_LOADING_MAX_ACTIVE_STREAMS",
        "DEMAND_LOADING_EVICTION",
        "DEMAND_LOADING_TRACE_FILE",
    ];

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert_eq!(options.num_pages, 1 << 20);
        assert_eq!(options.max_filled_pages, 8192);
        assert_eq!(options.max_texture_memory_mb(), 2048);
        assert!(options.eviction_active);
        assert!(options.trace_file.is_none());
        options.validate().unwrap();
    }

    #[test]
    fn test_builder_methods() {
        let options = Options::default()
            .with_num_pages(4096)
            .with_max_texture_memory(MB)
            .with_eviction(false)
            .with_max_threads(2)
            .with_trace_file("/tmp/trace.jsonl");

        assert_eq!(options.num_pages, 4096);
        assert_eq!(options.max_texture_memory, MB);
        assert!(!options.eviction_active);
        assert_eq!(options.max_threads, 2);
        assert_eq!(options.trace_file, Some(PathBuf::from("/tmp/trace.jsonl")));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(Options::default().with_num_pages(0).validate().is_err());
        assert!(Options::default().with_block_size(0).validate().is_err());
        assert!(Options::default().with_max_active_streams(0).validate().is_err());
        assert!(Options::default()
            .with_block_size(1024)
            .with_staging_memory_capacity(512)
            .validate()
            .is_err());
    }

    #[test]
    fn test_default_trace_path() {
        let path = Options::default_trace_path();
        assert!(path.ends_with("trace.jsonl"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("DEMAND_LOADING_NUM_PAGES", "65536");
        env::set_var("DEMAND_LOADING_MAX_TEXTURE_MEMORY_MB", "128");
        env::set_var("DEMAND_LOADING_MAX_THREADS", "3");
        env::set_var("DEMAND_LOADING_MAX_ACTIVE_STREAMS", "2");
        env::set_var("DEMAND_LOADING_EVICTION", "off");
        env::set_var("DEMAND_LOADING_TRACE_FILE", "/tmp/session.jsonl");

        let options = Options::from_env().unwrap();
        assert_eq!(options.num_pages, 65536);
        assert_eq!(options.max_texture_memory, 128 * MB);
        assert_eq!(options.max_threads, 3);
        assert_eq!(options.max_active_streams, 2);
        assert!(!options.eviction_active);
        assert_eq!(options.trace_file, Some(PathBuf::from("/tmp/session.jsonl")));
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(ENV_VARS);
        for name in ENV_VARS {
            env::remove_var(name);
        }
        env::set_var("DEMAND_LOADING_MAX_THREADS", "8");

        let options = Options::from_env().unwrap();
        assert_eq!(options.max_threads, 8);
        assert_eq!(options.num_pages, 1 << 20); // default
        assert!(options.eviction_active); // default
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(ENV_VARS);

        env::set_var("DEMAND_LOADING_NUM_PAGES", "lots");
        assert!(matches!(
            Options::from_env(),
            Err(ConfigError::InvalidValue(ref key)) if key == "DEMAND_LOADING_NUM_PAGES"
        ));

        env::remove_var("DEMAND_LOADING_NUM_PAGES");
        env::set_var("DEMAND_LOADING_EVICTION", "maybe");
        assert!(Options::from_env().is_err());
    }

    // Saves and restores environment variables around a test
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
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
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");

        let options = Options::default().with_num_pages(1024).with_max_threads(2);
        options.save_to_file(&path).unwrap();

        assert_eq!(Options::from_file(&path).unwrap(), options);
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        fs::write(&path, r#"{ "num_pages": 512, "eviction_active": false }"#).unwrap();

        let options = Options::from_file(&path).unwrap();
        assert_eq!(options.num_pages, 512);
        assert!(!options.eviction_active);
        assert_eq!(options.max_evictable_pages, 1024); // default
    }

    #[test]
    fn test_from_file_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        fs::write(&path, "num_pages = 512").unwrap();

        assert!(matches!(Options::from_file(&path), Err(ConfigError::Parse(_))));
    }
}
