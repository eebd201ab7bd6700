//! Settings for one listing run.

use std::env;
use std::path::PathBuf;

use crate::manifest::Platform;
use crate::source::SourceKind;

/// Overrides the default layer cache directory.
pub const CACHE_DIR_ENV: &str = "RUMMAGE_CACHE_DIR";
/// Overrides how many layers are fetched at once.
pub const CONCURRENT_DOWNLOADS_ENV: &str = "RUMMAGE_CONCURRENT_DOWNLOADS";

pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where the image comes from.
    pub source: SourceKind,
    /// Layer cache for the remote source; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Print `tar -tv` style columns instead of bare paths.
    pub long_output: bool,
    /// Platform to pick from a multi-platform index. `None` prefers
    /// `linux/amd64` and otherwise takes the first entry.
    pub platform: Option<Platform>,
    /// Upper bound on layers downloaded in parallel.
    pub concurrent_downloads: usize,
    /// Draw download progress bars on stderr.
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            cache_dir: default_cache_dir(),
            long_output: false,
            platform: None,
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
            progress: false,
        }
    }
}

impl Config {
    /// Defaults, with the `RUMMAGE_*` environment variables applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(value) = env::var(CONCURRENT_DOWNLOADS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.concurrent_downloads = n,
                _ => tracing::warn!(
                    value = %value,
                    "ignoring {CONCURRENT_DOWNLOADS_ENV}, expected a positive integer"
                ),
            }
        }

        config
    }
}

/// `<user cache dir>/rummage`, when the platform has a cache dir.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("rummage"))
}
