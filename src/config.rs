use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::playlist::PlaylistItem;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Directory holding one extracted bundle per slide.
    pub cache_dir: PathBuf,
    /// Unix socket accepting JSON-lines control requests.
    pub control_socket_path: PathBuf,
    /// Length of intro/outro animations for the headless renderer.
    #[serde(with = "humantime_serde")]
    pub transition_duration: Duration,
    /// Advance automatically once a slide's duration elapsed.
    pub auto_advance: bool,
    /// Interval between `on_loop` hook calls for the steady slide.
    #[serde(with = "humantime_serde")]
    pub hook_loop_interval: Duration,
    /// Timeout for a single bundle download.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Re-add slides whose manifests survive in `cache-dir` at startup.
    pub restore_cached: bool,
    /// Optional deterministic seed for random and weighted selection.
    pub playlist_seed: Option<u64>,
    pub lock_retry: LockPolicy,
    /// Explicit rotation. When absent every added slide gets its own slot.
    pub playlist: Option<Vec<PlaylistItem>>,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&s)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).context("failed to parse configuration")
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache-dir must not be empty"
        );
        ensure!(
            self.control_socket_path.file_name().is_some(),
            "control-socket-path must name a socket file"
        );
        ensure!(
            self.hook_loop_interval > Duration::ZERO,
            "hook-loop-interval must be positive"
        );
        ensure!(
            self.fetch_timeout > Duration::ZERO,
            "fetch-timeout must be positive"
        );
        self.lock_retry.validate()?;
        if let Some(items) = &self.playlist {
            ensure!(!items.is_empty(), "playlist must list at least one item");
            for item in items {
                item.validate().context("invalid playlist")?;
            }
        }
        Ok(self)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/slide-kiosk"),
            control_socket_path: PathBuf::from("/run/slide-kiosk/control.sock"),
            transition_duration: Duration::from_millis(500),
            auto_advance: true,
            hook_loop_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(30),
            restore_cached: true,
            playlist_seed: None,
            lock_retry: LockPolicy::default(),
            playlist: None,
        }
    }
}

/// Bounded retry used while waiting for a busy slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct LockPolicy {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Failed attempts after which every further attempt logs a warning.
    pub warn_after: u32,
}

impl LockPolicy {
    /// Delay after the `attempt`-th failure (0-based): doubles up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.attempts >= 1, "lock-retry.attempts must be >= 1");
        ensure!(
            self.initial_backoff <= self.max_backoff,
            "lock-retry.initial-backoff must not exceed lock-retry.max-backoff"
        );
        Ok(())
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            warn_after: 3,
        }
    }
}
