use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ident::{Scheme, DEFAULT_PREFIX};
use crate::retry::{RetryPolicy, VisibilityPolicy};
use crate::{Error, Result};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Prefix of the environment variables overriding settings, eg. `REGRELAY_CHUNK_SIZE`.
pub const ENV_PREFIX: &str = "REGRELAY";

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub registry_url: String,
    pub registry_token: Option<String>,
    pub artifact_prefix: String,
    /// Chunk size in bytes.
    pub chunk_size: usize,
    pub max_file_size: u64,
    /// Lifetime of a published transfer.
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
    /// Maximum concurrent chunk pushes, `1` pushes sequentially with `push_pacing` in between.
    pub push_concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub push_pacing: Duration,
    pub fetch_concurrency: usize,
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    pub confirm_visibility: bool,
    pub confirm_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub confirm_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    /// Download attempts of a scheduled transfer before giving up.
    pub max_retries: u32,
    /// Minimum spacing between two attempts of a scheduled transfer.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub scratch_dir: PathBuf,
    pub download_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:4873".into(),
            registry_token: None,
            artifact_prefix: DEFAULT_PREFIX.into(),
            chunk_size: crate::chunk::DEFAULT_CHUNK_SIZE.get(),
            max_file_size: 500_000_000,
            expiry: Duration::from_secs(72 * 60 * 60),
            push_concurrency: 1,
            push_pacing: Duration::from_secs(1),
            fetch_concurrency: 3,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
            confirm_visibility: true,
            confirm_attempts: 10,
            confirm_interval: Duration::from_secs(3),
            sync_interval: Duration::from_secs(5 * 60),
            max_retries: 5,
            retry_delay: Duration::from_secs(60),
            scratch_dir: std::env::temp_dir().join("regrelay"),
            download_dir: "downloads".into(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional file and `REGRELAY_*` environment variables, in increasing priority.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.chunk_size > 0, "chunk_size must be positive"),
            (self.push_concurrency > 0, "push_concurrency must be positive"),
            (self.fetch_concurrency > 0, "fetch_concurrency must be positive"),
            (self.retry_attempts > 0, "retry_attempts must be positive"),
            (self.max_retries > 0, "max_retries must be positive"),
            (!self.artifact_prefix.is_empty(), "artifact_prefix must not be empty"),
            (!self.expiry.is_zero(), "expiry must be positive"),
        ];

        match checks.into_iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(Error::Config(reason.into())),
            None => Ok(()),
        }
    }

    pub fn chunk_size(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.chunk_size).ok_or_else(|| Error::Config("chunk_size must be positive".into()))
    }

    /// Days before today a live transfer may have been published at, ie. `ceil(expiry / 1 day)`.
    pub fn lookback_days(&self) -> u64 {
        self.expiry.as_secs().div_ceil(SECONDS_PER_DAY)
    }

    pub fn scheme(&self) -> Scheme {
        Scheme::new(&self.artifact_prefix)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
        }
    }

    /// Visibility confirmation policy, if enabled.
    pub fn visibility_policy(&self) -> Option<VisibilityPolicy> {
        self.confirm_visibility.then_some(VisibilityPolicy {
            attempts: self.confirm_attempts,
            interval: self.confirm_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();

        assert!(settings.validate().is_ok());
        assert_eq!(settings.chunk_size().unwrap().get(), 5 * 1_024 * 1_024);
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.visibility_policy(), Some(VisibilityPolicy::default()));
        assert_eq!(settings.lookback_days(), 3);
    }

    #[test]
    fn test_lookback_days() {
        let lookback = |secs| {
            Settings {
                expiry: Duration::from_secs(secs),
                ..Settings::default()
            }
            .lookback_days()
        };

        assert_eq!(lookback(1), 1);
        assert_eq!(lookback(24 * 60 * 60), 1);
        assert_eq!(lookback(24 * 60 * 60 + 1), 2);
    }

    #[test]
    fn test_validate() {
        let settings = Settings {
            fetch_concurrency: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(reason)) if reason.contains("fetch_concurrency")));

        let settings = Settings {
            chunk_size: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert!(settings.chunk_size().is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
registry_url = "https://registry.example.org"
registry_token = "s3cr3t"
chunk_size = 1024
sync_interval = "30s"
retry_delay = "2m"
confirm_visibility = false
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();

        assert_eq!(settings.registry_url, "https://registry.example.org");
        assert_eq!(settings.registry_token.as_deref(), Some("s3cr3t"));
        assert_eq!(settings.chunk_size, 1_024);
        assert_eq!(settings.sync_interval, Duration::from_secs(30));
        assert_eq!(settings.retry_delay, Duration::from_secs(120));
        assert_eq!(settings.visibility_policy(), None);
        // untouched defaults
        assert_eq!(settings.fetch_concurrency, 3);
        assert_eq!(settings.expiry, Duration::from_secs(72 * 60 * 60));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "push_concurrency = 0").unwrap();

        assert!(matches!(Settings::load(Some(file.path())), Err(Error::Config(_))));
    }
}
