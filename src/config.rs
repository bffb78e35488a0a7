//! Replica configuration.
//!
//! Configuration is loaded in layers with the following precedence (lowest to highest):
//! 1. Environment variables (`ASPEN_SINGLETON_*`)
//! 2. TOML configuration file
//! 3. Command-line arguments
//!
//! [`SingletonConfig::validate`] runs before the coordinator touches the store.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::coordination::ElectionConfig;
use crate::coordination::pure::is_renew_interval_safe;

/// Configuration for one singleton replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingletonConfig {
    /// Unique identity of this replica. Empty means "generate one".
    pub identity: String,

    /// Name of the lease guarding the singleton.
    pub lease_name: String,

    /// Namespace the lease lives in.
    pub lease_namespace: String,

    /// How long a lease protects its holder without renewal.
    pub lease_duration_ms: u64,

    /// How often the leader renews. Must be below `lease_duration_ms`.
    pub renew_interval_ms: u64,

    /// Base delay between acquisition attempts while standing by.
    pub retry_period_ms: u64,

    /// Random jitter added to retries, as a fraction in `[0, 1]`.
    pub jitter_factor: f64,

    /// Cap on exponential backoff after transient store errors.
    pub max_backoff_ms: u64,

    /// Number of reconciliation workers started while leading.
    pub worker_count: u32,

    /// How long a new leader waits for its caches before giving up.
    pub cache_sync_timeout_ms: u64,

    /// Delay before a key whose reconcile failed is retried.
    pub requeue_delay_ms: u64,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        let election = ElectionConfig::default();
        Self {
            identity: String::new(),
            lease_name: default_lease_name(),
            lease_namespace: default_lease_namespace(),
            lease_duration_ms: election.lease_duration_ms,
            renew_interval_ms: election.renew_interval_ms,
            retry_period_ms: election.retry_period_ms,
            jitter_factor: election.jitter_factor,
            max_backoff_ms: election.max_backoff_ms,
            worker_count: DEFAULT_WORKER_COUNT,
            cache_sync_timeout_ms: DEFAULT_CACHE_SYNC_TIMEOUT_MS,
            requeue_delay_ms: DEFAULT_REQUEUE_DELAY_MS,
        }
    }
}

/// Workers started when nothing else is configured.
pub const DEFAULT_WORKER_COUNT: u32 = 2;

/// Default bound on the post-election cache sync wait.
pub const DEFAULT_CACHE_SYNC_TIMEOUT_MS: u64 = 60_000;

/// Default delay before a failed key is retried.
pub const DEFAULT_REQUEUE_DELAY_MS: u64 = 1_000;

/// Prefix for every environment variable read by [`SingletonConfig::from_env`].
pub const ENV_PREFIX: &str = "ASPEN_SINGLETON_";

impl SingletonConfig {
    /// Load configuration from a TOML file. Missing fields take defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from `ASPEN_SINGLETON_<FIELD>` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Unset or unparsable variables fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |field: &str| lookup(&format!("{ENV_PREFIX}{field}"));
        let defaults = Self::default();
        Self {
            identity: get("IDENTITY").unwrap_or(defaults.identity),
            lease_name: get("LEASE_NAME").unwrap_or(defaults.lease_name),
            lease_namespace: get("LEASE_NAMESPACE").unwrap_or(defaults.lease_namespace),
            lease_duration_ms: parse(get("LEASE_DURATION_MS")).unwrap_or(defaults.lease_duration_ms),
            renew_interval_ms: parse(get("RENEW_INTERVAL_MS")).unwrap_or(defaults.renew_interval_ms),
            retry_period_ms: parse(get("RETRY_PERIOD_MS")).unwrap_or(defaults.retry_period_ms),
            jitter_factor: parse(get("JITTER_FACTOR")).unwrap_or(defaults.jitter_factor),
            max_backoff_ms: parse(get("MAX_BACKOFF_MS")).unwrap_or(defaults.max_backoff_ms),
            worker_count: parse(get("WORKER_COUNT")).unwrap_or(defaults.worker_count),
            cache_sync_timeout_ms: parse(get("CACHE_SYNC_TIMEOUT_MS")).unwrap_or(defaults.cache_sync_timeout_ms),
            requeue_delay_ms: parse(get("REQUEUE_DELAY_MS")).unwrap_or(defaults.requeue_delay_ms),
        }
    }

    /// Merge configuration from a higher-precedence layer.
    ///
    /// Fields in `other` that differ from the defaults override fields in `self`.
    pub fn merge(&mut self, other: Self) {
        let defaults = Self::default();
        if other.identity != defaults.identity {
            self.identity = other.identity;
        }
        if other.lease_name != defaults.lease_name {
            self.lease_name = other.lease_name;
        }
        if other.lease_namespace != defaults.lease_namespace {
            self.lease_namespace = other.lease_namespace;
        }
        if other.lease_duration_ms != defaults.lease_duration_ms {
            self.lease_duration_ms = other.lease_duration_ms;
        }
        if other.renew_interval_ms != defaults.renew_interval_ms {
            self.renew_interval_ms = other.renew_interval_ms;
        }
        if other.retry_period_ms != defaults.retry_period_ms {
            self.retry_period_ms = other.retry_period_ms;
        }
        if other.jitter_factor != defaults.jitter_factor {
            self.jitter_factor = other.jitter_factor;
        }
        if other.max_backoff_ms != defaults.max_backoff_ms {
            self.max_backoff_ms = other.max_backoff_ms;
        }
        if other.worker_count != defaults.worker_count {
            self.worker_count = other.worker_count;
        }
        if other.cache_sync_timeout_ms != defaults.cache_sync_timeout_ms {
            self.cache_sync_timeout_ms = other.cache_sync_timeout_ms;
        }
        if other.requeue_delay_ms != defaults.requeue_delay_ms {
            self.requeue_delay_ms = other.requeue_delay_ms;
        }
    }

    /// Fill in a generated identity if none was configured.
    pub fn with_default_identity(mut self) -> Self {
        if self.identity.is_empty() {
            self.identity = default_identity();
        }
        self
    }

    /// Validate the configuration. Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.trim().is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.lease_name.trim().is_empty() {
            return Err(ConfigError::MissingLeaseName);
        }
        if self.lease_namespace.trim().is_empty() {
            return Err(ConfigError::MissingLeaseNamespace);
        }

        for (field, value) in [
            ("lease_duration_ms", self.lease_duration_ms),
            ("renew_interval_ms", self.renew_interval_ms),
            ("retry_period_ms", self.retry_period_ms),
            ("cache_sync_timeout_ms", self.cache_sync_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        if !is_renew_interval_safe(self.renew_interval_ms, self.lease_duration_ms) {
            return Err(ConfigError::RenewIntervalTooLong {
                renew_interval_ms: self.renew_interval_ms,
                lease_duration_ms: self.lease_duration_ms,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitter {
                value: self.jitter_factor,
            });
        }

        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }

        Ok(())
    }

    /// Non-fatal observations about timing choices.
    ///
    /// Returns a vector of warning messages, empty if the timings look sane.
    pub fn check_timing_sanity(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.renew_interval_ms.saturating_mul(2) > self.lease_duration_ms {
            warnings.push(format!(
                "renew interval ({}ms) leaves less than one retry before the lease ({}ms) expires",
                self.renew_interval_ms, self.lease_duration_ms
            ));
        }

        if self.retry_period_ms > self.lease_duration_ms {
            warnings.push(format!(
                "retry period ({}ms) is longer than the lease duration ({}ms), failover will be slow",
                self.retry_period_ms, self.lease_duration_ms
            ));
        }

        if self.max_backoff_ms < self.retry_period_ms {
            warnings.push(format!(
                "max backoff ({}ms) is below the retry period ({}ms) and will cap every retry",
                self.max_backoff_ms, self.retry_period_ms
            ));
        }

        warnings
    }

    /// Election timings as used by the elector.
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            lease_duration_ms: self.lease_duration_ms,
            renew_interval_ms: self.renew_interval_ms,
            retry_period_ms: self.retry_period_ms,
            jitter_factor: self.jitter_factor,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    /// Cache sync timeout as a [`Duration`].
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_sync_timeout_ms)
    }

    /// Requeue delay as a [`Duration`].
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

/// Generate a replica identity of the form `{hostname}_{uuid}`.
pub fn default_identity() -> String {
    format!("{}_{}", hostname(), uuid::Uuid::new_v4())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

fn default_lease_name() -> String {
    "aspen-singleton".into()
}

fn default_lease_namespace() -> String {
    "default".into()
}

fn parse<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value?.trim().parse().ok()
}

/// Configuration loading and validation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("lease name must not be empty"))]
    MissingLeaseName,

    #[snafu(display("lease namespace must not be empty"))]
    MissingLeaseNamespace,

    #[snafu(display("replica identity must not be empty"))]
    MissingIdentity,

    #[snafu(display("{field} must be greater than 0"))]
    ZeroDuration { field: &'static str },

    #[snafu(display(
        "renew_interval_ms ({renew_interval_ms}) must be less than lease_duration_ms ({lease_duration_ms})"
    ))]
    RenewIntervalTooLong {
        renew_interval_ms: u64,
        lease_duration_ms: u64,
    },

    #[snafu(display("jitter_factor must be within [0, 1], got {value}"))]
    InvalidJitter { value: f64 },

    #[snafu(display("worker_count must be at least 1"))]
    ZeroWorkers,
}
