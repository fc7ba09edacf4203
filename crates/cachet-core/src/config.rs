//! Configuration.
//!
//! 読み込み順（後勝ち）：
//! 1. serde の既定値
//! 2. TOML ファイル（任意）
//! 3. 環境変数 `CACHET__SECTION__KEY`（例: `CACHET__STORE__BACKEND=sqlite`）
//!
//! バックエンドの選択は起動時に一度だけ `StoreBackend` で決まる。

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CachetConfig {
    pub pool: PoolConfig,
    pub store: StoreConfig,
    pub signing: SigningConfig,
    pub subscriptions: SubscriptionConfig,
    pub gc: GcConfig,
    pub logging: LoggingConfig,
}

impl CachetConfig {
    /// Load defaults, then the optional file, then `CACHET__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CACHET")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: CachetConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".into()));
        }
        if self.pool.task_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pool.task_timeout_ms must be positive".into(),
            ));
        }
        if self.signing.url_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "signing.url_ttl_secs must be positive".into(),
            ));
        }
        if let Some(secret) = &self.signing.secret_hex {
            let decoded = hex::decode(secret)
                .map_err(|e| ConfigError::Invalid(format!("signing.secret_hex: {e}")))?;
            if decoded.len() < 16 {
                return Err(ConfigError::Invalid(
                    "signing.secret_hex must decode to at least 16 bytes".into(),
                ));
            }
        }
        if self.store.backend == StoreBackend::Remote && self.store.remote.database_url.is_empty()
        {
            return Err(ConfigError::Invalid(
                "store.remote.database_url is required for the remote backend".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of long-lived worker threads.
    pub size: usize,
    pub task_timeout_ms: u64,
    pub max_buffer_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            task_timeout_ms: 30_000,
            max_buffer_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Artifact TTL. `<= 0` means artifacts never expire.
    pub ttl_ms: i64,
    pub memory: MemoryStoreConfig,
    pub sqlite: SqliteStoreConfig,
    pub remote: RemoteStoreConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ttl_ms: 60 * 60 * 1000,
            memory: MemoryStoreConfig::default(),
            sqlite: SqliteStoreConfig::default(),
            remote: RemoteStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Bodies larger than this are written to `spill_dir`. `None` disables spilling.
    pub spill_threshold_bytes: Option<usize>,
    pub spill_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteStoreConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cachet.db"),
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Object keys are `<key_prefix>/<artifact id>`.
    pub key_prefix: String,
    pub object_store: ObjectStoreConfig,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 8,
            key_prefix: "artifacts".to_string(),
            object_store: ObjectStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStoreKind {
    #[default]
    Memory,
    Local,
    S3,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub kind: ObjectStoreKind,
    /// Root directory for `local`.
    pub root: Option<PathBuf>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Hex-encoded HMAC secret. A random secret is generated when absent,
    /// which invalidates outstanding URLs on restart.
    pub secret_hex: Option<String>,
    pub url_ttl_secs: u64,
    pub base_url: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            secret_hex: None,
            url_ttl_secs: 15 * 60,
            base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Sliding TTL, refreshed on each subscribe. `<= 0` disables expiry.
    pub ttl_ms: i64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Sweep interval. `0` disables the background loop.
    pub interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CachetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.pool.size >= 1);
        assert_eq!(config.pool.task_timeout_ms, 30_000);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pool]
size = 3

[store]
backend = "sqlite"
ttl_ms = 0

[store.sqlite]
path = "/tmp/cachet-test.db"

[signing]
secret_hex = "00112233445566778899aabbccddeeff"
"#
        )
        .unwrap();

        let config = CachetConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.pool.size, 3);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.ttl_ms, 0);
        assert_eq!(
            config.store.sqlite.path,
            PathBuf::from("/tmp/cachet-test.db")
        );
        // untouched sections keep their defaults
        assert_eq!(config.subscriptions.ttl_ms, 30 * 60 * 1000);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut config = CachetConfig::default();
        config.pool.size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn remote_backend_requires_database_url() {
        let mut config = CachetConfig::default();
        config.store.backend = StoreBackend::Remote;
        assert!(config.validate().is_err());

        config.store.remote.database_url = "postgres://localhost/cachet".into();
        config.validate().unwrap();
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut config = CachetConfig::default();
        config.signing.secret_hex = Some("abcd".into());
        assert!(config.validate().is_err());

        config.signing.secret_hex = Some("not hex".into());
        assert!(config.validate().is_err());
    }
}
