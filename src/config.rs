use std::num::NonZero;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context as _, bail};
use log::LevelFilter;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[macro_export]
macro_rules! nonzero {
    ($exp:expr) => {
        const {
            match NonZero::new($exp) {
                Some(v) => v,
                None => panic!("Value is zero"),
            }
        }
    };
}

pub(crate) const DEFAULT_CONFIGURATION_PATH: &str = "config.json";
pub(crate) const DEFAULT_HOST: &str = "0.0.0.0";
pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const DEFAULT_STORAGE_PATH: &str = "storage";
pub(crate) const DEFAULT_DATABASE_PATH: &str = "data/stats.db";
pub(crate) const DEFAULT_CACHE_DAYS: u64 = 7;
pub(crate) const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

pub(crate) const DEFAULT_BUF_SIZE: usize = 32 * 1024;
pub(crate) const DEFAULT_LOGSTORE_CAPACITY: NonZero<usize> = nonzero!(100);

/// Runtime configuration, read from `config.json` in the working directory.
/// Every key is optional; absent or zero-valued keys fall back to defaults.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// Address to listen on.
    pub(crate) host: String,

    /// Port to listen on.
    pub(crate) port: u16,

    /// Cache directory, relative paths are resolved against the working directory.
    pub(crate) storage_path: String,

    /// SQLite database file, relative paths are resolved against the working directory.
    pub(crate) database_path: String,

    /// Retention window in days for cached files.
    pub(crate) cache_days: u64,

    /// Whether cached files expire at all.
    pub(crate) cache_retention_enabled: bool,

    /// Minimum log level severity to output.
    /// Can be overridden via program options.
    #[serde(
        deserialize_with = "level_from_name",
        serialize_with = "level_to_name"
    )]
    pub(crate) log_level: LevelFilter,

    /// Whether requests for unregistered groups are proxied directly.
    pub(crate) passthrough_mode: bool,

    /// Bearer token guarding the admin endpoints. Empty disables authentication.
    pub(crate) admin_token: String,

    #[serde(skip)]
    pub(crate) storage_root: PathBuf,

    #[serde(skip)]
    pub(crate) database_file: PathBuf,

    #[serde(skip)]
    pub(crate) config_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            storage_path: DEFAULT_STORAGE_PATH.to_string(),
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            cache_days: DEFAULT_CACHE_DAYS,
            cache_retention_enabled: false,
            log_level: DEFAULT_LOG_LEVEL,
            passthrough_mode: false,
            admin_token: String::new(),
            storage_root: PathBuf::new(),
            database_file: PathBuf::new(),
            config_path: PathBuf::new(),
        }
    }
}

fn level_from_name<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    s.parse::<LevelFilter>().map_err(D::Error::custom)
}

fn level_to_name<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(level)
}

/// Lexically removes `.` and `..` components, without touching the filesystem.
#[must_use]
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => (),
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }

    normalized
}

#[must_use]
fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&base.join(path))
    }
}

impl Config {
    /// Reads the configuration from `file`. A missing file at the default
    /// location is not an error; the compiled-in defaults apply.
    /// Returns whether the default fallback was used.
    pub(crate) fn load(file: &Path) -> anyhow::Result<(Self, bool)> {
        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && file == Path::new(DEFAULT_CONFIGURATION_PATH) =>
            {
                let mut config = Self::default();
                config.resolve(file)?;
                return Ok((config, true));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read file `{}`", file.display()));
            }
        };

        let mut config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration")?;

        config.normalize();
        config.validate()?;
        config.resolve(file)?;

        Ok((config, false))
    }

    /// Maps zero-valued keys onto their defaults, mirroring how absent keys behave.
    fn normalize(&mut self) {
        if self.host.is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.storage_path.is_empty() {
            self.storage_path = DEFAULT_STORAGE_PATH.to_string();
        }
        if self.database_path.is_empty() {
            self.database_path = DEFAULT_DATABASE_PATH.to_string();
        }
        if self.cache_days == 0 {
            self.cache_days = DEFAULT_CACHE_DAYS;
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.cache_days.checked_mul(24 * 60 * 60).is_none() {
            bail!("Invalid cache_days value of {}: overflow", self.cache_days);
        }

        if self.admin_token.contains(char::is_whitespace) {
            bail!("Invalid admin_token: must not contain whitespace");
        }

        Ok(())
    }

    fn resolve(&mut self, config_path: &Path) -> anyhow::Result<()> {
        let base = std::env::current_dir().context("Failed to determine working directory")?;

        self.storage_root = absolutize(&base, Path::new(&self.storage_path));
        self.database_file = absolutize(&base, Path::new(&self.database_path));
        self.config_path = absolutize(&base, config_path);

        Ok(())
    }

    #[must_use]
    pub(crate) fn retention_window(&self) -> Duration {
        Duration::from_secs(self.cache_days * 24 * 60 * 60)
    }

    /// Persists the current settings back to the configuration file.
    /// Used by the admin config update.
    pub(crate) fn save(&self) -> anyhow::Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&self.config_path, content)
            .with_context(|| format!("Failed to write file `{}`", self.config_path.display()))
    }
}

/// Immutable configuration snapshot published through an atomically swapped
/// pointer. Readers never observe a half-updated configuration; a reload
/// replaces the whole snapshot.
#[derive(Clone, Debug)]
pub(crate) struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    #[must_use]
    pub(crate) fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    #[must_use]
    pub(crate) fn current(&self) -> Arc<Config> {
        self.inner
            .read()
            .expect("other users should not panic")
            .clone()
    }

    pub(crate) fn replace(&self, config: Config) {
        let mut slot = self.inner.write().expect("other users should not panic");
        *slot = Arc::new(config);
    }
}
