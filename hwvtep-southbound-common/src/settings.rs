use config::{Config, Environment, File, FileFormat};
use hwvtep_southbound_error::{SouthboundError, SouthboundResult};
use hwvtep_southbound_sdk::SouthboundOptions;
use serde::Deserialize;
use std::{ops::Deref, str::FromStr, sync::Arc};
use tracing::Level;

/// Prefix of environment overrides, e.g. `HWVTEP__GENERAL__LOG_LEVEL=debug`.
pub const ENV_PREFIX: &str = "HWVTEP";

/// Loaded process settings. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Settings {
    /// Load from an optional file at `config_path`, then apply environment overrides.
    pub fn new(config_path: &str) -> SouthboundResult<Self> {
        Self::build(File::with_name(config_path).required(false))
    }

    /// Load from in-memory content, then apply environment overrides.
    pub fn from_content(content: &str, format: FileFormat) -> SouthboundResult<Self> {
        Self::build(File::from_str(content, format))
    }

    fn build<S>(source: S) -> SouthboundResult<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let inner: Inner = Config::builder()
            .add_source(source)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        inner.validate()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn options(&self) -> &SouthboundOptions {
        &self.0.southbound
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub southbound: SouthboundOptions,
}

impl Inner {
    fn validate(&self) -> SouthboundResult<()> {
        self.general.level()?;
        let sb = &self.southbound;
        if sb.history_capacity == 0 {
            return Err(invalid("southbound.historyCapacity must be greater than 0"));
        }
        if sb.history_log_threshold == 0 {
            return Err(invalid(
                "southbound.historyLogThreshold must be greater than 0",
            ));
        }
        if sb.transact_timeout == 0 || sb.reconcile_timeout == 0 || sb.ownership_timeout == 0 {
            return Err(invalid("southbound timeouts must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    #[serde(default = "General::log_level_default")]
    pub log_level: String,
    /// Directory of the daily rolling log file, relative to the working directory.
    #[serde(default = "General::log_dir_default")]
    pub log_dir: String,
    #[serde(default = "General::log_file_default")]
    pub log_file: String,
}

impl General {
    fn log_level_default() -> String {
        "info".to_string()
    }

    fn log_dir_default() -> String {
        "logs".to_string()
    }

    fn log_file_default() -> String {
        "hwvtep-southbound.log".to_string()
    }

    pub fn level(&self) -> SouthboundResult<Level> {
        Level::from_str(self.log_level.trim())
            .map_err(|_| invalid(format!("unknown log level '{}'", self.log_level)))
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: Self::log_level_default(),
            log_dir: Self::log_dir_default(),
            log_file: Self::log_file_default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> SouthboundError {
    SouthboundError::Config(config::ConfigError::Message(msg.into()))
}
