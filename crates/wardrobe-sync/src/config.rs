use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::providers::BackendConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "wardrobe".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Lifetime and caching of signed photo URLs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct SignedUrlConfig {
    /// The lifetime requested from the backend for every signed URL.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Cached URLs with less than this much lifetime left are not handed out anymore.
    #[serde(with = "humantime_serde")]
    pub expiry_buffer: Duration,
    /// How often fully expired URLs are swept from the cache.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for SignedUrlConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            expiry_buffer: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long to wait for the initial session lookup before treating the user as signed out.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// The longest a caller waits for a delete to finish.
    #[serde(with = "humantime_serde")]
    pub delete_timeout: Duration,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            delete_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection details of the remote backend.
    ///
    /// Only needed when talking to the real backend through [`HttpBackend`](crate::providers::HttpBackend).
    pub backend: Option<BackendConfig>,

    pub signed_urls: SignedUrlConfig,

    pub auth: AuthConfig,

    pub operations: OperationsConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Checks the relations between durations that the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        let urls = &self.signed_urls;
        if urls.ttl.is_zero() || urls.cleanup_interval.is_zero() {
            anyhow::bail!("signed_urls.ttl and signed_urls.cleanup_interval must not be zero");
        }
        if urls.expiry_buffer >= urls.ttl {
            anyhow::bail!(
                "signed_urls.expiry_buffer ({}) must be shorter than signed_urls.ttl ({}), \
                 otherwise no URL is ever served from the cache",
                humantime::format_duration(urls.expiry_buffer),
                humantime::format_duration(urls.ttl),
            );
        }
        if self.auth.ready_timeout.is_zero() {
            anyhow::bail!("auth.ready_timeout must not be zero");
        }
        if self.operations.delete_timeout.is_zero() {
            anyhow::bail!("operations.delete_timeout must not be zero");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
