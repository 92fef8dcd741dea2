//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::default_directory;
use crate::domain::targets::TargetKind;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "analytics-relay";
const ENV_PREFIX: &str = "ANALYTICS_RELAY";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3100;
const DEFAULT_QUERY_TTL_SECS: u64 = 3600;
const DEFAULT_SIZE_LIMIT_BYTES: u64 = 500 * 1024 * 1024;
const DEFAULT_DISCOVERY_TTL_SECS: u64 = 86_400;
const DEFAULT_DISCOVERY_MAX_ENTRIES: u64 = 100;
const DEFAULT_MAX_BATCH_SIZE: u64 = 20;
const DEFAULT_CONCURRENCY_LIMIT: u64 = 3;
const DEFAULT_TARGET_TIMEOUT_SECS: u64 = 300;

/// Command-line arguments for the analytics-relay binary.
#[derive(Debug, Parser)]
#[command(
    name = "analytics-relay",
    version,
    about = "Cached multi-target query relay for GA4 and Search Console"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ANALYTICS_RELAY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the cache status endpoint.
    Serve(Box<ServeArgs>),
    /// Inspect or maintain the on-disk query cache.
    Cache(CacheArgs),
    /// Offline helpers for target identifiers.
    Targets(TargetsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the on-disk cache directory.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub cache_directory: Option<PathBuf>,

    /// Enable or disable the query cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the lifetime of cached query results.
    #[arg(long = "cache-query-ttl-seconds", value_name = "SECONDS")]
    pub cache_query_ttl_seconds: Option<u64>,

    /// Override the on-disk size limit in bytes.
    #[arg(long = "cache-size-limit-bytes", value_name = "BYTES")]
    pub cache_size_limit_bytes: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct CacheArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheCommand {
    /// Print hit/miss counters as JSON.
    Stats,
    /// Run the health check; exits non-zero when unhealthy.
    Health,
    /// Remove cached entries.
    Clear(ClearArgs),
    /// Remove expired and corrupted entries.
    Repair,
}

#[derive(Debug, Args, Clone, Default)]
pub struct ClearArgs {
    /// Only clear this namespace (for example `ga4_report`).
    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct TargetsArgs {
    #[command(subcommand)]
    pub command: TargetsCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum TargetsCommand {
    /// Split identifiers into valid and invalid lists.
    Validate(ValidateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ValidateArgs {
    /// Identifier kind: `property-id` or `domain`.
    #[arg(long, value_name = "KIND")]
    pub kind: TargetKind,

    /// Identifiers; comma-separated values are split.
    #[arg(value_name = "VALUES", required = true, num_args = 1..)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub query: QuerySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub query_ttl: Duration,
    pub size_limit_bytes: NonZeroU64,
    pub discovery_ttl: Duration,
    pub discovery_max_entries: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub max_batch_size: NonZeroUsize,
    pub concurrency_limit: NonZeroUsize,
    pub target_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Cache(args)) => raw.apply_cache_overrides(&args.overrides),
        Some(Command::Targets(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    query: RawQuerySettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_cache_overrides(&overrides.cache);
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(dir) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(dir.clone());
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.cache_query_ttl_seconds {
            self.cache.query_ttl_seconds = Some(seconds);
        }
        if let Some(bytes) = overrides.cache_size_limit_bytes {
            self.cache.size_limit_bytes = Some(bytes);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            query,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            query: build_query_settings(query)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid("server.port", "port must be greater than zero"));
    }
    let addr = parse_socket_addr(&host, port).map_err(|reason| LoadError::invalid("server.addr", reason))?;
    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str())
            .map_err(|err| LoadError::invalid("logging.level", format!("failed to parse: {err}")))?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = match cache.directory {
        Some(dir) if dir.as_os_str().is_empty() => {
            return Err(LoadError::invalid("cache.directory", "must not be empty"));
        }
        Some(dir) => dir,
        None => default_directory(),
    };

    let query_ttl = cache.query_ttl_seconds.unwrap_or(DEFAULT_QUERY_TTL_SECS);
    if query_ttl == 0 {
        return Err(LoadError::invalid("cache.query_ttl_seconds", "must be greater than zero"));
    }
    let discovery_ttl = cache.discovery_ttl_seconds.unwrap_or(DEFAULT_DISCOVERY_TTL_SECS);
    if discovery_ttl == 0 {
        return Err(LoadError::invalid(
            "cache.discovery_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let size_limit_bytes = NonZeroU64::new(cache.size_limit_bytes.unwrap_or(DEFAULT_SIZE_LIMIT_BYTES))
        .ok_or_else(|| LoadError::invalid("cache.size_limit_bytes", "must be greater than zero"))?;
    let discovery_max_entries = non_zero_usize(
        cache.discovery_max_entries.unwrap_or(DEFAULT_DISCOVERY_MAX_ENTRIES),
        "cache.discovery_max_entries",
    )?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        directory,
        query_ttl: Duration::from_secs(query_ttl),
        size_limit_bytes,
        discovery_ttl: Duration::from_secs(discovery_ttl),
        discovery_max_entries,
    })
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    let max_batch_size = non_zero_usize(
        query.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE),
        "query.max_batch_size",
    )?;
    let concurrency_limit = non_zero_usize(
        query.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT),
        "query.concurrency_limit",
    )?;
    let timeout_secs = query.target_timeout_seconds.unwrap_or(DEFAULT_TARGET_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "query.target_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(QuerySettings {
        max_batch_size,
        concurrency_limit,
        target_timeout: Duration::from_secs(timeout_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    query_ttl_seconds: Option<u64>,
    size_limit_bytes: Option<u64>,
    discovery_ttl_seconds: Option<u64>,
    discovery_max_entries: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    max_batch_size: Option<u64>,
    concurrency_limit: Option<u64>,
    target_timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.server.addr, "127.0.0.1:3100".parse().expect("addr"));
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert!(settings.cache.enabled);
        assert!(settings.cache.directory.ends_with(".ga_gsc_cache"));
        assert_eq!(settings.cache.query_ttl, Duration::from_secs(3600));
        assert_eq!(settings.cache.size_limit_bytes.get(), 524_288_000);
        assert_eq!(settings.cache.discovery_max_entries.get(), 100);
        assert_eq!(settings.query.max_batch_size.get(), 20);
        assert_eq!(settings.query.concurrency_limit.get(), 3);
        assert_eq!(settings.query.target_timeout, Duration::from_secs(300));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.cache.query_ttl_seconds = Some(60);

        let overrides = ServeOverrides {
            cache: CacheOverrides {
                cache_query_ttl_seconds: Some(120),
                ..Default::default()
            },
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.cache.query_ttl, Duration::from_secs(120));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut raw = RawSettings::default();
        raw.query.concurrency_limit = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero concurrency");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "query.concurrency_limit",
                ..
            }
        ));

        let mut raw = RawSettings::default();
        raw.cache.size_limit_bytes = Some(0);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        raw.apply_serve_overrides(&ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        });
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["analytics-relay"]);
        assert!(args.command.is_none());
    }

    #[test]
    fn parse_cache_clear_arguments() {
        let args = CliArgs::parse_from([
            "analytics-relay",
            "cache",
            "--cache-directory",
            "/tmp/relay",
            "clear",
            "--namespace",
            "gsc_report",
        ]);
        let Some(Command::Cache(cache)) = args.command else {
            panic!("expected cache command");
        };
        assert_eq!(cache.overrides.cache_directory, Some(PathBuf::from("/tmp/relay")));
        match cache.command {
            CacheCommand::Clear(clear) => assert_eq!(clear.namespace.as_deref(), Some("gsc_report")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parse_targets_validate_arguments() {
        let args = CliArgs::parse_from([
            "analytics-relay",
            "targets",
            "validate",
            "--kind",
            "domain",
            "example.com,bad",
            "example.org",
        ]);
        let Some(Command::Targets(TargetsArgs {
            command: TargetsCommand::Validate(validate),
        })) = args.command
        else {
            panic!("expected targets validate");
        };
        assert_eq!(validate.kind, TargetKind::Domain);
        assert_eq!(validate.values, vec!["example.com,bad", "example.org"]);
    }
}
