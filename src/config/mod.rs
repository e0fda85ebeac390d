//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagsweep";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_BATCH_SIZE: u64 = 1000;
const DEFAULT_UPSTREAM_ENDPOINT: &str = "https://graphql.datocms.com/";
const DEFAULT_UPSTREAM_TAG_HEADER: &str = "x-cache-tags";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DOWNSTREAM_TAG_LIMIT: u64 = 64;
const DEFAULT_DOWNSTREAM_MEMORY_CAPACITY: u64 = 10_000;
const DEFAULT_INVALIDATION_CONCURRENCY: u64 = 8;
const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://site-api.datocms.com/";

/// Command-line arguments for the tagsweep binary.
#[derive(Debug, Parser)]
#[command(
    name = "tagsweep",
    version,
    about = "Tag-indexed cache invalidation service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGSWEEP_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the webhook and query HTTP service.
    Serve(Box<ServeArgs>),
    /// Apply database migrations and exit.
    Migrate(DatabaseOverride),
    /// Invalidate the whole downstream cache and drop every association.
    Purge(DatabaseOverride),
    /// Register the cache tag invalidation webhook on the content source.
    RegisterWebhook(RegisterWebhookArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct RegisterWebhookArgs {
    /// Public base URL this service is reachable at.
    #[arg(long = "public-url", value_name = "URL")]
    pub public_url: Option<String>,

    /// Override the content management API token.
    #[arg(long = "management-token", value_name = "TOKEN")]
    pub management_token: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
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

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the upstream content endpoint.
    #[arg(long = "upstream-endpoint", value_name = "URL")]
    pub upstream_endpoint: Option<String>,

    /// Override the downstream revalidation endpoint.
    #[arg(long = "downstream-revalidate-url", value_name = "URL")]
    pub downstream_revalidate_url: Option<String>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub upstream: UpstreamSettings,
    pub downstream: DownstreamSettings,
    pub webhook: WebhookSettings,
    pub invalidation: InvalidationSettings,
    pub management: ManagementSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    /// Upper bound on values bound into one statement.
    pub batch_size: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub endpoint: Url,
    pub api_token: Option<String>,
    pub tag_header: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DownstreamSettings {
    pub revalidate_url: Option<Url>,
    pub token: Option<String>,
    pub tag_limit: NonZeroUsize,
    /// Entry bound of the in-process cache used without `revalidate_url`.
    pub memory_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Shared secret; `None` only when the current command does not serve HTTP.
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvalidationSettings {
    pub concurrency: NonZeroUsize,
}

/// Content management API used to register the invalidation webhook.
#[derive(Debug, Clone)]
pub struct ManagementSettings {
    pub endpoint: Url,
    pub api_token: Option<String>,
    pub public_url: Option<Url>,
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

    builder = builder.add_source(Environment::with_prefix("TAGSWEEP").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(database)) | Some(Command::Purge(database)) => {
            raw.apply_database_override(database)
        }
        Some(Command::RegisterWebhook(args)) => raw.apply_registration_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    upstream: RawUpstreamSettings,
    downstream: RawDownstreamSettings,
    webhook: RawWebhookSettings,
    invalidation: RawInvalidationSettings,
    management: RawManagementSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
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
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(endpoint) = overrides.upstream_endpoint.as_ref() {
            self.upstream.endpoint = Some(endpoint.clone());
        }
        if let Some(url) = overrides.downstream_revalidate_url.as_ref() {
            self.downstream.revalidate_url = Some(url.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_registration_overrides(&mut self, args: &RegisterWebhookArgs) {
        if let Some(url) = args.public_url.as_ref() {
            self.management.public_url = Some(url.clone());
        }
        if let Some(token) = args.management_token.as_ref() {
            self.management.api_token = Some(token.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            upstream,
            downstream,
            webhook,
            invalidation,
            management,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            upstream: build_upstream_settings(upstream)?,
            downstream: build_downstream_settings(downstream)?,
            webhook: build_webhook_settings(webhook),
            invalidation: build_invalidation_settings(invalidation)?,
            management: build_management_settings(management)?,
        })
    }

    /// Shared secret required by `serve`.
    pub fn require_webhook_token(&self) -> Result<&str, LoadError> {
        self.webhook
            .token
            .as_deref()
            .ok_or_else(|| LoadError::invalid("webhook.token", "must be set to serve HTTP"))
    }

    /// Public base URL the content source should deliver webhooks to.
    pub fn require_public_url(&self) -> Result<&Url, LoadError> {
        self.management.public_url.as_ref().ok_or_else(|| {
            LoadError::invalid("management.public_url", "must be set to register the webhook")
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;
    let batch_size = non_zero_usize(
        database.batch_size.unwrap_or(DEFAULT_DB_BATCH_SIZE),
        "database.batch_size",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
        batch_size,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let endpoint = parse_http_url(
        upstream
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_UPSTREAM_ENDPOINT),
        "upstream.endpoint",
    )?;

    let tag_header = non_blank(upstream.tag_header)
        .unwrap_or_else(|| DEFAULT_UPSTREAM_TAG_HEADER.to_string())
        .to_ascii_lowercase();
    axum::http::HeaderName::from_str(&tag_header)
        .map_err(|err| LoadError::invalid("upstream.tag_header", err.to_string()))?;

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        endpoint,
        api_token: non_blank(upstream.api_token),
        tag_header,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_downstream_settings(
    downstream: RawDownstreamSettings,
) -> Result<DownstreamSettings, LoadError> {
    let revalidate_url = non_blank(downstream.revalidate_url)
        .map(|value| parse_http_url(&value, "downstream.revalidate_url"))
        .transpose()?;

    let tag_limit = non_zero_usize(
        downstream.tag_limit.unwrap_or(DEFAULT_DOWNSTREAM_TAG_LIMIT),
        "downstream.tag_limit",
    )?;

    let memory_capacity = non_zero_usize(
        downstream
            .memory_capacity
            .unwrap_or(DEFAULT_DOWNSTREAM_MEMORY_CAPACITY),
        "downstream.memory_capacity",
    )?;

    Ok(DownstreamSettings {
        revalidate_url,
        token: non_blank(downstream.token),
        tag_limit,
        memory_capacity,
    })
}

fn build_webhook_settings(webhook: RawWebhookSettings) -> WebhookSettings {
    WebhookSettings {
        token: non_blank(webhook.token),
    }
}

fn build_invalidation_settings(
    invalidation: RawInvalidationSettings,
) -> Result<InvalidationSettings, LoadError> {
    Ok(InvalidationSettings {
        concurrency: non_zero_usize(
            invalidation
                .concurrency
                .unwrap_or(DEFAULT_INVALIDATION_CONCURRENCY),
            "invalidation.concurrency",
        )?,
    })
}

fn build_management_settings(
    management: RawManagementSettings,
) -> Result<ManagementSettings, LoadError> {
    let endpoint = non_blank(management.endpoint)
        .unwrap_or_else(|| DEFAULT_MANAGEMENT_ENDPOINT.to_string());
    let endpoint = parse_http_url(&endpoint, "management.endpoint")?;

    let public_url = non_blank(management.public_url)
        .map(|value| parse_http_url(&value, "management.public_url"))
        .transpose()?;

    Ok(ManagementSettings {
        endpoint,
        api_token: non_blank(management.api_token),
        public_url,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    batch_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    endpoint: Option<String>,
    api_token: Option<String>,
    tag_header: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDownstreamSettings {
    revalidate_url: Option<String>,
    token: Option<String>,
    tag_limit: Option<u64>,
    memory_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWebhookSettings {
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInvalidationSettings {
    concurrency: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawManagementSettings {
    endpoint: Option<String>,
    api_token: Option<String>,
    public_url: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(value).map_err(|err| LoadError::invalid(key, format!("{err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
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
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.database.batch_size.get(), 1000);
        assert!(settings.database.url.is_none());
        assert_eq!(settings.upstream.endpoint.as_str(), DEFAULT_UPSTREAM_ENDPOINT);
        assert_eq!(settings.upstream.tag_header, "x-cache-tags");
        assert_eq!(settings.downstream.tag_limit.get(), 64);
        assert_eq!(settings.downstream.memory_capacity.get(), 10_000);
        assert!(settings.downstream.revalidate_url.is_none());
        assert_eq!(settings.invalidation.concurrency.get(), 8);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn blank_secrets_are_treated_as_absent() {
        let mut raw = RawSettings::default();
        raw.webhook.token = Some("   ".to_string());

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.webhook.token.is_none());
        assert!(matches!(
            settings.require_webhook_token(),
            Err(LoadError::Invalid {
                key: "webhook.token",
                ..
            })
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut raw = RawSettings::default();
        raw.database.batch_size = Some(0);

        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "database.batch_size",
                ..
            }
        ));
    }

    #[test]
    fn non_http_endpoints_are_rejected() {
        let mut raw = RawSettings::default();
        raw.upstream.endpoint = Some("ftp://example.com/".to_string());

        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "upstream.endpoint",
                ..
            }
        ));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["tagsweep"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_purge_arguments() {
        let args = CliArgs::parse_from([
            "tagsweep",
            "purge",
            "--database-url",
            "postgres://example",
        ]);

        match args.command.expect("purge command") {
            Command::Purge(database) => {
                assert_eq!(database.database_url.as_deref(), Some("postgres://example"));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "tagsweep",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--downstream-revalidate-url",
            "http://localhost:8080/revalidate",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(
                    serve.overrides.downstream_revalidate_url.as_deref(),
                    Some("http://localhost:8080/revalidate")
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn register_webhook_overrides_fill_the_management_section() {
        let args = CliArgs::parse_from([
            "tagsweep",
            "register-webhook",
            "--public-url",
            "https://blog.example.com",
            "--management-token",
            "cma-token",
        ]);

        let Some(Command::RegisterWebhook(register)) = args.command else {
            panic!("wrong command parsed");
        };

        let mut raw = RawSettings::default();
        raw.apply_registration_overrides(&register);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(
            settings.require_public_url().unwrap().as_str(),
            "https://blog.example.com/"
        );
        assert_eq!(settings.management.api_token.as_deref(), Some("cma-token"));
        assert_eq!(
            settings.management.endpoint.as_str(),
            DEFAULT_MANAGEMENT_ENDPOINT
        );
    }

    #[test]
    fn missing_public_url_is_reported() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert!(matches!(
            settings.require_public_url(),
            Err(LoadError::Invalid {
                key: "management.public_url",
                ..
            })
        ));
    }
}
