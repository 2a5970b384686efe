use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use url::Url;

use crate::retry::RetryPolicy;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// The configuration one service receives, either from the
// configuration server (keyed by service name) or from a local
// JSON file.
//
// It defines:
// - Transport (Redis) connection settings
// - Store (Postgres) credentials
// - Telemetry endpoint
// - Per-source scrape parameters (collectors only)
// - Retry budget for transport operations
//
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub transport: TransportConfig,

    /// Only required by the aggregator and the showcase server
    pub postgres: Option<PostgresConfig>,

    #[serde(rename = "influxDB", default)]
    pub influx: InfluxConfig,

    /// Only required by source collectors
    pub provider: Option<ProviderConfig>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config server variables incomplete: need CONFIG_SERVER_SCHEMA, CONFIG_SERVER_HOST and CONFIG_SERVER_PORT")]
    MissingServer,

    #[error("invalid url: {0}")]
    ServerUrl(#[from] url::ParseError),

    #[error("config server request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("section `{0}` is required for this service")]
    MissingSection(&'static str),

    #[error("invalid value: {0}")]
    Invalid(String),
}

// ------------------------------------------------------------
// Transport configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,

    /// Redis logical database
    #[serde(default)]
    pub db: u8,

    /// Sleep between empty polls of the batch queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl TransportConfig {
    /// Connection URL in `redis://[user][:password@]host:port/db` form.
    ///
    /// Credentials are percent-encoded, so reserved characters in a
    /// password never change the host the URL points at.
    pub fn url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&format!("redis://{}:{}/{}", self.host, self.port, self.db))?;
        if let Some(user) = &self.user {
            url.set_username(user)
                .map_err(|_| ConfigError::Invalid("transport.user cannot be set".into()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|_| ConfigError::Invalid("transport.password cannot be set".into()))?;
        }
        Ok(url)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ------------------------------------------------------------
// Store configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

impl PostgresConfig {
    /// Connection options built field by field; nothing is parsed back
    /// out of a URL.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

// ------------------------------------------------------------
// Telemetry configuration
// ------------------------------------------------------------
//
// When disabled no HTTP client and no worker tasks are created.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InfluxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub database: String,

    /// Background writer tasks
    #[serde(default = "default_telemetry_workers")]
    pub workers: usize,

    /// Points buffered before new ones are dropped
    #[serde(default = "default_telemetry_queue")]
    pub queue_size: usize,
}

fn default_telemetry_workers() -> usize {
    2
}

fn default_telemetry_queue() -> usize {
    256
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            database: String::new(),
            workers: default_telemetry_workers(),
            queue_size: default_telemetry_queue(),
        }
    }
}

// ------------------------------------------------------------
// Source collector configuration
// ------------------------------------------------------------
//
// Scrape parameters for one source.
//
// Notes:
// - `providers_count` caps how many listing elements are followed.
// - `scrap_workers_count` sizes the collector worker pool.
// - `selector` overrides the adapter's default listing selector.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub providers_count: usize,
    pub scrap_workers_count: usize,
    pub selector: Option<String>,
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// Stable identity stamped on every record; defaults to `url`
    pub name: Option<String>,

    /// Base used to resolve relative detail links
    pub domain: String,

    /// Listing page
    pub url: String,
}

impl SourceConfig {
    pub fn identity(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

impl ServiceConfig {
    pub fn postgres(&self) -> Result<&PostgresConfig, ConfigError> {
        self.postgres
            .as_ref()
            .ok_or(ConfigError::MissingSection("postgres"))
    }

    /// Returns the provider section after checking its values.
    pub fn provider(&self) -> Result<&ProviderConfig, ConfigError> {
        let provider = self
            .provider
            .as_ref()
            .ok_or(ConfigError::MissingSection("provider"))?;

        if provider.scrap_workers_count == 0 {
            return Err(ConfigError::Invalid(
                "provider.scrapWorkersCount must be at least 1".into(),
            ));
        }
        if provider.providers_count == 0 {
            return Err(ConfigError::Invalid(
                "provider.providersCount must be at least 1".into(),
            ));
        }
        Ok(provider)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry.attempts must be at least 1".into()));
        }
        Ok(self)
    }
}

// ------------------------------------------------------------
// Loading
// ------------------------------------------------------------
//
// The configuration server is used when all three CONFIG_SERVER_*
// variables are present; otherwise the local file is read.
// Either failure is fatal for the caller.
//
pub async fn load(service: &str, file: &Path) -> Result<ServiceConfig, ConfigError> {
    let server = (
        std::env::var("CONFIG_SERVER_SCHEMA").ok(),
        std::env::var("CONFIG_SERVER_HOST").ok(),
        std::env::var("CONFIG_SERVER_PORT").ok(),
    );

    match server {
        (Some(schema), Some(host), Some(port)) => {
            let url = config_server_url(&schema, &host, &port, service)?;
            log::info!("Fetching configuration for {service} from {url}");
            load_remote(url).await
        }
        (None, None, None) => {
            log::info!("Loading configuration from {}", file.display());
            load_file(file)
        }
        _ => Err(ConfigError::MissingServer),
    }
}

pub fn config_server_url(
    schema: &str,
    host: &str,
    port: &str,
    service: &str,
) -> Result<Url, ConfigError> {
    let base = format!("{schema}://{host}:{port}/");
    Ok(Url::parse_with_params(&base, &[("serviceName", service)])?)
}

async fn load_remote(url: Url) -> Result<ServiceConfig, ConfigError> {
    let cfg = reqwest::get(url)
        .await?
        .error_for_status()?
        .json::<ServiceConfig>()
        .await?;
    cfg.validate()
}

pub fn load_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    parse(&data)
}

pub fn parse(data: &str) -> Result<ServiceConfig, ConfigError> {
    let cfg: ServiceConfig = serde_json::from_str(data)?;
    cfg.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLECTOR: &str = r#"{
        "transport": {"host": "broker", "port": 6379, "password": "s3cret"},
        "influxDB": {"enabled": true, "url": "http://influx:8086", "database": "scrape"},
        "provider": {
            "providersCount": 40,
            "scrapWorkersCount": 4,
            "source": {"domain": "https://site.com", "url": "https://site.com/list"}
        }
    }"#;

    #[test]
    fn parses_collector_config_with_defaults() {
        let cfg = parse(COLLECTOR).unwrap();

        assert_eq!(cfg.transport.url().unwrap().as_str(), "redis://:s3cret@broker:6379/0");
        assert_eq!(cfg.transport.poll_interval(), Duration::from_millis(250));
        assert!(cfg.influx.enabled);
        assert_eq!(cfg.influx.workers, 2);
        assert_eq!(cfg.retry.attempts, 3);

        let provider = cfg.provider().unwrap();
        assert_eq!(provider.source.identity(), "https://site.com/list");
        assert!(cfg.postgres().is_err());
    }

    #[test]
    fn parses_aggregator_config() {
        let cfg = parse(
            r#"{
                "transport": {"host": "broker", "port": 6379},
                "postgres": {"user": "u", "password": "p", "host": "db", "database": "listings"},
                "retry": {"attempts": 5, "initialBackoffMs": 10, "maxBackoffMs": 100}
            }"#,
        )
        .unwrap();

        let pg = cfg.postgres().unwrap().connect_options();
        assert_eq!(pg.get_host(), "db");
        assert_eq!(pg.get_port(), 5432);
        assert_eq!(pg.get_username(), "u");
        assert_eq!(pg.get_database(), Some("listings"));
        assert_eq!(cfg.retry.attempts, 5);
        assert!(!cfg.influx.enabled);
        assert!(matches!(cfg.provider(), Err(ConfigError::MissingSection("provider"))));
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = parse(&COLLECTOR.replace("\"scrapWorkersCount\": 4", "\"scrapWorkersCount\": 0"))
            .unwrap();
        assert!(matches!(cfg.provider(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        let err = parse(
            r#"{"transport": {"host": "b", "port": 1},
                "retry": {"attempts": 0, "initialBackoffMs": 1, "maxBackoffMs": 1}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn config_server_url_carries_service_name() {
        let url = config_server_url("http", "config", "8090", "provider1").unwrap();
        assert_eq!(url.as_str(), "http://config:8090/?serviceName=provider1");
    }

    const RESERVED: &str = "p@ss/w#rd:1";

    #[test]
    fn reserved_characters_in_credentials_keep_the_broker_host() {
        let cfg = parse(&COLLECTOR.replace("s3cret", RESERVED)).unwrap();
        let url = cfg.transport.url().unwrap();

        assert_eq!(url.host_str(), Some("broker"));
        assert_eq!(url.port(), Some(6379));
        assert_eq!(url.path(), "/0");
        assert_eq!(url.password(), Some("p%40ss%2Fw%23rd%3A1"));
    }

    #[test]
    fn reserved_characters_in_credentials_keep_the_database_host() {
        let cfg = parse(&format!(
            r#"{{
                "transport": {{"host": "broker", "port": 6379, "user": "ops@team"}},
                "postgres": {{"user": "u", "password": "{RESERVED}", "host": "db", "database": "listings"}}
            }}"#
        ))
        .unwrap();

        let pg = cfg.postgres().unwrap().connect_options();
        assert_eq!(pg.get_host(), "db");
        assert_eq!(pg.get_database(), Some("listings"));

        let url = cfg.transport.url().unwrap();
        assert_eq!(url.host_str(), Some("broker"));
        assert_eq!(url.username(), "ops%40team");
    }
}
