use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use lib_telemetry::connections::{MAX_CHUNK_ROWS, RedisTopicSettings};
use lib_telemetry::core::persistence::DEFAULT_CHUNK_SIZE;
use lib_telemetry::core::{HubSettings, SubscriberSettings};
use lib_telemetry::ingestors::PollerSettings;
use lib_telemetry::retrieve::{BoundingBox, OpenSkySettings, RetryPolicy, UnauthorizedPolicy};
use lib_telemetry::transport::TOPIC_RAW;

use super::stream::StreamServerSettings;

const DEFAULT_CONFIG_FILE: &str = "skystream.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Flight telemetry collector and processor", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SKYSTREAM_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SKYSTREAM_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SKYSTREAM_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    // --- Upstream ---
    #[clap(long, env = "OPENSKY_BASE_URL", help = "OpenSky REST root.")]
    pub opensky_base_url: Option<String>,

    #[clap(long, env = "OPENSKY_AUTH_URL", help = "OAuth2 token endpoint.")]
    pub opensky_auth_url: Option<String>,

    #[clap(long, env = "OPENSKY_CREDENTIALS_PATH", help = "Credentials file ({clientId, clientSecret}).")]
    pub credentials_path: Option<PathBuf>,

    #[clap(long, env = "OPENSKY_ALT_CREDENTIALS_PATH", help = "Alternate credentials used after a 429.")]
    pub alternate_credentials_path: Option<PathBuf>,

    #[clap(long, env = "SKYSTREAM_BBOX", help = "Bounding box as lamin,lomin,lamax,lomax.")]
    pub bbox: Option<String>,

    #[clap(long, env = "SKYSTREAM_UNAUTHORIZED_POLICY", help = "401 handling: retry-once or surface.")]
    pub unauthorized_policy: Option<String>,

    #[clap(long, env = "SKYSTREAM_REQUEST_TIMEOUT_SECS", help = "Per-request timeout in seconds.")]
    pub request_timeout_secs: Option<u64>,

    // --- Poller ---
    #[clap(long, env = "SKYSTREAM_POLL_INTERVAL_SECS", help = "Seconds between upstream polls.")]
    pub poll_interval_secs: Option<u64>,

    #[clap(long, env = "SKYSTREAM_RETRY_ATTEMPTS", help = "Fetch attempts per cycle.")]
    pub retry_attempts: Option<u32>,

    #[clap(long, env = "SKYSTREAM_RETRY_INITIAL_DELAY_SECS", help = "Delay before the second attempt.")]
    pub retry_initial_delay_secs: Option<u64>,

    #[clap(long, env = "SKYSTREAM_RETRY_BACKOFF_FACTOR", help = "Multiplier applied to each later delay.")]
    pub retry_backoff_factor: Option<f64>,

    #[clap(long, env = "SKYSTREAM_ESCALATION_THRESHOLD", help = "Consecutive failed cycles before the collector exits.")]
    pub escalation_threshold: Option<u32>,

    // --- Topic transport ---
    #[clap(long, env = "SKYSTREAM_TRANSPORT", help = "Topic backend: redis or memory.")]
    pub transport: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Redis connection URL.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "SKYSTREAM_TOPIC", help = "Topic (stream) name.")]
    pub topic: Option<String>,

    #[clap(long, env = "SKYSTREAM_CONSUMER_GROUP", help = "Redis consumer group.")]
    pub consumer_group: Option<String>,

    #[clap(long, env = "SKYSTREAM_CONSUMER_NAME", help = "Consumer name inside the group.")]
    pub consumer_name: Option<String>,

    #[clap(long, env = "SKYSTREAM_STREAM_MAX_LEN", help = "Approximate cap on stream length.")]
    pub stream_max_len: Option<usize>,

    // --- Processor ---
    #[clap(long, env = "SKYSTREAM_POLL_TIMEOUT_MS", help = "Topic poll timeout in milliseconds; a quiet poll flushes the batch.")]
    pub poll_timeout_ms: Option<u64>,

    #[clap(long, env = "SKYSTREAM_MAX_BATCH_SIZE", help = "Flush once this many events are pending.")]
    pub max_batch_size: Option<usize>,

    #[clap(long, env = "SKYSTREAM_CHUNK_SIZE", help = "Rows per INSERT statement.")]
    pub chunk_size: Option<usize>,

    #[clap(long, env = "SKYSTREAM_STORE", help = "Durable store: postgres, memory or none.")]
    pub store: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL connection URL.")]
    pub database_url: Option<String>,

    #[clap(long, env = "SKYSTREAM_DB_MAX_CONNECTIONS", help = "PostgreSQL pool size.")]
    pub db_max_connections: Option<usize>,

    #[clap(long, env = "SKYSTREAM_SUBSCRIBER_BUFFER", help = "Batches buffered per live subscriber.")]
    pub subscriber_buffer: Option<usize>,

    #[clap(long, env = "SKYSTREAM_SSE_PORT", help = "Port of the live stream server.")]
    pub sse_port: Option<u16>,

    #[clap(long, env = "SKYSTREAM_CORS_ORIGINS", help = "Comma-separated CORS allow-list.")]
    pub cors_origins: Option<String>,
}

/// Topic backend selected by `--transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Redis,
    Memory,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown transport '{}' (expected redis or memory)", other)),
        }
    }
}

/// Durable store selected by `--store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
    None,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            "none" => Ok(Self::None),
            other => Err(anyhow!("unknown store '{}' (expected postgres, memory or none)", other)),
        }
    }
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            opensky_base_url: other.opensky_base_url.or(self.opensky_base_url),
            opensky_auth_url: other.opensky_auth_url.or(self.opensky_auth_url),
            credentials_path: other.credentials_path.or(self.credentials_path),
            alternate_credentials_path: other.alternate_credentials_path.or(self.alternate_credentials_path),
            bbox: other.bbox.or(self.bbox),
            unauthorized_policy: other.unauthorized_policy.or(self.unauthorized_policy),
            request_timeout_secs: other.request_timeout_secs.or(self.request_timeout_secs),
            poll_interval_secs: other.poll_interval_secs.or(self.poll_interval_secs),
            retry_attempts: other.retry_attempts.or(self.retry_attempts),
            retry_initial_delay_secs: other.retry_initial_delay_secs.or(self.retry_initial_delay_secs),
            retry_backoff_factor: other.retry_backoff_factor.or(self.retry_backoff_factor),
            escalation_threshold: other.escalation_threshold.or(self.escalation_threshold),
            transport: other.transport.or(self.transport),
            redis_url: other.redis_url.or(self.redis_url),
            topic: other.topic.or(self.topic),
            consumer_group: other.consumer_group.or(self.consumer_group),
            consumer_name: other.consumer_name.or(self.consumer_name),
            stream_max_len: other.stream_max_len.or(self.stream_max_len),
            poll_timeout_ms: other.poll_timeout_ms.or(self.poll_timeout_ms),
            max_batch_size: other.max_batch_size.or(self.max_batch_size),
            chunk_size: other.chunk_size.or(self.chunk_size),
            store: other.store.or(self.store),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            subscriber_buffer: other.subscriber_buffer.or(self.subscriber_buffer),
            sse_port: other.sse_port.or(self.sse_port),
            cors_origins: other.cors_origins.or(self.cors_origins),
        }
    }

    /// Built-in defaults, the lowest layer.
    pub fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            credentials_path: Some(PathBuf::from("credentials.json")),
            transport: Some("redis".to_string()),
            redis_url: Some(RedisTopicSettings::default().url),
            topic: Some(TOPIC_RAW.to_string()),
            store: Some("postgres".to_string()),
            db_max_connections: Some(8),
            sse_port: Some(StreamServerSettings::default().port),
            cors_origins: Some("http://localhost:3000".to_string()),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or(TOPIC_RAW)
    }

    pub fn transport_kind(&self) -> Result<TransportKind> {
        self.transport.as_deref().unwrap_or("redis").parse()
    }

    pub fn store_kind(&self) -> Result<StoreKind> {
        self.store.as_deref().unwrap_or("postgres").parse()
    }

    /// Rows per INSERT, clamped to `1..=MAX_CHUNK_ROWS`.
    pub fn chunk_size(&self) -> usize {
        let requested = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let chunk_size = requested.clamp(1, MAX_CHUNK_ROWS);
        if chunk_size != requested {
            log::warn!("chunkSize {} out of range; using {}", requested, chunk_size);
        }
        chunk_size
    }

    pub fn opensky_settings(&self) -> Result<OpenSkySettings> {
        let mut settings = OpenSkySettings::default();
        if let Some(url) = &self.opensky_base_url {
            settings.base_url = url.clone();
        }
        if let Some(url) = &self.opensky_auth_url {
            settings.auth_url = url.clone();
        }
        if let Some(bbox) = &self.bbox {
            settings.bbox = parse_bbox(bbox)?;
        }
        if let Some(policy) = &self.unauthorized_policy {
            settings.unauthorized = policy.parse::<UnauthorizedPolicy>().map_err(|e| anyhow!(e))?;
        }
        if let Some(secs) = self.request_timeout_secs {
            settings.request_timeout = Duration::from_secs(secs);
        }
        Ok(settings)
    }

    pub fn poller_settings(&self) -> PollerSettings {
        let defaults = PollerSettings::default();
        PollerSettings {
            interval: self.poll_interval_secs.map(Duration::from_secs).unwrap_or(defaults.interval),
            retry: RetryPolicy {
                attempts: self.retry_attempts.unwrap_or(defaults.retry.attempts),
                initial_delay: self
                    .retry_initial_delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.retry.initial_delay),
                backoff_factor: self.retry_backoff_factor.unwrap_or(defaults.retry.backoff_factor),
            },
            escalation_threshold: self.escalation_threshold.unwrap_or(defaults.escalation_threshold),
        }
    }

    pub fn subscriber_settings(&self) -> SubscriberSettings {
        let defaults = SubscriberSettings::default();
        SubscriberSettings {
            topic: self.topic().to_string(),
            poll_timeout: self.poll_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.poll_timeout),
            max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            subscriber_buffer: self.subscriber_buffer.unwrap_or(HubSettings::default().subscriber_buffer),
        }
    }

    pub fn stream_settings(&self) -> StreamServerSettings {
        let defaults = StreamServerSettings::default();
        StreamServerSettings {
            port: self.sse_port.unwrap_or(defaults.port),
            allowed_origins: match &self.cors_origins {
                Some(list) => split_origins(list),
                None => defaults.allowed_origins,
            },
        }
    }

    pub fn redis_settings(&self) -> RedisTopicSettings {
        let defaults = RedisTopicSettings::default();
        RedisTopicSettings {
            url: self.redis_url.clone().unwrap_or(defaults.url),
            group: self.consumer_group.clone().unwrap_or(defaults.group),
            consumer: self.consumer_name.clone().unwrap_or(defaults.consumer),
            max_len: self.stream_max_len.unwrap_or(defaults.max_len),
            read_count: defaults.read_count,
        }
    }
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

/// Layers defaults, the config file and the already-parsed CLI/env values.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    current_config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let parsed = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))
        .and_then(|raw| {
            serde_json::from_str::<Config>(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        });
    match parsed {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("{:#}. Falling back to other sources.", e);
            None
        }
    }
}

fn parse_bbox(raw: &str) -> Result<BoundingBox> {
    let parts = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .with_context(|| format!("invalid bounding box '{}'", raw))?;
    match parts.as_slice() {
        [lamin, lomin, lamax, lomax] if lamin < lamax && lomin < lomax => Ok(BoundingBox {
            lamin: *lamin,
            lomin: *lomin,
            lamax: *lamax,
            lomax: *lomax,
        }),
        _ => Err(anyhow!("bounding box must be lamin,lomin,lamax,lomax with min < max, got '{}'", raw)),
    }
}

fn split_origins(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}
