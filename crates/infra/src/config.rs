//! Process configuration loaded from environment variables.
//!
//! Every variable is optional. A missing variable falls back to its default and the
//! fallback is logged; a present but unparsable value is a [`ConfigError`].

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InfluxDb,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "influxdb" | "influx" => Ok(Self::InfluxDb),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend '{other}', expected influxdb or memory")),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrokerBackend {
    Mqtt,
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(format!("unknown broker backend '{other}', expected mqtt or memory")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive: Duration,
}

#[derive(Clone, PartialEq, Eq)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

impl core::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub http_port: u16,
    pub store_backend: StoreBackend,
    pub broker_backend: BrokerBackend,
    pub mqtt: MqttConfig,
    pub influx: InfluxConfig,
    /// Subscribe to every topic at startup and match live filters locally.
    pub ingest_all: bool,
    /// Lookback window applied to every store query.
    pub query_window: Duration,
    pub ingest_buffer: usize,
    pub delivery_buffer: usize,
    pub max_subscriptions: Option<usize>,
    pub handshake_timeout: Duration,
    /// Upper bound on one broker subscribe or unsubscribe call.
    pub broker_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            store_backend: StoreBackend::InfluxDb,
            broker_backend: BrokerBackend::Mqtt,
            mqtt: MqttConfig {
                broker_url: "mqtts://mqtt.digitransit.fi:8883".to_string(),
                client_id: default_client_id(),
                keep_alive: Duration::from_secs(30),
            },
            influx: InfluxConfig {
                url: "http://influxdb:8086".to_string(),
                token: String::new(),
                org: "geobus".to_string(),
                bucket: "geobus".to_string(),
            },
            ingest_all: false,
            query_window: Duration::from_secs(3600),
            ingest_buffer: 1024,
            delivery_buffer: 64,
            max_subscriptions: None,
            handshake_timeout: Duration::from_secs(10),
            broker_timeout: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Configuration with in-memory store and broker; everything else at defaults.
    pub fn in_memory() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            broker_backend: BrokerBackend::Memory,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let http_port = env.parse("HTTP_PORT", defaults.http_port)?;
        let store_backend = env.parse_with("STORE_BACKEND", defaults.store_backend, "influxdb")?;
        let broker_backend = env.parse_with("BROKER_BACKEND", defaults.broker_backend, "mqtt")?;

        let broker_url = env.string("MQTT_BROKER", &defaults.mqtt.broker_url);
        validate_broker_url(&broker_url)?;
        let mqtt = MqttConfig {
            broker_url,
            client_id: env.string("MQTT_CLIENT_ID", &defaults.mqtt.client_id),
            keep_alive: env.seconds("MQTT_KEEP_ALIVE_SECS", defaults.mqtt.keep_alive)?,
        };

        let influx = InfluxConfig {
            url: env.string("INFLUXDB_URL", &defaults.influx.url),
            token: env.secret("INFLUXDB_TOKEN"),
            org: env.string("INFLUXDB_ORG", &defaults.influx.org),
            bucket: env.string("INFLUXDB_BUCKET", &defaults.influx.bucket),
        };

        let max_subscriptions = match env.get("MAX_SUBSCRIPTIONS") {
            None => None,
            Some(raw) => Some(parse_value::<usize>("MAX_SUBSCRIPTIONS", &raw)?),
        };

        Ok(Self {
            http_port,
            store_backend,
            broker_backend,
            mqtt,
            influx,
            ingest_all: env.flag("INGEST_ALL", defaults.ingest_all)?,
            query_window: env.seconds("QUERY_WINDOW_SECS", defaults.query_window)?,
            ingest_buffer: env.positive("INGEST_BUFFER", defaults.ingest_buffer)?,
            delivery_buffer: env.positive("DELIVERY_BUFFER", defaults.delivery_buffer)?,
            max_subscriptions,
            handshake_timeout: env.seconds("HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout)?,
            broker_timeout: env.seconds("BROKER_TIMEOUT_SECS", defaults.broker_timeout)?,
        })
    }
}

fn default_client_id() -> String {
    format!("geobus-{}", Uuid::now_v7())
}

fn validate_broker_url(raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ConfigError::invalid("MQTT_BROKER", raw, e.to_string()))?;
    match parsed.scheme() {
        "mqtt" | "tcp" | "mqtts" | "ssl" => {}
        other => {
            return Err(ConfigError::invalid(
                "MQTT_BROKER",
                raw,
                format!("unsupported scheme '{other}'"),
            ));
        }
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::invalid("MQTT_BROKER", raw, "missing host"));
    }
    Ok(())
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, raw, e.to_string()))
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &'static str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| {
            info!(key, default, "environment variable not set; using default");
            default.to_string()
        })
    }

    fn secret(&self, key: &'static str) -> String {
        self.get(key).unwrap_or_else(|| {
            info!(key, "environment variable not set; using empty value");
            String::new()
        })
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + core::fmt::Display,
        T::Err: core::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => {
                info!(key, default = %default, "environment variable not set; using default");
                Ok(default)
            }
        }
    }

    fn parse_with<T>(&self, key: &'static str, default: T, shown: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => {
                info!(key, default = shown, "environment variable not set; using default");
                Ok(default)
            }
        }
    }

    fn seconds(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn positive(&self, key: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::invalid(key, "0", "must be greater than zero"));
        }
        Ok(value)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => {
                info!(key, default, "environment variable not set; using default");
                Ok(default)
            }
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &raw, "expected a boolean")),
            },
        }
    }
}
