use std::env;
use std::time::Duration;

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Tuning for the publisher and its subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsConfig {
    /// Overall deadline for one publish (or batch) round-trip
    pub publish_timeout: Duration,
    /// Bound on opening the broker subscription and on the readiness wait
    pub subscribe_timeout: Duration,
    /// Capacity of each subscription's delivery channel
    pub event_buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl EventsConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse from an arbitrary key lookup; missing keys take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let publish_timeout = match lookup("EVENT_SERVICE_PUBLISH_TIMEOUT_SECONDS") {
            Some(raw) => Duration::from_secs(parse_positive(
                "EVENT_SERVICE_PUBLISH_TIMEOUT_SECONDS",
                &raw,
            )?),
            None => DEFAULT_PUBLISH_TIMEOUT,
        };

        let subscribe_timeout = match lookup("EVENT_SERVICE_SUBSCRIBE_TIMEOUT_SECONDS") {
            Some(raw) => Duration::from_secs(parse_positive(
                "EVENT_SERVICE_SUBSCRIBE_TIMEOUT_SECONDS",
                &raw,
            )?),
            None => DEFAULT_SUBSCRIBE_TIMEOUT,
        };

        let event_buffer_size = match lookup("EVENT_SERVICE_EVENT_BUFFER_SIZE") {
            Some(raw) => parse_positive("EVENT_SERVICE_EVENT_BUFFER_SIZE", &raw)? as usize,
            None => DEFAULT_EVENT_BUFFER_SIZE,
        };

        Ok(EventsConfig {
            publish_timeout,
            subscribe_timeout,
            event_buffer_size,
        })
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, String> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(format!("{key} must be greater than zero")),
        Ok(value) => Ok(value),
        Err(_) => Err(format!("{key} must be a positive integer, got '{raw}'")),
    }
}

/// Comma-separated list; blanks and repeats are dropped
fn parse_list(raw: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        if !items.iter().any(|seen| seen == item) {
            items.push(item.to_string());
        }
    }
    items
}

/// Which broker transport the relay connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Redis,
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub address: String,
    pub password: Option<String>,
    pub db: i64,
    pub use_tls: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: "localhost:6379".to_string(),
            password: None,
            db: 0,
            use_tls: false,
        }
    }
}

impl RedisConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = lookup("REDIS_ADDRESS").unwrap_or_else(|| "localhost:6379".to_string());
        let password = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty());

        let db: i64 = lookup("REDIS_DB")
            .unwrap_or_else(|| "0".to_string())
            .parse()
            .map_err(|_| "REDIS_DB must be a valid integer".to_string())?;

        let use_tls = match lookup("REDIS_USE_TLS").as_deref() {
            None | Some("") => false,
            Some(raw) => raw
                .parse::<bool>()
                .map_err(|_| "REDIS_USE_TLS must be true or false".to_string())?,
        };

        Ok(RedisConfig {
            address,
            password,
            db,
            use_tls,
        })
    }

    /// Connection URL in the form the redis client accepts
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "rediss" } else { "redis" };
        match &self.password {
            Some(password) => format!("{scheme}://:{password}@{}/{}", self.address, self.db),
            None => format!("{scheme}://{}/{}", self.address, self.db),
        }
    }
}

/// Relay process configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub redis: RedisConfig,
    pub events: EventsConfig,
    /// Trips whose broker traffic the relay feeds to its local handlers
    pub relay_trip_ids: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bus_type = match lookup("BUS_TYPE")
            .unwrap_or_else(|| "redis".to_string())
            .to_lowercase()
            .as_str()
        {
            "redis" => BusType::Redis,
            "inmemory" => BusType::InMemory,
            other => return Err(format!("BUS_TYPE must be 'redis' or 'inmemory', got '{other}'")),
        };

        Ok(Config {
            bus_type,
            redis: RedisConfig::from_lookup(&lookup)?,
            events: EventsConfig::from_lookup(&lookup)?,
            relay_trip_ids: parse_list(lookup("RELAY_TRIP_IDS").as_deref().unwrap_or_default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_keys_take_defaults() {
        let config = EventsConfig::from_lookup(lookup(&[("UNRELATED", "1")])).unwrap();
        assert_eq!(config, EventsConfig::default());
        assert_eq!(config.publish_timeout, Duration::from_secs(5));
        assert_eq!(config.event_buffer_size, 100);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = EventsConfig::from_lookup(lookup(&[
            ("EVENT_SERVICE_PUBLISH_TIMEOUT_SECONDS", "2"),
            ("EVENT_SERVICE_SUBSCRIBE_TIMEOUT_SECONDS", "10"),
            ("EVENT_SERVICE_EVENT_BUFFER_SIZE", "16"),
        ]))
        .unwrap();

        assert_eq!(config.publish_timeout, Duration::from_secs(2));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(10));
        assert_eq!(config.event_buffer_size, 16);
    }

    #[test]
    fn zero_or_garbage_values_are_rejected() {
        let err = EventsConfig::from_lookup(lookup(&[("EVENT_SERVICE_EVENT_BUFFER_SIZE", "0")]))
            .unwrap_err();
        assert!(err.contains("greater than zero"));

        let err = EventsConfig::from_lookup(lookup(&[(
            "EVENT_SERVICE_PUBLISH_TIMEOUT_SECONDS",
            "soon",
        )]))
        .unwrap_err();
        assert!(err.contains("EVENT_SERVICE_PUBLISH_TIMEOUT_SECONDS"));
    }

    #[test]
    fn redis_url_reflects_tls_password_and_db() {
        let plain = RedisConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(plain.url(), "redis://localhost:6379/0");

        let secured = RedisConfig::from_lookup(lookup(&[
            ("REDIS_ADDRESS", "cache:6380"),
            ("REDIS_PASSWORD", "s3cret"),
            ("REDIS_DB", "2"),
            ("REDIS_USE_TLS", "true"),
        ]))
        .unwrap();
        assert_eq!(secured.url(), "rediss://:s3cret@cache:6380/2");
    }

    #[test]
    fn bus_type_defaults_to_redis() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bus_type, BusType::Redis);

        let config = Config::from_lookup(lookup(&[("BUS_TYPE", "InMemory")])).unwrap();
        assert_eq!(config.bus_type, BusType::InMemory);

        assert!(Config::from_lookup(lookup(&[("BUS_TYPE", "kafka")])).is_err());
    }

    #[test]
    fn relay_trips_parse_as_a_list() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.relay_trip_ids.is_empty());

        let config =
            Config::from_lookup(lookup(&[("RELAY_TRIP_IDS", " t1, t2,,t1 ,t3 ")])).unwrap();
        assert_eq!(config.relay_trip_ids, vec!["t1", "t2", "t3"]);
    }
}
