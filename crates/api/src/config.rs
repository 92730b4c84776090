//! Server configuration read from the environment.

use std::net::SocketAddr;

use thiserror::Error;

use stockhold_infra::{ConfigError, EngineConfig};

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error(transparent)]
    Engine(#[from] ConfigError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Postgres ledger + Redis store instead of the in-memory backends.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub redis_key_prefix: String,
    /// Subscribe to Redis keyspace `expired` events for immediate compensation.
    pub redis_expiry_events: bool,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            redis_key_prefix: "{stockhold}".to_string(),
            redis_expiry_events: true,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ServerConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerConfigError> {
        let mut config = ServerConfig {
            engine: EngineConfig::from_lookup(&lookup)?,
            ..ServerConfig::default()
        };

        if let Some(v) = lookup("BIND_ADDR") {
            config.bind_addr = v
                .parse()
                .map_err(|_| ServerConfigError::Invalid { key: "BIND_ADDR", value: v })?;
        }
        if let Some(v) = lookup("USE_PERSISTENT_STORES") {
            config.use_persistent_stores = parse_bool("USE_PERSISTENT_STORES", v)?;
        }
        if let Some(v) = lookup("REDIS_EXPIRY_EVENTS") {
            config.redis_expiry_events = parse_bool("REDIS_EXPIRY_EVENTS", v)?;
        }
        config.database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        if let Some(v) = lookup("REDIS_URL") {
            config.redis_url = v;
        }
        if let Some(v) = lookup("REDIS_KEY_PREFIX") {
            config.redis_key_prefix = v;
        }

        if config.use_persistent_stores && config.database_url.is_none() {
            return Err(ServerConfigError::Missing("DATABASE_URL"));
        }
        Ok(config)
    }
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ServerConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ServerConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn defaults_to_in_memory_on_8080() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(!config.use_persistent_stores);
    }

    #[test]
    fn persistent_stores_need_a_database() {
        let err = ServerConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert!(matches!(err, ServerConfigError::Missing("DATABASE_URL")));

        let config = ServerConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "1"),
            ("DATABASE_URL", "postgres://localhost/stock"),
            ("REDIS_KEY_PREFIX", "{shop-a}"),
        ]))
        .unwrap();
        assert!(config.use_persistent_stores);
        assert_eq!(config.redis_key_prefix, "{shop-a}");
    }

    #[test]
    fn bad_values_name_their_key() {
        let err = ServerConfig::from_lookup(lookup(&[("BIND_ADDR", "nowhere")])).unwrap_err();
        assert!(matches!(err, ServerConfigError::Invalid { key: "BIND_ADDR", .. }));

        let err = ServerConfig::from_lookup(lookup(&[("STOCK_OP_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ServerConfigError::Engine(_)));
    }
}
