//! Server configuration from the environment

use anyhow::Context;
use collab_engine::CollabConfig;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Engine, presence, broadcast and persistence settings
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            collab: CollabConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read `COLLAB_*` variables, falling back to defaults for unset ones
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = parse(&lookup, "COLLAB_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(secs) = parse::<u64>(&lookup, "COLLAB_IDLE_SECS")? {
            config.collab.presence.idle_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "COLLAB_HEARTBEAT_TIMEOUT_SECS")? {
            config.collab.presence.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "COLLAB_AWAY_GRACE_SECS")? {
            config.collab.presence.away_grace = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse(&lookup, "COLLAB_SUBSCRIBER_CAPACITY")? {
            config.collab.broadcast.subscriber_capacity = capacity;
        }
        if let Some(pending) = parse(&lookup, "COLLAB_MAX_PENDING")? {
            config.collab.engine.max_pending_per_branch = pending;
        }
        if let Some(rate) = parse(&lookup, "COLLAB_OPS_PER_SECOND")? {
            config.collab.engine.ops_per_second = rate;
        }
        if let Some(burst) = parse(&lookup, "COLLAB_BURST")? {
            config.collab.engine.burst = burst;
        }
        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value {raw:?} for {key}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(
            config.collab.presence.idle_threshold,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("COLLAB_BIND_ADDR", "0.0.0.0:9000"),
            ("COLLAB_IDLE_SECS", "60"),
            ("COLLAB_BURST", "10"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.collab.presence.idle_threshold, Duration::from_secs(60));
        assert_eq!(config.collab.engine.burst, 10);
    }

    #[test]
    fn test_bad_value_names_the_variable() {
        let err = ServerConfig::from_lookup(lookup(&[("COLLAB_IDLE_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("COLLAB_IDLE_SECS"));
    }
}
