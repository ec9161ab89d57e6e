#![forbid(unsafe_code)]

// Server configuration, loaded once from environment variables at startup.

use crate::turn::TurnConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_MAX_ROOMS: usize = 10_000;
const DEFAULT_MAX_MESSAGES_PER_ROOM: usize = 500;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Limits applied to the room store
#[derive(Debug, Clone, Copy)]
pub struct RoomLimits {
    /// Rooms held at once (empty persisted rooms are evicted first when full)
    pub max_rooms: usize,
    /// Chat log length per room; the oldest message is evicted beyond this
    pub max_messages_per_room: usize,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            max_rooms: DEFAULT_MAX_ROOMS,
            max_messages_per_room: DEFAULT_MAX_MESSAGES_PER_ROOM,
        }
    }
}

/// Everything the server reads from its environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub room_limits: RoomLimits,
    /// Close a connection that sends nothing for this long, pongs included
    pub idle_timeout: Duration,
    /// How often the server pings each socket; always shorter than `idle_timeout`
    pub ping_interval: Duration,
    /// Directory with the built web UI, served as the router fallback
    pub static_dir: Option<PathBuf>,
    /// Bearer token guarding /metrics
    pub metrics_token: Option<String>,
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            room_limits: RoomLimits::default(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            static_dir: None,
            metrics_token: None,
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            turn: None,
        }
    }
}

impl ServerConfig {
    /// Reads the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unparseable values fall back to
    /// defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut max_connections = parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let mut max_rooms = parse_or(&lookup, "MAX_ROOMS", defaults.room_limits.max_rooms);
        if max_rooms == 0 {
            warn!("MAX_ROOMS=0 would reject every join, using default {}", DEFAULT_MAX_ROOMS);
            max_rooms = DEFAULT_MAX_ROOMS;
        }

        let max_messages_per_room = parse_or(
            &lookup,
            "MAX_MESSAGES_PER_ROOM",
            defaults.room_limits.max_messages_per_room,
        );

        let idle_timeout = Duration::from_secs(
            parse_or(&lookup, "IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS).max(1),
        );
        let ping_interval = heartbeat_interval(
            Duration::from_secs(parse_or(&lookup, "PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS)),
            idle_timeout,
        );

        let stun_urls = lookup("STUN_URLS")
            .map(|v| split_list(&v))
            .unwrap_or(defaults.stun_urls);

        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            max_connections,
            room_limits: RoomLimits {
                max_rooms,
                max_messages_per_room,
            },
            idle_timeout,
            ping_interval,
            static_dir: lookup("STATIC_DIR").filter(|v| !v.is_empty()).map(PathBuf::from),
            metrics_token: lookup("METRICS_TOKEN").filter(|v| !v.is_empty()),
            stun_urls,
            turn: TurnConfig::from_lookup(&lookup),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Invalid value for {}: {:?}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}

/// Clamps the ping period below the idle timeout
pub(crate) fn heartbeat_interval(requested: Duration, idle_timeout: Duration) -> Duration {
    if requested.is_zero() || requested >= idle_timeout {
        let fallback = idle_timeout / 3;
        warn!("Ping interval {:?} does not fit idle timeout {:?}, using {:?}", requested, idle_timeout, fallback);
        fallback
    } else {
        requested
    }
}

/// Splits a comma-separated env value, dropping blanks
pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.room_limits.max_messages_per_room, 500);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.stun_urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(config.turn.is_none());
        assert!(config.static_dir.is_none());
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("PORT", "8080"),
            ("MAX_CONNECTIONS", "0"),
            ("MAX_ROOMS", "not-a-number"),
            ("MAX_MESSAGES_PER_ROOM", "20"),
            ("STUN_URLS", "stun:a:3478, ,stun:b:3478"),
            ("STATIC_DIR", "web/dist"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.room_limits.max_rooms, 10_000);
        assert_eq!(config.room_limits.max_messages_per_room, 20);
        assert_eq!(config.stun_urls, vec!["stun:a:3478".to_string(), "stun:b:3478".to_string()]);
        assert_eq!(config.static_dir, Some(PathBuf::from("web/dist")));
    }

    #[test]
    fn test_ping_interval_stays_inside_idle_timeout() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("IDLE_TIMEOUT_SECS", "20"),
            ("PING_INTERVAL_SECS", "60"),
        ]));
        assert!(config.ping_interval < config.idle_timeout);

        let config = ServerConfig::from_lookup(lookup_from(&[("PING_INTERVAL_SECS", "0")]));
        assert_eq!(config.ping_interval, Duration::from_secs(100));

        let config = ServerConfig::from_lookup(lookup_from(&[("PING_INTERVAL_SECS", "10")]));
        assert_eq!(config.ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_turn_requires_urls_and_secret() {
        let config = ServerConfig::from_lookup(lookup_from(&[("TURN_URLS", "turn:x:3478")]));
        assert!(config.turn.is_none());

        let config = ServerConfig::from_lookup(lookup_from(&[
            ("TURN_URLS", "turn:x:3478,turns:x:5349"),
            ("TURN_SECRET", "s3cret"),
        ]));
        let turn = config.turn.expect("turn configured");
        assert_eq!(turn.urls.len(), 2);
        assert_eq!(turn.ttl_secs, 86_400);
    }
}
