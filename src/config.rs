#![forbid(unsafe_code)]

// Server configuration, loaded from environment variables

use crate::room::permissions::RoleConfig;
use crate::turn::TurnConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Process-wide settings for the signaling server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    /// Local bound on a single request/response round trip.
    pub request_timeout: Duration,
    /// Channels silent for longer than this are closed.
    pub idle_timeout: Duration,
    pub jwt_secret: Option<String>,
    pub turn: Option<TurnConfig>,
    pub room: RoomPolicy,
}

/// Settings applied to every room.
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    pub max_peers: usize,
    pub max_consumers_per_peer: usize,
    pub starts_locked: bool,
    /// A locked room with no joined peer admits its first joiner and unlocks.
    pub unlock_on_first_join: bool,
    pub last_n: usize,
    pub max_last_n: usize,
    /// dBov at or above which a producer counts as speaking.
    pub speaker_threshold: i8,
    pub chat_history_limit: usize,
    pub roles: RoleConfig,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            max_peers: 50,
            max_consumers_per_peer: 32,
            starts_locked: false,
            unlock_on_first_join: true,
            last_n: 4,
            max_last_n: 5,
            speaker_threshold: -50,
            chat_history_limit: 100,
            roles: RoleConfig::default(),
        }
    }
}

impl RoomPolicy {
    /// Spotlight bound: `last_n` clamped to `max_last_n`.
    pub fn spotlight_limit(&self) -> usize {
        self.last_n.min(self.max_last_n)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_connections: 10_000,
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            jwt_secret: None,
            turn: None,
            room: RoomPolicy::default(),
        }
    }
}

pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Builds the configuration from the environment, falling back to defaults.
    ///
    /// # Errors
    /// Returns an error if `ROLE_CONFIG` points at an unreadable or malformed file
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let room_defaults = RoomPolicy::default();

        let mut max_connections = env_or("MAX_CONNECTIONS", defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = defaults.max_connections;
        }

        let roles = match std::env::var("ROLE_CONFIG") {
            Ok(path) => {
                info!("Loading role configuration from {}", path);
                RoleConfig::from_file(path)?
            }
            Err(_) => room_defaults.roles,
        };

        let room = RoomPolicy {
            max_peers: env_or("MAX_PEERS_PER_ROOM", room_defaults.max_peers),
            max_consumers_per_peer: env_or("MAX_CONSUMERS_PER_PEER", room_defaults.max_consumers_per_peer),
            starts_locked: env_or("ROOM_STARTS_LOCKED", room_defaults.starts_locked),
            unlock_on_first_join: env_or("UNLOCK_ON_FIRST_JOIN", room_defaults.unlock_on_first_join),
            last_n: env_or("LAST_N", room_defaults.last_n),
            max_last_n: env_or("MAX_LAST_N", room_defaults.max_last_n),
            speaker_threshold: env_or("SPEAKER_THRESHOLD_DBOV", room_defaults.speaker_threshold),
            chat_history_limit: env_or("CHAT_HISTORY_LIMIT", room_defaults.chat_history_limit),
            roles,
        };

        let jwt_secret = std::env::var("JWT_SECRET").ok();
        if jwt_secret.is_some() {
            info!("JWT authentication enabled");
        } else {
            info!("JWT_SECRET not set, peers join as guests");
        }

        Ok(Self {
            port: env_or("PORT", defaults.port),
            max_connections,
            request_timeout: Duration::from_millis(env_or("REQUEST_TIMEOUT_MS", 10_000)),
            idle_timeout: Duration::from_secs(env_or("IDLE_TIMEOUT_SECS", 300)),
            jwt_secret,
            turn: TurnConfig::from_env(),
            room,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spotlight_limit_is_clamped() {
        let mut policy = RoomPolicy::default();
        policy.last_n = 9;
        policy.max_last_n = 5;
        assert_eq!(policy.spotlight_limit(), 5);

        policy.last_n = 2;
        assert_eq!(policy.spotlight_limit(), 2);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("HUDDLE_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("HUDDLE_TEST_ENV_OR", 7usize), 7);
        std::env::set_var("HUDDLE_TEST_ENV_OR", "12");
        assert_eq!(env_or("HUDDLE_TEST_ENV_OR", 7usize), 12);
        std::env::remove_var("HUDDLE_TEST_ENV_OR");
    }
}
