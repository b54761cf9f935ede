#![forbid(unsafe_code)]

// TURN relay credentials handed out with every WebRTC transport
//
// The relay and this server share a secret. A credential is valid until the
// expiry encoded in its username, so nothing has to be revoked when a peer
// leaves a room.

use crate::config::env_or;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Relay settings; present only when both `TURN_URLS` and `TURN_SECRET` are set.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub secret: String,
    pub ttl_secs: u64,
}

/// One entry of a transport's `iceServers` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// `TURN_URLS` is comma separated. A list with no usable URL disables TURN.
    pub fn from_env() -> Option<Self> {
        let urls = parse_urls(&std::env::var("TURN_URLS").ok()?);
        let secret = std::env::var("TURN_SECRET").ok()?;
        if urls.is_empty() {
            warn!("TURN_URLS has no usable URL, TURN disabled");
            return None;
        }

        Some(Self {
            urls,
            secret,
            ttl_secs: env_or("TURN_TTL", DEFAULT_TTL_SECS),
        })
    }

    /// Credentials for `peer_id`, expiring `ttl_secs` after `now`.
    ///
    /// The username is `<unix expiry>:<peer id>`, the credential the base64
    /// HMAC-SHA1 of the username under the shared secret. A relay running
    /// coturn's `use-auth-secret` mode checks both without calling back.
    pub fn credentials_at(&self, peer_id: &str, now: SystemTime) -> IceServer {
        let expiry = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_add(self.ttl_secs);
        let username = format!("{expiry}:{peer_id}");

        match self.sign(&username) {
            Some(credential) => IceServer {
                urls: self.urls.clone(),
                username: Some(username),
                credential: Some(credential),
            },
            None => IceServer {
                urls: self.urls.clone(),
                username: None,
                credential: None,
            },
        }
    }

    fn sign(&self, username: &str) -> Option<String> {
        let mut mac = match HmacSha1::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(e) => {
                warn!("Cannot key TURN credentials: {}", e);
                return None;
            }
        };
        mac.update(username.as_bytes());
        Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

fn parse_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// ICE servers handed to `peer_id` alongside a new transport.
pub fn ice_servers(turn: Option<&TurnConfig>, peer_id: &str) -> Vec<IceServer> {
    turn.map(|config| vec![config.credentials_at(peer_id, SystemTime::now())])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> TurnConfig {
        TurnConfig {
            urls: vec!["turn:turn.example.org:3478".into()],
            secret: "s3cret".into(),
            ttl_secs: 60,
        }
    }

    #[test]
    fn test_credentials_are_verifiable_with_the_shared_secret() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let server = config().credentials_at("alice", now);
        let username = server.username.unwrap();
        assert_eq!(username, "1700000060:alice");

        let mut mac = HmacSha1::new_from_slice(b"s3cret").unwrap();
        mac.update(username.as_bytes());
        let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(server.credential.unwrap(), expected);
    }

    #[test]
    fn test_blank_urls_are_skipped() {
        assert_eq!(
            parse_urls(" turn:a:3478, ,turns:b:5349,"),
            vec!["turn:a:3478".to_string(), "turns:b:5349".to_string()]
        );
        assert!(parse_urls(" , ").is_empty());
    }

    #[test]
    fn test_no_turn_means_no_ice_servers() {
        assert!(ice_servers(None, "p").is_empty());
        let servers = ice_servers(Some(&config()), "p");
        assert_eq!(servers.len(), 1);
        assert!(servers[0].username.as_deref().unwrap().ends_with(":p"));
    }
}
