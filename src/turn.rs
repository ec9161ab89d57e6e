#![forbid(unsafe_code)]

// ICE server list handed to browsers before they build peer connections.
// TURN entries use coturn's REST credentials (--use-auth-secret): HMAC-SHA1 over "expiry:id".

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_TTL_SECS: u64 = 86_400;

/// TURN relay configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// e.g. ["turn:example.com:3478", "turns:example.com:5349"]
    pub urls: Vec<String>,
    /// Secret shared with coturn
    pub secret: String,
    pub ttl_secs: u64,
}

/// One RTCIceServer entry as the browser expects it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// Returns None unless both TURN_URLS and TURN_SECRET are present.
    pub fn from_lookup<F>(lookup: &F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let urls = crate::config::split_list(&lookup("TURN_URLS")?);
        let secret = lookup("TURN_SECRET").filter(|s| !s.is_empty())?;
        if urls.is_empty() {
            return None;
        }
        let ttl_secs = lookup("TURN_TTL")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECS);

        Some(Self { urls, secret, ttl_secs })
    }

    /// Time-limited credentials for one connection.
    ///
    /// username = "<unix expiry>:<connection id>", credential = base64(HMAC-SHA1(secret, username))
    pub fn credentials_for(&self, connection_id: &str) -> anyhow::Result<IceServer> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.credentials_at(connection_id, now)
    }

    fn credentials_at(&self, connection_id: &str, now_secs: u64) -> anyhow::Result<IceServer> {
        let username = format!("{}:{connection_id}", now_secs + self.ttl_secs);

        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("TURN secret rejected: {e}"))?;
        mac.update(username.as_bytes());
        let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        })
    }
}

/// STUN entries first, then the TURN entry if one is configured
pub fn ice_servers(
    stun_urls: &[String],
    turn: Option<&TurnConfig>,
    connection_id: &str,
) -> anyhow::Result<Vec<IceServer>> {
    let mut servers = Vec::with_capacity(2);
    if !stun_urls.is_empty() {
        servers.push(IceServer {
            urls: stun_urls.to_vec(),
            username: None,
            credential: None,
        });
    }
    if let Some(turn) = turn {
        servers.push(turn.credentials_for(connection_id)?);
    }
    Ok(servers)
}
