//! IP ban gate consulted on session start
//!
//! The check is best effort. Any lookup failure is logged and treated as
//! "not banned" so a broken ban service never locks users out.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::HashSet, net::IpAddr, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{config::IpGateConfig, error::EscrowError, EscrowResult};

/// Proxy headers in the order they are trusted
pub const CLIENT_IP_HEADERS: [&str; 5] = [
    "cf-connecting-ip",
    "true-client-ip",
    "x-real-ip",
    "x-forwarded-for",
    "x-client-ip",
];

/// Best-effort client IP from request headers.
///
/// Header names are matched case-insensitively. For `x-forwarded-for` the
/// left-most address is the original client. Unparseable values are
/// skipped in favour of the next header.
pub fn client_ip_from_headers<'a, I>(headers: I) -> Option<IpAddr>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let headers: Vec<(String, &str)> = headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();

    CLIENT_IP_HEADERS.iter().find_map(|wanted| {
        headers
            .iter()
            .filter(|(name, _)| name == wanted)
            .find_map(|(name, value)| {
                let candidate = if name == "x-forwarded-for" {
                    value.split(',').next().unwrap_or_default()
                } else {
                    *value
                };
                candidate.trim().parse::<IpAddr>().ok()
            })
    })
}

/// Ban lookup backend
#[async_trait]
pub trait IpGate: Send + Sync {
    async fn is_banned(&self, ip: IpAddr) -> EscrowResult<bool>;
}

/// Session-start check; errors fail open
pub async fn check_session_start<'a, I>(gate: &dyn IpGate, headers: I) -> bool
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let Some(ip) = client_ip_from_headers(headers) else {
        debug!("No client IP in request headers, skipping ban check");
        return false;
    };

    match gate.is_banned(ip).await {
        Ok(banned) => {
            if banned {
                warn!(%ip, "Session from banned IP");
            }
            banned
        }
        Err(err) => {
            warn!(%ip, error = %err, "IP ban lookup failed, allowing session");
            false
        }
    }
}

/// Ban list kept in memory
#[derive(Default)]
pub struct InMemoryIpBanList {
    banned: Arc<RwLock<HashSet<IpAddr>>>,
}

impl InMemoryIpBanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ban(&self, ip: IpAddr) -> bool {
        self.banned.write().await.insert(ip)
    }

    pub async fn unban(&self, ip: IpAddr) -> bool {
        self.banned.write().await.remove(&ip)
    }
}

#[async_trait]
impl IpGate for InMemoryIpBanList {
    async fn is_banned(&self, ip: IpAddr) -> EscrowResult<bool> {
        Ok(self.banned.read().await.contains(&ip))
    }
}

#[derive(Debug, Deserialize)]
struct BanLookupResponse {
    banned: bool,
}

/// Remote ban service queried over HTTP: `GET {lookup_url}?ip=<addr>`
/// answering `{"banned": bool}`
pub struct HttpIpGate {
    client: reqwest::Client,
    lookup_url: String,
}

impl HttpIpGate {
    pub fn new(config: &IpGateConfig) -> EscrowResult<Self> {
        let lookup_url = config
            .lookup_url
            .clone()
            .ok_or_else(|| EscrowError::config("ip_gate.lookup_url is not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EscrowError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, lookup_url })
    }

    async fn lookup(&self, ip: IpAddr) -> anyhow::Result<bool> {
        let response = self
            .client
            .get(&self.lookup_url)
            .query(&[("ip", ip.to_string())])
            .send()
            .await
            .context("ban service unreachable")?
            .error_for_status()
            .context("ban service returned an error status")?;
        let body: BanLookupResponse = response
            .json()
            .await
            .context("ban service returned malformed JSON")?;
        Ok(body.banned)
    }
}

#[async_trait]
impl IpGate for HttpIpGate {
    async fn is_banned(&self, ip: IpAddr) -> EscrowResult<bool> {
        self.lookup(ip)
            .await
            .map_err(|e| EscrowError::integration(format!("{:#}", e)))
    }
}
