//! Store registry loaded from `stores.yaml`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use pricewatch_adapters::StoreTarget;
use pricewatch_core::Platform;
use reqwest::Url;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreRegistry {
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    pub url: String,
    pub platform: Platform,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the global delay between requests to this store.
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// A registry entry that passed validation.
#[derive(Debug, Clone)]
pub struct ActiveStore {
    pub target: StoreTarget,
    pub url: String,
    pub request_delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedStore {
    pub name: String,
    pub reason: String,
}

impl StoreRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing store registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled stores with safe URLs, plus the entries that were refused.
    /// Disabled stores are neither.
    pub fn active(&self) -> (Vec<ActiveStore>, Vec<RejectedStore>) {
        let mut active = Vec::new();
        let mut rejected = Vec::new();
        for store in self.stores.iter().filter(|s| s.enabled) {
            if let Err(reason) = check_store_url(&store.url) {
                rejected.push(RejectedStore {
                    name: store.name.clone(),
                    reason,
                });
                continue;
            }
            let target = StoreTarget::new(store.name.clone(), &store.url, store.platform);
            let store_id = target.store_id();
            if let Some(owner) = active.iter().find(|a: &&ActiveStore| a.target.store_id() == store_id) {
                let reason = if owner.target.name == store.name {
                    "duplicate store name".to_string()
                } else {
                    format!("store id {store_id} already used by {}", owner.target.name)
                };
                rejected.push(RejectedStore {
                    name: store.name.clone(),
                    reason,
                });
                continue;
            }
            active.push(ActiveStore {
                target,
                url: store.url.clone(),
                request_delay: store.request_delay_ms.map(Duration::from_millis),
            });
        }
        (active, rejected)
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast()
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // unique local fc00::/7 and link-local fe80::/10
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || ip.to_ipv4_mapped().is_some_and(is_internal_v4)
}

/// Accepts public http(s) URLs only.
pub fn check_store_url(raw: &str) -> std::result::Result<(), String> {
    let url = Url::parse(raw).map_err(|err| format!("invalid url: {err}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", url.scheme()));
    }
    let host = url.host_str().ok_or_else(|| "missing host".to_string())?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return Err("localhost is not allowed".to_string());
    }
    let internal = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_internal_v4(ip),
        Ok(IpAddr::V6(ip)) => is_internal_v6(ip),
        Err(_) => false,
    };
    if internal {
        return Err(format!("internal address {host} is not allowed"));
    }
    Ok(())
}

pub fn is_safe_url(raw: &str) -> bool {
    check_store_url(raw).is_ok()
}
