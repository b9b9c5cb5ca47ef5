//! Cached-bid fetch against the prebid cache endpoint.
//!
//! Contract: `GET https://<cacheHost><cachePath>?uuid=<id>` returns a JSON
//! bid object carrying `adm` (markup, itself optionally JSON for native)
//! and/or `nurl`/`burl` tracking URLs plus dimensions. One GET, no
//! retries, no redirects.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::assets::OrtbNative;
use crate::targeting::TargetingPayload;

pub const DEFAULT_CACHE_HOST: &str = "prebid.adnxs.com";
pub const DEFAULT_CACHE_PATH: &str = "/pbc/v1/cache";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub host: String,
    pub path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            host: DEFAULT_CACHE_HOST.to_string(),
            path: DEFAULT_CACHE_PATH.to_string(),
        }
    }
}

impl CacheConfig {
    /// Host/path overrides from the targeting payload, defaults otherwise.
    pub fn from_targeting(targeting: &TargetingPayload) -> CacheConfig {
        let defaults = CacheConfig::default();
        CacheConfig {
            host: targeting
                .cache_host()
                .unwrap_or(&defaults.host)
                .to_string(),
            path: targeting
                .cache_path()
                .unwrap_or(&defaults.path)
                .to_string(),
        }
    }

    pub fn bid_url(&self, uuid: &str) -> String {
        format!("https://{}{}?uuid={}", self.host, self.path, uuid)
    }
}

/// A bid payload as stored in the cache.
#[derive(Debug, Default, Deserialize)]
pub struct CachedBid {
    /// Creative markup; for native bids this is a nested JSON document.
    #[serde(default, alias = "ad")]
    pub adm: Option<String>,
    /// Win notice URL.
    #[serde(default)]
    pub nurl: Option<String>,
    /// Billing notice URL.
    #[serde(default)]
    pub burl: Option<String>,
    #[serde(default, alias = "width")]
    pub w: Option<u32>,
    #[serde(default, alias = "height")]
    pub h: Option<u32>,
}

impl CachedBid {
    /// Parse `adm` as an OpenRTB-native document, accepting both the
    /// wrapped `{"native": {...}}` shape and a bare native object.
    pub fn native_payload(&self) -> Option<OrtbNative> {
        let adm = self.adm.as_deref()?;
        let value: Value = serde_json::from_str(adm).ok()?;
        let native = match value.get("native") {
            Some(inner) => inner.clone(),
            None => value,
        };
        serde_json::from_value(native).ok()
    }

    /// Tracking URLs the embedder should fire on impression.
    pub fn tracker_urls(&self) -> Vec<String> {
        self.nurl
            .iter()
            .chain(self.burl.iter())
            .cloned()
            .collect()
    }
}

/// Fetch the cached bid for `uuid`. Single retry-free GET; any transport
/// or parse failure is the caller's problem to report.
pub async fn fetch_cached_bid(config: &CacheConfig, uuid: &str) -> Result<CachedBid> {
    let url = config.bid_url(uuid);
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| anyhow!("Cache fetch failed for '{}': {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("Cache returned {} for '{}'", status, url));
    }

    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read cache response body: {}", e))?;

    serde_json::from_str(&body).map_err(|e| anyhow!("Invalid cached bid JSON: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bid_url_uses_defaults() {
        let config = CacheConfig::default();
        assert_eq!(
            config.bid_url("uuid1"),
            "https://prebid.adnxs.com/pbc/v1/cache?uuid=uuid1"
        );
    }

    #[test]
    fn test_targeting_overrides_host_and_path() {
        let targeting = TargetingPayload::from_value(&json!({
            "cacheHost": "cache.other.example",
            "cachePath": "/cache"
        }));
        let config = CacheConfig::from_targeting(&targeting);
        assert_eq!(
            config.bid_url("u"),
            "https://cache.other.example/cache?uuid=u"
        );
    }

    #[test]
    fn test_bid_accepts_dimension_aliases() {
        let short: CachedBid =
            serde_json::from_value(json!({"adm": "<p>x</p>", "w": 300, "h": 250})).unwrap();
        assert_eq!((short.w, short.h), (Some(300), Some(250)));

        let long: CachedBid =
            serde_json::from_value(json!({"ad": "<p>x</p>", "width": 728, "height": 90})).unwrap();
        assert_eq!(long.adm.as_deref(), Some("<p>x</p>"));
        assert_eq!((long.w, long.h), (Some(728), Some(90)));
    }

    #[test]
    fn test_native_adm_parses_wrapped_and_bare() {
        let wrapped = CachedBid {
            adm: Some(
                json!({"native": {"assets": [{"title": {"text": "T"}}]}}).to_string(),
            ),
            ..CachedBid::default()
        };
        assert_eq!(wrapped.native_payload().unwrap().assets.len(), 1);

        let bare = CachedBid {
            adm: Some(json!({"assets": [], "link": {"url": "https://x"}}).to_string()),
            ..CachedBid::default()
        };
        assert_eq!(
            bare.native_payload().unwrap().link.unwrap().url,
            "https://x"
        );

        let banner = CachedBid {
            adm: Some("<div>banner</div>".to_string()),
            ..CachedBid::default()
        };
        assert!(banner.native_payload().is_none());
    }

    #[test]
    fn test_tracker_urls_collects_notices() {
        let bid: CachedBid = serde_json::from_value(json!({
            "nurl": "https://win.example",
            "burl": "https://bill.example"
        }))
        .unwrap();
        assert_eq!(bid.tracker_urls(), ["https://win.example", "https://bill.example"]);
    }
}
