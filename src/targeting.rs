//! Targeting payload normalization.
//!
//! Publishers hand the creative its render data in one of three shapes:
//! flat keys, a `targetingMap` of string arrays, or a delimited keyword
//! string. All three collapse into one canonical flat mapping; the first
//! non-empty source wins in that fixed precedence order, and unknown keys
//! pass through unchanged.

use std::collections::BTreeMap;

use serde_json::Value;

/// `hb_*` wire keys and their canonical names.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("hb_adid", "adId"),
    ("hb_cache_id", "uuid"),
    ("hb_cache_host", "cacheHost"),
    ("hb_cache_path", "cachePath"),
    ("hb_format", "mediaType"),
    ("hb_env", "env"),
    ("hb_size", "size"),
    ("hb_pb", "hbPb"),
];

const ENV_MOBILE_APP: &str = "mobile-app";

fn canonical_key(key: &str) -> &str {
    KEY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(key)
}

/// Canonical flat mapping of render data. Exactly one value per key.
#[derive(Debug, Default, Clone)]
pub struct TargetingPayload {
    values: BTreeMap<String, String>,
}

impl TargetingPayload {
    /// Normalize a publisher-supplied payload. `raw` may mix all three
    /// shapes; flat keys beat `targetingMap` entries, which beat keyword
    /// string entries.
    pub fn from_value(raw: &Value) -> TargetingPayload {
        let mut payload = TargetingPayload::default();
        let Some(object) = raw.as_object() else {
            return payload;
        };

        for (key, value) in object {
            if key == "targetingMap" || key == "keywords" {
                continue;
            }
            if let Some(text) = value.as_str() {
                payload.insert_if_vacant(key, text);
            }
        }

        if let Some(map) = object.get("targetingMap").and_then(Value::as_object) {
            for (key, value) in map {
                let first = match value {
                    Value::Array(items) => items.first().and_then(Value::as_str),
                    Value::String(text) => Some(text.as_str()),
                    _ => None,
                };
                if let Some(text) = first {
                    payload.insert_if_vacant(key, text);
                }
            }
        }

        if let Some(keywords) = object.get("keywords").and_then(Value::as_str) {
            for pair in keywords.split(',') {
                // A value may itself contain colons; split on the first.
                if let Some((key, value)) = pair.split_once(':') {
                    payload.insert_if_vacant(key.trim(), value.trim());
                }
            }
        }

        payload
    }

    fn insert_if_vacant(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        let canonical = canonical_key(key);
        self.values
            .entry(canonical.to_string())
            .or_insert_with(|| value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn ad_id(&self) -> Option<&str> {
        self.get("adId")
    }

    pub fn uuid(&self) -> Option<&str> {
        self.get("uuid")
    }

    pub fn pub_url(&self) -> Option<&str> {
        self.get("pubUrl")
    }

    pub fn cache_host(&self) -> Option<&str> {
        self.get("cacheHost")
    }

    pub fn cache_path(&self) -> Option<&str> {
        self.get("cachePath")
    }

    pub fn media_type(&self) -> Option<&str> {
        self.get("mediaType")
    }

    pub fn ad_server_domain(&self) -> Option<&str> {
        self.get("adServerDomain")
    }

    pub fn size(&self) -> Option<&str> {
        self.get("size")
    }

    pub fn is_mobile_app(&self) -> bool {
        self.get("env") == Some(ENV_MOBILE_APP)
    }
}
