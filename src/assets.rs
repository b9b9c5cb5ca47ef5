//! Native asset model and normalization.
//!
//! Bids describe native assets in two shapes: a legacy flat key/value
//! object, or an OpenRTB-native document (`assets[]` + `link` +
//! trackers). Both normalize into one [`Asset`] list keyed by the fixed
//! [`AssetKey`] set before any substitution happens.

use serde::Deserialize;
use serde_json::Value;

/// The fixed set of native asset slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKey {
    Title,
    Body,
    Body2,
    SponsoredBy,
    Image,
    Icon,
    ClickUrl,
    DisplayUrl,
    Cta,
    Rating,
    Address,
    Downloads,
    Likes,
    Phone,
    Price,
    SalePrice,
    PrivacyLink,
    PrivacyIcon,
    RendererUrl,
}

impl AssetKey {
    pub const ALL: &'static [AssetKey] = &[
        AssetKey::Title,
        AssetKey::Body,
        AssetKey::Body2,
        AssetKey::SponsoredBy,
        AssetKey::Image,
        AssetKey::Icon,
        AssetKey::ClickUrl,
        AssetKey::DisplayUrl,
        AssetKey::Cta,
        AssetKey::Rating,
        AssetKey::Address,
        AssetKey::Downloads,
        AssetKey::Likes,
        AssetKey::Phone,
        AssetKey::Price,
        AssetKey::SalePrice,
        AssetKey::PrivacyLink,
        AssetKey::PrivacyIcon,
        AssetKey::RendererUrl,
    ];

    /// Canonical placeholder token for this slot.
    pub fn token(self) -> &'static str {
        match self {
            AssetKey::Title => "hb_native_title",
            AssetKey::Body => "hb_native_body",
            AssetKey::Body2 => "hb_native_body2",
            AssetKey::SponsoredBy => "hb_native_brand",
            AssetKey::Image => "hb_native_image",
            AssetKey::Icon => "hb_native_icon",
            AssetKey::ClickUrl => "hb_native_linkurl",
            AssetKey::DisplayUrl => "hb_native_displayurl",
            AssetKey::Cta => "hb_native_cta",
            AssetKey::Rating => "hb_native_rating",
            AssetKey::Address => "hb_native_address",
            AssetKey::Downloads => "hb_native_downloads",
            AssetKey::Likes => "hb_native_likes",
            AssetKey::Phone => "hb_native_phone",
            AssetKey::Price => "hb_native_price",
            AssetKey::SalePrice => "hb_native_saleprice",
            AssetKey::PrivacyLink => "hb_native_privacy",
            AssetKey::PrivacyIcon => "hb_native_privicon",
            AssetKey::RendererUrl => "hb_native_renderer",
        }
    }

    /// Wire name used in asset request/response messages.
    pub fn name(self) -> &'static str {
        match self {
            AssetKey::Title => "title",
            AssetKey::Body => "body",
            AssetKey::Body2 => "body2",
            AssetKey::SponsoredBy => "sponsoredBy",
            AssetKey::Image => "image",
            AssetKey::Icon => "icon",
            AssetKey::ClickUrl => "clickUrl",
            AssetKey::DisplayUrl => "displayUrl",
            AssetKey::Cta => "cta",
            AssetKey::Rating => "rating",
            AssetKey::Address => "address",
            AssetKey::Downloads => "downloads",
            AssetKey::Likes => "likes",
            AssetKey::Phone => "phone",
            AssetKey::Price => "price",
            AssetKey::SalePrice => "salePrice",
            AssetKey::PrivacyLink => "privacyLink",
            AssetKey::PrivacyIcon => "privacyIcon",
            AssetKey::RendererUrl => "rendererUrl",
        }
    }

    pub fn from_name(name: &str) -> Option<AssetKey> {
        AssetKey::ALL.iter().copied().find(|key| key.name() == name)
    }
}

/// One resolved asset value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub key: AssetKey,
    pub value: String,
}

/// Normalize a legacy flat `{name: value}` object. Unknown names and
/// non-string values are skipped.
pub fn from_legacy(raw: &Value) -> Vec<Asset> {
    let Some(object) = raw.as_object() else {
        return Vec::new();
    };
    object
        .iter()
        .filter_map(|(name, value)| {
            let key = AssetKey::from_name(name)?;
            let value = value.as_str()?;
            Some(Asset {
                key,
                value: value.to_string(),
            })
        })
        .collect()
}

// OpenRTB native response shapes. Only the fields the renderer needs are
// modeled; everything else passes through serde untouched.

#[derive(Debug, Default, Deserialize)]
pub struct OrtbNative {
    #[serde(default)]
    pub assets: Vec<OrtbAsset>,
    #[serde(default)]
    pub link: Option<OrtbLink>,
    #[serde(default)]
    pub eventtrackers: Vec<OrtbEventTracker>,
    #[serde(default)]
    pub imptrackers: Vec<String>,
    #[serde(default)]
    pub privacy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrtbAsset {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub title: Option<OrtbTitle>,
    #[serde(default)]
    pub img: Option<OrtbImage>,
    #[serde(default)]
    pub data: Option<OrtbData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrtbTitle {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrtbImage {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "type")]
    pub kind: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrtbData {
    #[serde(default)]
    pub value: String,
    #[serde(default, rename = "type")]
    pub kind: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrtbLink {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrtbEventTracker {
    #[serde(default)]
    pub url: String,
}

// IAB image type ids.
const IMG_ICON: u32 = 1;
const IMG_MAIN: u32 = 3;

fn data_key(kind: u32) -> Option<AssetKey> {
    match kind {
        1 => Some(AssetKey::SponsoredBy),
        2 => Some(AssetKey::Body),
        3 => Some(AssetKey::Rating),
        4 => Some(AssetKey::Likes),
        5 => Some(AssetKey::Downloads),
        6 => Some(AssetKey::Price),
        7 => Some(AssetKey::SalePrice),
        8 => Some(AssetKey::Phone),
        9 => Some(AssetKey::Address),
        10 => Some(AssetKey::Body2),
        11 => Some(AssetKey::DisplayUrl),
        12 => Some(AssetKey::Cta),
        _ => None,
    }
}

/// Normalize an OpenRTB-native document into the canonical asset list.
pub fn from_ortb(native: &OrtbNative) -> Vec<Asset> {
    let mut assets = Vec::new();
    for entry in &native.assets {
        if let Some(title) = &entry.title {
            if !title.text.is_empty() {
                assets.push(Asset {
                    key: AssetKey::Title,
                    value: title.text.clone(),
                });
            }
        }
        if let Some(img) = &entry.img {
            if !img.url.is_empty() {
                let key = match img.kind {
                    Some(IMG_ICON) => AssetKey::Icon,
                    Some(IMG_MAIN) | None => AssetKey::Image,
                    Some(_) => AssetKey::Image,
                };
                assets.push(Asset {
                    key,
                    value: img.url.clone(),
                });
            }
        }
        if let Some(data) = &entry.data {
            if let Some(key) = data.kind.and_then(data_key) {
                if !data.value.is_empty() {
                    assets.push(Asset {
                        key,
                        value: data.value.clone(),
                    });
                }
            }
        }
    }
    if let Some(link) = &native.link {
        if !link.url.is_empty() {
            assets.push(Asset {
                key: AssetKey::ClickUrl,
                value: link.url.clone(),
            });
        }
    }
    if let Some(privacy) = &native.privacy {
        if !privacy.is_empty() {
            assets.push(Asset {
                key: AssetKey::PrivacyLink,
                value: privacy.clone(),
            });
        }
    }
    assets
}

/// Impression/billing tracker URLs carried by the native document.
pub fn tracker_urls(native: &OrtbNative) -> Vec<String> {
    native
        .imptrackers
        .iter()
        .cloned()
        .chain(
            native
                .eventtrackers
                .iter()
                .map(|tracker| tracker.url.clone()),
        )
        .filter(|url| !url.is_empty())
        .collect()
}

/// Value for `key` in `assets`, or the empty string: substitution never
/// leaves a placeholder verbatim.
pub fn value_for(assets: &[Asset], key: AssetKey) -> &str {
    assets
        .iter()
        .find(|asset| asset.key == key)
        .map(|asset| asset.value.as_str())
        .unwrap_or("")
}
