//! Native asset resolution.
//!
//! `load_assets` drives one `Idle -> AwaitingResponse -> {Applied,
//! Failed}` pass: scan for placeholders (or consult the hosted
//! descriptor), request assets over the channel, and apply the matching
//! reply to the document - through a named renderer, a full template, or
//! in place. `load_mobile_assets` runs the same resolution sourced from
//! the cache endpoint, for contexts with no frame channel at all.
//!
//! The channel is shared by every creative in the frame, so a reply only
//! advances state when both origin (checked by the messenger) and adId
//! match. Replies that fail to parse are tolerated up to a bounded count;
//! the listener must not outlive an orchestrator that will never answer
//! correctly.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::assets::{self, from_ortb, value_for, Asset, AssetKey};
use crate::cache::{fetch_cached_bid, CacheConfig};
use crate::error::RenderError;
use crate::frame::FrameHandle;
use crate::loader::RendererLoader;
use crate::messenger::{CancelHandle, Messenger};
use crate::placeholder::{apply_click_macro, substitute, token_present, ScanMode};
use crate::protocol::{
    parse_reply, AssetRequest, AssetResponse, ResizeRequest, ASSET_RESPONSE_MESSAGE,
};
use crate::targeting::TargetingPayload;

/// Malformed replies tolerated before the attempt gives up.
pub const MAX_MALFORMED_REPLIES: u32 = 10;

/// Executes renderer source against resolved assets and returns markup.
/// The sandbox provides the production implementation; tests stub it.
pub trait RendererInvoker {
    fn invoke(&self, ad_id: &str, source: &str, data: &Value) -> Result<String, RenderError>;
}

/// Out-of-band descriptor present when a single ad owns the frame:
/// switches scanning to unscoped mode and may pre-name the assets to
/// request (or ask for all of them).
#[derive(Debug, Default, Clone)]
pub struct NativeDescriptor {
    pub asset_names: Vec<String>,
    pub request_all_assets: bool,
}

#[derive(Clone)]
pub struct AssetResolver {
    window: FrameHandle,
    messenger: Rc<Messenger>,
    ad_id: String,
    descriptor: Option<NativeDescriptor>,
    click_url_prefix: Option<String>,
    renderer: Rc<dyn RendererInvoker>,
    loader: Rc<RendererLoader>,
}

/// One in-flight asset request; terminal exactly once.
struct PendingRequest {
    done: Cell<bool>,
    malformed: Cell<u32>,
    cancel: RefCell<Option<CancelHandle>>,
    on_success: RefCell<Option<Box<dyn FnOnce()>>>,
    on_error: RefCell<Option<Box<dyn FnOnce(RenderError)>>>,
}

impl PendingRequest {
    fn new(
        on_success: impl FnOnce() + 'static,
        on_error: impl FnOnce(RenderError) + 'static,
    ) -> Rc<PendingRequest> {
        Rc::new(PendingRequest {
            done: Cell::new(false),
            malformed: Cell::new(0),
            cancel: RefCell::new(None),
            on_success: RefCell::new(Some(Box::new(on_success))),
            on_error: RefCell::new(Some(Box::new(on_error))),
        })
    }

    fn detach(&self) {
        if let Some(handle) = self.cancel.borrow_mut().take() {
            handle.cancel();
        }
    }

    fn finish_success(&self) {
        if self.done.replace(true) {
            return;
        }
        self.detach();
        if let Some(callback) = self.on_success.borrow_mut().take() {
            callback();
        }
    }

    fn finish_error(&self, error: RenderError) {
        if self.done.replace(true) {
            return;
        }
        self.detach();
        if let Some(callback) = self.on_error.borrow_mut().take() {
            callback(error);
        }
    }
}

impl AssetResolver {
    pub fn new(window: &FrameHandle, messenger: Rc<Messenger>, ad_id: &str) -> AssetResolver {
        let allowlist = messenger
            .trusted_origin()
            .map(|origin| vec![origin.to_string()])
            .unwrap_or_default();
        AssetResolver {
            window: window.clone(),
            messenger,
            ad_id: ad_id.to_string(),
            descriptor: None,
            click_url_prefix: None,
            renderer: Rc::new(crate::sandbox::IsolateRenderer::default()),
            loader: Rc::new(RendererLoader::new(allowlist)),
        }
    }

    pub fn with_descriptor(mut self, descriptor: NativeDescriptor) -> AssetResolver {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn with_click_url_prefix(mut self, prefix: &str) -> AssetResolver {
        self.click_url_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_renderer(mut self, renderer: Rc<dyn RendererInvoker>) -> AssetResolver {
        self.renderer = renderer;
        self
    }

    pub fn with_loader(mut self, loader: Rc<RendererLoader>) -> AssetResolver {
        self.loader = loader;
        self
    }

    fn scan_mode(&self) -> ScanMode<'_> {
        if self.descriptor.is_some() {
            ScanMode::Unscoped
        } else {
            ScanMode::Scoped(&self.ad_id)
        }
    }

    /// Asset slots this render attempt needs, plus the request-all flag.
    fn requested_assets(&self) -> (Vec<AssetKey>, bool) {
        match &self.descriptor {
            Some(descriptor) if descriptor.request_all_assets => (Vec::new(), true),
            Some(descriptor) => (
                descriptor
                    .asset_names
                    .iter()
                    .filter_map(|name| AssetKey::from_name(name))
                    .collect(),
                false,
            ),
            None => {
                let document = self.window.document();
                let markup = format!("{}\n{}", document.head(), document.body());
                let keys = AssetKey::ALL
                    .iter()
                    .copied()
                    .filter(|key| token_present(&markup, key.token(), self.scan_mode()))
                    .collect();
                (keys, false)
            }
        }
    }

    /// Request assets and apply the orchestrator's reply. Exactly one of
    /// the callbacks fires: `on_error` immediately when there is nothing
    /// to substitute, otherwise whichever terminal state the reply (or
    /// the malformed-reply window) produces.
    pub fn load_assets(
        &self,
        on_success: impl FnOnce() + 'static,
        on_error: impl FnOnce(RenderError) + 'static,
    ) {
        let (requested, request_all) = self.requested_assets();
        if requested.is_empty() && !request_all {
            debug!(ad_id = %self.ad_id, "no placeholders and no request-all flag");
            on_error(RenderError::MissingAssets);
            return;
        }

        let request = if request_all {
            AssetRequest::for_all_assets(&self.ad_id)
        } else {
            AssetRequest::for_assets(
                &self.ad_id,
                requested.iter().map(|key| key.name().to_string()).collect(),
            )
        };
        let message = match serde_json::to_value(&request) {
            Ok(value) => value,
            Err(error) => {
                on_error(RenderError::Exception(error.to_string()));
                return;
            }
        };

        let pending = PendingRequest::new(on_success, on_error);
        let resolver = self.clone();
        let state = pending.clone();
        let result = self.messenger.send(
            &message,
            Some(Box::new(move |event| {
                if state.done.get() {
                    return;
                }
                let Some(response) =
                    parse_reply::<AssetResponse>(&event.data, ASSET_RESPONSE_MESSAGE)
                else {
                    let count = state.malformed.get() + 1;
                    state.malformed.set(count);
                    if count > MAX_MALFORMED_REPLIES {
                        warn!(ad_id = %resolver.ad_id, "giving up after malformed replies");
                        state.finish_error(RenderError::Timeout(MAX_MALFORMED_REPLIES));
                    }
                    return;
                };
                if response.ad_id != resolver.ad_id {
                    // Shared channel; that reply belongs to a sibling.
                    return;
                }
                match resolver.apply(&response) {
                    Ok(height) => {
                        let resize =
                            serde_json::to_value(ResizeRequest::new(&resolver.ad_id, height));
                        if let Ok(resize) = resize {
                            if let Err(error) = resolver.messenger.send(&resize, None) {
                                warn!(%error, "failed to report native height");
                            }
                        }
                        state.finish_success();
                    }
                    Err(error) => state.finish_error(error),
                }
            })),
        );

        match result {
            Ok(handle) => {
                *pending.cancel.borrow_mut() = Some(handle);
            }
            Err(error) => pending.finish_error(error),
        }
    }

    /// Apply one matching reply to the document. Any failure here leaves
    /// the attempt `Failed`; nothing is silently half-applied.
    fn apply(&self, response: &AssetResponse) -> Result<u32, RenderError> {
        let assets: Vec<Asset> = response
            .assets
            .iter()
            .flatten()
            .filter_map(|entry| {
                AssetKey::from_name(&entry.key).map(|key| Asset {
                    key,
                    value: entry.value.clone(),
                })
            })
            .collect();

        if let Some(url) = &response.renderer_url {
            let source = self
                .loader
                .load_blocking(url)
                .map_err(|error| RenderError::Exception(error.to_string()))?;
            let mut asset_map = serde_json::Map::new();
            for asset in &assets {
                asset_map.insert(
                    asset.key.name().to_string(),
                    Value::String(asset.value.clone()),
                );
            }
            let data = json!({ "adId": self.ad_id, "assets": asset_map });
            let markup = self.renderer.invoke(&self.ad_id, &source, &data)?;
            self.window.document_mut().write(&markup);
        } else if let Some(template) = &response.ad_template {
            let markup = self.render_markup(template, &assets);
            self.window.document_mut().write(&markup);
        } else {
            let (head, body) = {
                let document = self.window.document();
                (document.head().to_string(), document.body().to_string())
            };
            let new_head = self.render_markup(&head, &assets);
            let new_body = self.render_markup(&body, &assets);
            let mut document = self.window.document_mut();
            document.set_head(&new_head);
            document.set_body(&new_body);
        }

        Ok(self.window.document().measured_height())
    }

    fn render_markup(&self, markup: &str, assets: &[Asset]) -> String {
        substitute_markup(
            markup,
            assets,
            self.scan_mode(),
            self.click_url_prefix.as_deref(),
        )
    }
}

/// Substitute every known token (missing slots become empty) and apply
/// the click macro. Shared by the channel and cache paths.
pub fn substitute_markup(
    markup: &str,
    assets: &[Asset],
    mode: ScanMode,
    click_url_prefix: Option<&str>,
) -> String {
    let values: Vec<(&str, &str)> = AssetKey::ALL
        .iter()
        .map(|key| (key.token(), value_for(assets, *key)))
        .collect();
    let substituted = substitute(markup, &values, mode);
    apply_click_macro(&substituted, click_url_prefix)
}

/// Result of a cache-sourced render: the embedder owns tracker firing.
#[derive(Debug, Default)]
pub struct MobileRenderResult {
    pub trackers: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Cache-sourced variant of `load_assets` for contexts with no frame
/// channel (mobile SDK webviews). Fetches the cached bid for the
/// payload's uuid, substitutes native assets into the document in place,
/// or writes banner markup wholesale.
pub async fn load_mobile_assets(
    window: &FrameHandle,
    targeting: &TargetingPayload,
    on_success: impl FnOnce(&MobileRenderResult),
) -> Result<MobileRenderResult> {
    let uuid = targeting
        .uuid()
        .ok_or_else(|| anyhow!("targeting payload carries no cache uuid"))?;
    let config = CacheConfig::from_targeting(targeting);
    let bid = fetch_cached_bid(&config, uuid).await?;
    let click_url_prefix = targeting.get("clickUrlUnesc");

    let mut result = MobileRenderResult {
        trackers: bid.tracker_urls(),
        width: bid.w,
        height: bid.h,
    };

    if let Some(native) = bid.native_payload() {
        let assets = from_ortb(&native);
        result.trackers.extend(assets::tracker_urls(&native));
        let (head, body) = {
            let document = window.document();
            (document.head().to_string(), document.body().to_string())
        };
        let new_head = substitute_markup(&head, &assets, ScanMode::Unscoped, click_url_prefix);
        let new_body = substitute_markup(&body, &assets, ScanMode::Unscoped, click_url_prefix);
        let mut document = window.document_mut();
        document.set_head(&new_head);
        document.set_body(&new_body);
    } else if let Some(markup) = &bid.adm {
        let markup = apply_click_macro(markup, click_url_prefix);
        window.document_mut().write(&markup);
    } else {
        return Err(anyhow!("cached bid carried neither markup nor assets"));
    }

    if let Some(height) = bid.h {
        window.document_mut().set_height(height);
    }

    on_success(&result);
    Ok(result)
}
