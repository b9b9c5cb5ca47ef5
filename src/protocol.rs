//! Wire message shapes and outcome reporting.
//!
//! Everything on the channel is origin-checked JSON. Requests are typed
//! serde structs serialized once at the send site; replies are parsed
//! leniently (`#[serde(default)]` optionals) because the channel is
//! shared and anything may arrive on it.

use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RenderError;
use crate::messenger::Messenger;

pub const RENDER_REQUEST_MESSAGE: &str = "Prebid Request";
pub const RENDER_RESPONSE_MESSAGE: &str = "Prebid Response";
pub const NATIVE_MESSAGE: &str = "Prebid Native";
pub const EVENT_MESSAGE: &str = "Prebid Event";
pub const ASSET_RESPONSE_MESSAGE: &str = "assetResponse";

pub const ACTION_ASSET_REQUEST: &str = "assetRequest";
pub const ACTION_ALL_ASSET_REQUEST: &str = "allAssetRequest";
pub const ACTION_CLICK: &str = "click";
pub const ACTION_RESIZE_NATIVE_HEIGHT: &str = "resizeNativeHeight";

pub const EVENT_RENDER_SUCCEEDED: &str = "adRenderSucceeded";
pub const EVENT_RENDER_FAILED: &str = "adRenderFailed";

/// `{message:'Prebid Request', adId, adServerDomain}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub message: &'static str,
    pub ad_id: String,
    pub ad_server_domain: String,
}

impl RenderRequest {
    pub fn new(ad_id: &str, ad_server_domain: &str) -> RenderRequest {
        RenderRequest {
            message: RENDER_REQUEST_MESSAGE,
            ad_id: ad_id.to_string(),
            ad_server_domain: ad_server_domain.to_string(),
        }
    }
}

/// `{message:'Prebid Response', adId, ad?, adUrl?, width, height, mediaType?}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResponse {
    pub message: String,
    pub ad_id: String,
    #[serde(default)]
    pub ad: Option<String>,
    #[serde(default)]
    pub ad_url: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// `{message:'Prebid Native', action, adId, assets?}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRequest {
    pub message: &'static str,
    pub action: &'static str,
    pub ad_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<Vec<String>>,
}

impl AssetRequest {
    pub fn for_assets(ad_id: &str, assets: Vec<String>) -> AssetRequest {
        AssetRequest {
            message: NATIVE_MESSAGE,
            action: ACTION_ASSET_REQUEST,
            ad_id: ad_id.to_string(),
            assets: Some(assets),
        }
    }

    pub fn for_all_assets(ad_id: &str) -> AssetRequest {
        AssetRequest {
            message: NATIVE_MESSAGE,
            action: ACTION_ALL_ASSET_REQUEST,
            ad_id: ad_id.to_string(),
            assets: None,
        }
    }
}

/// `{message:'assetResponse', adId, assets?, adTemplate?, rendererUrl?}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetResponse {
    pub message: String,
    pub ad_id: String,
    #[serde(default)]
    pub assets: Option<Vec<AssetValue>>,
    #[serde(default)]
    pub ad_template: Option<String>,
    #[serde(default)]
    pub renderer_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssetValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// `{message:'Prebid Native', adId, action?:'click'}`, fire and forget.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NativePing {
    pub message: &'static str,
    pub ad_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
}

impl NativePing {
    pub fn impression(ad_id: &str) -> NativePing {
        NativePing {
            message: NATIVE_MESSAGE,
            ad_id: ad_id.to_string(),
            action: None,
        }
    }

    pub fn click(ad_id: &str) -> NativePing {
        NativePing {
            message: NATIVE_MESSAGE,
            ad_id: ad_id.to_string(),
            action: Some(ACTION_CLICK),
        }
    }
}

/// `{message:'Prebid Native', action:'resizeNativeHeight', adId, height}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub message: &'static str,
    pub action: &'static str,
    pub ad_id: String,
    pub height: u32,
}

impl ResizeRequest {
    pub fn new(ad_id: &str, height: u32) -> ResizeRequest {
        ResizeRequest {
            message: NATIVE_MESSAGE,
            action: ACTION_RESIZE_NATIVE_HEIGHT,
            ad_id: ad_id.to_string(),
            height,
        }
    }
}

/// `{message:'Prebid Event', adId, event, info?}`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub message: String,
    pub ad_id: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<EventInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventInfo {
    pub reason: String,
    pub message: String,
}

/// Terminal result of one render attempt.
#[derive(Debug)]
pub enum RenderOutcome {
    Succeeded,
    Failed(RenderError),
}

impl RenderOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RenderOutcome::Succeeded)
    }
}

/// Emits the terminal `Prebid Event` for a render attempt at most once;
/// later reports are suppressed, whichever terminal transition raced in
/// first wins.
pub struct OutcomeReporter {
    messenger: Rc<Messenger>,
    ad_id: String,
    sent: Cell<bool>,
}

impl OutcomeReporter {
    pub fn new(messenger: Rc<Messenger>, ad_id: &str) -> OutcomeReporter {
        OutcomeReporter {
            messenger,
            ad_id: ad_id.to_string(),
            sent: Cell::new(false),
        }
    }

    pub fn already_reported(&self) -> bool {
        self.sent.get()
    }

    pub fn report(&self, outcome: &RenderOutcome) {
        if self.sent.replace(true) {
            debug!(ad_id = %self.ad_id, "suppressing duplicate outcome report");
            return;
        }
        let event = match outcome {
            RenderOutcome::Succeeded => EventMessage {
                message: EVENT_MESSAGE.to_string(),
                ad_id: self.ad_id.clone(),
                event: EVENT_RENDER_SUCCEEDED.to_string(),
                info: None,
            },
            RenderOutcome::Failed(error) => EventMessage {
                message: EVENT_MESSAGE.to_string(),
                ad_id: self.ad_id.clone(),
                event: EVENT_RENDER_FAILED.to_string(),
                info: Some(EventInfo {
                    reason: error.reason().to_string(),
                    message: error.to_string(),
                }),
            },
        };
        let value = match serde_json::to_value(&event) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "failed to serialize outcome event");
                return;
            }
        };
        if let Err(error) = self.messenger.send(&value, None) {
            warn!(%error, ad_id = %self.ad_id, "failed to report render outcome");
        }
    }
}

/// Parse an inbound event payload as `T`, requiring `message == expected`.
pub fn parse_reply<T>(data: &str, expected: &str) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
{
    let value: Value = serde_json::from_str(data).ok()?;
    if value.get("message").and_then(Value::as_str) != Some(expected) {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Page};
    use std::cell::RefCell;

    #[test]
    fn test_request_serializes_to_wire_shape() {
        let value = serde_json::to_value(RenderRequest::new("123", "https://ads.example")).unwrap();
        assert_eq!(value["message"], "Prebid Request");
        assert_eq!(value["adId"], "123");
        assert_eq!(value["adServerDomain"], "https://ads.example");
    }

    #[test]
    fn test_asset_request_omits_assets_when_requesting_all() {
        let all = serde_json::to_value(AssetRequest::for_all_assets("a1")).unwrap();
        assert_eq!(all["action"], "allAssetRequest");
        assert!(all.get("assets").is_none());

        let some =
            serde_json::to_value(AssetRequest::for_assets("a1", vec!["title".into()])).unwrap();
        assert_eq!(some["action"], "assetRequest");
        assert_eq!(some["assets"][0], "title");
    }

    #[test]
    fn test_native_pings_are_fire_and_forget_shapes() {
        let click = serde_json::to_value(NativePing::click("a1")).unwrap();
        assert_eq!(click["message"], "Prebid Native");
        assert_eq!(click["action"], "click");

        let impression = serde_json::to_value(NativePing::impression("a1")).unwrap();
        assert!(impression.get("action").is_none());
        assert_eq!(impression["adId"], "a1");
    }

    #[test]
    fn test_parse_reply_requires_message_marker() {
        let ok: Option<RenderResponse> = parse_reply(
            r#"{"message":"Prebid Response","adId":"1","ad":"<p>x</p>"}"#,
            RENDER_RESPONSE_MESSAGE,
        );
        assert!(ok.is_some());

        let wrong_marker: Option<RenderResponse> =
            parse_reply(r#"{"message":"other","adId":"1"}"#, RENDER_RESPONSE_MESSAGE);
        assert!(wrong_marker.is_none());

        let garbage: Option<RenderResponse> = parse_reply("not json", RENDER_RESPONSE_MESSAGE);
        assert!(garbage.is_none());
    }

    #[test]
    fn test_reporter_emits_exactly_once() {
        let page = Page::new();
        let top = Frame::root(&page, "https://publisher.example");
        let creative = top.create_child(None, "https://creative.example");

        let events = Rc::new(RefCell::new(Vec::new()));
        let events_in = events.clone();
        top.add_listener(move |event| events_in.borrow_mut().push(event.data.clone()));

        let messenger = Rc::new(Messenger::new(
            Some("https://publisher.example/page"),
            &creative,
        ));
        let reporter = OutcomeReporter::new(messenger, "123");

        reporter.report(&RenderOutcome::Succeeded);
        reporter.report(&RenderOutcome::Failed(RenderError::NoAd));
        page.pump();

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        let event: EventMessage = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(event.event, EVENT_RENDER_SUCCEEDED);
        assert_eq!(event.ad_id, "123");
        assert!(event.info.is_none());
    }

    #[test]
    fn test_failure_event_carries_reason_and_message() {
        let page = Page::new();
        let top = Frame::root(&page, "https://publisher.example");
        let creative = top.create_child(None, "https://creative.example");

        let events = Rc::new(RefCell::new(Vec::new()));
        let events_in = events.clone();
        top.add_listener(move |event| events_in.borrow_mut().push(event.data.clone()));

        let messenger = Rc::new(Messenger::new(
            Some("https://publisher.example/page"),
            &creative,
        ));
        let reporter = OutcomeReporter::new(messenger, "123");
        reporter.report(&RenderOutcome::Failed(
            RenderError::PreventWritingOnMainDocument("video".into()),
        ));
        page.pump();

        let events = events.borrow();
        let event: EventMessage = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(event.event, EVENT_RENDER_FAILED);
        let info = event.info.unwrap();
        assert_eq!(info.reason, "preventWritingOnMainDocument");
        assert!(info.message.contains("video"));
    }
}
