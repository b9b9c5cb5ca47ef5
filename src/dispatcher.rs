//! Cross-domain / legacy render dispatcher.
//!
//! Two ways to get a banner drawn. If an ancestor frame exposes the
//! orchestrator's render API and is reachable same-origin, call it
//! directly and stop at the first call that does not throw; the
//! orchestrator then owns the outcome. Otherwise request the payload
//! over the channel and draw it locally into a fresh ad frame, reporting
//! exactly one `Succeeded`/`Failed` event back over the same channel.
//!
//! Video never draws locally: writing video into the main document is
//! refused outright and reported as a failure.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::error::RenderError;
use crate::frame::{strip_prolog, FrameHandle};
use crate::messenger::{CancelHandle, Messenger};
use crate::protocol::{
    parse_reply, OutcomeReporter, RenderOutcome, RenderRequest, RenderResponse,
    RENDER_RESPONSE_MESSAGE,
};
use crate::targeting::TargetingPayload;

/// Cap on the same-origin ancestor probe.
pub const MAX_LEGACY_HOPS: usize = 10;

const MEDIA_TYPE_VIDEO: &str = "video";

/// Entry point for banner creatives. Needs at least an `adId`; that is a
/// configuration defect, not a render failure, so it surfaces as an error
/// instead of an event.
pub fn render_ad(window: &FrameHandle, targeting: &TargetingPayload) -> Result<()> {
    let ad_id = targeting
        .ad_id()
        .ok_or_else(|| anyhow!("targeting payload carries no adId"))?;

    if try_legacy_render(window, ad_id) {
        return Ok(());
    }

    let messenger = Rc::new(Messenger::new(targeting.pub_url(), window));
    let reporter = Rc::new(OutcomeReporter::new(messenger.clone(), ad_id));
    let request =
        serde_json::to_value(RenderRequest::new(ad_id, &ad_server_origin(targeting)))?;

    let cancel: Rc<RefCell<Option<CancelHandle>>> = Rc::new(RefCell::new(None));
    let window = window.clone();
    let ad_id = ad_id.to_string();
    let reporter_cb = reporter.clone();
    let cancel_cb = cancel.clone();

    let handle = messenger.send(
        &request,
        Some(Box::new(move |event| {
            let Some(response) =
                parse_reply::<RenderResponse>(&event.data, RENDER_RESPONSE_MESSAGE)
            else {
                debug!("ignoring non-response message on render channel");
                return;
            };
            if response.ad_id != ad_id {
                return;
            }
            let outcome = draw_response(&window, &response);
            reporter_cb.report(&outcome);
            if let Some(handle) = cancel_cb.borrow_mut().take() {
                handle.cancel();
            }
        })),
    )?;
    *cancel.borrow_mut() = Some(handle);
    Ok(())
}

/// Probe ancestors for a same-origin render API; first call that does
/// not throw wins. The walk is bounded; exceeding the cap means "no
/// reachable target", never an error.
fn try_legacy_render(window: &FrameHandle, ad_id: &str) -> bool {
    let caller_origin = window.origin().to_string();
    let mut current = window.parent();
    let mut hops = 0;
    while let Some(frame) = current {
        if hops >= MAX_LEGACY_HOPS {
            break;
        }
        match frame.try_invoke_render(&caller_origin, ad_id) {
            Ok(()) => {
                debug!(ad_id, hops, "rendered through ancestor API");
                return true;
            }
            Err(error) => debug!(ad_id, hops, %error, "ancestor render probe failed"),
        }
        current = frame.parent();
        hops += 1;
    }
    false
}

fn ad_server_origin(targeting: &TargetingPayload) -> String {
    match targeting.ad_server_domain() {
        Some(domain) if domain.starts_with("http://") || domain.starts_with("https://") => {
            domain.to_string()
        }
        Some(domain) => format!("https://{domain}"),
        None => String::new(),
    }
}

fn draw_response(window: &FrameHandle, response: &RenderResponse) -> RenderOutcome {
    if response.media_type.as_deref() == Some(MEDIA_TYPE_VIDEO) {
        return RenderOutcome::Failed(RenderError::PreventWritingOnMainDocument(
            MEDIA_TYPE_VIDEO.to_string(),
        ));
    }
    match draw(window, response) {
        Ok(()) => RenderOutcome::Succeeded,
        Err(error) => RenderOutcome::Failed(error),
    }
}

fn draw(window: &FrameHandle, response: &RenderResponse) -> Result<(), RenderError> {
    let markup = response.ad.as_deref().filter(|ad| !ad.is_empty());
    let ad_url = response.ad_url.as_deref().filter(|url| !url.is_empty());
    if markup.is_none() && ad_url.is_none() {
        return Err(RenderError::NoAd);
    }

    let width = response.width.unwrap_or(1);
    let height = response.height.unwrap_or(1);

    let mut document = window.document_mut();
    let index = document.create_ad_frame(width, height);
    let frame = document
        .ad_frame_mut(index)
        .ok_or_else(|| RenderError::Exception("ad frame vanished while drawing".to_string()))?;
    if let Some(markup) = markup {
        frame.content = strip_prolog(markup).to_string();
    } else if let Some(url) = ad_url {
        frame.src = Some(url.to_string());
    }
    Ok(())
}
