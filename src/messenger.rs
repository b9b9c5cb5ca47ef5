//! The channel between the creative frame and the orchestrator.
//!
//! A messenger resolves its target once (the nearest ancestor whose frame
//! set contains the well-known locator frame, bounded walk), derives the
//! trusted origin from the publisher URL, and then exposes a single
//! `send` operation. With a response callback attached, inbound events on
//! the local window are filtered by strict origin equality and forwarded
//! to the callback for as long as the returned handle stays uncanceled.
//!
//! One messenger per render attempt; never reused across attempts.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::RenderError;
use crate::frame::{Frame, FrameHandle, ListenerId, MessageEvent};

/// Name of the orchestrator's landmark sub-frame.
pub const LOCATOR_FRAME_NAME: &str = "__pb_locator__";

/// Cap on the ancestor walk; malformed frame graphs must not loop us.
const MAX_ANCESTOR_HOPS: usize = 10;

/// Per-event response callback. Invoked for every matching event until
/// the corresponding [`CancelHandle`] is canceled.
pub type OnResponse = Box<dyn Fn(&MessageEvent)>;

/// Detaches a response listener. Idempotent; cloning shares the handle.
#[derive(Clone)]
pub struct CancelHandle {
    window: Weak<Frame>,
    id: Rc<RefCell<Option<ListenerId>>>,
}

impl CancelHandle {
    fn active(window: &FrameHandle, id: ListenerId) -> CancelHandle {
        CancelHandle {
            window: Rc::downgrade(window),
            id: Rc::new(RefCell::new(Some(id))),
        }
    }

    /// Handle for a send that attached no listener.
    pub fn detached() -> CancelHandle {
        CancelHandle {
            window: Weak::new(),
            id: Rc::new(RefCell::new(None)),
        }
    }

    pub fn cancel(&self) {
        if let Some(id) = self.id.borrow_mut().take() {
            if let Some(window) = self.window.upgrade() {
                window.remove_listener(id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.id.borrow().is_some()
    }
}

pub struct Messenger {
    window: FrameHandle,
    target: FrameHandle,
    trusted_origin: Option<String>,
}

impl Messenger {
    /// Build the channel for one render attempt. A missing or unparsable
    /// publisher URL is remembered and surfaces as
    /// [`RenderError::MissingPublisherUrl`] on the first `send`.
    pub fn new(publisher_url: Option<&str>, window: &FrameHandle) -> Messenger {
        let trusted_origin = publisher_url.and_then(|raw| {
            Url::parse(raw)
                .ok()
                .map(|url| url.origin().ascii_serialization())
        });
        Messenger {
            window: window.clone(),
            target: resolve_target(window),
            trusted_origin,
        }
    }

    pub fn trusted_origin(&self) -> Option<&str> {
        self.trusted_origin.as_deref()
    }

    pub fn window(&self) -> &FrameHandle {
        &self.window
    }

    /// Serialize `message` and post it once to the resolved target,
    /// scoped to the trusted origin. With `on_response`, a listener is
    /// attached first so a fast reply cannot be missed; it receives every
    /// origin-matching event until the returned handle is canceled.
    pub fn send(
        &self,
        message: &Value,
        on_response: Option<OnResponse>,
    ) -> Result<CancelHandle, RenderError> {
        let origin = self
            .trusted_origin
            .clone()
            .ok_or(RenderError::MissingPublisherUrl)?;

        let handle = match on_response {
            Some(callback) => {
                let filter_origin = origin.clone();
                let id = self.window.add_listener(move |event| {
                    if event.origin == filter_origin {
                        callback(event);
                    } else {
                        debug!(origin = %event.origin, "ignoring event from untrusted origin");
                    }
                });
                CancelHandle::active(&self.window, id)
            }
            None => CancelHandle::detached(),
        };

        self.target
            .post_message(&message.to_string(), &origin, &self.window);
        Ok(handle)
    }
}

/// Walk ancestors looking for the frame that hosts the orchestrator's
/// locator; fall back to the immediate parent when the walk tops out.
fn resolve_target(window: &FrameHandle) -> FrameHandle {
    let immediate = match window.parent() {
        Some(parent) => parent,
        // A frame with no parent talks to itself; sends will still be
        // origin-guarded.
        None => window.clone(),
    };

    let mut current = immediate.clone();
    for _ in 0..MAX_ANCESTOR_HOPS {
        if current.named_child(LOCATOR_FRAME_NAME).is_some() {
            return current;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    immediate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Page;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    const PUB_URL: &str = "https://publisher.example/page?x=1";
    const PUB_ORIGIN: &str = "https://publisher.example";

    #[test]
    fn test_missing_publisher_url_fails_at_send() {
        let page = Page::new();
        let top = Frame::root(&page, PUB_ORIGIN);
        let creative = top.create_child(None, "https://creative.example");

        let messenger = Messenger::new(None, &creative);
        let result = messenger.send(&json!({"message": "Prebid Request"}), None);
        assert!(matches!(result, Err(RenderError::MissingPublisherUrl)));
    }

    #[test]
    fn test_target_is_frame_with_locator() {
        let page = Page::new();
        let top = Frame::root(&page, PUB_ORIGIN);
        top.create_child(Some(LOCATOR_FRAME_NAME), PUB_ORIGIN);
        let safeframe = top.create_child(None, "https://safeframe.example");
        let creative = safeframe.create_child(None, "https://creative.example");

        let received = Rc::new(Cell::new(0u32));
        let received_in = received.clone();
        top.add_listener(move |_| received_in.set(received_in.get() + 1));

        let messenger = Messenger::new(Some(PUB_URL), &creative);
        messenger.send(&json!({"message": "ping"}), None).unwrap();
        page.pump();
        assert_eq!(received.get(), 1);
    }

    #[test]
    fn test_no_locator_falls_back_to_immediate_parent() {
        let page = Page::new();
        let top = Frame::root(&page, PUB_ORIGIN);
        let creative = top.create_child(None, "https://creative.example");

        let received = Rc::new(Cell::new(0u32));
        let received_in = received.clone();
        top.add_listener(move |_| received_in.set(received_in.get() + 1));

        let messenger = Messenger::new(Some(PUB_URL), &creative);
        messenger.send(&json!({"message": "ping"}), None).unwrap();
        page.pump();
        assert_eq!(received.get(), 1);
    }

    #[test]
    fn test_ancestor_walk_is_bounded() {
        let page = Page::new();
        let top = Frame::root(&page, PUB_ORIGIN);
        top.create_child(Some(LOCATOR_FRAME_NAME), PUB_ORIGIN);
        // Nest deeper than the hop cap; the locator is out of reach and
        // the immediate parent must win.
        let mut current = top.clone();
        for depth in 0..12 {
            current = current.create_child(None, &format!("https://nest{depth}.example"));
        }
        let immediate = current.clone();
        let creative = current.create_child(None, "https://creative.example");

        let received = Rc::new(Cell::new(0u32));
        let received_in = received.clone();
        immediate.add_listener(move |_| received_in.set(received_in.get() + 1));

        let messenger = Messenger::new(Some("https://nest11.example/p"), &creative);
        messenger.send(&json!({"message": "ping"}), None).unwrap();
        page.pump();
        assert_eq!(received.get(), 1);
    }

    #[test]
    fn test_response_callback_filters_origin() {
        let page = Page::new();
        let top = Frame::root(&page, PUB_ORIGIN);
        let stranger = top.create_child(None, "https://stranger.example");
        let creative = top.create_child(None, "https://creative.example");

        let seen = Rc::new(Cell::new(0u32));
        let seen_in = seen.clone();
        let messenger = Messenger::new(Some(PUB_URL), &creative);
        let handle = messenger
            .send(
                &json!({"message": "Prebid Request"}),
                Some(Box::new(move |_| seen_in.set(seen_in.get() + 1))),
            )
            .unwrap();

        creative.post_message("{}", "*", &stranger);
        creative.post_message("{}", "*", &top);
        creative.post_message("{}", "*", &top);
        page.pump();
        // Trusted-origin events keep arriving until canceled; the
        // stranger's never does.
        assert_eq!(seen.get(), 2);
        assert!(handle.is_active());
        handle.cancel();
    }

    #[test]
    fn test_cancel_prevents_later_delivery() {
        let page = Page::new();
        let top = Frame::root(&page, PUB_ORIGIN);
        let creative = top.create_child(None, "https://creative.example");

        let seen = Rc::new(Cell::new(0u32));
        let seen_in = seen.clone();
        let messenger = Messenger::new(Some(PUB_URL), &creative);
        let handle = messenger
            .send(
                &json!({"message": "Prebid Request"}),
                Some(Box::new(move |_| seen_in.set(seen_in.get() + 1))),
            )
            .unwrap();

        handle.cancel();
        handle.cancel(); // idempotent

        creative.post_message("{}", "*", &top);
        page.pump();
        assert_eq!(seen.get(), 0);
        assert!(!handle.is_active());
    }
}
