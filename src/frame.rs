//! Browsing-context simulation: frames, documents, and the delivery queue.
//!
//! The creative executes inside a graph of nested, possibly cross-origin
//! frames. Outside a real browser that graph has to be supplied by the
//! crate itself: a [`Page`] owns a FIFO delivery queue (the event loop),
//! and [`Frame`]s hold origin, name, parent/child links, message
//! listeners, and a [`Document`]. `post_message` never blocks and never
//! delivers synchronously; deliveries run only inside [`Page::pump`].
//!
//! Cross-origin guard: a delivery whose target origin does not match the
//! receiving frame's origin is dropped at post time, the same way the
//! platform primitive drops it. Drops are logged, never surfaced.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::debug;

pub type FrameHandle = Rc<Frame>;

/// An inbound cross-frame message as seen by a listener.
#[derive(Clone)]
pub struct MessageEvent {
    /// Origin of the sending frame.
    pub origin: String,
    /// Serialized message payload.
    pub data: String,
    /// The sending frame, for replies.
    pub source: Weak<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Same-origin render hook standing in for the orchestrator's global
/// render API. Takes the ad id; an `Err` models the call throwing.
pub type RenderApi = Rc<dyn Fn(&str) -> Result<(), String>>;

struct Delivery {
    target: Weak<Frame>,
    event: MessageEvent,
}

/// Owns the delivery queue shared by every frame in one page.
pub struct Page {
    queue: RefCell<VecDeque<Delivery>>,
    pumping: Cell<bool>,
    next_listener: Cell<u64>,
}

impl Page {
    pub fn new() -> Rc<Page> {
        Rc::new(Page {
            queue: RefCell::new(VecDeque::new()),
            pumping: Cell::new(false),
            next_listener: Cell::new(1),
        })
    }

    /// Drain queued deliveries in FIFO order. Deliveries enqueued by a
    /// listener run in the same drain. Reentrant calls are no-ops; the
    /// outer drain picks up whatever they would have processed.
    pub fn pump(&self) {
        if self.pumping.replace(true) {
            return;
        }
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(delivery) = next else { break };
            if let Some(frame) = delivery.target.upgrade() {
                frame.deliver(&delivery.event);
            }
        }
        self.pumping.set(false);
    }

    /// True when no deliveries are waiting.
    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    fn enqueue(&self, delivery: Delivery) {
        self.queue.borrow_mut().push_back(delivery);
    }

    fn next_listener_id(&self) -> ListenerId {
        let id = self.next_listener.get();
        self.next_listener.set(id + 1);
        ListenerId(id)
    }
}

pub struct Frame {
    page: Weak<Page>,
    origin: String,
    name: Option<String>,
    parent: RefCell<Weak<Frame>>,
    children: RefCell<Vec<FrameHandle>>,
    listeners: RefCell<Vec<(ListenerId, Rc<dyn Fn(&MessageEvent)>)>>,
    document: RefCell<Document>,
    render_api: RefCell<Option<RenderApi>>,
}

impl Frame {
    /// Create a top-level frame on `page`.
    pub fn root(page: &Rc<Page>, origin: &str) -> FrameHandle {
        Rc::new(Frame {
            page: Rc::downgrade(page),
            origin: origin.to_string(),
            name: None,
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
            document: RefCell::new(Document::default()),
            render_api: RefCell::new(None),
        })
    }

    /// Create a nested frame. The child holds a weak link back to its
    /// parent; the parent keeps the child alive.
    pub fn create_child(self: &Rc<Self>, name: Option<&str>, origin: &str) -> FrameHandle {
        let child = Rc::new(Frame {
            page: self.page.clone(),
            origin: origin.to_string(),
            name: name.map(str::to_string),
            parent: RefCell::new(Rc::downgrade(self)),
            children: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
            document: RefCell::new(Document::default()),
            render_api: RefCell::new(None),
        });
        self.children.borrow_mut().push(child.clone());
        child
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<FrameHandle> {
        self.parent.borrow().upgrade()
    }

    /// Look up a direct child by its frame name.
    pub fn named_child(&self, name: &str) -> Option<FrameHandle> {
        self.children
            .borrow()
            .iter()
            .find(|child| child.name.as_deref() == Some(name))
            .cloned()
    }

    /// Queue a message for this frame. `target_origin` must be `"*"` or
    /// equal to this frame's origin; otherwise the delivery is dropped.
    /// `source` is the sending frame, recorded on the event for replies.
    pub fn post_message(self: &Rc<Self>, data: &str, target_origin: &str, source: &FrameHandle) {
        if target_origin != "*" && target_origin != self.origin {
            debug!(
                target_origin,
                frame_origin = %self.origin,
                "dropping cross-origin delivery"
            );
            return;
        }
        let Some(page) = self.page.upgrade() else {
            debug!("dropping delivery to detached frame");
            return;
        };
        page.enqueue(Delivery {
            target: Rc::downgrade(self),
            event: MessageEvent {
                origin: source.origin.clone(),
                data: data.to_string(),
                source: Rc::downgrade(source),
            },
        });
    }

    pub fn add_listener(&self, listener: impl Fn(&MessageEvent) + 'static) -> ListenerId {
        let id = self
            .page
            .upgrade()
            .map(|page| page.next_listener_id())
            .unwrap_or(ListenerId(0));
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    /// Idempotent; removing an unknown id is a no-op.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.borrow_mut().retain(|(lid, _)| *lid != id);
    }

    fn deliver(&self, event: &MessageEvent) {
        // Snapshot so listeners can register/remove listeners reentrantly.
        let snapshot: Vec<Rc<dyn Fn(&MessageEvent)>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn document(&self) -> std::cell::Ref<'_, Document> {
        self.document.borrow()
    }

    pub fn document_mut(&self) -> std::cell::RefMut<'_, Document> {
        self.document.borrow_mut()
    }

    /// Install the orchestrator's render hook on this frame.
    pub fn set_render_api(&self, api: RenderApi) {
        *self.render_api.borrow_mut() = Some(api);
    }

    /// Invoke the render hook the way a same-origin caller would. A
    /// cross-origin caller is rejected before the hook is consulted, the
    /// same way the platform raises a security error.
    pub fn try_invoke_render(&self, caller_origin: &str, ad_id: &str) -> Result<(), String> {
        if self.origin != caller_origin {
            return Err(format!(
                "cross-origin access from {} blocked",
                caller_origin
            ));
        }
        match self.render_api.borrow().clone() {
            Some(api) => api(ad_id),
            None => Err("no render API on this frame".to_string()),
        }
    }
}

/// A created ad sub-frame inside a [`Document`].
#[derive(Debug, Default, Clone)]
pub struct AdFrame {
    pub width: u32,
    pub height: u32,
    pub content: String,
    pub src: Option<String>,
    pub hidden: bool,
}

/// Markup container for one frame: head and body markup, created ad
/// frames, and a measured height used for resize reporting.
#[derive(Debug, Default)]
pub struct Document {
    head: String,
    body: String,
    ad_frames: Vec<AdFrame>,
    height: u32,
}

impl Document {
    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_head(&mut self, markup: &str) {
        self.head = markup.to_string();
    }

    pub fn set_body(&mut self, markup: &str) {
        self.body = markup.to_string();
    }

    /// Replace the body content with `markup`, stripping any XML or
    /// DOCTYPE prolog first (the markup-writer contract).
    pub fn write(&mut self, markup: &str) {
        self.body = strip_prolog(markup).to_string();
    }

    pub fn create_ad_frame(&mut self, width: u32, height: u32) -> usize {
        self.ad_frames.push(AdFrame {
            width,
            height,
            ..AdFrame::default()
        });
        self.ad_frames.len() - 1
    }

    /// Zero-size hidden frame seeded with `content`; the isolation
    /// container for untrusted renderer source.
    pub fn create_hidden_frame(&mut self, content: &str) -> usize {
        self.ad_frames.push(AdFrame {
            width: 0,
            height: 0,
            content: content.to_string(),
            src: None,
            hidden: true,
        });
        self.ad_frames.len() - 1
    }

    pub fn ad_frames(&self) -> &[AdFrame] {
        &self.ad_frames
    }

    pub fn ad_frame_mut(&mut self, index: usize) -> Option<&mut AdFrame> {
        self.ad_frames.get_mut(index)
    }

    pub fn set_height(&mut self, height: u32) {
        self.height = height;
    }

    /// The height reported back to the orchestrator. With no explicit
    /// height this falls back to a line-count text metric, the
    /// simulation's stand-in for layout.
    pub fn measured_height(&self) -> u32 {
        if self.height > 0 {
            return self.height;
        }
        let text_height = 16 * self.body.lines().count() as u32;
        let frame_height = self
            .ad_frames
            .iter()
            .filter(|frame| !frame.hidden)
            .map(|frame| frame.height)
            .max()
            .unwrap_or(0);
        text_height.max(frame_height)
    }
}

/// Drop a leading `<?xml ...?>` and/or `<!DOCTYPE ...>` prolog.
pub fn strip_prolog(markup: &str) -> &str {
    let mut rest = markup.trim_start();
    if rest.starts_with("<?xml") {
        if let Some(end) = rest.find("?>") {
            rest = rest[end + 2..].trim_start();
        }
    }
    let lowered = rest.to_ascii_lowercase();
    if lowered.starts_with("<!doctype") {
        if let Some(end) = rest.find('>') {
            rest = rest[end + 1..].trim_start();
        }
    }
    rest
}
