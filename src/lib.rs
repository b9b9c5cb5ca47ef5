//! # Creative Sandbox
//!
//! Renders a winning ad creative inside a publisher page that may embed
//! it through zero, one, or several nested, possibly cross-origin frames.
//! The hard part is not drawing markup; it is the origin-checked,
//! asynchronous request/response channel between the creative frame and
//! the orchestrating controller, and everything built on top of it:
//! native placeholder resolution, template substitution, and delegating
//! to untrusted renderer code inside an isolated execution context.
//!
//! ## Security guarantees
//!
//! - **Origin-checked channel**: inbound events are matched against the
//!   trusted publisher origin by strict equality; everything else is
//!   silently ignored
//! - **adId-filtered replies**: the channel is shared per frame, a reply
//!   only advances the attempt it belongs to
//! - **Sandboxed renderers**: renderer code runs in a heap-limited,
//!   time-limited V8 isolate with no fs, net, env, or import access
//! - **Allowlisted renderer sources**: executable code is only fetched
//!   from `https` origins on the configured allowlist
//! - **One terminal event per attempt**: success or failure is reported
//!   exactly once, whatever goes wrong inside
//!
//! ## Usage
//!
//! ```rust,ignore
//! use creative_sandbox::{Frame, Page, TargetingPayload};
//!
//! let page = Page::new();
//! let top = Frame::root(&page, "https://publisher.example");
//! let creative = top.create_child(None, "https://creative.example");
//!
//! let targeting = TargetingPayload::from_value(&serde_json::json!({
//!     "adId": "abc",
//!     "pubUrl": "https://publisher.example/page",
//! }));
//! creative_sandbox::render_ad(&creative, &targeting).unwrap();
//! page.pump();
//! ```

pub mod assets;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod loader;
pub mod messenger;
pub mod placeholder;
pub mod protocol;
pub mod resolver;
pub mod sandbox;
pub mod targeting;

pub use assets::{Asset, AssetKey};
pub use cache::{CacheConfig, CachedBid};
pub use dispatcher::render_ad;
pub use error::RenderError;
pub use frame::{AdFrame, Document, Frame, FrameHandle, MessageEvent, Page};
pub use loader::RendererLoader;
pub use messenger::{CancelHandle, Messenger, LOCATOR_FRAME_NAME};
pub use placeholder::ScanMode;
pub use protocol::{OutcomeReporter, RenderOutcome};
pub use resolver::{
    load_mobile_assets, AssetResolver, MobileRenderResult, NativeDescriptor, RendererInvoker,
};
pub use sandbox::{ConsoleOutput, IsolateRenderer, SandboxConfig, SandboxRun};
pub use targeting::TargetingPayload;
