//! Failure taxonomy for render attempts.
//!
//! Every terminal failure of a render attempt maps to one of these
//! variants; the wire reason code carried in `adRenderFailed` events comes
//! from [`RenderError::reason`]. Plumbing errors that are not part of the
//! taxonomy (isolate setup, HTTP, JSON) stay on `anyhow` and are folded
//! into `Exception` at the reporting boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Configuration defect: no channel can exist without a publisher URL.
    #[error("publisher URL is required to reach the orchestrator")]
    MissingPublisherUrl,

    /// Nothing to substitute and no request-all flag set.
    #[error("no native placeholders found and no full-asset request configured")]
    MissingAssets,

    /// The orchestrator never produced a well-formed reply.
    #[error("gave up after {0} malformed replies")]
    Timeout(u32),

    /// A caught runtime error during response application or renderer
    /// execution; the message text is preserved and forwarded.
    #[error("{0}")]
    Exception(String),

    /// A reply arrived but carried neither markup nor a creative URL.
    #[error("response carried neither markup nor a creative URL")]
    NoAd,

    /// Policy refusal: the named media type may not be drawn into the
    /// main document.
    #[error("refusing to write {0} media into the main document")]
    PreventWritingOnMainDocument(String),
}

impl RenderError {
    /// Wire reason code for `adRenderFailed` events.
    pub fn reason(&self) -> &'static str {
        match self {
            RenderError::MissingPublisherUrl => "missingPublisherUrl",
            RenderError::MissingAssets => "missingAssets",
            RenderError::Timeout(_) => "timeout",
            RenderError::Exception(_) => "exception",
            RenderError::NoAd => "noAd",
            RenderError::PreventWritingOnMainDocument(_) => "preventWritingOnMainDocument",
        }
    }
}
