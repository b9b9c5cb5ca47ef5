//! Dynamic renderer sandbox - executes untrusted renderer code in a V8
//! isolate.
//!
//! The renderer gets exactly one surface, installed by `bootstrap.js`:
//! - console.log/warn/error (captured, not printed)
//! - facilities.sendMessage (adId-tagged, bridged to the Messenger)
//! - facilities.mkFrame (creates ad frames in the host document)
//! - No fs, net, env, imports, or other system access
//!
//! Each run builds a fresh heap-limited isolate, seeds a hidden zero-size
//! frame on the host with the renderer script, evaluates the source, and
//! invokes the exported `render(data, facilities)`. The return value may
//! be a plain value or a thenable. Every externally reachable boundary
//! (evaluation, the render call, every response callback) is wrapped so a
//! thrown error becomes a single failure report and never crashes the
//! host frame.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Error};
use deno_core::{op2, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RenderError;
use crate::frame::{strip_prolog, AdFrame, Frame, FrameHandle, Page};
use crate::messenger::{CancelHandle, Messenger};
use crate::protocol::{OutcomeReporter, RenderOutcome};
use crate::resolver::RendererInvoker;

/// Captured console output from the sandboxed renderer.
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

/// Limits applied to one renderer run.
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited).
    pub max_heap_size: Option<usize>,
    /// Maximum wall-clock time for one render in milliseconds
    /// (default: 10000ms, None = unlimited).
    pub timeout_ms: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            max_heap_size: Some(64 * 1024 * 1024),
            timeout_ms: Some(10_000),
        }
    }
}

/// Result of one sandboxed render attempt.
#[derive(Debug)]
pub struct SandboxRun {
    pub outcome: RenderOutcome,
    pub console: ConsoleOutput,
}

// ============================================================================
// Ops
// ============================================================================

#[derive(Default)]
struct Outbox {
    messages: Vec<Outbound>,
}

struct Outbound {
    payload: String,
    channel: u32,
}

/// Where frames created by the renderer land: the real host document, or
/// a scratch list when running without a host (markup-only renders).
enum FrameSink {
    Host(Weak<Frame>),
    Scratch(Rc<RefCell<Vec<AdFrame>>>),
}

#[op2(fast)]
fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

#[op2(fast)]
fn op_send_message(state: &mut OpState, #[string] payload: &str, channel: u32) {
    if let Some(outbox) = state.try_borrow_mut::<Outbox>() {
        outbox.messages.push(Outbound {
            payload: payload.to_string(),
            channel,
        });
    }
}

#[op2(fast)]
fn op_mk_frame(state: &mut OpState, width: u32, height: u32) -> Result<u32, Error> {
    let sink = state
        .try_borrow_mut::<FrameSink>()
        .ok_or_else(|| anyhow!("no frame sink configured"))?;
    match sink {
        FrameSink::Host(host) => {
            let frame = host
                .upgrade()
                .ok_or_else(|| anyhow!("host frame detached"))?;
            let index = frame.document_mut().create_ad_frame(width, height);
            Ok(index as u32)
        }
        FrameSink::Scratch(frames) => {
            let mut frames = frames.borrow_mut();
            frames.push(AdFrame {
                width,
                height,
                ..AdFrame::default()
            });
            Ok((frames.len() - 1) as u32)
        }
    }
}

#[op2(fast)]
fn op_frame_write(state: &mut OpState, id: u32, #[string] markup: &str) -> Result<(), Error> {
    let content = strip_prolog(markup).to_string();
    let sink = state
        .try_borrow_mut::<FrameSink>()
        .ok_or_else(|| anyhow!("no frame sink configured"))?;
    match sink {
        FrameSink::Host(host) => {
            let frame = host
                .upgrade()
                .ok_or_else(|| anyhow!("host frame detached"))?;
            let mut document = frame.document_mut();
            let ad_frame = document
                .ad_frame_mut(id as usize)
                .ok_or_else(|| anyhow!("unknown frame {}", id))?;
            ad_frame.content = content;
            Ok(())
        }
        FrameSink::Scratch(frames) => {
            let mut frames = frames.borrow_mut();
            let ad_frame = frames
                .get_mut(id as usize)
                .ok_or_else(|| anyhow!("unknown frame {}", id))?;
            ad_frame.content = content;
            Ok(())
        }
    }
}

deno_core::extension!(
    creative_runtime,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_send_message,
        op_mk_frame,
        op_frame_write,
    ],
    esm_entry_point = "ext:creative_runtime/bootstrap.js",
    esm = ["ext:creative_runtime/bootstrap.js" = "src/bootstrap.js"],
);

// ============================================================================
// Isolate lifecycle
// ============================================================================

fn build_runtime(config: &SandboxConfig, sink: FrameSink) -> Result<JsRuntime, Error> {
    let create_params = config
        .max_heap_size
        .map(|max_bytes| deno_core::v8::Isolate::create_params().heap_limits(0, max_bytes));

    // No module loader: import() is unavailable to renderer code; all
    // source arrives pre-validated through the renderer loader.
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![creative_runtime::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if config.max_heap_size.is_some() {
        runtime.add_near_heap_limit_callback(|current, initial| {
            // Don't raise the limit; let V8 terminate with an OOM error.
            warn!(
                current_mb = current / (1024 * 1024),
                initial_mb = initial / (1024 * 1024),
                "renderer near heap limit"
            );
            current
        });
    }

    runtime.op_state().borrow_mut().put(ConsoleOutput::default());
    runtime.op_state().borrow_mut().put(Outbox::default());
    runtime.op_state().borrow_mut().put(sink);

    Ok(runtime)
}

fn console_output(runtime: &mut JsRuntime) -> ConsoleOutput {
    runtime
        .op_state()
        .borrow()
        .try_borrow::<ConsoleOutput>()
        .cloned()
        .unwrap_or_default()
}

enum PromisePoll {
    Pending,
    Fulfilled(Option<String>),
    Rejected(String),
}

fn poll_promise(
    runtime: &mut JsRuntime,
    promise: &deno_core::v8::Global<deno_core::v8::Value>,
) -> PromisePoll {
    let scope = &mut runtime.handle_scope();
    let local = deno_core::v8::Local::new(scope, promise);

    if let Ok(promise) = deno_core::v8::Local::<deno_core::v8::Promise>::try_from(local) {
        match promise.state() {
            deno_core::v8::PromiseState::Fulfilled => {
                let result = promise.result(scope);
                if result.is_string() {
                    PromisePoll::Fulfilled(Some(result.to_rust_string_lossy(scope)))
                } else {
                    PromisePoll::Fulfilled(None)
                }
            }
            deno_core::v8::PromiseState::Rejected => {
                let exception = promise.result(scope);
                PromisePoll::Rejected(exception.to_rust_string_lossy(scope))
            }
            deno_core::v8::PromiseState::Pending => PromisePoll::Pending,
        }
    } else if local.is_string() {
        PromisePoll::Fulfilled(Some(local.to_rust_string_lossy(scope)))
    } else {
        PromisePoll::Fulfilled(None)
    }
}

/// Bridges isolate-outbound messages to the Messenger and inbound
/// replies back into the isolate.
struct ChannelBridge {
    ad_id: String,
    messenger: Rc<Messenger>,
    page: Rc<Page>,
    inbox: Rc<RefCell<Vec<(u32, String)>>>,
    cancels: RefCell<Vec<CancelHandle>>,
    callback_failure: RefCell<Option<String>>,
}

impl ChannelBridge {
    fn new(ad_id: &str, messenger: Rc<Messenger>, page: Rc<Page>) -> ChannelBridge {
        ChannelBridge {
            ad_id: ad_id.to_string(),
            messenger,
            page,
            inbox: Rc::new(RefCell::new(Vec::new())),
            cancels: RefCell::new(Vec::new()),
            callback_failure: RefCell::new(None),
        }
    }

    /// Move one round of traffic in both directions. Returns whether
    /// anything happened, so the drive loop can tell idle from stalled.
    fn flush(&self, runtime: &mut JsRuntime) -> Result<bool, RenderError> {
        let mut progressed = false;

        let outgoing: Vec<Outbound> = {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            match op_state.try_borrow_mut::<Outbox>() {
                Some(outbox) => outbox.messages.drain(..).collect(),
                None => Vec::new(),
            }
        };

        for outbound in outgoing {
            progressed = true;
            let mut message: Value = match serde_json::from_str(&outbound.payload) {
                Ok(value) => value,
                Err(error) => {
                    debug!(%error, "dropping unparsable renderer message");
                    continue;
                }
            };
            // Tag every outgoing message with the current ad id.
            if let Some(object) = message.as_object_mut() {
                object.insert("adId".to_string(), Value::String(self.ad_id.clone()));
            }

            if outbound.channel == 0 {
                self.messenger.send(&message, None)?;
            } else {
                let inbox = self.inbox.clone();
                let ad_id = self.ad_id.clone();
                let channel = outbound.channel;
                let handle = self.messenger.send(
                    &message,
                    Some(Box::new(move |event| {
                        // The channel is shared; only replies for this ad
                        // reach the sandbox.
                        if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                            let reply_ad = value.get("adId").and_then(Value::as_str);
                            if reply_ad.is_none() || reply_ad == Some(ad_id.as_str()) {
                                inbox.borrow_mut().push((channel, event.data.clone()));
                            }
                        }
                    })),
                )?;
                self.cancels.borrow_mut().push(handle);
            }
        }

        self.page.pump();

        let pending: Vec<(u32, String)> = self.inbox.borrow_mut().drain(..).collect();
        for (channel, data) in pending {
            progressed = true;
            let literal = serde_json::to_string(&data)
                .map_err(|e| RenderError::Exception(e.to_string()))?;
            let code = format!("globalThis.__creative_dispatch__({channel}, {literal})");
            let result = runtime
                .execute_script("<dispatch>", code)
                .map_err(|e| RenderError::Exception(e.to_string()))?;
            let failure = {
                let scope = &mut runtime.handle_scope();
                let local = deno_core::v8::Local::new(scope, &result);
                local.to_rust_string_lossy(scope)
            };
            if !failure.is_empty() && self.callback_failure.borrow().is_none() {
                *self.callback_failure.borrow_mut() = Some(failure);
            }
        }

        Ok(progressed)
    }

    fn close(&self) {
        for handle in self.cancels.borrow_mut().drain(..) {
            handle.cancel();
        }
    }
}

async fn drive(
    runtime: &mut JsRuntime,
    renderer_source: &str,
    data: &Value,
    bridge: Option<&ChannelBridge>,
) -> Result<Option<String>, RenderError> {
    runtime
        .execute_script("<renderer>", renderer_source.to_string())
        .map_err(|e| RenderError::Exception(e.to_string()))?;

    let payload = serde_json::to_string(data).map_err(|e| RenderError::Exception(e.to_string()))?;
    let promise = runtime
        .execute_script("<invoke>", format!("globalThis.__creative_invoke__({payload})"))
        .map_err(|e| RenderError::Exception(e.to_string()))?;

    loop {
        runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(|e| RenderError::Exception(e.to_string()))?;

        match poll_promise(runtime, &promise) {
            PromisePoll::Fulfilled(value) => return Ok(value),
            PromisePoll::Rejected(message) => return Err(RenderError::Exception(message)),
            PromisePoll::Pending => {}
        }

        let progressed = match bridge {
            Some(bridge) => bridge.flush(runtime)?,
            None => false,
        };
        if !progressed {
            // One final look: a dispatch may have settled it.
            return match poll_promise(runtime, &promise) {
                PromisePoll::Fulfilled(value) => Ok(value),
                PromisePoll::Rejected(message) => Err(RenderError::Exception(message)),
                PromisePoll::Pending => Err(RenderError::Exception(
                    "renderer returned an unresolved promise".to_string(),
                )),
            };
        }
    }
}

/// Run `drive` under the configured wall-clock limit, terminating the
/// isolate when it expires.
async fn drive_with_timeout(
    runtime: &mut JsRuntime,
    renderer_source: &str,
    data: &Value,
    bridge: Option<&ChannelBridge>,
    timeout_ms: Option<u64>,
) -> Result<Option<String>, RenderError> {
    match timeout_ms {
        Some(ms) => {
            let isolate_handle = runtime.v8_isolate().thread_safe_handle();
            let timeout_handle = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                isolate_handle.terminate_execution();
            });

            let result = drive(runtime, renderer_source, data, bridge).await;
            timeout_handle.abort();

            // V8 termination surfaces as assorted error strings.
            match result {
                Err(RenderError::Exception(message)) if message.contains("terminated") => {
                    Err(RenderError::Exception(format!(
                        "renderer timed out after {ms}ms"
                    )))
                }
                other => other,
            }
        }
        None => drive(runtime, renderer_source, data, bridge).await,
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Full sandbox lifecycle: hidden frame, facilities bridge, outcome
/// report. Exactly one `Prebid Event` is emitted per call, whatever
/// happens inside the isolate.
pub async fn run(
    ad_id: &str,
    renderer_source: &str,
    data: &Value,
    messenger: Rc<Messenger>,
    host: &FrameHandle,
    page: &Rc<Page>,
    config: &SandboxConfig,
) -> SandboxRun {
    let reporter = OutcomeReporter::new(messenger.clone(), ad_id);

    // Zero-size hidden sub-frame appended to the host document, seeded
    // with the renderer script; the isolate is its execution context.
    let frame_name = format!("creative_renderer_{}", uuid::Uuid::new_v4());
    debug!(ad_id, frame = %frame_name, "seeding renderer frame");
    host.document_mut()
        .create_hidden_frame(&format!("<script>{renderer_source}</script>"));

    let mut runtime = match build_runtime(config, FrameSink::Host(Rc::downgrade(host))) {
        Ok(runtime) => runtime,
        Err(error) => {
            let outcome = RenderOutcome::Failed(RenderError::Exception(error.to_string()));
            reporter.report(&outcome);
            page.pump();
            return SandboxRun {
                outcome,
                console: ConsoleOutput::default(),
            };
        }
    };

    let bridge = ChannelBridge::new(ad_id, messenger, page.clone());
    let result = drive_with_timeout(
        &mut runtime,
        renderer_source,
        data,
        Some(&bridge),
        config.timeout_ms,
    )
    .await;
    let console = console_output(&mut runtime);

    // A response-callback exception outranks a later resolution: the
    // attempt already failed from the orchestrator's point of view.
    let outcome = match bridge.callback_failure.borrow_mut().take() {
        Some(message) => RenderOutcome::Failed(RenderError::Exception(message)),
        None => match result {
            Ok(_) => RenderOutcome::Succeeded,
            Err(error) => RenderOutcome::Failed(error),
        },
    };

    reporter.report(&outcome);
    bridge.close();
    page.pump();

    SandboxRun { outcome, console }
}

/// Markup-only render: evaluate the renderer and return the string its
/// `render(data, facilities)` resolves to. No host frame, no messaging;
/// used when a resolved asset response names a renderer.
pub async fn render_markup(
    renderer_source: &str,
    data: &Value,
    config: &SandboxConfig,
) -> Result<(String, ConsoleOutput), RenderError> {
    let mut runtime = build_runtime(config, FrameSink::Scratch(Rc::new(RefCell::new(Vec::new()))))
        .map_err(|e| RenderError::Exception(e.to_string()))?;

    let result = drive_with_timeout(&mut runtime, renderer_source, data, None, config.timeout_ms).await;
    let console = console_output(&mut runtime);

    match result {
        Ok(Some(markup)) => Ok((markup, console)),
        Ok(None) => Err(RenderError::Exception(
            "renderer must return markup as a string".to_string(),
        )),
        Err(error) => Err(error),
    }
}

/// Synchronous facade over [`render_markup`] for message-callback
/// contexts. Owns its own current-thread runtime, so it must not be
/// called from within an async runtime.
#[derive(Default)]
pub struct IsolateRenderer {
    pub config: SandboxConfig,
}

impl RendererInvoker for IsolateRenderer {
    fn invoke(&self, ad_id: &str, source: &str, data: &Value) -> Result<String, RenderError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| RenderError::Exception(e.to_string()))?;
        let (markup, console) = runtime.block_on(render_markup(source, data, &self.config))?;
        for line in &console.errors {
            debug!(ad_id, line = %line, "renderer console error");
        }
        Ok(markup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventMessage;
    use serde_json::json;

    #[tokio::test]
    async fn test_render_markup_returns_string() {
        let source = r#"
            globalThis.render = (data) => "<h1>" + data.assets.title + "</h1>";
        "#;
        let (markup, _console) = render_markup(
            source,
            &json!({"adId": "a1", "assets": {"title": "Ad title"}}),
            &SandboxConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(markup, "<h1>Ad title</h1>");
    }

    #[tokio::test]
    async fn test_render_markup_awaits_thenables() {
        let source = r#"
            globalThis.render = () => Promise.resolve("<p>later</p>");
        "#;
        let (markup, _console) =
            render_markup(source, &json!({"adId": "a1"}), &SandboxConfig::default())
                .await
                .unwrap();
        assert_eq!(markup, "<p>later</p>");
    }

    #[tokio::test]
    async fn test_render_markup_captures_console() {
        let source = r#"
            globalThis.render = () => {
                console.log("rendering", { step: 1 });
                return "<p>ok</p>";
            };
        "#;
        let (_markup, console) =
            render_markup(source, &json!({"adId": "a1"}), &SandboxConfig::default())
                .await
                .unwrap();
        assert_eq!(console.logs.len(), 1);
        assert!(console.logs[0].contains("rendering"));
    }

    #[tokio::test]
    async fn test_sync_throw_becomes_exception() {
        let source = r#"
            globalThis.render = () => { throw new Error("renderer blew up"); };
        "#;
        let error = render_markup(source, &json!({"adId": "a1"}), &SandboxConfig::default())
            .await
            .unwrap_err();
        assert_eq!(error.reason(), "exception");
        assert!(error.to_string().contains("renderer blew up"));
    }

    #[test]
    fn test_isolate_renderer_sync_facade() {
        let renderer = IsolateRenderer::default();
        let markup = renderer
            .invoke(
                "ad-9",
                "globalThis.render = (data) => `<b>${data.assets.cta}</b>`;",
                &json!({"assets": {"cta": "Go"}}),
            )
            .unwrap();
        assert_eq!(markup, "<b>Go</b>");
    }

    #[tokio::test]
    async fn test_non_string_result_is_rejected() {
        let source = "globalThis.render = () => 42;";
        let error = render_markup(source, &json!({}), &SandboxConfig::default())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("string"));
    }

    fn creative_page() -> (
        Rc<Page>,
        FrameHandle,
        FrameHandle,
        Rc<RefCell<Vec<String>>>,
    ) {
        let page = Page::new();
        let top = Frame::root(&page, "https://publisher.example");
        let creative = top.create_child(None, "https://creative.example");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        top.add_listener(move |event| seen_in.borrow_mut().push(event.data.clone()));
        (page, top, creative, seen)
    }

    #[tokio::test]
    async fn test_run_reports_success_exactly_once() {
        let (page, _top, creative, seen) = creative_page();
        let messenger = Rc::new(Messenger::new(
            Some("https://publisher.example/page"),
            &creative,
        ));
        let source = r#"
            globalThis.render = (data, facilities) => {
                const frame = facilities.mkFrame(300, 250);
                frame.write("<p>drawn</p>");
                return "done";
            };
        "#;
        let run = super::run(
            "ad-1",
            source,
            &json!({"adId": "ad-1"}),
            messenger,
            &creative,
            &page,
            &SandboxConfig::default(),
        )
        .await;

        assert!(run.outcome.is_success());
        let drawn = creative
            .document()
            .ad_frames()
            .iter()
            .any(|frame| frame.content == "<p>drawn</p>" && frame.width == 300);
        assert!(drawn);

        let events: Vec<EventMessage> = seen
            .borrow()
            .iter()
            .filter_map(|data| serde_json::from_str(data).ok())
            .filter(|event: &EventMessage| event.message == "Prebid Event")
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "adRenderSucceeded");
        assert_eq!(events[0].ad_id, "ad-1");
    }

    #[tokio::test]
    async fn test_run_round_trips_messages_through_facilities() {
        let (page, top, creative, seen) = creative_page();
        // Orchestrator: answer asset requests for ad-2.
        let reply_top = top.clone();
        top.add_listener(move |event| {
            if event.data.contains("assetRequest") {
                if let Some(source) = event.source.upgrade() {
                    source.post_message(
                        &json!({
                            "message": "assetResponse",
                            "adId": "ad-2",
                            "assets": [{"key": "title", "value": "From orchestrator"}]
                        })
                        .to_string(),
                        "*",
                        &reply_top,
                    );
                }
            }
        });

        let messenger = Rc::new(Messenger::new(
            Some("https://publisher.example/page"),
            &creative,
        ));
        let source = r#"
            globalThis.render = (data, facilities) => {
                return new Promise((resolve) => {
                    facilities.sendMessage(
                        { message: "Prebid Native", action: "assetRequest" },
                        (reply) => {
                            const frame = facilities.mkFrame(1, 1);
                            frame.write("<p>" + reply.assets[0].value + "</p>");
                            resolve();
                        }
                    );
                });
            };
        "#;
        let run = super::run(
            "ad-2",
            source,
            &json!({"adId": "ad-2"}),
            messenger,
            &creative,
            &page,
            &SandboxConfig::default(),
        )
        .await;

        assert!(run.outcome.is_success(), "outcome: {:?}", run.outcome);
        let drawn = creative
            .document()
            .ad_frames()
            .iter()
            .any(|frame| frame.content == "<p>From orchestrator</p>");
        assert!(drawn);

        // The outbound request was adId-tagged by the host.
        assert!(seen
            .borrow()
            .iter()
            .any(|data| data.contains("assetRequest") && data.contains("\"adId\":\"ad-2\"")));
    }

    #[tokio::test]
    async fn test_missing_render_function_fails() {
        let (page, _top, creative, seen) = creative_page();
        let messenger = Rc::new(Messenger::new(
            Some("https://publisher.example/page"),
            &creative,
        ));
        let run = super::run(
            "ad-3",
            "var unrelated = 1;",
            &json!({"adId": "ad-3"}),
            messenger,
            &creative,
            &page,
            &SandboxConfig::default(),
        )
        .await;

        assert!(!run.outcome.is_success());
        let failed: Vec<EventMessage> = seen
            .borrow()
            .iter()
            .filter_map(|data| serde_json::from_str(data).ok())
            .filter(|event: &EventMessage| event.event == "adRenderFailed")
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].info.as_ref().unwrap().reason, "exception");
    }

    #[tokio::test]
    async fn test_response_callback_exception_becomes_failure_report() {
        let (page, top, creative, seen) = creative_page();
        let reply_top = top.clone();
        top.add_listener(move |event| {
            if event.data.contains("assetRequest") {
                if let Some(source) = event.source.upgrade() {
                    source.post_message(
                        &json!({"message": "assetResponse", "adId": "ad-4"}).to_string(),
                        "*",
                        &reply_top,
                    );
                }
            }
        });

        let messenger = Rc::new(Messenger::new(
            Some("https://publisher.example/page"),
            &creative,
        ));
        let source = r#"
            globalThis.render = (data, facilities) => {
                return new Promise((resolve) => {
                    facilities.sendMessage(
                        { message: "Prebid Native", action: "assetRequest" },
                        () => { throw new Error("callback exploded"); }
                    );
                });
            };
        "#;
        let run = super::run(
            "ad-4",
            source,
            &json!({"adId": "ad-4"}),
            messenger,
            &creative,
            &page,
            &SandboxConfig::default(),
        )
        .await;

        assert!(!run.outcome.is_success());
        let failed: Vec<EventMessage> = seen
            .borrow()
            .iter()
            .filter_map(|data| serde_json::from_str(data).ok())
            .filter(|event: &EventMessage| event.event == "adRenderFailed")
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0]
            .info
            .as_ref()
            .unwrap()
            .message
            .contains("callback exploded"));
    }
}
