//! Creative Sandbox CLI
//!
//! Single-shot mode:
//!   creative-sandbox <template-file> <payload-json>
//!
//! Server mode (persistent process, reads from stdin):
//!   creative-sandbox --server <template-dir>
//!
//! Protocol (server mode):
//!   Request (stdin):
//!     native.html
//!     {"targetingMap":{"hb_adid":["abc"],"hb_cache_id":["uuid1"]}}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <div>...</div>
//!
//!   Error response:
//!     Status:Error
//!     Length:42
//!
//!     cached bid carried neither markup nor assets
//!
//! The payload either embeds a legacy `assets` object or names a cache
//! uuid; cached native bids are substituted into the template, cached
//! banner bids are emitted as-is.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use creative_sandbox::placeholder::apply_click_macro;
use creative_sandbox::resolver::substitute_markup;
use creative_sandbox::{assets, cache, CacheConfig, ScanMode, TargetingPayload};

fn print_usage() {
    eprintln!("Creative Sandbox - safeframe creative renderer");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  creative-sandbox <template-file> <payload-json>");
    eprintln!();
    eprintln!("Server mode (persistent process):");
    eprintln!("  creative-sandbox --server <template-dir>");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  creative-sandbox ./native.html '{{\"assets\":{{\"title\":\"Hello\"}}}}'");
    eprintln!("  creative-sandbox --server ./templates");
}

/// Resolve assets from the payload and substitute them into `template`.
async fn render_template(template: &str, payload: &Value) -> Result<String> {
    let targeting = TargetingPayload::from_value(payload);
    let click_url_prefix = targeting.get("clickUrlUnesc");

    let resolved = if let Some(raw) = payload.get("assets") {
        assets::from_legacy(raw)
    } else if let Some(uuid) = targeting.uuid() {
        let config = CacheConfig::from_targeting(&targeting);
        let bid = cache::fetch_cached_bid(&config, uuid).await?;
        match bid.native_payload() {
            Some(native) => assets::from_ortb(&native),
            None => {
                // Banner bid: the cached markup is the whole creative.
                let markup = bid
                    .adm
                    .ok_or_else(|| anyhow!("cached bid carried neither markup nor assets"))?;
                return Ok(apply_click_macro(&markup, click_url_prefix));
            }
        }
    } else {
        return Err(anyhow!(
            "payload needs either an inline assets object or a cache uuid"
        ));
    };

    Ok(substitute_markup(
        template,
        &resolved,
        ScanMode::Unscoped,
        click_url_prefix,
    ))
}

/// Run in single-shot mode.
async fn run_single_shot(template_path: &str, payload_json: &str) -> Result<()> {
    let payload: Value = serde_json::from_str(payload_json)
        .map_err(|e| anyhow!("Invalid payload JSON: {}", e))?;
    let template = std::fs::read_to_string(template_path)
        .map_err(|e| anyhow!("Failed to read template '{}': {}", template_path, e))?;

    let markup = render_template(&template, &payload).await?;
    println!("{}", markup);
    Ok(())
}

/// Resolve a requested template name inside the template dir, blocking
/// path traversal the same way the renderer loader does.
fn template_path(template_dir: &Path, requested: &str) -> Result<PathBuf> {
    let dir = template_dir
        .canonicalize()
        .map_err(|e| anyhow!("Invalid template dir: {}", e))?;
    let candidate = dir
        .join(requested)
        .canonicalize()
        .map_err(|e| anyhow!("Unknown template '{}': {}", requested, e))?;
    if !candidate.starts_with(&dir) {
        return Err(anyhow!(
            "Access denied: '{}' is outside the template directory",
            requested
        ));
    }
    Ok(candidate)
}

/// Run in server mode (persistent process, reads requests from stdin).
async fn run_server(template_dir: &str) -> Result<()> {
    let dir = Path::new(template_dir);
    if !dir.is_dir() {
        return Err(anyhow!("'{}' is not a directory", template_dir));
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    eprintln!("[creative-sandbox] Server ready, reading from stdin...");

    loop {
        let mut template_line = String::new();
        let mut payload_line = String::new();

        let bytes_read = reader.read_line(&mut template_line)?;
        if bytes_read == 0 {
            break;
        }
        reader.read_line(&mut payload_line)?;

        let requested = template_line.trim();
        let payload_str = payload_line.trim();

        let payload: Value = if payload_str.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(payload_str) {
                Ok(value) => value,
                Err(error) => {
                    write_response(&mut stdout, false, &format!("Invalid payload JSON: {error}"))?;
                    continue;
                }
            }
        };

        let outcome = match template_path(dir, requested) {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(template) => render_template(&template, &payload).await,
                Err(error) => Err(anyhow!("Failed to read '{}': {}", path.display(), error)),
            },
            Err(error) => Err(error),
        };

        match outcome {
            Ok(markup) => write_response(&mut stdout, true, &markup)?,
            Err(error) => write_response(&mut stdout, false, &error.to_string())?,
        }
    }

    eprintln!("[creative-sandbox] Server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol.
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };
    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?;
    write!(stdout, "{}", body)?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Err(anyhow!("Missing required arguments"));
    }

    if args[1] == "--server" {
        if args.len() < 3 {
            print_usage();
            return Err(anyhow!("Server mode requires template-dir argument"));
        }
        return run_server(&args[2]).await;
    }

    if args.len() < 3 {
        print_usage();
        return Err(anyhow!("Missing required arguments"));
    }

    run_single_shot(&args[1], &args[2]).await
}
