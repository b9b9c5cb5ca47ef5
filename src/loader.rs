//! Renderer source loader: restricts where executable code may come from.
//!
//! Renderer URLs arrive over the channel from the orchestrator, which
//! makes them attacker-influenced input. Before any byte of renderer
//! source reaches the sandbox the URL must survive three checks: an
//! allowed scheme (`https`, or `file` confined to a configured local
//! directory), a `.js`/`.mjs` extension, and for remote URLs an origin
//! allowlist. An empty allowlist loads nothing remote.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use url::Url;

pub struct RendererLoader {
    allowed_origins: Vec<String>,
    local_dir: Option<PathBuf>,
}

impl RendererLoader {
    /// Loader that accepts https renderers from `allowed_origins` only.
    pub fn new(allowed_origins: Vec<String>) -> RendererLoader {
        RendererLoader {
            allowed_origins,
            local_dir: None,
        }
    }

    /// Additionally allow `file://` renderers under `dir`. The directory
    /// is canonicalized up front so symlinked escapes fail the prefix
    /// check later.
    pub fn with_local_dir(mut self, dir: impl AsRef<Path>) -> Result<RendererLoader> {
        let canonical = dir
            .as_ref()
            .canonicalize()
            .map_err(|e| anyhow!("Failed to canonicalize renderer dir: {}", e))?;
        if !canonical.is_dir() {
            return Err(anyhow!("renderer dir must be a directory"));
        }
        self.local_dir = Some(canonical);
        Ok(self)
    }

    fn is_extension_allowed(path: &str) -> bool {
        path.ends_with(".js") || path.ends_with(".mjs")
    }

    /// Validate `renderer_url` without fetching anything.
    pub fn validate(&self, renderer_url: &str) -> Result<Url> {
        let url = Url::parse(renderer_url)
            .map_err(|e| anyhow!("Invalid renderer URL '{}': {}", renderer_url, e))?;

        match url.scheme() {
            "https" => {
                let origin = url.origin().ascii_serialization();
                if !self.allowed_origins.iter().any(|allowed| *allowed == origin) {
                    return Err(anyhow!(
                        "Renderer blocked: origin '{}' is not in the allowlist",
                        origin
                    ));
                }
            }
            "file" => {
                let dir = self
                    .local_dir
                    .as_ref()
                    .ok_or_else(|| anyhow!("Local renderers are not enabled"))?;
                let path = url
                    .to_file_path()
                    .map_err(|_| anyhow!("Invalid file URL: {}", renderer_url))?;
                let canonical = path
                    .canonicalize()
                    .map_err(|e| anyhow!("Unreadable renderer '{}': {}", path.display(), e))?;
                if !canonical.starts_with(dir) {
                    return Err(anyhow!(
                        "Access denied: '{}' is outside the renderer directory",
                        canonical.display()
                    ));
                }
            }
            other => {
                return Err(anyhow!("Renderer scheme '{}' is forbidden", other));
            }
        }

        if !Self::is_extension_allowed(url.path()) {
            return Err(anyhow!(
                "Only .js and .mjs renderers allowed, got: {}",
                url.path()
            ));
        }

        Ok(url)
    }

    /// Validate and fetch renderer source. Blocking variant for use
    /// inside message callbacks; must not run on an async runtime thread.
    pub fn load_blocking(&self, renderer_url: &str) -> Result<String> {
        let url = self.validate(renderer_url)?;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| anyhow!("Invalid file URL: {}", renderer_url))?;
                // Defense in depth: re-check after the validate round.
                if let Some(dir) = &self.local_dir {
                    let canonical = path
                        .canonicalize()
                        .map_err(|e| anyhow!("Unreadable renderer: {}", e))?;
                    if !canonical.starts_with(dir) {
                        return Err(anyhow!("Access denied: {}", canonical.display()));
                    }
                }
                std::fs::read_to_string(&path)
                    .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))
            }
            _ => {
                let response = reqwest::blocking::get(url.clone())
                    .map_err(|e| anyhow!("Renderer fetch failed: {}", e))?;
                if !response.status().is_success() {
                    return Err(anyhow!(
                        "Renderer fetch returned {} for '{}'",
                        response.status(),
                        url
                    ));
                }
                response
                    .text()
                    .map_err(|e| anyhow!("Failed to read renderer body: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader() -> RendererLoader {
        RendererLoader::new(vec!["https://renderers.example".to_string()])
    }

    #[test]
    fn test_rejects_forbidden_schemes() {
        for url in [
            "http://renderers.example/r.js",
            "data:text/javascript,render()",
            "ftp://renderers.example/r.js",
        ] {
            assert!(loader().validate(url).is_err(), "{url} should be rejected");
        }
    }

    #[test]
    fn test_rejects_origins_outside_allowlist() {
        let result = loader().validate("https://evil.example/r.js");
        assert!(result.unwrap_err().to_string().contains("allowlist"));

        let empty = RendererLoader::new(vec![]);
        assert!(empty.validate("https://renderers.example/r.js").is_err());
    }

    #[test]
    fn test_rejects_non_js_extensions() {
        let result = loader().validate("https://renderers.example/payload.wasm");
        assert!(result.unwrap_err().to_string().contains(".js and .mjs"));
        assert!(loader().validate("https://renderers.example/r.mjs").is_ok());
    }

    #[test]
    fn test_file_renderers_require_enabled_dir() {
        assert!(loader().validate("file:///tmp/r.js").is_err());
    }

    #[test]
    fn test_file_renderer_confined_to_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("r.js"), "globalThis.render = () => '';").unwrap();
        let loader = RendererLoader::new(vec![]).with_local_dir(dir.path()).unwrap();

        let inside = format!("file://{}/r.js", dir.path().display());
        assert!(loader.validate(&inside).is_ok());
        assert!(loader.load_blocking(&inside).unwrap().contains("render"));

        let outside = "file:///etc/passwd";
        assert!(loader.validate(outside).is_err());
    }
}
