//! Static file service backing the file-serving strategy.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::chain::{Handler, handler};
use crate::router::normalize_path;

/// Serves files from a base directory.
///
/// Request paths are mapped onto the directory using only their normal
/// components, so `..`, absolute segments and drive prefixes never resolve.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index_file: String,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>, index_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index_file: index_file.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_file(&self) -> &str {
        &self.index_file
    }

    /// Strips a trailing index file name from `path`.
    ///
    /// Returns the rewritten path (`/index.html` → `/`, `/docs/index.html` →
    /// `/docs`) or `None` if `path` does not name the index file.
    pub fn rewrite_index(&self, path: &str) -> Option<String> {
        let trimmed = path.trim_matches('/');
        let (parent, last) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        (last == self.index_file).then(|| normalize_path(parent))
    }

    /// Maps a request path to an existing regular file under the root.
    ///
    /// Directories (including the root itself) resolve to their index file.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut full = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(segment) => full.push(segment),
                Component::CurDir => {}
                _ => {
                    debug!(path, "rejected non-normal path component");
                    return None;
                }
            }
        }
        if full.is_dir() {
            full.push(&self.index_file);
        }
        full.is_file().then_some(full)
    }

    /// A handler that writes `file` with a content type picked from its extension.
    pub fn handler(&self, file: PathBuf) -> Handler {
        handler(move |ctx| {
            let mime = content_type(&file);
            if skips_compression(mime) {
                ctx.writer_mut().disable_compression();
            }
            ctx.set_header("Content-Type", mime);
            let body = fs::read(&file).inspect_err(|e| {
                warn!(file = %file.display(), error = %e, "static file read failed");
            })?;
            ctx.write(&body)?;
            Ok(())
        })
    }
}

/// Content type for a file, by extension.
pub fn content_type(file: &Path) -> &'static str {
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js" | "mjs") => "text/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

// Already-compressed formats gain nothing from another pass.
fn skips_compression(mime: &str) -> bool {
    const SKIP: [&str; 8] = [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "video/",
        "audio/",
        "font/woff",
        "application/zip",
    ];
    mime == "application/gzip" || SKIP.iter().any(|s| mime.starts_with(s))
}
