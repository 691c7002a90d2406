//! Response assembly and the static-file responder.

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Builds a complete `Connection: close` response with the given body.
#[must_use]
pub fn with_body(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut head = String::with_capacity(128);
    let _ = write!(head, "HTTP/1.1 {status} {reason}\r\n");
    head.push_str("Server: shoreline\r\n");
    let _ = write!(head, "Content-Type: {content_type}\r\n");
    let _ = write!(head, "Content-Length: {}\r\n", body.len());
    head.push_str("Connection: close\r\n\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Builds a small HTML error page response.
#[must_use]
pub fn status_page(status: u16, reason: &str) -> Vec<u8> {
    let body = format!(
        "<html><head><title>{status} {reason}</title></head>\
         <body><h1>{status} {reason}</h1></body></html>"
    );
    with_body(status, reason, "text/html", body.as_bytes())
}

/// Serves `target` from under `root`, or an error page.
///
/// Directory targets fall back to `index.html`. Any path component that
/// escapes the root (`..`, absolute components) is refused with 404 rather
/// than 403 so probes learn nothing about the tree layout.
#[must_use]
pub fn serve_static(root: &Path, target: &str) -> Vec<u8> {
    let Some(relative) = sanitize(target) else {
        debug!(path = target, "refusing path that escapes the static root");
        return status_page(404, "Not Found");
    };

    let mut path = root.join(relative);
    if path.is_dir() {
        path.push("index.html");
    }

    match std::fs::read(&path) {
        Ok(body) => with_body(200, "OK", content_type(&path), &body),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "static file not served");
            status_page(404, "Not Found")
        }
    }
}

/// Normalizes a request target into a relative path, or refuses it.
fn sanitize(target: &str) -> Option<PathBuf> {
    let path = target.trim_start_matches('/');
    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpeg" | "jpg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shape() {
        let raw = with_body(200, "OK", "text/plain", b"hi");
        let text = String::from_utf8(raw).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn sanitize_refuses_escapes() {
        assert!(sanitize("/../etc/passwd").is_none());
        assert!(sanitize("/a/../../b").is_none());
        assert_eq!(sanitize("/a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize("/"), Some(PathBuf::new()));
    }

    #[test]
    fn serves_from_temp_root() {
        let root = std::env::temp_dir().join(format!("shoreline-static-{}", std::process::id()));
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("index.html"), b"<html>home</html>").expect("write");

        let ok = serve_static(&root, "/");
        let text = String::from_utf8(ok).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Type: text/html"));
        assert!(text.ends_with("<html>home</html>"));

        let missing = serve_static(&root, "/nope.css");
        assert!(String::from_utf8(missing)
            .expect("utf8")
            .starts_with("HTTP/1.1 404"));

        std::fs::remove_dir_all(&root).ok();
    }
}
