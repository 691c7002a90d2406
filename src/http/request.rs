//! HTTP request-head parsing.

use std::collections::HashMap;

/// Maximum size of a request head this server accepts.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Why a request head failed to parse.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The head was not valid UTF-8.
    #[error("request head is not valid UTF-8")]
    NotUtf8,
    /// The request line was missing or malformed.
    #[error("malformed request line: {0}")]
    BadRequestLine(&'static str),
}

/// A parsed request line plus headers (header names lowercased).
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method, as sent (`GET`, `POST`, ...).
    pub method: String,
    /// Request target, including any query string.
    pub target: String,
    /// Protocol version string (`HTTP/1.0` or `HTTP/1.1`).
    pub version: String,
    headers: HashMap<String, String>,
}

/// Finds the end of the request head in `buf`.
///
/// Returns the index one past the `\r\n\r\n` terminator, or `None` if the
/// head is not complete yet.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

impl RequestHead {
    /// Parses a complete request head (through the blank line).
    pub fn parse(head: &[u8]) -> Result<Self, RequestError> {
        let text = std::str::from_utf8(head).map_err(|_| RequestError::NotUtf8)?;
        let mut lines = text.lines();

        let request_line = lines
            .next()
            .ok_or(RequestError::BadRequestLine("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or(RequestError::BadRequestLine("missing method"))?
            .to_owned();
        let target = parts
            .next()
            .ok_or(RequestError::BadRequestLine("missing target"))?
            .to_owned();
        let version = parts
            .next()
            .ok_or(RequestError::BadRequestLine("missing version"))?
            .to_owned();
        if !version.starts_with("HTTP/") {
            return Err(RequestError::BadRequestLine("bad version"));
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }

        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// Header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The target path with any query string stripped.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Value of the named cookie, if the request carries one.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Whether this request asks for a WebSocket upgrade.
    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_head_terminator() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn parses_request_line_and_headers() {
        let head = RequestHead::parse(
            b"GET /chat?room=1 HTTP/1.1\r\nHost: example.com\r\nUpgrade: WebSocket\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/chat?room=1");
        assert_eq!(head.path(), "/chat");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("HOST"), Some("example.com"));
        assert!(head.is_websocket_upgrade());
    }

    #[test]
    fn rejects_garbage() {
        assert!(RequestHead::parse(b"\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / FTP/1.0\r\n\r\n").is_err());
        assert!(RequestHead::parse(&[0xff, 0xfe, b'\r', b'\n']).is_err());
    }

    #[test]
    fn cookie_lookup() {
        let head =
            RequestHead::parse(b"GET / HTTP/1.1\r\nCookie: a=1; user=bob; b=2\r\n\r\n")
                .expect("parse");
        assert_eq!(head.cookie("user"), Some("bob"));
        assert_eq!(head.cookie("missing"), None);
    }
}
