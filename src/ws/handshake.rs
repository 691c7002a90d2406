//! WebSocket upgrade handshake (RFC 6455 section 4), server side.

use crate::http::request::RequestHead;
use base64::Engine;
use sha1::{Digest, Sha1};

/// RFC 6455 GUID used to derive `Sec-WebSocket-Accept`.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Why an upgrade request was refused.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// A required header was absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    /// A header or the request line had the wrong shape.
    #[error("bad upgrade request: {0}")]
    BadRequest(String),
    /// Only version 13 is supported.
    #[error("unsupported websocket version: {0}")]
    UnsupportedVersion(String),
    /// `Sec-WebSocket-Key` was not 16 base64-encoded bytes.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// Per RFC 6455 section 4.2.2: SHA-1 over the key concatenated with the
/// protocol GUID, base64-encoded.
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validates an upgrade request and returns the accept key to answer with.
pub fn accept(head: &RequestHead) -> Result<String, HandshakeError> {
    if head.method != "GET" {
        return Err(HandshakeError::BadRequest(format!(
            "method must be GET, got '{}'",
            head.method
        )));
    }

    let connection = head
        .header("connection")
        .ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return Err(HandshakeError::BadRequest(format!(
            "Connection header must contain 'Upgrade', got '{connection}'"
        )));
    }

    let version = head
        .header("sec-websocket-version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_owned()));
    }

    let client_key = head
        .header("sec-websocket-key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match base64::engine::general_purpose::STANDARD.decode(client_key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    Ok(compute_accept_key(client_key))
}

/// Builds the `101 Switching Protocols` response.
#[must_use]
pub fn switching_protocols(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Whether `origin` names the same authority the request was sent to.
///
/// Browsers send `Origin` as `scheme://host[:port]`; the comparison is
/// against the `Host` header value, ignoring the scheme.
#[must_use]
pub fn same_origin(origin: &str, host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    let authority = origin
        .split_once("://")
        .map_or(origin, |(_, authority)| authority);
    authority.eq_ignore_ascii_case(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The worked example from RFC 6455 section 1.3.
    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn upgrade_head(extra: &str) -> RequestHead {
        let raw = format!(
            "GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n{extra}\r\n"
        );
        RequestHead::parse(raw.as_bytes()).expect("parse")
    }

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(compute_accept_key(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn accepts_valid_upgrade() {
        assert_eq!(accept(&upgrade_head("")).expect("accept"), SAMPLE_ACCEPT);
    }

    #[test]
    fn rejects_wrong_version() {
        let head = RequestHead::parse(
            format!(
                "GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                 Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 8\r\n\r\n"
            )
            .as_bytes(),
        )
        .expect("parse");
        assert!(matches!(
            accept(&head),
            Err(HandshakeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rejects_bad_key() {
        let head = RequestHead::parse(
            b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: tooshort\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .expect("parse");
        assert!(matches!(accept(&head), Err(HandshakeError::InvalidKey)));
    }

    #[test]
    fn rejects_missing_connection_header() {
        let head = RequestHead::parse(
            format!(
                "GET /chat HTTP/1.1\r\nUpgrade: websocket\r\n\
                 Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
            )
            .as_bytes(),
        )
        .expect("parse");
        assert!(matches!(
            accept(&head),
            Err(HandshakeError::MissingHeader("Connection"))
        ));
    }

    #[test]
    fn origin_comparison() {
        assert!(same_origin("http://example.com:9090", Some("example.com:9090")));
        assert!(same_origin("https://Example.COM", Some("example.com")));
        assert!(!same_origin("http://evil.test", Some("example.com")));
        assert!(!same_origin("http://example.com", None));
    }
}
