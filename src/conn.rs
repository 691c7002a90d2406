//! The per-peer connection adapter driven by the event loop.
//!
//! A [`Connection`] owns one accepted socket and its buffers. The loop calls
//! [`on_readable`](Connection::on_readable) and
//! [`on_writable`](Connection::on_writable) when epoll reports readiness and
//! owns destruction; the connection itself only marks state (`closing`,
//! `closed`, desired write interest) that the loop acts on after delivery.
//!
//! Protocol-wise a connection starts in HTTP mode, reads one request head,
//! and either answers it (static file or error page, then close) or upgrades
//! to WebSocket mode and stays put, feeding complete messages to the
//! endpoint's handler.

use crate::http::request::{self, RequestHead, MAX_HEAD_BYTES};
use crate::http::response;
use crate::server::registry::HandlerRegistry;
use crate::sso::{Credentials, SsoOptions};
use crate::ws::frame::{self, Frame, Opcode};
use crate::ws::{handshake, Message, WebSocketHandler, WsError};
use bytes::{Buf, BytesMut};
use socket2::Socket;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Loop-owned context handed to a connection while delivering readiness.
pub(crate) struct ConnCtx<'a> {
    pub registry: &'a HandlerRegistry,
    pub sso: Option<&'a SsoOptions>,
    pub static_root: &'a Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proto {
    Http,
    WebSocket,
}

/// One accepted client connection.
pub struct Connection {
    socket: Socket,
    id: u64,
    peer: SocketAddr,
    proto: Proto,
    handler: Option<Arc<dyn WebSocketHandler>>,
    fragment: Option<(Opcode, BytesMut)>,
    input: BytesMut,
    output: BytesMut,
    bytes_received: u64,
    bytes_sent: u64,
    uri: Option<String>,
    credentials: Option<Credentials>,
    write_subscribed: bool,
    closing: bool,
    close_sent: bool,
    close_notified: bool,
    closed: bool,
}

impl Connection {
    pub(crate) fn new(socket: Socket, id: u64, peer: SocketAddr) -> Self {
        Self {
            socket,
            id,
            peer,
            proto: Proto::Http,
            handler: None,
            fragment: None,
            input: BytesMut::new(),
            output: BytesMut::new(),
            bytes_received: 0,
            bytes_sent: 0,
            uri: None,
            credentials: None,
            write_subscribed: false,
            closing: false,
            close_sent: false,
            close_notified: false,
            closed: false,
        }
    }

    /// The OS descriptor this connection is registered under.
    #[must_use]
    pub fn fd(&self) -> i32 {
        self.socket.as_raw_fd()
    }

    /// Stable identifier for the lifetime of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address as accepted.
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.peer
    }

    /// Request target once a request head has been parsed.
    #[must_use]
    pub fn request_uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Credentials extracted from the request, if SSO is enabled.
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Total bytes read from the peer.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Total bytes written to the peer.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes buffered but not yet parsed.
    #[must_use]
    pub fn input_buffer_size(&self) -> usize {
        self.input.len()
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn output_buffer_size(&self) -> usize {
        self.output.len()
    }

    /// Queues a text message to the peer. Only meaningful after an upgrade.
    pub fn send_text(&mut self, text: &str) {
        self.queue_frame(&Frame::text(text.as_bytes().to_vec()));
    }

    /// Queues a binary message to the peer. Only meaningful after an upgrade.
    pub fn send_binary(&mut self, data: &[u8]) {
        self.queue_frame(&Frame::binary(data.to_vec()));
    }

    /// Starts a close handshake: queues a close frame and closes once the
    /// output buffer drains.
    pub fn close_websocket(&mut self) {
        if self.proto != Proto::WebSocket {
            warn!(peer = %self.peer, "close_websocket on a non-websocket connection ignored");
            return;
        }
        if !self.close_sent {
            self.close_sent = true;
            Frame::close(1000, "").write_to(&mut self.output);
        }
        self.closing = true;
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    /// True once the connection should be destroyed at the end of the batch.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the connection currently has output waiting on the socket.
    pub(crate) fn wants_writable(&self) -> bool {
        !self.output.is_empty() && !self.closed
    }

    pub(crate) fn write_subscribed(&self) -> bool {
        self.write_subscribed
    }

    pub(crate) fn set_write_subscribed(&mut self, subscribed: bool) {
        self.write_subscribed = subscribed;
    }

    /// Delivers the readable edge: consume available bytes, run the protocol
    /// state machine, and flush whatever output that produced.
    pub(crate) fn on_readable(&mut self, ctx: &ConnCtx<'_>) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match (&self.socket).read(&mut buf) {
                Ok(0) => {
                    // Peer shut down its write side; nothing we produce now
                    // can matter to it.
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.bytes_received += n as u64;
                    self.input.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if self.proto == Proto::Http {
            self.advance_http(ctx)?;
        }
        if self.proto == Proto::WebSocket {
            self.advance_websocket()?;
        }
        self.flush()
    }

    /// Delivers the writable edge: flush queued output.
    pub(crate) fn on_writable(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Runs the `on_close` callback if an upgraded handler has not seen one
    /// yet. Called by the loop right before destruction, and by the close
    /// handshake.
    pub(crate) fn notify_close(&mut self) {
        if self.close_notified {
            return;
        }
        self.close_notified = true;
        if let Some(handler) = self.handler.clone() {
            handler.on_close(self);
        }
    }

    fn advance_http(&mut self, ctx: &ConnCtx<'_>) -> io::Result<()> {
        if self.closing {
            return Ok(());
        }
        let Some(end) = request::find_head_end(&self.input) else {
            if self.input.len() > MAX_HEAD_BYTES {
                self.queue_bytes(&response::status_page(431, "Request Header Fields Too Large"));
                self.closing = true;
            }
            return Ok(());
        };
        let head_bytes = self.input.split_to(end);
        let head = match RequestHead::parse(&head_bytes) {
            Ok(head) => head,
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "unparseable request");
                self.queue_bytes(&response::status_page(400, "Bad Request"));
                self.closing = true;
                return Ok(());
            }
        };

        self.uri = Some(head.target.clone());
        if let Some(opts) = ctx.sso {
            self.credentials = opts.extract(&head);
        }

        if head.is_websocket_upgrade() {
            self.upgrade(ctx, &head);
        } else {
            self.respond_http(ctx, &head);
        }
        Ok(())
    }

    fn respond_http(&mut self, ctx: &ConnCtx<'_>, head: &RequestHead) {
        debug!(peer = %self.peer, method = %head.method, target = %head.target, "serving request");
        let raw = if head.method == "GET" {
            response::serve_static(ctx.static_root, head.path())
        } else {
            response::status_page(405, "Method Not Allowed")
        };
        self.queue_bytes(&raw);
        self.closing = true;
    }

    fn upgrade(&mut self, ctx: &ConnCtx<'_>, head: &RequestHead) {
        let endpoint = head.path().to_owned();
        let Some(handler) = ctx.registry.handler(&endpoint) else {
            debug!(peer = %self.peer, %endpoint, "websocket upgrade for unknown endpoint");
            self.queue_bytes(&response::status_page(404, "Not Found"));
            self.closing = true;
            return;
        };

        if let Some(origin) = head.header("origin") {
            if !handshake::same_origin(origin, head.header("host"))
                && !ctx.registry.is_cross_origin_allowed(&endpoint)
            {
                warn!(peer = %self.peer, origin, %endpoint, "rejecting cross-origin upgrade");
                self.queue_bytes(&response::status_page(403, "Forbidden"));
                self.closing = true;
                return;
            }
        }

        match handshake::accept(head) {
            Ok(accept_key) => {
                debug!(peer = %self.peer, %endpoint, "upgrading to websocket");
                self.queue_bytes(&handshake::switching_protocols(&accept_key));
                self.proto = Proto::WebSocket;
                self.handler = Some(handler.clone());
                handler.on_open(self);
            }
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "refusing websocket upgrade");
                self.queue_bytes(&response::status_page(400, "Bad Request"));
                self.closing = true;
            }
        }
    }

    fn advance_websocket(&mut self) -> io::Result<()> {
        while !self.closing {
            let frame = match frame::decode(&mut self.input) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => return Err(ws_protocol_error(err)),
            };
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> io::Result<()> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.fragment.is_some() {
                    return Err(ws_protocol_error(WsError::InterleavedDataFrame));
                }
                if frame.fin {
                    let message = build_message(frame.opcode, frame.payload.to_vec())?;
                    self.deliver(message);
                } else {
                    self.fragment = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut assembled)) = self.fragment.take() else {
                    return Err(ws_protocol_error(WsError::UnexpectedContinuation));
                };
                if assembled.len() + frame.payload.len() > frame::MAX_PAYLOAD_BYTES {
                    return Err(ws_protocol_error(WsError::PayloadTooLarge {
                        size: (assembled.len() + frame.payload.len()) as u64,
                        max: frame::MAX_PAYLOAD_BYTES,
                    }));
                }
                assembled.extend_from_slice(&frame.payload);
                if frame.fin {
                    let message = build_message(opcode, assembled.to_vec())?;
                    self.deliver(message);
                } else {
                    self.fragment = Some((opcode, assembled));
                }
            }
            Opcode::Ping => self.queue_frame(&Frame::pong(frame.payload)),
            Opcode::Pong => {}
            Opcode::Close => {
                debug!(peer = %self.peer, "websocket close handshake");
                if !self.close_sent {
                    self.close_sent = true;
                    Frame::close_echo(frame.payload).write_to(&mut self.output);
                }
                self.closing = true;
                self.notify_close();
            }
        }
        Ok(())
    }

    fn deliver(&mut self, message: Message) {
        if let Some(handler) = self.handler.clone() {
            handler.on_message(self, message);
        }
    }

    fn queue_frame(&mut self, frame: &Frame) {
        if self.proto != Proto::WebSocket {
            warn!(peer = %self.peer, "websocket send on a non-websocket connection ignored");
            return;
        }
        if self.close_sent {
            return;
        }
        frame.write_to(&mut self.output);
    }

    fn queue_bytes(&mut self, raw: &[u8]) {
        self.output.extend_from_slice(raw);
    }

    /// Writes as much queued output as the socket accepts without blocking.
    fn flush(&mut self) -> io::Result<()> {
        while !self.output.is_empty() {
            match (&self.socket).write(&self.output) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.bytes_sent += n as u64;
                    self.output.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if self.closing && self.output.is_empty() {
            self.closed = true;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("proto", &self.proto)
            .field("read", &self.bytes_received)
            .field("written", &self.bytes_sent)
            .finish_non_exhaustive()
    }
}

fn build_message(opcode: Opcode, payload: Vec<u8>) -> io::Result<Message> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| ws_protocol_error(WsError::InvalidUtf8)),
        _ => Ok(Message::Binary(payload.into())),
    }
}

fn ws_protocol_error(err: WsError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::compute_accept_key;
    use bytes::BufMut;
    use socket2::{Domain, Socket, Type};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Echo;

    impl WebSocketHandler for Echo {
        fn on_message(&self, conn: &mut Connection, message: Message) {
            if let Message::Text(text) = message {
                conn.send_text(&text);
            }
        }
    }

    struct Recorder(Mutex<Vec<String>>);

    impl WebSocketHandler for Recorder {
        fn on_open(&self, _conn: &mut Connection) {
            self.0.lock().expect("lock").push("open".into());
        }
        fn on_message(&self, _conn: &mut Connection, message: Message) {
            if let Message::Text(text) = message {
                self.0.lock().expect("lock").push(text);
            }
        }
        fn on_close(&self, _conn: &mut Connection) {
            self.0.lock().expect("lock").push("close".into());
        }
    }

    fn pair() -> (Connection, Socket) {
        let (ours, theirs) = Socket::pair(Domain::UNIX, Type::STREAM, None).expect("socketpair");
        ours.set_nonblocking(true).expect("nonblocking");
        theirs
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        let peer = "127.0.0.1:4242".parse().expect("addr");
        (Connection::new(ours, 2, peer), theirs)
    }

    fn registry_with(endpoint: &str, handler: Arc<dyn WebSocketHandler>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.add(endpoint, handler, false);
        registry
    }

    fn read_some(peer: &Socket) -> Vec<u8> {
        let mut buf = vec![0u8; 16 * 1024];
        let n = (&*peer).read(&mut buf).expect("read");
        buf.truncate(n);
        buf
    }

    fn masked(frame_bytes: &[u8]) -> Vec<u8> {
        // Test client masks with a fixed key.
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut out = Vec::new();
        out.push(frame_bytes[0]);
        out.push(frame_bytes[1] | 0x80);
        out.extend_from_slice(&key);
        for (i, b) in frame_bytes[2..].iter().enumerate() {
            out.push(b ^ key[i % 4]);
        }
        out
    }

    #[test]
    fn serves_http_request_and_closes() {
        let (mut conn, peer) = pair();
        let registry = HandlerRegistry::new();
        let root = std::env::temp_dir();
        let ctx = ConnCtx {
            registry: &registry,
            sso: None,
            static_root: &root,
        };

        (&peer)
            .write_all(b"GET /definitely-missing HTTP/1.0\r\n\r\n")
            .expect("send");
        conn.on_readable(&ctx).expect("readable");

        let reply = read_some(&peer);
        assert!(reply.starts_with(b"HTTP/1.1 404"));
        assert!(conn.is_closed());
        assert_eq!(conn.request_uri(), Some("/definitely-missing"));
        assert!(conn.bytes_received() > 0);
        assert!(conn.bytes_sent() > 0);
    }

    #[test]
    fn websocket_echo_round_trip() {
        let (mut conn, peer) = pair();
        let registry = registry_with("/echo", Arc::new(Echo));
        let root = std::env::temp_dir();
        let ctx = ConnCtx {
            registry: &registry,
            sso: None,
            static_root: &root,
        };

        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let request = format!(
            "GET /echo HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        (&peer).write_all(request.as_bytes()).expect("send");
        conn.on_readable(&ctx).expect("readable");

        let reply = String::from_utf8(read_some(&peer)).expect("utf8");
        assert!(reply.starts_with("HTTP/1.1 101"));
        assert!(reply.contains(&compute_accept_key(key)));

        // Masked "hi" text frame in, unmasked echo out.
        let mut frame = vec![0x81u8, 0x02];
        frame.extend_from_slice(b"hi");
        (&peer).write_all(&masked(&frame)).expect("send frame");
        conn.on_readable(&ctx).expect("readable");

        assert_eq!(read_some(&peer), vec![0x81, 0x02, b'h', b'i']);
        assert!(!conn.is_closed());
    }

    #[test]
    fn close_handshake_notifies_once() {
        let (mut conn, peer) = pair();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let registry = registry_with("/log", recorder.clone());
        let root = std::env::temp_dir();
        let ctx = ConnCtx {
            registry: &registry,
            sso: None,
            static_root: &root,
        };

        let request = "GET /log HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\n\
                       Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        (&peer).write_all(request.as_bytes()).expect("send");
        conn.on_readable(&ctx).expect("readable");
        let _ = read_some(&peer);

        let close = masked(&[0x88u8, 0x00]);
        (&peer).write_all(&close).expect("send close");
        conn.on_readable(&ctx).expect("readable");
        assert!(conn.is_closed());

        // The loop calls notify_close again at destruction; it must not
        // re-enter the handler.
        conn.notify_close();
        assert_eq!(
            *recorder.0.lock().expect("lock"),
            vec!["open".to_owned(), "close".to_owned()]
        );

        // Close reply went out.
        let reply = read_some(&peer);
        assert_eq!(reply[0], 0x88);
    }

    #[test]
    fn fragmented_message_is_reassembled() {
        let (mut conn, peer) = pair();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let registry = registry_with("/log", recorder.clone());
        let root = std::env::temp_dir();
        let ctx = ConnCtx {
            registry: &registry,
            sso: None,
            static_root: &root,
        };

        let request = "GET /log HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\n\
                       Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        (&peer).write_all(request.as_bytes()).expect("send");
        conn.on_readable(&ctx).expect("readable");
        let _ = read_some(&peer);

        // "he" + "llo" as text + continuation.
        let mut part1 = vec![0x01u8, 0x02];
        part1.extend_from_slice(b"he");
        let mut part2 = vec![0x80u8, 0x03];
        part2.extend_from_slice(b"llo");
        (&peer).write_all(&masked(&part1)).expect("send");
        (&peer).write_all(&masked(&part2)).expect("send");
        conn.on_readable(&ctx).expect("readable");

        assert_eq!(
            *recorder.0.lock().expect("lock"),
            vec!["open".to_owned(), "hello".to_owned()]
        );
    }

    #[test]
    fn protocol_violation_is_an_error() {
        let (mut conn, peer) = pair();
        let registry = registry_with("/echo", Arc::new(Echo));
        let root = std::env::temp_dir();
        let ctx = ConnCtx {
            registry: &registry,
            sso: None,
            static_root: &root,
        };

        let request = "GET /echo HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\n\
                       Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        (&peer).write_all(request.as_bytes()).expect("send");
        conn.on_readable(&ctx).expect("readable");
        let _ = read_some(&peer);

        // Continuation with nothing in progress.
        let stray = masked(&[0x80u8, 0x01, b'x']);
        (&peer).write_all(&stray).expect("send");
        let err = conn.on_readable(&ctx).expect_err("protocol violation");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_head_is_refused() {
        let (mut conn, peer) = pair();
        let registry = HandlerRegistry::new();
        let root = std::env::temp_dir();
        let ctx = ConnCtx {
            registry: &registry,
            sso: None,
            static_root: &root,
        };

        let mut junk = BytesMut::new();
        junk.put_slice(b"GET / HTTP/1.1\r\nX-Filler: ");
        junk.put_bytes(b'a', MAX_HEAD_BYTES + 1);
        (&peer).write_all(&junk).expect("send");
        conn.on_readable(&ctx).expect("readable");

        let reply = read_some(&peer);
        assert!(reply.starts_with(b"HTTP/1.1 431"));
    }
}
