//! The server event loop and connection lifecycle manager.
//!
//! One [`Server`] owns one listening port. [`Server::serve`] takes over the
//! calling thread, which becomes the I/O thread: it accepts connections,
//! routes level-triggered readiness to them, drains the cross-thread task
//! queue, reaps lame connections, and tears everything down exactly once on
//! shutdown.
//!
//! # Event Routing
//!
//! Every descriptor in the readiness set carries a [`Token`]:
//!
//! | Token | Descriptor | On readable |
//! |-------|------------|-------------|
//! | [`Token::LISTENER`] | listening socket | accept one connection |
//! | [`Token::WAKEUP`] | wakeup pipe read end | drain the pipe |
//! | connection id | accepted socket | deliver write-then-read to the connection |
//!
//! Any other bit pattern on the listener or wakeup descriptors is fatal;
//! on a connection it dooms only that connection.
//!
//! # Cross-Thread Surface
//!
//! [`ServerHandle`] is the only thing other threads touch:
//! [`ServerHandle::schedule`] injects a task (run before the next readiness
//! wait, FIFO per submitting thread) and [`ServerHandle::terminate`] asks the
//! loop to exit at its next wait boundary. Both poke the wakeup pipe so a
//! parked loop reacts promptly.

pub(crate) mod guard;
pub(crate) mod registry;
mod stats;
pub(crate) mod table;
mod task_queue;
mod wakeup;

pub use task_queue::Task;

use crate::conn::{ConnCtx, Connection};
use crate::error::ServerError;
use crate::poll::{Event, Events, Interest, ReadinessSet, Token};
use crate::sso::SsoOptions;
use crate::ws::WebSocketHandler;
use guard::ThreadGuard;
use parking_lot::Mutex;
use registry::HandlerRegistry;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant, SystemTime};
use table::ConnTable;
use task_queue::{Queued, TaskQueue};
use tracing::{debug, error, info, warn};
use wakeup::{wake_pipe, WakePipe, WakeSender};

/// Readiness wait timeout. Twice a second is ample for the reaper and the
/// terminate flag.
const POLL_TIMEOUT_MS: u16 = 500;
/// Batch cap per readiness wait.
const MAX_EVENTS: usize = 256;
const LISTEN_BACKLOG: i32 = 5;
/// Linger applied to accepted sockets.
const ACCEPT_LINGER: Duration = Duration::from_secs(5);
/// Minimum spacing between lame-connection reaper passes.
const REAPER_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum spacing between saturation warnings.
const SATURATION_WARN_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LAME_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a stats snapshot waits for the loop to pick up its task.
const STATS_WAIT: Duration = Duration::from_secs(5);

/// State shared between the I/O thread and every [`ServerHandle`].
///
/// The task queue and the terminate flag are the only cross-thread mutable
/// state in the whole server; everything else lives inside [`EventLoop`] and
/// never leaves the I/O thread.
struct Shared {
    tasks: TaskQueue,
    wake: Mutex<Option<WakeSender>>,
    terminate: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            tasks: TaskQueue::new(),
            wake: Mutex::new(None),
            terminate: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    fn schedule(&self, task: Queued) {
        self.tasks.push(task);
        if let Some(sender) = &*self.wake.lock() {
            sender.poke();
        }
    }

    fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        if let Some(sender) = &*self.wake.lock() {
            sender.poke();
        }
    }

    fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }
}

/// An embeddable HTTP/1.1 + WebSocket server bound to one port.
///
/// Configure it (handlers, SSO, timeouts), grab a [`ServerHandle`] for other
/// threads, then call [`serve`](Server::serve) — which blocks until
/// [`terminate`](ServerHandle::terminate).
pub struct Server {
    registry: HandlerRegistry,
    sso: Option<SsoOptions>,
    lame_timeout: Duration,
    shared: Arc<Shared>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a server with no handlers and default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            sso: None,
            lame_timeout: DEFAULT_LAME_TIMEOUT,
            shared: Arc::new(Shared::new()),
        }
    }

    /// Registers a WebSocket handler for an endpoint path.
    ///
    /// Must happen before [`serve`](Server::serve); the registry is owned by
    /// the loop once it starts.
    pub fn add_websocket_handler(
        &mut self,
        endpoint: impl Into<String>,
        handler: Arc<dyn WebSocketHandler>,
        allow_cross_origin: bool,
    ) {
        self.registry.add(endpoint, handler, allow_cross_origin);
    }

    /// Enables single-sign-on credential extraction.
    pub fn enable_single_sign_on(&mut self, options: SsoOptions) {
        self.sso = Some(options);
    }

    /// Sets how long an accepted connection may go without sending a single
    /// byte before the reaper kills it. Default 10 s.
    pub fn set_lame_connection_timeout(&mut self, timeout: Duration) {
        info!(seconds = timeout.as_secs(), "setting lame connection timeout");
        self.lame_timeout = timeout;
    }

    /// A cloneable handle for use from other threads.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Injects a task to run on the I/O thread. Callable from any thread.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.schedule(Queued::User(Box::new(task)));
    }

    /// Asks the loop to exit. Callable from any thread; idempotent.
    pub fn terminate(&self) {
        self.shared.request_terminate();
    }

    /// Runs the server, serving static files from `static_root` and
    /// listening on `0.0.0.0:port` (`port` 0 picks an ephemeral port,
    /// published through [`ServerHandle::local_addr`]).
    ///
    /// Blocks the calling thread, which becomes the I/O thread, until
    /// terminated. Setup failures are logged and returned; once the loop is
    /// running, nothing propagates out and shutdown is the only way back.
    pub fn serve(&mut self, static_root: impl AsRef<Path>, port: u16) -> Result<(), ServerError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            error!("serve called while the server is already running");
            return Err(ServerError::AlreadyRunning);
        }
        let result = self.serve_inner(static_root.as_ref(), port);
        self.shared.running.store(false, Ordering::Release);
        result
    }

    fn serve_inner(&mut self, static_root: &Path, port: u16) -> Result<(), ServerError> {
        // The calling thread is the I/O thread from here on.
        let guard = ThreadGuard::new();
        let listener = bind_listener(port).map_err(|err| {
            error!(error = %err, "unable to start server");
            err
        })?;
        let poll = ReadinessSet::new(MAX_EVENTS).map_err(|err| {
            error!(error = %err, "unable to create readiness set");
            ServerError::Readiness(err)
        })?;
        let (wake, wake_sender) = wake_pipe().map_err(|err| {
            error!(error = %err, "unable to create wakeup pipe");
            ServerError::Wakeup(err)
        })?;
        poll.register(&listener, Token::LISTENER, Interest::READABLE)
            .map_err(|err| {
                error!(error = %err, "unable to register listener");
                ServerError::Readiness(err)
            })?;
        poll.register(wake.fd(), Token::WAKEUP, Interest::READABLE)
            .map_err(|err| {
                error!(error = %err, "unable to register wakeup pipe");
                ServerError::Readiness(err)
            })?;

        let local_addr = listener.local_addr().ok().and_then(|a| a.as_socket());
        *self.shared.wake.lock() = Some(wake_sender);
        *self.shared.local_addr.lock() = local_addr;
        if let Some(addr) = local_addr {
            info!("listening on http://{addr}");
        }

        let mut event_loop = EventLoop {
            table: ConnTable::new(),
            listener,
            wake,
            poll,
            registry: self.registry.clone().bound_to(guard),
            sso: self.sso.clone(),
            static_root: static_root.to_path_buf(),
            lame_timeout: self.lame_timeout,
            next_reap: Instant::now(),
            last_saturation_warn: None,
            doomed: Vec::new(),
            shared: self.shared.clone(),
            guard,
        };
        event_loop.run();
        event_loop.close_all();

        *self.shared.wake.lock() = None;
        *self.shared.local_addr.lock() = None;
        Ok(())
    }
}

/// Cross-thread handle to a running (or about-to-run) server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Injects a task to run on the I/O thread before its next readiness
    /// wait. Tasks from one thread run in submission order. A task scheduled
    /// before `serve` starts is not lost; the loop drains the queue before
    /// its first wait.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.schedule(Queued::User(Box::new(task)));
    }

    /// Asks the loop to exit at its next wait boundary. Idempotent.
    pub fn terminate(&self) {
        self.shared.request_terminate();
    }

    /// The bound listen address while the server is running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Renders the stats document, serialised with the loop.
    ///
    /// The snapshot runs as a task on the I/O thread; `None` means the loop
    /// did not pick it up in time (it is not running, or it is wedged).
    #[must_use]
    pub fn stats_document(&self) -> Option<String> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.shared.schedule(Queued::Control(Box::new(
            move |event_loop: &mut EventLoop| {
                let _ = tx.send(stats::render(&event_loop.table));
            },
        )));
        rx.recv_timeout(STATS_WAIT).ok()
    }
}

fn bind_listener(port: u16) -> Result<Socket, ServerError> {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(ServerError::Listen)?;
    listener.set_nonblocking(true).map_err(ServerError::Listen)?;
    listener
        .set_reuse_address(true)
        .map_err(ServerError::Listen)?;
    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    listener
        .bind(&addr.into())
        .map_err(|source| ServerError::Bind { addr, source })?;
    listener
        .listen(LISTEN_BACKLOG)
        .map_err(|source| ServerError::Bind { addr, source })?;
    Ok(listener)
}

fn configure_accepted(socket: &Socket) -> io::Result<()> {
    socket.set_linger(Some(ACCEPT_LINGER))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    Ok(())
}

fn schedule_doom(doomed: &mut Vec<u64>, id: u64) {
    if !doomed.contains(&id) {
        doomed.push(id);
    }
}

/// Loop-private state. Field order is drop order, which is the shutdown
/// order: connections, listener, wakeup pipe, readiness set.
pub(crate) struct EventLoop {
    table: ConnTable,
    listener: Socket,
    wake: WakePipe,
    poll: ReadinessSet,
    registry: HandlerRegistry,
    sso: Option<SsoOptions>,
    static_root: PathBuf,
    lame_timeout: Duration,
    next_reap: Instant,
    last_saturation_warn: Option<Instant>,
    doomed: Vec<u64>,
    shared: Arc<Shared>,
    guard: ThreadGuard,
}

impl EventLoop {
    fn run(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        while !self.shared.should_terminate() {
            // Tasks first, so work enqueued before serve started is not lost.
            self.drain_tasks();
            self.reap_lame();

            let count = match self.poll.wait(&mut events, POLL_TIMEOUT_MS) {
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(error = %err, "readiness wait failed");
                    return;
                }
            };
            if count == MAX_EVENTS {
                self.warn_saturated();
            }

            for event in &events {
                if !self.dispatch(*event) {
                    break;
                }
            }
            self.sweep_doomed();
        }
    }

    /// Routes one event by its token. Returns false when the batch must be
    /// abandoned because the loop is terminating.
    fn dispatch(&mut self, event: Event) -> bool {
        match event.token {
            Token::LISTENER => {
                if !event.ready.without(Interest::READABLE).is_empty() {
                    error!(ready = ?event.ready, "unexpected event on listening socket - terminating");
                    self.shared.request_terminate();
                    return false;
                }
                self.accept_one();
            }
            Token::WAKEUP => {
                if !event.ready.without(Interest::READABLE).is_empty() {
                    error!(ready = ?event.ready, "unexpected event on wakeup pipe - terminating");
                    self.shared.request_terminate();
                    return false;
                }
                if let Err(err) = self.wake.drain() {
                    error!(error = %err, "wakeup pipe read failed - terminating");
                    self.shared.request_terminate();
                    return false;
                }
                // The tasks the poke announced run at the top of the next
                // iteration.
            }
            Token(id) => self.dispatch_connection(id, event.ready),
        }
        true
    }

    fn dispatch_connection(&mut self, id: u64, ready: Interest) {
        let Some(entry) = self.table.get_mut(id) else {
            warn!(id, ?ready, "readiness event for a connection not in the table");
            return;
        };
        let peer = entry.conn.remote_address();

        let benign = Interest::READABLE
            .add(Interest::WRITABLE)
            .add(Interest::HUP);
        if !ready.without(benign).is_empty() {
            warn!(%peer, ?ready, "epoll error event on connection");
            schedule_doom(&mut self.doomed, id);
            return;
        }
        if ready.is_hup() {
            debug!(%peer, "graceful hang-up of connection");
            schedule_doom(&mut self.doomed, id);
            return;
        }

        // Writable before readable: freshly drained output must not starve
        // the peer on half-duplex exchanges.
        let ctx = ConnCtx {
            registry: &self.registry,
            sso: self.sso.as_ref(),
            static_root: &self.static_root,
        };
        let mut io_result = Ok(());
        if ready.is_writable() {
            io_result = entry.conn.on_writable();
        }
        if io_result.is_ok() && ready.is_readable() {
            io_result = entry.conn.on_readable(&ctx);
        }
        if let Err(err) = io_result {
            warn!(%peer, error = %err, "connection failed");
            schedule_doom(&mut self.doomed, id);
            return;
        }

        let want = entry.conn.wants_writable();
        if want != entry.conn.write_subscribed() {
            let interest = if want {
                Interest::both()
            } else {
                Interest::READABLE
            };
            match self.poll.modify(entry.conn.socket(), Token(id), interest) {
                Ok(()) => entry.conn.set_write_subscribed(want),
                Err(err) => {
                    warn!(%peer, error = %err, "unable to update write interest");
                    schedule_doom(&mut self.doomed, id);
                    return;
                }
            }
        }
        if entry.conn.is_closed() {
            schedule_doom(&mut self.doomed, id);
        }
    }

    /// Accepts a single connection. Level triggering re-fires while the
    /// backlog is non-empty, so one per event is enough.
    fn accept_one(&mut self) {
        let (socket, addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                error!(error = %err, "unable to accept");
                return;
            }
        };
        let peer = addr
            .as_socket()
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        if let Err(err) = configure_accepted(&socket) {
            error!(%peer, error = %err, "unable to configure accepted socket");
            return;
        }
        let id = self.table.allocate_id();
        let conn = Connection::new(socket, id, peer);
        info!(%peer, fd = conn.fd(), id, "accepted connection");
        if let Err(err) = self.poll.register(conn.socket(), Token(id), Interest::READABLE) {
            // The half-made connection drops here, closing its socket.
            error!(%peer, error = %err, "unable to register accepted connection");
            return;
        }
        self.table.insert(id, conn, SystemTime::now());
    }

    fn drain_tasks(&mut self) {
        self.guard.check();
        while let Some(task) = self.shared.tasks.pop() {
            match task {
                Queued::User(run) => run(),
                Queued::Control(run) => run(self),
            }
        }
    }

    /// Destroys connections that never sent a byte within the timeout.
    /// Runs at most once per [`REAPER_INTERVAL`].
    fn reap_lame(&mut self) {
        self.guard.check();
        let now = Instant::now();
        if now < self.next_reap {
            return;
        }
        self.next_reap = now + REAPER_INTERVAL;

        let mut lame = Vec::new();
        for (id, entry) in self.table.iter() {
            if entry.conn.bytes_received() != 0 {
                continue;
            }
            let age = entry.accepted_at.elapsed().unwrap_or_default();
            if age >= self.lame_timeout {
                warn!(
                    peer = %entry.conn.remote_address(),
                    age_secs = age.as_secs(),
                    "killing lame connection - no bytes received"
                );
                lame.push(*id);
            }
        }
        for id in lame {
            self.destroy(id);
        }
    }

    fn sweep_doomed(&mut self) {
        if self.doomed.is_empty() {
            return;
        }
        let doomed = std::mem::take(&mut self.doomed);
        for id in doomed {
            if !self.destroy(id) {
                // Bookkeeping is broken; bail out rather than run on.
                error!(id, "attempt to destroy a connection missing from the table - terminating");
                self.shared.request_terminate();
                break;
            }
        }
    }

    /// Removes, deregisters, and drops one connection. Returns false if it
    /// was not in the table.
    fn destroy(&mut self, id: u64) -> bool {
        self.guard.check();
        let Some(mut entry) = self.table.remove(id) else {
            return false;
        };
        entry.conn.notify_close();
        if let Err(err) = self.poll.deregister(entry.conn.socket()) {
            error!(
                peer = %entry.conn.remote_address(),
                error = %err,
                "unable to remove connection from readiness set"
            );
        }
        debug!(peer = %entry.conn.remote_address(), id, "destroying connection");
        true
    }

    fn warn_saturated(&mut self) {
        let now = Instant::now();
        let due = self
            .last_saturation_warn
            .map_or(true, |last| now.duration_since(last) >= SATURATION_WARN_INTERVAL);
        if due {
            warn!("full event queue; may start starving connections (warning at most once a minute)");
            self.last_saturation_warn = Some(now);
        }
    }

    fn close_all(&mut self) {
        info!(connections = self.table.len(), "server shutting down");
        for id in self.table.ids() {
            self.destroy(id);
        }
    }
}
