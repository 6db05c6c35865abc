//! Event Loop Driver
//!
//! [`Server`] owns every piece of mutable state: the listening socket, the
//! readiness multiplexer, the deadline scheduler, the connection pool and
//! the endpoint registry. Everything runs on the thread that calls
//! [`Server::run`].
//!
//! ## One Turn of the Loop
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ wait(timeout = earliest timer deadline)                      │
//!   │   │                                                          │
//!   │   ├─► listener ready?   accept until WouldBlock              │
//!   │   │                     (pause listener when pool is full)   │
//!   │   │                                                          │
//!   │   ├─► each ready client token:                               │
//!   │   │      Reading   ─► read_request ─► Sending                │
//!   │   │      Sending   ─► write_pending ─► Pausing / finish      │
//!   │   │      Lingering ─► drain ─► close                         │
//!   │   │                                                          │
//!   │   └─► due timers:  Sweep, Wakeup, Linger, Refresh, Stats     │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shutdown
//!
//! Setting the flag from [`Server::shutdown_handle`] (which `main` wires to
//! SIGINT and SIGTERM) closes the listener. The loop keeps running until
//! every open connection has finished or timed out, then returns.

use crate::config::Config;
use crate::connection::{
    ConnId, ConnState, Connection, ConnectionError, ConnectionPool, ReadEvent, WriteProgress,
};
use crate::endpoints::Registry;
use crate::error::{ServerError, ServerResult};
use crate::http::{Method, Request, Response, StatusCode, Version};
use crate::poller::{Interest, Multiplexer, Token};
use crate::timer::{Scheduler, TimerHandle};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Payload carried by every scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Periodic idle sweep over the pool.
    Sweep,
    /// Backoff expired; resume sending.
    Wakeup(ConnId),
    /// Lingering window expired; close.
    Linger(ConnId),
    /// Refresh the producer at this registry index.
    Refresh(usize),
    /// Periodic statistics log.
    Stats,
}

/// Counters kept over the server's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections accepted.
    pub connections: u64,
    /// Response bytes written, headers included.
    pub bytes_sent: u64,
    /// Most connections open at once.
    pub high_water: usize,
    /// Responses by status class.
    pub success: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    /// Connections evicted by the idle sweep.
    pub timeouts: u64,
    /// Writes that blocked and sent the connection into Pausing.
    pub pauses: u64,
    /// Times accepting was paused because the pool was full.
    pub deferrals: u64,
}

impl ServerStats {
    fn record(&mut self, conn: &Connection) {
        self.bytes_sent += conn.bytes_sent();
        match conn.status().map(|s| s.code()) {
            Some(200..=299) => self.success += 1,
            Some(400..=499) => self.client_errors += 1,
            Some(500..=599) => self.server_errors += 1,
            _ => {}
        }
    }
}

/// Creates the listening socket: address reuse, backlog, non-blocking.
fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The HTTP server.
pub struct Server {
    config: Config,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    listening: bool,
    poller: Multiplexer,
    timers: Scheduler<TimerEvent>,
    pool: ConnectionPool,
    registry: Registry,
    stats: ServerStats,
    shutdown: Arc<AtomicBool>,
    draining: bool,
}

impl Server {
    /// Binds the configured address with the configured backend and the
    /// standard endpoints.
    pub fn bind(config: Config) -> ServerResult<Self> {
        let poller = Multiplexer::new(config.backend)?;
        let registry = Registry::standard(config.cpu_refresh());
        Self::bind_with(config, poller, registry)
    }

    /// Binds using an existing multiplexer and registry.
    pub fn bind_with(
        config: Config,
        mut poller: Multiplexer,
        registry: Registry,
    ) -> ServerResult<Self> {
        let address = config.address();
        let addr = address
            .to_socket_addrs()
            .map_err(|e| ServerError::bind(address.as_str(), e))?
            .next()
            .ok_or_else(|| ServerError::Config(format!("{address} resolves to nothing")))?;

        let capacity = config.pool_capacity(poller.capacity());
        if capacity == 0 {
            return Err(ServerError::PoolExhausted {
                limit: poller.capacity(),
            });
        }

        let listener = listen(addr, config.backlog).map_err(|e| ServerError::bind(address, e))?;
        let local_addr = listener.local_addr()?;
        poller.register(listener.as_raw_fd(), Token::LISTENER, Interest::Read)?;

        let mut timers = Scheduler::new();
        timers.schedule(None, config.sweep_interval(), true, TimerEvent::Sweep);
        if let Some(every) = config.stats_interval() {
            timers.schedule(None, every, true, TimerEvent::Stats);
        }
        for (index, every) in registry.refresh_schedule() {
            timers.schedule(None, every, true, TimerEvent::Refresh(index));
        }

        info!(
            addr = %local_addr,
            backend = poller.backend_name(),
            capacity,
            endpoints = ?registry.names(),
            "listening"
        );

        Ok(Self {
            config,
            listener: Some(listener),
            local_addr,
            listening: true,
            poller,
            timers,
            pool: ConnectionPool::new(capacity),
            registry,
            stats: ServerStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            draining: false,
        })
    }

    /// The address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag that stops the server when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Runs until shutdown is requested and every connection has drained.
    pub fn run(&mut self) -> ServerResult<()> {
        loop {
            if !self.draining && self.shutdown.load(Ordering::Relaxed) {
                self.begin_shutdown();
            }
            if self.draining && self.pool.is_empty() {
                break;
            }
            self.turn()?;
        }

        self.log_stats("shutdown");
        Ok(())
    }

    /// One wait, dispatch and timer pass.
    fn turn(&mut self) -> ServerResult<()> {
        let timeout = self.timers.earliest_wait(Instant::now());
        match self.poller.wait(timeout) {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                trace!(error = %e, "wait interrupted");
            }
            Err(e) => {
                error!(error = %e, "wait failed");
                return Err(e.into());
            }
        }

        let now = Instant::now();

        if self.listening && self.listener_ready() {
            self.accept_all(now)?;
        }

        while let Some(token) = self.poller.next_ready() {
            if token == Token::LISTENER {
                continue;
            }
            self.dispatch(token.0, now);
        }

        self.run_timers(Instant::now());
        Ok(())
    }

    fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    fn listener_ready(&self) -> bool {
        self.listener_fd()
            .is_some_and(|fd| self.poller.is_ready(fd))
    }

    // ========================================================================
    // Accepting
    // ========================================================================

    fn accept_all(&mut self, now: Instant) -> ServerResult<()> {
        loop {
            if self.pool.is_full() {
                warn!(capacity = self.pool.capacity(), "connection pool full, deferring accepts");
                self.stats.deferrals += 1;
                self.pause_listener();
                return Ok(());
            }

            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => return Ok(()),
                    io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset => continue,
                    _ => {
                        error!(error = %e, "accept failed");
                        return Err(e.into());
                    }
                },
            };

            if let Err(e) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
                warn!(peer = %peer, error = %e, "failed to configure socket");
                continue;
            }

            let increment = self.config.wouldblock_delay();
            let Some(id) = self
                .pool
                .insert_with(|buffers| Connection::new(stream, peer, now, increment, buffers))
            else {
                continue;
            };

            let fd = self.pool.get(id).map(Connection::fd);
            let registered = fd.map(|fd| {
                self.poller
                    .register(fd, Token(id.index()), Interest::Read)
            });
            if let Some(Err(e)) = registered {
                warn!(conn = %id, error = %e, "failed to register connection");
                self.discard(id);
                continue;
            }

            self.stats.connections += 1;
            self.stats.high_water = self.pool.high_water();
            debug!(conn = %id, peer = %peer, "accepted");
        }
    }

    fn pause_listener(&mut self) {
        if let Some(fd) = self.listener_fd() {
            if self.listening {
                if let Err(e) = self.poller.unregister(fd) {
                    warn!(error = %e, "failed to pause listener");
                }
                self.listening = false;
            }
        }
    }

    fn resume_listener(&mut self) {
        if self.listening || self.draining {
            return;
        }
        if let Some(fd) = self.listener_fd() {
            match self.poller.register(fd, Token::LISTENER, Interest::Read) {
                Ok(()) => {
                    debug!("resuming accepts");
                    self.listening = true;
                }
                Err(e) => warn!(error = %e, "failed to resume listener"),
            }
        }
    }

    fn begin_shutdown(&mut self) {
        info!(open = self.pool.len(), "shutdown requested, draining connections");
        self.pause_listener();
        self.listener = None;
        self.draining = true;
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch(&mut self, index: usize, now: Instant) {
        let Some(id) = self.pool.id_at(index) else {
            return;
        };
        let Some(conn) = self.pool.get(id) else {
            return;
        };

        if !self.poller.is_ready(conn.fd()) {
            debug!(conn = %id, "descriptor reported dead");
            self.close(id);
            return;
        }

        let state = conn.state;
        match state {
            ConnState::Reading => self.handle_read(id, now),
            ConnState::Sending => self.handle_send(id, now),
            ConnState::Lingering => self.handle_linger(id),
            ConnState::Pausing | ConnState::Free => {}
        }
    }

    fn handle_read(&mut self, id: ConnId, now: Instant) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };

        match conn.read_request(now) {
            Ok(ReadEvent::Incomplete) => {}
            Ok(ReadEvent::Request(request)) => {
                debug!(
                    conn = %id,
                    method = request.method.as_str(),
                    url = %request.encoded_url,
                    "request"
                );
                let response = self.respond(&request);
                let head_only = request.method == Method::Head;
                self.start_sending(id, &response, request.version, head_only);
            }
            Ok(ReadEvent::Invalid(e)) => {
                debug!(conn = %id, error = %e, "rejected request");
                let response = Response::error(e.status, &e.url, &e.arg);
                let version = e.version.unwrap_or(Version::Http10);
                self.start_sending(id, &response, version, false);
            }
            Err(ConnectionError::IoError(e)) => {
                debug!(conn = %id, error = %e, "read failed");
                self.close(id);
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "bad request");
                self.close_with_error(id, StatusCode::BadRequest);
            }
        }
    }

    fn respond(&self, request: &Request) -> Response {
        let url = request.encoded_url.as_str();
        let Some(handler) = self.registry.find_handler(&request.path) else {
            return Response::error(StatusCode::NotFound, url, url);
        };
        match handler.body() {
            Some(body) => Response::json(body),
            None => {
                warn!(endpoint = handler.name(), "no document to serve");
                Response::error(StatusCode::InternalError, url, url)
            }
        }
    }

    fn start_sending(&mut self, id: ConnId, response: &Response, version: Version, head_only: bool) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };
        conn.prepare_response(response, version, head_only);
        conn.state = ConnState::Sending;
        let fd = conn.fd();
        self.set_interest(id, fd, Some(Interest::Write));
    }

    fn handle_send(&mut self, id: ConnId, now: Instant) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };

        match conn.write_pending(now) {
            Ok(WriteProgress::Done) => self.finish(id),
            Ok(WriteProgress::Partial) | Ok(WriteProgress::Interrupted) => {}
            Ok(WriteProgress::Blocked) => {
                let delay = conn.backoff.on_would_block();
                conn.state = ConnState::Pausing;
                self.stats.pauses += 1;
                let fd = conn.fd();
                trace!(conn = %id, delay_ms = delay.as_millis() as u64, "write blocked, pausing");
                self.set_interest(id, fd, None);
                self.arm_wakeup(id, delay);
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "write failed");
                self.close(id);
            }
        }
    }

    fn handle_linger(&mut self, id: ConnId) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };
        match conn.drain() {
            Ok(false) => {}
            Ok(true) | Err(_) => self.close(id),
        }
    }

    /// The response is fully written: linger if the peer may still be
    /// sending, otherwise close.
    fn finish(&mut self, id: ConnId) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };
        if !conn.should_linger() {
            self.close(id);
            return;
        }

        if let Err(e) = conn.shutdown_write() {
            debug!(conn = %id, error = %e, "shutdown failed");
            self.close(id);
            return;
        }
        conn.state = ConnState::Lingering;
        let fd = conn.fd();
        self.set_interest(id, fd, Some(Interest::Read));
        self.arm_linger(id);
    }

    /// Moves `fd` to `interest`, or to no registration at all.
    fn set_interest(&mut self, id: ConnId, fd: RawFd, interest: Option<Interest>) {
        let current = self.poller.interest(fd);
        if current == interest {
            return;
        }
        if current.is_some() {
            if let Err(e) = self.poller.unregister(fd) {
                warn!(conn = %id, error = %e, "unregister failed");
            }
        }
        if let Some(interest) = interest {
            if let Err(e) = self.poller.register(fd, Token(id.index()), interest) {
                warn!(conn = %id, error = %e, "register failed");
                self.close(id);
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn cancel_armed(&mut self, id: ConnId) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };
        let armed = [conn.wakeup.take(), conn.linger.take()];
        for handle in armed.into_iter().flatten() {
            warn!(conn = %id, "timer already armed, canceling it first");
            self.timers.cancel(handle);
        }
    }

    fn arm_wakeup(&mut self, id: ConnId, delay: Duration) {
        if self.pool.get(id).is_none() {
            return;
        }
        self.cancel_armed(id);
        let handle = self
            .timers
            .schedule(None, delay, false, TimerEvent::Wakeup(id));
        if let Some(conn) = self.pool.get_mut(id) {
            conn.wakeup = Some(handle);
        }
    }

    fn arm_linger(&mut self, id: ConnId) {
        if self.pool.get(id).is_none() {
            return;
        }
        self.cancel_armed(id);
        let handle = self
            .timers
            .schedule(None, self.config.linger(), false, TimerEvent::Linger(id));
        if let Some(conn) = self.pool.get_mut(id) {
            conn.linger = Some(handle);
        }
    }

    fn run_timers(&mut self, now: Instant) {
        while let Some(expired) = self.timers.next_expired(now) {
            match expired.data {
                TimerEvent::Sweep => self.idle_sweep(now),
                TimerEvent::Wakeup(id) => self.wakeup(id, expired.handle),
                TimerEvent::Linger(id) => self.linger_expired(id, expired.handle),
                TimerEvent::Refresh(index) => {
                    if !self.registry.refresh(index) {
                        warn!(index, "refresh for unknown endpoint");
                    }
                }
                TimerEvent::Stats => self.log_stats("periodic"),
            }
        }
    }

    fn wakeup(&mut self, id: ConnId, handle: TimerHandle) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };
        if conn.wakeup != Some(handle) {
            return;
        }
        conn.wakeup = None;
        if conn.state != ConnState::Pausing {
            return;
        }
        conn.state = ConnState::Sending;
        let fd = conn.fd();
        self.set_interest(id, fd, Some(Interest::Write));
    }

    fn linger_expired(&mut self, id: ConnId, handle: TimerHandle) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };
        if conn.linger != Some(handle) {
            return;
        }
        conn.linger = None;
        self.close(id);
    }

    /// Evicts connections that have been idle too long.
    fn idle_sweep(&mut self, now: Instant) {
        let read_timeout = self.config.read_timeout();
        let send_timeout = self.config.send_timeout();

        for id in self.pool.ids() {
            let Some(conn) = self.pool.get(id) else {
                continue;
            };
            let idle = now.saturating_duration_since(conn.active_at);
            let state = conn.state;

            match state {
                ConnState::Reading if idle >= read_timeout => {
                    info!(conn = %id, peer = %conn.peer(), "request timed out");
                    self.stats.timeouts += 1;
                    self.close_with_error(id, StatusCode::RequestTimeout);
                }
                ConnState::Sending | ConnState::Pausing if idle >= send_timeout => {
                    info!(conn = %id, peer = %conn.peer(), url = conn.url(), "send timed out");
                    self.stats.timeouts += 1;
                    self.close(id);
                }
                _ => {}
            }
        }
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Sends what can be sent of an error response without waiting, then
    /// closes.
    fn close_with_error(&mut self, id: ConnId, status: StatusCode) {
        if let Some(conn) = self.pool.get_mut(id) {
            conn.prepare_error(status);
            conn.flush_best_effort();
        }
        self.close(id);
    }

    /// Cancels timers, drops the registration and frees the slot.
    fn close(&mut self, id: ConnId) {
        let Some(conn) = self.pool.get_mut(id) else {
            return;
        };
        for handle in [conn.wakeup.take(), conn.linger.take()].into_iter().flatten() {
            self.timers.cancel(handle);
        }

        let fd = conn.fd();
        if conn.state != ConnState::Pausing && self.poller.interest(fd).is_some() {
            if let Err(e) = self.poller.unregister(fd) {
                warn!(conn = %id, error = %e, "unregister on close failed");
            }
        }

        let Some(conn) = self.pool.remove(id) else {
            return;
        };
        self.stats.record(&conn);
        debug!(
            conn = %id,
            peer = %conn.peer(),
            method = conn.method().unwrap_or("-"),
            url = conn.url(),
            status = conn.status().map_or(0, |s| s.code()),
            bytes = conn.bytes_sent(),
            elapsed_ms = conn.started_at.elapsed().as_millis() as u64,
            "closed"
        );
        self.pool.recycle(id.index(), conn.into_buffers());
        self.resume_listener();
    }

    /// Frees a slot whose connection never became active.
    fn discard(&mut self, id: ConnId) {
        if let Some(conn) = self.pool.remove(id) {
            self.pool.recycle(id.index(), conn.into_buffers());
        }
    }

    fn log_stats(&mut self, reason: &'static str) {
        let poller = self.poller.stats();
        let timers = self.timers.stats();
        info!(
            reason,
            connections = self.stats.connections,
            open = self.pool.len(),
            high_water = self.stats.high_water,
            bytes_sent = self.stats.bytes_sent,
            success = self.stats.success,
            client_errors = self.stats.client_errors,
            server_errors = self.stats.server_errors,
            timeouts = self.stats.timeouts,
            pauses = self.stats.pauses,
            deferrals = self.stats.deferrals,
            backend = poller.backend,
            watches = poller.watches,
            timers = timers.active,
            "statistics"
        );
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("poller", &self.poller)
            .field("open", &self.pool.len())
            .field("draining", &self.draining)
            .finish()
    }
}
