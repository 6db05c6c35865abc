//! Readiness Multiplexer
//!
//! This module hides the operating system's readiness-notification mechanism
//! behind a single register / unregister / wait / iterate interface.
//!
//! ## Backends
//!
//! | Backend  | Kernel interface | Delete cost            |
//! |----------|------------------|------------------------|
//! | `select` | `fd_set` bitmask | swap-with-last, O(1)   |
//! | `poll`   | `pollfd` array   | swap-with-last, O(1)   |
//! | `epoll`  | event list       | kernel side, O(1)      |
//! | `kqueue` | event queue      | kernel side, O(1)      |
//!
//! Exactly one backend is chosen when the [`Multiplexer`] is built. Every
//! backend answers the same questions after a `wait`: which descriptors came
//! back (in a backend-stable order) and whether a given descriptor is ready for
//! the interest it was registered with.
//!
//! ## Registration Model
//!
//! ```text
//!   fd ──► table[fd] = Some((Interest, Token))
//!                  │
//!                  └─► backend slot (bit, pollfd index, kernel entry)
//! ```
//!
//! A descriptor has at most one registration. Registering it twice, or
//! unregistering something that was never registered, is reported as
//! [`PollerError::InvalidDescriptor`] so the caller can log it and carry on.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(test)]
pub mod mock;
mod poll;
mod select;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::EpollBackend;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueBackend;
pub use poll::PollBackend;
pub use select::SelectBackend;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Descriptor limit used when the hard limit is reported as infinite.
const UNLIMITED_FALLBACK: usize = 8192;

/// What a registered descriptor is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Opaque client data handed back by [`Multiplexer::next_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

impl Token {
    /// Token reserved for the listening socket.
    pub const LISTENER: Token = Token(usize::MAX);
}

/// Errors reported by the multiplexer.
#[derive(Error, Debug)]
pub enum PollerError {
    #[error("invalid descriptor {0}")]
    InvalidDescriptor(RawFd),

    #[error("backend '{0}' is not available on this platform")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PollerError {
    /// Returns true for interruptions that should simply be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            PollerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// One OS readiness mechanism.
///
/// Backends trust the [`Multiplexer`] to have validated the descriptor; they
/// only translate the request into kernel calls and remember the results of
/// the last `watch`.
pub trait Backend: Send {
    /// Short name used in logs and statistics.
    fn name(&self) -> &'static str;

    /// Starts watching `fd` for `interest`.
    fn add_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stops watching `fd`, which was added with `interest`.
    fn del_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Blocks until something is ready or the timeout elapses.
    /// `None` waits forever. Returns the number of ready descriptors.
    fn watch(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Whether `fd` came back ready for `interest` from the last `watch`.
    /// Error conditions count as not ready.
    fn check_fd(&self, fd: RawFd, interest: Interest) -> bool;

    /// The descriptor at position `ridx` of the last `watch` result.
    fn ready_fd(&self, ridx: usize) -> Option<RawFd>;
}

/// Selects which [`Backend`] a [`Multiplexer`] is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Select,
    Poll,
    Epoll,
    Kqueue,
}

impl BackendKind {
    /// The preferred backend for the current platform.
    pub fn platform_default() -> Self {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            BackendKind::Epoll
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            BackendKind::Kqueue
        } else {
            BackendKind::Poll
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Select => "select",
            BackendKind::Poll => "poll",
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
        }
    }

    /// Upper bound on descriptors the backend can handle, if any.
    fn max_descriptors(&self) -> Option<usize> {
        match self {
            BackendKind::Select => Some(libc::FD_SETSIZE as usize),
            _ => None,
        }
    }

    fn build(&self, capacity: usize) -> Result<Box<dyn Backend>, PollerError> {
        match self {
            BackendKind::Select => Ok(Box::new(SelectBackend::new(capacity))),
            BackendKind::Poll => Ok(Box::new(PollBackend::new(capacity))),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::Epoll => Ok(Box::new(EpollBackend::new(capacity)?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            BackendKind::Kqueue => Ok(Box::new(KqueueBackend::new(capacity)?)),
            #[allow(unreachable_patterns)]
            other => Err(PollerError::Unsupported(other.as_str())),
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Soft limit to request given the current soft and hard limits, or `None`
/// when that would not raise it. An unlimited hard limit is approached as
/// [`UNLIMITED_FALLBACK`].
fn raised_soft_limit(cur: libc::rlim_t, max: libc::rlim_t) -> Option<libc::rlim_t> {
    let wanted = if max == libc::RLIM_INFINITY {
        UNLIMITED_FALLBACK as libc::rlim_t
    } else {
        max
    };
    (wanted > cur).then_some(wanted)
}

/// Queries the process descriptor limit, raising the soft limit to the hard
/// limit where permitted, and returns the effective value.
pub fn descriptor_limit() -> io::Result<usize> {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: rl is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } != 0 {
        return Err(io::Error::last_os_error());
    }

    if let Some(wanted) = raised_soft_limit(rl.rlim_cur, rl.rlim_max) {
        let raised = libc::rlimit {
            rlim_cur: wanted,
            rlim_max: rl.rlim_max,
        };

        // SAFETY: raised is a valid rlimit.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } == 0 {
            rl.rlim_cur = wanted;
        } else {
            debug!(
                error = %io::Error::last_os_error(),
                "could not raise descriptor limit"
            );
        }
    }

    if rl.rlim_cur == libc::RLIM_INFINITY {
        return Ok(UNLIMITED_FALLBACK);
    }

    Ok(usize::try_from(rl.rlim_cur).unwrap_or(UNLIMITED_FALLBACK))
}

/// Converts an optional timeout to poll-style milliseconds, rounding up so a
/// sub-millisecond deadline does not turn into a busy loop.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_micros().div_ceil(1000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Grows a per-descriptor lookup table so `fd` is addressable.
pub(crate) fn ensure_slot<T: Clone>(table: &mut Vec<T>, fd: RawFd, fill: T) {
    let needed = fd as usize + 1;
    if table.len() < needed {
        table.resize(needed, fill);
    }
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    interest: Interest,
    token: Token,
}

/// Multiplexer statistics since the previous call to [`Multiplexer::stats`].
#[derive(Debug, Clone)]
pub struct PollerStats {
    pub backend: &'static str,
    pub registered: usize,
    pub watches: u64,
}

/// The uniform readiness interface used by the event loop.
pub struct Multiplexer {
    backend: Box<dyn Backend>,
    capacity: usize,
    table: Vec<Option<Registration>>,
    registered: usize,
    nreturned: usize,
    next_ridx: usize,
    nwatches: u64,
}

impl Multiplexer {
    /// Builds a multiplexer on the given backend, sized by the process
    /// descriptor limit.
    pub fn new(kind: BackendKind) -> Result<Self, PollerError> {
        let mut capacity = descriptor_limit()?;
        if let Some(max) = kind.max_descriptors() {
            capacity = capacity.min(max);
        }

        let backend = kind.build(capacity)?;
        Ok(Self::with_backend(backend, capacity))
    }

    /// Builds a multiplexer over an existing backend.
    pub fn with_backend(backend: Box<dyn Backend>, capacity: usize) -> Self {
        Self {
            backend,
            capacity,
            table: vec![None; capacity],
            registered: 0,
            nreturned: 0,
            next_ridx: 0,
            nwatches: 0,
        }
    }

    /// Number of descriptors this multiplexer can track.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of currently registered descriptors.
    pub fn registered(&self) -> usize {
        self.registered
    }

    fn slot(&self, fd: RawFd) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&i| i < self.capacity)
    }

    /// The interest `fd` is registered with, if any.
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.slot(fd)
            .and_then(|i| self.table[i])
            .map(|reg| reg.interest)
    }

    /// Starts watching `fd` for `interest`, tagging it with `token`.
    pub fn register(
        &mut self,
        fd: RawFd,
        token: Token,
        interest: Interest,
    ) -> Result<(), PollerError> {
        let Some(i) = self.slot(fd) else {
            warn!(fd, "register: descriptor out of range");
            return Err(PollerError::InvalidDescriptor(fd));
        };
        if self.table[i].is_some() {
            warn!(fd, "register: descriptor already registered");
            return Err(PollerError::InvalidDescriptor(fd));
        }

        self.backend.add_fd(fd, interest)?;
        self.table[i] = Some(Registration { interest, token });
        self.registered += 1;
        Ok(())
    }

    /// Stops watching `fd`.
    pub fn unregister(&mut self, fd: RawFd) -> Result<(), PollerError> {
        let Some(reg) = self.slot(fd).and_then(|i| self.table[i].take()) else {
            warn!(fd, "unregister: descriptor not registered");
            return Err(PollerError::InvalidDescriptor(fd));
        };

        self.registered -= 1;
        self.backend.del_fd(fd, reg.interest)?;
        Ok(())
    }

    /// Waits for readiness. Returns the number of ready descriptors, 0 on
    /// timeout. Interruptions come back as transient errors.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<usize, PollerError> {
        self.nwatches += 1;
        self.nreturned = 0;
        self.next_ridx = 0;

        let n = self.backend.watch(timeout)?;
        self.nreturned = n;
        Ok(n)
    }

    /// Whether `fd` is ready for the interest it is registered with.
    /// Only meaningful for descriptors registered before the last `wait`.
    pub fn is_ready(&self, fd: RawFd) -> bool {
        match self.slot(fd).and_then(|i| self.table[i]) {
            Some(reg) => self.backend.check_fd(fd, reg.interest),
            None => {
                warn!(fd, "is_ready: descriptor not registered");
                false
            }
        }
    }

    /// Next token from the last `wait` result. Descriptors unregistered
    /// since the wait are skipped.
    pub fn next_ready(&mut self) -> Option<Token> {
        while self.next_ridx < self.nreturned {
            let ridx = self.next_ridx;
            self.next_ridx += 1;

            let Some(fd) = self.backend.ready_fd(ridx) else {
                continue;
            };
            if let Some(reg) = self.slot(fd).and_then(|i| self.table[i]) {
                return Some(reg.token);
            }
        }
        None
    }

    /// Returns and resets the watch counter.
    pub fn stats(&mut self) -> PollerStats {
        let stats = PollerStats {
            backend: self.backend.name(),
            registered: self.registered,
            watches: self.nwatches,
        };
        self.nwatches = 0;
        stats
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("backend", &self.backend.name())
            .field("capacity", &self.capacity)
            .field("registered", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn mock_mux(capacity: usize) -> (Multiplexer, super::mock::MockHandle) {
        let (backend, handle) = MockBackend::new();
        (Multiplexer::with_backend(Box::new(backend), capacity), handle)
    }

    #[test]
    fn test_register_twice_is_invalid() {
        let (mut mux, _) = mock_mux(16);
        mux.register(3, Token(0), Interest::Read).unwrap();
        let err = mux.register(3, Token(1), Interest::Write).unwrap_err();
        assert!(matches!(err, PollerError::InvalidDescriptor(3)));
        assert_eq!(mux.registered(), 1);
    }

    #[test]
    fn test_out_of_range_descriptor() {
        let (mut mux, _) = mock_mux(4);
        assert!(matches!(
            mux.register(4, Token(0), Interest::Read),
            Err(PollerError::InvalidDescriptor(4))
        ));
        assert!(matches!(
            mux.register(-1, Token(0), Interest::Read),
            Err(PollerError::InvalidDescriptor(-1))
        ));
    }

    #[test]
    fn test_unregister_unknown() {
        let (mut mux, _) = mock_mux(8);
        assert!(matches!(
            mux.unregister(5),
            Err(PollerError::InvalidDescriptor(5))
        ));
    }

    #[test]
    fn test_ready_iteration_yields_each_once() {
        let (mut mux, handle) = mock_mux(16);
        mux.register(5, Token(50), Interest::Read).unwrap();
        mux.register(6, Token(60), Interest::Write).unwrap();
        mux.register(7, Token(70), Interest::Read).unwrap();

        handle.set_ready(5);
        handle.set_ready(7);
        assert_eq!(mux.wait(Some(Duration::ZERO)).unwrap(), 2);

        let mut tokens = Vec::new();
        while let Some(t) = mux.next_ready() {
            tokens.push(t);
        }
        assert_eq!(tokens, vec![Token(50), Token(70)]);
        assert!(mux.is_ready(5));
        assert!(!mux.is_ready(6));
    }

    #[test]
    fn test_unregistered_after_wait_is_skipped() {
        let (mut mux, handle) = mock_mux(16);
        mux.register(5, Token(1), Interest::Read).unwrap();
        mux.register(6, Token(2), Interest::Read).unwrap();
        handle.set_ready(5);
        handle.set_ready(6);
        mux.wait(None).unwrap();

        mux.unregister(5).unwrap();
        assert_eq!(mux.next_ready(), Some(Token(2)));
        assert_eq!(mux.next_ready(), None);
    }

    #[test]
    fn test_dead_descriptor_is_returned_but_not_ready() {
        let (mut mux, handle) = mock_mux(16);
        mux.register(8, Token(3), Interest::Write).unwrap();
        handle.set_dead(8);

        assert_eq!(mux.wait(Some(Duration::from_millis(40))).unwrap(), 1);
        assert_eq!(handle.last_timeout(), Some(Some(Duration::from_millis(40))));
        assert_eq!(mux.next_ready(), Some(Token(3)));
        assert!(!mux.is_ready(8));
    }

    #[test]
    fn test_interest_follows_registration() {
        let (mut mux, handle) = mock_mux(16);
        mux.register(4, Token(0), Interest::Read).unwrap();
        assert_eq!(mux.interest(4), Some(Interest::Read));
        assert_eq!(handle.interest(4), Some(Interest::Read));

        mux.unregister(4).unwrap();
        mux.register(4, Token(0), Interest::Write).unwrap();
        assert_eq!(handle.interest(4), Some(Interest::Write));

        let stats = mux.stats();
        assert_eq!(stats.backend, "mock");
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.watches, 0);
    }

    #[test]
    fn test_timeout_millis_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(250))), 250);
    }

    #[test]
    fn test_soft_limit_only_raised() {
        let fallback = UNLIMITED_FALLBACK as libc::rlim_t;
        assert_eq!(raised_soft_limit(256, 4096), Some(4096));
        assert_eq!(raised_soft_limit(4096, 4096), None);
        assert_eq!(raised_soft_limit(256, libc::RLIM_INFINITY), Some(fallback));
        assert_eq!(raised_soft_limit(fallback * 2, libc::RLIM_INFINITY), None);
        assert_eq!(raised_soft_limit(libc::RLIM_INFINITY, libc::RLIM_INFINITY), None);
    }

    #[test]
    fn test_descriptor_limit_positive() {
        assert!(descriptor_limit().unwrap() > 0);
    }

    // Exercises each real backend against a socket pair.
    fn exercise_backend(kind: BackendKind) {
        let mut mux = Multiplexer::new(kind).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        mux.register(fd, Token(9), Interest::Read).unwrap();
        assert_eq!(mux.wait(Some(Duration::from_millis(10))).unwrap(), 0);
        assert_eq!(mux.next_ready(), None);

        a.write_all(b"x").unwrap();
        assert_eq!(mux.wait(Some(Duration::from_secs(1))).unwrap(), 1);
        assert!(mux.is_ready(fd));
        assert_eq!(mux.next_ready(), Some(Token(9)));
        assert_eq!(mux.next_ready(), None);

        mux.unregister(fd).unwrap();
        mux.register(fd, Token(10), Interest::Write).unwrap();
        assert_eq!(mux.wait(Some(Duration::from_secs(1))).unwrap(), 1);
        assert_eq!(mux.next_ready(), Some(Token(10)));
        mux.unregister(fd).unwrap();
        assert_eq!(mux.registered(), 0);
    }

    #[test]
    fn test_select_backend() {
        exercise_backend(BackendKind::Select);
    }

    #[test]
    fn test_poll_backend() {
        exercise_backend(BackendKind::Poll);
    }

    #[test]
    fn test_platform_backend() {
        exercise_backend(BackendKind::platform_default());
    }

    #[test]
    fn test_select_swap_delete_keeps_others() {
        let mut mux = Multiplexer::new(BackendKind::Select).unwrap();
        let (mut a1, b1) = UnixStream::pair().unwrap();
        let (mut a2, b2) = UnixStream::pair().unwrap();
        let (_a3, b3) = UnixStream::pair().unwrap();

        mux.register(b1.as_raw_fd(), Token(1), Interest::Read).unwrap();
        mux.register(b2.as_raw_fd(), Token(2), Interest::Read).unwrap();
        mux.register(b3.as_raw_fd(), Token(3), Interest::Read).unwrap();
        mux.unregister(b1.as_raw_fd()).unwrap();

        a1.write_all(b"ignored").unwrap();
        a2.write_all(b"y").unwrap();
        assert_eq!(mux.wait(Some(Duration::from_secs(1))).unwrap(), 1);
        assert_eq!(mux.next_ready(), Some(Token(2)));
        assert_eq!(mux.next_ready(), None);
    }
}
