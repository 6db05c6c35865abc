//! In-memory backend for unit tests.
//!
//! Readiness is scripted through a [`MockHandle`]; `watch` never blocks.

use super::{Backend, Interest};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    registered: BTreeMap<RawFd, Interest>,
    pending: BTreeSet<RawFd>,
    dead: BTreeSet<RawFd>,
    ready: Vec<RawFd>,
    last_timeout: Option<Option<Duration>>,
}

/// Scripting side of a [`MockBackend`].
#[derive(Debug, Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Marks `fd` ready for the next watch.
    pub fn set_ready(&self, fd: RawFd) {
        self.with(|s| {
            s.pending.insert(fd);
        });
    }

    /// Marks `fd` as erroring: it is returned but never reported ready.
    pub fn set_dead(&self, fd: RawFd) {
        self.with(|s| {
            s.pending.insert(fd);
            s.dead.insert(fd);
        });
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.with(|s| s.registered.get(&fd).copied())
    }

    pub fn last_timeout(&self) -> Option<Option<Duration>> {
        self.with(|s| s.last_timeout)
    }
}

pub struct MockBackend {
    handle: MockHandle,
}

impl MockBackend {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn add_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.handle.with(|s| {
            s.registered.insert(fd, interest);
        });
        Ok(())
    }

    fn del_fd(&mut self, fd: RawFd, _interest: Interest) -> io::Result<()> {
        self.handle.with(|s| {
            s.registered.remove(&fd);
        });
        Ok(())
    }

    fn watch(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.handle.with(|s| {
            s.last_timeout = Some(timeout);
            let pending = std::mem::take(&mut s.pending);
            s.ready = pending
                .into_iter()
                .filter(|fd| s.registered.contains_key(fd))
                .collect();
            Ok(s.ready.len())
        })
    }

    fn check_fd(&self, fd: RawFd, interest: Interest) -> bool {
        self.handle.with(|s| {
            s.ready.contains(&fd)
                && !s.dead.contains(&fd)
                && s.registered.get(&fd) == Some(&interest)
        })
    }

    fn ready_fd(&self, ridx: usize) -> Option<RawFd> {
        self.handle.with(|s| s.ready.get(ridx).copied())
    }
}
