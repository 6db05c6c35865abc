//! `epoll(7)` backend.
//!
//! Registrations are pushed to the kernel immediately, so adding and
//! removing descriptors costs O(1) regardless of how many are watched.
//! After each wait a descriptor-to-result map answers `check_fd` without a
//! scan.

use super::{ensure_slot, timeout_millis, Backend, Interest};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Upper bound on events collected by one wait. Anything beyond stays
/// level-triggered for the next one.
const MAX_EVENTS: usize = 4096;

const READ_MASK: u32 = (libc::EPOLLIN | libc::EPOLLHUP) as u32;
const WRITE_MASK: u32 = (libc::EPOLLOUT | libc::EPOLLHUP) as u32;

pub struct EpollBackend {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
    nready: usize,
    /// Index into `events` for descriptors returned by the last wait.
    ridx_of: Vec<Option<usize>>,
}

impl EpollBackend {
    pub fn new(capacity: usize) -> io::Result<Self> {
        // SAFETY: plain syscall, result checked below.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            // SAFETY: fd is a fresh descriptor owned by nobody else.
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.clamp(1, MAX_EVENTS)],
            nready: 0,
            ridx_of: Vec::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let flags = match interest {
            Interest::Read => libc::EPOLLIN,
            Interest::Write => libc::EPOLLOUT,
        };
        let mut ev = libc::epoll_event {
            events: flags as u32,
            u64: fd as u64,
        };

        // SAFETY: ev is valid for the duration of the call.
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn forget_results(&mut self) {
        for i in 0..self.nready {
            let fd = self.events[i].u64 as usize;
            if let Some(slot) = self.ridx_of.get_mut(fd) {
                *slot = None;
            }
        }
        self.nready = 0;
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        ensure_slot(&mut self.ridx_of, fd, None);
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn del_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if let Some(slot) = self.ridx_of.get_mut(fd as usize) {
            *slot = None;
        }
        self.ctl(libc::EPOLL_CTL_DEL, fd, interest)
    }

    fn watch(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.forget_results();

        // SAFETY: events is a valid buffer of the given length.
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        self.nready = rc as usize;
        for i in 0..self.nready {
            let fd = self.events[i].u64 as RawFd;
            ensure_slot(&mut self.ridx_of, fd, None);
            self.ridx_of[fd as usize] = Some(i);
        }
        Ok(self.nready)
    }

    fn check_fd(&self, fd: RawFd, interest: Interest) -> bool {
        let Some(i) = usize::try_from(fd)
            .ok()
            .and_then(|fd| self.ridx_of.get(fd).copied().flatten())
        else {
            return false;
        };

        // epoll_event is packed on some targets; copy the field out.
        let bits = self.events[i].events;
        if bits & libc::EPOLLERR as u32 != 0 {
            return false;
        }
        match interest {
            Interest::Read => bits & READ_MASK != 0,
            Interest::Write => bits & WRITE_MASK != 0,
        }
    }

    fn ready_fd(&self, ridx: usize) -> Option<RawFd> {
        if ridx >= self.nready {
            return None;
        }
        let fd = self.events[ridx].u64;
        Some(fd as RawFd)
    }
}
