//! `poll(2)` backend.
//!
//! A dense `pollfd` array with a descriptor-to-index map. Deletion swaps the
//! last record into the hole so the array never has gaps.

use super::{ensure_slot, timeout_millis, Backend, Interest};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const READ_MASK: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLNVAL;
const WRITE_MASK: libc::c_short = libc::POLLOUT | libc::POLLHUP | libc::POLLNVAL;

pub struct PollBackend {
    pollfds: Vec<libc::pollfd>,
    fd_idx: Vec<Option<usize>>,
    ready: Vec<RawFd>,
}

impl PollBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            pollfds: Vec::with_capacity(capacity.min(1024)),
            fd_idx: Vec::new(),
            ready: Vec::new(),
        }
    }

    fn record(&self, fd: RawFd) -> Option<&libc::pollfd> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.fd_idx.get(i).copied().flatten())
            .map(|idx| &self.pollfds[idx])
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn add_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        ensure_slot(&mut self.fd_idx, fd, None);

        let events = match interest {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        };
        self.fd_idx[fd as usize] = Some(self.pollfds.len());
        self.pollfds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        Ok(())
    }

    fn del_fd(&mut self, fd: RawFd, _interest: Interest) -> io::Result<()> {
        let Some(idx) = self.fd_idx.get_mut(fd as usize).and_then(Option::take) else {
            return Ok(());
        };

        self.pollfds.swap_remove(idx);
        if let Some(moved) = self.pollfds.get(idx) {
            self.fd_idx[moved.fd as usize] = Some(idx);
        }
        Ok(())
    }

    fn watch(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.ready.clear();

        // SAFETY: pollfds is a valid array of the given length.
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        if rc > 0 {
            self.ready.extend(
                self.pollfds
                    .iter()
                    .filter(|p| p.revents != 0)
                    .map(|p| p.fd),
            );
        }
        Ok(self.ready.len())
    }

    fn check_fd(&self, fd: RawFd, interest: Interest) -> bool {
        let Some(p) = self.record(fd) else {
            return false;
        };
        if p.revents & libc::POLLERR != 0 {
            return false;
        }
        match interest {
            Interest::Read => p.revents & READ_MASK != 0,
            Interest::Write => p.revents & WRITE_MASK != 0,
        }
    }

    fn ready_fd(&self, ridx: usize) -> Option<RawFd> {
        self.ready.get(ridx).copied()
    }
}
