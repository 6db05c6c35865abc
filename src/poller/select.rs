//! `select(2)` backend.
//!
//! Keeps master read/write `fd_set`s plus a dense array of active
//! descriptors. Deleting swaps the last active descriptor into the freed
//! slot; the highest descriptor is recomputed lazily before the next watch.

use super::{ensure_slot, Backend, Interest};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

fn empty_set() -> libc::fd_set {
    let mut set = MaybeUninit::<libc::fd_set>::uninit();
    // SAFETY: FD_ZERO fully initializes the set.
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

pub struct SelectBackend {
    master_read: libc::fd_set,
    master_write: libc::fd_set,
    working_read: libc::fd_set,
    working_write: libc::fd_set,
    /// Active descriptors, dense.
    fds: Vec<RawFd>,
    /// Position of each descriptor in `fds`.
    fd_idx: Vec<Option<usize>>,
    maxfd: RawFd,
    maxfd_changed: bool,
    ready: Vec<RawFd>,
}

impl SelectBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            master_read: empty_set(),
            master_write: empty_set(),
            working_read: empty_set(),
            working_write: empty_set(),
            fds: Vec::with_capacity(capacity.min(libc::FD_SETSIZE as usize)),
            fd_idx: Vec::new(),
            maxfd: -1,
            maxfd_changed: false,
            ready: Vec::new(),
        }
    }

    fn check_range(fd: RawFd) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} does not fit in an fd_set"),
            ));
        }
        Ok(())
    }

    fn recompute_maxfd(&mut self) {
        self.maxfd = self.fds.iter().copied().max().unwrap_or(-1);
        self.maxfd_changed = false;
    }
}

impl Backend for SelectBackend {
    fn name(&self) -> &'static str {
        "select"
    }

    fn add_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        Self::check_range(fd)?;
        ensure_slot(&mut self.fd_idx, fd, None);

        self.fd_idx[fd as usize] = Some(self.fds.len());
        self.fds.push(fd);
        if fd > self.maxfd {
            self.maxfd = fd;
        }

        // SAFETY: fd is within FD_SETSIZE and the sets are initialized.
        unsafe {
            match interest {
                Interest::Read => libc::FD_SET(fd, &mut self.master_read),
                Interest::Write => libc::FD_SET(fd, &mut self.master_write),
            }
        }
        Ok(())
    }

    fn del_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        Self::check_range(fd)?;

        if let Some(idx) = self.fd_idx.get_mut(fd as usize).and_then(Option::take) {
            self.fds.swap_remove(idx);
            if let Some(&moved) = self.fds.get(idx) {
                self.fd_idx[moved as usize] = Some(idx);
            }
        }
        if fd >= self.maxfd {
            self.maxfd_changed = true;
        }

        // SAFETY: fd is within FD_SETSIZE and the sets are initialized.
        unsafe {
            match interest {
                Interest::Read => libc::FD_CLR(fd, &mut self.master_read),
                Interest::Write => libc::FD_CLR(fd, &mut self.master_write),
            }
        }
        Ok(())
    }

    fn watch(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if self.maxfd_changed {
            self.recompute_maxfd();
        }

        self.working_read = self.master_read;
        self.working_write = self.master_write;
        self.ready.clear();

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(ptr::null_mut(), |tv| tv as *mut libc::timeval);

        // SAFETY: the working sets are initialized and outlive the call.
        let rc = unsafe {
            libc::select(
                self.maxfd + 1,
                &mut self.working_read,
                &mut self.working_write,
                ptr::null_mut(),
                tv_ptr,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        for &fd in &self.fds {
            // SAFETY: every active fd is within FD_SETSIZE.
            let hit = unsafe {
                libc::FD_ISSET(fd, &self.working_read) || libc::FD_ISSET(fd, &self.working_write)
            };
            if hit {
                self.ready.push(fd);
            }
        }
        Ok(self.ready.len())
    }

    fn check_fd(&self, fd: RawFd, interest: Interest) -> bool {
        if Self::check_range(fd).is_err() {
            return false;
        }
        // SAFETY: fd is within FD_SETSIZE.
        unsafe {
            match interest {
                Interest::Read => libc::FD_ISSET(fd, &self.working_read),
                Interest::Write => libc::FD_ISSET(fd, &self.working_write),
            }
        }
    }

    fn ready_fd(&self, ridx: usize) -> Option<RawFd> {
        self.ready.get(ridx).copied()
    }
}
