//! `kqueue(2)` backend for the BSDs and macOS.
//!
//! Changes are submitted one at a time as they happen, so the kernel keeps
//! the interest list and nothing is re-sent on each wait.

use super::{ensure_slot, Backend, Interest};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

const MAX_EVENTS: usize = 4096;

pub struct KqueueBackend {
    kq: OwnedFd,
    events: Vec<libc::kevent>,
    nready: usize,
    ridx_of: Vec<Option<usize>>,
}

fn filter_for(interest: Interest) -> i64 {
    match interest {
        Interest::Read => libc::EVFILT_READ as i64,
        Interest::Write => libc::EVFILT_WRITE as i64,
    }
}

impl KqueueBackend {
    pub fn new(capacity: usize) -> io::Result<Self> {
        // SAFETY: plain syscall, result checked below.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: kevent is plain old data; all-zero is a valid value.
        let blank: libc::kevent = unsafe { mem::zeroed() };
        Ok(Self {
            // SAFETY: fd is a fresh descriptor owned by nobody else.
            kq: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![blank; capacity.clamp(1, MAX_EVENTS)],
            nready: 0,
            ridx_of: Vec::new(),
        })
    }

    fn change(&self, fd: RawFd, interest: Interest, flags: u32) -> io::Result<()> {
        // SAFETY: kevent is plain old data; all-zero is a valid value.
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        ev.ident = fd as _;
        ev.filter = filter_for(interest) as _;
        ev.flags = flags as _;

        // SAFETY: one valid change record, no output buffer.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &ev,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn forget_results(&mut self) {
        for i in 0..self.nready {
            let fd = self.events[i].ident as usize;
            if let Some(slot) = self.ridx_of.get_mut(fd) {
                *slot = None;
            }
        }
        self.nready = 0;
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn add_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        ensure_slot(&mut self.ridx_of, fd, None);
        self.change(fd, interest, libc::EV_ADD as u32)
    }

    fn del_fd(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if let Some(slot) = self.ridx_of.get_mut(fd as usize) {
            *slot = None;
        }
        self.change(fd, interest, libc::EV_DELETE as u32)
    }

    fn watch(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.forget_results();

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |ts| ts as *const libc::timespec);

        // SAFETY: events is a valid output buffer of the given length.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as _,
                ts_ptr,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        self.nready = rc as usize;
        for i in 0..self.nready {
            let fd = self.events[i].ident as RawFd;
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

        let ev = &self.events[i];
        if ev.flags as u32 & libc::EV_ERROR as u32 != 0 {
            return false;
        }
        ev.filter as i64 == filter_for(interest)
    }

    fn ready_fd(&self, ridx: usize) -> Option<RawFd> {
        if ridx >= self.nready {
            return None;
        }
        Some(self.events[ridx].ident as RawFd)
    }
}
