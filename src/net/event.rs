//! # Poll Infrastructure
//!
//! A small wrapper around `poll(2)` plus a self-pipe used to wake or stop a
//! polling thread.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::Result;

pub const POLLIN: i16 = libc::POLLIN;

/// A byte written to a [`WakePipe`] asking the poller to rebuild its fd set.
pub const WAKE_REBUILD: u8 = 0;

/// A byte written to a [`WakePipe`] asking the poller to exit.
pub const WAKE_STOP: u8 = 1;

/// A reusable `poll(2)` descriptor set.
pub struct EventLoop {
    poll_fds: Vec<libc::pollfd>,
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            poll_fds: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.poll_fds.clear();
    }

    pub fn add_fd(&mut self, fd: RawFd, events: i16) {
        self.poll_fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
    }

    /// Block until at least one registered descriptor is ready (or the
    /// timeout expires; -1 blocks indefinitely). Returns the descriptors
    /// with nonzero result events. EINTR is retried.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<Vec<(RawFd, i16)>> {
        loop {
            let result = unsafe {
                libc::poll(
                    self.poll_fds.as_mut_ptr(),
                    self.poll_fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if result >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err.into());
            }
        }

        let mut events = Vec::new();
        for pfd in &mut self.poll_fds {
            if pfd.revents != 0 {
                events.push((pfd.fd, pfd.revents));
            }
            pfd.revents = 0;
        }
        Ok(events)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// A `pipe(2)` used to interrupt a thread blocked in `poll`.
///
/// Single-byte writes on a pipe are atomic, so any number of threads may
/// [`notify`](WakePipe::notify) concurrently.
pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(WakePipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// The read end, for registering with an [`EventLoop`].
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Write one byte into the pipe.
    pub fn notify(&self, byte: u8) {
        loop {
            let ret = unsafe {
                libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1)
            };
            if ret != -1 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                // a full pipe already guarantees a pending wakeup
                return;
            }
        }
    }

    /// Read one byte from the pipe. Call only after `poll` reported the
    /// read end readable.
    pub fn read_byte(&self) -> Option<u8> {
        let mut byte = 0u8;
        loop {
            let ret = unsafe {
                libc::read(self.read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1)
            };
            if ret == 1 {
                return Some(byte);
            }
            if ret == 0 {
                return None;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return None;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
