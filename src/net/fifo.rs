//! # FIFO Endpoints
//!
//! [`InFifo`] and [`OutFifo`] wrap the read and write ends of a named pipe,
//! the local byte-stream endpoints of a channel. Both are opened
//! non-blocking and expose their descriptor for poll-based monitoring.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Once;

use crate::error::{CommsError, Result};

static SIGPIPE_IGNORED: Once = Once::new();

/// Writing to a pipe whose read end is closed raises SIGPIPE, which would
/// kill the process; we want such writes to fail with EPIPE instead. Done
/// once, process-wide.
fn ignore_sigpipe() {
    SIGPIPE_IGNORED.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

enum FifoMode {
    Read,
    Write,
}

/// Open the FIFO at `path` for non-blocking reading or writing, creating it
/// first if there is no file at the path.
///
/// The returned descriptor is always verified (before and after the open)
/// to really refer to a FIFO, so a regular file or socket squatting on the
/// path is a startup error rather than a silent misdirection of traffic.
fn open_fifo(path: &str, mode: FifoMode) -> Result<RawFd> {
    let cpath = CString::new(path)
        .map_err(|_| CommsError::Startup(format!("bad FIFO path: {}", path)))?;

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::stat(cpath.as_ptr(), &mut stat) };
    if res == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            // owner rw, group/other r
            if unsafe { libc::mkfifo(cpath.as_ptr(), 0o644) } == -1 {
                return Err(CommsError::Startup(format!(
                    "could not create FIFO at {}: {}",
                    path,
                    io::Error::last_os_error()
                )));
            }
        } else {
            return Err(CommsError::Startup(format!(
                "could not stat file at {}: {}",
                path, err
            )));
        }
    } else if stat.st_mode & libc::S_IFMT != libc::S_IFIFO {
        return Err(CommsError::Startup(format!("{} is not a FIFO", path)));
    }

    let flags = match mode {
        FifoMode::Read => libc::O_RDONLY | libc::O_NONBLOCK,
        FifoMode::Write => libc::O_WRONLY | libc::O_NONBLOCK,
    };
    let fd = loop {
        let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
        if fd != -1 {
            break fd;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(CommsError::Startup(format!(
                "could not open {}: {}",
                path, err
            )));
        }
    };

    // the path could have been swapped between the stat and the open
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } == -1 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(CommsError::Startup(format!(
            "could not stat file at {}: {}",
            path, err
        )));
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFIFO {
        unsafe { libc::close(fd) };
        return Err(CommsError::Startup(format!("{} is not a FIFO", path)));
    }

    Ok(fd)
}

/// Whether `fd` has data ready to read, without consuming anything.
pub fn fd_readable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let res = unsafe { libc::poll(&mut pfd, 1, 0) };
    res > 0 && pfd.revents & libc::POLLIN != 0
}

/// Read end of a channel's inbound FIFO (user bytes headed into the tunnel).
///
/// A second, never-used write descriptor on the same FIFO is held open for
/// the whole lifetime. Without it, a writer opening, writing and closing
/// would leave the FIFO "disconnected" and `poll` would report POLLHUP
/// immediately instead of waiting for the next writer.
pub struct InFifo {
    fd: RawFd,
    write_fd: RawFd,
    path: String,
    read_buf: Vec<u8>,
}

impl InFifo {
    pub fn new(path: &str) -> Result<Self> {
        let fd = open_fifo(path, FifoMode::Read)?;
        let write_fd = match open_fifo(path, FifoMode::Write) {
            Ok(fd2) => fd2,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        Ok(InFifo {
            fd,
            write_fd,
            path: path.to_string(),
            read_buf: Vec::new(),
        })
    }

    /// Read up to `count` bytes without blocking. An empty result means the
    /// FIFO is empty (or its write end is closed).
    pub fn read(&mut self, count: usize) -> Result<Vec<u8>> {
        if self.read_buf.len() < count {
            self.read_buf.resize(count, 0);
        }

        let mut total = 0usize;
        while total < count {
            let ret = unsafe {
                libc::read(
                    self.fd,
                    self.read_buf[total..].as_mut_ptr() as *mut libc::c_void,
                    count - total,
                )
            };
            if ret == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    // nothing more waiting in the FIFO
                    Some(libc::EAGAIN) => break,
                    _ => {
                        return Err(CommsError::Io(io::Error::new(
                            err.kind(),
                            format!("error reading from fifo {}: {}", self.path, err),
                        )));
                    }
                }
            }
            if ret == 0 {
                // end-of-file: the write end is closed
                break;
            }
            total += ret as usize;
        }

        Ok(self.read_buf[..total].to_vec())
    }

    /// Whether a read would return data right now.
    pub fn has_data(&self) -> bool {
        fd_readable(self.fd)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for InFifo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
            libc::close(self.write_fd);
        }
    }
}

/// Write end of a channel's outbound FIFO (tunnel bytes headed to the user).
pub struct OutFifo {
    fd: RawFd,
    path: String,
}

impl OutFifo {
    /// POSIX refuses to open a FIFO for writing with no reader, so the FIFO
    /// is first opened for reading, then for writing, and the read
    /// descriptor closed again.
    pub fn new(path: &str) -> Result<Self> {
        ignore_sigpipe();

        let read_fd = open_fifo(path, FifoMode::Read)?;
        let fd = open_fifo(path, FifoMode::Write);
        unsafe { libc::close(read_fd) };
        let fd = fd?;

        Ok(OutFifo {
            fd,
            path: path.to_string(),
        })
    }

    /// Best-effort write of `data`.
    ///
    /// Returns how many bytes were written, and whether a broken pipe was
    /// detected (the read end is closed; a caller may want to retry later).
    /// A full FIFO simply stops the write short.
    pub fn write(&self, data: &[u8]) -> Result<(usize, bool)> {
        let mut total = 0usize;
        while total < data.len() {
            let ret = unsafe {
                libc::write(
                    self.fd,
                    data[total..].as_ptr() as *const libc::c_void,
                    data.len() - total,
                )
            };
            if ret == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EPIPE) => return Ok((total, true)),
                    // EAGAIN: the pipe is full
                    Some(libc::EAGAIN) => break,
                    _ => {
                        return Err(CommsError::Io(io::Error::new(
                            err.kind(),
                            format!("error writing to fifo {}: {}", self.path, err),
                        )));
                    }
                }
            }
            total += ret as usize;
        }
        Ok((total, false))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for OutFifo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::{Read, Write};
    use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};

    fn fifo_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn test_in_fifo_creates_pipe_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "in");
        let _fifo = InFifo::new(&path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn test_in_fifo_reads_what_a_writer_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "in");
        let mut fifo = InFifo::new(&path).unwrap();

        assert!(!fifo.has_data());
        assert!(fifo.read(128).unwrap().is_empty());

        let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"user payload").unwrap();
        drop(writer);

        assert!(fifo.has_data());
        assert_eq!(fifo.read(128).unwrap(), b"user payload");
        assert!(fifo.read(128).unwrap().is_empty());
    }

    #[test]
    fn test_in_fifo_read_respects_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "in");
        let mut fifo = InFifo::new(&path).unwrap();

        let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"0123456789").unwrap();

        assert_eq!(fifo.read(4).unwrap(), b"0123");
        assert_eq!(fifo.read(4).unwrap(), b"4567");
        assert_eq!(fifo.read(4).unwrap(), b"89");
    }

    #[test]
    fn test_in_fifo_survives_writer_churn() {
        // without the held-open write descriptor this poll would report
        // POLLHUP forever once the first writer left
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "in");
        let mut fifo = InFifo::new(&path).unwrap();

        for round in 0..3 {
            let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
            writer.write_all(b"x").unwrap();
            drop(writer);
            assert_eq!(fifo.read(8).unwrap(), b"x", "round {}", round);
        }
    }

    #[test]
    fn test_out_fifo_delivers_to_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "out");
        let fifo = OutFifo::new(&path).unwrap();

        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();

        let (written, broken) = fifo.write(b"tunnel output").unwrap();
        assert_eq!(written, 13);
        assert!(!broken);

        let mut buf = [0u8; 32];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"tunnel output");
    }

    #[test]
    fn test_out_fifo_reports_broken_pipe_without_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "out");
        let fifo = OutFifo::new(&path).unwrap();

        // no reader attached: the write must fail with broken = true, and
        // must not kill the process with SIGPIPE
        let (written, broken) = fifo.write(b"nobody listening").unwrap();
        assert_eq!(written, 0);
        assert!(broken);
    }

    #[test]
    fn test_non_fifo_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_path(&dir, "plain");
        std::fs::write(&path, b"regular file").unwrap();

        assert!(matches!(InFifo::new(&path), Err(CommsError::Startup(_))));
        assert!(matches!(OutFifo::new(&path), Err(CommsError::Startup(_))));
    }
}
