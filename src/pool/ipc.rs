//! Line-oriented pipe IO between the caller and its worker processes.
//!
//! Thin wrappers over raw pipe file descriptors with EINTR handling, buffered
//! on both sides. One message per line.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Buffer size for pipe IO.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Owned pipe end implementing `Read`/`Write` with EINTR retry.
pub(crate) struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// `fd` must be open and not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // Pipes have no userspace-visible flush at the fd level.
        Ok(())
    }
}

/// Buffered reader returning one message line at a time.
pub(crate) struct LineReader {
    inner: BufReader<PipeFd>,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            inner: BufReader::with_capacity(PIPE_BUFFER_SIZE, fd),
        }
    }

    /// Read one line without its trailing newline. `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        match self.inner.read_line(&mut line)? {
            0 => Ok(None),
            _ => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
        }
    }
}

/// Buffered writer sending one message line at a time.
pub(crate) struct LineWriter {
    inner: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            inner: BufWriter::with_capacity(PIPE_BUFFER_SIZE, fd),
        }
    }

    /// Write `line` followed by a newline, then flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.inner.write_all(b"\n")?;
        }
        self.inner.flush()
    }
}
