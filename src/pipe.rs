//! Pipes used as one-shot barriers between the launcher and a child
//!
//! Nothing is ever written. The waiting side reads until EOF, which arrives
//! once every copy of the write end has been closed. This works even where
//! only `read` and `close` are permitted.

use nix::{errno::Errno, fcntl::OFlag, unistd};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug)]
pub struct WaitablePipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl WaitablePipe {
    pub fn new() -> nix::Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok(unsafe {
            WaitablePipe {
                read: Some(OwnedFd::from_raw_fd(read)),
                write: Some(OwnedFd::from_raw_fd(write)),
            }
        })
    }

    /// Raw `(read, write)` descriptors, for use in a forked child
    ///
    /// Returns -1 for ends that were already closed.
    pub fn raw_fds(&self) -> (RawFd, RawFd) {
        let raw = |fd: &Option<OwnedFd>| fd.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(-1);
        (raw(&self.read), raw(&self.write))
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    /// Block until every other holder of the write end has closed it
    pub fn wait(&mut self) -> nix::Result<()> {
        self.close_write();
        let result = match &self.read {
            Some(fd) => wait_raw(fd.as_raw_fd()),
            None => Err(Errno::EBADF),
        };
        self.close_read();
        result
    }

    /// Release our copies of both ends, waking the waiter once it holds the
    /// last read end
    pub fn signal(&mut self) {
        self.close_read();
        self.close_write();
    }
}

/// Read from `fd` until EOF, retrying interrupted reads
pub fn wait_raw(fd: RawFd) -> nix::Result<()> {
    let mut buf = [0u8; 1];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Close a raw descriptor, ignoring descriptors that are already gone
pub fn close_raw(fd: RawFd) -> nix::Result<()> {
    if fd < 0 {
        return Ok(());
    }
    match unistd::close(fd) {
        Ok(()) | Err(Errno::EBADF) => Ok(()),
        Err(e) => Err(e),
    }
}
