use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::unistd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// The write end is closed (or the descriptor failed).
    Eof,
    /// Nothing available right now on a non-blocking descriptor.
    WouldBlock,
}

/// One bounded read from a non-blocking pipe end.
pub fn read_chunk(fd: BorrowedFd<'_>, buf: &mut [u8]) -> ReadOutcome {
    match unistd::read(fd.as_raw_fd(), buf) {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Data(n),
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => ReadOutcome::WouldBlock,
        Err(_) => ReadOutcome::Eof,
    }
}
