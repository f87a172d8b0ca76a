use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd;

use crate::models::options::ProcessOptions;

/// Ends of the standard-stream pipes kept by the parent.
#[derive(Debug, Default)]
pub struct ParentEnds {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Ends handed to the child, plus the null device for streams without a
/// pipe. All of them are numbered above 2 so installing one on a standard
/// descriptor never clobbers another.
#[derive(Debug)]
pub struct ChildEnds {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    pub null: OwnedFd,
}

/// Creates a close-on-exec pipe, returning `(read, write)`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

fn above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() > 2 {
        return Ok(fd);
    }
    let moved = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(3))?;
    Ok(unsafe { OwnedFd::from_raw_fd(moved) })
}

/// Opens the pipes a launch needs: stdin only when requested, stdout and
/// stderr unless detached. On error every descriptor opened so far is
/// closed by drop.
pub fn allocate(options: &ProcessOptions) -> io::Result<(ParentEnds, ChildEnds)> {
    let mut parent = ParentEnds::default();
    let mut child_stdin = None;
    let mut child_stdout = None;
    let mut child_stderr = None;

    if options.stdin {
        let (read, write) = pipe()?;
        child_stdin = Some(above_stdio(read)?);
        parent.stdin = Some(write);
    }
    if !options.detached {
        let (read, write) = pipe()?;
        parent.stdout = Some(read);
        child_stdout = Some(above_stdio(write)?);

        let (read, write) = pipe()?;
        parent.stderr = Some(read);
        child_stderr = Some(above_stdio(write)?);
    }

    // std opens files with O_CLOEXEC
    let null = OwnedFd::from(OpenOptions::new().read(true).write(true).open("/dev/null")?);
    let child = ChildEnds {
        stdin: child_stdin,
        stdout: child_stdout,
        stderr: child_stderr,
        null: above_stdio(null)?,
    };
    Ok((parent, child))
}
