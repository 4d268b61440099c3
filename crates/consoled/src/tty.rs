//! Host-side pseudo-terminals handed out to console users.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::{
    fcntl::{FcntlArg, OFlag, fcntl},
    pty::{OpenptyResult, Winsize, openpty},
    sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr},
};
use rustix::io::Errno;

use crate::Result;

/// Outcome of one non-blocking read or write on the master side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtyIo {
    Done(usize),
    /// Nothing to do right now (`EAGAIN`/`EINTR`); not a failure.
    WouldBlock,
    /// The end of the pty went away.
    Closed,
}

/// A raw-mode, non-blocking pty pair. The daemon reads and writes the
/// master; users attach to [`Tty::name`].
pub struct Tty {
    master: OwnedFd,
    // Held so the master does not see a hangup between user sessions.
    _slave: OwnedFd,
    name: String,
}

impl Tty {
    pub fn open() -> Result<Self> {
        let OpenptyResult { master, slave } =
            openpty(None::<&Winsize>, None::<&Termios>)?;

        let mut term = tcgetattr(&master)?;
        cfmakeraw(&mut term);
        tcsetattr(&master, SetArg::TCSAFLUSH, &term)?;

        let flags = fcntl(&master, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(&master, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

        let link = format!("/proc/self/fd/{}", slave.as_raw_fd());
        let name = std::fs::read_link(link)?.to_string_lossy().into_owned();

        Ok(Self {
            master,
            _slave: slave,
            name,
        })
    }

    /// Path of the slave device, e.g. `/dev/pts/4`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close our slave handle so the master sees a hangup once no user
    /// holds the slave open either.
    #[cfg(test)]
    pub(crate) fn hang_up(&mut self) -> Result<()> {
        self._slave = std::fs::File::open("/dev/null")?.into();
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<TtyIo> {
        match rustix::io::read(&self.master, buf) {
            Ok(0) => Ok(TtyIo::Closed),
            Ok(n) => Ok(TtyIo::Done(n)),
            Err(Errno::AGAIN | Errno::INTR) => Ok(TtyIo::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<TtyIo> {
        if buf.is_empty() {
            return Ok(TtyIo::Done(0));
        }
        match rustix::io::write(&self.master, buf) {
            Ok(0) => Ok(TtyIo::Closed),
            Ok(n) => Ok(TtyIo::Done(n)),
            Err(Errno::AGAIN | Errno::INTR) => Ok(TtyIo::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for Tty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

impl std::fmt::Debug for Tty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tty").field("name", &self.name).finish()
    }
}
