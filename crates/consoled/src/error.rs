use snafu::{Backtrace, Snafu};

use crate::DomId;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum ConsoleError {
    #[snafu(display("I/O error: {source}"))]
    Io {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("system call failed: {source}"))]
    Errno {
        source: nix::errno::Errno,
        backtrace: Backtrace,
    },
    #[snafu(display("Rustix error: {source}"))]
    RustixIo {
        source: rustix::io::Errno,
        backtrace: Backtrace,
    },
    #[snafu(display("store wire error: {source}"))]
    Wire {
        source: xs_wire::WireError,
        backtrace: Backtrace,
    },
    #[snafu(display("store refused {op} on {path}: {reply}"))]
    StoreReply {
        op: &'static str,
        path: String,
        reply: xs_wire::ErrorReply,
    },
    #[snafu(display("store answered {op} with an unexpected reply"))]
    StoreProtocol { op: &'static str },
    #[snafu(display("store key {path} is missing"))]
    MissingKey { path: String },
    #[snafu(display("store key {path} holds unparsable value {value:?}"))]
    BadValue { path: String, value: String },
    #[snafu(display(
        "ring layout in={in_cap} out={out_cap} does not fit a page"
    ))]
    RingLayout { in_cap: u32, out_cap: u32 },
    #[snafu(display("hypercall {op} failed with {code}"))]
    Hypercall { op: &'static str, code: i64 },
    #[snafu(display("domain {domid} already has a session"))]
    AlreadyPresent { domid: DomId },
}

impl From<std::io::Error> for ConsoleError {
    fn from(source: std::io::Error) -> Self {
        ConsoleError::Io {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<nix::errno::Errno> for ConsoleError {
    fn from(source: nix::errno::Errno) -> Self {
        ConsoleError::Errno {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<rustix::io::Errno> for ConsoleError {
    fn from(source: rustix::io::Errno) -> Self {
        ConsoleError::RustixIo {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<xs_wire::WireError> for ConsoleError {
    fn from(source: xs_wire::WireError) -> Self {
        ConsoleError::Wire {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl ConsoleError {
    /// Errno-equivalent detail for log lines.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            ConsoleError::Io { source, .. } => source.raw_os_error(),
            ConsoleError::Errno { source, .. } => Some(*source as i32),
            ConsoleError::RustixIo { source, .. } => {
                Some(source.raw_os_error())
            }
            _ => None,
        }
    }
}

pub type Result<T, E = ConsoleError> = std::result::Result<T, E>;
