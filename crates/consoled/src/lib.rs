use std::{fmt::Display, ops::Deref, str::FromStr};

pub mod buffer;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod doorbell;
pub mod double_fork;
pub mod error;
pub mod event_loop;
pub mod hv_log;
pub mod hypervisor;
pub mod rate_limit;
pub mod registry;
pub mod ring;
pub mod session;
pub mod signals;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracing_init;
pub mod tty;

// Production backends talk to the Xen device nodes, which only exist on linux
#[cfg(target_os = "linux")]
pub mod xen;

pub use error::{ConsoleError, Result};

/// A guest domain id as the hypervisor numbers them.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomId(pub u32);

impl From<u32> for DomId {
    fn from(value: u32) -> Self {
        DomId(value)
    }
}

impl Deref for DomId {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for DomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DomId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(DomId)
    }
}

/// Event channel port number, local or remote.
pub type Port = u32;
