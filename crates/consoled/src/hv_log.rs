//! Copies the hypervisor's own console into `hypervisor.log`.

use std::{
    fs::File,
    io::Write,
    os::fd::{AsFd, BorrowedFd},
    path::PathBuf,
};

use tracing::{info, warn};

use crate::{
    Result,
    doorbell::{Doorbell, DoorbellOpener, VIRQ_CON_RING},
    hypervisor::Hypervisor,
    session::open_append_log,
};

pub const HV_LOG_NAME: &str = "hypervisor.log";

const READ_CHUNK: usize = 16 * 1024;

pub struct HvLogTap {
    doorbell: Box<dyn Doorbell>,
    /// Rolling index into the hypervisor console ring.
    index: u32,
    path: PathBuf,
    file: Option<File>,
    scratch: Vec<u8>,
}

impl HvLogTap {
    pub fn open(
        evtchn: &mut dyn DoorbellOpener,
        log_dir: &std::path::Path,
    ) -> Result<Self> {
        let path = log_dir.join(HV_LOG_NAME);
        let file = open_append_log(&path)?;
        let doorbell = evtchn.bind_virq(VIRQ_CON_RING)?;
        info!(path = %path.display(), "logging hypervisor console");
        Ok(Self {
            doorbell,
            index: 0,
            path,
            file: Some(file),
            scratch: vec![0; READ_CHUNK],
        })
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Consume the pending notification, copy out everything new and
    /// re-arm.
    pub fn handle(&mut self, hv: &mut dyn Hypervisor) {
        let port = match self.doorbell.pending() {
            Ok(Some(port)) => port,
            Ok(None) => return,
            Err(e) => {
                warn!(errno = ?e.errno(), "hv log doorbell failed: {e}");
                return;
            }
        };

        loop {
            let n = match hv.read_console(&mut self.index, &mut self.scratch) {
                Ok(n) => n,
                Err(e) => {
                    warn!(errno = ?e.errno(), "reading hv console failed: {e}");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            if let Some(file) = self.file.as_mut() {
                if let Err(e) = file.write_all(&self.scratch[..n]) {
                    warn!(path = %self.path.display(), "log write failed: {e}");
                }
            }
            if n < self.scratch.len() {
                break;
            }
        }

        if let Err(e) = self.doorbell.unmask(port) {
            warn!("unmask of hypervisor log doorbell failed: {e}");
        }
    }

    pub fn reopen(&mut self) {
        self.file = None;
        match open_append_log(&self.path) {
            Ok(file) => self.file = Some(file),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    errno = ?e.raw_os_error(),
                    "failed to reopen log: {e}"
                );
            }
        }
    }
}

impl AsFd for HvLogTap {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.doorbell.as_fd()
    }
}
