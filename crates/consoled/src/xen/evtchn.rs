//! Event channels through `/dev/xen/evtchn`, one open device per binding
//! so that each binding has its own pollable fd.

use std::{
    fs::{File, OpenOptions},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd},
        unix::fs::OpenOptionsExt,
    },
    path::PathBuf,
};

use rustix::io::Errno;

use crate::{
    DomId, Port, Result,
    doorbell::{Doorbell, DoorbellOpener},
};

const fn evtchn_ioc(nr: u32, size: usize) -> libc::c_ulong {
    // _IOC(_IOC_NONE, 'E', nr, size)
    ((size as libc::c_ulong) << 16)
        | ((b'E' as libc::c_ulong) << 8)
        | nr as libc::c_ulong
}

#[repr(C)]
struct BindVirq {
    virq: u32,
}

#[repr(C)]
struct BindInterdomain {
    remote_domain: u32,
    remote_port: u32,
}

#[repr(C)]
struct Notify {
    port: u32,
}

nix::ioctl_write_ptr_bad!(
    ioctl_bind_virq,
    evtchn_ioc(0, size_of::<BindVirq>()),
    BindVirq
);
nix::ioctl_write_ptr_bad!(
    ioctl_bind_interdomain,
    evtchn_ioc(1, size_of::<BindInterdomain>()),
    BindInterdomain
);
nix::ioctl_write_ptr_bad!(
    ioctl_notify,
    evtchn_ioc(4, size_of::<Notify>()),
    Notify
);

/// Opens bindings on the evtchn device at `path`.
pub struct EvtchnDevice {
    path: PathBuf,
}

impl EvtchnDevice {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open_handle(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.path)?)
    }
}

impl DoorbellOpener for EvtchnDevice {
    fn bind_interdomain(
        &mut self,
        domid: DomId,
        remote_port: Port,
    ) -> Result<Box<dyn Doorbell>> {
        let file = self.open_handle()?;
        let req = BindInterdomain {
            remote_domain: domid.0,
            remote_port,
        };
        // SAFETY: req matches struct ioctl_evtchn_bind_interdomain
        let port = unsafe { ioctl_bind_interdomain(file.as_raw_fd(), &req) }?;
        Ok(Box::new(EvtchnBinding {
            file,
            local_port: port as Port,
        }))
    }

    fn bind_virq(&mut self, virq: u32) -> Result<Box<dyn Doorbell>> {
        let file = self.open_handle()?;
        let req = BindVirq { virq };
        // SAFETY: req matches struct ioctl_evtchn_bind_virq
        let port = unsafe { ioctl_bind_virq(file.as_raw_fd(), &req) }?;
        Ok(Box::new(EvtchnBinding {
            file,
            local_port: port as Port,
        }))
    }
}

/// One bound port. Closing the device handle unbinds it.
pub struct EvtchnBinding {
    file: File,
    local_port: Port,
}

impl AsFd for EvtchnBinding {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Doorbell for EvtchnBinding {
    fn local_port(&self) -> Port {
        self.local_port
    }

    fn notify(&mut self) -> Result<()> {
        let req = Notify {
            port: self.local_port,
        };
        // SAFETY: req matches struct ioctl_evtchn_notify
        unsafe { ioctl_notify(self.file.as_raw_fd(), &req) }?;
        Ok(())
    }

    fn pending(&mut self) -> Result<Option<Port>> {
        let mut buf = [0u8; 4];
        match rustix::io::read(&self.file, &mut buf) {
            Ok(4) => Ok(Some(u32::from_ne_bytes(buf))),
            Ok(_) | Err(Errno::AGAIN | Errno::INTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn unmask(&mut self, port: Port) -> Result<()> {
        rustix::io::write(&self.file, &port.to_ne_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_match_the_kernel_header() {
        assert_eq!(evtchn_ioc(0, size_of::<BindVirq>()), 0x0004_4500);
        assert_eq!(evtchn_ioc(1, size_of::<BindInterdomain>()), 0x0008_4501);
        assert_eq!(evtchn_ioc(4, size_of::<Notify>()), 0x0004_4504);
    }
}
