//! Foreign mappings and sysctl hypercalls through `/dev/xen/privcmd`.

use std::{
    ffi::c_void,
    fs::{File, OpenOptions},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
};

use bytemuck::{Pod, Zeroable};
use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::{
    DomId, Result,
    error::ConsoleError,
    hypervisor::{DomainInfo, Hypervisor},
    ring::{PAGE_SIZE, RingPage},
};

const fn privcmd_ioc(nr: u32, size: usize) -> libc::c_ulong {
    // _IOC(_IOC_NONE, 'P', nr, size)
    ((size as libc::c_ulong) << 16)
        | ((b'P' as libc::c_ulong) << 8)
        | nr as libc::c_ulong
}

const HYPERVISOR_SYSCTL: u64 = 35;
const SYSCTL_READCONSOLE: u32 = 1;
const SYSCTL_GETDOMAININFOLIST: u32 = 6;
const DOMINF_DYING: u32 = 1 << 0;

#[repr(C)]
struct Hypercall {
    op: u64,
    arg: [u64; 5],
}

#[repr(C)]
struct MmapBatchV2 {
    num: u32,
    dom: u16,
    _pad: u16,
    addr: u64,
    arr: *const u64,
    err: *mut libc::c_int,
}

nix::ioctl_write_ptr_bad!(
    ioctl_hypercall,
    privcmd_ioc(0, size_of::<Hypercall>()),
    Hypercall
);
nix::ioctl_write_ptr_bad!(
    ioctl_mmapbatch_v2,
    privcmd_ioc(4, size_of::<MmapBatchV2>()),
    MmapBatchV2
);

/// `struct xen_sysctl`: command header and a 128-byte union.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Sysctl {
    cmd: u32,
    interface_version: u32,
    u: [u64; 16],
}

/// Page-backed memory the hypervisor may read and write during a call.
/// Locked so it cannot be paged out mid-hypercall.
struct HypercallBuffer {
    map: MmapMut,
}

impl HypercallBuffer {
    fn new(len: usize) -> Result<Self> {
        let len = len.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let mut map = MmapMut::map_anon(len)?;
        // SAFETY: the range is exactly our fresh mapping
        unsafe { rustix::mm::mlock(map.as_mut_ptr().cast::<c_void>(), len) }?;
        Ok(Self { map })
    }

    fn addr(&mut self) -> u64 {
        self.map.as_mut_ptr() as u64
    }

    fn bytes(&self) -> &[u8] {
        &self.map
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

impl Drop for HypercallBuffer {
    fn drop(&mut self) {
        // SAFETY: same range that was locked in new()
        let _ = unsafe {
            rustix::mm::munlock(
                self.map.as_mut_ptr().cast::<c_void>(),
                self.map.len(),
            )
        };
    }
}

pub struct Privcmd {
    file: File,
    interface_version: u32,
    sysctl: HypercallBuffer,
    info: HypercallBuffer,
    console: Option<HypercallBuffer>,
}

impl Privcmd {
    pub fn open(path: &Path, interface_version: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self {
            file,
            interface_version,
            sysctl: HypercallBuffer::new(size_of::<Sysctl>())?,
            info: HypercallBuffer::new(PAGE_SIZE)?,
            console: None,
        })
    }

    /// Issue `__HYPERVISOR_sysctl` with `req`, returning what the
    /// hypervisor wrote back.
    fn do_sysctl(&mut self, op: &'static str, req: Sysctl) -> Result<Sysctl> {
        self.sysctl.bytes_mut()[..size_of::<Sysctl>()]
            .copy_from_slice(bytemuck::bytes_of(&req));
        let call = Hypercall {
            op: HYPERVISOR_SYSCTL,
            arg: [self.sysctl.addr(), 0, 0, 0, 0],
        };
        // SAFETY: the argument points at a locked buffer of the right size
        let ret = unsafe { ioctl_hypercall(self.file.as_raw_fd(), &call) };
        match ret {
            Ok(code) if code >= 0 => Ok(bytemuck::pod_read_unaligned(
                &self.sysctl.bytes()[..size_of::<Sysctl>()],
            )),
            Ok(code) => Err(ConsoleError::Hypercall {
                op,
                code: i64::from(code),
            }),
            Err(errno) => Err(ConsoleError::Hypercall {
                op,
                code: -i64::from(errno as i32),
            }),
        }
    }
}

impl Hypervisor for Privcmd {
    fn domain_info(&mut self, domid: DomId) -> Result<Option<DomainInfo>> {
        let Ok(first) = u16::try_from(domid.0) else {
            return Ok(None);
        };
        let mut req = Sysctl::zeroed();
        req.cmd = SYSCTL_GETDOMAININFOLIST;
        req.interface_version = self.interface_version;
        // first_domain:16 pad:16 max_domains:32 | buffer | num_domains
        req.u[0] = u64::from(first) | (1u64 << 32);
        req.u[1] = self.info.addr();

        let reply = self.do_sysctl("getdomaininfolist", req)?;
        if reply.u[2] as u32 == 0 {
            return Ok(None);
        }
        let info = self.info.bytes();
        let found = u16::from_ne_bytes([info[0], info[1]]);
        let flags = u32::from_ne_bytes([info[4], info[5], info[6], info[7]]);
        Ok(Some(DomainInfo {
            domid: DomId(u32::from(found)),
            dying: flags & DOMINF_DYING != 0,
        }))
    }

    fn map_ring(&mut self, domid: DomId, frame: u64) -> Result<RingPage> {
        // SAFETY: privcmd mappings start empty and are populated below
        let mut map = unsafe {
            MmapOptions::new().len(PAGE_SIZE).map_mut(&self.file)?
        };
        let mut err: libc::c_int = 0;
        let batch = MmapBatchV2 {
            num: 1,
            dom: u16::try_from(domid.0).unwrap_or(u16::MAX),
            _pad: 0,
            addr: map.as_mut_ptr() as u64,
            arr: &raw const frame,
            err: &raw mut err,
        };
        // SAFETY: batch points at one frame, one error slot and our mapping
        unsafe { ioctl_mmapbatch_v2(self.file.as_raw_fd(), &batch) }?;
        if err != 0 {
            return Err(ConsoleError::Hypercall {
                op: "mmapbatch",
                code: i64::from(err),
            });
        }
        debug!(%domid, frame, "mapped console frame");
        RingPage::from_map(map)
    }

    fn read_console(
        &mut self,
        index: &mut u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let needs_new = self
            .console
            .as_ref()
            .is_none_or(|b| b.bytes().len() < buf.len());
        if needs_new {
            self.console = Some(HypercallBuffer::new(buf.len())?);
        }
        let Some(console) = self.console.as_mut() else {
            return Ok(0);
        };
        let mut req = Sysctl::zeroed();
        req.cmd = SYSCTL_READCONSOLE;
        req.interface_version = self.interface_version;
        // clear:8 incremental:8 pad:16 index:32 | buffer | count
        req.u[0] = (1u64 << 8) | (u64::from(*index) << 32);
        req.u[1] = console.addr();
        req.u[2] = buf.len() as u64;

        let reply = self.do_sysctl("readconsole", req)?;
        let count = (reply.u[2] as u32 as usize).min(buf.len());
        if let Some(console) = self.console.as_ref() {
            buf[..count].copy_from_slice(&console.bytes()[..count]);
        }
        *index = (reply.u[0] >> 32) as u32;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_sizes() {
        assert_eq!(size_of::<Sysctl>(), 136);
        assert_eq!(size_of::<Hypercall>(), 48);
        assert_eq!(size_of::<MmapBatchV2>(), 32);
        assert_eq!(privcmd_ioc(0, 48), 0x0030_5000);
        assert_eq!(privcmd_ioc(4, 32), 0x0020_5004);
    }
}
