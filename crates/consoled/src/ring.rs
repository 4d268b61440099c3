//! The console ring page shared with a guest.
//!
//! One page holds two byte rings and their indices:
//!
//! ```text
//! 0            in_cap        in_cap+out_cap
//! +------------+-------------+---------+---------+----------+----------+
//! | in (h->g)  | out (g->h)  | in_cons | in_prod | out_cons | out_prod |
//! +------------+-------------+---------+---------+----------+----------+
//! ```
//!
//! Indices are free-running `u32` counters; a byte lives at
//! `index % capacity`. This process only ever stores `out_cons` and
//! `in_prod`; the guest owns the other two and they are only loaded.
//! Every index publish is preceded by a release fence so that a peer which
//! sees the new index also sees the bytes behind it, and every peer index
//! load is followed by an acquire fence before the bytes are touched.

use std::{
    os::fd::AsRawFd,
    ptr,
    sync::atomic::{AtomicU32, Ordering, fence},
};

use memmap2::{MmapMut, MmapOptions};
use snafu::ensure;

use crate::{Result, buffer::ChannelBuffer, error::RingLayoutSnafu};

pub const PAGE_SIZE: usize = 4096;

const IDX_SIZE: usize = size_of::<u32>();
const MIN_RING: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    pub in_cap: u32,
    pub out_cap: u32,
}

impl RingLayout {
    /// `struct xencons_interface`: 1 KiB inbound, 2 KiB outbound.
    pub const XEN: RingLayout = RingLayout {
        in_cap: 1024,
        out_cap: 2048,
    };

    /// Same packing as [`RingLayout::XEN`] with other capacities. Both must
    /// be powers of two so that index wrap-around agrees with the modulo.
    pub fn new(in_cap: u32, out_cap: u32) -> Result<Self> {
        let fits = (in_cap as usize + out_cap as usize + 4 * IDX_SIZE)
            <= PAGE_SIZE;
        ensure!(
            in_cap.is_power_of_two()
                && out_cap.is_power_of_two()
                && in_cap >= MIN_RING
                && out_cap >= MIN_RING
                && fits,
            RingLayoutSnafu { in_cap, out_cap }
        );
        Ok(Self { in_cap, out_cap })
    }

    const fn in_off(self) -> usize {
        0
    }

    const fn out_off(self) -> usize {
        self.in_cap as usize
    }

    const fn in_cons_off(self) -> usize {
        (self.in_cap + self.out_cap) as usize
    }

    const fn in_prod_off(self) -> usize {
        self.in_cons_off() + IDX_SIZE
    }

    const fn out_cons_off(self) -> usize {
        self.in_prod_off() + IDX_SIZE
    }

    const fn out_prod_off(self) -> usize {
        self.out_cons_off() + IDX_SIZE
    }
}

/// Bytes between `cons` and `prod`, or `None` when the distance exceeds
/// `cap` (the peer has scribbled over its index).
#[inline]
#[must_use]
pub const fn ring_used(prod: u32, cons: u32, cap: u32) -> Option<u32> {
    let used = prod.wrapping_sub(cons);
    if used > cap { None } else { Some(used) }
}

/// Room left for the producer, or `None` on an out-of-range ring.
#[inline]
#[must_use]
pub const fn ring_free(prod: u32, cons: u32, cap: u32) -> Option<u32> {
    match ring_used(prod, cons, cap) {
        Some(used) => Some(cap - used),
        None => None,
    }
}

/// Offset of `idx` inside a ring of power-of-two capacity `cap`.
#[inline]
#[must_use]
pub const fn mask_index(idx: u32, cap: u32) -> usize {
    (idx & (cap - 1)) as usize
}

/// A mapped ring page. Unmapped on drop.
pub struct RingPage {
    map: MmapMut,
}

impl RingPage {
    pub fn from_map(map: MmapMut) -> Result<Self> {
        if map.len() < PAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "ring mapping shorter than a page",
            )
            .into());
        }
        Ok(Self { map })
    }

    /// A private zeroed page, useful when nobody else needs to see it.
    pub fn anonymous() -> Result<Self> {
        Self::from_map(MmapMut::map_anon(PAGE_SIZE)?)
    }

    /// Map the first page of `fd` shared.
    pub fn from_fd(fd: &impl AsRawFd) -> Result<Self> {
        // SAFETY: the page is treated as racy shared memory throughout;
        // no references into it are handed out.
        let map = unsafe {
            MmapOptions::new().len(PAGE_SIZE).map_mut(fd.as_raw_fd())?
        };
        Self::from_map(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    Empty,
    Bytes(usize),
    /// `prod - cons` exceeded the ring capacity; nothing was copied and
    /// the indices were left alone.
    Invalid { prod: u32, cons: u32 },
}

pub struct ConsoleRing {
    base: *mut u8,
    layout: RingLayout,
    // keeps `base` mapped
    _page: RingPage,
}

impl ConsoleRing {
    #[must_use]
    pub fn new(mut page: RingPage, layout: RingLayout) -> Self {
        let base = page.map.as_mut_ptr();
        Self {
            base,
            layout,
            _page: page,
        }
    }

    #[must_use]
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    #[inline]
    fn index(&self, off: usize) -> &AtomicU32 {
        // SAFETY: offsets come from RingLayout, are 4-byte aligned and lie
        // inside the page, which lives as long as self.
        unsafe { &*self.base.add(off).cast::<AtomicU32>() }
    }

    /// Copy `dst.len()` bytes out of the ring at `base_off`, starting at
    /// free-running index `from`.
    fn copy_from_ring(
        &self,
        base_off: usize,
        cap: u32,
        from: u32,
        dst: &mut [u8],
    ) {
        let start = mask_index(from, cap);
        let first = dst.len().min(cap as usize - start);
        // SAFETY: both chunks stay within [base_off, base_off + cap)
        unsafe {
            let ring = self.base.add(base_off);
            ptr::copy_nonoverlapping(ring.add(start), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(
                ring,
                dst.as_mut_ptr().add(first),
                dst.len() - first,
            );
        }
    }

    fn copy_into_ring(
        &self,
        base_off: usize,
        cap: u32,
        at: u32,
        src: &[u8],
    ) {
        let start = mask_index(at, cap);
        let first = src.len().min(cap as usize - start);
        // SAFETY: both chunks stay within [base_off, base_off + cap)
        unsafe {
            let ring = self.base.add(base_off);
            ptr::copy_nonoverlapping(src.as_ptr(), ring.add(start), first);
            ptr::copy_nonoverlapping(
                src.as_ptr().add(first),
                ring,
                src.len() - first,
            );
        }
    }

    /// `(prod, cons)` of the guest -> host ring.
    #[must_use]
    pub fn out_indices(&self) -> (u32, u32) {
        let l = self.layout;
        (
            self.index(l.out_prod_off()).load(Ordering::Acquire),
            self.index(l.out_cons_off()).load(Ordering::Acquire),
        )
    }

    /// `(prod, cons)` of the host -> guest ring.
    #[must_use]
    pub fn in_indices(&self) -> (u32, u32) {
        let l = self.layout;
        (
            self.index(l.in_prod_off()).load(Ordering::Acquire),
            self.index(l.in_cons_off()).load(Ordering::Acquire),
        )
    }

    /// Move everything the guest has produced into `buf` and publish the
    /// new consumer index. The caller notifies the doorbell.
    pub fn drain_into(&self, buf: &mut ChannelBuffer) -> Drained {
        let l = self.layout;
        let cons = self.index(l.out_cons_off()).load(Ordering::Relaxed);
        let prod = self.index(l.out_prod_off()).load(Ordering::Acquire);
        fence(Ordering::Acquire);

        let Some(used) = ring_used(prod, cons, l.out_cap) else {
            return Drained::Invalid { prod, cons };
        };
        if used == 0 {
            return Drained::Empty;
        }

        let dst = buf.spare(used as usize);
        self.copy_from_ring(l.out_off(), l.out_cap, cons, dst);

        fence(Ordering::Release);
        self.index(l.out_cons_off())
            .store(cons.wrapping_add(used), Ordering::Release);
        Drained::Bytes(used as usize)
    }

    /// Free space in the host -> guest ring; 0 when it is out of range.
    #[must_use]
    pub fn free_bytes(&self) -> u32 {
        let (prod, cons) = self.in_indices();
        ring_free(prod, cons, self.layout.in_cap).unwrap_or(0)
    }

    /// Copy as much of `bytes` as fits into the host -> guest ring and
    /// publish the producer index. Returns the number of bytes accepted.
    pub fn fill(&self, bytes: &[u8]) -> usize {
        let l = self.layout;
        let prod = self.index(l.in_prod_off()).load(Ordering::Relaxed);
        let cons = self.index(l.in_cons_off()).load(Ordering::Acquire);
        fence(Ordering::Acquire);

        let Some(free) = ring_free(prod, cons, l.in_cap) else {
            return 0;
        };
        let n = bytes.len().min(free as usize);
        if n == 0 {
            return 0;
        }
        self.copy_into_ring(l.in_off(), l.in_cap, prod, &bytes[..n]);

        fence(Ordering::Release);
        self.index(l.in_prod_off())
            .store(prod.wrapping_add(n as u32), Ordering::Release);
        n
    }

    /// The guest's half of the protocol over the same page.
    #[cfg(any(test, feature = "testing"))]
    #[must_use]
    pub fn guest(&self) -> GuestEnd<'_> {
        GuestEnd { ring: self }
    }
}

/// Guest-side view of a ring: produces into `out`, consumes from `in`.
///
/// The daemon never uses this; it exists to stand in for a guest kernel
/// when exercising the host side.
#[cfg(any(test, feature = "testing"))]
pub struct GuestEnd<'a> {
    ring: &'a ConsoleRing,
}

#[cfg(any(test, feature = "testing"))]
impl GuestEnd<'_> {
    pub fn write(&self, bytes: &[u8]) -> usize {
        let r = self.ring;
        let l = r.layout;
        let prod = r.index(l.out_prod_off()).load(Ordering::Relaxed);
        let cons = r.index(l.out_cons_off()).load(Ordering::Acquire);
        let Some(free) = ring_free(prod, cons, l.out_cap) else {
            return 0;
        };
        let n = bytes.len().min(free as usize);
        r.copy_into_ring(l.out_off(), l.out_cap, prod, &bytes[..n]);
        fence(Ordering::Release);
        r.index(l.out_prod_off())
            .store(prod.wrapping_add(n as u32), Ordering::Release);
        n
    }

    pub fn read(&self) -> Vec<u8> {
        let r = self.ring;
        let l = r.layout;
        let cons = r.index(l.in_cons_off()).load(Ordering::Relaxed);
        let prod = r.index(l.in_prod_off()).load(Ordering::Acquire);
        fence(Ordering::Acquire);
        let used = ring_used(prod, cons, l.in_cap).unwrap_or(0);
        let mut out = vec![0; used as usize];
        r.copy_from_ring(l.in_off(), l.in_cap, cons, &mut out);
        fence(Ordering::Release);
        r.index(l.in_cons_off())
            .store(cons.wrapping_add(used), Ordering::Release);
        out
    }

    /// Overwrite the outbound indices directly, as a misbehaving guest
    /// could.
    pub fn set_out_indices(&self, prod: u32, cons: u32) {
        let l = self.ring.layout;
        self.ring.index(l.out_prod_off()).store(prod, Ordering::Release);
        self.ring.index(l.out_cons_off()).store(cons, Ordering::Release);
    }

    pub fn set_in_indices(&self, prod: u32, cons: u32) {
        let l = self.ring.layout;
        self.ring.index(l.in_prod_off()).store(prod, Ordering::Release);
        self.ring.index(l.in_cons_off()).store(cons, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(layout: RingLayout) -> ConsoleRing {
        ConsoleRing::new(RingPage::anonymous().unwrap(), layout)
    }

    #[test]
    fn xen_layout_matches_interface() {
        let l = RingLayout::XEN;
        assert_eq!(l.out_off(), 1024);
        assert_eq!(l.in_cons_off(), 3072);
        assert_eq!(l.in_prod_off(), 3076);
        assert_eq!(l.out_cons_off(), 3080);
        assert_eq!(l.out_prod_off(), 3084);
        assert_eq!(RingLayout::new(1024, 2048).unwrap(), l);
    }

    #[test]
    fn layout_rejects_bad_capacities() {
        assert!(RingLayout::new(1000, 2048).is_err());
        assert!(RingLayout::new(2048, 2048).is_err());
        assert!(RingLayout::new(8, 16).is_err());
    }

    #[test]
    fn index_helpers() {
        assert_eq!(ring_used(600, 0, 1024), Some(600));
        assert_eq!(ring_used(1025, 0, 1024), None);
        assert_eq!(ring_used(5, u32::MAX - 2, 1024), Some(8));
        assert_eq!(ring_free(100, 50, 64), Some(14));
        assert_eq!(ring_free(200, 50, 64), None);
        assert_eq!(mask_index(1030, 1024), 6);
    }

    #[test]
    fn drain_copies_in_index_order_across_wrap() {
        let r = ring(RingLayout::new(1024, 1024).unwrap());
        let g = r.guest();
        g.set_out_indices(1000, 1000);
        let data: Vec<u8> = (0..100).collect();
        assert_eq!(g.write(&data), 100);

        let mut buf = ChannelBuffer::new(0);
        assert_eq!(r.drain_into(&mut buf), Drained::Bytes(100));
        assert_eq!(buf.as_bytes(), data.as_slice());
        assert_eq!(r.out_indices(), (1100, 1100));
        assert_eq!(r.drain_into(&mut buf), Drained::Empty);
    }

    #[test]
    fn corrupt_indices_are_not_trusted() {
        let r = ring(RingLayout::XEN);
        r.guest().set_out_indices(5000, 0);
        let mut buf = ChannelBuffer::new(0);
        assert_eq!(
            r.drain_into(&mut buf),
            Drained::Invalid { prod: 5000, cons: 0 }
        );
        assert!(buf.is_empty());
        assert_eq!(r.out_indices(), (5000, 0));

        r.guest().set_in_indices(2000, 0);
        assert_eq!(r.free_bytes(), 0);
        assert_eq!(r.fill(b"abc"), 0);
    }

    #[test]
    fn fill_stops_at_capacity() {
        let r = ring(RingLayout::XEN);
        let big = vec![7u8; 1500];
        assert_eq!(r.fill(&big), 1024);
        assert_eq!(r.free_bytes(), 0);
        assert_eq!(r.fill(b"x"), 0);

        let got = r.guest().read();
        assert_eq!(got.len(), 1024);
        assert_eq!(r.free_bytes(), 1024);
        assert_eq!(r.fill(b"hello"), 5);
        assert_eq!(r.guest().read(), b"hello");
    }
}
