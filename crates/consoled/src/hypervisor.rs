use tracing::warn;

use crate::{DomId, Result, ring::RingPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub domid: DomId,
    pub dying: bool,
}

/// What the daemon needs from the hypervisor.
pub trait Hypervisor {
    /// Information about the first existing domain whose id is `>= domid`,
    /// or `None` past the last one.
    fn domain_info(&mut self, domid: DomId) -> Result<Option<DomainInfo>>;

    /// Map the guest frame holding a console ring.
    fn map_ring(&mut self, domid: DomId, frame: u64) -> Result<RingPage>;

    /// Copy hypervisor console output past `*index` into `buf`, advancing
    /// `*index` by the amount returned.
    fn read_console(&mut self, index: &mut u32, buf: &mut [u8])
    -> Result<usize>;

    /// Whether `domid` itself still exists. A failed query counts as gone.
    fn is_live(&mut self, domid: DomId) -> bool {
        match self.domain_info(domid) {
            Ok(info) => info.is_some_and(|i| i.domid == domid),
            Err(e) => {
                warn!(%domid, "domain query failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHypervisor;

    #[test]
    fn liveness_needs_exact_id() {
        let mut hv = FakeHypervisor::new();
        hv.add_domain(DomId(3));
        hv.add_domain(DomId(7));

        assert!(hv.is_live(DomId(3)));
        // 4 would be answered with domain 7
        assert!(!hv.is_live(DomId(4)));
        assert_eq!(
            hv.domain_info(DomId(4)).unwrap(),
            Some(DomainInfo {
                domid: DomId(7),
                dying: false
            })
        );
        assert_eq!(hv.domain_info(DomId(8)).unwrap(), None);
    }
}
