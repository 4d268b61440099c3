//! Doorbells: the event channels bound between this process and a guest
//! (or the hypervisor itself) that say "the ring moved" without polling.

use std::os::fd::AsFd;

use crate::{DomId, Port, Result};

/// `VIRQ_CON_RING`: the hypervisor's own console ring has new output.
pub const VIRQ_CON_RING: u32 = 8;

/// One bound event channel. The fd becomes readable when an event is
/// pending. Closing happens on drop, exactly once.
pub trait Doorbell: AsFd {
    fn local_port(&self) -> Port;

    /// Kick the remote end.
    fn notify(&mut self) -> Result<()>;

    /// Consume one pending event. The port stays masked until
    /// [`Doorbell::unmask`] is called with it.
    fn pending(&mut self) -> Result<Option<Port>>;

    fn unmask(&mut self, port: Port) -> Result<()>;
}

/// Opens new doorbell bindings.
pub trait DoorbellOpener {
    fn bind_interdomain(
        &mut self,
        domid: DomId,
        remote_port: Port,
    ) -> Result<Box<dyn Doorbell>>;

    fn bind_virq(&mut self, virq: u32) -> Result<Box<dyn Doorbell>>;
}
