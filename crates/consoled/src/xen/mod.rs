pub mod evtchn;
pub mod privcmd;
pub mod xenstore;

use std::path::Path;

use tracing::info;

use crate::{Result, cli::Args, config::Config, session::Host};

/// Open the real store, hypervisor and event channel devices.
pub fn connect(args: &Args, config: Config) -> Result<Host> {
    let store = xenstore::XenStore::open(
        Path::new(&args.xenstore_socket),
        Path::new(&args.xenstore_device),
    )?;
    let hv = privcmd::Privcmd::open(
        Path::new(&args.privcmd_device),
        args.sysctl_interface_version,
    )?;
    let evtchn = evtchn::EvtchnDevice::new(&args.evtchn_device);
    info!(
        privcmd = %args.privcmd_device,
        evtchn = %args.evtchn_device,
        "connected to xen"
    );
    Ok(Host {
        store: Box::new(store),
        hv: Box::new(hv),
        evtchn: Box::new(evtchn),
        config,
    })
}
