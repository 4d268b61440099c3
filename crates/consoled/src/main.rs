use clap::Parser;
use consoled::{
    cli::Args, config::Config, double_fork::daemon_double_fork,
    event_loop::Daemon, signals::Signals, tracing_init::init_tracing,
};
use eyre::WrapErr;
use mimalloc::MiMalloc;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    let config = Config::from(&args);

    if !args.interactive {
        daemon_double_fork().wrap_err("failed to daemonize")?;
    }
    init_tracing(&args).wrap_err("could not initialize log")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        log = %args.log,
        "consoled starting"
    );

    let signals =
        Signals::install().wrap_err("failed to install signal handlers")?;
    let host = consoled::xen::connect(&args, config)
        .wrap_err("failed to open xen interfaces")?;
    let mut daemon =
        Daemon::new(host).wrap_err("failed to set up domain watches")?;

    if let Err(e) = daemon.run(&signals) {
        error!(errno = ?e.errno(), "main loop failed: {e}");
        return Err(e).wrap_err("main loop failed");
    }
    info!("consoled exiting");
    Ok(())
}
