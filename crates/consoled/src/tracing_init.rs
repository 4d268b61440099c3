use std::{fs::OpenOptions, path::PathBuf};

use rustix::process::getpid;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::cli::Args;

/// Where the daemon's own diagnostics go when not interactive.
#[must_use]
pub fn daemon_log_path(args: &Args) -> PathBuf {
    match &args.daemon_log_path {
        Some(path) => PathBuf::from(path),
        None => {
            let pid = getpid();
            PathBuf::from(&args.log_dir).join(format!("consoled-{pid}.log"))
        }
    }
}

pub fn init_tracing(args: &Args) -> std::io::Result<()> {
    let default_level = if args.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if args.interactive {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
        return Ok(());
    }

    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(daemon_log_path(args))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(false),
        )
        .init();
    Ok(())
}
