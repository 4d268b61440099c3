use std::{path::PathBuf, time::Duration};

use crate::{
    cli::Args,
    rate_limit::{RATE_LIMIT_FUZZ, RateLimitConfig},
    ring::RingLayout,
};

/// Runtime settings the daemon core needs, independent of how they were
/// supplied.
#[derive(Clone, Debug)]
pub struct Config {
    pub log_dir: PathBuf,
    pub log_guest: bool,
    pub log_hv: bool,
    pub rate_limit: RateLimitConfig,
    pub ring_layout: RingLayout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/log/xen/console"),
            log_guest: false,
            log_hv: false,
            rate_limit: RateLimitConfig::default(),
            ring_layout: RingLayout::XEN,
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            log_dir: PathBuf::from(&args.log_dir),
            log_guest: args.log.guest(),
            log_hv: args.log.hv(),
            rate_limit: RateLimitConfig {
                // an allowance of 0 would never let a drain through
                allowance: args.rate_limit_allowance.max(1),
                period: Duration::from_millis(args.rate_limit_period_ms.max(1)),
                fuzz: RATE_LIMIT_FUZZ,
            },
            ring_layout: RingLayout::XEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn from_args() {
        let args = Args::parse_from([
            "consoled",
            "--log",
            "guest",
            "--log-dir",
            "/tmp/cons",
            "--rate-limit-allowance",
            "0",
            "--rate-limit-period-ms",
            "50",
        ]);
        let cfg = Config::from(&args);
        assert!(cfg.log_guest);
        assert!(!cfg.log_hv);
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/cons"));
        assert_eq!(cfg.rate_limit.allowance, 1);
        assert_eq!(cfg.rate_limit.period, Duration::from_millis(50));
        assert_eq!(cfg.ring_layout, RingLayout::XEN);
    }
}
