static HELP_STR_LOG: &str = "
    Which console output to copy into log files. `guest` writes one \
                             guest-<name>.log per domain, `hv` writes the \
                             hypervisor's own console to hypervisor.log. \
                             Example value: \"all\"
";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogMode {
    #[default]
    None,
    Guest,
    Hv,
    All,
}

impl LogMode {
    #[must_use]
    pub fn guest(self) -> bool {
        matches!(self, LogMode::Guest | LogMode::All)
    }

    #[must_use]
    pub fn hv(self) -> bool {
        matches!(self, LogMode::Hv | LogMode::All)
    }
}

#[derive(clap::Parser, Debug)]
#[command(
    name = "consoled",
    version,
    about = "consoled",
    long_about = "Multiplexes the consoles of running Xen guests onto host \
                  pseudo-terminals, optionally logging everything they \
                  print"
)]
pub struct Args {
    #[arg(
        long,
        value_enum,
        value_name = "LOG",
        help = HELP_STR_LOG,
        default_value_t = LogMode::None
    )]
    pub log: LogMode,

    #[arg(
        long,
        value_name = "LOG_DIR",
        help = "Directory for guest and hypervisor logs",
        default_value = "/var/log/xen/console"
    )]
    pub log_dir: String,

    #[arg(
        long,
        short = 'i',
        help = "Stay in the foreground (no double-fork) and log to stderr",
        default_value = "false"
    )]
    pub interactive: bool,

    #[arg(
        long,
        short = 'l',
        value_name = "LOG_PATH",
        help = "Optional daemon log path value. If not provided, logs will \
                placed in <LOG_DIR>/consoled-$PID.log"
    )]
    pub daemon_log_path: Option<String>,

    #[arg(long, short = 'v', help = "Log at debug level")]
    pub verbose: bool,

    #[arg(
        long,
        value_name = "EVENTS",
        help = "Doorbell events a guest may raise per period before it is \
                throttled",
        default_value_t = crate::rate_limit::RATE_LIMIT_ALLOWANCE
    )]
    pub rate_limit_allowance: u32,

    #[arg(
        long,
        value_name = "MS",
        help = "Length of a rate-limit period in milliseconds",
        default_value = "200"
    )]
    pub rate_limit_period_ms: u64,

    #[arg(
        long,
        value_name = "SOCKET_PATH",
        default_value = "/var/run/xenstored/socket"
    )]
    pub xenstore_socket: String,

    #[arg(long, value_name = "DEVICE", default_value = "/dev/xen/xenbus")]
    pub xenstore_device: String,

    #[arg(long, value_name = "DEVICE", default_value = "/dev/xen/privcmd")]
    pub privcmd_device: String,

    #[arg(long, value_name = "DEVICE", default_value = "/dev/xen/evtchn")]
    pub evtchn_device: String,

    #[arg(
        long,
        value_name = "VERSION",
        help = "XEN_SYSCTL_INTERFACE_VERSION of the running hypervisor",
        value_parser = parse_u32_maybe_hex,
        default_value = "0x15"
    )]
    pub sysctl_interface_version: u32,
}

fn parse_u32_maybe_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["consoled"]);
        assert_eq!(args.log, LogMode::None);
        assert!(!args.interactive);
        assert_eq!(args.rate_limit_allowance, 30);
        assert_eq!(args.rate_limit_period_ms, 200);
        assert_eq!(args.sysctl_interface_version, 0x15);
    }

    #[test]
    fn log_modes() {
        let args = Args::parse_from(["consoled", "--log", "all", "-i"]);
        assert!(args.log.guest() && args.log.hv());
        assert!(args.interactive);
        let args = Args::parse_from(["consoled", "--log", "hv"]);
        assert!(!args.log.guest());
    }
}
