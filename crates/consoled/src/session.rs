//! One guest's console: its ring binding, pty, log file and output buffer.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::{
        fd::{AsFd, BorrowedFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
    time::Instant,
};

use tracing::{debug, error, info, warn};

use crate::{
    DomId, Port, Result,
    buffer::ChannelBuffer,
    config::Config,
    doorbell::{Doorbell, DoorbellOpener},
    hypervisor::Hypervisor,
    rate_limit::RateLimiter,
    ring::{ConsoleRing, Drained},
    store::{
        self, NO_TX, Store, WatchToken, parse_c_ulong, read_string,
        with_transaction,
    },
    tty::{Tty, TtyIo},
};

/// Largest single pty read forwarded into the inbound ring.
pub const TTY_READ_CHUNK: usize = 80;

/// The backend value of `type` this daemon serves.
const OUR_BACKEND: &str = "xenconsoled";

/// Everything outside the daemon that sessions talk to.
pub struct Host {
    pub store: Box<dyn Store>,
    pub hv: Box<dyn Hypervisor>,
    pub evtchn: Box<dyn DoorbellOpener>,
    pub config: Config,
}

/// Where a domain's console keys live in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub domain: String,
    pub console: String,
    pub serial: String,
}

impl StorePaths {
    #[must_use]
    pub fn new(domain_path: &str) -> Self {
        Self {
            domain: domain_path.to_owned(),
            console: format!("{domain_path}/console"),
            serial: format!("{domain_path}/serial/0"),
        }
    }
}

struct RingBinding {
    ring: ConsoleRing,
    ring_ref: u64,
}

struct Channel {
    doorbell: Box<dyn Doorbell>,
    remote_port: Port,
}

pub struct Session {
    domid: DomId,
    paths: StorePaths,
    use_console_path: bool,
    ring: Option<RingBinding>,
    channel: Option<Channel>,
    tty: Option<Tty>,
    log: Option<File>,
    dead: bool,
    buffer: ChannelBuffer,
    limiter: RateLimiter,
}

impl Session {
    /// Register the per-domain watches and bind whatever ring the guest
    /// has already published. Only a watch failure prevents creation.
    pub fn create(domid: DomId, host: &mut Host, now: Instant) -> Result<Self> {
        let domain_path = host.store.get_domain_path(domid)?;
        let paths = StorePaths::new(&domain_path);
        let token = WatchToken::Domain(domid).to_string();

        host.store.watch(&paths.serial, &token)?;
        if let Err(e) = host.store.watch(&paths.console, &token) {
            let _ = host.store.unwatch(&paths.serial, &token);
            return Err(e);
        }

        let mut session = Self {
            domid,
            paths,
            use_console_path: false,
            ring: None,
            channel: None,
            tty: None,
            log: None,
            dead: false,
            buffer: ChannelBuffer::new(0),
            limiter: RateLimiter::new(host.config.rate_limit, now),
        };
        debug!(%domid, "new domain");
        if let Err(e) = session.bind_ring(host) {
            warn!(%domid, errno = ?e.errno(), "ring not bound yet: {e}");
        }
        Ok(session)
    }

    /// Resolve the ring frame and doorbell port from the store and
    /// (re)bind whatever changed. A failed bind leaves the session without
    /// a channel until the next store event for it.
    pub fn bind_ring(&mut self, host: &mut Host) -> Result<()> {
        let store = host.store.as_mut();
        let (ring_ref, remote_port, use_console) =
            match gather_ring(store, &self.paths.serial) {
                Ok((r, p)) => (r, p, false),
                Err(_) => {
                    let (r, p) = gather_ring(store, &self.paths.console)?;
                    (r, p, true)
                }
            };
        self.use_console_path = use_console;

        let type_path = format!("{}/type", self.subtree());
        if let Some(backend) = read_string(store, &type_path)? {
            if backend != OUR_BACKEND {
                debug!(domid = %self.domid, %backend, "not our console");
                return Ok(());
            }
        }

        let same_ring = self.ring_ref() == Some(ring_ref);
        let same_port = self.remote_port() == Some(remote_port);
        if same_ring && same_port {
            return Ok(());
        }

        if !same_ring {
            // unmap before mapping the new frame
            self.ring = None;
            let page = host.hv.map_ring(self.domid, ring_ref)?;
            self.ring = Some(RingBinding {
                ring: ConsoleRing::new(page, host.config.ring_layout),
                ring_ref,
            });
        }

        self.channel = None;
        let doorbell = host.evtchn.bind_interdomain(self.domid, remote_port)?;
        info!(
            domid = %self.domid,
            ring_ref,
            remote_port,
            local_port = doorbell.local_port(),
            "bound console ring"
        );
        self.channel = Some(Channel {
            doorbell,
            remote_port,
        });

        if self.tty.is_none() {
            if let Err(e) = self.open_tty(host) {
                self.channel = None;
                return Err(e);
            }
        }

        if host.config.log_guest && self.log.is_none() {
            self.log = open_guest_log(host, &self.paths);
        }
        Ok(())
    }

    /// Allocate a fresh pty, publish it and pick up the buffer limit.
    pub fn open_tty(&mut self, host: &mut Host) -> Result<()> {
        let tty = Tty::open().inspect_err(|e| {
            error!(
                domid = %self.domid,
                errno = ?e.errno(),
                "failed to create tty: {e}"
            );
        })?;

        let store = host.store.as_mut();
        if self.use_console_path {
            self.read_limit(store, &format!("{}/limit", self.paths.console))?;
        }
        self.read_limit(store, &format!("{}/limit", self.paths.serial))?;

        let serial_tty = format!("{}/tty", self.paths.serial);
        let console_tty = self
            .use_console_path
            .then(|| format!("{}/tty", self.paths.console));
        with_transaction(store, |s, tx| {
            s.write(tx, &serial_tty, tty.name().as_bytes())?;
            if let Some(path) = &console_tty {
                s.write(tx, path, tty.name().as_bytes())?;
            }
            Ok(())
        })?;

        info!(domid = %self.domid, tty = tty.name(), "console tty ready");
        self.tty = Some(tty);
        Ok(())
    }

    fn read_limit(&mut self, store: &mut dyn Store, path: &str) -> Result<()> {
        if let Some(text) = read_string(store, path)? {
            match parse_c_ulong(&text) {
                Some(limit) => {
                    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
                    self.buffer.set_max_capacity(limit);
                }
                None => {
                    warn!(domid = %self.domid, %path, %text, "bad limit");
                }
            }
        }
        Ok(())
    }

    /// Pull everything the guest produced into the buffer, log it, kick
    /// the guest and apply backpressure.
    pub fn drain(&mut self) -> Drained {
        let Some(binding) = &self.ring else {
            return Drained::Empty;
        };
        let before = self.buffer.size();
        let drained = binding.ring.drain_into(&mut self.buffer);
        match drained {
            Drained::Bytes(n) => {
                if let Some(ch) = self.channel.as_mut() {
                    if let Err(e) = ch.doorbell.notify() {
                        warn!(domid = %self.domid, "notify failed: {e}");
                    }
                }
                if let Some(log) = self.log.as_mut() {
                    let fresh = &self.buffer.as_bytes()[before..];
                    if let Err(e) = log.write_all(fresh) {
                        warn!(domid = %self.domid, "log write failed: {e}");
                    }
                }
                let dropped = self.buffer.apply_backpressure();
                if dropped > 0 {
                    debug!(domid = %self.domid, n, dropped, "over limit");
                }
            }
            Drained::Invalid { prod, cons } => {
                warn!(
                    domid = %self.domid,
                    prod,
                    cons,
                    "ring indices out of range, skipping"
                );
            }
            Drained::Empty => {}
        }
        drained
    }

    /// The doorbell fired: consume the event, drain, and re-arm unless the
    /// rate limit has been reached.
    pub fn handle_ring_read(&mut self) {
        let Some(ch) = self.channel.as_mut() else {
            return;
        };
        let port = match ch.doorbell.pending() {
            Ok(Some(port)) => port,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    domid = %self.domid,
                    errno = ?e.errno(),
                    "doorbell read failed: {e}"
                );
                return;
            }
        };
        let armed = self.limiter.record_event();
        self.drain();
        if !armed {
            debug!(domid = %self.domid, "rate limited, doorbell stays masked");
            return;
        }
        if let Some(ch) = self.channel.as_mut() {
            if let Err(e) = ch.doorbell.unmask(port) {
                warn!(domid = %self.domid, "unmask failed: {e}");
            }
        }
    }

    /// Forward user keystrokes into the inbound ring.
    pub fn handle_tty_read(&mut self, host: &mut Host) {
        let (Some(binding), Some(tty)) = (&self.ring, &self.tty) else {
            return;
        };
        let free = binding.ring.free_bytes() as usize;
        if free == 0 {
            return;
        }
        let mut msg = [0u8; TTY_READ_CHUNK];
        let len = free.min(TTY_READ_CHUNK);

        match tty.read(&mut msg[..len]) {
            Ok(TtyIo::WouldBlock) => {}
            Ok(TtyIo::Done(n)) => {
                if !host.hv.is_live(self.domid) {
                    self.shutdown(host);
                    return;
                }
                binding.ring.fill(&msg[..n]);
                if let Some(ch) = self.channel.as_mut() {
                    if let Err(e) = ch.doorbell.notify() {
                        warn!(domid = %self.domid, "notify failed: {e}");
                    }
                }
            }
            Ok(TtyIo::Closed) => {
                debug!(domid = %self.domid, "tty read hit end of file");
                self.on_tty_failure(host);
            }
            Err(e) => {
                debug!(domid = %self.domid, errno = ?e.errno(), "read: {e}");
                self.on_tty_failure(host);
            }
        }
    }

    /// Push buffered guest output to the pty.
    pub fn handle_tty_write(&mut self, host: &mut Host) {
        let Some(tty) = &self.tty else {
            return;
        };
        match tty.write(self.buffer.pending()) {
            Ok(TtyIo::Done(n)) => self.buffer.advance(n),
            Ok(TtyIo::WouldBlock) => {}
            Ok(TtyIo::Closed) => {
                debug!(domid = %self.domid, "tty write accepted nothing");
                self.on_tty_failure(host);
            }
            Err(e) => {
                debug!(domid = %self.domid, errno = ?e.errno(), "write: {e}");
                self.on_tty_failure(host);
            }
        }
    }

    /// Close the pty, then either replace it or, if the guest is gone,
    /// tear the whole session down.
    fn on_tty_failure(&mut self, host: &mut Host) {
        self.tty = None;
        if self.dead {
            return;
        }
        if host.hv.is_live(self.domid) {
            if let Err(e) = self.open_tty(host) {
                warn!(domid = %self.domid, "tty recreation failed: {e}");
            }
        } else {
            self.shutdown(host);
        }
    }

    /// Period rollover; unmasks the doorbell if this session had been
    /// throttled.
    pub fn refill(&mut self, now: Instant) {
        if !self.limiter.refill(now) {
            return;
        }
        if let Some(ch) = self.channel.as_mut() {
            let port = ch.doorbell.local_port();
            if let Err(e) = ch.doorbell.unmask(port) {
                warn!(domid = %self.domid, "unmask failed: {e}");
            }
        }
    }

    /// Close and reopen the guest log, e.g. after rotation.
    pub fn reopen_log(&mut self, host: &mut Host) {
        if !host.config.log_guest || self.dead {
            return;
        }
        self.log = None;
        self.log = open_guest_log(host, &self.paths);
    }

    /// Mark dead, drop the watches and release every held handle. The
    /// registry entry goes away at the end of the loop iteration.
    pub fn shutdown(&mut self, host: &mut Host) {
        if self.dead {
            return;
        }
        info!(domid = %self.domid, "shutting down console");
        self.dead = true;
        let token = WatchToken::Domain(self.domid).to_string();
        for path in [&self.paths.serial, &self.paths.console] {
            if let Err(e) = host.store.unwatch(path, &token) {
                debug!(domid = %self.domid, %path, "unwatch failed: {e}");
            }
        }
        self.release_handles();
    }

    fn release_handles(&mut self) {
        self.ring = None;
        self.channel = None;
        self.tty = None;
        self.log = None;
        self.buffer = ChannelBuffer::new(0);
    }

    #[must_use]
    pub fn domid(&self) -> DomId {
        self.domid
    }

    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    #[must_use]
    pub fn uses_console_path(&self) -> bool {
        self.use_console_path
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.limiter.is_saturated()
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn buffer(&self) -> &ChannelBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn ring(&self) -> Option<&ConsoleRing> {
        self.ring.as_ref().map(|b| &b.ring)
    }

    #[must_use]
    pub fn ring_ref(&self) -> Option<u64> {
        self.ring.as_ref().map(|b| b.ring_ref)
    }

    #[must_use]
    pub fn remote_port(&self) -> Option<Port> {
        self.channel.as_ref().map(|c| c.remote_port)
    }

    #[must_use]
    pub fn local_port(&self) -> Option<Port> {
        self.channel.as_ref().map(|c| c.doorbell.local_port())
    }

    #[must_use]
    pub fn tty(&self) -> Option<&Tty> {
        self.tty.as_ref()
    }

    #[must_use]
    pub fn has_log(&self) -> bool {
        self.log.is_some()
    }

    /// Count of OS-level handles still held (ring, doorbell, pty, log).
    #[must_use]
    pub fn open_handles(&self) -> usize {
        usize::from(self.ring.is_some())
            + usize::from(self.channel.is_some())
            + usize::from(self.tty.is_some())
            + usize::from(self.log.is_some())
    }

    #[must_use]
    pub fn doorbell_fd(&self) -> Option<BorrowedFd<'_>> {
        self.channel.as_ref().map(|c| c.doorbell.as_fd())
    }

    #[must_use]
    pub fn tty_fd(&self) -> Option<BorrowedFd<'_>> {
        self.tty.as_ref().map(AsFd::as_fd)
    }

    /// The pty is worth reading only when the guest has room for input.
    #[must_use]
    pub fn wants_tty_read(&self) -> bool {
        !self.dead
            && self.tty.is_some()
            && self.ring.as_ref().is_some_and(|b| b.ring.free_bytes() > 0)
    }

    #[must_use]
    pub fn wants_tty_write(&self) -> bool {
        !self.dead && self.tty.is_some() && !self.buffer.is_empty()
    }

    fn subtree(&self) -> &str {
        if self.use_console_path {
            &self.paths.console
        } else {
            &self.paths.serial
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("domid", &self.domid)
            .field("dead", &self.dead)
            .field("ring_ref", &self.ring_ref())
            .field("remote_port", &self.remote_port())
            .field("tty", &self.tty)
            .field("buffered", &self.buffer.size())
            .finish_non_exhaustive()
    }
}

fn gather_ring(store: &mut dyn Store, dir: &str) -> Result<(u64, Port)> {
    let ring_ref = store::read_required(store, &format!("{dir}/ring-ref"))?;
    let port = store::read_required(store, &format!("{dir}/port"))?;
    Ok((ring_ref, port))
}

/// Open a log file for appending, creating it with mode 0644.
pub fn open_append_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .open(path)
}

fn open_guest_log(host: &mut Host, paths: &StorePaths) -> Option<File> {
    let name_path = format!("{}/name", paths.domain);
    let name = match host.store.read(NO_TX, &name_path) {
        Ok(Some(name)) if !name.is_empty() => name,
        Ok(_) => {
            warn!(%name_path, "domain has no name, not logging it");
            return None;
        }
        Err(e) => {
            warn!(%name_path, "failed to read domain name: {e}");
            return None;
        }
    };
    let name = String::from_utf8_lossy(&name);
    let path = host.config.log_dir.join(format!("guest-{name}.log"));
    match open_append_log(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            error!(
                path = %path.display(),
                errno = ?e.raw_os_error(),
                "failed to open log: {e}"
            );
            None
        }
    }
}
