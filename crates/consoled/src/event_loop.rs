//! The single-threaded readiness loop that drives every session.

use std::{
    os::fd::AsFd,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
};
use tracing::{debug, error, info, warn};

use crate::{
    DomId, Result, discovery,
    hv_log::HvLogTap,
    registry::Registry,
    session::Host,
    signals::Signals,
};

/// What a poll entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Store,
    HvLog,
    Doorbell(DomId),
    Tty(DomId, PollFlags),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Shutdown,
}

pub struct Daemon {
    host: Host,
    registry: Registry,
    hv_log: Option<HvLogTap>,
}

impl Daemon {
    /// Watch the domain list, start the hypervisor log tap if configured
    /// and pick up every domain that already exists.
    pub fn new(mut host: Host) -> Result<Self> {
        discovery::watch_domain_list(&mut host)?;

        let hv_log = if host.config.log_hv {
            HvLogTap::open(host.evtchn.as_mut(), &host.config.log_dir)
                .inspect_err(|e| {
                    error!(errno = ?e.errno(), "hypervisor log disabled: {e}");
                })
                .ok()
        } else {
            None
        };

        let mut daemon = Self {
            host,
            registry: Registry::new(),
            hv_log,
        };
        daemon.enumerate();
        Ok(daemon)
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn host_mut(&mut self) -> &mut Host {
        &mut self.host
    }

    #[must_use]
    pub fn hv_log(&self) -> Option<&HvLogTap> {
        self.hv_log.as_ref()
    }

    pub fn enumerate(&mut self) {
        let now = Instant::now();
        discovery::enumerate(&mut self.registry, &mut self.host, now);
    }

    pub fn refill_rate_limits(&mut self, now: Instant) {
        for id in self.registry.ids() {
            if let Some(session) = self.registry.lookup_mut(id) {
                session.refill(now);
            }
        }
    }

    pub fn reload_logs(&mut self) {
        info!("reopening log files");
        for id in self.registry.ids() {
            if let Some(session) = self.registry.lookup_mut(id) {
                session.reopen_log(&mut self.host);
            }
        }
        if let Some(tap) = self.hv_log.as_mut() {
            tap.reopen();
        }
    }

    pub fn reap_dead(&mut self) -> Vec<DomId> {
        self.registry.reap_dead()
    }

    /// One pass of the loop. `wait_cap` bounds the readiness wait on top of
    /// the rate-limit deadline; `None` blocks until something happens.
    pub fn iterate(
        &mut self,
        signals: &Signals,
        wait_cap: Option<Duration>,
    ) -> Result<Step> {
        let now = Instant::now();
        self.refill_rate_limits(now);

        let mut slots = Vec::new();
        let mut fds = Vec::new();
        fds.push(PollFd::new(self.host.store.as_fd(), PollFlags::POLLIN));
        slots.push(Slot::Store);
        if let Some(tap) = &self.hv_log {
            fds.push(PollFd::new(tap.as_fd(), PollFlags::POLLIN));
            slots.push(Slot::HvLog);
        }

        let mut next_period: Option<Instant> = None;
        for session in self.registry.iter() {
            let id = session.domid();
            if session.is_saturated() {
                let due = session.limiter().next_period();
                next_period = Some(next_period.map_or(due, |t| t.min(due)));
            } else if let Some(fd) = session.doorbell_fd() {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                slots.push(Slot::Doorbell(id));
            }

            let Some(fd) = session.tty_fd() else {
                continue;
            };
            let mut events = PollFlags::empty();
            if session.wants_tty_read() {
                events |= PollFlags::POLLIN;
            }
            if session.wants_tty_write() {
                events |= PollFlags::POLLOUT;
            }
            if !events.is_empty() {
                fds.push(PollFd::new(fd, events));
                slots.push(Slot::Tty(id, events));
            }
        }

        let mut timeout = next_period.map(|t| {
            t.saturating_duration_since(now).max(Duration::from_millis(1))
        });
        if self.host.store.has_queued_watch() {
            timeout = Some(Duration::ZERO);
        }
        if let Some(cap) = wait_cap {
            timeout = Some(timeout.map_or(cap, |t| t.min(cap)));
        }

        let polled = poll(&mut fds, poll_timeout(timeout));
        let revents = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()));
        let ready: Vec<(Slot, PollFlags)> = slots
            .into_iter()
            .zip(revents)
            .filter(|(_, revents)| !revents.is_empty())
            .collect();
        drop(fds);

        if signals.take_reload() {
            self.reload_logs();
        }
        match polled {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                return Ok(if signals.is_shutdown() {
                    Step::Shutdown
                } else {
                    Step::Continue
                });
            }
            Err(e) => {
                error!(errno = e as i32, "readiness wait failed: {e}");
                return Err(e.into());
            }
        }
        if signals.is_shutdown() {
            return Ok(Step::Shutdown);
        }

        let is_ready = |want: Slot| ready.iter().any(|(slot, _)| *slot == want);
        if is_ready(Slot::HvLog) {
            if let Some(tap) = self.hv_log.as_mut() {
                tap.handle(self.host.hv.as_mut());
            }
        }
        if is_ready(Slot::Store) || self.host.store.has_queued_watch() {
            discovery::handle_store_event(
                &mut self.registry,
                &mut self.host,
                now,
            );
        }

        for id in self.registry.ids() {
            let Some(session) = self.registry.lookup_mut(id) else {
                continue;
            };
            if !session.is_dead() && is_ready(Slot::Doorbell(id)) {
                session.handle_ring_read();
            }

            let tty_flags = ready.iter().find_map(|(slot, revents)| match slot {
                Slot::Tty(sid, asked) if *sid == id => Some((*asked, *revents)),
                _ => None,
            });
            let Some((asked, revents)) = tty_flags else {
                continue;
            };
            let broken =
                revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR);
            let readable = asked.contains(PollFlags::POLLIN)
                && (revents.contains(PollFlags::POLLIN) || broken);
            let writable = asked.contains(PollFlags::POLLOUT)
                && (revents.contains(PollFlags::POLLOUT) || broken);

            if readable && !session.is_dead() && session.tty().is_some() {
                session.handle_tty_read(&mut self.host);
            }
            if writable && !session.is_dead() && session.tty().is_some() {
                session.handle_tty_write(&mut self.host);
            }
        }

        for id in self.reap_dead() {
            debug!(domid = %id, "session reaped");
        }
        Ok(Step::Continue)
    }

    /// Loop until shutdown is requested or the readiness wait fails.
    pub fn run(&mut self, signals: &Signals) -> Result<()> {
        info!(sessions = self.registry.len(), "entering main loop");
        let result = loop {
            if signals.is_shutdown() {
                break Ok(());
            }
            match self.iterate(signals, None) {
                Ok(Step::Continue) => {}
                Ok(Step::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    /// Tear down every session and the hypervisor log tap.
    pub fn shutdown(&mut self) {
        info!(sessions = self.registry.len(), "shutting down");
        for id in self.registry.ids() {
            if let Some(session) = self.registry.lookup_mut(id) {
                session.shutdown(&mut self.host);
            }
        }
        self.reap_dead();
        if self.hv_log.take().is_some() {
            debug!("hypervisor log tap closed");
        }
        if !self.registry.is_empty() {
            warn!(left = self.registry.len(), "sessions survived shutdown");
        }
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let ms = d.as_micros().div_ceil(1000);
            PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_round_up_and_clamp() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), PollTimeout::ZERO);
        assert_eq!(
            poll_timeout(Some(Duration::from_micros(1500))),
            PollTimeout::from(2u16)
        );
        assert_eq!(
            poll_timeout(Some(Duration::from_secs(3600))),
            PollTimeout::from(u16::MAX)
        );
    }
}
