//! Keeping the registry in step with the domains that actually exist.

use std::{collections::HashSet, time::Instant};

use tracing::{debug, error, warn};

use crate::{
    DomId, Result,
    registry::Registry,
    session::Host,
    store::{INTRODUCE_DOMAIN, RELEASE_DOMAIN, WatchEvent, WatchToken},
};

/// Register the watches that fire whenever any domain comes or goes.
pub fn watch_domain_list(host: &mut Host) -> Result<()> {
    let token = WatchToken::DomainList.to_string();
    host.store.watch(INTRODUCE_DOMAIN, &token)?;
    host.store.watch(RELEASE_DOMAIN, &token)?;
    Ok(())
}

/// Walk every guest from id 1 upwards. Dying guests lose their session,
/// new ones get one, and sessions whose domain was not reported at all are
/// shut down. Dom0 is never given a session.
pub fn enumerate(registry: &mut Registry, host: &mut Host, now: Instant) {
    let mut seen = HashSet::new();
    let mut next = DomId(1);
    loop {
        let info = match host.hv.domain_info(next) {
            Ok(Some(info)) => info,
            Ok(None) => break,
            Err(e) => {
                // an incomplete walk must not reap anything
                error!(
                    from = %next,
                    errno = ?e.errno(),
                    "domain enumeration failed: {e}"
                );
                return;
            }
        };
        seen.insert(info.domid);

        if info.dying {
            if let Some(session) = registry.lookup_mut(info.domid) {
                session.shutdown(host);
            }
        } else if registry.lookup(info.domid).is_none() {
            if let Err(e) = registry.create(info.domid, host, now) {
                warn!(
                    domid = %info.domid,
                    errno = ?e.errno(),
                    "failed to create session: {e}"
                );
            }
        }
        let Some(following) = info.domid.0.checked_add(1) else {
            break;
        };
        next = DomId(following);
    }

    for id in registry.ids() {
        if seen.contains(&id) {
            continue;
        }
        if let Some(session) = registry.lookup_mut(id) {
            debug!(domid = %id, "domain vanished");
            session.shutdown(host);
        }
    }
}

/// React to one watch firing.
pub fn on_watch(
    registry: &mut Registry,
    host: &mut Host,
    event: &WatchEvent,
    now: Instant,
) {
    match event.token.parse() {
        Ok(WatchToken::DomainList) => enumerate(registry, host, now),
        Ok(WatchToken::Domain(domid)) => {
            // watches can still fire after the session went away
            let Some(session) = registry.lookup_mut(domid) else {
                return;
            };
            if session.is_dead() {
                return;
            }
            if let Err(e) = session.bind_ring(host) {
                debug!(
                    %domid,
                    path = %event.path,
                    errno = ?e.errno(),
                    "rebind failed: {e}"
                );
            }
        }
        Err(()) => {
            warn!(token = %event.token, path = %event.path, "unknown token");
        }
    }
}

/// Process at most one queued store event.
pub fn handle_store_event(
    registry: &mut Registry,
    host: &mut Host,
    now: Instant,
) {
    match host.store.read_pending_watch() {
        Ok(Some(event)) => on_watch(registry, host, &event, now),
        Ok(None) => {}
        Err(e) => warn!(errno = ?e.errno(), "reading store event failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, testing::TestHost};

    #[test]
    fn enumerate_creates_and_reaps() {
        let mut t = TestHost::new(Config::default());
        let mut reg = Registry::new();
        let now = Instant::now();
        t.hv.add_domain(DomId(0));
        t.hv.add_domain(DomId(2));
        t.hv.add_domain(DomId(5));

        enumerate(&mut reg, &mut t.host, now);
        assert_eq!(reg.ids(), vec![DomId(5), DomId(2)]);

        t.hv.set_dying(DomId(5));
        t.hv.remove_domain(DomId(2));
        enumerate(&mut reg, &mut t.host, now);
        assert!(reg.lookup(DomId(5)).unwrap().is_dead());
        assert!(reg.lookup(DomId(2)).unwrap().is_dead());
        assert_eq!(reg.reap_dead().len(), 2);
    }

    #[test]
    fn failed_walk_reaps_nothing() {
        let mut t = TestHost::new(Config::default());
        let mut reg = Registry::new();
        let now = Instant::now();
        t.hv.add_domain(DomId(3));
        enumerate(&mut reg, &mut t.host, now);

        t.hv.fail_queries(true);
        enumerate(&mut reg, &mut t.host, now);
        assert!(!reg.lookup(DomId(3)).unwrap().is_dead());
    }

    #[test]
    fn watch_for_unknown_domain_is_a_noop() {
        let mut t = TestHost::new(Config::default());
        let mut reg = Registry::new();
        let event = WatchEvent {
            path: "/local/domain/42/console".into(),
            token: "dom42".into(),
        };
        on_watch(&mut reg, &mut t.host, &event, Instant::now());
        assert!(reg.is_empty());

        let junk = WatchEvent {
            path: "/x".into(),
            token: "gibberish".into(),
        };
        on_watch(&mut reg, &mut t.host, &junk, Instant::now());
        assert!(reg.is_empty());
    }

    #[test]
    fn domain_list_token_enumerates() {
        let mut t = TestHost::new(Config::default());
        let mut reg = Registry::new();
        watch_domain_list(&mut t.host).unwrap();
        t.hv.add_domain(DomId(7));

        t.store.fire(INTRODUCE_DOMAIN);
        handle_store_event(&mut reg, &mut t.host, Instant::now());
        assert!(reg.lookup(DomId(7)).is_some());
    }
}
