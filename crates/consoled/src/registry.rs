use std::{
    collections::{HashMap, VecDeque},
    time::Instant,
};

use snafu::ensure;
use tracing::debug;

use crate::{
    DomId, Result,
    error::AlreadyPresentSnafu,
    session::{Host, Session},
};

/// Owns every live session, keyed by domain id.
///
/// Iteration runs most-recently-created first. Dead sessions stay in place
/// until [`Registry::reap_dead`] so that a dispatch pass never has an entry
/// vanish underneath it.
#[derive(Default, Debug)]
pub struct Registry {
    sessions: HashMap<DomId, Session>,
    order: VecDeque<DomId>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and insert a session for `domid`.
    pub fn create(
        &mut self,
        domid: DomId,
        host: &mut Host,
        now: Instant,
    ) -> Result<&mut Session> {
        ensure!(
            !self.sessions.contains_key(&domid),
            AlreadyPresentSnafu { domid }
        );
        let session = Session::create(domid, host, now)?;
        self.insert(session)
    }

    /// Insert an already built session.
    pub fn insert(&mut self, session: Session) -> Result<&mut Session> {
        let domid = session.domid();
        ensure!(
            !self.sessions.contains_key(&domid),
            AlreadyPresentSnafu { domid }
        );
        self.order.push_front(domid);
        Ok(self.sessions.entry(domid).or_insert(session))
    }

    #[must_use]
    pub fn lookup(&self, domid: DomId) -> Option<&Session> {
        self.sessions.get(&domid)
    }

    pub fn lookup_mut(&mut self, domid: DomId) -> Option<&mut Session> {
        self.sessions.get_mut(&domid)
    }

    /// Drop the entry for `domid`, if any.
    pub fn remove(&mut self, domid: DomId) -> Option<Session> {
        let session = self.sessions.remove(&domid)?;
        self.order.retain(|id| *id != domid);
        debug!(%domid, "removing domain");
        Some(session)
    }

    /// Snapshot of the ids in iteration order.
    #[must_use]
    pub fn ids(&self) -> Vec<DomId> {
        self.order.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session marked dead, returning their ids.
    pub fn reap_dead(&mut self) -> Vec<DomId> {
        let dead: Vec<DomId> = self
            .iter()
            .filter(|s| s.is_dead())
            .map(Session::domid)
            .collect();
        for id in &dead {
            self.remove(*id);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConsoleError, config::Config, testing::TestHost};

    #[test]
    fn newest_first_and_unique() {
        let mut t = TestHost::new(Config::default());
        let mut reg = Registry::new();
        let now = Instant::now();
        for id in [3, 1, 8] {
            reg.create(DomId(id), &mut t.host, now).unwrap();
        }
        assert_eq!(reg.ids(), vec![DomId(8), DomId(1), DomId(3)]);

        let dup = reg.create(DomId(1), &mut t.host, now);
        assert!(matches!(dup, Err(ConsoleError::AlreadyPresent { .. })));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut t = TestHost::new(Config::default());
        let mut reg = Registry::new();
        reg.create(DomId(2), &mut t.host, Instant::now()).unwrap();

        assert!(reg.remove(DomId(2)).is_some());
        assert!(reg.remove(DomId(2)).is_none());
        assert!(reg.lookup(DomId(2)).is_none());
        assert!(reg.is_empty());
        assert!(reg.ids().is_empty());
    }

    #[test]
    fn reap_takes_only_dead_sessions() {
        let mut t = TestHost::new(Config::default());
        let mut reg = Registry::new();
        let now = Instant::now();
        reg.create(DomId(1), &mut t.host, now).unwrap();
        reg.create(DomId(2), &mut t.host, now).unwrap();

        reg.lookup_mut(DomId(1)).unwrap().shutdown(&mut t.host);
        assert_eq!(reg.reap_dead(), vec![DomId(1)]);
        assert_eq!(reg.ids(), vec![DomId(2)]);
        assert!(reg.reap_dead().is_empty());
    }
}
