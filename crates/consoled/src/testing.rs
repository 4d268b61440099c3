//! In-process stand-ins for the store, the hypervisor and event channels,
//! so sessions and the main loop can run without Xen.
//!
//! Every fake is a cheap handle around shared state: hand one clone to a
//! [`Host`] and keep another to play the guest's part and inspect what the
//! daemon did. Readiness is signalled through real eventfds, so the
//! daemon's poll loop works unchanged.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap, VecDeque},
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    rc::Rc,
};

use rustix::{
    event::{EventfdFlags, eventfd},
    fs::{MemfdFlags, ftruncate, memfd_create},
};

use crate::{
    DomId, Port, Result,
    config::Config,
    doorbell::{Doorbell, DoorbellOpener},
    hypervisor::{DomainInfo, Hypervisor},
    ring::{ConsoleRing, PAGE_SIZE, RingLayout, RingPage},
    session::Host,
    store::{NO_TX, Store, TxId, TxOutcome, WatchEvent},
};

fn new_eventfd() -> Result<OwnedFd> {
    Ok(eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)?)
}

fn signal(fd: &OwnedFd) {
    let _ = rustix::io::write(fd, &1u64.to_ne_bytes());
}

/// Reset the counter; returns whether it had been signalled.
fn drain_eventfd(fd: &OwnedFd) -> bool {
    let mut buf = [0u8; 8];
    matches!(rustix::io::read(fd, &mut buf), Ok(8))
}

// ---------------------------------------------------------------- store

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, Vec<u8>>,
    watches: Vec<(String, String)>,
    queue: VecDeque<WatchEvent>,
    pending_tx: HashMap<TxId, Vec<(String, Option<Vec<u8>>)>>,
    next_tx: TxId,
    conflicts: u32,
}

/// A store whose contents live in a map.
///
/// Watches fire on the watched path and anything below it. Writes made
/// inside a transaction only land on a successful commit.
#[derive(Clone)]
pub struct MemStore {
    state: Rc<RefCell<StoreState>>,
    fd: Rc<OwnedFd>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// # Panics
    /// If no eventfd can be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(StoreState {
                next_tx: 1,
                ..StoreState::default()
            })),
            fd: Rc::new(new_eventfd().expect("eventfd")),
        }
    }

    /// Write a node outside any transaction, firing watches.
    pub fn set(&self, path: &str, value: &str) {
        self.apply(path, Some(value.as_bytes().to_vec()));
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<String> {
        self.state
            .borrow()
            .nodes
            .get(path)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Queue an event for every watch covering `path`.
    pub fn fire(&self, path: &str) {
        let mut st = self.state.borrow_mut();
        let hits: Vec<WatchEvent> = st
            .watches
            .iter()
            .filter(|(watched, _)| covers(watched, path))
            .map(|(_, token)| WatchEvent {
                path: path.to_owned(),
                token: token.clone(),
            })
            .collect();
        if hits.is_empty() {
            return;
        }
        st.queue.extend(hits);
        signal(&self.fd);
    }

    /// Queue an event regardless of registered watches, as a stale watch
    /// firing after removal would.
    pub fn inject_event(&self, path: &str, token: &str) {
        self.state.borrow_mut().queue.push_back(WatchEvent {
            path: path.to_owned(),
            token: token.to_owned(),
        });
        signal(&self.fd);
    }

    /// Make the next `n` commits fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.state.borrow_mut().conflicts = n;
    }

    /// Number of live watches registered under `token`.
    #[must_use]
    pub fn watch_count(&self, token: &str) -> usize {
        self.state
            .borrow()
            .watches
            .iter()
            .filter(|(_, t)| t == token)
            .count()
    }

    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.state.borrow().queue.len()
    }

    fn apply(&self, path: &str, value: Option<Vec<u8>>) {
        {
            let mut st = self.state.borrow_mut();
            match value {
                Some(v) => {
                    st.nodes.insert(path.to_owned(), v);
                }
                None => {
                    let prefix = format!("{path}/");
                    st.nodes
                        .retain(|k, _| k != path && !k.starts_with(&prefix));
                }
            }
        }
        self.fire(path);
    }
}

fn covers(watched: &str, path: &str) -> bool {
    path == watched
        || path
            .strip_prefix(watched)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl AsFd for MemStore {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Store for MemStore {
    fn read(&mut self, _tx: TxId, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.borrow().nodes.get(path).cloned())
    }

    fn write(&mut self, tx: TxId, path: &str, value: &[u8]) -> Result<()> {
        if tx == NO_TX {
            self.apply(path, Some(value.to_vec()));
        } else {
            self.state
                .borrow_mut()
                .pending_tx
                .entry(tx)
                .or_default()
                .push((path.to_owned(), Some(value.to_vec())));
        }
        Ok(())
    }

    fn remove(&mut self, tx: TxId, path: &str) -> Result<()> {
        if tx == NO_TX {
            self.apply(path, None);
        } else {
            self.state
                .borrow_mut()
                .pending_tx
                .entry(tx)
                .or_default()
                .push((path.to_owned(), None));
        }
        Ok(())
    }

    fn list_directory(&mut self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{path}/");
        let mut children: Vec<String> = self
            .state
            .borrow()
            .nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_owned())
            .collect();
        children.dedup();
        Ok(children)
    }

    fn watch(&mut self, path: &str, token: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .watches
            .push((path.to_owned(), token.to_owned()));
        Ok(())
    }

    fn unwatch(&mut self, path: &str, token: &str) -> Result<()> {
        let mut st = self.state.borrow_mut();
        if let Some(i) =
            st.watches.iter().position(|(p, t)| p == path && t == token)
        {
            st.watches.remove(i);
        }
        Ok(())
    }

    fn read_pending_watch(&mut self) -> Result<Option<WatchEvent>> {
        let mut st = self.state.borrow_mut();
        let event = st.queue.pop_front();
        if st.queue.is_empty() {
            drain_eventfd(&self.fd);
        }
        Ok(event)
    }

    fn has_queued_watch(&self) -> bool {
        !self.state.borrow().queue.is_empty()
    }

    fn transaction_start(&mut self) -> Result<TxId> {
        let mut st = self.state.borrow_mut();
        let tx = st.next_tx;
        st.next_tx += 1;
        st.pending_tx.insert(tx, Vec::new());
        Ok(tx)
    }

    fn transaction_end(&mut self, tx: TxId, commit: bool) -> Result<TxOutcome> {
        let writes = {
            let mut st = self.state.borrow_mut();
            let writes = st.pending_tx.remove(&tx).unwrap_or_default();
            if !commit {
                return Ok(TxOutcome::Committed);
            }
            if st.conflicts > 0 {
                st.conflicts -= 1;
                return Ok(TxOutcome::Conflict);
            }
            writes
        };
        for (path, value) in writes {
            self.apply(&path, value);
        }
        Ok(TxOutcome::Committed)
    }

    fn get_domain_path(&mut self, domid: DomId) -> Result<String> {
        Ok(format!("/local/domain/{domid}"))
    }
}

/// Publish ring parameters the way a guest does, under its console
/// subtree.
pub fn publish_console(
    store: &MemStore,
    domid: DomId,
    ring_ref: u64,
    port: Port,
) {
    let base = format!("/local/domain/{domid}/console");
    store.set(&format!("{base}/ring-ref"), &ring_ref.to_string());
    store.set(&format!("{base}/port"), &port.to_string());
}

// ----------------------------------------------------------- hypervisor

#[derive(Default)]
struct HvState {
    domains: BTreeMap<DomId, bool>,
    pages: HashMap<(DomId, u64), Rc<OwnedFd>>,
    console: Vec<u8>,
    fail_queries: bool,
}

/// Domains are entries in a map; guest frames are memfd pages both the
/// daemon and the test can map.
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    state: Rc<RefCell<HvState>>,
}

impl FakeHypervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&self, domid: DomId) {
        self.state.borrow_mut().domains.insert(domid, false);
    }

    pub fn set_dying(&self, domid: DomId) {
        if let Some(dying) = self.state.borrow_mut().domains.get_mut(&domid) {
            *dying = true;
        }
    }

    pub fn remove_domain(&self, domid: DomId) {
        self.state.borrow_mut().domains.remove(&domid);
    }

    /// Make every domain query fail.
    pub fn fail_queries(&self, fail: bool) {
        self.state.borrow_mut().fail_queries = fail;
    }

    /// Append to the hypervisor's own console.
    pub fn console_write(&self, bytes: &[u8]) {
        self.state.borrow_mut().console.extend_from_slice(bytes);
    }

    fn page_fd(&self, domid: DomId, frame: u64) -> Result<Rc<OwnedFd>> {
        let mut st = self.state.borrow_mut();
        if let Some(fd) = st.pages.get(&(domid, frame)) {
            return Ok(Rc::clone(fd));
        }
        let fd = memfd_create("consoled-ring", MemfdFlags::CLOEXEC)?;
        ftruncate(&fd, PAGE_SIZE as u64)?;
        let fd = Rc::new(fd);
        st.pages.insert((domid, frame), Rc::clone(&fd));
        Ok(fd)
    }

    /// The guest's own mapping of one of its frames.
    pub fn guest_ring(
        &self,
        domid: DomId,
        frame: u64,
        layout: RingLayout,
    ) -> Result<ConsoleRing> {
        let fd = self.page_fd(domid, frame)?;
        Ok(ConsoleRing::new(RingPage::from_fd(&*fd)?, layout))
    }
}

impl Hypervisor for FakeHypervisor {
    fn domain_info(&mut self, domid: DomId) -> Result<Option<DomainInfo>> {
        let st = self.state.borrow();
        if st.fail_queries {
            return Err(std::io::Error::from_raw_os_error(libc::EPERM).into());
        }
        Ok(st
            .domains
            .range(domid..)
            .next()
            .map(|(id, dying)| DomainInfo {
                domid: *id,
                dying: *dying,
            }))
    }

    fn map_ring(&mut self, domid: DomId, frame: u64) -> Result<RingPage> {
        let fd = self.page_fd(domid, frame)?;
        RingPage::from_fd(&*fd)
    }

    fn read_console(
        &mut self,
        index: &mut u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let st = self.state.borrow();
        let start = (*index as usize).min(st.console.len());
        let n = buf.len().min(st.console.len() - start);
        buf[..n].copy_from_slice(&st.console[start..start + n]);
        *index += n as u32;
        Ok(n)
    }
}

// ------------------------------------------------------ event channels

struct BellState {
    domid: Option<DomId>,
    remote_port: Port,
    local_port: Port,
    fd: OwnedFd,
    notifies: Cell<u32>,
    unmasks: Cell<u32>,
    closed: Cell<bool>,
}

/// The peer's view of one binding.
#[derive(Clone)]
pub struct BellHandle(Rc<BellState>);

impl BellHandle {
    /// Raise an event as the guest would.
    pub fn kick(&self) {
        signal(&self.0.fd);
    }

    #[must_use]
    pub fn notify_count(&self) -> u32 {
        self.0.notifies.get()
    }

    #[must_use]
    pub fn unmask_count(&self) -> u32 {
        self.0.unmasks.get()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
    }

    #[must_use]
    pub fn remote_port(&self) -> Port {
        self.0.remote_port
    }

    #[must_use]
    pub fn local_port(&self) -> Port {
        self.0.local_port
    }
}

/// Doorbell backed by an eventfd.
pub struct EventfdDoorbell {
    state: Rc<BellState>,
}

impl AsFd for EventfdDoorbell {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.state.fd.as_fd()
    }
}

impl Doorbell for EventfdDoorbell {
    fn local_port(&self) -> Port {
        self.state.local_port
    }

    fn notify(&mut self) -> Result<()> {
        self.state.notifies.set(self.state.notifies.get() + 1);
        Ok(())
    }

    fn pending(&mut self) -> Result<Option<Port>> {
        Ok(drain_eventfd(&self.state.fd).then_some(self.state.local_port))
    }

    fn unmask(&mut self, _port: Port) -> Result<()> {
        self.state.unmasks.set(self.state.unmasks.get() + 1);
        Ok(())
    }
}

impl Drop for EventfdDoorbell {
    fn drop(&mut self) {
        self.state.closed.set(true);
    }
}

#[derive(Default)]
struct EvtchnState {
    next_port: Port,
    bells: Vec<BellHandle>,
    fail_binds: bool,
}

#[derive(Clone, Default)]
pub struct FakeEvtchn {
    state: Rc<RefCell<EvtchnState>>,
}

impl FakeEvtchn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_binds(&self, fail: bool) {
        self.state.borrow_mut().fail_binds = fail;
    }

    /// Every binding ever made for `domid`, oldest first.
    #[must_use]
    pub fn bells_for(&self, domid: DomId) -> Vec<BellHandle> {
        self.state
            .borrow()
            .bells
            .iter()
            .filter(|b| b.0.domid == Some(domid))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn latest(&self, domid: DomId) -> Option<BellHandle> {
        self.bells_for(domid).pop()
    }

    #[must_use]
    pub fn virq_bell(&self) -> Option<BellHandle> {
        self.state
            .borrow()
            .bells
            .iter()
            .rfind(|b| b.0.domid.is_none())
            .cloned()
    }

    /// Bindings not yet dropped.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state
            .borrow()
            .bells
            .iter()
            .filter(|b| !b.is_closed())
            .count()
    }

    fn bind(
        &mut self,
        domid: Option<DomId>,
        remote_port: Port,
    ) -> Result<Box<dyn Doorbell>> {
        let mut st = self.state.borrow_mut();
        if st.fail_binds {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL).into());
        }
        st.next_port += 1;
        let state = Rc::new(BellState {
            domid,
            remote_port,
            local_port: st.next_port,
            fd: new_eventfd()?,
            notifies: Cell::new(0),
            unmasks: Cell::new(0),
            closed: Cell::new(false),
        });
        st.bells.push(BellHandle(Rc::clone(&state)));
        Ok(Box::new(EventfdDoorbell { state }))
    }
}

impl DoorbellOpener for FakeEvtchn {
    fn bind_interdomain(
        &mut self,
        domid: DomId,
        remote_port: Port,
    ) -> Result<Box<dyn Doorbell>> {
        self.bind(Some(domid), remote_port)
    }

    fn bind_virq(&mut self, virq: u32) -> Result<Box<dyn Doorbell>> {
        self.bind(None, virq)
    }
}

// ----------------------------------------------------------------- host

/// A [`Host`] wired to fakes, plus the handles to drive them.
pub struct TestHost {
    pub host: Host,
    pub store: MemStore,
    pub hv: FakeHypervisor,
    pub evtchn: FakeEvtchn,
}

impl TestHost {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = MemStore::new();
        let hv = FakeHypervisor::new();
        let evtchn = FakeEvtchn::new();
        let host = Host {
            store: Box::new(store.clone()),
            hv: Box::new(hv.clone()),
            evtchn: Box::new(evtchn.clone()),
            config,
        };
        Self {
            host,
            store,
            hv,
            evtchn,
        }
    }

    /// The guest's side of a ring the daemon maps for `domid`.
    pub fn guest_ring(&self, domid: DomId, frame: u64) -> Result<ConsoleRing> {
        self.hv
            .guest_ring(domid, frame, self.host.config.ring_layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watches_fire_below_the_watched_path() {
        let mut store = MemStore::new();
        store.watch("/local/domain/3/console", "dom3").unwrap();
        store.set("/local/domain/3/console/port", "4");
        store.set("/local/domain/3/consolex", "no");
        store.set("/local/domain/4/console/port", "no");

        let ev = store.read_pending_watch().unwrap().unwrap();
        assert_eq!(ev.token, "dom3");
        assert_eq!(ev.path, "/local/domain/3/console/port");
        assert!(!store.has_queued_watch());
    }

    #[test]
    fn shared_pages_are_shared() {
        let mut hv = FakeHypervisor::new();
        let guest = hv.guest_ring(DomId(1), 5, RingLayout::XEN).unwrap();
        let page = hv.map_ring(DomId(1), 5).unwrap();
        let host = ConsoleRing::new(page, RingLayout::XEN);
        guest.guest().write(b"hi");
        assert_eq!(host.out_indices(), (2, 0));
    }

    #[test]
    fn doorbell_counts() {
        let mut evtchn = FakeEvtchn::new();
        let mut bell = evtchn.bind_interdomain(DomId(2), 7).unwrap();
        let peer = evtchn.latest(DomId(2)).unwrap();
        assert_eq!(peer.remote_port(), 7);

        assert_eq!(bell.pending().unwrap(), None);
        peer.kick();
        assert_eq!(bell.pending().unwrap(), Some(bell.local_port()));
        bell.notify().unwrap();
        assert_eq!(peer.notify_count(), 1);
        drop(bell);
        assert!(peer.is_closed());
        assert_eq!(evtchn.open_count(), 0);
    }
}
