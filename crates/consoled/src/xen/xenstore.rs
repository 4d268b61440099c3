//! Synchronous client for xenstored.
//!
//! Requests are written whole and the next non-event reply is taken as
//! the answer. Watch events that arrive in between are parked in a queue
//! so the main loop still sees them.

use std::{
    collections::VecDeque,
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::net::UnixStream,
    },
    path::Path,
};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use rustix::io::Errno;
use snafu::ensure;
use tracing::{debug, warn};
use xs_wire::{Decoder, Message, MsgType};

use crate::{
    DomId, Result,
    error::{ConsoleError, StoreProtocolSnafu},
    store::{Store, TxId, TxOutcome, WatchEvent},
};

pub struct XenStore {
    fd: OwnedFd,
    decoder: Decoder,
    queued: VecDeque<WatchEvent>,
    next_req: u32,
}

impl XenStore {
    /// Connect to the daemon socket, falling back to the kernel device.
    pub fn open(socket: &Path, device: &Path) -> Result<Self> {
        let fd = match UnixStream::connect(socket) {
            Ok(stream) => OwnedFd::from(stream),
            Err(e) => {
                debug!(
                    socket = %socket.display(),
                    device = %device.display(),
                    "store socket unavailable, using device: {e}"
                );
                OwnedFd::from(
                    std::fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(device)?,
                )
            }
        };
        Ok(Self::from_fd(fd))
    }

    /// Speak the protocol over an already connected stream.
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            decoder: Decoder::new(),
            queued: VecDeque::new(),
            next_req: 0,
        }
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.encode();
        let mut sent = 0;
        while sent < bytes.len() {
            match rustix::io::write(&self.fd, &bytes[sent..]) {
                Ok(n) => sent += n,
                Err(Errno::INTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// One read's worth of bytes into the decoder.
    fn fill(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(0) => {
                    return Err(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )
                    .into());
                }
                Ok(n) => {
                    self.decoder.feed(&buf[..n]);
                    return Ok(());
                }
                Err(Errno::INTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn next_message(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(msg);
            }
            self.fill()?;
        }
    }

    fn park_event(&mut self, msg: &Message) {
        match msg.watch_event() {
            Ok((path, token)) => {
                self.queued.push_back(WatchEvent { path, token });
            }
            Err(e) => warn!("dropping malformed watch event: {e}"),
        }
    }

    /// Send a request and wait for its reply. Error replies become
    /// [`ConsoleError::StoreReply`].
    fn call(
        &mut self,
        op: &'static str,
        path: &str,
        msg_type: MsgType,
        tx: TxId,
        parts: &[&[u8]],
    ) -> Result<Message> {
        let req = Message::request(msg_type, self.bump_req(), tx, parts)?;
        self.exchange(op, path, &req)
    }

    fn exchange(
        &mut self,
        op: &'static str,
        path: &str,
        req: &Message,
    ) -> Result<Message> {
        self.send(req)?;
        let reply = loop {
            let msg = self.next_message()?;
            if msg.msg_type == MsgType::WatchEvent {
                self.park_event(&msg);
                continue;
            }
            // left over from a call that failed on a bad frame
            if msg.req_id != req.req_id {
                warn!(
                    msg_type = ?msg.msg_type,
                    req_id = msg.req_id,
                    "dropping stale store reply"
                );
                continue;
            }
            break msg;
        };
        if let Some(reply) = reply.error_reply() {
            return Err(ConsoleError::StoreReply {
                op,
                path: path.to_owned(),
                reply,
            });
        }
        ensure!(reply.msg_type == req.msg_type, StoreProtocolSnafu { op });
        Ok(reply)
    }

    fn bump_req(&mut self) -> u32 {
        self.next_req = self.next_req.wrapping_add(1);
        self.next_req
    }

    fn readable_now(&self) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::ZERO)?;
        Ok(n > 0)
    }
}

fn missing_is_none<T>(res: Result<T>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(ConsoleError::StoreReply { reply, .. }) if reply.is_noent() => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl AsFd for XenStore {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Store for XenStore {
    fn read(&mut self, tx: TxId, path: &str) -> Result<Option<Vec<u8>>> {
        let reply =
            self.call("read", path, MsgType::Read, tx, &[path.as_bytes()]);
        Ok(missing_is_none(reply)?.map(|m| m.payload))
    }

    fn write(&mut self, tx: TxId, path: &str, value: &[u8]) -> Result<()> {
        let req = Message::write(self.bump_req(), tx, path, value)?;
        self.exchange("write", path, &req)?;
        Ok(())
    }

    fn remove(&mut self, tx: TxId, path: &str) -> Result<()> {
        let reply = self.call("rm", path, MsgType::Rm, tx, &[path.as_bytes()]);
        missing_is_none(reply)?;
        Ok(())
    }

    fn list_directory(&mut self, path: &str) -> Result<Vec<String>> {
        let reply = self.call(
            "directory",
            path,
            MsgType::Directory,
            xs_wire::NO_TX,
            &[path.as_bytes()],
        );
        let Some(reply) = missing_is_none(reply)? else {
            return Ok(Vec::new());
        };
        Ok(reply
            .fields()
            .into_iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect())
    }

    fn watch(&mut self, path: &str, token: &str) -> Result<()> {
        self.call(
            "watch",
            path,
            MsgType::Watch,
            xs_wire::NO_TX,
            &[path.as_bytes(), token.as_bytes()],
        )?;
        Ok(())
    }

    fn unwatch(&mut self, path: &str, token: &str) -> Result<()> {
        self.call(
            "unwatch",
            path,
            MsgType::Unwatch,
            xs_wire::NO_TX,
            &[path.as_bytes(), token.as_bytes()],
        )?;
        Ok(())
    }

    fn read_pending_watch(&mut self) -> Result<Option<WatchEvent>> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(event));
        }
        if self.decoder.wanted() > 0 && self.readable_now()? {
            self.fill()?;
        }
        loop {
            match self.decoder.next_message() {
                Ok(Some(msg)) if msg.msg_type == MsgType::WatchEvent => {
                    self.park_event(&msg);
                }
                Ok(Some(msg)) => {
                    warn!(
                        msg_type = ?msg.msg_type,
                        req_id = msg.req_id,
                        "unsolicited store reply"
                    );
                }
                Ok(None) => break,
                Err(e) => warn!("skipping bad store frame: {e}"),
            }
        }
        Ok(self.queued.pop_front())
    }

    fn has_queued_watch(&self) -> bool {
        !self.queued.is_empty() || self.decoder.wanted() == 0
    }

    fn transaction_start(&mut self) -> Result<TxId> {
        let reply = self.call(
            "transaction_start",
            "",
            MsgType::TransactionStart,
            xs_wire::NO_TX,
            &[b""],
        )?;
        let text = reply.text()?;
        text.parse().map_err(|_| ConsoleError::BadValue {
            path: "transaction id".to_owned(),
            value: text.to_owned(),
        })
    }

    fn transaction_end(&mut self, tx: TxId, commit: bool) -> Result<TxOutcome> {
        let flag: &[u8] = if commit { b"T" } else { b"F" };
        match self.call(
            "transaction_end",
            "",
            MsgType::TransactionEnd,
            tx,
            &[flag],
        ) {
            Ok(_) => Ok(TxOutcome::Committed),
            Err(ConsoleError::StoreReply { reply, .. }) if reply.is_again() => {
                Ok(TxOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    fn get_domain_path(&mut self, domid: DomId) -> Result<String> {
        let id = domid.to_string();
        let reply = self.call(
            "get_domain_path",
            &id,
            MsgType::GetDomainPath,
            xs_wire::NO_TX,
            &[id.as_bytes()],
        )?;
        Ok(reply.text()?.to_owned())
    }
}
