//! The discovery/configuration store as the daemon consumes it.

use std::{fmt::Display, os::fd::AsFd, str::FromStr};

use bstr::ByteSlice as _;
use tracing::debug;

use crate::{DomId, Result, error::ConsoleError};

pub type TxId = u32;

/// Operations outside any transaction.
pub const NO_TX: TxId = xs_wire::NO_TX;

/// Special paths that fire when domains come and go.
pub const INTRODUCE_DOMAIN: &str = "@introduceDomain";
pub const RELEASE_DOMAIN: &str = "@releaseDomain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    /// Someone else changed what we read; redo the whole transaction.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub token: String,
}

/// Hierarchical key-value store with transactions and watches.
///
/// The fd is readable when watch events may be waiting; events already
/// pulled off the fd and queued in memory are reported by
/// [`Store::has_queued_watch`].
pub trait Store: AsFd {
    fn read(&mut self, tx: TxId, path: &str) -> Result<Option<Vec<u8>>>;
    fn write(&mut self, tx: TxId, path: &str, value: &[u8]) -> Result<()>;
    fn remove(&mut self, tx: TxId, path: &str) -> Result<()>;
    fn list_directory(&mut self, path: &str) -> Result<Vec<String>>;
    fn watch(&mut self, path: &str, token: &str) -> Result<()>;
    fn unwatch(&mut self, path: &str, token: &str) -> Result<()>;
    fn read_pending_watch(&mut self) -> Result<Option<WatchEvent>>;
    fn has_queued_watch(&self) -> bool;
    fn transaction_start(&mut self) -> Result<TxId>;
    fn transaction_end(&mut self, tx: TxId, commit: bool) -> Result<TxOutcome>;
    fn get_domain_path(&mut self, domid: DomId) -> Result<String>;
}

/// Tokens the daemon registers its watches under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchToken {
    /// A domain appeared or went away somewhere.
    DomainList,
    /// Something under one domain's console subtrees changed.
    Domain(DomId),
}

impl Display for WatchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchToken::DomainList => f.write_str("domlist"),
            WatchToken::Domain(id) => write!(f, "dom{id}"),
        }
    }
}

impl FromStr for WatchToken {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "domlist" {
            return Ok(WatchToken::DomainList);
        }
        s.strip_prefix("dom")
            .and_then(|id| id.parse().ok())
            .map(WatchToken::Domain)
            .ok_or(())
    }
}

/// Read a key as trimmed UTF-8 text.
pub fn read_string(
    store: &mut dyn Store,
    path: &str,
) -> Result<Option<String>> {
    Ok(store.read(NO_TX, path)?.map(|v| {
        v.trim_with(|c| c == '\0' || c.is_whitespace())
            .to_str_lossy()
            .into_owned()
    }))
}

/// Read and parse a key. A present but unparsable value is an error.
pub fn read_parsed<T: FromStr>(
    store: &mut dyn Store,
    path: &str,
) -> Result<Option<T>> {
    let Some(text) = read_string(store, path)? else {
        return Ok(None);
    };
    text.parse().map(Some).map_err(|_| ConsoleError::BadValue {
        path: path.to_owned(),
        value: text,
    })
}

/// Like [`read_parsed`] for keys that must be there.
pub fn read_required<T: FromStr>(
    store: &mut dyn Store,
    path: &str,
) -> Result<T> {
    read_parsed(store, path)?.ok_or_else(|| ConsoleError::MissingKey {
        path: path.to_owned(),
    })
}

/// Parse an unsigned number the way `strtoul(s, 0, 0)` would: decimal,
/// `0x` hex or leading-zero octal.
pub fn parse_c_ulong(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Run `op` inside a transaction, starting over on every conflict until
/// it commits. An error from `op` aborts the transaction.
pub fn with_transaction<T>(
    store: &mut dyn Store,
    mut op: impl FnMut(&mut dyn Store, TxId) -> Result<T>,
) -> Result<T> {
    loop {
        let tx = store.transaction_start()?;
        let value = match op(store, tx) {
            Ok(v) => v,
            Err(e) => {
                let _ = store.transaction_end(tx, false);
                return Err(e);
            }
        };
        match store.transaction_end(tx, true)? {
            TxOutcome::Committed => return Ok(value),
            TxOutcome::Conflict => {
                debug!(tx, "store transaction conflicted, retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemStore;

    #[test]
    fn tokens_round_trip_through_text() {
        assert_eq!(WatchToken::DomainList.to_string(), "domlist");
        assert_eq!(WatchToken::Domain(DomId(12)).to_string(), "dom12");
        assert_eq!("dom7".parse(), Ok(WatchToken::Domain(DomId(7))));
        assert_eq!("domlist".parse(), Ok(WatchToken::DomainList));
        assert_eq!("domx".parse::<WatchToken>(), Err(()));
        assert_eq!("backend".parse::<WatchToken>(), Err(()));
    }

    #[test]
    fn c_style_numbers() {
        assert_eq!(parse_c_ulong("4096"), Some(4096));
        assert_eq!(parse_c_ulong("0x1000"), Some(4096));
        assert_eq!(parse_c_ulong("010"), Some(8));
        assert_eq!(parse_c_ulong("0"), Some(0));
        assert_eq!(parse_c_ulong("lots"), None);
    }

    #[test]
    fn typed_reads() {
        let mut store = MemStore::new();
        store.set("/a/port", "17");
        store.set("/a/bad", "seventeen");

        let port = read_parsed::<u32>(&mut store, "/a/port").unwrap();
        assert_eq!(port, Some(17));
        let none = read_parsed::<u32>(&mut store, "/a/none").unwrap();
        assert_eq!(none, None);
        assert!(matches!(
            read_parsed::<u32>(&mut store, "/a/bad"),
            Err(ConsoleError::BadValue { .. })
        ));
        assert!(matches!(
            read_required::<u32>(&mut store, "/a/none"),
            Err(ConsoleError::MissingKey { .. })
        ));
    }

    #[test]
    fn transaction_retries_until_commit() {
        let mut store = MemStore::new();
        store.inject_conflicts(3);

        let mut attempts = 0;
        with_transaction(&mut store, |s, tx| {
            attempts += 1;
            s.write(tx, "/a/tty", b"/dev/pts/9")
        })
        .unwrap();

        assert_eq!(attempts, 4);
        assert_eq!(store.get("/a/tty").as_deref(), Some("/dev/pts/9"));
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let mut store = MemStore::new();
        let res: Result<()> = with_transaction(&mut store, |s, tx| {
            s.write(tx, "/a/tty", b"x")?;
            Err(ConsoleError::MissingKey { path: "/a".into() })
        });
        assert!(res.is_err());
        assert_eq!(store.get("/a/tty"), None);
    }
}
