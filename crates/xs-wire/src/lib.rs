//! Wire format of the Xen store protocol.
//!
//! The store speaks a simple framed protocol over a Unix socket (or the
//! xenbus device). Every message is a fixed 16-byte header followed by the
//! payload:
//!
//! ```text
//! +----------+----------+----------+----------+------------------+
//! | type u32 | req_id   | tx_id    | len u32  | payload (len B)  |
//! +----------+----------+----------+----------+------------------+
//! ```
//!
//! All header fields are in native endian (the peer is always on the same
//! host). Payloads are NUL-separated strings, except that the value of a
//! `Write` request is sent unterminated.
//!
//! ## Example exchanges
//!
//! ```text
//! -> Read          "/local/domain/5/console/ring-ref\0"
//! <- Read          "1234"
//! -> Watch         "/local/domain/5/console\0dom5\0"
//! <- Watch         "OK\0"
//! <- WatchEvent    "/local/domain/5/console/port\0dom5\0"
//! -> Write         "/local/domain/5/console/tty\0/dev/pts/3"
//! <- Error         "EAGAIN\0"
//! ```
//!
//! This crate only frames and splits messages; it does not own a transport.

use bstr::ByteSlice as _;
use bytemuck::{Pod, Zeroable};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Size in bytes of [`Header`] on the wire.
pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// Largest payload the store accepts or emits.
pub const PAYLOAD_MAX: usize = 4096;

/// Transaction id meaning "not inside a transaction".
pub const NO_TX: u32 = 0;

/// Message types. These numeric values match `enum xsd_sockmsg_type`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u32)]
pub enum MsgType {
    Debug = 0,
    Directory = 1,
    Read = 2,
    GetPerms = 3,
    Watch = 4,
    Unwatch = 5,
    TransactionStart = 6,
    TransactionEnd = 7,
    Introduce = 8,
    Release = 9,
    GetDomainPath = 10,
    Write = 11,
    Mkdir = 12,
    Rm = 13,
    SetPerms = 14,
    /// Unsolicited: a registered watch fired.
    WatchEvent = 15,
    /// Reply carrying an errno name instead of the expected payload.
    Error = 16,
    IsDomainIntroduced = 17,
    Resume = 18,
    SetTarget = 19,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Zeroable, Pod, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub req_id: u32,
    pub tx_id: u32,
    pub len: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("payload of {0} bytes exceeds the 4096 byte limit")]
    PayloadTooLarge(usize),
    #[error("watch event payload is malformed")]
    MalformedWatchEvent,
    #[error("payload is not valid UTF-8")]
    NotUtf8,
}

/// A decoded or to-be-encoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub req_id: u32,
    pub tx_id: u32,
    pub payload: Vec<u8>,
}

/// The errno name carried by an `Error` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply(pub String);

impl ErrorReply {
    /// Transaction conflict; the caller should retry the transaction.
    #[must_use]
    pub fn is_again(&self) -> bool {
        self.0 == "EAGAIN"
    }

    #[must_use]
    pub fn is_noent(&self) -> bool {
        self.0 == "ENOENT"
    }
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Message {
    /// Build a request whose payload is every part followed by a NUL.
    pub fn request(
        msg_type: MsgType,
        req_id: u32,
        tx_id: u32,
        parts: &[&[u8]],
    ) -> Result<Self, WireError> {
        let mut payload = Vec::new();
        for part in parts {
            payload.extend_from_slice(part);
            payload.push(0);
        }
        Self::with_payload(msg_type, req_id, tx_id, payload)
    }

    /// `Write` request: NUL-terminated path, then the raw value.
    pub fn write(
        req_id: u32,
        tx_id: u32,
        path: &str,
        value: &[u8],
    ) -> Result<Self, WireError> {
        let mut payload = Vec::with_capacity(path.len() + 1 + value.len());
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value);
        Self::with_payload(MsgType::Write, req_id, tx_id, payload)
    }

    fn with_payload(
        msg_type: MsgType,
        req_id: u32,
        tx_id: u32,
        payload: Vec<u8>,
    ) -> Result<Self, WireError> {
        if payload.len() > PAYLOAD_MAX {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            msg_type,
            req_id,
            tx_id,
            payload,
        })
    }

    #[must_use]
    pub fn header(&self) -> Header {
        Header {
            msg_type: self.msg_type.into(),
            req_id: self.req_id,
            tx_id: self.tx_id,
            len: self.payload.len() as u32,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(bytemuck::bytes_of(&self.header()));
        out.extend_from_slice(&self.payload);
        out
    }

    /// NUL-separated fields of the payload. A trailing terminator does not
    /// produce an empty final field.
    #[must_use]
    pub fn fields(&self) -> Vec<&[u8]> {
        let body =
            self.payload.strip_suffix(b"\0").unwrap_or(&self.payload[..]);
        if body.is_empty() {
            return Vec::new();
        }
        body.split_str(b"\0").collect()
    }

    /// Payload as a single string, without its terminator if any.
    pub fn text(&self) -> Result<&str, WireError> {
        let body =
            self.payload.strip_suffix(b"\0").unwrap_or(&self.payload[..]);
        body.to_str().map_err(|_| WireError::NotUtf8)
    }

    /// The errno name if this is an `Error` reply.
    #[must_use]
    pub fn error_reply(&self) -> Option<ErrorReply> {
        if self.msg_type != MsgType::Error {
            return None;
        }
        Some(ErrorReply(self.text().unwrap_or("EINVAL").to_owned()))
    }

    /// Split a `WatchEvent` payload into `(path, token)`.
    pub fn watch_event(&self) -> Result<(String, String), WireError> {
        let fields = self.fields();
        let [path, token, ..] = fields.as_slice() else {
            return Err(WireError::MalformedWatchEvent);
        };
        let path = path.to_str().map_err(|_| WireError::NotUtf8)?;
        let token = token.to_str().map_err(|_| WireError::NotUtf8)?;
        Ok((path.to_owned(), token.to_owned()))
    }
}

/// Incremental decoder for a byte stream of messages.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes still needed before the next message can be decoded.
    #[must_use]
    pub fn wanted(&self) -> usize {
        if self.buf.len() < HEADER_SIZE {
            return HEADER_SIZE - self.buf.len();
        }
        let hdr: Header =
            bytemuck::pod_read_unaligned(&self.buf[..HEADER_SIZE]);
        (HEADER_SIZE + hdr.len as usize).saturating_sub(self.buf.len())
    }

    /// Pop the next complete message, if the buffer holds one.
    ///
    /// A frame that fails to decode is consumed along with the error, so
    /// the following call starts at the next frame. An oversized length
    /// leaves no frame boundary to trust and discards everything buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>, WireError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let hdr: Header =
            bytemuck::pod_read_unaligned(&self.buf[..HEADER_SIZE]);
        let len = hdr.len as usize;
        if len > PAYLOAD_MAX {
            self.buf.clear();
            return Err(WireError::PayloadTooLarge(len));
        }
        let total = HEADER_SIZE + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        let msg_type = MsgType::try_from(hdr.msg_type)
            .map_err(|_| WireError::UnknownType(hdr.msg_type))?;
        Ok(Some(Message {
            msg_type,
            req_id: hdr.req_id,
            tx_id: hdr.tx_id,
            payload: frame[HEADER_SIZE..].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(HEADER_SIZE, 16);
    }

    #[test]
    fn request_terminates_every_part() {
        let msg = Message::request(
            MsgType::Watch,
            7,
            NO_TX,
            &[b"/local/domain/5/console", b"dom5"],
        )
        .unwrap();
        assert_eq!(msg.payload, b"/local/domain/5/console\0dom5\0");

        let bytes = msg.encode();
        let hdr: Header = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        assert_eq!(hdr.msg_type, 4);
        assert_eq!(hdr.req_id, 7);
        assert_eq!(hdr.len as usize, msg.payload.len());
    }

    #[test]
    fn write_value_is_unterminated() {
        let msg = Message::write(1, 3, "/a/tty", b"/dev/pts/4").unwrap();
        assert_eq!(msg.payload, b"/a/tty\0/dev/pts/4");
        assert_eq!(msg.tx_id, 3);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = vec![b'x'; PAYLOAD_MAX];
        let err = Message::write(1, NO_TX, "/p", &big).unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge(_)));
    }

    #[test]
    fn decoder_handles_split_and_batched_input() {
        let a = Message::request(MsgType::Read, 1, NO_TX, &[b"/x"]).unwrap();
        let b = Message::request(
            MsgType::WatchEvent,
            0,
            NO_TX,
            &[b"/local/domain/2/serial/0/port", b"dom2"],
        )
        .unwrap();
        let mut stream = a.encode();
        stream.extend(b.encode());

        let mut dec = Decoder::new();
        dec.feed(&stream[..5]);
        assert_eq!(dec.next_message().unwrap(), None);
        assert_eq!(dec.wanted(), HEADER_SIZE - 5);

        dec.feed(&stream[5..]);
        assert_eq!(dec.next_message().unwrap(), Some(a));
        let got = dec.next_message().unwrap().unwrap();
        assert_eq!(
            got.watch_event().unwrap(),
            ("/local/domain/2/serial/0/port".to_owned(), "dom2".to_owned())
        );
        assert_eq!(dec.next_message().unwrap(), None);
    }

    #[test]
    fn decoder_rejects_unknown_type() {
        let mut bytes = Message::request(MsgType::Read, 1, NO_TX, &[b"/x"])
            .unwrap()
            .encode();
        bytes[..4].copy_from_slice(&99u32.to_ne_bytes());
        let next = Message::request(MsgType::Rm, 2, NO_TX, &[b"/y"]).unwrap();
        bytes.extend(next.encode());

        let mut dec = Decoder::new();
        dec.feed(&bytes);
        assert_eq!(dec.next_message(), Err(WireError::UnknownType(99)));
        assert_eq!(dec.next_message().unwrap(), Some(next));
        assert_eq!(dec.wanted(), HEADER_SIZE);
    }

    #[test]
    fn oversized_length_resets_the_stream() {
        let mut bytes = Message::request(MsgType::Read, 1, NO_TX, &[b"/x"])
            .unwrap()
            .encode();
        bytes[12..16].copy_from_slice(&(PAYLOAD_MAX as u32 + 1).to_ne_bytes());
        let mut dec = Decoder::new();
        dec.feed(&bytes);
        assert!(dec.wanted() > 0);
        assert_eq!(
            dec.next_message(),
            Err(WireError::PayloadTooLarge(PAYLOAD_MAX + 1))
        );
        assert_eq!(dec.wanted(), HEADER_SIZE);
        assert_eq!(dec.next_message().unwrap(), None);
    }

    #[test]
    fn directory_listing_splits_on_nul() {
        let msg = Message {
            msg_type: MsgType::Directory,
            req_id: 2,
            tx_id: NO_TX,
            payload: b"0\x001\x0017\0".to_vec(),
        };
        let names: Vec<_> = msg.fields();
        assert_eq!(names, vec![&b"0"[..], b"1", b"17"]);

        let empty = Message {
            payload: Vec::new(),
            ..msg
        };
        assert!(empty.fields().is_empty());
    }

    #[test]
    fn error_reply_names() {
        let msg = Message {
            msg_type: MsgType::Error,
            req_id: 4,
            tx_id: 9,
            payload: b"EAGAIN\0".to_vec(),
        };
        let reply = msg.error_reply().unwrap();
        assert!(reply.is_again());
        assert!(!reply.is_noent());
        assert_eq!(reply.to_string(), "EAGAIN");
    }
}
