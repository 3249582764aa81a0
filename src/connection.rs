//! Per-connection state: the record the event loop and the worker pool
//! both address by slab key, and the status bitset that drives the HTTP
//! state machine (C6).
//!
//! Mirrors the shape of the teacher's `runtime::connection::Connection`,
//! generalized from a single `ConnState` enum to the richer bitset the
//! spec calls for: several of these flags are simultaneously set (a PUT
//! mid-body has `ReadData` set while `SignalWait` toggles on and off
//! around each worker round-trip).

use std::fs::File;
use std::path::PathBuf;

use mio::net::TcpStream;
use mio::Interest;

use crate::bucket::TokenBucket;

/// Minimum buffer capacity the spec requires (`>= 8 KiB`).
pub const BUFFER_CAPACITY: usize = 8192;

/// Maximum bytes accepted for the METHOD token.
pub const METHOD_MAX: usize = 5;
/// Maximum bytes accepted for the RESOURCE token.
pub const RESOURCE_MAX: usize = 200;
/// Maximum bytes accepted for the PROTOCOL token.
pub const PROTOCOL_MAX: usize = 9;

/// Request method. Only two are recognized; anything else is a 501.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

/// Request protocol. Only two are recognized; anything else is a 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }
}

/// Fixed response status codes the server ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "BAD REQUEST",
            Status::Forbidden => "FORBIDDEN",
            Status::NotFound => "NOT FOUND",
            Status::NotImplemented => "NOT IMPLEMENTED",
        }
    }
}

/// Outcome of a worker task, written into the connection by the worker and
/// read by the event thread after the completion signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// More bytes remain; dispatch another task of the same kind.
    MoreData,
    /// The transfer is complete.
    Finished,
    /// The underlying file operation failed; drop the connection.
    Error,
}

/// The status bitset from the spec (ss3/ss4.5). Plain `u16` flags rather
/// than the `bitflags` crate: the teacher's own state machines (see
/// `runtime::connection::ConnState`) favor hand-rolled enums over pulling
/// in a flags crate, and a handful of named masks reads just as clearly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub const READ_REQUEST: Flags = Flags(1 << 0);
    pub const REQUEST_RECEIVED: Flags = Flags(1 << 1);
    pub const WRITE_HEADER: Flags = Flags(1 << 2);
    pub const WRITE_DATA: Flags = Flags(1 << 3);
    pub const READ_DATA: Flags = Flags(1 << 4);
    pub const SIGNAL_WAIT: Flags = Flags(1 << 5);
    pub const PENDING_DATA: Flags = Flags(1 << 6);
    pub const FINISHED: Flags = Flags(1 << 7);

    pub fn empty() -> Self {
        Flags(0)
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    pub fn insert_only(&mut self, other: Flags) {
        self.0 = other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// A single client connection: the C5 element carrying C6's state.
pub struct Connection {
    pub stream: TcpStream,
    pub buffer: Vec<u8>,
    pub pos_buf: usize,
    pub pos_header: usize,
    pub method: Option<Method>,
    pub protocol: Option<Protocol>,
    pub status: Status,
    pub file: Option<File>,
    pub resource: Option<PathBuf>,
    pub bucket: TokenBucket,
    pub task_status: TaskStatus,
    pub flags: Flags,
    /// Bytes the event thread asked the worker to transfer; set when a
    /// task is dispatched, consulted when its completion signal arrives.
    pub bytes_to_transfer: usize,
    /// Whether `stream` currently holds a live registration with the
    /// event loop's `Poll`. Tracked here rather than re-derived each
    /// iteration, since mio distinguishes `register` from `reregister`.
    pub registered: bool,
    /// The interest last registered, so the event loop only calls
    /// `reregister` when it actually changes.
    pub current_interest: Option<Interest>,
}

impl Connection {
    pub fn new(stream: TcpStream, rate: u64) -> Self {
        Connection {
            stream,
            buffer: vec![0u8; BUFFER_CAPACITY],
            pos_buf: 0,
            pos_header: 0,
            method: None,
            protocol: None,
            status: Status::Ok,
            file: None,
            resource: None,
            bucket: TokenBucket::new(rate),
            task_status: TaskStatus::MoreData,
            flags: Flags::READ_REQUEST,
            bytes_to_transfer: 0,
            registered: false,
            current_interest: None,
        }
    }

    /// The protocol to echo in a response when none was successfully
    /// parsed yet (e.g. a request line with the wrong token count).
    /// The spec leaves the exact fallback implementation-defined; this
    /// crate always falls back to HTTP/1.0, the lower of the two known
    /// protocols.
    pub fn response_protocol(&self) -> Protocol {
        self.protocol.unwrap_or(Protocol::Http10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_clear_independently() {
        let mut flags = Flags::empty();
        flags.set(Flags::WRITE_HEADER | Flags::WRITE_DATA);
        assert!(flags.contains(Flags::WRITE_HEADER));
        assert!(flags.contains(Flags::WRITE_DATA));
        assert!(!flags.contains(Flags::READ_DATA));

        flags.set(Flags::SIGNAL_WAIT);
        flags.clear(Flags::WRITE_HEADER);
        assert!(!flags.contains(Flags::WRITE_HEADER));
        assert!(flags.contains(Flags::WRITE_DATA));
        assert!(flags.contains(Flags::SIGNAL_WAIT));
    }

    #[test]
    fn status_table_matches_fixed_reason_phrases() {
        assert_eq!(Status::Ok.code(), 200);
        assert_eq!(Status::Ok.reason(), "OK");
        assert_eq!(Status::NotImplemented.code(), 501);
        assert_eq!(Status::NotImplemented.reason(), "NOT IMPLEMENTED");
    }
}
