//! Filesystem operation reply
//!
//! A response is what the host posts back for a request: a status and, on success, the
//! operation-specific payload. Buffers inside a payload (read data, directory entries) are owned
//! by the response and move to whoever takes it off the call channel.

use std::convert::TryFrom;
use std::ffi::OsString;
use std::os::raw::c_int;

use crate::request::Kind;

/// Result of a getattr call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stat {
    /// Regular file of the given size in bytes.
    File { size: u64 },
    /// Directory.
    Directory,
    /// No such entry.
    NotFound,
}

/// Result of an open or release call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Presence {
    Found,
    NotFound,
}

/// Result of a create, rename or truncate call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Completion {
    Done,
    Failed,
}

/// Per-operation success payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    Getattr(Stat),
    /// Directory entry names in host order, without `.` and `..`.
    Readdir(Vec<OsString>),
    Open(Presence),
    Release(Presence),
    /// Bytes read, or `None` if the read failed.
    Read(Option<Vec<u8>>),
    /// Number of bytes written, or `None` if the write failed.
    Write(Option<u32>),
    Create(Completion),
    Rename(Completion),
    Truncate(Completion),
}

impl Payload {
    /// Read payload from a host byte count where a negative count means failure. The data is
    /// cut down to `count` bytes.
    pub fn read_count(count: i64, mut data: Vec<u8>) -> Payload {
        match usize::try_from(count) {
            Ok(count) => {
                data.truncate(count);
                Payload::Read(Some(data))
            }
            Err(_) => Payload::Read(None),
        }
    }

    /// Write payload from a host byte count where a negative count means failure.
    pub fn write_count(count: i64) -> Payload {
        Payload::Write(u32::try_from(count).ok())
    }

    /// Returns the operation kind this payload answers.
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Getattr(_) => Kind::Getattr,
            Payload::Readdir(_) => Kind::Readdir,
            Payload::Open(_) => Kind::Open,
            Payload::Release(_) => Kind::Release,
            Payload::Read(_) => Kind::Read,
            Payload::Write(_) => Kind::Write,
            Payload::Create(_) => Kind::Create,
            Payload::Rename(_) => Kind::Rename,
            Payload::Truncate(_) => Kind::Truncate,
        }
    }
}

/// Response to a request.
///
/// `NotReady` is the rest state of the call channel: no answer has been posted yet. A host posts
/// one of the other three.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    /// No answer posted yet.
    NotReady,
    /// The host answered; the payload is valid.
    Success(Payload),
    /// The host has no handler registered for this operation.
    Undefined,
    /// The host failed the operation with the given `errno` code.
    SignalError(c_int),
}

impl Response {
    /// Returns true while no answer has been posted.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Response::NotReady)
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::NotReady
    }
}

impl From<Payload> for Response {
    fn from(payload: Payload) -> Self {
        Response::Success(payload)
    }
}
