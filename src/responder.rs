//! Host responder interface.
//!
//! The responder is the decision-maker on the other side of the call channel. It owns the actual
//! filesystem semantics: which paths exist, what they contain, what may be written.

use std::ffi::OsString;
use std::os::raw::c_int;
use std::path::Path;

use crate::reply::{Completion, Payload, Presence, Response, Stat};
use crate::request::Request;


/// Answer of a single responder handler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Answer<T> {
    /// The handler produced a result.
    Success(T),
    /// No handler is registered for this operation.
    Undefined,
    /// The handler failed with the given `errno` code.
    Error(c_int),
}

impl<T> Answer<T> {
    /// Maps the success value, keeping undefined and error answers as they are.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Answer<U> {
        match self {
            Answer::Success(value) => Answer::Success(f(value)),
            Answer::Undefined => Answer::Undefined,
            Answer::Error(code) => Answer::Error(code),
        }
    }
}

impl From<Answer<Payload>> for Response {
    fn from(answer: Answer<Payload>) -> Self {
        match answer {
            Answer::Success(payload) => Response::Success(payload),
            Answer::Undefined => Response::Undefined,
            Answer::Error(code) => Response::SignalError(code),
        }
    }
}


/// Host responder trait.
///
/// One method per operation kind. A host implements the operations it supports; everything else
/// keeps the default implementation, which answers `Undefined` so the caller sees `ENOSYS`.
///
/// Handlers run on the host's thread while the call channel is locked, so they must not call
/// back into the mounted filesystem.
pub trait Responder {
    /// Get attributes of the entry at `path`.
    fn getattr(&mut self, _path: &Path) -> Answer<Stat> {
        Answer::Undefined
    }

    /// List the directory at `path`. `.` and `..` are implicit and must not be returned.
    fn readdir(&mut self, _path: &Path) -> Answer<Vec<OsString>> {
        Answer::Undefined
    }

    /// Open the file at `path`. Only read-only opens are relayed.
    fn open(&mut self, _path: &Path) -> Answer<Presence> {
        Answer::Undefined
    }

    /// Release the file at `path`.
    fn release(&mut self, _path: &Path) -> Answer<Presence> {
        Answer::Undefined
    }

    /// Read up to `size` bytes at `offset`. `None` fails the read.
    fn read(&mut self, _path: &Path, _offset: i64, _size: u32) -> Answer<Option<Vec<u8>>> {
        Answer::Undefined
    }

    /// Write `data` at `offset`, returning the number of bytes written. `None` fails the write.
    fn write(&mut self, _path: &Path, _offset: i64, _data: &[u8]) -> Answer<Option<u32>> {
        Answer::Undefined
    }

    /// Create a regular file at `path`.
    fn create(&mut self, _path: &Path) -> Answer<Completion> {
        Answer::Undefined
    }

    /// Move the entry at `from` to `to`.
    fn rename(&mut self, _from: &Path, _to: &Path) -> Answer<Completion> {
        Answer::Undefined
    }

    /// Set the length of the file at `path` to `size`.
    fn truncate(&mut self, _path: &Path, _size: u64) -> Answer<Completion> {
        Answer::Undefined
    }
}

impl<R: Responder + ?Sized> Responder for &mut R {
    fn getattr(&mut self, path: &Path) -> Answer<Stat> {
        (**self).getattr(path)
    }

    fn readdir(&mut self, path: &Path) -> Answer<Vec<OsString>> {
        (**self).readdir(path)
    }

    fn open(&mut self, path: &Path) -> Answer<Presence> {
        (**self).open(path)
    }

    fn release(&mut self, path: &Path) -> Answer<Presence> {
        (**self).release(path)
    }

    fn read(&mut self, path: &Path, offset: i64, size: u32) -> Answer<Option<Vec<u8>>> {
        (**self).read(path, offset, size)
    }

    fn write(&mut self, path: &Path, offset: i64, data: &[u8]) -> Answer<Option<u32>> {
        (**self).write(path, offset, data)
    }

    fn create(&mut self, path: &Path) -> Answer<Completion> {
        (**self).create(path)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Answer<Completion> {
        (**self).rename(from, to)
    }

    fn truncate(&mut self, path: &Path, size: u64) -> Answer<Completion> {
        (**self).truncate(path, size)
    }
}


impl Request {
    /// Dispatch this request to the matching responder method and wrap its answer.
    pub fn dispatch<R: Responder + ?Sized>(&self, responder: &mut R) -> Response {
        let answer = match self {
            Request::Getattr { path } => responder.getattr(path).map(Payload::Getattr),
            Request::Readdir { path } => responder.readdir(path).map(Payload::Readdir),
            Request::Open { path } => responder.open(path).map(Payload::Open),
            Request::Release { path } => responder.release(path).map(Payload::Release),
            Request::Read { path, offset, size } => {
                responder.read(path, *offset, *size).map(Payload::Read)
            }
            Request::Write { path, offset, data } => {
                responder.write(path, *offset, data).map(Payload::Write)
            }
            Request::Create { path } => responder.create(path).map(Payload::Create),
            Request::Rename { from, to } => responder.rename(from, to).map(Payload::Rename),
            Request::Truncate { path, size } => {
                responder.truncate(path, *size).map(Payload::Truncate)
            }
        };
        answer.into()
    }
}
