//! Operation adapters.
//!
//! Each adapter turns one filesystem call into a request, relays it over the call channel and
//! translates the host's response back into the call's result contract. All adapters share one
//! shape: build request, submit, then branch on the response status.
//!
//! | status          | outcome                                   |
//! |-----------------|-------------------------------------------|
//! | `Success`       | per-operation decoding                    |
//! | `Undefined`     | `ENOSYS`                                  |
//! | `SignalError`   | the host's code                           |
//! | `NotReady`      | `ENOSYS` (only after the channel closed)  |

use libc::{EACCES, EIO, ENOENT, ENOSYS};
use log::{debug, warn};
use std::ffi::OsString;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::call::CallChannel;
use crate::reply::{Completion, Payload, Presence, Response, Stat};
use crate::request::Request;


/// Result type of the operation adapters.
///
/// On failure, an adapter returns an `errno` error code as defined in the `libc` crate,
/// e.g. `ENOENT` or `ENOSYS`.
pub type Result<T> = std::result::Result<T, c_int>;


/// File attributes reported by getattr.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attr {
    /// File type and permission bits, as in `st_mode`.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
}

impl Attr {
    /// Attributes of a regular file of the given size.
    pub fn file(size: u64) -> Self {
        Self { mode: libc::S_IFREG as u32 | 0o666, nlink: 1, size }
    }

    /// Attributes of a directory.
    pub fn directory() -> Self {
        Self { mode: libc::S_IFDIR as u32 | 0o755, nlink: 2, size: 0 }
    }

    /// Returns true if the attributes describe a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// Permission bits without the file type.
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}


/// Returns true if `flags` open a file for reading only.
fn read_only(flags: i32) -> bool {
    flags & libc::O_ACCMODE == libc::O_RDONLY
}


/// Operation adapters relaying filesystem calls to the host.
///
/// Cloning a relay is cheap; all clones submit to the same call channel.
#[derive(Clone, Debug)]
pub struct Relay {
    channel: Arc<CallChannel>,
}

impl Relay {
    /// Create adapters submitting to the given channel.
    pub fn new(channel: Arc<CallChannel>) -> Self {
        Self { channel }
    }

    /// Returns the channel the adapters submit to.
    pub fn channel(&self) -> &Arc<CallChannel> {
        &self.channel
    }

    // Submit a request and map everything but success to its failure code
    fn call(&self, request: Request) -> Result<Payload> {
        let kind = request.kind();
        match self.channel.submit(request) {
            Response::Success(payload) if payload.kind() == kind => Ok(payload),
            Response::Success(payload) => {
                warn!("{} answered with a {} result", kind, payload.kind());
                Err(EIO)
            }
            Response::Undefined => {
                debug!("{} callback undefined", kind);
                Err(ENOSYS)
            }
            Response::SignalError(code) if code > 0 => {
                debug!("{} callback error with code {}", kind, code);
                Err(code)
            }
            Response::SignalError(code) => {
                warn!("{} callback error with invalid code {}", kind, code);
                Err(EIO)
            }
            Response::NotReady => {
                debug!("{} got no answer", kind);
                Err(ENOSYS)
            }
        }
    }

    /// Get attributes of the entry at `path`.
    pub fn getattr(&self, path: &Path) -> Result<Attr> {
        match self.call(Request::Getattr { path: path.to_owned() })? {
            Payload::Getattr(Stat::File { size }) => {
                debug!("GETATTR received results (file {}, size {})", path.display(), size);
                Ok(Attr::file(size))
            }
            Payload::Getattr(Stat::Directory) => {
                debug!("GETATTR received results (dir {})", path.display());
                Ok(Attr::directory())
            }
            _ => {
                debug!("GETATTR received results (unknown {})", path.display());
                Err(ENOENT)
            }
        }
    }

    /// List the directory at `path`, in the order the host gave.
    pub fn readdir(&self, path: &Path) -> Result<Vec<OsString>> {
        match self.call(Request::Readdir { path: path.to_owned() })? {
            Payload::Readdir(entries) => {
                debug!("READDIR received {} entries for {}", entries.len(), path.display());
                Ok(entries)
            }
            _ => Err(EIO),
        }
    }

    /// Open the file at `path`. Anything but a read-only open is refused without asking the host.
    pub fn open(&self, path: &Path, flags: i32) -> Result<()> {
        if !read_only(flags) {
            debug!("OPEN {} refused, flags {:#o} are not read-only", path.display(), flags);
            return Err(EACCES);
        }
        match self.call(Request::Open { path: path.to_owned() })? {
            Payload::Open(Presence::Found) => Ok(()),
            _ => {
                debug!("OPEN {} not found", path.display());
                Err(EACCES)
            }
        }
    }

    /// Release the file at `path`. Same access check as `open`.
    pub fn release(&self, path: &Path, flags: i32) -> Result<()> {
        if !read_only(flags) {
            debug!("RELEASE {} refused, flags {:#o} are not read-only", path.display(), flags);
            return Err(EACCES);
        }
        match self.call(Request::Release { path: path.to_owned() })? {
            Payload::Release(Presence::Found) => Ok(()),
            _ => {
                debug!("RELEASE {} not found", path.display());
                Err(EACCES)
            }
        }
    }

    /// Read from the file at `path` into `buf`, returning the number of bytes copied.
    ///
    /// Offset and size are passed to the host verbatim and the host is trusted to respect them;
    /// whatever it returns is copied, limited only by the length of `buf`.
    pub fn read(&self, path: &Path, offset: i64, buf: &mut [u8]) -> Result<usize> {
        let size = buf.len() as u32;
        match self.call(Request::Read { path: path.to_owned(), offset, size })? {
            Payload::Read(Some(data)) => {
                if data.len() > buf.len() {
                    warn!(
                        "READ {} returned {} bytes for a {} byte buffer, truncating",
                        path.display(),
                        data.len(),
                        buf.len()
                    );
                }
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                debug!("READ {} received {} bytes", path.display(), len);
                Ok(len)
            }
            _ => {
                debug!("READ {} did not receive results", path.display());
                Err(ENOENT)
            }
        }
    }

    /// Write `data` to the file at `path`, returning the number of bytes the host wrote.
    pub fn write(&self, path: &Path, offset: i64, data: &[u8]) -> Result<u32> {
        let request = Request::Write { path: path.to_owned(), offset, data: data.to_vec() };
        match self.call(request)? {
            Payload::Write(Some(written)) => {
                debug!("WRITE {} wrote {} bytes", path.display(), written);
                Ok(written)
            }
            _ => {
                debug!("WRITE {} did not receive results", path.display());
                Err(ENOENT)
            }
        }
    }

    /// Create a regular file at `path`.
    pub fn create(&self, path: &Path) -> Result<()> {
        self.complete(Request::Create { path: path.to_owned() })
    }

    /// Move the entry at `from` to `to`.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.complete(Request::Rename { from: from.to_owned(), to: to.to_owned() })
    }

    /// Set the length of the file at `path`.
    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        self.complete(Request::Truncate { path: path.to_owned(), size })
    }

    fn complete(&self, request: Request) -> Result<()> {
        let kind = request.kind();
        let path: PathBuf = request.path().to_owned();
        let completion = match self.call(request)? {
            Payload::Create(completion)
            | Payload::Rename(completion)
            | Payload::Truncate(completion) => completion,
            _ => return Err(EIO),
        };
        match completion {
            Completion::Done => {
                debug!("{} {} done", kind, path.display());
                Ok(())
            }
            Completion::Failed => {
                debug!("{} {} failed", kind, path.display());
                Err(ENOENT)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    // Run `op` against a relay while answering every request with `answer`
    fn with_host<T, F, A>(op: F, answer: A) -> (T, Vec<Request>)
    where
        F: FnOnce(&Relay) -> T + Send,
        T: Send,
        A: Fn(&Request) -> Response + Send,
    {
        let channel = Arc::new(CallChannel::new());
        let relay = Relay::new(channel.clone());
        let seen = std::sync::Mutex::new(Vec::new());
        let result = thread::scope(|scope| {
            let caller = scope.spawn(|| {
                let result = op(&relay);
                channel.close();
                result
            });
            while !channel.is_closed() {
                channel.respond_with(|request| {
                    seen.lock().unwrap().push(request.clone());
                    answer(request)
                });
                thread::yield_now();
            }
            caller.join().unwrap()
        });
        (result, seen.into_inner().unwrap())
    }

    #[test]
    fn getattr_file() {
        let (attr, seen) = with_host(
            |relay| relay.getattr(Path::new("/hello")),
            |_| Payload::Getattr(Stat::File { size: 42 }).into(),
        );
        let attr = attr.unwrap();
        assert_eq!(attr.mode & libc::S_IFMT as u32, libc::S_IFREG as u32);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.size, 42);
        assert!(!attr.is_dir());
        assert_eq!(seen, vec![Request::Getattr { path: PathBuf::from("/hello") }]);
    }

    #[test]
    fn getattr_directory_and_missing() {
        let (attr, _) = with_host(
            |relay| relay.getattr(Path::new("/")),
            |_| Payload::Getattr(Stat::Directory).into(),
        );
        let attr = attr.unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.perm(), 0o755);

        let (attr, _) = with_host(
            |relay| relay.getattr(Path::new("/nope")),
            |_| Payload::Getattr(Stat::NotFound).into(),
        );
        assert_eq!(attr, Err(ENOENT));
    }

    #[test]
    fn readdir_keeps_host_order() {
        let names: Vec<OsString> = vec!["c".into(), "a".into(), "b".into()];
        let answer = names.clone();
        let (entries, _) = with_host(
            |relay| relay.readdir(Path::new("/")),
            move |_| Payload::Readdir(answer.clone()).into(),
        );
        assert_eq!(entries.unwrap(), names);
    }

    #[test]
    fn undefined_is_enosys_for_every_kind() {
        let (results, seen) = with_host(
            |relay| {
                let path = Path::new("/f");
                let mut buf = [0u8; 4];
                vec![
                    relay.getattr(path).err(),
                    relay.readdir(path).err(),
                    relay.open(path, libc::O_RDONLY).err(),
                    relay.release(path, libc::O_RDONLY).err(),
                    relay.read(path, 0, &mut buf).err(),
                    relay.write(path, 0, b"x").err(),
                    relay.create(path).err(),
                    relay.rename(path, Path::new("/g")).err(),
                    relay.truncate(path, 0).err(),
                ]
            },
            |_| Response::Undefined,
        );
        assert_eq!(results, vec![Some(ENOSYS); 9]);
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn signal_error_passthrough() {
        let (result, _) = with_host(
            |relay| relay.create(Path::new("/f")),
            |_| Response::SignalError(13),
        );
        assert_eq!(result, Err(13));
        let (result, _) = with_host(
            |relay| relay.getattr(Path::new("/f")),
            |_| Response::SignalError(0),
        );
        assert_eq!(result, Err(EIO));
    }

    #[test]
    fn read_failure_copies_nothing() {
        let (result, seen) = with_host(
            |relay| {
                let mut buf = [0xffu8; 5];
                let result = relay.read(Path::new("/hello"), 0, &mut buf);
                (result, buf)
            },
            |_| Payload::read_count(-1, b"junk!".to_vec()).into(),
        );
        assert_eq!(result.0, Err(ENOENT));
        assert_eq!(result.1, [0xff; 5]);
        assert_eq!(seen, vec![Request::Read { path: PathBuf::from("/hello"), offset: 0, size: 5 }]);
    }

    #[test]
    fn read_copies_host_bytes() {
        let (result, _) = with_host(
            |relay| {
                let mut buf = [0u8; 8];
                relay.read(Path::new("/hello"), 2, &mut buf).map(|n| buf[..n].to_vec())
            },
            |_| Payload::Read(Some(b"llo".to_vec())).into(),
        );
        assert_eq!(result, Ok(b"llo".to_vec()));
    }

    #[test]
    fn write_counts() {
        let (result, seen) = with_host(
            |relay| relay.write(Path::new("/f"), 3, b"abc"),
            |_| Payload::write_count(3).into(),
        );
        assert_eq!(result, Ok(3));
        assert_eq!(seen, vec![Request::Write { path: PathBuf::from("/f"), offset: 3, data: b"abc".to_vec() }]);
        let (result, _) = with_host(
            |relay| relay.write(Path::new("/f"), 0, b"abc"),
            |_| Payload::write_count(-1).into(),
        );
        assert_eq!(result, Err(ENOENT));
    }

    #[test]
    fn open_refuses_writers_without_asking() {
        let calls = AtomicUsize::new(0);
        let (results, seen) = with_host(
            |relay| {
                vec![
                    relay.open(Path::new("/f"), libc::O_WRONLY),
                    relay.open(Path::new("/f"), libc::O_RDWR),
                    relay.release(Path::new("/f"), libc::O_WRONLY | libc::O_APPEND),
                ]
            },
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Payload::Open(Presence::Found).into()
            },
        );
        assert_eq!(results, vec![Err(EACCES); 3]);
        assert!(seen.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn open_not_found_is_access_denied() {
        let (result, _) = with_host(
            |relay| relay.open(Path::new("/f"), libc::O_RDONLY),
            |_| Payload::Open(Presence::NotFound).into(),
        );
        assert_eq!(result, Err(EACCES));
        let (result, _) = with_host(
            |relay| relay.release(Path::new("/f"), libc::O_RDONLY),
            |_| Payload::Release(Presence::Found).into(),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn completions() {
        let (result, seen) = with_host(
            |relay| relay.rename(Path::new("/a"), Path::new("/b")),
            |_| Payload::Rename(Completion::Done).into(),
        );
        assert_eq!(result, Ok(()));
        assert_eq!(seen, vec![Request::Rename { from: PathBuf::from("/a"), to: PathBuf::from("/b") }]);
        let (result, _) = with_host(
            |relay| relay.truncate(Path::new("/a"), 7),
            |_| Payload::Truncate(Completion::Failed).into(),
        );
        assert_eq!(result, Err(ENOENT));
    }

    #[test]
    fn mismatched_payload_is_io_error() {
        let (result, _) = with_host(
            |relay| relay.create(Path::new("/a")),
            |_| Payload::Truncate(Completion::Done).into(),
        );
        assert_eq!(result, Err(EIO));
    }

    #[test]
    fn closed_channel_is_enosys() {
        let channel = Arc::new(CallChannel::new());
        channel.close();
        let relay = Relay::new(channel);
        assert_eq!(relay.getattr(Path::new("/")), Err(ENOSYS));
    }
}
