//! Mounts an in-memory filesystem holding `/hello` and serves it from the main thread.
//!
//! Usage: `cargo run --example hello -- <mountpoint>`. Unmount with `fusermount -u <mountpoint>`
//! or interrupt the process.

use fuse_relay::{Answer, Completion, Presence, Responder, SessionBuilder, Stat};
use log::info;
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

const HELLO: &[u8] = b"Hello World!\n";

/// Largest file the demo keeps in memory.
const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

// End of a write or truncation, if the file may grow that far
fn file_end(offset: i64, len: usize) -> Option<usize> {
    let end = u64::try_from(offset.max(0)).ok()?.checked_add(len as u64)?;
    if end > MAX_FILE_SIZE {
        return None;
    }
    usize::try_from(end).ok()
}

struct Memory {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl Memory {
    fn new() -> Self {
        let mut files = BTreeMap::new();
        files.insert(PathBuf::from("/hello"), HELLO.to_vec());
        Memory { files }
    }

    fn file(&mut self, path: &Path) -> Answer<&mut Vec<u8>> {
        match self.files.get_mut(path) {
            Some(data) => Answer::Success(data),
            None => Answer::Error(libc::ENOENT),
        }
    }
}

impl Responder for Memory {
    fn getattr(&mut self, path: &Path) -> Answer<Stat> {
        Answer::Success(match self.files.get(path) {
            Some(data) => Stat::File { size: data.len() as u64 },
            None if path == Path::new("/") => Stat::Directory,
            None => Stat::NotFound,
        })
    }

    fn readdir(&mut self, path: &Path) -> Answer<Vec<OsString>> {
        if path != Path::new("/") {
            return Answer::Error(libc::ENOTDIR);
        }
        let names = self.files.keys().filter_map(|path| path.file_name()).map(|name| name.to_owned());
        Answer::Success(names.collect())
    }

    fn open(&mut self, path: &Path) -> Answer<Presence> {
        Answer::Success(if self.files.contains_key(path) { Presence::Found } else { Presence::NotFound })
    }

    fn release(&mut self, path: &Path) -> Answer<Presence> {
        self.open(path)
    }

    fn read(&mut self, path: &Path, offset: i64, size: u32) -> Answer<Option<Vec<u8>>> {
        self.file(path).map(|data| {
            let start = (offset.max(0) as usize).min(data.len());
            let end = start.saturating_add(size as usize).min(data.len());
            Some(data[start..end].to_vec())
        })
    }

    fn write(&mut self, path: &Path, offset: i64, buf: &[u8]) -> Answer<Option<u32>> {
        let end = match file_end(offset, buf.len()) {
            Some(end) => end,
            None => return Answer::Error(libc::EFBIG),
        };
        self.file(path).map(|data| {
            if data.len() < end {
                data.resize(end, 0);
            }
            data[end - buf.len()..end].copy_from_slice(buf);
            Some(buf.len() as u32)
        })
    }

    fn create(&mut self, path: &Path) -> Answer<Completion> {
        self.files.entry(path.to_owned()).or_default();
        Answer::Success(Completion::Done)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Answer<Completion> {
        Answer::Success(match self.files.remove(from) {
            Some(data) => {
                self.files.insert(to.to_owned(), data);
                Completion::Done
            }
            None => Completion::Failed,
        })
    }

    fn truncate(&mut self, path: &Path, size: u64) -> Answer<Completion> {
        let size = match i64::try_from(size).ok().and_then(|size| file_end(size, 0)) {
            Some(size) => size,
            None => return Answer::Error(libc::EFBIG),
        };
        self.file(path).map(|data| {
            data.resize(size, 0);
            Completion::Done
        })
    }
}

fn main() {
    env_logger::init();
    let mountpoint = match env::args_os().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("Usage: {} <mountpoint>", env::args().next().unwrap_or_default());
            process::exit(2);
        }
    };

    let session = match SessionBuilder::new(&mountpoint).fsname("hello").mount() {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    let mut memory = Memory::new();
    while session.is_mounted() {
        session.channel().serve_timeout(&mut memory, Duration::from_millis(100));
    }
    info!("{} unmounted", Path::new(&mountpoint).display());
}
