//! Kernel-facing filesystem.
//!
//! Translates the inode-addressed operations the kernel driver sends into path-addressed relay
//! calls and replies with their results.

use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, ENOENT};
use log::{debug, info};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crate::inode::InodeTable;
use crate::relay::{Attr, Relay};


/// Attributes and entries are never cached by the kernel; the host may change them any time.
const TTL: Duration = Duration::from_secs(0);

/// Inode number reported for directory entries the kernel has not looked up yet.
const UNKNOWN_INO: u64 = 0xffff_ffff;

const BLOCK_SIZE: u32 = 4096;


/// Filesystem relaying every operation to the host.
#[derive(Debug)]
pub struct RelayFs {
    relay: Relay,
    inodes: InodeTable,
    buffer: Arc<Mutex<Vec<u8>>>,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl RelayFs {
    /// Create a filesystem relaying through `relay`. Reads are staged in `buffer`, which limits
    /// the amount of data a single read can return. The session fills it once the filesystem is
    /// mounted, before the first kernel request is received.
    pub fn new(relay: Relay, buffer: Arc<Mutex<Vec<u8>>>) -> Self {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self { relay, inodes: InodeTable::new(), buffer, uid, gid, mounted_at: SystemTime::now() }
    }

    /// Returns the operation adapters.
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Returns the size of the read working buffer.
    pub fn buffer_len(&self) -> usize {
        self.buffer().len()
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, ino: u64) -> Result<PathBuf, c_int> {
        self.inodes.path(ino).map(Path::to_owned).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        self.inodes.child(parent, name).ok_or(ENOENT)
    }

    fn file_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: (attr.size + 511) / 512,
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind: if attr.is_dir() { FileType::Directory } else { FileType::RegularFile },
            perm: attr.perm(),
            nlink: attr.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    // Attributes of a path the kernel already holds an inode for
    fn attr(&self, ino: u64) -> Result<FileAttr, c_int> {
        let path = self.path(ino)?;
        let attr = self.relay.getattr(&path)?;
        Ok(self.file_attr(ino, &attr))
    }
}

impl Filesystem for RelayFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("Filesystem initialized, read buffer {} bytes", self.buffer_len());
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("Filesystem destroyed with {} inodes known", self.inodes.len());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err),
        };
        match self.relay.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.lookup(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attr), 0);
            }
            Err(err) => reply.error(err),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Only size changes reach the host, everything else is accepted and ignored
        if let Some(size) = size {
            let truncated = self.path(ino).and_then(|path| self.relay.truncate(&path, size));
            if let Err(err) = truncated {
                return reply.error(err);
            }
        }
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.path(ino).and_then(|path| self.relay.open(&path, flags)) {
            Ok(()) => reply.opened(0, FOPEN_DIRECT_IO),
            Err(err) => reply.error(err),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(err) => return reply.error(err),
        };
        let mut buffer = self.buffer();
        let len = (size as usize).min(buffer.len());
        let buf = &mut buffer[..len];
        match self.relay.read(&path, offset, buf) {
            Ok(count) => reply.data(&buf[..count]),
            Err(err) => reply.error(err),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.path(ino).and_then(|path| self.relay.write(&path, offset, data)) {
            Ok(count) => reply.written(count),
            Err(err) => reply.error(err),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.path(ino).and_then(|path| self.relay.release(&path, flags)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(err) => return reply.error(err),
        };
        // The listing is requested anew for every chunk, offsets are positions in it
        let names = match self.relay.readdir(&path) {
            Ok(names) => names,
            Err(err) => return reply.error(err),
        };
        for (i, name) in names.iter().enumerate().skip(offset.max(0) as usize) {
            let entry = path.join(name);
            let ino = self.inodes.find(&entry).unwrap_or(UNKNOWN_INO);
            // Directory walkers trust the entry type, so ask for it
            let kind = match self.relay.getattr(&entry) {
                Ok(attr) if attr.is_dir() => FileType::Directory,
                _ => FileType::RegularFile,
            };
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(err) => return reply.error(err),
        };
        match self.relay.create(&path) {
            Ok(()) => {
                let ino = self.inodes.lookup(&path);
                reply.created(&TTL, &self.file_attr(ino, &Attr::file(0)), 0, 0, FOPEN_DIRECT_IO);
            }
            Err(err) => reply.error(err),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let paths = self.child(parent, name).and_then(|from| Ok((from, self.child(newparent, newname)?)));
        let (from, to) = match paths {
            Ok(paths) => paths,
            Err(err) => return reply.error(err),
        };
        match self.relay.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(err),
        }
    }
}
