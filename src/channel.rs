//! FUSE kernel driver connection.
//!
//! Mounting itself is done by `fuser`. This module turns session options into `fuser` mount
//! options, finds the kernel connection serving a mount point and ends it. A mount that is only
//! detached stays connected until the last open file is closed; aborting the connection through
//! the fusectl filesystem fails those files and makes the receive loop return at once.

use fuser::MountOption;
use log::{debug, warn};
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::process::Command;


/// Helper binaries tried in order for unprivileged unmounts.
const FUSERMOUNT: &[&str] = &["fusermount3", "fusermount"];

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mount point of the fusectl control filesystem.
const CONNECTIONS: &str = "/sys/fs/fuse/connections";

/// Mount options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountOptions {
    /// Name shown as the mount source, e.g. in `/proc/mounts`.
    pub fsname: String,
    /// Let users other than the mounting one access the filesystem.
    pub allow_other: bool,
    /// Largest read request the kernel may send.
    pub max_read: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { fsname: String::from("fuse-relay"), allow_other: false, max_read: 128 * 1024 }
    }
}

impl MountOptions {
    /// Options passed to `fuser` when mounting.
    pub fn to_mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fsname.replace(',', "_")),
            MountOption::Subtype(String::from("relay")),
            MountOption::NoSuid,
            MountOption::NoDev,
            MountOption::CUSTOM(format!("max_read={}", self.max_read)),
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }
}


/// The kernel connection serving a FUSE mount.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Connection {
    mountpoint: PathBuf,
    id: Option<u32>,
}

impl Connection {
    /// Look up the connection of the FUSE filesystem mounted at `mountpoint`.
    ///
    /// Never touches the mounted filesystem itself, so it is safe to call before anybody
    /// serves it. A mount point not found leaves the connection unknown; it can then only be
    /// ended by unmounting.
    pub fn find(mountpoint: &Path) -> io::Result<Connection> {
        let id = mounted_fuse(&fs::read_to_string(MOUNTINFO)?, mountpoint);
        match id {
            Some(id) => debug!("{} is served by FUSE connection {}", mountpoint.display(), id),
            None => warn!("No FUSE connection found for {}", mountpoint.display()),
        }
        Ok(Connection { mountpoint: mountpoint.to_owned(), id })
    }

    /// Returns the connection number, the minor device number of the mounted filesystem.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Returns the path the connection was mounted at.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Detach the mount if it is still attached, then abort the connection.
    ///
    /// Succeeds if the filesystem was unmounted already, by us or anybody else.
    pub fn shut_down(&self) -> io::Result<()> {
        detach(&self.mountpoint)?;
        self.abort()
    }

    /// Abort the connection. Pending and future requests fail with `ENOTCONN` and the kernel
    /// driver descriptor reports the filesystem gone.
    pub fn abort(&self) -> io::Result<()> {
        let id = match self.id {
            Some(id) => id,
            None => return Ok(()),
        };
        let path = Path::new(CONNECTIONS).join(id.to_string()).join("abort");
        match OpenOptions::new().write(true).open(&path).and_then(|mut file| file.write_all(b"1")) {
            Ok(()) => {
                debug!("Aborted FUSE connection {}", id);
                Ok(())
            }
            // The connection ended with its last user
            Err(err) if err.kind() == io::ErrorKind::NotFound && Path::new(CONNECTIONS).is_dir() => Ok(()),
            Err(err) => {
                warn!("Unable to abort FUSE connection {} ({}): {}", id, path.display(), err);
                Ok(())
            }
        }
    }
}


/// Returns the connection number of the topmost FUSE filesystem mounted at `mountpoint`
/// according to a mountinfo table.
fn mounted_fuse(mountinfo: &str, mountpoint: &Path) -> Option<u32> {
    mountinfo
        .lines()
        .filter_map(|line| {
            // Optional fields before the separator vary in number
            let (mount, fstype) = line.split_once(" - ")?;
            let fstype = fstype.split(' ').next()?;
            if fstype != "fuse" && !fstype.starts_with("fuse.") {
                return None;
            }
            let fields: Vec<&str> = mount.split(' ').collect();
            let (_, minor) = fields.get(2)?.split_once(':')?;
            let target = unescape(fields.get(4)?);
            if Path::new(&target) == mountpoint {
                minor.parse().ok()
            } else {
                None
            }
        })
        .last()
}

// Mount table paths escape blanks, newlines and backslashes as `\ooo`
fn unescape(field: &str) -> OsString {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let code = bytes.get(i + 1..i + 4).and_then(|digits| std::str::from_utf8(digits).ok());
        match code.and_then(|code| u8::from_str_radix(code, 8).ok()) {
            Some(byte) if bytes[i] == b'\\' => {
                out.push(byte);
                i += 4;
            }
            _ => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    OsString::from_vec(out)
}

/// Returns true if a FUSE filesystem is mounted at `mountpoint`.
fn is_mounted(mountpoint: &Path) -> io::Result<bool> {
    Ok(mounted_fuse(&fs::read_to_string(MOUNTINFO)?, mountpoint).is_some())
}

/// Returns true for unmount errors meaning there is nothing mounted at the path.
fn not_mounted(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOENT))
}

// Lazily unmount the FUSE filesystem at `mountpoint` if there still is one
fn detach(mountpoint: &Path) -> io::Result<()> {
    if !is_mounted(mountpoint)? {
        return Ok(());
    }
    match unmount(mountpoint) {
        Err(err) if not_mounted(&err) => Ok(()),
        result => result,
    }
}

// Run the first fusermount helper found with the given arguments followed by the mountpoint
fn fusermount(args: &[&str], mountpoint: &Path) -> io::Result<()> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "fusermount not found");
    for program in FUSERMOUNT {
        match Command::new(program).args(args).arg(OsStr::new("--")).arg(mountpoint).status() {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} {} failed: {}", program, mountpoint.display(), status),
                ))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => last = err,
            Err(err) => return Err(err),
        }
    }
    Err(last)
}


/// Unmount an arbitrary mount point.
///
/// The mount is detached lazily, so the kernel driver ends the session as soon as the last user
/// of the filesystem is gone.
pub fn unmount(mountpoint: &Path) -> io::Result<()> {
    let path = CString::new(mountpoint.as_os_str().as_bytes())?;
    let rc = unsafe { libc::umount2(path.as_ptr(), libc::MNT_DETACH) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() != io::ErrorKind::PermissionDenied {
        return Err(err);
    }
    // Linux always returns EPERM for non-root users. Go through the setuid-root helper.
    debug!("Unmounting {} through fusermount", mountpoint.display());
    fusermount(&["-u", "-q", "-z"], mountpoint)
}
