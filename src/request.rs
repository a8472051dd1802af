//! Filesystem operation request
//!
//! A request represents information about a filesystem operation the kernel driver wants the
//! host to decide on. Each variant carries exactly the inputs its operation needs.

use std::fmt;
use std::path::{Path, PathBuf};

/// Operation kind.
///
/// Dispatch tag of a request, one per relayed filesystem call.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Kind {
    Getattr,
    Readdir,
    Open,
    Release,
    Read,
    Write,
    Create,
    Rename,
    Truncate,
}

impl Kind {
    /// Name of the operation as the host knows it.
    pub fn name(self) -> &'static str {
        match self {
            Kind::Getattr => "getattr",
            Kind::Readdir => "readdir",
            Kind::Open => "open",
            Kind::Release => "release",
            Kind::Read => "read",
            Kind::Write => "write",
            Kind::Create => "create",
            Kind::Rename => "rename",
            Kind::Truncate => "truncate",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request data structure
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Get attributes of the entry at `path`.
    Getattr { path: PathBuf },
    /// List the directory at `path`.
    Readdir { path: PathBuf },
    /// Open the file at `path` (read-only access is checked before relaying).
    Open { path: PathBuf },
    /// Release a previously opened file.
    Release { path: PathBuf },
    /// Read up to `size` bytes starting at `offset`.
    Read { path: PathBuf, offset: i64, size: u32 },
    /// Write `data` starting at `offset`.
    Write { path: PathBuf, offset: i64, data: Vec<u8> },
    /// Create a regular file.
    Create { path: PathBuf },
    /// Move `from` to `to`.
    Rename { from: PathBuf, to: PathBuf },
    /// Set the length of the file at `path`.
    Truncate { path: PathBuf, size: u64 },
}

impl Request {
    /// Returns the operation kind of this request.
    pub fn kind(&self) -> Kind {
        match self {
            Request::Getattr { .. } => Kind::Getattr,
            Request::Readdir { .. } => Kind::Readdir,
            Request::Open { .. } => Kind::Open,
            Request::Release { .. } => Kind::Release,
            Request::Read { .. } => Kind::Read,
            Request::Write { .. } => Kind::Write,
            Request::Create { .. } => Kind::Create,
            Request::Rename { .. } => Kind::Rename,
            Request::Truncate { .. } => Kind::Truncate,
        }
    }

    /// Returns the path the request operates on. For a rename, this is the source path.
    pub fn path(&self) -> &Path {
        match self {
            Request::Getattr { path }
            | Request::Readdir { path }
            | Request::Open { path }
            | Request::Release { path }
            | Request::Read { path, .. }
            | Request::Write { path, .. }
            | Request::Create { path }
            | Request::Truncate { path, .. } => path,
            Request::Rename { from, .. } => from,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Read { path, offset, size } => {
                write!(f, "READ {} offset {}, size {}", path.display(), offset, size)
            }
            Request::Write { path, offset, data } => {
                write!(f, "WRITE {} offset {}, size {}", path.display(), offset, data.len())
            }
            Request::Rename { from, to } => {
                write!(f, "RENAME {} -> {}", from.display(), to.display())
            }
            Request::Truncate { path, size } => {
                write!(f, "TRUNCATE {} size {}", path.display(), size)
            }
            request => write!(
                f,
                "{} {}",
                request.kind().name().to_uppercase(),
                request.path().display()
            ),
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_of_each_variant() {
        let path = PathBuf::from("/a");
        assert_eq!(Request::Getattr { path: path.clone() }.kind(), Kind::Getattr);
        assert_eq!(Request::Readdir { path: path.clone() }.kind(), Kind::Readdir);
        assert_eq!(Request::Open { path: path.clone() }.kind(), Kind::Open);
        assert_eq!(Request::Release { path: path.clone() }.kind(), Kind::Release);
        assert_eq!(Request::Read { path: path.clone(), offset: 0, size: 1 }.kind(), Kind::Read);
        assert_eq!(Request::Write { path: path.clone(), offset: 0, data: vec![] }.kind(), Kind::Write);
        assert_eq!(Request::Create { path: path.clone() }.kind(), Kind::Create);
        assert_eq!(Request::Truncate { path: path.clone(), size: 0 }.kind(), Kind::Truncate);
        let rename = Request::Rename { from: path, to: PathBuf::from("/b") };
        assert_eq!(rename.kind(), Kind::Rename);
        assert_eq!(rename.path(), Path::new("/a"));
    }

    #[test]
    fn display() {
        let req = Request::Read { path: PathBuf::from("/hello"), offset: 4, size: 10 };
        assert_eq!(format!("{}", req), "READ /hello offset 4, size 10");
        let req = Request::Getattr { path: PathBuf::from("/") };
        assert_eq!(format!("{}", req), "GETATTR /");
        assert_eq!(format!("{}", Kind::Truncate), "truncate");
    }
}
