//! Session initialization errors.

use std::collections::TryReserveError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Reason a session failed to come up.
///
/// Reported once to the thread that requested the mount. Nothing is retried internally.
#[derive(Debug, Error)]
pub enum InitError {
    /// The mount target is not an existing directory.
    #[error("invalid mount target {}", .0.display())]
    BadArguments(PathBuf),

    /// The kernel refused the mount.
    #[error("unable to mount filesystem: {0}")]
    Mount(#[source] io::Error),

    /// The filesystem instance could not be bound to the mount.
    #[error("unable to create filesystem instance: {0}")]
    InstanceCreation(#[source] io::Error),

    /// The I/O working buffer could not be allocated.
    #[error("unable to allocate {size} byte working buffer")]
    Allocation {
        size: usize,
        #[source]
        source: TryReserveError,
    },

    /// The session thread could not be started or ended before reporting.
    #[error("session thread failed: {0}")]
    Thread(#[source] io::Error),
}
