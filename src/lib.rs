//! FUSE filesystem relayed to a host.
//!
//! A session mounts a filesystem whose operations are answered by a host through a single-slot
//! call channel. Kernel requests are received on a dedicated session thread; each operation
//! places a request into the channel and blocks until the host posts a response, so the host
//! never has to be reentrant and sees at most one operation at a time.
//!
//! ```no_run
//! use fuse_relay::{Answer, Responder, SessionBuilder, Stat};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! struct Empty;
//!
//! impl Responder for Empty {
//!     fn getattr(&mut self, path: &Path) -> Answer<Stat> {
//!         Answer::Success(if path == Path::new("/") { Stat::Directory } else { Stat::NotFound })
//!     }
//! }
//!
//! let session = SessionBuilder::new("/mnt/relay").mount().unwrap();
//! while session.is_mounted() {
//!     session.channel().serve_timeout(&mut Empty, Duration::from_millis(100));
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub use crate::call::CallChannel;
pub use crate::channel::{unmount, Connection, MountOptions};
pub use crate::error::InitError;
pub use crate::filesystem::RelayFs;
pub use crate::inode::{InodeTable, ROOT_INO};
pub use crate::relay::{Attr, Relay, Result};
pub use crate::reply::{Completion, Payload, Presence, Response, Stat};
pub use crate::request::{Kind, Request};
pub use crate::responder::{Answer, Responder};
pub use crate::session::{Driver, FuseDriver, Interrupter, Session, SessionBuilder, State};

mod call;
mod channel;
mod error;
mod filesystem;
mod inode;
mod relay;
mod reply;
mod request;
mod responder;
mod session;
