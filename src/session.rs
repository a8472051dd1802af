//! Filesystem session.
//!
//! A session begins by mounting the relay filesystem and ends by unmounting it. While mounted, a
//! dedicated thread runs the session loop, which receives kernel requests and answers them by
//! relaying to the host through the session's call channel. The thread that requested the mount
//! stays free to act as the host.
//!
//! Lifecycle: `Unmounted` → `Mounted` → `Looping` → `Stopping` → `TornDown`. Every path out of
//! the loop, including failed initialization and unwinding, releases the filesystem instance
//! before the mount and ends in `TornDown`.

use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::call::CallChannel;
use crate::channel::{Connection, MountOptions};
use crate::error::InitError;
use crate::filesystem::RelayFs;
use crate::relay::Relay;


/// Extra room in the read working buffer beyond the largest read.
const BUFFER_HEADROOM: usize = 4096;


/// Observable session state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Initialization has not finished.
    Unmounted,
    /// Mounted, the loop has not started receiving yet.
    Mounted,
    /// The loop is receiving and dispatching kernel requests.
    Looping,
    /// Exit was requested or the loop ended, resources are being released.
    Stopping,
    /// Instance and mount are released.
    TornDown,
}


/// Wakes a session loop blocked in `Driver::serve`, usually by unmounting.
pub struct Interrupter(Box<dyn FnMut() -> io::Result<()> + Send>);

impl Interrupter {
    pub fn new<F: FnMut() -> io::Result<()> + Send + 'static>(f: F) -> Self {
        Interrupter(Box::new(f))
    }

    pub fn interrupt(&mut self) -> io::Result<()> {
        (self.0)()
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interrupter")
    }
}


/// Native FUSE layer used by a session.
///
/// All methods are called on the session thread. A mount and the instance created on it are
/// dropped there too, the instance first.
pub trait Driver: Send + 'static {
    /// A mounted path with the filesystem serving it. Dropping it unmounts.
    type Mount;
    /// Control over the kernel connection of a mount.
    type Instance;

    /// Mount the given path, served by `fs`.
    fn mount(&mut self, mountpoint: &Path, fs: RelayFs, options: &MountOptions) -> io::Result<Self::Mount>;

    /// Attach to the kernel connection of a mount.
    fn instantiate(&mut self, mount: &mut Self::Mount, mountpoint: &Path) -> io::Result<Self::Instance>;

    /// Returns a handle that makes a blocked or future `serve` call on this mount return, even
    /// while files are open or after the path was unmounted by someone else.
    fn interrupter(&self, mount: &mut Self::Mount, instance: &Self::Instance) -> Interrupter;

    /// Receive and dispatch kernel requests until the filesystem goes away (`Ok`) or receiving
    /// fails.
    fn serve(&mut self, mount: &mut Self::Mount) -> io::Result<()>;
}


/// Driver using the kernel FUSE module through `fuser`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FuseDriver;

impl Driver for FuseDriver {
    type Mount = fuser::Session<RelayFs>;
    type Instance = Connection;

    fn mount(&mut self, mountpoint: &Path, fs: RelayFs, options: &MountOptions) -> io::Result<Self::Mount> {
        fuser::Session::new(fs, mountpoint, &options.to_mount_options())
    }

    fn instantiate(&mut self, _mount: &mut Self::Mount, mountpoint: &Path) -> io::Result<Connection> {
        Connection::find(mountpoint)
    }

    fn interrupter(&self, mount: &mut Self::Mount, connection: &Connection) -> Interrupter {
        let mut unmounter = mount.unmount_callable();
        let connection = connection.clone();
        Interrupter::new(move || {
            unmounter.unmount()?;
            connection.shut_down()
        })
    }

    fn serve(&mut self, mount: &mut Self::Mount) -> io::Result<()> {
        mount.run()
    }
}


#[derive(Debug)]
struct Control {
    state: State,
    init: Option<Result<(), InitError>>,
    reported: bool,
    exit: bool,
    left_loop: bool,
    interrupter: Option<Interrupter>,
}

/// State shared between the session handle and the session thread.
#[derive(Debug)]
struct Lifecycle {
    control: Mutex<Control>,
    cond: Condvar,
}

impl Lifecycle {
    fn new() -> Self {
        let control = Control {
            state: State::Unmounted,
            init: None,
            reported: false,
            exit: false,
            left_loop: false,
            interrupter: None,
        };
        Self { control: Mutex::new(control), cond: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, control: MutexGuard<'a, Control>) -> MutexGuard<'a, Control> {
        self.cond.wait(control).unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> State {
        self.lock().state
    }

    fn report(&self, result: Result<(), InitError>, interrupter: Option<Interrupter>) {
        let mut control = self.lock();
        if result.is_ok() {
            control.state = State::Mounted;
            control.interrupter = interrupter;
        }
        control.init = Some(result);
        control.reported = true;
        self.cond.notify_all();
    }

    fn wait_init(&self) -> Result<(), InitError> {
        let mut control = self.lock();
        loop {
            if let Some(result) = control.init.take() {
                return result;
            }
            control = self.wait(control);
        }
    }

    // Returns false if the loop should exit instead of receiving
    fn enter_loop(&self) -> bool {
        let mut control = self.lock();
        if control.exit {
            return false;
        }
        if control.state != State::Looping {
            control.state = State::Looping;
            self.cond.notify_all();
        }
        true
    }

    fn leave_loop(&self) {
        let mut control = self.lock();
        control.state = State::Stopping;
        control.left_loop = true;
        control.interrupter = None;
        self.cond.notify_all();
    }

    fn wait_torn_down(&self) {
        let mut control = self.lock();
        while control.state != State::TornDown {
            control = self.wait(control);
        }
    }
}

/// Marks the session torn down when dropped. Declared before the mount and instance on the
/// session thread so it drops after them, on every exit path.
struct TearDown {
    lifecycle: Arc<Lifecycle>,
    channel: Arc<CallChannel>,
}

impl Drop for TearDown {
    fn drop(&mut self) {
        // Nothing can be relayed anymore, let the host side wind down
        self.channel.close();
        let mut control = self.lifecycle.lock();
        if !control.reported {
            let err = io::Error::new(io::ErrorKind::Other, "session thread ended during initialization");
            control.init = Some(Err(InitError::Thread(err)));
            control.reported = true;
        }
        control.state = State::TornDown;
        control.interrupter = None;
        self.lifecycle.cond.notify_all();
        debug!("Session torn down");
    }
}


fn parse_target(mountpoint: &Path) -> Result<PathBuf, InitError> {
    match mountpoint.canonicalize() {
        Ok(path) if path.is_dir() => Ok(path),
        _ => Err(InitError::BadArguments(mountpoint.to_owned())),
    }
}

fn allocate(size: usize) -> Result<Vec<u8>, InitError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(size).map_err(|source| InitError::Allocation { size, source })?;
    buffer.resize(size, 0);
    Ok(buffer)
}

// Body of the session thread
fn run<D: Driver>(
    mut driver: D,
    mountpoint: PathBuf,
    options: MountOptions,
    channel: Arc<CallChannel>,
    lifecycle: Arc<Lifecycle>,
) -> io::Result<()> {
    let _torn_down = TearDown { lifecycle: lifecycle.clone(), channel: channel.clone() };

    let target = match parse_target(&mountpoint) {
        Ok(target) => target,
        Err(err) => {
            lifecycle.report(Err(err), None);
            return Ok(());
        }
    };
    // Filled once the instance exists, the kernel sends no read before the loop starts
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let fs = RelayFs::new(Relay::new(channel.clone()), buffer.clone());
    let mut mount = match driver.mount(&target, fs, &options) {
        Ok(mount) => mount,
        Err(err) => {
            lifecycle.report(Err(InitError::Mount(err)), None);
            return Ok(());
        }
    };
    let instance = match driver.instantiate(&mut mount, &target) {
        Ok(instance) => instance,
        Err(err) => {
            lifecycle.report(Err(InitError::InstanceCreation(err)), None);
            return Ok(());
        }
    };
    match allocate(options.max_read.saturating_add(BUFFER_HEADROOM)) {
        Ok(allocated) => *buffer.lock().unwrap_or_else(PoisonError::into_inner) = allocated,
        Err(err) => {
            lifecycle.report(Err(err), None);
            return Ok(());
        }
    }
    info!("Mounted {}", target.display());
    lifecycle.report(Ok(()), Some(driver.interrupter(&mut mount, &instance)));

    let result = loop {
        if !lifecycle.enter_loop() {
            break Ok(());
        }
        match driver.serve(&mut mount) {
            Ok(()) => break Ok(()),
            Err(err) => match err.raw_os_error() {
                // Operation interrupted. Accordingly to FUSE, this is safe to retry
                Some(libc::ENOENT) => continue,
                // Interrupted system call, retry
                Some(libc::EINTR) => continue,
                // Explicitly try again
                Some(libc::EAGAIN) => continue,
                // Filesystem was unmounted, quit the loop
                Some(libc::ENODEV) | Some(libc::EBADF) => break Ok(()),
                // Unhandled error
                _ => {
                    error!("Lost connection to FUSE device: {}", err);
                    break Err(err);
                }
            },
        }
    };

    lifecycle.leave_loop();
    info!("Unmounting {}", target.display());
    drop(instance);
    drop(mount);
    result
}


/// Builder for a mounted session.
#[derive(Debug)]
pub struct SessionBuilder<D = FuseDriver> {
    mountpoint: PathBuf,
    options: MountOptions,
    driver: D,
}

impl SessionBuilder<FuseDriver> {
    /// Start building a session mounted at `mountpoint`, which must be an existing directory.
    pub fn new<P: AsRef<Path>>(mountpoint: P) -> Self {
        Self { mountpoint: mountpoint.as_ref().to_owned(), options: MountOptions::default(), driver: FuseDriver }
    }
}

impl<D: Driver> SessionBuilder<D> {
    /// Name shown as the mount source.
    pub fn fsname<S: Into<String>>(mut self, fsname: S) -> Self {
        self.options.fsname = fsname.into();
        self
    }

    /// Allow users other than the mounting one to access the filesystem.
    pub fn allow_other(mut self, allow_other: bool) -> Self {
        self.options.allow_other = allow_other;
        self
    }

    /// Largest read the kernel may request. Sizes the working buffer.
    pub fn max_read_size(mut self, size: usize) -> Self {
        self.options.max_read = size;
        self
    }

    /// Use a different native layer.
    pub fn driver<E: Driver>(self, driver: E) -> SessionBuilder<E> {
        SessionBuilder { mountpoint: self.mountpoint, options: self.options, driver }
    }

    /// Mount the filesystem and start the session loop on a new thread.
    ///
    /// Blocks until the mount either succeeded or failed. On success, the session's call
    /// channel carries the filesystem operations that need answering.
    pub fn mount(self) -> Result<Session, InitError> {
        let SessionBuilder { mountpoint, options, driver } = self;
        info!("Mounting {}", mountpoint.display());

        let channel = Arc::new(CallChannel::new());
        let lifecycle = Arc::new(Lifecycle::new());
        let thread = {
            let (mountpoint, channel, lifecycle) = (mountpoint.clone(), channel.clone(), lifecycle.clone());
            thread::Builder::new()
                .name(String::from("fuse-relay"))
                .spawn(move || run(driver, mountpoint, options, channel, lifecycle))
                .map_err(InitError::Thread)?
        };

        let mut session = Session { mountpoint, channel, lifecycle, thread: Some(thread) };
        match session.lifecycle.wait_init() {
            Ok(()) => Ok(session),
            Err(err) => {
                warn!("Mounting {} failed: {}", session.mountpoint.display(), err);
                if let Err(err) = session.join_thread() {
                    debug!("Session thread: {}", err);
                }
                Err(err)
            }
        }
    }
}


/// A mounted filesystem served by a session thread.
///
/// Dropping the session stops it.
#[derive(Debug)]
pub struct Session {
    mountpoint: PathBuf,
    channel: Arc<CallChannel>,
    lifecycle: Arc<Lifecycle>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl Session {
    /// Start building a session mounted at `mountpoint`.
    pub fn builder<P: AsRef<Path>>(mountpoint: P) -> SessionBuilder {
        SessionBuilder::new(mountpoint)
    }

    /// Returns the call channel the host answers filesystem operations on.
    pub fn channel(&self) -> &Arc<CallChannel> {
        &self.channel
    }

    /// Returns the mount path as given.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Returns true until the session is torn down.
    pub fn is_mounted(&self) -> bool {
        self.state() != State::TornDown
    }

    /// Stop the session and wait until it is torn down.
    ///
    /// Closes the call channel, so a blocked operation fails instead of waiting for a host that
    /// may be the caller itself, then unmounts and ends the kernel connection to wake the loop.
    /// Files still open on the filesystem fail from then on. Stopping a session whose path was
    /// unmounted already, or a torn down one, succeeds as well.
    pub fn stop(&mut self) -> io::Result<()> {
        let interrupter = {
            let mut control = self.lifecycle.lock();
            if control.state != State::TornDown {
                control.exit = true;
                control.state = State::Stopping;
                self.lifecycle.cond.notify_all();
            }
            control.interrupter.take()
        };
        self.channel.close();

        if let Some(mut interrupter) = interrupter {
            info!("Unmounting {}", self.mountpoint.display());
            if let Err(err) = interrupter.interrupt() {
                error!("Failed to unmount {}: {}", self.mountpoint.display(), err);
                let mut control = self.lifecycle.lock();
                // Keep it for a retry unless the loop is ending anyway
                if !control.left_loop && control.state != State::TornDown {
                    control.interrupter = Some(interrupter);
                    return Err(err);
                }
            }
        }

        self.lifecycle.wait_torn_down();
        self.join_thread()
    }

    /// Wait for the session to end on its own, e.g. by an external unmount.
    ///
    /// Requests must be answered from another thread meanwhile.
    pub fn join(mut self) -> io::Result<()> {
        self.lifecycle.wait_torn_down();
        self.join_thread()
    }

    fn join_thread(&mut self) -> io::Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "session thread panicked"))),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("Stopping session at {}: {}", self.mountpoint.display(), err);
        }
    }
}
