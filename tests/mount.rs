//! Mounts through the kernel FUSE module. Needs `/dev/fuse` and a working `fusermount`, so these
//! tests are ignored by default: `cargo test -- --ignored`.

use fuse_relay::{Answer, CallChannel, Completion, Presence, Responder, Session, SessionBuilder, Stat, State};
use std::ffi::OsString;
use std::fs;
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// A directory is a mount point if its device differs from its parent's. A stat error is taken
// as mounted too, the filesystem may just refuse it.
fn is_mounted(mountpoint: &Path) -> bool {
    let parent = mountpoint.parent().unwrap();
    match fs::metadata(mountpoint) {
        Ok(meta) => meta.dev() != fs::metadata(parent).unwrap().dev(),
        Err(_) => true,
    }
}

struct Hello;

impl Responder for Hello {
    fn getattr(&mut self, path: &Path) -> Answer<Stat> {
        Answer::Success(match path.to_str() {
            Some("/") => Stat::Directory,
            Some("/hello") => Stat::File { size: 13 },
            _ => Stat::NotFound,
        })
    }

    fn readdir(&mut self, _path: &Path) -> Answer<Vec<OsString>> {
        Answer::Success(vec![OsString::from("hello")])
    }

    fn open(&mut self, path: &Path) -> Answer<Presence> {
        Answer::Success(if path == Path::new("/hello") { Presence::Found } else { Presence::NotFound })
    }

    fn release(&mut self, path: &Path) -> Answer<Presence> {
        self.open(path)
    }

    fn read(&mut self, _path: &Path, offset: i64, size: u32) -> Answer<Option<Vec<u8>>> {
        let data = &b"Hello World!\n"[..];
        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        Answer::Success(Some(data[start..end].to_vec()))
    }

    fn create(&mut self, _path: &Path) -> Answer<Completion> {
        Answer::Success(Completion::Failed)
    }
}

// Answer with `Hello` until the channel closes
fn serve_hello(channel: Arc<CallChannel>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !channel.is_closed() {
            channel.serve_timeout(&mut Hello, Duration::from_millis(10));
        }
    })
}

// Stop on another thread, failing if that takes longer than a few seconds
fn stop_in_time(mut session: Session) -> (io::Result<()>, State) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = session.stop();
        let _ = tx.send((result, session.state()));
    });
    rx.recv_timeout(Duration::from_secs(3)).expect("stop did not return")
}

// Serve `Hello` on a background host thread while `f` runs against the mount
fn with_mount<F: FnOnce(&Path)>(f: F) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mountpoint: PathBuf = dir.path().canonicalize().unwrap();
    let mut session = SessionBuilder::new(&mountpoint).fsname("relay-test").mount().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let host = {
        let (channel, done) = (session.channel().clone(), done.clone());
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) && !channel.is_closed() {
                channel.serve_timeout(&mut Hello, Duration::from_millis(10));
            }
        })
    };

    assert!(is_mounted(&mountpoint));
    f(&mountpoint);

    done.store(true, Ordering::SeqCst);
    host.join().unwrap();
    session.stop().unwrap();
    assert!(!session.is_mounted());
    assert!(!is_mounted(&mountpoint));
}

#[test]
#[ignore]
fn read_hello() {
    with_mount(|mountpoint| {
        let names: Vec<_> = fs::read_dir(mountpoint).unwrap().map(|entry| entry.unwrap().file_name()).collect();
        assert_eq!(names, ["hello"]);

        let mut contents = String::new();
        fs::File::open(mountpoint.join("hello")).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "Hello World!\n");

        assert_eq!(fs::metadata(mountpoint.join("missing")).unwrap_err().kind(), ErrorKind::NotFound);
    });
}

#[test]
#[ignore]
fn writers_are_refused() {
    with_mount(|mountpoint| {
        let err = fs::OpenOptions::new().write(true).open(mountpoint.join("hello")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
        let err = fs::File::create(mountpoint.join("new")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    });
}

#[test]
#[ignore]
fn stop_while_host_is_blocked() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mountpoint = dir.path().canonicalize().unwrap();
    let mut session = SessionBuilder::new(&mountpoint).mount().unwrap();

    // Nobody serves the channel, the stat blocks until the session stops
    let stat = {
        let path = mountpoint.join("hello");
        thread::spawn(move || fs::metadata(path))
    };
    while session.channel().waiting().is_none() {
        thread::sleep(Duration::from_millis(5));
    }
    session.stop().unwrap();
    assert!(stat.join().unwrap().is_err());
    assert!(!is_mounted(&mountpoint));
}

#[test]
#[ignore]
fn stop_with_open_file() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mountpoint = dir.path().canonicalize().unwrap();
    let session = SessionBuilder::new(&mountpoint).mount().unwrap();
    let host = serve_hello(session.channel().clone());

    let mut file = fs::File::open(mountpoint.join("hello")).unwrap();
    let (result, state) = stop_in_time(session);
    result.unwrap();
    assert_eq!(state, State::TornDown);
    host.join().unwrap();

    // The connection is gone, the open file with it
    let mut contents = String::new();
    assert!(file.read_to_string(&mut contents).is_err());
    drop(file);
    assert!(!is_mounted(&mountpoint));
}

#[test]
#[ignore]
fn stop_after_external_unmount() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let mountpoint = dir.path().canonicalize().unwrap();
    let session = SessionBuilder::new(&mountpoint).mount().unwrap();
    let host = serve_hello(session.channel().clone());

    let mut file = fs::File::open(mountpoint.join("hello")).unwrap();
    fuse_relay::unmount(&mountpoint).unwrap();
    assert!(!is_mounted(&mountpoint));

    // Detached, but still serving the open file
    let mut contents = String::new();
    file.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "Hello World!\n");
    assert_eq!(session.state(), State::Looping);

    let (result, state) = stop_in_time(session);
    result.unwrap();
    assert_eq!(state, State::TornDown);
    host.join().unwrap();
    drop(file);
}
