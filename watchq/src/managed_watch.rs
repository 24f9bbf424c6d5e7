use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::thread;
use std::time::Duration;

use crate::diff::{pending_diff, PendingChangeProvider};
use crate::managed::{snapshot_paths, ManagedSetProvider};
use crate::queue::EventQueue;
use crate::WatchConfig;
use watchq_common::{ManagedChangeEvent, ManagedFile};

const WATCH_MASK: u32 = libc::IN_MODIFY | libc::IN_DELETE_SELF;
const WATCH_BUF_LEN: usize = 4096;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-file backend: one watch per managed path, watches re-armed when the
/// kernel invalidates them, qualifying changes enriched with the pending
/// diff before queueing.
pub struct ManagedWatch {
    inner: Arc<WatchInner>,
}

struct WatchInner {
    ino: Inotify,
    files: Vec<ManagedFile>,
    paths: HashSet<PathBuf>,
    watches: Mutex<HashMap<i32, PathBuf>>,
    queue: EventQueue<ManagedChangeEvent>,
    differ: Arc<dyn PendingChangeProvider>,
    started: Once,
}

impl ManagedWatch {
    pub fn new(
        provider: &dyn ManagedSetProvider,
        differ: Arc<dyn PendingChangeProvider>,
    ) -> Result<Self> {
        let ino = Inotify::init()?;
        let files = provider.list_managed()?;
        info!("arming {} watch(es)", files.len());
        let mut watches = HashMap::new();
        for file in &files {
            match ino.add_watch(&file.path, WATCH_MASK) {
                Ok(wd) => {
                    debug!("watching {}", file.path.display());
                    watches.insert(wd, file.path.clone());
                }
                Err(err) => warn!("cannot watch {}: {err:#}", file.path.display()),
            }
        }
        let paths = snapshot_paths(&files);
        Ok(Self {
            inner: Arc::new(WatchInner {
                ino,
                files,
                paths,
                watches: Mutex::new(watches),
                queue: EventQueue::new(),
                differ,
                started: Once::new(),
            }),
        })
    }

    pub fn validate(&self, _config: &WatchConfig) -> bool {
        true
    }

    pub fn poll(&self, _config: &WatchConfig) -> Vec<ManagedChangeEvent> {
        let inner = Arc::clone(&self.inner);
        self.inner.started.call_once(move || {
            let spawned = thread::Builder::new()
                .name("watchq-watch".to_string())
                .spawn(move || watch_loop(&inner));
            if let Err(err) = spawned {
                error!("cannot start the watch thread: {err}");
            }
        });
        self.inner.queue.drain()
    }
}

fn watch_loop(inner: &WatchInner) {
    info!("watch thread running");
    let mut buf = BytesMut::zeroed(WATCH_BUF_LEN);
    loop {
        let n = match inner.ino.read(&mut buf) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!("failed to read from the watch descriptor: {err}");
                thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
        };
        for record in parse_watch_records(&buf[..n]) {
            dispatch(inner, record);
        }
    }
}

/// Route one watch record: invalidations re-arm silently, data changes are
/// checked against the snapshot, enriched, and queued.
fn dispatch(inner: &WatchInner, record: WatchRecord) {
    let path = {
        let watches = lock(&inner.watches);
        match watches.get(&record.wd) {
            Some(path) => path.clone(),
            None => {
                debug!("record for unknown watch {}", record.wd);
                return;
            }
        }
    };
    if record.mask & libc::IN_IGNORED != 0 {
        rearm(inner, record.wd, path);
        return;
    }
    if record.mask & WATCH_MASK == 0 {
        return;
    }
    if !inner.paths.contains(&path) {
        debug!("ignoring {}", path.display());
        return;
    }
    let Some(file) = inner.files.iter().find(|f| f.path == path) else {
        return;
    };
    let diff = pending_diff(inner.differ.as_ref(), file);
    inner.queue.push(ManagedChangeEvent {
        id: file.id.clone(),
        path: file.path.clone(),
        environment: file.environment.clone(),
        rule_set: file.rule_set.clone(),
        diff,
    });
}

/// The kernel dropped the watch; register the same path with the same mask
/// and carry on. Never surfaces to the consumer.
fn rearm(inner: &WatchInner, old_wd: i32, path: PathBuf) {
    let mut watches = lock(&inner.watches);
    watches.remove(&old_wd);
    match inner.ino.add_watch(&path, WATCH_MASK) {
        Ok(wd) => {
            debug!("re-armed watch for {}", path.display());
            watches.insert(wd, path);
        }
        Err(err) => warn!("cannot re-arm watch for {}: {err:#}", path.display()),
    }
}

fn lock(watches: &Mutex<HashMap<i32, PathBuf>>) -> MutexGuard<'_, HashMap<i32, PathBuf>> {
    watches.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-path watch descriptor channel.
struct Inotify {
    fd: OwnedFd,
}

impl Inotify {
    fn init() -> Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("cannot open the watch descriptor");
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn add_watch(&self, path: &Path, mask: u32) -> Result<i32> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .context("watch path contains an interior NUL")?;
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), mask) };
        if wd < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("cannot watch {}", path.display()));
        }
        Ok(wd)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[derive(Clone, Copy, Debug)]
struct WatchRecord {
    wd: i32,
    mask: u32,
}

/// Records are a fixed header plus a trailing name of `len` bytes; the
/// name only appears for directory watches and is not used here.
fn parse_watch_records(buf: &[u8]) -> Vec<WatchRecord> {
    const HEADER: usize = std::mem::size_of::<libc::inotify_event>();
    let mut records = Vec::new();
    let mut offset = 0usize;
    while buf.len().saturating_sub(offset) >= HEADER {
        let event = unsafe {
            buf.as_ptr()
                .add(offset)
                .cast::<libc::inotify_event>()
                .read_unaligned()
        };
        records.push(WatchRecord {
            wd: event.wd,
            mask: event.mask,
        });
        offset += HEADER + event.len as usize;
    }
    records
}
