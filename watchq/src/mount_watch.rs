use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::thread;

use crate::fanotify::Fanotify;
use crate::managed::{snapshot_paths, ManagedSetProvider};
use crate::queue::EventQueue;
use crate::resolve::resolve;
use crate::WatchConfig;
use watchq_common::{ChangeEvent, EventMetadata, InterestKind, MarkOption};

/// Mount-wide backend: one close-write mark on the root mount, decoded
/// records filtered by exact path against the managed snapshot.
pub struct MountWatch {
    inner: Arc<MountInner>,
}

struct MountInner {
    fan: Fanotify,
    files: HashSet<PathBuf>,
    queue: EventQueue<ChangeEvent>,
    started: Once,
}

impl MountWatch {
    /// Open the channel, mark the root mount, and snapshot the managed
    /// set. All fatal conditions surface here; `poll` cannot fail.
    pub fn new(provider: &dyn ManagedSetProvider) -> Result<Self> {
        let fan = Fanotify::init(false, true, false)?;
        fan.mark(
            Path::new("/"),
            &[InterestKind::CloseWrite],
            &[MarkOption::Mount],
        )?;
        let files = snapshot_paths(&provider.list_managed()?);
        info!("mount watch covering {} managed path(s)", files.len());
        Ok(Self {
            inner: Arc::new(MountInner {
                fan,
                files,
                queue: EventQueue::new(),
                started: Once::new(),
            }),
        })
    }

    pub fn validate(&self, _config: &WatchConfig) -> bool {
        true
    }

    /// Drain everything queued since the last poll. Starts the producer
    /// thread on first use; racing first polls still create exactly one.
    pub fn poll(&self, _config: &WatchConfig) -> Vec<ChangeEvent> {
        let inner = Arc::clone(&self.inner);
        self.inner.started.call_once(move || {
            let spawned = thread::Builder::new()
                .name("watchq-mount".to_string())
                .spawn(move || pump(inner.fan.events(), &inner.files, &inner.queue));
            if let Err(err) = spawned {
                error!("cannot start the notifier thread: {err}");
            }
        });
        self.inner.queue.drain()
    }
}

/// Producer loop body: decode, resolve, filter, enqueue. A failure on one
/// record never stops the stream.
fn pump(
    records: impl IntoIterator<Item = EventMetadata>,
    files: &HashSet<PathBuf>,
    queue: &EventQueue<ChangeEvent>,
) {
    info!("notifier thread running");
    for meta in records {
        debug!("record {:?} from pid {}", meta.kinds(), meta.pid);
        match resolve(meta) {
            Ok(event) => offer(files, queue, event),
            Err(err) => warn!("failed to resolve record: {err:#}"),
        }
    }
}

/// Exact-path membership gate in front of the queue. Non-managed paths are
/// dropped without noise.
fn offer(files: &HashSet<PathBuf>, queue: &EventQueue<ChangeEvent>, event: ChangeEvent) {
    match files.contains(&event.path) {
        true => queue.push(event),
        false => debug!("ignoring {}", event.path.display()),
    }
}
