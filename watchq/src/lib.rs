//! Watch a managed set of files and bridge kernel change notifications to a
//! polling consumer through an in-process queue.
//!
//! Two backends: [`MountWatch`] observes the whole root mount through the
//! kernel notification channel and filters by path; [`ManagedWatch`] arms
//! one watch per managed file, re-arms watches the kernel drops, and
//! attaches a pending-change diff to every queued event.

pub mod diff;
pub mod fanotify;
pub mod managed;
pub mod managed_watch;
pub mod mount_watch;
pub mod queue;
pub mod resolve;
pub mod setup;

pub use diff::{ChangeSet, NoPendingChanges, PendingChangeProvider, RuleOutcome};
pub use managed::{DirSet, ManagedSetProvider, StaticSet};
pub use managed_watch::ManagedWatch;
pub use mount_watch::MountWatch;
pub use queue::EventQueue;
pub use watchq_common::{
    ChangeEvent, EventMetadata, InterestKind, ManagedChangeEvent, ManagedFile, MarkOption,
};

/// Poll-entry configuration. There are no required fields; any value is
/// accepted by [`MountWatch::validate`] and [`ManagedWatch::validate`].
#[derive(Clone, Debug)]
pub struct WatchConfig {
    pub interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}
