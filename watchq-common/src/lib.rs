use core::fmt::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::path::PathBuf;

pub const METADATA_VERSION: u8 = 3;

/// Fixed-layout record the kernel notification channel writes for every
/// observed file operation. Field order and widths match the wire format,
/// decode with a single raw read.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct EventMetadata {
    pub event_len: u32,
    pub vers: u8,
    pub reserved: u8,
    pub metadata_len: u16,
    pub mask: u64,
    pub fd: i32,
    pub pid: i32,
}

impl EventMetadata {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Interest kinds set in this record's event bitmask.
    pub fn kinds(&self) -> Vec<InterestKind> {
        InterestKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.mask & u64::from(*kind) != 0)
            .collect()
    }
}

/// File operations a mark can subscribe to.
#[repr(u64)]
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum InterestKind {
    Access = 0x01,
    Modify = 0x02,
    CloseWrite = 0x08,
    CloseNoWrite = 0x10,
    Open = 0x20,
}

impl InterestKind {
    pub const ALL: [InterestKind; 5] = [
        InterestKind::Access,
        InterestKind::Modify,
        InterestKind::CloseWrite,
        InterestKind::CloseNoWrite,
        InterestKind::Open,
    ];
}

/// Options applied when registering a mark.
#[repr(u32)]
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum MarkOption {
    DontFollow = 0x04,
    OnlyDir = 0x08,
    Mount = 0x10,
}

/// One file under external declarative management.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedFile {
    pub id: String,
    pub environment: String,
    pub rule_set: String,
    pub path: PathBuf,
}

impl ManagedFile {
    /// The path defaults to the identifier unless overridden with
    /// [`ManagedFile::with_path`].
    pub fn new(
        id: impl Into<String>,
        environment: impl Into<String>,
        rule_set: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            path: PathBuf::from(&id),
            id,
            environment: environment.into(),
            rule_set: rule_set.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}

/// Decoded change observed by the mount-wide backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub pid: i32,
    pub path: PathBuf,
    pub cmdline: Option<Vec<String>>,
    pub user: Option<String>,
    pub deleted: bool,
}

impl Display for ChangeEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let cmdstr = match &self.cmdline {
            Some(cmdline) if !cmdline.is_empty() => format!(" [{}]", cmdline[0]),
            _ => String::new(),
        };
        let delstr = match self.deleted {
            true => " deleted file",
            false => "",
        };
        write!(
            f,
            "<change to{} {} by {}{}>",
            delstr,
            self.path.display(),
            self.pid,
            cmdstr
        )
    }
}

/// Change to a managed file observed by the per-file watch backend,
/// enriched with the pending-change diff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedChangeEvent {
    pub id: String,
    pub path: PathBuf,
    pub environment: String,
    pub rule_set: String,
    pub diff: String,
}
