use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, error, warn};
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use watchq_common::{EventMetadata, InterestKind, MarkOption, METADATA_VERSION};

const EVENT_BUF_LEN: usize = 4096;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Mount-wide kernel notification channel.
pub struct Fanotify {
    fd: OwnedFd,
}

impl Fanotify {
    /// Open the notification channel. Requires CAP_SYS_ADMIN; failure here
    /// is fatal for the backend and is not retried.
    pub fn init(nonblock: bool, unlimited_queue: bool, unlimited_marks: bool) -> Result<Self> {
        let mut flags = libc::FAN_CLOEXEC | libc::FAN_CLASS_NOTIF;
        if nonblock {
            flags |= libc::FAN_NONBLOCK;
        }
        if unlimited_queue {
            flags |= libc::FAN_UNLIMITED_QUEUE;
        }
        if unlimited_marks {
            flags |= libc::FAN_UNLIMITED_MARKS;
        }
        let fd = unsafe { libc::fanotify_init(flags, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error())
                .context("cannot open the kernel notification channel");
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Register interest in `kinds` on `path`, with `MarkOption::Mount`
    /// extending the mark to the whole mount the path sits on.
    pub fn mark(&self, path: &Path, kinds: &[InterestKind], options: &[MarkOption]) -> Result<()> {
        let mut flags = libc::FAN_MARK_ADD;
        for option in options {
            flags |= u32::from(*option);
        }
        let mut mask = 0u64;
        for kind in kinds {
            mask |= u64::from(*kind);
        }
        let c_path = CString::new(path.as_os_str().as_bytes())
            .context("mark path contains an interior NUL")?;
        let rc = unsafe {
            libc::fanotify_mark(self.fd.as_raw_fd(), flags, mask, libc::AT_FDCWD, c_path.as_ptr())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("cannot mark {}", path.display()));
        }
        Ok(())
    }

    /// Lazy infinite sequence of kernel records. Blocks until at least one
    /// record is available. Meant for a single consumer: the producer
    /// thread.
    pub fn events(&self) -> Events<'_> {
        Events {
            fan: self,
            buf: BytesMut::zeroed(EVENT_BUF_LEN),
            pending: VecDeque::new(),
        }
    }
}

pub struct Events<'a> {
    fan: &'a Fanotify,
    buf: BytesMut,
    pending: VecDeque<EventMetadata>,
}

impl Iterator for Events<'_> {
    type Item = EventMetadata;

    fn next(&mut self) -> Option<EventMetadata> {
        loop {
            while let Some(meta) = self.pending.pop_front() {
                if meta.vers != METADATA_VERSION {
                    error!(
                        "record version {} does not match expected {}, skipping",
                        meta.vers, METADATA_VERSION
                    );
                    if meta.fd >= 0 {
                        unsafe { libc::close(meta.fd) };
                    }
                    continue;
                }
                if meta.fd < 0 {
                    // overflow record, nothing to resolve
                    debug!("notification queue overflowed");
                    continue;
                }
                return Some(meta);
            }
            let n = unsafe {
                libc::read(
                    self.fan.fd.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("failed to read from the notification channel: {err}");
                thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
            self.pending.extend(parse_records(&self.buf[..n as usize]));
        }
    }
}

/// Slice fixed-layout records out of one read. A record shorter than the
/// header or running past the buffer ends the batch.
pub(crate) fn parse_records(buf: &[u8]) -> Vec<EventMetadata> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while buf.len().saturating_sub(offset) >= EventMetadata::SIZE {
        let meta = unsafe {
            buf.as_ptr()
                .add(offset)
                .cast::<EventMetadata>()
                .read_unaligned()
        };
        let event_len = meta.event_len as usize;
        if event_len < EventMetadata::SIZE || offset + event_len > buf.len() {
            warn!(
                "truncated record of {} byte(s) at offset {}, dropping the tail",
                buf.len() - offset,
                offset
            );
            break;
        }
        records.push(meta);
        offset += event_len;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(mask: u64, fd: i32, pid: i32) -> EventMetadata {
        EventMetadata {
            event_len: EventMetadata::SIZE as u32,
            vers: METADATA_VERSION,
            reserved: 0,
            metadata_len: EventMetadata::SIZE as u16,
            mask,
            fd,
            pid,
        }
    }

    fn to_bytes(records: &[EventMetadata]) -> Vec<u8> {
        let mut buf = Vec::new();
        for meta in records {
            let raw = unsafe {
                std::slice::from_raw_parts(
                    (meta as *const EventMetadata).cast::<u8>(),
                    EventMetadata::SIZE,
                )
            };
            buf.extend_from_slice(raw);
        }
        buf
    }

    #[test]
    fn one_read_can_carry_several_records() {
        let buf = to_bytes(&[record(0x08, 7, 100), record(0x02, 8, 200)]);
        let records = parse_records(&buf);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fd, 7);
        assert_eq!(records[0].mask, 0x08);
        assert_eq!(records[1].pid, 200);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let mut buf = to_bytes(&[record(0x08, 7, 100)]);
        buf.extend_from_slice(&to_bytes(&[record(0x02, 8, 200)])[..10]);
        let records = parse_records(&buf);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fd, 7);
    }

    #[test]
    fn zero_length_record_ends_the_batch() {
        let mut meta = record(0x08, 7, 100);
        meta.event_len = 0;
        let buf = to_bytes(&[meta, record(0x02, 8, 200)]);
        assert!(parse_records(&buf).is_empty());
    }

    #[test]
    fn empty_read_yields_no_records() {
        assert!(parse_records(&[]).is_empty());
    }
}
