use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use watchq_common::{ChangeEvent, EventMetadata};

// Suffix the descriptor table appends once the underlying inode is gone.
const DELETED_SUFFIX: &[u8] = b" (deleted)";

/// Resolve a raw kernel record into a [`ChangeEvent`].
///
/// Takes ownership of the record's file descriptor and closes it exactly
/// once, on every path out of this function. Process metadata lookups are
/// best effort: a process that exited before we get here yields `None`
/// fields, never an error.
pub fn resolve(meta: EventMetadata) -> Result<ChangeEvent> {
    let fd = unsafe { OwnedFd::from_raw_fd(meta.fd) };
    let (path, deleted) = resolve_path(&fd)?;
    Ok(ChangeEvent {
        pid: meta.pid,
        path,
        cmdline: read_cmdline(meta.pid),
        user: resolve_owner(meta.pid),
        deleted,
    })
}

fn resolve_path(fd: &OwnedFd) -> Result<(PathBuf, bool)> {
    let target = fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))
        .context("cannot resolve event descriptor to a path")?;
    let raw = target.into_os_string().into_vec();
    let (raw, deleted) = match raw.ends_with(DELETED_SUFFIX) {
        true => (raw[..raw.len() - DELETED_SUFFIX.len()].to_vec(), true),
        false => (raw, false),
    };
    Ok((PathBuf::from(OsString::from_vec(raw)), deleted))
}

pub(crate) fn read_cmdline(pid: i32) -> Option<Vec<String>> {
    let data = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    match data.is_empty() {
        true => None,
        false => Some(
            data.split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect(),
        ),
    }
}

pub(crate) fn resolve_owner(pid: i32) -> Option<String> {
    let uid = fs::metadata(format!("/proc/{pid}")).ok()?.uid();
    let user = users::get_user_by_uid(uid)?;
    Some(user.name().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::IntoRawFd;
    use watchq_common::{InterestKind, METADATA_VERSION};

    fn meta_for(fd: i32, pid: i32) -> EventMetadata {
        EventMetadata {
            event_len: EventMetadata::SIZE as u32,
            vers: METADATA_VERSION,
            reserved: 0,
            metadata_len: EventMetadata::SIZE as u16,
            mask: u64::from(InterestKind::CloseWrite),
            fd,
            pid,
        }
    }

    #[test]
    fn live_file_resolves_to_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap().join("app.conf");
        fs::write(&path, "managed").unwrap();

        let file = File::open(&path).unwrap();
        let event = resolve(meta_for(file.into_raw_fd(), std::process::id() as i32)).unwrap();
        assert_eq!(event.path, path);
        assert!(!event.deleted);
    }

    #[test]
    fn unlinked_file_sets_deleted_and_strips_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap().join("app.conf");
        fs::write(&path, "managed").unwrap();

        let file = File::open(&path).unwrap();
        fs::remove_file(&path).unwrap();
        let event = resolve(meta_for(file.into_raw_fd(), std::process::id() as i32)).unwrap();
        assert_eq!(event.path, path);
        assert!(event.deleted);
    }

    #[test]
    fn own_process_has_a_cmdline() {
        let cmdline = read_cmdline(std::process::id() as i32).unwrap();
        assert!(!cmdline.is_empty());
    }

    #[test]
    fn dead_process_metadata_degrades_to_none() {
        assert_eq!(read_cmdline(i32::MAX), None);
        assert_eq!(resolve_owner(i32::MAX), None);
    }

    #[test]
    fn missing_cmdline_does_not_block_the_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap().join("app.conf");
        fs::write(&path, "managed").unwrap();

        let file = File::open(&path).unwrap();
        let event = resolve(meta_for(file.into_raw_fd(), i32::MAX)).unwrap();
        assert_eq!(event.cmdline, None);
        assert_eq!(event.user, None);
        assert_eq!(event.path, path);
    }
}
