use anyhow::Result;
use log::debug;
use std::collections::HashSet;
use std::path::PathBuf;
use walkdir::WalkDir;

use watchq_common::ManagedFile;

/// Source of the file set under management. Queried exactly once per
/// backend lifetime; the snapshot is never refreshed.
pub trait ManagedSetProvider {
    fn list_managed(&self) -> Result<Vec<ManagedFile>>;
}

/// A fixed, caller-supplied managed set.
pub struct StaticSet {
    files: Vec<ManagedFile>,
}

impl StaticSet {
    pub fn new(files: Vec<ManagedFile>) -> Self {
        Self { files }
    }
}

impl ManagedSetProvider for StaticSet {
    fn list_managed(&self) -> Result<Vec<ManagedFile>> {
        Ok(self.files.clone())
    }
}

/// Every regular file under a directory, each managed under its own path.
pub struct DirSet {
    root: PathBuf,
    environment: String,
    rule_set: String,
    follow_links: bool,
}

impl DirSet {
    pub fn new(root: impl Into<PathBuf>, follow_links: bool) -> Self {
        Self {
            root: root.into(),
            environment: "base".to_string(),
            rule_set: "local".to_string(),
            follow_links,
        }
    }
}

impl ManagedSetProvider for DirSet {
    fn list_managed(&self) -> Result<Vec<ManagedFile>> {
        let files = WalkDir::new(&self.root)
            .follow_links(self.follow_links)
            .follow_root_links(true)
            .into_iter()
            .filter_map(|e| match e {
                Ok(ee) => {
                    if ee.file_type().is_file() {
                        Some(ee)
                    } else {
                        None
                    }
                }
                Err(_) => None,
            })
            .map(|e| {
                let path = e.path().to_path_buf();
                ManagedFile::new(
                    path.to_string_lossy(),
                    self.environment.clone(),
                    self.rule_set.clone(),
                )
                .with_path(path)
            })
            .collect::<Vec<ManagedFile>>();
        debug!("found {} file(s) under {}", files.len(), self.root.display());
        Ok(files)
    }
}

/// Path membership snapshot the event filter matches against.
pub fn snapshot_paths(files: &[ManagedFile]) -> HashSet<PathBuf> {
    files.iter().map(|f| f.path.clone()).collect()
}
