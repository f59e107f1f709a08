use std::{
    fs::{self, ReadDir},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{QueueId, Result};

/// One pass over a queue area directory.
///
/// Entries that are not queue ids (dotfiles, editor droppings, anything an
/// operator left behind) are skipped. Files created or removed while the pass
/// runs may or may not be seen; callers re-check every name they get.
#[derive(Debug)]
pub struct ScanDir {
    path: PathBuf,
    entries: ReadDir,
}

impl ScanDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = fs::read_dir(&path)?;
        Ok(Self { path, entries })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next queue id, or `None` once the directory is exhausted.
    pub fn next_id(&mut self) -> Result<Option<QueueId>> {
        for entry in self.entries.by_ref() {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match QueueId::from_filename(name) {
                Some(id) => return Ok(Some(id)),
                None => debug!(directory = %self.path.display(), name, "skipping non-queue file"),
            }
        }
        Ok(None)
    }
}
