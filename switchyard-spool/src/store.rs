use std::{
    fs::{self, File, FileTimes, OpenOptions, Permissions},
    io,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use switchyard_common::internal;
use switchyard_tracing::traced;
use tracing::warn;

use crate::{QueueArea, QueueId, Result, SpoolError};

/// Owner read/write/execute: the writer finished and the file may be opened.
pub const MODE_READY: u32 = 0o700;
/// Owner read/write: still being written.
pub const MODE_WRITING: u32 = 0o600;
/// Group execute: unthrottle everything this message touches when loaded.
pub const MODE_UNTHROTTLE: u32 = 0o010;
/// Other execute: expire this message the next time it is loaded.
pub const MODE_EXPIRE: u32 = 0o001;

/// What the gatekeeper learned about a file it is willing to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCheck {
    pub modified: SystemTime,
    pub unthrottle: bool,
    pub expire: bool,
    pub mode: u32,
}

/// A queue directory: one subdirectory per [`QueueArea`].
#[derive(Debug, Clone)]
pub struct QueueStore {
    root: PathBuf,
}

impl QueueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Refuse roots that could escape into system directories.
    pub fn validate(&self) -> Result<()> {
        if self
            .root
            .components()
            .any(|component| component == Component::ParentDir)
        {
            return Err(SpoolError::Validation(format!(
                "queue directory cannot contain '..' components: {}",
                self.root.display()
            )));
        }

        for prefix in ["/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev"] {
            if self.root.starts_with(prefix) {
                return Err(SpoolError::Validation(format!(
                    "queue directory cannot be in system directory {prefix}: {}",
                    self.root.display()
                )));
            }
        }

        Ok(())
    }

    /// Create the root and every area that does not exist yet.
    pub fn init(&self) -> Result<()> {
        self.validate()?;
        for area in QueueArea::ALL {
            fs::create_dir_all(self.area_path(area))?;
        }

        internal!(level = DEBUG, root = %self.root.display(), "queue directory ready");
        Ok(())
    }

    #[must_use]
    pub fn area_path(&self, area: QueueArea) -> PathBuf {
        self.root.join(area.name())
    }

    #[must_use]
    pub fn path(&self, area: QueueArea, queue_id: &QueueId) -> PathBuf {
        self.area_path(area).join(queue_id.to_string())
    }

    /// Decide whether a queue file may be opened.
    ///
    /// Files that are missing, not regular, still being written, or hard
    /// linked elsewhere are refused. Odd files are logged; a missing file is
    /// not, since scanners race with everything else.
    pub fn open_ok(&self, area: QueueArea, queue_id: &QueueId) -> Result<Option<OpenCheck>> {
        let path = self.path(area, queue_id);
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot stat queue file");
                return Ok(None);
            }
        };

        if !metadata.file_type().is_file() {
            warn!(path = %path.display(), uid = metadata.uid(), "not a regular file");
            return Ok(None);
        }
        let mode = metadata.mode();
        if mode & 0o700 != MODE_READY {
            return Ok(None);
        }
        if metadata.nlink() > 1 {
            warn!(path = %path.display(), links = metadata.nlink(), "queue file has extra links");
            return Ok(None);
        }

        Ok(Some(OpenCheck {
            modified: metadata.modified()?,
            unthrottle: mode & MODE_UNTHROTTLE != 0,
            expire: mode & MODE_EXPIRE != 0,
            mode: mode & 0o7777,
        }))
    }

    /// Move a file between areas.
    pub fn rename(&self, queue_id: &QueueId, from: QueueArea, to: QueueArea) -> io::Result<()> {
        fs::rename(self.path(from, queue_id), self.path(to, queue_id))
    }

    pub fn remove(&self, area: QueueArea, queue_id: &QueueId) -> io::Result<()> {
        fs::remove_file(self.path(area, queue_id))
    }

    /// Remove, treating an already missing file as success.
    pub fn remove_if_exists(&self, area: QueueArea, queue_id: &QueueId) -> io::Result<()> {
        match self.remove(area, queue_id) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Set both access and modification time; used to schedule retries.
    pub fn set_times(&self, area: QueueArea, queue_id: &QueueId, when: SystemTime) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.path(area, queue_id))?;
        file.set_times(FileTimes::new().set_accessed(when).set_modified(when))
    }

    pub fn set_mode(&self, area: QueueArea, queue_id: &QueueId, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.path(area, queue_id), Permissions::from_mode(mode))
    }

    /// Ask for administrative expiry of a waiting message.
    ///
    /// Only ready files are touched; the flag takes effect when the file is
    /// next loaded.
    pub fn request_expire(&self, area: QueueArea, queue_id: &QueueId) -> Result<()> {
        let Some(check) = self.open_ok(area, queue_id)? else {
            return Err(SpoolError::NotFound {
                area,
                queue_id: *queue_id,
            });
        };
        self.set_mode(area, queue_id, check.mode | MODE_EXPIRE)?;
        Ok(())
    }

    /// Size in bytes, or `None` if the file does not exist.
    pub fn size(&self, area: QueueArea, queue_id: &QueueId) -> io::Result<Option<u64>> {
        match fs::metadata(self.path(area, queue_id)) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn exists(&self, area: QueueArea, queue_id: &QueueId) -> bool {
        self.path(area, queue_id).exists()
    }

    /// Create a new file that the gatekeeper will not open yet.
    pub(crate) fn create(&self, area: QueueArea, queue_id: &QueueId) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(MODE_WRITING)
            .open(self.path(area, queue_id))
    }

    /// Valid queue ids in an area, in directory order.
    pub fn list(&self, area: QueueArea) -> Result<Vec<QueueId>> {
        let mut ids = Vec::new();
        let mut scan = crate::ScanDir::open(self.area_path(area))?;
        while let Some(id) = scan.next_id()? {
            ids.push(id);
        }
        Ok(ids)
    }

    /// Move every file from one area to another and stamp it with `when`.
    ///
    /// Used at startup to put files orphaned in the active area back in line.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, when)), timing(precision = "ms"))]
    pub fn move_all(&self, from: QueueArea, to: QueueArea, when: SystemTime) -> Result<usize> {
        let mut moved = 0;
        for queue_id in self.list(from)? {
            if let Err(err) = self.set_times(from, &queue_id, when) {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
            match self.rename(&queue_id, from, to) {
                Ok(()) => moved += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        if moved > 0 {
            internal!(level = INFO, count = moved, from = %from, to = %to, "requeued queue files");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::EnvelopeWriter;

    fn store() -> (tempfile::TempDir, QueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn test_validate_rejects_system_paths() {
        assert!(QueueStore::new("/etc/switchyard").validate().is_err());
        assert!(QueueStore::new("/var/spool/../etc").validate().is_err());
        assert!(QueueStore::new("/var/spool/switchyard").validate().is_ok());
    }

    #[test]
    fn test_open_ok_requires_ready_mode() {
        let (_dir, store) = store();
        let id = QueueId::generate();
        drop(store.create(QueueArea::Incoming, &id).unwrap());
        assert_eq!(store.open_ok(QueueArea::Incoming, &id).unwrap(), None);

        store.set_mode(QueueArea::Incoming, &id, MODE_READY).unwrap();
        let check = store.open_ok(QueueArea::Incoming, &id).unwrap().unwrap();
        assert!(!check.unthrottle);

        store
            .set_mode(QueueArea::Incoming, &id, MODE_READY | MODE_UNTHROTTLE)
            .unwrap();
        let check = store.open_ok(QueueArea::Incoming, &id).unwrap().unwrap();
        assert!(check.unthrottle);
        assert!(!check.expire);
    }

    #[test]
    fn test_request_expire() {
        let (_dir, store) = store();
        let id = EnvelopeWriter::new()
            .arrival(1, 0)
            .sender("a@example.com")
            .recipient("b@example.com")
            .content(b"x")
            .commit(&store, QueueArea::Deferred)
            .unwrap();

        store.request_expire(QueueArea::Deferred, &id).unwrap();
        let check = store.open_ok(QueueArea::Deferred, &id).unwrap().unwrap();
        assert!(check.expire);
        assert_eq!(check.mode & 0o700, MODE_READY);

        assert!(
            store
                .request_expire(QueueArea::Deferred, &QueueId::generate())
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_open_ok_refuses_hard_links() {
        let (dir, store) = store();
        let id = EnvelopeWriter::new()
            .arrival(1, 0)
            .sender("")
            .recipient("a@example.com")
            .content(b"x")
            .commit(&store, QueueArea::Incoming)
            .unwrap();
        assert!(store.open_ok(QueueArea::Incoming, &id).unwrap().is_some());

        fs::hard_link(store.path(QueueArea::Incoming, &id), dir.path().join("extra")).unwrap();
        assert!(store.open_ok(QueueArea::Incoming, &id).unwrap().is_none());
    }

    #[test]
    fn test_move_all_stamps_and_moves() {
        let (_dir, store) = store();
        let first = EnvelopeWriter::new()
            .arrival(1, 0)
            .sender("a@example.com")
            .recipient("b@example.com")
            .content(b"x")
            .commit(&store, QueueArea::Active)
            .unwrap();

        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert_eq!(store.move_all(QueueArea::Active, QueueArea::Incoming, when).unwrap(), 1);
        assert!(store.exists(QueueArea::Incoming, &first));
        assert!(store.list(QueueArea::Active).unwrap().is_empty());

        let check = store.open_ok(QueueArea::Incoming, &first).unwrap().unwrap();
        assert_eq!(check.modified, when);
    }
}
