//! Per-message recipient logs in the `bounce` and `defer` areas.
//!
//! One line per recipient event:
//! `offset<TAB>status<TAB>original<TAB>recipient<TAB>reason`. Tabs and
//! newlines inside fields are replaced by spaces on write.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
};

use switchyard_common::Dsn;
use tracing::warn;

use crate::{QueueArea, QueueId, QueueStore, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Offset of the recipient record in the queue file
    pub offset: u64,
    pub original: String,
    pub recipient: String,
    pub dsn: Dsn,
}

impl LogEntry {
    fn encode(&self) -> String {
        let clean = |field: &str| field.replace(['\t', '\n', '\r'], " ");
        format!(
            "{}\t{}\t{}\t{}\t{}\n",
            self.offset,
            clean(&self.dsn.status),
            clean(&self.original),
            clean(&self.recipient),
            clean(&self.dsn.reason)
        )
    }

    fn decode(line: &str) -> Option<Self> {
        let mut fields = line.splitn(5, '\t');
        let offset = fields.next()?.parse().ok()?;
        let status = fields.next()?;
        let original = fields.next()?;
        let recipient = fields.next()?;
        let reason = fields.next()?;

        Some(Self {
            offset,
            original: original.to_string(),
            recipient: recipient.to_string(),
            dsn: Dsn::new(status, reason),
        })
    }
}

/// Access to the recipient logs of a queue directory.
#[derive(Debug, Clone)]
pub struct LogFiles {
    store: QueueStore,
}

impl LogFiles {
    #[must_use]
    pub const fn new(store: QueueStore) -> Self {
        Self { store }
    }

    pub fn append(&self, area: QueueArea, queue_id: &QueueId, entry: &LogEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.store.path(area, queue_id))?;
        file.write_all(entry.encode().as_bytes())?;
        Ok(())
    }

    /// Every well-formed entry. A missing log reads as empty.
    pub fn read(&self, area: QueueArea, queue_id: &QueueId) -> Result<Vec<LogEntry>> {
        let text = match fs::read_to_string(self.store.path(area, queue_id)) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        Ok(text
            .lines()
            .filter_map(|line| {
                let entry = LogEntry::decode(line);
                if entry.is_none() {
                    warn!(%queue_id, area = %area, line, "ignoring malformed log line");
                }
                entry
            })
            .collect())
    }

    pub fn remove(&self, area: QueueArea, queue_id: &QueueId) -> Result<()> {
        Ok(self.store.remove_if_exists(area, queue_id)?)
    }

    /// Size of the log, `None` when there is none.
    pub fn size(&self, area: QueueArea, queue_id: &QueueId) -> Result<Option<u64>> {
        Ok(self.store.size(area, queue_id)?)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.init().unwrap();
        let logs = LogFiles::new(store);
        let id = QueueId::generate();

        assert!(logs.read(QueueArea::Defer, &id).unwrap().is_empty());
        assert_eq!(logs.size(QueueArea::Defer, &id).unwrap(), None);

        let entry = LogEntry {
            offset: 120,
            original: String::from("User@Example.com"),
            recipient: String::from("user@example.com"),
            dsn: Dsn::new("4.4.1", "connect to mx.example.com:\ttimed out\n"),
        };
        logs.append(QueueArea::Defer, &id, &entry).unwrap();
        logs.append(QueueArea::Defer, &id, &entry).unwrap();

        let read = logs.read(QueueArea::Defer, &id).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].dsn.reason, "connect to mx.example.com: timed out ");
        assert_eq!(read[0].recipient, "user@example.com");

        logs.remove(QueueArea::Defer, &id).unwrap();
        logs.remove(QueueArea::Defer, &id).unwrap();
        assert_eq!(logs.size(QueueArea::Defer, &id).unwrap(), None);
    }
}
