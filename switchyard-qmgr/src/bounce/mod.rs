//! Recipient status logs and the notifications built from them.
//!
//! Delivery agents and the scheduler append one line per bounced or deferred
//! recipient. When a message completes, the scheduler asks for the bounce log
//! to be flushed to the sender; when it expires or its warn time arrives, the
//! defer log is turned into an expiry or delay notice. Notices are ordinary
//! queue files dropped into the incoming area.

mod notice;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use switchyard_common::{address, admission};
use switchyard_spool::{EnvelopeWriter, LogEntry, LogFiles, QueueArea, QueueId, QueueStore};

use self::notice::{Action, Report};
use crate::config::QmgrConfig;

/// Which notice a completing message is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// Recipients in the bounce log, returned to the sender
    Bounce,
    /// Every deferred recipient, returned because the message expired
    Expire,
    /// Delay warning for the deferred recipients
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeRequest {
    pub kind: NoticeKind,
    pub queue_id: QueueId,
    pub sender: String,
    /// Send one notice per recipient to the VERP-encoded sender
    pub verp_delims: Option<String>,
    pub arrival: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Sent,
    Failed,
}

impl FlushStatus {
    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }
}

#[async_trait]
pub trait BounceService: Debug + Send + Sync {
    /// Record a temporarily failed recipient.
    fn defer_append(&self, queue_id: &QueueId, entry: &LogEntry) -> switchyard_spool::Result<()>;

    /// Record a permanently failed recipient.
    fn bounce_append(&self, queue_id: &QueueId, entry: &LogEntry) -> switchyard_spool::Result<()>;

    async fn bounce_flush(&self, notice: &NoticeRequest) -> FlushStatus;

    /// Return every deferred recipient as failed.
    async fn defer_flush(&self, notice: &NoticeRequest) -> FlushStatus;

    async fn defer_warn(&self, notice: &NoticeRequest) -> FlushStatus;

    async fn notify(&self, notice: &NoticeRequest) -> FlushStatus {
        match notice.kind {
            NoticeKind::Bounce => self.bounce_flush(notice).await,
            NoticeKind::Expire => self.defer_flush(notice).await,
            NoticeKind::Warn => self.defer_warn(notice).await,
        }
    }
}

fn default_postmaster() -> String {
    String::from("postmaster")
}

fn default_from() -> String {
    String::from("MAILER-DAEMON")
}

#[derive(Debug, Clone, Deserialize)]
pub struct BounceConfig {
    /// Recipient of notices about null-sender messages
    #[serde(default = "default_postmaster")]
    pub postmaster: String,

    /// Local part of the notice `From:` header
    #[serde(default = "default_from")]
    pub from: String,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            postmaster: default_postmaster(),
            from: default_from(),
        }
    }
}

/// Logs in the `bounce` and `defer` areas, notices written to `incoming`.
#[derive(Debug, Clone)]
pub struct SpoolBounceService {
    store: QueueStore,
    logs: LogFiles,
    config: BounceConfig,
    myhostname: String,
    double_bounce_sender: String,
}

impl SpoolBounceService {
    pub fn new(store: QueueStore, config: &QmgrConfig) -> Self {
        Self {
            logs: LogFiles::new(store.clone()),
            store,
            config: config.bounce.clone(),
            myhostname: config.resolver.myhostname.clone(),
            double_bounce_sender: config.double_bounce_sender.clone(),
        }
    }

    fn qualify(&self, local: &str) -> String {
        if local.contains('@') {
            local.to_string()
        } else {
            format!("{local}@{}", self.myhostname)
        }
    }

    fn flush_blocking(&self, notice: &NoticeRequest) -> switchyard_spool::Result<()> {
        let queue_id = &notice.queue_id;
        match notice.kind {
            NoticeKind::Bounce => {
                let entries = self.logs.read(QueueArea::Bounce, queue_id)?;
                self.send(notice, Action::Failed, &entries)?;
                self.logs.remove(QueueArea::Bounce, queue_id)
            }
            NoticeKind::Expire => {
                let mut entries = self.logs.read(QueueArea::Bounce, queue_id)?;
                entries.extend(self.logs.read(QueueArea::Defer, queue_id)?);
                self.send(notice, Action::Failed, &entries)?;
                self.logs.remove(QueueArea::Bounce, queue_id)?;
                self.logs.remove(QueueArea::Defer, queue_id)
            }
            NoticeKind::Warn => {
                let entries = self.logs.read(QueueArea::Defer, queue_id)?;
                self.send(notice, Action::Delayed, &entries)
            }
        }
    }

    fn send(&self, notice: &NoticeRequest, action: Action, entries: &[LogEntry]) -> switchyard_spool::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        match &notice.verp_delims {
            Some(delims) if !notice.sender.is_empty() && action == Action::Failed => {
                for entry in entries {
                    let to = address::verp_sender(&notice.sender, delims, &entry.recipient);
                    self.write(notice, action, &to, std::slice::from_ref(entry))?;
                }
                Ok(())
            }
            _ => self.write(notice, action, &notice.sender, entries),
        }
    }

    fn write(&self, notice: &NoticeRequest, action: Action, to: &str, entries: &[LogEntry]) -> switchyard_spool::Result<()> {
        // Trouble with a notification goes to the postmaster, from an
        // address whose own failures are discarded.
        let (envelope_sender, to) = if to.is_empty() {
            (self.qualify(&self.double_bounce_sender), self.qualify(&self.config.postmaster))
        } else {
            (String::new(), to.to_string())
        };

        let from = self.qualify(&self.config.from);
        let report = Report {
            queue_id: notice.queue_id,
            reporting_mta: &self.myhostname,
            from: &from,
            to: &to,
            arrival: notice.arrival,
            action,
            expired: notice.kind == NoticeKind::Expire,
            entries,
        };

        let now = Utc::now();
        let id = EnvelopeWriter::new()
            .arrival(now.timestamp().max(0) as u64, now.timestamp_subsec_micros())
            .sender(&envelope_sender)
            .recipient(&to)
            .content(&report.compose(now))
            .commit(&self.store, QueueArea::Incoming)?;

        admission!(
            level = INFO,
            queue_id = %notice.queue_id,
            notice = %id,
            %to,
            kind = ?notice.kind,
            "sender notification queued"
        );
        Ok(())
    }

    async fn flush(&self, notice: &NoticeRequest) -> FlushStatus {
        let service = self.clone();
        let request = notice.clone();
        let outcome = tokio::task::spawn_blocking(move || service.flush_blocking(&request)).await;

        match outcome {
            Ok(Ok(())) => FlushStatus::Sent,
            Ok(Err(err)) => {
                admission!(
                    level = WARN,
                    queue_id = %notice.queue_id,
                    kind = ?notice.kind,
                    error = %err,
                    "sender notification failed"
                );
                FlushStatus::Failed
            }
            Err(err) => {
                admission!(
                    level = ERROR,
                    queue_id = %notice.queue_id,
                    error = %err,
                    "sender notification task failed"
                );
                FlushStatus::Failed
            }
        }
    }
}

#[async_trait]
impl BounceService for SpoolBounceService {
    fn defer_append(&self, queue_id: &QueueId, entry: &LogEntry) -> switchyard_spool::Result<()> {
        self.logs.append(QueueArea::Defer, queue_id, entry)
    }

    fn bounce_append(&self, queue_id: &QueueId, entry: &LogEntry) -> switchyard_spool::Result<()> {
        self.logs.append(QueueArea::Bounce, queue_id, entry)
    }

    async fn bounce_flush(&self, notice: &NoticeRequest) -> FlushStatus {
        self.flush(notice).await
    }

    async fn defer_flush(&self, notice: &NoticeRequest) -> FlushStatus {
        self.flush(notice).await
    }

    async fn defer_warn(&self, notice: &NoticeRequest) -> FlushStatus {
        self.flush(notice).await
    }
}

/// Something a [`RecordingBounceService`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BounceEvent {
    Deferred(QueueId, LogEntry),
    Bounced(QueueId, LogEntry),
    Flushed(NoticeRequest),
}

/// Keeps every request in memory. Appends also go to real log files when a
/// store is attached, so the scheduler's log size checks see them.
#[derive(Debug, Default)]
pub struct RecordingBounceService {
    logs: Option<LogFiles>,
    events: Mutex<Vec<BounceEvent>>,
    fail_flushes: Mutex<bool>,
}

impl RecordingBounceService {
    #[must_use]
    pub fn new(store: Option<QueueStore>) -> Arc<Self> {
        Arc::new(Self {
            logs: store.map(LogFiles::new),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<BounceEvent> {
        self.events.lock().clone()
    }

    pub fn deferred(&self) -> Vec<LogEntry> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BounceEvent::Deferred(_, entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<NoticeRequest> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BounceEvent::Flushed(notice) => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make every later flush report failure.
    pub fn fail_flushes(&self, fail: bool) {
        *self.fail_flushes.lock() = fail;
    }

    fn record_flush(&self, notice: &NoticeRequest) -> FlushStatus {
        self.events.lock().push(BounceEvent::Flushed(notice.clone()));
        if *self.fail_flushes.lock() {
            return FlushStatus::Failed;
        }
        if let Some(logs) = &self.logs {
            let cleared = match notice.kind {
                NoticeKind::Bounce => logs.remove(QueueArea::Bounce, &notice.queue_id),
                NoticeKind::Expire => logs
                    .remove(QueueArea::Bounce, &notice.queue_id)
                    .and_then(|()| logs.remove(QueueArea::Defer, &notice.queue_id)),
                NoticeKind::Warn => Ok(()),
            };
            if cleared.is_err() {
                return FlushStatus::Failed;
            }
        }
        FlushStatus::Sent
    }
}

#[async_trait]
impl BounceService for RecordingBounceService {
    fn defer_append(&self, queue_id: &QueueId, entry: &LogEntry) -> switchyard_spool::Result<()> {
        if let Some(logs) = &self.logs {
            logs.append(QueueArea::Defer, queue_id, entry)?;
        }
        self.events
            .lock()
            .push(BounceEvent::Deferred(*queue_id, entry.clone()));
        Ok(())
    }

    fn bounce_append(&self, queue_id: &QueueId, entry: &LogEntry) -> switchyard_spool::Result<()> {
        if let Some(logs) = &self.logs {
            logs.append(QueueArea::Bounce, queue_id, entry)?;
        }
        self.events
            .lock()
            .push(BounceEvent::Bounced(*queue_id, entry.clone()));
        Ok(())
    }

    async fn bounce_flush(&self, notice: &NoticeRequest) -> FlushStatus {
        self.record_flush(notice)
    }

    async fn defer_flush(&self, notice: &NoticeRequest) -> FlushStatus {
        self.record_flush(notice)
    }

    async fn defer_warn(&self, notice: &NoticeRequest) -> FlushStatus {
        self.record_flush(notice)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use switchyard_common::Dsn;
    use switchyard_spool::{EnvelopeReader, Record};

    use super::*;

    fn entry(recipient: &str) -> LogEntry {
        LogEntry {
            offset: 100,
            original: recipient.to_string(),
            recipient: recipient.to_string(),
            dsn: Dsn::new("5.1.1", "user unknown"),
        }
    }

    fn recipients_of(store: &QueueStore) -> Vec<(String, String)> {
        let mut found = Vec::new();
        for id in store.list(QueueArea::Incoming).unwrap() {
            let mut reader = EnvelopeReader::open(store.path(QueueArea::Incoming, &id)).unwrap();
            let mut sender = String::new();
            while let Some((_, record)) = reader.next_record().unwrap() {
                match record {
                    Record::Sender(s) => sender = s,
                    Record::Recipient(r) => found.push((sender.clone(), r)),
                    Record::Content { length } => reader.skip(length).unwrap(),
                    _ => {}
                }
            }
        }
        found.sort();
        found
    }

    #[tokio::test]
    async fn test_bounce_flush_writes_notice_and_clears_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.init().unwrap();
        let service = SpoolBounceService::new(store.clone(), &QmgrConfig::default());

        let queue_id = QueueId::generate();
        service.bounce_append(&queue_id, &entry("a@example.com")).unwrap();
        let notice = NoticeRequest {
            kind: NoticeKind::Bounce,
            queue_id,
            sender: String::from("owner@example.net"),
            verp_delims: None,
            arrival: 1_700_000_000,
        };

        assert_eq!(service.notify(&notice).await, FlushStatus::Sent);
        assert_eq!(
            recipients_of(&store),
            vec![(String::new(), String::from("owner@example.net"))]
        );
        assert!(!store.exists(QueueArea::Bounce, &queue_id));
    }

    #[tokio::test]
    async fn test_verp_and_null_sender_addressing() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.init().unwrap();
        let service = SpoolBounceService::new(store.clone(), &QmgrConfig::default());

        let verp = QueueId::generate();
        service.bounce_append(&verp, &entry("a@x.example")).unwrap();
        service.bounce_append(&verp, &entry("b@y.example")).unwrap();
        let notice = NoticeRequest {
            kind: NoticeKind::Bounce,
            queue_id: verp,
            sender: String::from("list@example.net"),
            verp_delims: Some(String::from("+=")),
            arrival: 0,
        };
        assert_eq!(service.notify(&notice).await, FlushStatus::Sent);

        let null = QueueId::generate();
        service.defer_append(&null, &entry("c@z.example")).unwrap();
        let notice = NoticeRequest {
            kind: NoticeKind::Expire,
            queue_id: null,
            sender: String::new(),
            verp_delims: None,
            arrival: 0,
        };
        assert_eq!(service.notify(&notice).await, FlushStatus::Sent);

        assert_eq!(
            recipients_of(&store),
            vec![
                (String::new(), String::from("list+a=x.example@example.net")),
                (String::new(), String::from("list+b=y.example@example.net")),
                (
                    String::from("double-bounce@localhost"),
                    String::from("postmaster@localhost")
                ),
            ]
        );
    }
}
