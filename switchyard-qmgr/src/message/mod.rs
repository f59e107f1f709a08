//! In-core messages.
//!
//! A message is loaded in passes. Each pass reads at most as many recipients
//! as the in-core limits allow, resolves them, and bundles them into entries.
//! When a pass stops short of the end of the file, the offset of the first
//! unread recipient is kept so the next pass can pick up from there.

mod assign;
mod read;

use switchyard_common::admission;
use switchyard_spool::{EnvelopeReader, QueueArea, QueueId};
use switchyard_tracing::traced;

use crate::{
    QmgrError, QueueManager,
    arena::{JobId, List, MessageId},
    bounce::NoticeKind,
    job::MessageJobs,
    recipient::RecipientBatch,
};

/// How a queue file should be treated while it is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags {
    /// Ignore `defer_transports`
    pub flush_dfxp: bool,
    /// Revive dead transports and destinations this message needs
    pub flush_each: bool,
    /// Send every recipient to the retry transport as expired
    pub force_expire: bool,
}

/// Result of trying to bring a queue file into core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(MessageId),
    /// Another process holds the file lock
    Locked,
    /// The file is missing required records or cannot be parsed
    Corrupt,
}

#[derive(Debug)]
pub struct Message {
    pub(crate) queue_id: QueueId,
    pub(crate) flags: LoadFlags,
    /// Some recipient was deferred or a notification failed
    pub(crate) problem: bool,
    /// A later pass could not read the file
    pub(crate) damaged: bool,

    pub(crate) arrival_secs: u64,
    pub(crate) arrival_micros: u32,
    pub(crate) create_time: u64,
    pub(crate) queued_time: u64,
    pub(crate) refill_time: u64,

    pub(crate) data_offset: u64,
    pub(crate) data_size: u64,
    /// Recipient records are interleaved with other records
    pub(crate) mixed: bool,
    /// Every non-recipient record has been read
    pub(crate) seen_all: bool,

    pub(crate) warn_offset: u64,
    pub(crate) warn_time: u64,

    /// Where the next pass starts; zero once every recipient is read
    pub(crate) rcpt_offset: u64,
    /// Recipient records on disk past `rcpt_offset`
    pub(crate) rcpt_unread: i64,
    /// Recipients in core, across all jobs
    pub(crate) rcpt_count: i64,
    /// Recipient slots this message may fill
    pub(crate) rcpt_limit: i64,
    pub(crate) rcpt_list: RecipientBatch,

    pub(crate) sender: Option<String>,
    pub(crate) verp_delims: Option<String>,
    /// One recipient per delivery request
    pub(crate) single_rcpt: bool,
    pub(crate) encoding: Option<String>,
    pub(crate) errors_to: Option<String>,
    pub(crate) return_receipt: Option<String>,
    pub(crate) client: Vec<(String, String)>,
    pub(crate) filter: Option<String>,
    pub(crate) redirect: Option<String>,

    /// Live entries
    pub(crate) refcount: i64,
    pub(crate) jobs: List<JobId, MessageJobs>,
    /// A notification is being sent; the message waits for its status
    pub(crate) notice: Option<NoticeKind>,
}

impl Message {
    fn new(queue_id: QueueId, flags: LoadFlags, now: u64, rcpt_limit: i64) -> Self {
        Self {
            queue_id,
            flags,
            problem: false,
            damaged: false,
            arrival_secs: 0,
            arrival_micros: 0,
            create_time: 0,
            queued_time: now,
            refill_time: 0,
            data_offset: 0,
            data_size: 0,
            mixed: false,
            seen_all: false,
            warn_offset: 0,
            warn_time: 0,
            rcpt_offset: 0,
            rcpt_unread: 0,
            rcpt_count: 0,
            rcpt_limit,
            rcpt_list: RecipientBatch::default(),
            sender: None,
            verp_delims: None,
            single_rcpt: false,
            encoding: None,
            errors_to: None,
            return_receipt: None,
            client: Vec::new(),
            filter: None,
            redirect: None,
            refcount: 0,
            jobs: List::default(),
            notice: None,
        }
    }

    #[must_use]
    pub const fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    #[must_use]
    pub fn sender(&self) -> &str {
        self.sender.as_deref().unwrap_or_default()
    }

    /// More recipients wait on disk.
    #[must_use]
    pub const fn has_unread(&self) -> bool {
        self.rcpt_offset != 0
    }
}

impl QueueManager {
    /// Bring a file from the active area into core and queue its first
    /// recipients for delivery.
    ///
    /// `mode`, when given, replaces the file's permission bits once the
    /// envelope has been validated.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "us"))]
    pub(crate) fn message_alloc(
        &mut self,
        queue_id: QueueId,
        flags: LoadFlags,
        mode: Option<u32>,
    ) -> Result<LoadOutcome, QmgrError> {
        let path = self.store.path(QueueArea::Active, &queue_id);
        let mut reader = match EnvelopeReader::open(&path) {
            Ok(reader) => reader,
            Err(err) if err.is_not_found() => {
                admission!(level = WARN, %queue_id, "queue file vanished");
                return Ok(LoadOutcome::Corrupt);
            }
            Err(err) => return Err(QmgrError::storage("open", queue_id)(err)),
        };

        if !reader.try_lock().map_err(QmgrError::storage("lock", queue_id))? {
            admission!(level = INFO, %queue_id, "skipped, still being delivered");
            return Ok(LoadOutcome::Locked);
        }

        let now = self.now();
        let floor = self.config.message_recipient_minimum;
        let id = self
            .messages
            .insert_with(|_| Message::new(queue_id, flags, now, floor));

        if let Err(err) = self.message_read(id, &mut reader) {
            admission!(level = WARN, %queue_id, error = %err, "message rejected");
            self.message_free(id);
            return Ok(LoadOutcome::Corrupt);
        }

        if let Some(mode) = mode {
            self.store
                .set_mode(QueueArea::Active, &queue_id, mode)
                .map_err(QmgrError::storage("chmod", queue_id))?;
        }

        // Whatever was deferred last time is about to be tried again.
        self.logs
            .remove(QueueArea::Defer, &queue_id)
            .map_err(QmgrError::storage("remove defer log", queue_id))?;

        let message = &self.messages[id];
        admission!(
            level = INFO,
            %queue_id,
            from = message.sender(),
            size = message.data_size,
            nrcpt = message.rcpt_list.len() as i64 + message.rcpt_unread,
            "queue active"
        );

        self.message_dispatch(id, &reader)?;
        Ok(LoadOutcome::Loaded(id))
    }

    /// Read the next batch of recipients of a partially read message.
    ///
    /// A file that cannot be read any more is not retried: the message keeps
    /// what it has, stops reading, and is quarantined when it completes.
    /// Returns whether the pass succeeded.
    ///
    /// # Panics
    ///
    /// If the message has no saved offset or still holds unassigned
    /// recipients.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "us"))]
    pub(crate) fn message_realloc(&mut self, id: MessageId) -> Result<bool, QmgrError> {
        let message = &self.messages[id];
        let queue_id = message.queue_id;
        assert!(message.rcpt_offset > 0, "{queue_id}: resuming with no saved offset");
        assert!(
            message.rcpt_list.is_empty(),
            "{queue_id}: resuming with unassigned recipients"
        );

        let path = self.store.path(QueueArea::Active, &queue_id);
        let outcome = EnvelopeReader::open(&path).and_then(|mut reader| {
            self.message_read(id, &mut reader)?;
            Ok(reader)
        });

        match outcome {
            Ok(reader) => {
                self.message_dispatch(id, &reader)?;
                self.messages[id].refill_time = self.now();
                Ok(true)
            }
            Err(err) => {
                admission!(level = WARN, %queue_id, error = %err, "cannot read more recipients");
                let message = &mut self.messages[id];
                message.damaged = true;
                message.rcpt_offset = 0;
                message.rcpt_unread = 0;
                self.message_move_limits(id);
                Ok(false)
            }
        }
    }

    /// Resolve and assign what the last pass read.
    fn message_dispatch(&mut self, id: MessageId, reader: &EnvelopeReader) -> Result<(), QmgrError> {
        self.message_sort(id);
        self.message_resolve(id, reader)?;
        self.message_sort(id);
        self.message_assign(id);

        if self.messages[id].rcpt_offset == 0 {
            self.message_move_limits(id);
        }
        Ok(())
    }

    fn message_move_limits(&mut self, id: MessageId) {
        for job in self.messages[id].jobs.ids(&self.jobs) {
            self.job_move_limits(job);
        }
    }

    /// Release a message and its jobs.
    ///
    /// # Panics
    ///
    /// If entries still refer to the message.
    pub(crate) fn message_free(&mut self, id: MessageId) {
        let message = &self.messages[id];
        assert_eq!(message.refcount, 0, "{}: freeing a message with live entries", message.queue_id);
        assert!(
            message.rcpt_list.is_empty(),
            "{}: freeing a message with unassigned recipients",
            message.queue_id
        );

        for job in message.jobs.ids(&self.jobs) {
            self.job_free(job);
        }
        self.messages.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use switchyard_spool::EnvelopeWriter;

    use super::*;
    use crate::{
        arena::{EntryId, TransportId},
        config::TransportOverride,
        entry::EntryState,
        resolve::ResolveReply,
        testing::Harness,
    };

    fn envelope(recipients: impl IntoIterator<Item = String>) -> EnvelopeWriter {
        recipients.into_iter().fold(
            EnvelopeWriter::new().arrival(1_700_000_000, 0).sender("sender@example.net"),
            |writer, address| writer.recipient(&address),
        )
    }

    #[test]
    fn test_large_message_is_read_in_bounded_passes() {
        let mut harness = Harness::with_config(|config| config.recipient_limit = 100);
        let smtp = harness.qmgr.transport_obtain("smtp");
        let message = harness.queue_message(envelope(
            (0..10_000).map(|n| format!("user{n}@d{}.example", n % 7)),
        ));

        let loaded = &harness.qmgr.messages[message];
        assert!(loaded.rcpt_offset > 0);
        assert!(loaded.rcpt_count <= 100);
        let queue_id = loaded.queue_id;

        let mut delivered = 0;
        while harness.deliver_next(smtp).is_some() {
            delivered += 1;
            assert!(harness.qmgr.recipient_count <= 100);
            harness.assert_invariants();
        }

        assert!(delivered >= 10_000 / 50);
        assert!(!harness.qmgr.messages.contains(message));
        assert!(!harness.qmgr.store.exists(QueueArea::Active, &queue_id));
        let stats = harness.qmgr.stats();
        assert_eq!((stats.messages, stats.recipients, stats.entries), (0, 0, 0));
    }

    #[test]
    fn test_recipients_are_grouped_by_destination() {
        let mut harness = Harness::with_config(|config| {
            config.transports.insert(
                String::from("smtp"),
                TransportOverride {
                    destination_recipient_limit: Some(2),
                    ..Default::default()
                },
            );
        });
        let smtp = harness.qmgr.transport_obtain("smtp");
        let recipients = (1..=5)
            .map(|n| format!("a{n}@a.example"))
            .chain([String::from("b@b.example"), String::from("c@c.example")]);
        let message = harness.queue_message(envelope(recipients));
        let qmgr = &harness.qmgr;

        let jobs = qmgr.messages[message].jobs.ids(&qmgr.jobs);
        assert_eq!(jobs.len(), 1);
        assert_eq!(qmgr.jobs[jobs[0]].peers.len(), 3);

        let sizes = |domain: &str| -> Vec<usize> {
            let destination = qmgr.destination_find(smtp, domain).unwrap();
            qmgr.destinations[destination]
                .todo
                .ids(&qmgr.entries)
                .into_iter()
                .map(|entry| qmgr.entries[entry].recipients.len())
                .collect()
        };
        assert_eq!(sizes("a.example"), vec![2, 2, 1]);
        assert_eq!(sizes("b.example"), vec![1]);
        assert_eq!(sizes("c.example"), vec![1]);
    }

    #[test]
    fn test_verp_message_gets_one_entry_per_recipient() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, destination) = harness.queue_entries(smtp, "example.com", 3);
        let qmgr = &harness.qmgr;

        assert!(qmgr.messages[message].single_rcpt);
        assert_eq!(qmgr.destinations[destination].todo_count(), 3);
    }

    type Routes = BTreeMap<String, (String, String)>;

    fn record(qmgr: &QueueManager, entry: EntryId, routes: &mut Routes) {
        let entry = &qmgr.entries[entry];
        let destination = &qmgr.destinations[entry.destination];
        let transport = qmgr.transports[destination.transport].name.clone();
        for recipient in entry.recipients.iter() {
            routes.insert(
                recipient.address.clone(),
                (transport.clone(), destination.name().to_string()),
            );
        }
    }

    fn routed_harness(recipient_limit: i64) -> (Harness, [TransportId; 2]) {
        let harness = Harness::with_config(|config| {
            config.recipient_limit = recipient_limit;
            config.message_recipient_minimum = 1;
        });
        for n in (0..60).step_by(4) {
            let address = format!("user{n}@d{}.example", n % 3);
            harness.resolver.set(
                &address,
                ResolveReply {
                    transport: String::from("relay"),
                    nexthop: String::from("[192.0.2.1]"),
                    recipient: address.clone(),
                    ..ResolveReply::default()
                },
            );
        }
        let mut harness = harness;
        let transports = [
            harness.qmgr.transport_obtain("smtp"),
            harness.qmgr.transport_obtain("relay"),
        ];
        (harness, transports)
    }

    #[test]
    fn test_resumed_passes_route_like_a_single_pass() {
        let recipients = || (0..60).map(|n| format!("user{n}@d{}.example", n % 3));

        let (mut whole, _) = routed_harness(20_000);
        let message = whole.queue_message(envelope(recipients()));
        assert_eq!(whole.qmgr.messages[message].rcpt_offset, 0);
        let mut expected = Routes::new();
        for entry in whole.qmgr.entries.iter().map(|(id, _)| id).collect::<Vec<_>>() {
            record(&whole.qmgr, entry, &mut expected);
        }
        assert_eq!(expected.len(), 60);

        let (mut parts, transports) = routed_harness(8);
        let message = parts.queue_message(envelope(recipients()));
        assert!(parts.qmgr.messages[message].rcpt_offset > 0);

        let mut resumed = Routes::new();
        loop {
            let mut progressed = false;
            for transport in transports {
                if let Some(entry) = parts.qmgr.entry_select(transport).unwrap() {
                    record(&parts.qmgr, entry, &mut resumed);
                    parts.qmgr.entry_done(entry, EntryState::Busy).unwrap();
                    parts.assert_invariants();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        assert_eq!(resumed, expected);
        assert!(!parts.qmgr.messages.contains(message));
    }

    #[test]
    fn test_unparseable_file_is_reported_corrupt() {
        let mut harness = Harness::new();
        let queue_id = QueueId::generate();
        let path = harness.qmgr.store.path(QueueArea::Active, &queue_id);
        std::fs::write(&path, b"this is not an envelope\n").unwrap();

        let outcome = harness
            .qmgr
            .message_alloc(queue_id, LoadFlags::default(), None)
            .unwrap();
        assert_eq!(outcome, LoadOutcome::Corrupt);
        assert_eq!(harness.qmgr.stats().messages, 0);
    }
}
