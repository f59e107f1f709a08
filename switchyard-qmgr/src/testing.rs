use std::sync::Arc;

use switchyard_spool::{EnvelopeWriter, QueueArea, QueueStore};
use tempfile::TempDir;

use crate::{
    QueueManager,
    arena::{DestinationId, MessageId, TransportId},
    bounce::RecordingBounceService,
    clock::{Clock, ManualClock, SystemClock},
    config::QmgrConfig,
    entry::EntryState,
    message::{LoadFlags, LoadOutcome},
    resolve::{ResolveReply, StaticResolver},
};

/// A scheduler over a fresh queue directory, with a hand-driven clock and a
/// bounce service that only records.
pub struct Harness {
    pub qmgr: QueueManager,
    pub bounce: Arc<RecordingBounceService>,
    pub resolver: Arc<StaticResolver>,
    pub clock: ManualClock,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut QmgrConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.init().unwrap();

        let mut config = QmgrConfig {
            queue_directory: dir.path().to_path_buf(),
            ..QmgrConfig::default()
        };
        configure(&mut config);

        let bounce = RecordingBounceService::new(Some(store.clone()));
        let resolver = Arc::new(StaticResolver::new("smtp"));
        let clock = ManualClock::new(SystemClock.now());
        let qmgr = QueueManager::new(Arc::new(config), store, bounce.clone(), resolver.clone())
            .with_clock(Arc::new(clock.clone()));

        Self {
            qmgr,
            bounce,
            resolver,
            clock,
            _dir: dir,
        }
    }

    /// Commit `writer` to the active area and load it.
    pub fn queue_message(&mut self, writer: EnvelopeWriter) -> MessageId {
        let queue_id = writer
            .content(b"Subject: test\r\n\r\nbody\r\n")
            .commit(&self.qmgr.store, QueueArea::Active)
            .unwrap();

        let LoadOutcome::Loaded(message) = self
            .qmgr
            .message_alloc(queue_id, LoadFlags::default(), None)
            .unwrap()
        else {
            panic!("{queue_id} did not load");
        };
        message
    }

    /// Load one active message with `count` VERP recipients at `domain`,
    /// routed to `transport`. Each recipient becomes an entry of its own.
    pub fn queue_entries(
        &mut self,
        transport: TransportId,
        domain: &str,
        count: usize,
    ) -> (MessageId, DestinationId) {
        let name = self.qmgr.transports[transport].name.clone();
        let mut writer = EnvelopeWriter::new()
            .arrival(self.clock.now(), 0)
            .sender("sender@example.net")
            .verp("+=");
        for n in 0..count {
            let address = format!("user{n}@{domain}");
            self.resolver.set(
                &address,
                ResolveReply {
                    transport: name.clone(),
                    nexthop: domain.to_string(),
                    recipient: address.clone(),
                    ..ResolveReply::default()
                },
            );
            writer = writer.recipient(&address);
        }

        let message = self.queue_message(writer);
        let destination = self.qmgr.destination_find(transport, domain).unwrap();
        (message, destination)
    }

    /// Select the next entry of `transport` and complete it as if delivered.
    /// Returns the message the entry belonged to.
    pub fn deliver_next(&mut self, transport: TransportId) -> Option<MessageId> {
        let entry = self.qmgr.entry_select(transport).unwrap()?;
        let message = self.qmgr.entries[entry].message;
        self.qmgr.entry_done(entry, EntryState::Busy).unwrap();
        Some(message)
    }

    /// Bookkeeping that must hold between any two scheduler operations.
    pub fn assert_invariants(&self) {
        let qmgr = &self.qmgr;
        assert!(qmgr.recipient_count <= qmgr.config.recipient_limit);

        for job in qmgr.jobs.values() {
            assert!(job.selected_entries >= 0);
            assert!(job.selected_entries <= job.read_entries);
            assert!(job.rcpt_count <= job.rcpt_limit, "job holds more recipients than slots");
        }

        for destination in qmgr.destinations.values() {
            if destination.is_throttled() {
                assert!(
                    destination.todo.is_empty(),
                    "throttled destination {} has queued entries",
                    destination.name()
                );
            }
        }

        for (id, transport) in qmgr.transports.iter() {
            let settings = &transport.settings;
            let jobs = qmgr.jobs.values().filter(|job| job.transport == id);
            let (limits, stacked) = jobs.fold((0, 0), |(limits, stacked), job| {
                (limits + job.rcpt_limit, stacked + i64::from(job.stack_level > 0))
            });
            assert!(
                limits + transport.rcpt_unused
                    <= i64::from(settings.recipient_limit) + stacked * i64::from(settings.extra_recipient_limit),
                "transport {} hands out more recipient slots than it has",
                transport.name
            );
        }
    }
}
