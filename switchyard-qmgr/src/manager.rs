//! The scheduler state and its synchronous entry points.
//!
//! [`QueueManager`] never blocks. Work that needs I/O with another process
//! (opening a delivery agent connection, sending a notification) is queued as
//! an [`Action`] for the async driver, which reports back through the
//! `session_*`, `delivery_*` and `notice_done` methods.

use std::sync::Arc;

use ahash::AHashMap;
use switchyard_common::internal;
use switchyard_spool::{LogFiles, QueueArea, QueueStore};
use switchyard_tracing::traced;

use crate::{
    QmgrError,
    arena::{
        Arena, DestinationId, EntryId, JobId, List, MessageId, PeerId, SessionId, TransportId,
    },
    bounce::{BounceService, NoticeRequest},
    clock::{Clock, SystemClock, system_time},
    config::QmgrConfig,
    deliver::Session,
    destination::Destination,
    entry::Entry,
    flow::{FlowControl, TokenCounter},
    job::Job,
    message::Message,
    peer::Peer,
    resolve::Resolver,
    scan::{QueueScan, ScanFlags},
    timer::{TimerKind, Timers},
    transport::{Transport, TransportRing},
};

/// Work for the async driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a delivery agent connection; report with
    /// [`QueueManager::session_opened`].
    Connect { transport: TransportId, name: String },
    /// Send a notification; report with [`QueueManager::notice_done`].
    Notice {
        message: MessageId,
        request: NoticeRequest,
    },
}

/// Whether a loop iteration found something to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// A file was fed; run again without waiting
    Busy,
    /// Wait for a trigger, a timer or a delivery event
    Idle,
}

/// In-core counts, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub messages: usize,
    pub recipients: i64,
    pub transports: usize,
    pub destinations: usize,
    pub jobs: usize,
    pub entries: usize,
    pub sessions: usize,
}

#[derive(Debug)]
pub struct QueueManager {
    pub(crate) config: Arc<QmgrConfig>,
    pub(crate) store: QueueStore,
    pub(crate) logs: LogFiles,
    pub(crate) bounce: Arc<dyn BounceService>,
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) flow: Box<dyn FlowControl>,

    pub(crate) timers: Timers,
    /// Recipients in core, across all messages
    pub(crate) recipient_count: i64,

    pub(crate) messages: Arena<MessageId, Message>,
    pub(crate) jobs: Arena<JobId, Job>,
    pub(crate) peers: Arena<PeerId, Peer>,
    pub(crate) entries: Arena<EntryId, Entry>,
    pub(crate) destinations: Arena<DestinationId, Destination>,
    pub(crate) transports: Arena<TransportId, Transport>,
    pub(crate) sessions: Arena<SessionId, Session>,

    pub(crate) transport_ring: List<TransportId, TransportRing>,
    pub(crate) transport_by_name: AHashMap<String, TransportId>,

    pub(crate) incoming: QueueScan,
    pub(crate) deferred: QueueScan,
    /// Which scanner the next feed tries first
    pub(crate) deferred_first: bool,

    pub(crate) actions: Vec<Action>,
}

impl QueueManager {
    pub fn new(
        config: Arc<QmgrConfig>,
        store: QueueStore,
        bounce: Arc<dyn BounceService>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            logs: LogFiles::new(store.clone()),
            flow: Box::new(TokenCounter::default()),
            clock: Arc::new(SystemClock),
            config,
            store,
            bounce,
            resolver,
            timers: Timers::default(),
            recipient_count: 0,
            messages: Arena::default(),
            jobs: Arena::default(),
            peers: Arena::default(),
            entries: Arena::default(),
            destinations: Arena::default(),
            transports: Arena::default(),
            sessions: Arena::default(),
            transport_ring: List::default(),
            transport_by_name: AHashMap::default(),
            incoming: QueueScan::new(QueueArea::Incoming),
            deferred: QueueScan::new(QueueArea::Deferred),
            deferred_first: false,
            actions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_flow_control(mut self, flow: Box<dyn FlowControl>) -> Self {
        self.flow = flow;
        self
    }

    #[must_use]
    pub fn config(&self) -> &QmgrConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &QueueStore {
        &self.store
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            messages: self.messages.len(),
            recipients: self.recipient_count,
            transports: self.transports.len(),
            destinations: self.destinations.len(),
            jobs: self.jobs.len(),
            entries: self.entries.len(),
            sessions: self.sessions.len(),
        }
    }

    /// Everything queued for the async driver since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Recover from the previous run and start scanning.
    ///
    /// Files still in the active area were being worked on when the last
    /// process stopped; they go back to incoming and are read afresh.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    pub fn start(&mut self) -> Result<(), QmgrError> {
        self.store.init().map_err(|source| QmgrError::Scan {
            area: QueueArea::Active,
            source,
        })?;

        let now = self.now();
        let moved = self
            .store
            .move_all(QueueArea::Active, QueueArea::Incoming, system_time(now))
            .map_err(|source| QmgrError::Scan {
                area: QueueArea::Active,
                source,
            })?;
        if moved > 0 {
            internal!(level = INFO, moved, "recovered files from the active queue");
        }

        self.scan_request(QueueArea::Incoming, ScanFlags::START);
        self.timers.request(
            TimerKind::DeferredScan,
            now + self.config.queue_run_delay.as_secs(),
        );
        internal!(level = INFO, root = %self.store.root().display(), "queue manager started");
        Ok(())
    }

    /// One pass of the main loop: admit at most one file, adjust upstream
    /// flow control, then ask for agent connections wherever there is work.
    #[traced(instrument(level = tracing::Level::TRACE, skip(self)), timing(precision = "us"))]
    pub fn run_once(&mut self) -> Result<Pace, QmgrError> {
        let fed = self.feed_next()?;

        if !self.config.flow.in_flow_delay.is_zero() {
            self.flow_adjust(fed == Some(QueueArea::Incoming));
        }

        self.active_drain();
        Ok(if fed.is_some() { Pace::Busy } else { Pace::Idle })
    }

    /// Feed one file, alternating between the two scanners. Returns the area
    /// a file was fed from.
    fn feed_next(&mut self) -> Result<Option<QueueArea>, QmgrError> {
        for _ in 0..2 {
            if self.messages.len() >= self.config.active_limit
                || self.recipient_count >= self.config.recipient_limit
            {
                return Ok(None);
            }

            self.deferred_first = !self.deferred_first;
            let area = if self.deferred_first {
                QueueArea::Deferred
            } else {
                QueueArea::Incoming
            };

            let Some((queue_id, flags)) = self.scan_next(area)? else {
                continue;
            };

            self.active_feed(area, queue_id, flags)?;
            return Ok(Some(area));
        }
        Ok(None)
    }

    fn flow_adjust(&mut self, fed_incoming: bool) {
        let limit = self.config.flow.process_limit;
        let count = self.flow.count();
        if count < limit {
            if fed_incoming {
                self.flow.put(1);
            } else if self.incoming.is_idle() {
                self.flow.put(limit - count);
            }
        } else if count > limit {
            self.flow.get(count - limit);
        }
    }

    /// When the next timer is due, in clock seconds.
    #[must_use]
    pub fn next_timer(&self) -> Option<u64> {
        self.timers.next_due()
    }

    /// Run every timer that is due.
    pub fn run_timers(&mut self) {
        let now = self.now();
        while let Some(kind) = self.timers.pop_due(now) {
            match kind {
                TimerKind::DeferredScan => {
                    self.scan_request(QueueArea::Deferred, ScanFlags::START);
                    self.timers.request(
                        TimerKind::DeferredScan,
                        now + self.config.queue_run_delay.as_secs(),
                    );
                }
                TimerKind::TransportUnthrottle(id) => self.transport_unthrottle(id),
                TimerKind::DestinationUnthrottle(id) => {
                    if self.destinations.contains(id) {
                        self.destination_enable(id);
                    }
                }
            }
        }
    }

    /// Revive a destination and drop it if it has nothing queued.
    pub(crate) fn destination_enable(&mut self, id: DestinationId) {
        if self.destinations[id].is_throttled() {
            self.destination_unthrottle(id);
        }
        if self.destinations[id].is_empty() {
            self.destination_done(id);
        }
    }

    /// Revive every transport and destination.
    pub(crate) fn enable_all(&mut self) {
        internal!(level = INFO, "flushing dead transports and destinations");
        for transport in self.transport_ring.ids(&self.transports) {
            self.transport_unthrottle(transport);
            for destination in self.transports[transport]
                .destinations
                .ids(&self.destinations)
            {
                self.destination_enable(destination);
            }
        }
    }
}
