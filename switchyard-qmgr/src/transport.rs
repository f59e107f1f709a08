//! Named delivery channels.
//!
//! A transport owns its destinations, the jobs of every message routed
//! through it, and the recipient slot pool those jobs share. Transports are
//! never freed; a dead one is skipped until its retry timer fires or a flush
//! revives it.

use ahash::AHashMap;
use switchyard_common::{Dsn, delivery};

use crate::{
    QueueManager,
    arena::{DestinationId, JobId, Link, List, MessageId, TransportId, define_linkage},
    config::TransportSettings,
    destination::TransportDestinations,
    job::{TimeOrder, TransportJobs},
    timer::TimerKind,
};

/// Connections being opened to one transport at most at once.
const MAX_PENDING: u32 = 2;

define_linkage!(
    /// The round-robin order of all transports
    TransportRing: TransportId, Transport => link
);

#[derive(Debug)]
pub struct Transport {
    pub(crate) id: TransportId,
    pub(crate) name: String,
    pub(crate) settings: TransportSettings,
    /// Set while the transport is throttled
    pub(crate) dead: Option<Dsn>,
    /// Agent connections requested but not yet established
    pub(crate) pending: u32,

    pub(crate) destinations: List<DestinationId, TransportDestinations>,
    pub(crate) destination_by_name: AHashMap<String, DestinationId>,

    /// Scheduling order: by queue time, except where preemption moved a job
    pub(crate) jobs: List<JobId, TransportJobs>,
    /// Strict queue time order, used to find jobs with unread recipients
    pub(crate) jobs_by_time: List<JobId, TimeOrder>,
    pub(crate) job_by_message: AHashMap<MessageId, JobId>,
    pub(crate) job_current: Option<JobId>,
    pub(crate) job_next_unread: Option<JobId>,

    pub(crate) candidate_cache: Option<JobId>,
    pub(crate) candidate_cache_current: Option<JobId>,
    pub(crate) candidate_cache_time: u64,
    /// Jobs and destinations carrying this tag are known to be blocked
    pub(crate) blocker_tag: u64,

    /// Recipient slots not claimed by any job; negative while preempting
    /// jobs borrow from the extra allowance
    pub(crate) rcpt_unused: i64,

    link: Link<TransportId>,
}

impl Transport {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    pub(crate) fn slot_cost(&self) -> i64 {
        i64::from(self.settings.delivery_slot_cost)
    }

    pub(crate) fn reset_candidate_cache(&mut self) {
        self.candidate_cache_current = None;
    }
}

impl QueueManager {
    pub(crate) fn transport_find(&self, name: &str) -> Option<TransportId> {
        self.transport_by_name.get(name).copied()
    }

    pub(crate) fn transport_create(&mut self, name: &str) -> TransportId {
        let settings = self.config.transport(name);
        let rcpt_unused = i64::from(settings.recipient_limit);

        let id = self.transports.insert_with(|id| Transport {
            id,
            name: name.to_string(),
            settings,
            dead: None,
            pending: 0,
            destinations: List::default(),
            destination_by_name: AHashMap::default(),
            jobs: List::default(),
            jobs_by_time: List::default(),
            job_by_message: AHashMap::default(),
            job_current: None,
            job_next_unread: None,
            candidate_cache: None,
            candidate_cache_current: None,
            candidate_cache_time: 0,
            blocker_tag: 1,
            rcpt_unused,
            link: Link::default(),
        });
        self.transport_ring.prepend(&mut self.transports, id);
        self.transport_by_name.insert(name.to_string(), id);

        delivery!(level = DEBUG, transport = name, "transport created");
        id
    }

    pub(crate) fn transport_obtain(&mut self, name: &str) -> TransportId {
        match self.transport_find(name) {
            Some(id) => id,
            None => self.transport_create(name),
        }
    }

    /// Pick a transport with more deliverable work than it has connections
    /// on the way, rotating it to the back of the ring.
    pub(crate) fn transport_select(&mut self) -> Option<TransportId> {
        for id in self.transport_ring.ids(&self.transports) {
            let transport = &self.transports[id];
            if transport.is_dead() || transport.pending >= MAX_PENDING {
                continue;
            }

            let mut need = i64::from(transport.pending) + 1;
            let mut cursor = transport.destinations.head();
            while let Some(destination_id) = cursor {
                let destination = &self.destinations[destination_id];
                cursor = List::<_, TransportDestinations>::next(&self.destinations, destination_id);
                if !destination.is_ready() {
                    continue;
                }
                need -= (destination.window - destination.busy_count())
                    .min(destination.todo_count());
                if need <= 0 {
                    self.transport_ring.rotate(&mut self.transports, id);
                    return Some(id);
                }
            }
        }
        None
    }

    /// Mark a transport dead and schedule its revival.
    pub(crate) fn transport_throttle(&mut self, id: TransportId, dsn: &Dsn) {
        let retry = self.config.transport_retry_time.as_secs();
        let now = self.now();
        let transport = &mut self.transports[id];
        if transport.is_dead() {
            return;
        }

        delivery!(level = WARN, transport = %transport.name, reason = %dsn, "transport throttled");
        transport.dead = Some(dsn.clone());
        self.timers
            .request(TimerKind::TransportUnthrottle(id), now + retry);
    }

    pub(crate) fn transport_unthrottle(&mut self, id: TransportId) {
        let transport = &mut self.transports[id];
        if transport.dead.take().is_some() {
            delivery!(level = INFO, transport = %transport.name, "transport unthrottled");
            self.timers.cancel(TimerKind::TransportUnthrottle(id));
        }
    }
}
