//! Per-nexthop delivery queues.
//!
//! A destination's concurrency window starts at the transport's initial
//! concurrency and moves with delivery feedback. A window of zero means the
//! destination is throttled: no entries may be queued for it until the
//! unthrottle timer fires or a flush revives it.

use switchyard_common::{Dsn, delivery};

use crate::{
    QueueManager,
    arena::{DestinationId, EntryId, Link, List, TransportId, define_linkage},
    entry::DestinationEntries,
    timer::TimerKind,
};

define_linkage!(
    /// A transport's round-robin order of destinations
    TransportDestinations: DestinationId, Destination => link
);

#[derive(Debug)]
pub struct Destination {
    pub(crate) id: DestinationId,
    pub(crate) transport: TransportId,
    /// Key within the transport; usually the nexthop
    pub(crate) name: String,
    pub(crate) nexthop: String,

    pub(crate) window: i64,
    pub(crate) success: f64,
    pub(crate) failure: f64,
    pub(crate) fail_cohorts: f64,
    /// Why the destination is throttled
    pub(crate) dsn: Option<Dsn>,

    pub(crate) todo: List<EntryId, DestinationEntries>,
    pub(crate) busy: List<EntryId, DestinationEntries>,

    pub(crate) blocker_tag: u64,
    pub(crate) last_done: u64,
    pub(crate) clog_time_to_warn: u64,

    link: Link<DestinationId>,
}

impl Destination {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn nexthop(&self) -> &str {
        &self.nexthop
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.window > 0
    }

    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        self.window == 0
    }

    pub(crate) fn todo_count(&self) -> i64 {
        self.todo.len() as i64
    }

    pub(crate) fn busy_count(&self) -> i64 {
        self.busy.len() as i64
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.todo.is_empty() && self.busy.is_empty()
    }
}

impl QueueManager {
    pub(crate) fn destination_find(&self, transport: TransportId, name: &str) -> Option<DestinationId> {
        self.transports[transport]
            .destination_by_name
            .get(name)
            .copied()
    }

    pub(crate) fn destination_create(&mut self, transport: TransportId, name: &str, nexthop: &str) -> DestinationId {
        let window = i64::from(self.transports[transport].settings.initial_destination_concurrency);

        let id = self.destinations.insert_with(|id| Destination {
            id,
            transport,
            name: name.to_string(),
            nexthop: nexthop.to_string(),
            window,
            success: 0.0,
            failure: 0.0,
            fail_cohorts: 0.0,
            dsn: None,
            todo: List::default(),
            busy: List::default(),
            blocker_tag: 0,
            last_done: 0,
            clog_time_to_warn: 0,
            link: Link::default(),
        });

        let owner = &mut self.transports[transport];
        owner.destinations.append(&mut self.destinations, id);
        owner.destination_by_name.insert(name.to_string(), id);
        id
    }

    pub(crate) fn destination_obtain(&mut self, transport: TransportId, name: &str, nexthop: &str) -> DestinationId {
        match self.destination_find(transport, name) {
            Some(id) => id,
            None => self.destination_create(transport, name, nexthop),
        }
    }

    /// Drop an empty, healthy destination.
    pub(crate) fn destination_done(&mut self, id: DestinationId) {
        let destination = &self.destinations[id];
        assert!(
            destination.is_empty(),
            "destination {} released with {} todo and {} busy entries",
            destination.name,
            destination.todo_count(),
            destination.busy_count()
        );
        assert!(destination.is_ready(), "destination {} released while throttled", destination.name);
        assert!(destination.dsn.is_none(), "destination {} released with a throttle reason", destination.name);

        let transport = destination.transport;
        let name = destination.name.clone();
        let owner = &mut self.transports[transport];
        owner.destinations.unlink(&mut self.destinations, id);
        owner.destination_by_name.remove(&name);
        self.destinations.remove(id);
    }

    /// Round-robin over the destinations of a transport that have queued
    /// entries and room in their window.
    pub fn destination_select(&mut self, transport: TransportId) -> Option<DestinationId> {
        let owner = &self.transports[transport];
        for id in owner.destinations.ids(&self.destinations) {
            let destination = &self.destinations[id];
            if destination.is_ready()
                && destination.todo_count() > 0
                && destination.busy_count() < destination.window
            {
                self.transports[transport]
                    .destinations
                    .rotate(&mut self.destinations, id);
                return Some(id);
            }
        }
        None
    }

    /// Positive feedback, or revival of a throttled destination.
    pub(crate) fn destination_unthrottle(&mut self, id: DestinationId) {
        let transport = self.destinations[id].transport;
        let settings = &self.transports[transport].settings;
        let limit = i64::from(settings.destination_concurrency_limit);
        let initial = i64::from(settings.initial_destination_concurrency);
        let positive = settings.positive_feedback;

        let destination = &mut self.destinations[id];
        destination.fail_cohorts = 0.0;

        if destination.is_throttled() {
            self.timers.cancel(TimerKind::DestinationUnthrottle(id));
            assert!(
                destination.dsn.take().is_some(),
                "throttled destination {} has no reason",
                destination.name
            );
            destination.window = if destination.busy_count() > 0 {
                destination.busy_count()
            } else {
                initial
            };
            destination.success = 0.0;
            destination.failure = 0.0;
            delivery!(
                level = INFO,
                destination = %destination.name,
                window = destination.window,
                "destination unthrottled"
            );
            return;
        }

        if (limit == 0 || limit > destination.window)
            && destination.window < destination.busy_count() + initial
        {
            let feedback = positive.value(destination.window);
            destination.success += feedback;
            while destination.success + feedback / 2.0 >= 1.0 {
                destination.window += 1;
                destination.success -= 1.0;
                destination.failure = 0.0;
            }
            if limit > 0 && limit < destination.window {
                destination.window = limit;
            }
        }
    }

    /// Negative feedback; enough failed cohorts in a row throttle the
    /// destination until `min_backoff` has passed.
    pub(crate) fn destination_throttle(&mut self, id: DestinationId, dsn: &Dsn) {
        let transport = self.destinations[id].transport;
        let settings = &self.transports[transport].settings;
        let cohort_limit = f64::from(settings.failed_cohort_limit);
        let negative = settings.negative_feedback;
        let backoff = self.config.min_backoff.as_secs();
        let now = self.now();

        let destination = &mut self.destinations[id];
        assert!(destination.is_ready(), "throttling destination {} that is not ready", destination.name);
        assert!(destination.dsn.is_none(), "destination {} is already throttled", destination.name);

        destination.fail_cohorts += 1.0 / destination.window as f64;
        if cohort_limit > 0.0 && destination.fail_cohorts >= cohort_limit {
            destination.window = 0;
        }

        if destination.is_ready() {
            let feedback = negative.value(destination.window);
            destination.failure -= feedback;
            while destination.failure - feedback / 2.0 <= -1.0 {
                destination.window -= 1;
                destination.success = 0.0;
                destination.failure += 1.0;
            }
            if destination.window < 1 {
                destination.window = 1;
            }
        }

        if destination.is_throttled() {
            delivery!(
                level = WARN,
                destination = %destination.name,
                reason = %dsn,
                "destination throttled"
            );
            destination.dsn = Some(dsn.clone());
            self.timers
                .request(TimerKind::DestinationUnthrottle(id), now + backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::TransportOverride, testing::Harness};

    fn harness(overrides: TransportOverride) -> (Harness, TransportId, DestinationId) {
        let mut harness = Harness::with_config(|config| {
            config.transports.insert(String::from("smtp"), overrides);
        });
        let qmgr = &mut harness.qmgr;
        let smtp = qmgr.transport_obtain("smtp");
        let destination = qmgr.destination_create(smtp, "example.com", "example.com");
        (harness, smtp, destination)
    }

    #[test]
    fn test_slow_start_grows_to_limit() {
        let (mut harness, _, id) = harness(TransportOverride {
            destination_concurrency_limit: Some(3),
            initial_destination_concurrency: Some(2),
            ..Default::default()
        });
        let qmgr = &mut harness.qmgr;
        assert_eq!(qmgr.destinations[id].window, 2);

        qmgr.destination_unthrottle(id);
        assert_eq!(qmgr.destinations[id].window, 3);

        // Clamped at the limit
        qmgr.destination_unthrottle(id);
        assert_eq!(qmgr.destinations[id].window, 3);
    }

    #[test]
    fn test_growth_needs_busy_deliveries() {
        let (mut harness, _, id) = harness(TransportOverride::default());
        let qmgr = &mut harness.qmgr;

        // Nothing busy: the window stays below busy + initial
        qmgr.destination_unthrottle(id);
        assert_eq!(qmgr.destinations[id].window, 5);
    }

    #[test]
    fn test_negative_feedback_shrinks_without_throttling() {
        let (mut harness, _, id) = harness(TransportOverride {
            failed_cohort_limit: Some(0),
            ..Default::default()
        });
        let qmgr = &mut harness.qmgr;

        qmgr.destination_throttle(id, &Dsn::new("4.4.1", "connection refused"));
        assert_eq!(qmgr.destinations[id].window, 4);
        assert!(qmgr.destinations[id].dsn.is_none());
    }

    #[test]
    fn test_failed_cohort_throttles_and_revives() {
        let (mut harness, _, id) = harness(TransportOverride {
            initial_destination_concurrency: Some(1),
            ..Default::default()
        });
        let dsn = Dsn::new("4.4.1", "connection refused");
        let qmgr = &mut harness.qmgr;

        qmgr.destination_throttle(id, &dsn);
        let destination = &qmgr.destinations[id];
        assert!(destination.is_throttled());
        assert_eq!(destination.dsn.as_ref(), Some(&dsn));
        assert!(qmgr.timers.is_armed(TimerKind::DestinationUnthrottle(id)));

        qmgr.destination_unthrottle(id);
        let destination = &qmgr.destinations[id];
        assert_eq!(destination.window, 1);
        assert!(destination.dsn.is_none());
        assert!(!qmgr.timers.is_armed(TimerKind::DestinationUnthrottle(id)));
    }

    #[test]
    fn test_done_removes_empty_destination() {
        let (mut harness, smtp, id) = harness(TransportOverride::default());
        let qmgr = &mut harness.qmgr;
        qmgr.destination_done(id);
        assert!(!qmgr.destinations.contains(id));
        assert_eq!(qmgr.destination_find(smtp, "example.com"), None);
    }
}
