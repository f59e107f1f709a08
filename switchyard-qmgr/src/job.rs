//! Jobs and the preemption scheduler.
//!
//! A job is one message's work on one transport. Each transport keeps its
//! jobs on two lists: a scheduling list, roughly in queue time order but with
//! preempting jobs spliced in ahead of the job they preempted, and a strict
//! queue time list used to hand spare recipient slots to the oldest job that
//! still has recipients on disk.
//!
//! Every selected entry earns its job one delivery slot. Once a job has
//! earned enough, a smaller job further down the list that would fit into
//! those slots may preempt it: it is moved directly in front of the job and
//! becomes its child on the preemption stack. When the child is popped, the
//! parent is charged with the slots the child actually used.
//!
//! Jobs whose entries are all blocked by destination concurrency limits are
//! tagged with the transport's blocker tag and skipped until a destination
//! frees up, at which point the transport bumps its tag and every blocker is
//! reconsidered at once.

use std::mem;

use ahash::AHashMap;
use switchyard_common::delivery;

use crate::{
    QmgrError, QueueManager,
    arena::{DestinationId, EntryId, JobId, Link, List, MessageId, PeerId, TransportId, define_linkage},
    peer::JobPeers,
};

define_linkage!(
    /// A transport's scheduling order
    TransportJobs: JobId, Job => transport_link
);

define_linkage!(
    /// A transport's queue time order
    TimeOrder: JobId, Job => time_link
);

define_linkage!(
    /// Children of one job on the preemption stack
    StackSiblings: JobId, Job => sibling_link
);

define_linkage!(
    /// The jobs of one message, one per transport
    MessageJobs: JobId, Job => message_link
);

#[derive(Debug)]
pub struct Job {
    pub(crate) message: MessageId,
    pub(crate) transport: TransportId,

    /// Negative while the job is off the transport lists
    pub(crate) stack_level: i64,
    pub(crate) stack_parent: Option<JobId>,
    pub(crate) stack_children: List<JobId, StackSiblings>,

    pub(crate) peers: List<PeerId, JobPeers>,
    pub(crate) peer_by_destination: AHashMap<DestinationId, PeerId>,

    pub(crate) blocker_tag: u64,

    /// Recipients in core for this job
    pub(crate) rcpt_count: i64,
    /// Recipient slots this job may fill
    pub(crate) rcpt_limit: i64,

    pub(crate) read_entries: i64,
    pub(crate) selected_entries: i64,
    pub(crate) slots_used: i64,
    pub(crate) slots_available: i64,

    transport_link: Link<JobId>,
    time_link: Link<JobId>,
    sibling_link: Link<JobId>,
    message_link: Link<JobId>,
}

impl Job {
    /// Entries read in that have not been selected yet.
    pub(crate) const fn has_entries(&self) -> bool {
        self.selected_entries < self.read_entries
    }
}

impl QueueManager {
    pub(crate) fn job_is_blocker(&self, job: JobId) -> bool {
        let job = &self.jobs[job];
        job.blocker_tag == self.transports[job.transport].blocker_tag
    }

    /// Entries this job will have once every recipient is read.
    fn job_max_entries(&self, job: JobId) -> i64 {
        let job = &self.jobs[job];
        job.read_entries + self.messages[job.message].rcpt_unread
    }

    fn job_create(&mut self, message: MessageId, transport: TransportId) -> JobId {
        let id = self.jobs.insert_with(|_| Job {
            message,
            transport,
            stack_level: -1,
            stack_parent: None,
            stack_children: List::default(),
            peers: List::default(),
            peer_by_destination: AHashMap::default(),
            blocker_tag: 0,
            rcpt_count: 0,
            rcpt_limit: 0,
            read_entries: 0,
            selected_entries: 0,
            slots_used: 0,
            slots_available: 0,
            transport_link: Link::default(),
            time_link: Link::default(),
            sibling_link: Link::default(),
            message_link: Link::default(),
        });
        self.messages[message].jobs.append(&mut self.jobs, id);
        self.transports[transport].job_by_message.insert(message, id);
        id
    }

    /// Put an unlinked job on both transport lists in queue time order.
    fn job_link(&mut self, id: JobId) {
        let (message, transport) = {
            let job = &self.jobs[id];
            assert!(job.stack_level < 0, "linking a job that is already linked");
            (job.message, job.transport)
        };
        let queued = self.messages[message].queued_time;

        // Walk both lists from the back. On the scheduling list, children
        // still attached to a parent are stepped over so the job lands in
        // time order among level zero jobs and orphans.
        let owner = &self.transports[transport];
        let mut current = owner.job_current;
        let mut next = None;
        let mut prev = owner.jobs.tail();
        while let Some(candidate) = prev {
            let job = &self.jobs[candidate];
            if job.stack_parent.is_none() && self.messages[job.message].queued_time <= queued {
                break;
            }
            if current == Some(candidate) {
                current = None;
            }
            next = prev;
            prev = List::<_, TransportJobs>::prev(&self.jobs, candidate);
        }
        let (list_prev, list_next) = (prev, next);

        let mut unread = owner.job_next_unread;
        let mut next = None;
        let mut prev = owner.jobs_by_time.tail();
        while let Some(candidate) = prev {
            if self.messages[self.jobs[candidate].message].queued_time <= queued {
                break;
            }
            if unread == Some(candidate) {
                unread = None;
            }
            next = prev;
            prev = List::<_, TimeOrder>::prev(&self.jobs, candidate);
        }

        self.jobs[id].stack_level = 0;
        let owner = &mut self.transports[transport];
        owner.jobs.link_between(&mut self.jobs, list_prev, id, list_next);
        owner.jobs_by_time.link_between(&mut self.jobs, prev, id, next);

        if current.is_none() {
            owner.job_current = Some(id);
        }

        // The job is now the first one with unread recipients; take over the
        // spare slots of the previous holder.
        if unread.is_none() {
            let previous = owner.job_next_unread.replace(id);
            if let Some(previous) = previous {
                self.job_move_limits(previous);
            }
        }

        // Grab the whole pool for now. The excess goes back once the job's
        // real needs are known.
        let owner = &mut self.transports[transport];
        if owner.rcpt_unused > 0 {
            let unused = mem::take(&mut owner.rcpt_unused);
            self.jobs[id].rcpt_limit += unused;
            self.messages[message].rcpt_limit += unused;
        }
    }

    /// Find or create the job of `message` on `transport` and make sure it is
    /// schedulable.
    pub(crate) fn job_obtain(&mut self, message: MessageId, transport: TransportId) -> JobId {
        let existing = self.transports[transport].job_by_message.get(&message).copied();
        let id = match existing {
            Some(id) => id,
            None => self.job_create(message, transport),
        };

        if self.jobs[id].stack_level < 0 {
            self.job_link(id);
        }

        // New recipients may make the job a better candidate, or unblock it.
        self.transports[transport].reset_candidate_cache();
        if self.job_is_blocker(id) {
            self.jobs[id].blocker_tag = 0;
            let owner = &mut self.transports[transport];
            owner.job_current = owner.jobs.head();
        }
        id
    }

    /// Return unused recipient slots to the transport pool, and pass the pool
    /// on to the oldest job that still has recipients to read.
    pub(crate) fn job_move_limits(&mut self, id: JobId) {
        let (message, transport) = {
            let job = &self.jobs[id];
            (job.message, job.transport)
        };

        let mut next = self.transports[transport].job_next_unread;
        if next == Some(id) {
            loop {
                next = next.and_then(|job| List::<_, TimeOrder>::next(&self.jobs, job));
                match next {
                    Some(job) if self.messages[self.jobs[job].message].rcpt_offset == 0 => continue,
                    _ => break,
                }
            }
            self.transports[transport].job_next_unread = next;
        }

        let job = &self.jobs[id];
        let owner = &self.messages[message];
        let unused = (job.rcpt_limit - job.rcpt_count).min(owner.rcpt_limit - owner.rcpt_count);
        if unused <= 0 {
            return;
        }

        self.jobs[id].rcpt_limit -= unused;
        self.messages[message].rcpt_limit -= unused;
        let pool = &mut self.transports[transport].rcpt_unused;
        *pool += unused;

        if let Some(next) = next
            && *pool > 0
        {
            let slots = mem::take(pool);
            let next_message = self.jobs[next].message;
            self.jobs[next].rcpt_limit += slots;
            self.messages[next_message].rcpt_limit += slots;
        }
    }

    /// Hand the children of `id` to `parent`, or orphan them.
    fn job_parent_gone(&mut self, id: JobId, parent: Option<JobId>) {
        let mut children = mem::take(&mut self.jobs[id].stack_children);
        while let Some(child) = children.head() {
            children.unlink(&mut self.jobs, child);
            if let Some(parent) = parent {
                let mut adopted = mem::take(&mut self.jobs[parent].stack_children);
                adopted.append(&mut self.jobs, child);
                self.jobs[parent].stack_children = adopted;
            }
            self.jobs[child].stack_parent = parent;
        }
    }

    fn job_unlink(&mut self, id: JobId) {
        let job = &self.jobs[id];
        assert_eq!(job.stack_level, 0, "unlinking a job that is not at stack level zero");
        assert!(job.stack_parent.is_none(), "unlinking a job that still has a parent");
        assert!(
            job.sibling_link.prev.is_none() && job.sibling_link.next.is_none(),
            "unlinking a job that still has siblings"
        );
        let transport = job.transport;

        self.job_parent_gone(id, None);

        let next = List::<_, TransportJobs>::next(&self.jobs, id);
        let owner = &mut self.transports[transport];
        if owner.job_current == Some(id) {
            owner.job_current = next;
        }
        if owner.candidate_cache == Some(id) || owner.candidate_cache_current == Some(id) {
            owner.reset_candidate_cache();
        }

        owner.jobs.unlink(&mut self.jobs, id);
        owner.jobs_by_time.unlink(&mut self.jobs, id);
        self.jobs[id].stack_level = -1;
    }

    /// Take a job with nothing left to select off the lists. It comes back
    /// through [`Self::job_obtain`] if more recipients are read.
    fn job_retire(&mut self, id: JobId) {
        if self.jobs[id].stack_level > 0 {
            self.job_pop(id);
        }
        self.job_move_limits(id);
        self.job_unlink(id);
    }

    /// Release a job of a message that is going away.
    ///
    /// # Panics
    ///
    /// If the job still has recipients in core or keeps recipient slots.
    pub(crate) fn job_free(&mut self, id: JobId) {
        assert_eq!(self.jobs[id].rcpt_count, 0, "freeing a job with recipients in core");

        if self.jobs[id].stack_level > 0 {
            self.job_pop(id);
        }
        self.job_move_limits(id);
        let job = &self.jobs[id];
        assert_eq!(job.rcpt_limit, 0, "freeing a job that holds recipient slots");

        if job.stack_level == 0 {
            self.job_unlink(id);
        }
        let (message, transport) = (self.jobs[id].message, self.jobs[id].transport);
        self.messages[message].jobs.unlink(&mut self.jobs, id);
        self.transports[transport].job_by_message.remove(&message);
        self.jobs.remove(id);
    }

    fn job_count_slots(&mut self, id: JobId) {
        let job = &mut self.jobs[id];
        job.slots_used += 1;
        job.slots_available += 1;

        let owner = &mut self.transports[job.transport];
        if owner.candidate_cache_current != Some(id) {
            owner.reset_candidate_cache();
        }
    }

    /// The best job to preempt `current`: the one after it with the highest
    /// waiting time per entry that fits into the slots `current` can still
    /// earn.
    fn job_candidate(&mut self, current: JobId) -> Option<JobId> {
        let now = self.now();
        let transport = self.jobs[current].transport;
        let owner = &self.transports[transport];
        if owner.candidate_cache_current == Some(current)
            && (owner.candidate_cache_time == now || owner.candidate_cache.is_none())
        {
            return owner.candidate_cache;
        }

        let slot_cost = owner.slot_cost();
        let job = &self.jobs[current];
        let max_slots = (job.read_entries - job.selected_entries + job.slots_available) / slot_cost;

        let mut best = None;
        let mut best_score = 0.0;
        let mut cursor = List::<_, TransportJobs>::next(&self.jobs, current);
        while let Some(id) = cursor {
            cursor = List::<_, TransportJobs>::next(&self.jobs, id);
            let job = &self.jobs[id];
            if !job.stack_children.is_empty() || self.job_is_blocker(id) {
                continue;
            }

            let max_total = self.job_max_entries(id);
            let max_needed = max_total - job.selected_entries;
            let delay = now as i64 - self.messages[job.message].queued_time as i64 + 1;
            if max_needed > 0 && max_needed <= max_slots {
                let score = delay as f64 / max_total as f64;
                if score > best_score {
                    best_score = score;
                    best = Some(id);
                }
            }

            // Later jobs were queued later; none of them can beat this.
            if delay as f64 <= best_score {
                break;
            }
        }

        let owner = &mut self.transports[transport];
        owner.candidate_cache = best;
        owner.candidate_cache_current = Some(current);
        owner.candidate_cache_time = now;
        best
    }

    /// Let a better job jump ahead of `current` if `current` has earned
    /// enough slots. Returns the job to schedule from.
    fn job_preempt(&mut self, current: JobId) -> JobId {
        let transport = self.jobs[current].transport;
        let (slot_cost, min_slots, slot_loan, loan_factor) = {
            let settings = &self.transports[transport].settings;
            (
                i64::from(settings.delivery_slot_cost),
                i64::from(settings.minimum_delivery_slots),
                i64::from(settings.delivery_slot_loan),
                f64::from(settings.slot_loan_factor()),
            )
        };

        if self.jobs[current].slots_available <= 0
            || self.job_max_entries(current) < min_slots * slot_cost
        {
            return current;
        }

        let Some(candidate) = self.job_candidate(current) else {
            return current;
        };
        assert_ne!(candidate, current, "job chosen to preempt itself");
        assert!(
            self.jobs[candidate].stack_children.is_empty(),
            "preempting job has children"
        );

        let expected = self.job_max_entries(candidate) - self.jobs[candidate].selected_entries;
        assert!(expected > 0, "preempting job expects no entries");

        let available = self.jobs[current].slots_available;
        if ((available / slot_cost + slot_loan) as f64) < expected as f64 * loan_factor / 100.0 {
            return current;
        }

        if self.jobs[candidate].stack_level > 0 {
            self.job_pop(candidate);
        }
        let owner = &mut self.transports[transport];
        owner.jobs.unlink(&mut self.jobs, candidate);
        owner.jobs.insert_before(&mut self.jobs, current, candidate);

        let mut children = mem::take(&mut self.jobs[current].stack_children);
        children.append(&mut self.jobs, candidate);
        self.jobs[current].stack_children = children;
        let level = self.jobs[current].stack_level + 1;
        let job = &mut self.jobs[candidate];
        job.stack_parent = Some(current);
        job.stack_level = level;

        let owner = &mut self.transports[transport];
        owner.job_current = Some(candidate);
        owner.reset_candidate_cache();

        // Charge the parent up front so several children cannot spend the
        // same slots; the pop settles the difference.
        self.jobs[current].slots_available -= expected * slot_cost;
        self.jobs[candidate].slots_used = -expected;

        // Lend part of the extra recipient allowance to a job that still has
        // recipients on disk.
        let message = self.jobs[candidate].message;
        if self.messages[message].rcpt_offset != 0 {
            let owner = &mut self.transports[transport];
            let slots = (i64::from(owner.settings.extra_recipient_limit) + owner.rcpt_unused + 1) / 2;
            owner.rcpt_unused -= slots;
            self.jobs[candidate].rcpt_limit += slots;
            self.messages[message].rcpt_limit += slots;
        }

        delivery!(
            level = DEBUG,
            transport = %self.transports[transport].name,
            queue_id = %self.messages[message].queue_id,
            stack_level = self.jobs[candidate].stack_level,
            "job preempted"
        );
        candidate
    }

    /// Take a job off the preemption stack, settling its parent's slots.
    fn job_pop(&mut self, id: JobId) {
        let job = &self.jobs[id];
        assert!(job.stack_level > 0, "popping a job that is not stacked");
        let transport = job.transport;
        let parent = job.stack_parent;

        if let Some(parent) = parent {
            let slot_cost = self.transports[transport].slot_cost();
            // Only the parent this job actually preempted pays for it.
            if self.jobs[id].stack_level == self.jobs[parent].stack_level + 1 {
                let used = self.jobs[id].slots_used;
                self.jobs[parent].slots_available -= used * slot_cost;
            }
            let mut siblings = mem::take(&mut self.jobs[parent].stack_children);
            siblings.unlink(&mut self.jobs, id);
            self.jobs[parent].stack_children = siblings;
            self.jobs[id].stack_parent = None;
        }

        self.job_parent_gone(id, parent);
        self.jobs[id].stack_level = 0;
        self.transports[transport].reset_candidate_cache();
    }

    fn job_wants_refill(&self, id: JobId, timed: bool) -> bool {
        let job = &self.jobs[id];
        let message = &self.messages[job.message];
        let settings = &self.transports[job.transport].settings;

        if message.rcpt_offset == 0
            || message.rcpt_limit <= message.rcpt_count
            || job.rcpt_limit <= job.rcpt_count
            || message.refcount <= 0
            || self.recipient_count >= self.config.recipient_limit
        {
            return false;
        }
        if !timed {
            return true;
        }

        job.rcpt_limit - job.rcpt_count >= i64::from(settings.refill_limit)
            || self.now().saturating_sub(message.refill_time) >= settings.refill_delay.as_secs()
    }

    /// A peer of `id` with an entry ready to go, reading more recipients
    /// first when there is room and it has been a while.
    fn job_peer_select(&mut self, id: JobId) -> Result<Option<PeerId>, QmgrError> {
        let message = self.jobs[id].message;

        if self.job_wants_refill(id, true) {
            self.message_realloc(message)?;
        }
        if self.jobs[id].has_entries()
            && let Some(peer) = self.peer_select(id)
        {
            return Ok(Some(peer));
        }

        // Last chance before giving up on this job for now.
        if self.job_wants_refill(id, false) {
            self.message_realloc(message)?;
            if self.jobs[id].has_entries() {
                return Ok(self.peer_select(id));
            }
        }
        Ok(None)
    }

    /// Pick the next entry to deliver on `transport` and mark it busy.
    pub(crate) fn entry_select(&mut self, transport: TransportId) -> Result<Option<EntryId>, QmgrError> {
        let mut cursor = self.transports[transport].job_current;
        if let Some(current) = cursor
            && self.transports[transport].slot_cost() >= 2
        {
            cursor = Some(self.job_preempt(current));
        }

        while let Some(id) = cursor {
            cursor = List::<_, TransportJobs>::next(&self.jobs, id);

            if self.job_is_blocker(id) {
                continue;
            }

            if let Some(peer) = self.job_peer_select(id)? {
                let Some(entry) = self.entry_take(peer) else {
                    panic!("selected peer has no entries");
                };
                self.job_count_slots(id);
                self.transports[transport].job_current = Some(id);

                let message = self.jobs[id].message;
                if !self.jobs[id].has_entries() && self.messages[message].rcpt_offset == 0 {
                    self.job_retire(id);
                }
                return Ok(Some(entry));
            }

            if self.jobs[id].has_entries() {
                // Everything this job has is waiting on busy destinations.
                let tag = self.transports[transport].blocker_tag;
                self.jobs[id].blocker_tag = tag;
                for peer in self.jobs[id].peers.ids(&self.peers) {
                    let peer = &self.peers[peer];
                    if !peer.entries.is_empty() {
                        self.destinations[peer.destination].blocker_tag = tag;
                    }
                }
            } else {
                self.job_retire(id);
            }

            // Reading recipients can rearrange the list; stop if the saved
            // successor is gone.
            if let Some(next) = cursor
                && (!self.jobs.contains(next) || self.jobs[next].stack_level < 0)
            {
                cursor = None;
            }
        }

        self.transports[transport].job_current = None;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_obtain_links_once_and_grabs_pool() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, _) = harness.queue_entries(smtp, "example.com", 4);
        let qmgr = &mut harness.qmgr;

        let job = qmgr.job_obtain(message, smtp);
        assert_eq!(qmgr.job_obtain(message, smtp), job);
        assert_eq!(qmgr.transports[smtp].jobs.len(), 1);
        assert_eq!(qmgr.jobs[job].read_entries, 4);
        assert_eq!(qmgr.jobs[job].rcpt_count, 4);
        // The fully read message handed everything it did not need back.
        assert_eq!(qmgr.jobs[job].rcpt_limit, 4);
        assert_eq!(qmgr.transports[smtp].rcpt_unused, 20_000 - 4);
        harness.assert_invariants();
    }

    #[test]
    fn test_move_limits_is_idempotent() {
        let mut harness = Harness::with_config(|config| config.recipient_limit = 30);
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (first, _) = harness.queue_entries(smtp, "example.com", 3);
        let (second, _) = harness.queue_entries(smtp, "example.org", 60);
        let qmgr = &mut harness.qmgr;
        let job = qmgr.job_obtain(first, smtp);
        let other = qmgr.job_obtain(second, smtp);

        let snapshot = |qmgr: &QueueManager| {
            (
                qmgr.jobs[job].rcpt_limit,
                qmgr.jobs[other].rcpt_limit,
                qmgr.messages[first].rcpt_limit,
                qmgr.messages[second].rcpt_limit,
                qmgr.transports[smtp].rcpt_unused,
                qmgr.transports[smtp].job_next_unread,
            )
        };

        // The second message is still partly on disk and holds the pool.
        assert!(qmgr.messages[second].rcpt_offset > 0);
        qmgr.job_move_limits(other);
        let once = snapshot(qmgr);
        qmgr.job_move_limits(other);
        assert_eq!(snapshot(qmgr), once);
        harness.assert_invariants();
    }

    #[test]
    fn test_blocked_job_is_tagged_and_released() {
        let mut harness = Harness::with_config(|config| {
            config.transports.insert(
                String::from("smtp"),
                crate::config::TransportOverride {
                    initial_destination_concurrency: Some(1),
                    ..Default::default()
                },
            );
        });
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, _) = harness.queue_entries(smtp, "example.com", 2);
        let qmgr = &mut harness.qmgr;
        let job = qmgr.job_obtain(message, smtp);

        let entry = qmgr.entry_select(smtp).unwrap().unwrap();
        // The window of one is full: the job is blocked.
        assert_eq!(qmgr.entry_select(smtp).unwrap(), None);
        assert!(qmgr.job_is_blocker(job));

        qmgr.entry_done(entry, crate::entry::EntryState::Busy).unwrap();
        assert!(!qmgr.job_is_blocker(job));
        assert!(qmgr.entry_select(smtp).unwrap().is_some());
    }

    #[test]
    fn test_small_job_preempts_large_one() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (large, _) = harness.queue_entries(smtp, "big.example", 120);
        harness.clock.advance(Duration::from_secs(600));
        let (small, _) = harness.queue_entries(smtp, "small.example", 4);

        let mut order = Vec::new();
        while let Some(message) = harness.deliver_next(smtp) {
            order.push(message);
            harness.assert_invariants();
        }

        let first_small = order.iter().position(|&m| m == small).unwrap();
        let last_small = order.iter().rposition(|&m| m == small).unwrap();
        let last_large = order.iter().rposition(|&m| m == large).unwrap();
        assert!(first_small > 0);
        // Once in, the small job runs to completion before the large one
        // resumes.
        assert_eq!(last_small - first_small, 3);
        assert!(last_small < last_large);
        assert_eq!(harness.qmgr.stats().jobs, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_preemption_happens_before_large_job_drains(
            large in 100_usize..240,
            small in 1_usize..20,
            gap in 60_u64..86_400,
        ) {
            let mut harness = Harness::new();
            let smtp = harness.qmgr.transport_obtain("smtp");
            let (first, _) = harness.queue_entries(smtp, "big.example", large);
            harness.clock.advance(Duration::from_secs(gap));
            let (second, _) = harness.queue_entries(smtp, "small.example", small);

            let mut selections = 0;
            let mut large_done = 0;
            let mut preempted = false;
            while let Some(message) = harness.deliver_next(smtp) {
                selections += 1;
                harness.assert_invariants();
                if message == second {
                    preempted = large_done < large;
                    break;
                }
                prop_assert_eq!(message, first);
                large_done += 1;
            }

            prop_assert!(preempted);
            // Enough slots must be earned first, and not many more.
            let slot_cost = 5;
            let bound = slot_cost * (small / 2 + 1);
            prop_assert!(selections <= bound + 1, "preempted after {} selections", selections);
        }
    }
}
