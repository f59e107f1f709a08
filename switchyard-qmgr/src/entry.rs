//! Delivery entries: recipient batches on their way to a delivery agent.
//!
//! An entry sits on its destination's todo list until it is selected, then on
//! the busy list until the delivery agent reports back. Completing an entry
//! ripples outwards: it can release its peer, its destination, and finally
//! its message, which may start the message's finalization.

use switchyard_common::delivery;

use crate::{
    QmgrError, QueueManager,
    arena::{DestinationId, EntryId, Link, MessageId, PeerId, SessionId, define_linkage},
    recipient::RecipientBatch,
};

define_linkage!(
    /// A peer's entries that are not yet selected
    PeerEntries: EntryId, Entry => peer_link
);

define_linkage!(
    /// A destination's todo or busy list
    DestinationEntries: EntryId, Entry => queue_link
);

/// Which destination list an entry is leaving from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Todo,
    Busy,
}

#[derive(Debug)]
pub struct Entry {
    pub(crate) message: MessageId,
    pub(crate) peer: PeerId,
    pub(crate) destination: DestinationId,
    pub(crate) recipients: RecipientBatch,
    /// The delivery session carrying this entry, while busy
    pub(crate) session: Option<SessionId>,
    peer_link: Link<EntryId>,
    queue_link: Link<EntryId>,
}

impl Entry {
    #[must_use]
    pub const fn recipients(&self) -> &RecipientBatch {
        &self.recipients
    }
}

impl QueueManager {
    /// Queue a new, empty entry for `peer`.
    ///
    /// # Panics
    ///
    /// If the peer's destination is throttled.
    pub(crate) fn entry_create(&mut self, peer: PeerId, message: MessageId) -> EntryId {
        let (job, destination) = {
            let peer = &self.peers[peer];
            (peer.job, peer.destination)
        };
        assert!(
            !self.destinations[destination].is_throttled(),
            "entry created for throttled destination {}",
            self.destinations[destination].name
        );

        let id = self.entries.insert_with(|_| Entry {
            message,
            peer,
            destination,
            recipients: RecipientBatch::default(),
            session: None,
            peer_link: Link::default(),
            queue_link: Link::default(),
        });

        self.messages[message].refcount += 1;
        let owner = &mut self.peers[peer];
        owner.entries.append(&mut self.entries, id);
        owner.refcount += 1;
        self.destinations[destination]
            .todo
            .append(&mut self.entries, id);
        self.jobs[job].read_entries += 1;

        self.warn_if_clogged(destination);
        id
    }

    /// Complain when one destination holds a large share of the active
    /// queue, at most once per `clog_warn_time`.
    fn warn_if_clogged(&mut self, id: DestinationId) {
        let spacing = self.config.clog_warn_time.as_secs();
        if spacing == 0 {
            return;
        }

        let now = self.now();
        let in_core = self.messages.len() as i64;
        let threshold = (self.config.active_limit / 5) as i64;
        let destination = &self.destinations[id];
        let length = destination.todo_count() + destination.busy_count();
        if length <= threshold || now < destination.clog_time_to_warn {
            return;
        }

        let transport = &self.transports[destination.transport];
        delivery!(
            level = WARN,
            destination = %destination.nexthop,
            entries = length,
            messages = in_core,
            "destination is using up a large share of the active queue"
        );
        let limit = i64::from(transport.settings.destination_concurrency_limit);
        if limit > 0 && limit <= destination.busy_count() + 1 {
            delivery!(
                level = WARN,
                transport = %transport.name,
                limit,
                "to reduce congestion raise destination_concurrency_limit for this transport"
            );
        }
        self.destinations[id].clog_time_to_warn = now + spacing;
    }

    /// Take the next unselected entry of `peer` and mark it busy.
    pub(crate) fn entry_take(&mut self, peer: PeerId) -> Option<EntryId> {
        let owner = &self.peers[peer];
        let id = owner.entries.head()?;
        let (job, destination) = (owner.job, owner.destination);

        let queue = &mut self.destinations[destination];
        queue.todo.unlink(&mut self.entries, id);
        queue.busy.append(&mut self.entries, id);
        self.peers[peer].entries.unlink(&mut self.entries, id);
        self.jobs[job].selected_entries += 1;
        Some(id)
    }

    /// Put a busy entry back at the front of its peer, as if never selected.
    pub(crate) fn entry_unselect(&mut self, id: EntryId) {
        let entry = &self.entries[id];
        let (peer, destination) = (entry.peer, entry.destination);
        let job = self.peers[peer].job;

        let queue = &mut self.destinations[destination];
        queue.busy.unlink(&mut self.entries, id);
        queue.todo.append(&mut self.entries, id);
        self.peers[peer].entries.prepend(&mut self.entries, id);
        self.jobs[job].selected_entries -= 1;
    }

    /// Move the recipients of a todo entry to another destination, possibly
    /// of another transport.
    pub(crate) fn entry_move_todo(&mut self, target: DestinationId, id: EntryId) -> Result<(), QmgrError> {
        let (message, source_peer, source_destination) = {
            let entry = &self.entries[id];
            assert!(entry.session.is_none(), "moving an entry that is being delivered");
            (entry.message, entry.peer, entry.destination)
        };
        assert_ne!(source_destination, target, "moving an entry onto its own destination");

        let source_job = self.peers[source_peer].job;
        let target_transport = self.destinations[target].transport;
        let target_job = self.job_obtain(message, target_transport);
        let target_peer = self.peer_obtain(target_job, target);

        let moved = self.entry_create(target_peer, message);
        let recipients = std::mem::take(&mut self.entries[id].recipients);
        let count = recipients.len() as i64;
        self.entries[moved].recipients = recipients;
        self.jobs[target_job].rcpt_count += count;
        self.jobs[source_job].rcpt_count -= count;

        self.entry_done(id, EntryState::Todo)
    }

    /// Retire an entry whose recipients have all been dealt with.
    ///
    /// This is where most of the scheduler's bookkeeping converges, and it can
    /// free the entry's peer, its destination, and its message.
    ///
    /// # Errors
    ///
    /// When finalizing the message hits a queue file operation that must not
    /// fail.
    pub(crate) fn entry_done(&mut self, id: EntryId, state: EntryState) -> Result<(), QmgrError> {
        let (peer, destination, message) = {
            let entry = &self.entries[id];
            assert!(entry.session.is_none(), "completing an entry still bound to a session");
            (entry.peer, entry.destination, entry.message)
        };
        let job = self.peers[peer].job;
        let transport = self.jobs[job].transport;

        let queue = &mut self.destinations[destination];
        match state {
            EntryState::Busy => queue.busy.unlink(&mut self.entries, id),
            EntryState::Todo => {
                queue.todo.unlink(&mut self.entries, id);
                self.peers[peer].entries.unlink(&mut self.entries, id);
                self.jobs[job].selected_entries += 1;
            }
        }
        let Some(entry) = self.entries.remove(id) else {
            panic!("completing unknown entry {id}");
        };

        let count = entry.recipients.len() as i64;
        self.jobs[job].rcpt_count -= count;
        self.messages[message].rcpt_count -= count;
        self.recipient_count -= count;

        // Hand spare recipient slots back, first from jobs that donated to
        // this message, then from this job once the message is fully read.
        let fully_read = self.messages[message].rcpt_offset == 0;
        for sponsor in self.messages[message].jobs.ids(&self.jobs) {
            let candidate = &self.jobs[sponsor];
            if sponsor == job || candidate.rcpt_count >= candidate.rcpt_limit {
                continue;
            }
            if candidate.stack_level < 0 || fully_read {
                self.job_move_limits(sponsor);
            }
        }
        if fully_read {
            self.job_move_limits(job);
        }

        // A destination that was blocking the job list may have room now.
        let owner = &mut self.transports[transport];
        let queue = &mut self.destinations[destination];
        if queue.blocker_tag == owner.blocker_tag {
            if queue.window > queue.busy_count() && !queue.todo.is_empty() {
                owner.blocker_tag += 2;
                owner.job_current = owner.jobs.head();
                owner.reset_candidate_cache();
            }
            if queue.window > queue.busy_count() || queue.is_throttled() {
                queue.blocker_tag = 0;
            }
        }

        let owner = &mut self.peers[peer];
        owner.refcount -= 1;
        if owner.refcount == 0 {
            self.peer_free(peer);
        }

        if state == EntryState::Busy {
            self.destinations[destination].last_done = self.now();
        }

        if self.destinations[destination].is_empty() {
            if self.destinations[destination].is_throttled()
                && self.destinations.len() as i64 > 2 * self.config.recipient_limit
            {
                self.destination_unthrottle(destination);
            }
            if self.destinations[destination].is_ready() {
                self.destination_done(destination);
            }
        }

        let owner = &mut self.messages[message];
        owner.refcount -= 1;
        if owner.refcount == 0 {
            self.active_done(message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_unselected_entry_goes_back_to_the_front() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, destination) = harness.queue_entries(smtp, "example.com", 2);
        let qmgr = &mut harness.qmgr;

        let job = qmgr.messages[message].jobs.ids(&qmgr.jobs)[0];
        let peer = qmgr.peer_find(job, destination).unwrap();
        let first = qmgr.peers[peer].entries.head().unwrap();

        assert_eq!(qmgr.entry_take(peer), Some(first));
        assert_eq!(qmgr.jobs[job].selected_entries, 1);
        assert_eq!(
            (qmgr.destinations[destination].todo_count(), qmgr.destinations[destination].busy_count()),
            (1, 1)
        );

        qmgr.entry_unselect(first);
        assert_eq!(qmgr.jobs[job].selected_entries, 0);
        assert_eq!(qmgr.peers[peer].entries.head(), Some(first));
        assert_eq!(
            (qmgr.destinations[destination].todo_count(), qmgr.destinations[destination].busy_count()),
            (2, 0)
        );
        harness.assert_invariants();
    }

    #[test]
    fn test_moved_entry_changes_transport() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, source) = harness.queue_entries(smtp, "example.com", 1);
        let qmgr = &mut harness.qmgr;

        let source_job = qmgr.messages[message].jobs.ids(&qmgr.jobs)[0];
        let peer = qmgr.peer_find(source_job, source).unwrap();
        let entry = qmgr.peers[peer].entries.head().unwrap();

        let relay = qmgr.transport_obtain("relay");
        let target = qmgr.destination_create(relay, "[192.0.2.1]", "[192.0.2.1]");
        qmgr.entry_move_todo(target, entry).unwrap();

        // The emptied source destination and its peer are gone.
        assert_eq!(qmgr.destination_find(smtp, "example.com"), None);
        assert!(!qmgr.peers.contains(peer));
        assert_eq!(qmgr.jobs[source_job].rcpt_count, 0);

        let relay_job = qmgr.transports[relay].job_by_message[&message];
        assert_eq!(qmgr.jobs[relay_job].rcpt_count, 1);
        assert_eq!(qmgr.destinations[target].todo_count(), 1);
        assert_eq!(qmgr.messages[message].refcount, 1);
        harness.assert_invariants();
    }

    #[test]
    fn test_delivered_entries_release_the_message() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, _) = harness.queue_entries(smtp, "example.com", 2);

        assert_eq!(harness.deliver_next(smtp), Some(message));
        assert!(harness.qmgr.messages.contains(message));
        assert_eq!(harness.qmgr.recipient_count, 1);

        assert_eq!(harness.deliver_next(smtp), Some(message));
        assert!(!harness.qmgr.messages.contains(message));
        assert_eq!(harness.qmgr.recipient_count, 0);
        assert_eq!(harness.qmgr.destination_find(smtp, "example.com"), None);
    }
}
