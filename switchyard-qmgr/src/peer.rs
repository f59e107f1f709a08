//! Peers: the share of one job that is bound for one destination.

use crate::{
    QueueManager,
    arena::{DestinationId, EntryId, JobId, Link, List, PeerId, define_linkage},
    entry::PeerEntries,
};

define_linkage!(
    /// A job's round-robin order of peers
    JobPeers: PeerId, Peer => link
);

/// The entries of one job bound for one destination.
#[derive(Debug)]
pub struct Peer {
    pub(crate) job: JobId,
    pub(crate) destination: DestinationId,
    /// Entries not yet selected for delivery
    pub(crate) entries: List<EntryId, PeerEntries>,
    /// Live entries, selected or not
    pub(crate) refcount: i64,
    link: Link<PeerId>,
}

impl QueueManager {
    pub(crate) fn peer_find(&self, job: JobId, destination: DestinationId) -> Option<PeerId> {
        self.jobs[job].peer_by_destination.get(&destination).copied()
    }

    pub(crate) fn peer_obtain(&mut self, job: JobId, destination: DestinationId) -> PeerId {
        if let Some(id) = self.peer_find(job, destination) {
            return id;
        }

        let id = self.peers.insert_with(|_| Peer {
            job,
            destination,
            entries: List::default(),
            refcount: 0,
            link: Link::default(),
        });
        let owner = &mut self.jobs[job];
        owner.peers.append(&mut self.peers, id);
        owner.peer_by_destination.insert(destination, id);
        id
    }

    pub(crate) fn peer_free(&mut self, id: PeerId) {
        let peer = &self.peers[id];
        assert_eq!(peer.refcount, 0, "peer freed with live entries");
        assert!(peer.entries.is_empty(), "peer freed with queued entries");

        let (job, destination) = (peer.job, peer.destination);
        let owner = &mut self.jobs[job];
        owner.peers.unlink(&mut self.peers, id);
        owner.peer_by_destination.remove(&destination);
        self.peers.remove(id);
    }

    /// The next peer of `job` whose destination has room, rotating it to the
    /// back of the job's peer order.
    pub(crate) fn peer_select(&mut self, job: JobId) -> Option<PeerId> {
        let mut cursor = self.jobs[job].peers.head();
        while let Some(id) = cursor {
            let peer = &self.peers[id];
            cursor = List::<_, JobPeers>::next(&self.peers, id);

            let destination = &self.destinations[peer.destination];
            if destination.window > destination.busy_count() && !peer.entries.is_empty() {
                self.jobs[job].peers.rotate(&mut self.peers, id);
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use switchyard_spool::EnvelopeWriter;

    use super::*;
    use crate::{MessageId, clock::Clock, testing::Harness};

    fn two_destination_message(harness: &mut Harness) -> (MessageId, JobId) {
        let writer = EnvelopeWriter::new()
            .arrival(harness.clock.now(), 0)
            .sender("sender@example.net")
            .verp("+=")
            .recipient("a1@a.example")
            .recipient("a2@a.example")
            .recipient("b1@b.example");
        let message = harness.queue_message(writer);

        let qmgr = &harness.qmgr;
        let jobs = qmgr.messages[message].jobs.ids(&qmgr.jobs);
        let [job] = jobs[..] else {
            panic!("expected a single job, got {jobs:?}");
        };
        (message, job)
    }

    fn selected_name(qmgr: &QueueManager, peer: PeerId) -> String {
        qmgr.destinations[qmgr.peers[peer].destination].name().to_string()
    }

    #[test]
    fn test_peers_take_turns() {
        let mut harness = Harness::new();
        let (_, job) = two_destination_message(&mut harness);
        let qmgr = &mut harness.qmgr;

        let mut order = Vec::new();
        while let Some(peer) = qmgr.peer_select(job) {
            order.push(selected_name(qmgr, peer));
            assert!(qmgr.entry_take(peer).is_some());
        }

        assert_eq!(order, ["a.example", "b.example", "a.example"]);
        assert_eq!(qmgr.jobs[job].selected_entries, 3);
    }

    #[test]
    fn test_full_destination_is_passed_over() {
        let mut harness = Harness::new();
        let (_, job) = two_destination_message(&mut harness);
        let qmgr = &mut harness.qmgr;

        let first = qmgr.peer_select(job).unwrap();
        assert_eq!(selected_name(qmgr, first), "a.example");
        qmgr.entry_take(first).unwrap();
        qmgr.destinations[qmgr.peers[first].destination].window = 1;

        let second = qmgr.peer_select(job).unwrap();
        assert_eq!(selected_name(qmgr, second), "b.example");
        qmgr.entry_take(second).unwrap();

        // a.example still has an entry but no room for it
        assert_eq!(qmgr.peer_select(job), None);
        assert!(!qmgr.peers[first].entries.is_empty());
    }

    #[test]
    fn test_peer_is_found_by_destination() {
        let mut harness = Harness::new();
        let (_, job) = two_destination_message(&mut harness);
        let qmgr = &mut harness.qmgr;

        let smtp = qmgr.transport_find("smtp").unwrap();
        let destination = qmgr.destination_find(smtp, "b.example").unwrap();
        let peer = qmgr.peer_find(job, destination).unwrap();
        assert_eq!(qmgr.peer_obtain(job, destination), peer);
        assert_eq!(qmgr.peers[peer].refcount, 1);
    }
}
