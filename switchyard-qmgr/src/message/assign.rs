//! Routing freshly read recipients and bundling them into entries.

use std::cmp::Ordering;

use switchyard_common::{Dsn, address, delivery};
use switchyard_spool::EnvelopeReader;

use crate::{
    QmgrError, QueueManager,
    arena::{Arena, DestinationId, JobId, MessageId, PeerId, TransportId},
    destination::Destination,
    recipient::Recipient,
    transport::Transport,
};

/// Where one recipient goes before transport and destination lookup.
#[derive(Debug)]
struct Route {
    transport: String,
    nexthop: String,
    /// The resolver's rewritten address
    address: Option<String>,
    local: bool,
}

impl Route {
    fn to(transport: &str, nexthop: &str) -> Self {
        Self {
            transport: transport.to_string(),
            nexthop: nexthop.to_string(),
            address: None,
            local: false,
        }
    }
}

fn fold_cmp(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Resolved before unresolved, then by transport and destination, then by
/// domain, then by address. Keeps recipients for one entry adjacent.
fn recipient_order(
    transports: &Arena<TransportId, Transport>,
    destinations: &Arena<DestinationId, Destination>,
    a: &Recipient,
    b: &Recipient,
) -> Ordering {
    let routed = match (a.destination, b.destination) {
        (Some(x), Some(y)) => {
            let (x, y) = (&destinations[x], &destinations[y]);
            transports[x.transport]
                .name
                .cmp(&transports[y.transport].name)
                .then_with(|| x.name.cmp(&y.name))
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };

    routed
        .then_with(|| {
            match (a.address.rfind('@'), b.address.rfind('@')) {
                (Some(x), Some(y)) => fold_cmp(&a.address[x..], &b.address[y..]),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
        .then_with(|| fold_cmp(&a.address, &b.address))
}

impl QueueManager {
    pub(super) fn message_sort(&mut self, id: MessageId) {
        let (transports, destinations) = (&self.transports, &self.destinations);
        self.messages[id]
            .rcpt_list
            .as_mut_vec()
            .sort_by(|a, b| recipient_order(transports, destinations, a, b));
    }

    fn resolve_one(&self, sender: &str, recipient: &str) -> Route {
        if recipient.is_empty() {
            return Route::to("error", "5.1.3 null recipient address");
        }
        // Would look like an option to a delivery agent command line.
        if recipient.starts_with('-') {
            return Route::to("error", "5.1.3 bad address syntax");
        }

        let reply = self.resolver.resolve(sender, recipient);
        if reply.flags.fail {
            return Route::to("retry", "4.3.0 address resolver failure");
        }
        if reply.flags.error {
            return Route::to("error", "5.1.3 bad address syntax");
        }

        Route {
            transport: reply.transport,
            nexthop: reply.nexthop,
            address: Some(reply.recipient),
            local: reply.flags.local,
        }
    }

    fn filter_route(&self, filter: &str, recipient: &str) -> Option<Route> {
        let (transport, nexthop) = filter.split_once(':').unwrap_or((filter, ""));
        if transport.is_empty() {
            return None;
        }

        let nexthop = if !nexthop.is_empty() {
            nexthop.to_string()
        } else if let Some(domain) = address::domain(recipient).filter(|d| !d.is_empty()) {
            domain.to_string()
        } else {
            self.resolver.myhostname().to_string()
        };
        Some(Route {
            transport: transport.to_string(),
            nexthop,
            address: None,
            local: false,
        })
    }

    /// The error or retry transport, unless it is itself throttled.
    pub(crate) fn error_transport(&mut self, service: &str) -> Option<TransportId> {
        let id = self.transport_obtain(service);
        (!self.transports[id].is_dead()).then_some(id)
    }

    /// A destination on the error or retry transport whose nexthop carries
    /// `dsn`, unless it is throttled.
    pub(crate) fn error_destination(&mut self, service: &str, dsn: &Dsn) -> Option<DestinationId> {
        let transport = self.error_transport(service)?;
        let name = dsn.to_string();
        let id = self.destination_obtain(transport, &name, &name);
        (!self.destinations[id].is_throttled()).then_some(id)
    }

    /// Give every recipient read in the last pass a destination, or dispose
    /// of it right away.
    pub(super) fn message_resolve(&mut self, id: MessageId, reader: &EnvelopeReader) -> Result<(), QmgrError> {
        let message = &mut self.messages[id];
        let queue_id = message.queue_id;
        let flags = message.flags;
        let sender = message.sender().to_string();
        let filter = message.filter.clone();
        let redirect = message.redirect.clone();
        let mut recipients = message.rcpt_list.take();

        // A redirected message goes to one place, once.
        if redirect.is_some() {
            recipients.truncate(1);
            message.rcpt_offset = 0;
            message.rcpt_unread = 0;
        }

        let mut kept = Vec::with_capacity(recipients.len());
        for mut recipient in recipients {
            let mut route = if let Some(redirect) = &redirect {
                recipient.address.clone_from(redirect);
                self.resolve_one(&sender, redirect)
            } else if let Some(route) = filter
                .as_deref()
                .and_then(|filter| self.filter_route(filter, &recipient.address))
            {
                route
            } else {
                self.resolve_one(&sender, &recipient.address)
            };

            if let Some(rewritten) = route.address.take() {
                recipient.address = rewritten;
            }

            if flags.force_expire {
                route = Route::to("retry", "4.7.0 message is administratively expired");
            }

            if route.local && address::local_part_is(&recipient.address, &self.config.double_bounce_sender) {
                delivery!(
                    level = INFO,
                    %queue_id,
                    to = %recipient.address,
                    status = "sent",
                    "undeliverable postmaster notification discarded"
                );
                reader
                    .mark_done(recipient.offset)
                    .map_err(QmgrError::storage("mark done", queue_id))?;
                continue;
            }

            if !flags.flush_dfxp && self.config.defers_transport(&route.transport) {
                route = Route::to("retry", "4.3.2 deferred transport");
            }

            let mut transport = self.transport_obtain(&route.transport);
            if flags.flush_each && self.transports[transport].is_dead() {
                self.transport_unthrottle(transport);
            }
            if let Some(dsn) = self.transports[transport].dead.clone() {
                let Some(retry) = self.error_transport("retry") else {
                    self.defer_recipient(id, &recipient, &dsn);
                    continue;
                };
                transport = retry;
                route.transport = String::from("retry");
                route.nexthop = dsn.to_string();
            }

            let settings = &self.transports[transport].settings;
            let per_recipient = settings.destination_recipient_limit == 1
                && route.transport != "error"
                && route.transport != "retry";
            let name = if per_recipient {
                format!("{}@{}", address::local_part(&recipient.address), route.nexthop)
            } else {
                route.nexthop.clone()
            };
            let name = name.to_lowercase();

            let mut destination = self.destination_obtain(transport, &name, &route.nexthop);
            if flags.flush_each && self.destinations[destination].is_throttled() {
                self.destination_unthrottle(destination);
            }
            if let Some(dsn) = self.destinations[destination].dsn.clone() {
                let Some(retry) = self.error_destination("retry", &dsn) else {
                    self.defer_recipient(id, &recipient, &dsn);
                    continue;
                };
                destination = retry;
            }

            recipient.destination = Some(destination);
            kept.push(recipient);
        }

        *self.messages[id].rcpt_list.as_mut_vec() = kept;
        Ok(())
    }

    /// Move resolved recipients into entries, one job per transport and one
    /// peer per destination.
    pub(super) fn message_assign(&mut self, id: MessageId) {
        let single = self.messages[id].single_rcpt;
        let recipients = self.messages[id].rcpt_list.take();

        let mut job: Option<(TransportId, JobId)> = None;
        let mut peer: Option<(DestinationId, PeerId)> = None;

        for recipient in recipients {
            let Some(destination) = recipient.destination else {
                continue;
            };
            let transport = self.destinations[destination].transport;

            let job_id = match job {
                Some((cached, job_id)) if cached == transport => job_id,
                _ => {
                    let job_id = self.job_obtain(id, transport);
                    job = Some((transport, job_id));
                    peer = None;
                    job_id
                }
            };
            let peer_id = match peer {
                Some((cached, peer_id)) if cached == destination => peer_id,
                _ => {
                    let peer_id = self.peer_obtain(job_id, destination);
                    peer = Some((destination, peer_id));
                    peer_id
                }
            };

            let limit = self.transports[transport].settings.destination_recipient_limit as usize;
            let entry = match self.peers[peer_id].entries.tail() {
                Some(entry)
                    if !single && (limit == 0 || self.entries[entry].recipients.len() < limit) =>
                {
                    entry
                }
                _ => self.entry_create(peer_id, id),
            };

            self.entries[entry].recipients.push(recipient);
            self.jobs[job_id].rcpt_count += 1;
            self.messages[id].rcpt_count += 1;
            self.recipient_count += 1;
        }

        for job in self.messages[id].jobs.ids(&self.jobs) {
            if self.jobs[job].has_entries() && !self.job_is_blocker(job) {
                let transport = self.jobs[job].transport;
                self.transports[transport].reset_candidate_cache();
            }
        }
    }
}
