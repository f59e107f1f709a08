//! Delivery sessions and the feedback from their replies.

use switchyard_common::{Dsn, address, delivery};
use switchyard_spool::QueueArea;
use switchyard_tracing::traced;

use crate::{
    QmgrError, QueueManager,
    agent::{AgentReply, DeliveryRequest, DeliveryStatus, RequestRecipient},
    arena::{EntryId, SessionId, TransportId},
    entry::EntryState,
};

/// An entry handed to a delivery agent, awaiting its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub transport: TransportId,
    pub entry: EntryId,
}

const UNAVAILABLE: (&str, &str) = ("4.3.0", "mail transport unavailable");
const CRASHED: (&str, &str) = ("4.3.0", "unknown mail transport error");

impl QueueManager {
    /// A connection requested with [`crate::Action::Connect`] was opened, or
    /// failed to open. On success, picks the entry to deliver and returns the
    /// request to send on it; `None` means there is nothing to do after all
    /// and the connection should be closed.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "us"))]
    pub fn session_opened(
        &mut self,
        transport: TransportId,
        ok: bool,
    ) -> Result<Option<(SessionId, DeliveryRequest)>, QmgrError> {
        let owner = &mut self.transports[transport];
        assert!(owner.pending > 0, "transport {} has no pending connection", owner.name);
        owner.pending -= 1;

        if !ok {
            let dsn = Dsn::new(UNAVAILABLE.0, UNAVAILABLE.1);
            self.transport_throttle(transport, &dsn);
            self.defer_transport(transport, &dsn)?;
            return Ok(None);
        }

        let Some(entry) = self.entry_select(transport)? else {
            return Ok(None);
        };

        let session = self.sessions.insert_with(|_| Session { transport, entry });
        self.entries[entry].session = Some(session);
        Ok(Some((session, self.delivery_request(entry))))
    }

    fn delivery_request(&self, entry: EntryId) -> DeliveryRequest {
        let owner = &self.entries[entry];
        let message = &self.messages[owner.message];
        let destination = &self.destinations[owner.destination];

        let recipients: Vec<RequestRecipient> = owner
            .recipients
            .iter()
            .map(|recipient| RequestRecipient {
                offset: recipient.offset,
                original: recipient.original.clone(),
                address: recipient.address.clone(),
            })
            .collect();

        let sender = match (&message.verp_delims, recipients.as_slice()) {
            (Some(delims), [only]) => address::verp_sender(message.sender(), delims, &only.address),
            _ => message.sender().to_string(),
        };

        DeliveryRequest {
            queue_id: message.queue_id,
            area: QueueArea::Active,
            data_offset: message.data_offset,
            data_size: message.data_size,
            nexthop: destination.nexthop().to_string(),
            encoding: message.encoding.clone(),
            sender,
            errors_to: message.errors_to.clone(),
            return_receipt: message.return_receipt.clone(),
            arrival_secs: message.arrival_secs,
            arrival_micros: message.arrival_micros,
            client: message.client.clone(),
            recipients,
        }
    }

    fn session_close(&mut self, session: SessionId) -> Session {
        let Some(closed) = self.sessions.remove(session) else {
            panic!("unknown delivery session {session}");
        };
        self.entries[closed.entry].session = None;
        closed
    }

    /// The request could not be sent. The entry goes back to the front of its
    /// queue and the transport is suspended.
    pub fn delivery_write_failed(&mut self, session: SessionId) -> Result<(), QmgrError> {
        let Session { transport, entry } = self.session_close(session);
        self.entry_unselect(entry);

        let dsn = Dsn::new(UNAVAILABLE.0, UNAVAILABLE.1);
        self.transport_throttle(transport, &dsn);
        self.defer_transport(transport, &dsn)
    }

    /// Apply an agent's reply: feedback for the transport and destination,
    /// then retire the entry.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "us"))]
    pub fn delivery_reply(&mut self, session: SessionId, reply: AgentReply) -> Result<(), QmgrError> {
        let Session { transport, entry } = self.session_close(session);
        let message = self.entries[entry].message;
        let destination = self.entries[entry].destination;

        match reply.status {
            DeliveryStatus::Crash => {
                self.messages[message].problem = true;
                let dsn = Dsn::new(CRASHED.0, CRASHED.1);
                self.transport_throttle(transport, &dsn);
                self.defer_transport(transport, &dsn)?;
            }
            DeliveryStatus::Defer => self.messages[message].problem = true,
            DeliveryStatus::Done => {}
        }

        // A reason on a deferral blames the site, not single recipients.
        if reply.status == DeliveryStatus::Defer && !reply.dsn.reason.is_empty() {
            let dsn = reply
                .dsn
                .clone()
                .sanitized_temporary()
                .with_prefix("delivery temporarily suspended: ");
            delivery!(
                level = INFO,
                queue_id = %self.messages[message].queue_id,
                destination = %self.destinations[destination].name(),
                reason = %dsn,
                "site failure"
            );
            if self.destinations[destination].is_ready() {
                self.destination_throttle(destination, &dsn);
            }
            if self.destinations[destination].is_throttled() {
                self.defer_todo(destination, &dsn)?;
            }
        }

        if reply.status != DeliveryStatus::Crash {
            self.transport_unthrottle(transport);
            if reply.dsn.reason.is_empty() && self.destinations.contains(destination) {
                self.destination_unthrottle(destination);
            }
        }

        self.entry_done(entry, EntryState::Busy)
    }

    /// An agent did not reply in time.
    ///
    /// # Errors
    ///
    /// [`QmgrError::Watchdog`] when timeouts are configured to be fatal.
    pub fn delivery_timeout(&mut self, session: SessionId) -> Result<(), QmgrError> {
        if self.config.watchdog_fatal {
            let owner = &self.sessions[session];
            return Err(QmgrError::Watchdog {
                transport: self.transports[owner.transport].name.clone(),
                queue_id: self.messages[self.entries[owner.entry].message].queue_id,
            });
        }

        self.delivery_reply(
            session,
            AgentReply {
                status: DeliveryStatus::Crash,
                dsn: Dsn::new("", ""),
            },
        )
    }
}
