//! Turning queued work into deferrals.
//!
//! When a destination or a whole transport goes bad, entries that are still
//! waiting to be selected are handed to the retry transport, or, if that is
//! unavailable too, logged as deferred on the spot. Entries already out for
//! delivery are left alone; their replies arrive as usual.

use switchyard_common::{Dsn, delivery};
use switchyard_spool::LogEntry;

use crate::{
    QmgrError, QueueManager,
    arena::{DestinationId, EntryId, List, MessageId, TransportId},
    entry::{DestinationEntries, EntryState},
    recipient::Recipient,
};

impl QueueManager {
    /// Log one recipient as deferred and mark its message for a retry.
    pub(crate) fn defer_recipient(&mut self, message: MessageId, recipient: &Recipient, dsn: &Dsn) {
        let owner = &mut self.messages[message];
        owner.problem = true;
        let queue_id = owner.queue_id;

        let entry = LogEntry {
            offset: recipient.offset,
            original: recipient.original.clone(),
            recipient: recipient.address.clone(),
            dsn: dsn.clone(),
        };
        if let Err(err) = self.bounce.defer_append(&queue_id, &entry) {
            delivery!(
                level = WARN,
                %queue_id,
                to = %recipient.address,
                error = %err,
                "unable to log deferred recipient"
            );
        }

        delivery!(
            level = INFO,
            %queue_id,
            to = %recipient.address,
            status = "deferred",
            reason = %dsn,
            "recipient deferred"
        );
    }

    /// Defer every entry of `destination` that is not out for delivery.
    ///
    /// Completing an entry can release its message, its peer and the
    /// destination itself; the caller must not assume `destination` survives.
    pub(crate) fn defer_todo(&mut self, destination: DestinationId, dsn: &Dsn) -> Result<(), QmgrError> {
        // Looked up on the first entry only, so that an empty sweep leaves no
        // retry destination behind.
        let mut retry = None;

        let mut cursor = self.destinations[destination].todo.head();
        while let Some(entry) = cursor {
            cursor = List::<EntryId, DestinationEntries>::next(&self.entries, entry);

            let target = *retry.get_or_insert_with(|| {
                self.error_destination("retry", dsn)
                    .filter(|&retry| retry != destination)
            });
            match target {
                Some(retry) => self.entry_move_todo(retry, entry)?,
                None => {
                    let message = self.entries[entry].message;
                    let recipients = self.entries[entry].recipients.clone();
                    for recipient in &recipients {
                        self.defer_recipient(message, recipient, dsn);
                    }
                    self.entry_done(entry, EntryState::Todo)?;
                }
            }

            if !self.destinations.contains(destination) {
                break;
            }
        }
        Ok(())
    }

    /// Defer every entry of every destination of `transport` that is not out
    /// for delivery.
    pub(crate) fn defer_transport(&mut self, transport: TransportId, dsn: &Dsn) -> Result<(), QmgrError> {
        delivery!(
            level = DEBUG,
            transport = %self.transports[transport].name,
            reason = %dsn,
            "deferring queued entries of transport"
        );

        for destination in self.transports[transport]
            .destinations
            .ids(&self.destinations)
        {
            if self.destinations.contains(destination) {
                self.defer_todo(destination, dsn)?;
            }
        }
        Ok(())
    }
}
