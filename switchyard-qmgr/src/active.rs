//! The active queue: admitting files and finishing messages.
//!
//! A message leaves the active area in one of four ways: removed after every
//! recipient was dealt with, moved to the deferred area with a backoff
//! timestamp, returned to its sender as expired, or quarantined in the
//! corrupt area. Sending a bounce, expiry or delay notice is asynchronous; the
//! message waits in core until [`QueueManager::notice_done`] reports back.

use std::io;

use switchyard_common::admission;
use switchyard_spool::{EnvelopeReader, QueueArea, QueueId, store::MODE_UNTHROTTLE};
use switchyard_tracing::traced;

use crate::{
    QmgrError, QueueManager,
    arena::MessageId,
    bounce::{FlushStatus, NoticeKind, NoticeRequest},
    clock::{epoch_secs, system_time},
    manager::Action,
    message::LoadOutcome,
    scan::ScanFlags,
};

impl QueueManager {
    /// Move a file from `area` into the active area and load it. Returns
    /// whether the file was admitted.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "us"))]
    pub(crate) fn active_feed(
        &mut self,
        area: QueueArea,
        queue_id: QueueId,
        scan: ScanFlags,
    ) -> Result<bool, QmgrError> {
        assert_ne!(area, QueueArea::Active, "feeding from the active queue");

        let Some(check) = self
            .store
            .open_ok(area, &queue_id)
            .map_err(QmgrError::storage("check", queue_id))?
        else {
            return Ok(false);
        };

        let now = self.now();
        if !scan.scan_all
            && epoch_secs(check.modified) > now + self.config.future_tolerance.as_secs()
        {
            admission!(level = DEBUG, %queue_id, %area, "skipped, not yet due");
            return Ok(false);
        }

        if let Err(err) = self.store.rename(&queue_id, area, QueueArea::Active) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(QmgrError::storage("move to active", queue_id)(err));
            }
            admission!(level = WARN, %queue_id, %area, "skipped, file disappeared");
            return Ok(false);
        }

        let mut flags = scan.load_flags();
        let mut mode = None;
        if check.unthrottle {
            flags.flush_dfxp = true;
            flags.flush_each = true;
            mode = Some(check.mode & !MODE_UNTHROTTLE);
        }
        if check.expire {
            flags.force_expire = true;
        }

        match self.message_alloc(queue_id, flags, mode)? {
            LoadOutcome::Loaded(message) => {
                if self.messages[message].refcount == 0 {
                    self.active_done(message)?;
                }
                Ok(true)
            }
            LoadOutcome::Corrupt => {
                self.active_corrupt(queue_id)?;
                Ok(false)
            }
            LoadOutcome::Locked => {
                let retry = now + self.config.min_backoff.as_secs();
                self.active_defer(queue_id, QueueArea::Incoming, retry)?;
                Ok(false)
            }
        }
    }

    /// Quarantine a file that cannot be used.
    fn active_corrupt(&self, queue_id: QueueId) -> Result<(), QmgrError> {
        match self.store.rename(&queue_id, QueueArea::Active, QueueArea::Corrupt) {
            Ok(()) => {
                admission!(level = WARN, %queue_id, "saved to corrupt queue");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(QmgrError::storage("move to corrupt", queue_id)(err)),
        }
    }

    /// Move an active file to `to`, not to be picked up before `when`.
    fn active_defer(&self, queue_id: QueueId, to: QueueArea, when: u64) -> Result<(), QmgrError> {
        match self.store.set_times(QueueArea::Active, &queue_id, system_time(when)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(QmgrError::storage("set times", queue_id)(err)),
        }
        self.store
            .rename(&queue_id, QueueArea::Active, to)
            .map_err(QmgrError::storage("defer", queue_id))
    }

    /// Ask for as many agent connections as there is work for.
    #[traced(instrument(level = tracing::Level::TRACE, skip(self)), timing(precision = "us"))]
    pub(crate) fn active_drain(&mut self) {
        while let Some(transport) = self.transport_select() {
            let owner = &mut self.transports[transport];
            owner.pending += 1;
            self.actions.push(Action::Connect {
                transport,
                name: owner.name.clone(),
            });
        }
    }

    fn notice(&mut self, message: MessageId, kind: NoticeKind, verp: bool) {
        let owner = &mut self.messages[message];
        owner.notice = Some(kind);
        let request = NoticeRequest {
            kind,
            queue_id: owner.queue_id,
            sender: owner.sender().to_string(),
            verp_delims: if verp { owner.verp_delims.clone() } else { None },
            arrival: owner.arrival_secs,
        };
        self.actions.push(Action::Notice { message, request });
    }

    /// Finish a message whose loaded recipients have all been attempted.
    ///
    /// The first step flushes recipients that bounced during this run.
    pub(crate) fn active_done(&mut self, message: MessageId) -> Result<(), QmgrError> {
        let owner = &self.messages[message];
        assert_eq!(owner.refcount, 0, "{}: finishing a message with live entries", owner.queue_id);
        let queue_id = owner.queue_id;

        let bounce_log = self
            .logs
            .size(QueueArea::Bounce, &queue_id)
            .map_err(QmgrError::storage("stat bounce log", queue_id))?;
        match bounce_log {
            Some(0) => self
                .logs
                .remove(QueueArea::Bounce, &queue_id)
                .map_err(QmgrError::storage("remove bounce log", queue_id))?,
            Some(_) => {
                let verp = self.config.verp_bounces;
                self.notice(message, NoticeKind::Bounce, verp);
                return Ok(());
            }
            None => {}
        }

        self.active_done_pending(message)
    }

    /// Read more recipients, or decide between expiry and a delay warning.
    fn active_done_pending(&mut self, message: MessageId) -> Result<(), QmgrError> {
        let owner = &self.messages[message];
        let queue_id = owner.queue_id;

        // An agent revokes a file's readiness bits when it finds the file
        // broken; a damaged file cannot be retried either.
        let unusable = owner.damaged
            || (owner.problem
                && self
                    .store
                    .open_ok(QueueArea::Active, &queue_id)
                    .map_err(QmgrError::storage("check", queue_id))?
                    .is_none());
        if unusable {
            self.active_corrupt(queue_id)?;
            self.message_free(message);
            return Ok(());
        }

        if owner.rcpt_offset > 0 {
            if self.message_realloc(message)? {
                if self.messages[message].refcount == 0 {
                    return self.active_done(message);
                }
            } else {
                self.active_corrupt(queue_id)?;
                self.message_free(message);
            }
            return Ok(());
        }

        let owner = &self.messages[message];
        let now = self.now();
        let lifetime = if owner.sender().is_empty() {
            self.config.bounce_queue_lifetime
        } else {
            self.config.max_queue_lifetime
        };
        // Expired from the moment the lifetime is used up, or at once when an
        // operator asked for it.
        let expired = owner.problem
            && (owner.flags.force_expire
                || now >= owner.create_time.saturating_add(lifetime.as_secs()));

        if expired {
            admission!(
                level = INFO,
                %queue_id,
                from = owner.sender(),
                status = "expired",
                "expired, returned to sender"
            );
            self.notice(message, NoticeKind::Expire, true);
            return Ok(());
        }
        if owner.problem && owner.warn_time > 0 && now + 1 >= owner.warn_time {
            self.notice(message, NoticeKind::Warn, false);
            return Ok(());
        }

        self.active_done_final(message)
    }

    /// Defer or remove the file, and release the message.
    fn active_done_final(&mut self, message: MessageId) -> Result<(), QmgrError> {
        let owner = &self.messages[message];
        let queue_id = owner.queue_id;

        if owner.problem {
            let now = self.now();
            let (min, max) = (self.config.min_backoff.as_secs(), self.config.max_backoff.as_secs());
            let delay = if owner.create_time > 0 {
                now.saturating_sub(owner.create_time).clamp(min, max)
            } else {
                min
            };
            self.active_defer(queue_id, QueueArea::Deferred, now + delay)?;
            admission!(level = DEBUG, %queue_id, delay, "deferred");
        } else {
            match self.store.remove(QueueArea::Active, &queue_id) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(QmgrError::storage("remove", queue_id)(err)),
            }
            admission!(level = INFO, %queue_id, "removed");
        }

        self.message_free(message);
        Ok(())
    }

    /// A notification requested by [`Self::active_done`] finished.
    ///
    /// # Panics
    ///
    /// If the message was not waiting for a notification.
    pub fn notice_done(&mut self, message: MessageId, status: FlushStatus) -> Result<(), QmgrError> {
        let owner = &mut self.messages[message];
        let Some(kind) = owner.notice.take() else {
            panic!("{}: notification status for a message that sent none", owner.queue_id);
        };
        let failed = status.is_failed();

        match kind {
            NoticeKind::Bounce => {
                owner.problem |= failed;
                self.active_done_pending(message)
            }
            NoticeKind::Expire => {
                owner.problem = failed;
                self.active_done_final(message)
            }
            NoticeKind::Warn => {
                if !failed {
                    let queue_id = owner.queue_id;
                    let warn_offset = owner.warn_offset;
                    owner.warn_time = 0;
                    let path = self.store.path(QueueArea::Active, &queue_id);
                    if let Err(err) = EnvelopeReader::open(&path)
                        .and_then(|reader| reader.rewrite_warn(warn_offset, 0))
                    {
                        admission!(level = WARN, %queue_id, error = %err, "cannot clear warn time");
                    }
                }
                self.active_done_final(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use switchyard_common::Dsn;
    use switchyard_spool::{EnvelopeWriter, LogEntry, Record};

    use super::*;
    use crate::{bounce::BounceService, clock::Clock, testing::Harness};

    fn notices(harness: &mut Harness) -> Vec<(MessageId, NoticeKind)> {
        harness
            .qmgr
            .take_actions()
            .into_iter()
            .filter_map(|action| match action {
                Action::Notice { message, request } => Some((message, request.kind)),
                Action::Connect { .. } => None,
            })
            .collect()
    }

    /// Queue a single-recipient message built on `writer` and attempt it
    /// without success.
    fn queue_and_defer(harness: &mut Harness, writer: EnvelopeWriter) -> (MessageId, QueueId) {
        let message = harness.queue_message(writer.sender("sender@example.net").recipient("user@example.com"));
        let queue_id = harness.qmgr.messages[message].queue_id;
        let smtp = harness.qmgr.transport_find("smtp").unwrap();
        harness.qmgr.messages[message].problem = true;
        assert_eq!(harness.deliver_next(smtp), Some(message));
        (message, queue_id)
    }

    #[test]
    fn test_bounce_log_is_flushed_before_the_file_is_removed() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, _) = harness.queue_entries(smtp, "example.com", 1);
        let queue_id = harness.qmgr.messages[message].queue_id;

        let bounced = LogEntry {
            offset: 100,
            original: "user0@example.com".to_string(),
            recipient: "user0@example.com".to_string(),
            dsn: Dsn::new("5.1.1", "user unknown"),
        };
        harness.bounce.bounce_append(&queue_id, &bounced).unwrap();

        assert_eq!(harness.deliver_next(smtp), Some(message));
        assert_eq!(notices(&mut harness), vec![(message, NoticeKind::Bounce)]);
        // Held in core until the notice is out.
        assert!(harness.qmgr.messages.contains(message));
        assert!(harness.qmgr.store.exists(QueueArea::Active, &queue_id));

        harness.qmgr.notice_done(message, FlushStatus::Sent).unwrap();
        assert!(!harness.qmgr.messages.contains(message));
        assert!(!harness.qmgr.store.exists(QueueArea::Active, &queue_id));
        assert!(!harness.qmgr.store.exists(QueueArea::Deferred, &queue_id));
    }

    #[test]
    fn test_failed_bounce_notice_defers_the_file() {
        let mut harness = Harness::new();
        let smtp = harness.qmgr.transport_obtain("smtp");
        let (message, _) = harness.queue_entries(smtp, "example.com", 1);
        let queue_id = harness.qmgr.messages[message].queue_id;

        let bounced = LogEntry {
            offset: 100,
            original: "user0@example.com".to_string(),
            recipient: "user0@example.com".to_string(),
            dsn: Dsn::new("5.1.1", "user unknown"),
        };
        harness.bounce.bounce_append(&queue_id, &bounced).unwrap();
        harness.deliver_next(smtp);
        assert_eq!(notices(&mut harness), vec![(message, NoticeKind::Bounce)]);

        harness.qmgr.notice_done(message, FlushStatus::Failed).unwrap();
        assert!(!harness.qmgr.messages.contains(message));
        assert!(harness.qmgr.store.exists(QueueArea::Deferred, &queue_id));
    }

    #[test]
    fn test_delay_warning_clears_warn_time() {
        let mut harness = Harness::new();
        let now = harness.clock.now();
        let writer = EnvelopeWriter::new().arrival(now, 0).warn_time(now);
        let (message, queue_id) = queue_and_defer(&mut harness, writer);

        assert_eq!(notices(&mut harness), vec![(message, NoticeKind::Warn)]);
        harness.qmgr.notice_done(message, FlushStatus::Sent).unwrap();
        assert!(!harness.qmgr.messages.contains(message));

        let path = harness.qmgr.store.path(QueueArea::Deferred, &queue_id);
        let mut reader = EnvelopeReader::open(path).unwrap();
        let mut warn = None;
        while let Some((_, record)) = reader.next_record().unwrap() {
            match record {
                Record::Warn(secs) => warn = Some(secs),
                Record::Content { length } => reader.skip(length).unwrap(),
                _ => {}
            }
        }
        assert_eq!(warn, Some(0));
    }

    #[test]
    fn test_delivered_message_gets_no_delay_warning() {
        let mut harness = Harness::new();
        let now = harness.clock.now();
        let writer = EnvelopeWriter::new()
            .arrival(now, 0)
            .warn_time(now)
            .sender("sender@example.net")
            .recipient("user@example.com");
        let message = harness.queue_message(writer);
        let queue_id = harness.qmgr.messages[message].queue_id;
        let smtp = harness.qmgr.transport_find("smtp").unwrap();

        assert_eq!(harness.deliver_next(smtp), Some(message));
        assert_eq!(notices(&mut harness), vec![]);
        assert!(!harness.qmgr.messages.contains(message));
        assert!(!harness.qmgr.store.exists(QueueArea::Active, &queue_id));
    }

    #[test]
    fn test_message_expires_when_lifetime_is_used_up() {
        let mut harness = Harness::new();
        let now = harness.clock.now();
        let lifetime = harness.qmgr.config.max_queue_lifetime.as_secs();
        let writer = EnvelopeWriter::new().arrival(now, 0).created(now - lifetime);
        let (message, _) = queue_and_defer(&mut harness, writer);

        assert_eq!(notices(&mut harness), vec![(message, NoticeKind::Expire)]);
    }

    #[test]
    fn test_message_within_lifetime_is_deferred() {
        let mut harness = Harness::new();
        let now = harness.clock.now();
        let lifetime = harness.qmgr.config.max_queue_lifetime.as_secs();
        let writer = EnvelopeWriter::new().arrival(now, 0).created(now - lifetime + 1);
        let (message, queue_id) = queue_and_defer(&mut harness, writer);

        assert_eq!(notices(&mut harness), vec![]);
        assert!(!harness.qmgr.messages.contains(message));
        assert!(harness.qmgr.store.exists(QueueArea::Deferred, &queue_id));
    }

    #[test]
    fn test_forced_expiry_ignores_lifetime() {
        let mut harness = Harness::new();
        let now = harness.clock.now();
        let writer = EnvelopeWriter::new().arrival(now, 0);
        let message = harness.queue_message(writer.sender("sender@example.net").recipient("user@example.com"));
        harness.qmgr.messages[message].flags.force_expire = true;
        harness.qmgr.messages[message].problem = true;
        let smtp = harness.qmgr.transport_find("smtp").unwrap();
        harness.deliver_next(smtp);

        assert_eq!(notices(&mut harness), vec![(message, NoticeKind::Expire)]);
        let queue_id = harness.qmgr.messages[message].queue_id;
        harness.qmgr.notice_done(message, FlushStatus::Sent).unwrap();
        assert!(!harness.qmgr.store.exists(QueueArea::Active, &queue_id));
        assert!(!harness.qmgr.store.exists(QueueArea::Deferred, &queue_id));
    }

    #[test]
    fn test_locked_file_goes_back_to_incoming() {
        let mut harness = Harness::new();
        let now = harness.clock.now();
        let queue_id = EnvelopeWriter::new()
            .arrival(now, 0)
            .sender("sender@example.net")
            .recipient("user@example.com")
            .content(b"body\r\n")
            .commit(&harness.qmgr.store, QueueArea::Incoming)
            .unwrap();

        // Another process is still working on the file.
        let holder = EnvelopeReader::open(harness.qmgr.store.path(QueueArea::Incoming, &queue_id)).unwrap();
        assert!(holder.try_lock().unwrap());

        let admitted = harness
            .qmgr
            .active_feed(QueueArea::Incoming, queue_id, ScanFlags::NONE)
            .unwrap();
        assert!(!admitted);
        assert_eq!(harness.qmgr.stats().messages, 0);
        assert!(!harness.qmgr.store.exists(QueueArea::Active, &queue_id));

        let check = harness
            .qmgr
            .store
            .open_ok(QueueArea::Incoming, &queue_id)
            .unwrap()
            .unwrap();
        let backoff = harness.qmgr.config.min_backoff.as_secs();
        assert_eq!(epoch_secs(check.modified), now + backoff);
    }

    #[test]
    fn test_unreadable_file_is_quarantined() {
        let mut harness = Harness::new();
        let queue_id = EnvelopeWriter::new()
            .arrival(harness.clock.now(), 0)
            .sender("sender@example.net")
            .recipient("user@example.com")
            .content(b"body\r\n")
            .commit(&harness.qmgr.store, QueueArea::Incoming)
            .unwrap();
        let path = harness.qmgr.store.path(QueueArea::Incoming, &queue_id);
        std::fs::write(path, b"this is not an envelope\n").unwrap();

        let admitted = harness
            .qmgr
            .active_feed(QueueArea::Incoming, queue_id, ScanFlags::NONE)
            .unwrap();
        assert!(!admitted);
        assert_eq!(harness.qmgr.stats().messages, 0);
        assert!(harness.qmgr.store.exists(QueueArea::Corrupt, &queue_id));
        assert!(!harness.qmgr.store.exists(QueueArea::Active, &queue_id));
    }
}
