//! One pass over a queue file.

use switchyard_common::{address, admission};
use switchyard_spool::{EnvelopeReader, Record, SpoolError};

use super::Message;
use crate::{QueueManager, arena::MessageId, recipient::Recipient};

/// Attributes describing the submitting client, passed through to delivery
/// agents untouched.
const CLIENT_ATTRIBUTES: &[&str] = &[
    "client_name",
    "client_address",
    "client_port",
    "client_protocol",
    "helo_name",
    "sasl_method",
    "sasl_username",
    "sasl_sender",
    "log_client_name",
    "log_client_address",
    "log_protocol",
    "rewrite_context",
    "envelope_id",
    "dsn_notify",
];

impl QueueManager {
    /// Read the envelope, or the next batch of recipients, into core.
    ///
    /// On failure the message is left as it was before the pass.
    pub(super) fn message_read(
        &mut self,
        id: MessageId,
        reader: &mut EnvelopeReader,
    ) -> switchyard_spool::Result<()> {
        let config = &self.config;
        let global = self.recipient_count;
        let cap = config.recipient_limit;
        let message = &mut self.messages[id];

        // A fresh message may claim its share of whatever is still free.
        if message.data_offset == 0 {
            message.rcpt_limit = (cap * config.fudge_factor / 100 - global)
                .max(config.message_recipient_minimum);
        }

        let mut limit = (message.rcpt_limit - message.rcpt_count)
            .min(cap - global)
            .min(config.message_recipient_ceiling);
        if message.rcpt_count == 0 {
            limit = limit.max(1);
        }

        let saved = (message.rcpt_offset, message.rcpt_unread);
        let outcome = (|| {
            if message.rcpt_offset != 0 {
                reader.seek(message.rcpt_offset)?;
                message.rcpt_offset = 0;
            }
            message.read(reader, limit.max(0) as usize)
        })();

        if outcome.is_err() {
            (message.rcpt_offset, message.rcpt_unread) = saved;
            message.rcpt_list.clear();
        }
        outcome
    }
}

impl Message {
    fn read(&mut self, reader: &mut EnvelopeReader, limit: usize) -> switchyard_spool::Result<()> {
        let queue_id = self.queue_id;
        let corrupt = |detail: &str| SpoolError::Corrupt {
            queue_id,
            detail: detail.to_string(),
        };

        let mut original: Option<String> = None;

        while let Some((offset, record)) = reader.next_record()? {
            match record {
                Record::Content { length } => {
                    reader.skip(length)?;
                    continue;
                }
                Record::Recipient(recipient) => {
                    let original = original.take();
                    if self.rcpt_offset != 0 {
                        continue;
                    }
                    if self.rcpt_list.len() >= limit {
                        self.rcpt_offset = offset;
                        if self.seen_all {
                            break;
                        }
                        if self.mixed {
                            continue;
                        }
                        // Recipients after the content: the rest of the
                        // envelope is already known.
                        if offset > self.data_offset {
                            self.seen_all = true;
                            break;
                        }
                        reader.seek(self.data_offset + self.data_size)?;
                        continue;
                    }

                    self.rcpt_unread -= 1;
                    let original = original.unwrap_or_else(|| recipient.clone());
                    self.rcpt_list
                        .push(Recipient::new(offset, original, recipient));
                    continue;
                }
                Record::Done(_) => {
                    original = None;
                    if self.rcpt_offset == 0 {
                        self.rcpt_unread -= 1;
                    }
                    continue;
                }
                Record::OriginalRecipient(address) => {
                    if let Some(stale) = original.replace(address) {
                        admission!(
                            level = WARN,
                            %queue_id,
                            original = %stale,
                            "out-of-order original recipient record"
                        );
                    }
                    continue;
                }
                _ => {}
            }

            if self.seen_all {
                continue;
            }

            match record {
                Record::Size(size) => {
                    if self.data_offset != 0 {
                        continue;
                    }
                    if size.data_offset == 0 || size.data_size == 0 {
                        return Err(corrupt("invalid size record"));
                    }
                    self.data_offset = size.data_offset;
                    self.data_size = size.data_size;
                    self.rcpt_unread = size.rcpt_count as i64;
                    self.mixed = size.mixed;
                }
                Record::Arrival { secs, micros } => {
                    if self.arrival_secs == 0 {
                        self.arrival_secs = secs;
                        self.arrival_micros = micros;
                    }
                }
                Record::Created(secs) => {
                    if self.create_time == 0 {
                        self.create_time = secs;
                    }
                }
                Record::Sender(sender) => {
                    if self.sender.is_none() {
                        self.sender = Some(sender);
                    }
                }
                Record::ContentFilter(filter) => self.filter = Some(filter),
                Record::Redirect(redirect) => self.redirect = Some(redirect),
                Record::Attribute { name, value } => self.attribute(name, value),
                Record::Warn(secs) => {
                    if self.warn_offset == 0 {
                        self.warn_offset = offset;
                        self.warn_time = secs;
                    }
                }
                Record::Verp(delims) => self.verp(delims),
                Record::End => {
                    self.seen_all = true;
                    break;
                }
                _ => {}
            }
        }

        if let Some(original) = original {
            admission!(
                level = WARN,
                %queue_id,
                %original,
                "original recipient record without recipient"
            );
        }

        if self.rcpt_unread < 0 || (self.rcpt_offset == 0 && self.rcpt_unread > 0) {
            admission!(
                level = WARN,
                %queue_id,
                unread = self.rcpt_unread,
                "recipient count mismatch"
            );
            self.rcpt_unread = 0;
        }

        if !self.seen_all {
            return Err(corrupt("missing end of message record"));
        }
        if self.arrival_secs == 0 {
            return Err(corrupt("missing arrival time record"));
        }
        if self.sender.is_none() {
            return Err(corrupt("missing sender record"));
        }
        if self.data_offset == 0 {
            return Err(corrupt("missing size record"));
        }

        if self.create_time == 0 {
            self.create_time = self.arrival_secs;
        }
        Ok(())
    }

    fn attribute(&mut self, name: String, value: String) {
        let slot = match name.as_str() {
            "encoding" => &mut self.encoding,
            "errors_to" => &mut self.errors_to,
            "return_receipt" => &mut self.return_receipt,
            _ => {
                self.passthrough_attribute(name, value);
                return;
            }
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    fn passthrough_attribute(&mut self, name: String, value: String) {
        if !CLIENT_ATTRIBUTES.contains(&name.as_str()) {
            admission!(
                level = DEBUG,
                queue_id = %self.queue_id,
                attribute = %name,
                "ignored attribute"
            );
        } else if !self.client.iter().any(|(known, _)| known == &name) {
            self.client.push((name, value));
        }
    }

    fn verp(&mut self, delims: String) {
        if self.verp_delims.is_some() {
            return;
        }

        let queue_id = self.queue_id;
        if self.sender().is_empty() {
            admission!(level = WARN, %queue_id, "ignoring VERP request for null sender");
        } else if !address::verp_delims_valid(&delims) {
            admission!(level = WARN, %queue_id, %delims, "ignoring bad VERP request");
        } else {
            self.single_rcpt = true;
            self.verp_delims = Some(delims);
        }
    }
}
