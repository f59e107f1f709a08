use std::io::Write;

use crate::{
    QueueArea, QueueId, QueueStore, Result,
    record::{Record, SizeRecord},
    store::{MODE_READY, MODE_UNTHROTTLE},
};

/// Builds a queue file in the layout described in [`crate::record`].
///
/// Records are written in call order. Recipients added before
/// [`content`](Self::content) land in the envelope segment, later ones in the
/// extracted segment. The size record is computed on encode.
#[derive(Debug, Default)]
pub struct EnvelopeWriter {
    queue_id: Option<QueueId>,
    envelope: Vec<Record>,
    content: Option<Vec<u8>>,
    extracted: Vec<Record>,
    seen_recipient: bool,
    mixed: bool,
    unthrottle: bool,
}

impl EnvelopeWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn queue_id(mut self, queue_id: QueueId) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    /// Append any record. Non-recipient records after a recipient mark the
    /// envelope as mixed.
    #[must_use]
    pub fn record(mut self, record: Record) -> Self {
        if self.content.is_some() {
            self.extracted.push(record);
            return self;
        }

        if record.is_recipient() {
            self.seen_recipient = true;
        } else if self.seen_recipient {
            self.mixed = true;
        }
        self.envelope.push(record);
        self
    }

    #[must_use]
    pub fn arrival(self, secs: u64, micros: u32) -> Self {
        self.record(Record::Arrival { secs, micros })
    }

    #[must_use]
    pub fn created(self, secs: u64) -> Self {
        self.record(Record::Created(secs))
    }

    #[must_use]
    pub fn sender(self, sender: &str) -> Self {
        self.record(Record::Sender(sender.to_string()))
    }

    #[must_use]
    pub fn attribute(self, name: &str, value: &str) -> Self {
        self.record(Record::Attribute {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    #[must_use]
    pub fn warn_time(self, secs: u64) -> Self {
        self.record(Record::Warn(secs))
    }

    #[must_use]
    pub fn verp(self, delims: &str) -> Self {
        self.record(Record::Verp(delims.to_string()))
    }

    #[must_use]
    pub fn content_filter(self, filter: &str) -> Self {
        self.record(Record::ContentFilter(filter.to_string()))
    }

    #[must_use]
    pub fn redirect(self, address: &str) -> Self {
        self.record(Record::Redirect(address.to_string()))
    }

    #[must_use]
    pub fn recipient(self, address: &str) -> Self {
        self.record(Record::Recipient(address.to_string()))
    }

    #[must_use]
    pub fn recipient_with_original(self, original: &str, address: &str) -> Self {
        self.record(Record::OriginalRecipient(original.to_string()))
            .record(Record::Recipient(address.to_string()))
    }

    #[must_use]
    pub fn done_recipient(self, address: &str) -> Self {
        self.record(Record::Done(address.to_string()))
    }

    /// The message itself. Only the first call counts.
    #[must_use]
    pub fn content(mut self, content: &[u8]) -> Self {
        if self.content.is_none() {
            self.content = Some(content.to_vec());
        }
        self
    }

    /// Ask the scheduler to unthrottle whatever this message touches.
    #[must_use]
    pub const fn unthrottle(mut self) -> Self {
        self.unthrottle = true;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let rcpt_count = self
            .envelope
            .iter()
            .chain(&self.extracted)
            .filter(|record| matches!(record, Record::Recipient(_) | Record::Done(_)))
            .count() as u64;

        let mut out = Record::Size(SizeRecord::default()).encode()?;
        let size_len = out.len();
        for record in &self.envelope {
            out.extend(record.encode()?);
        }

        let data_offset = out.len() as u64;
        let content = self.content.as_deref().unwrap_or_default();
        out.extend(
            Record::Content {
                length: content.len() as u64,
            }
            .encode()?,
        );
        out.extend_from_slice(content);
        let data_size = out.len() as u64 - data_offset;

        out.extend(Record::Extracted.encode()?);
        for record in &self.extracted {
            out.extend(record.encode()?);
        }
        out.extend(Record::End.encode()?);

        let size = Record::Size(SizeRecord {
            data_size,
            data_offset,
            rcpt_count,
            mixed: self.mixed,
        })
        .encode()?;
        debug_assert_eq!(size.len(), size_len);
        out[..size_len].copy_from_slice(&size);

        Ok(out)
    }

    /// Write the file into `area` and mark it ready.
    pub fn commit(self, store: &QueueStore, area: QueueArea) -> Result<QueueId> {
        let queue_id = self.queue_id.unwrap_or_else(QueueId::generate);
        let bytes = self.encode()?;

        let mut file = store.create(area, &queue_id)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        let mode = if self.unthrottle {
            MODE_READY | MODE_UNTHROTTLE
        } else {
            MODE_READY
        };
        store.set_mode(area, &queue_id, mode)?;

        Ok(queue_id)
    }
}
