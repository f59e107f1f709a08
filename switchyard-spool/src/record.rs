//! Envelope records.
//!
//! Every record is one tag byte, a payload without newlines, and `\n`. The
//! content record is the exception: its payload is the content length and it
//! is followed by that many raw bytes. A queue file looks like:
//!
//! ```text
//! C<size record>          fixed width, always first
//! T<secs> <micros>        arrival time
//! c<secs>                 creation time
//! S<sender>
//! A<name>=<value>         any number of attributes
//! W<secs>                 delay warning time, fixed width
//! O<address>              original recipient of the next R record
//! R<address>              recipient (D once delivered)
//! M<length>               content follows
//! <content bytes>
//! X                       extracted segment
//! R<address>              more recipients
//! E                       end of file
//! ```

use std::fmt::Write as _;

use crate::{Result, SpoolError};

pub const TAG_SIZE: u8 = b'C';
pub const TAG_ARRIVAL: u8 = b'T';
pub const TAG_CREATED: u8 = b'c';
pub const TAG_SENDER: u8 = b'S';
pub const TAG_ATTRIBUTE: u8 = b'A';
pub const TAG_WARN: u8 = b'W';
pub const TAG_VERP: u8 = b'V';
pub const TAG_FILTER: u8 = b'L';
pub const TAG_REDIRECT: u8 = b'>';
pub const TAG_ORIGINAL: u8 = b'O';
pub const TAG_RECIPIENT: u8 = b'R';
pub const TAG_DONE: u8 = b'D';
pub const TAG_CONTENT: u8 = b'M';
pub const TAG_EXTRACTED: u8 = b'X';
pub const TAG_END: u8 = b'E';

/// Width of each number in the size record, so it can be patched in place.
const SIZE_FIELD_WIDTH: usize = 15;
/// Width of the warn time, so it can be rewritten in place.
const WARN_FIELD_WIDTH: usize = 15;

/// First record of every file: where the content is and how many recipients
/// the file started with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeRecord {
    /// Bytes from the content record to the extracted segment marker
    pub data_size: u64,
    /// Offset of the content record
    pub data_offset: u64,
    /// Recipient records (done or not) in the file
    pub rcpt_count: u64,
    /// Recipient records are interleaved with other records before the content
    pub mixed: bool,
}

impl SizeRecord {
    fn encode(&self, out: &mut String) {
        let _ = write!(
            out,
            "{:>w$} {:>w$} {:>w$} {}",
            self.data_size,
            self.data_offset,
            self.rcpt_count,
            u8::from(self.mixed),
            w = SIZE_FIELD_WIDTH
        );
    }

    fn decode(payload: &str) -> Option<Self> {
        let mut fields = payload.split_whitespace();
        let data_size = fields.next()?.parse().ok()?;
        let data_offset = fields.next()?.parse().ok()?;
        let rcpt_count = fields.next()?.parse().ok()?;
        let mixed = match fields.next() {
            None | Some("0") => false,
            Some("1") => true,
            Some(_) => return None,
        };

        Some(Self {
            data_size,
            data_offset,
            rcpt_count,
            mixed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Size(SizeRecord),
    Arrival { secs: u64, micros: u32 },
    Created(u64),
    Sender(String),
    Attribute { name: String, value: String },
    /// Unix time at which to send a delay warning; zero once sent
    Warn(u64),
    Verp(String),
    ContentFilter(String),
    Redirect(String),
    OriginalRecipient(String),
    Recipient(String),
    Done(String),
    Content { length: u64 },
    Extracted,
    End,
}

impl Record {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Size(_) => TAG_SIZE,
            Self::Arrival { .. } => TAG_ARRIVAL,
            Self::Created(_) => TAG_CREATED,
            Self::Sender(_) => TAG_SENDER,
            Self::Attribute { .. } => TAG_ATTRIBUTE,
            Self::Warn(_) => TAG_WARN,
            Self::Verp(_) => TAG_VERP,
            Self::ContentFilter(_) => TAG_FILTER,
            Self::Redirect(_) => TAG_REDIRECT,
            Self::OriginalRecipient(_) => TAG_ORIGINAL,
            Self::Recipient(_) => TAG_RECIPIENT,
            Self::Done(_) => TAG_DONE,
            Self::Content { .. } => TAG_CONTENT,
            Self::Extracted => TAG_EXTRACTED,
            Self::End => TAG_END,
        }
    }

    #[must_use]
    pub const fn is_recipient(&self) -> bool {
        matches!(
            self,
            Self::Recipient(_) | Self::Done(_) | Self::OriginalRecipient(_)
        )
    }

    /// Serialise including the trailing newline.
    ///
    /// # Errors
    ///
    /// When a text payload contains a newline.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = String::new();
        match self {
            Self::Size(size) => size.encode(&mut payload),
            Self::Arrival { secs, micros } => {
                let _ = write!(payload, "{secs} {micros}");
            }
            Self::Created(secs) => {
                let _ = write!(payload, "{secs}");
            }
            Self::Warn(secs) => {
                let _ = write!(payload, "{secs:>WARN_FIELD_WIDTH$}");
            }
            Self::Content { length } => {
                let _ = write!(payload, "{length}");
            }
            Self::Attribute { name, value } => {
                if name.is_empty() || name.contains('=') {
                    return Err(SpoolError::Record {
                        offset: 0,
                        detail: format!("bad attribute name {name:?}"),
                    });
                }
                let _ = write!(payload, "{name}={value}");
            }
            Self::Sender(text)
            | Self::Verp(text)
            | Self::ContentFilter(text)
            | Self::Redirect(text)
            | Self::OriginalRecipient(text)
            | Self::Recipient(text)
            | Self::Done(text) => payload.push_str(text),
            Self::Extracted | Self::End => {}
        }

        if payload.contains('\n') {
            return Err(SpoolError::Record {
                offset: 0,
                detail: format!("newline in {} record", char::from(self.tag())),
            });
        }

        let mut line = Vec::with_capacity(payload.len() + 2);
        line.push(self.tag());
        line.extend_from_slice(payload.as_bytes());
        line.push(b'\n');
        Ok(line)
    }

    /// Parse one line (without its newline) that started at `offset`.
    ///
    /// # Errors
    ///
    /// When the tag is unknown, the payload is not UTF-8, or a numeric
    /// payload does not parse.
    pub fn decode(line: &[u8], offset: u64) -> Result<Self> {
        let bad = |detail: String| SpoolError::Record { offset, detail };

        let (&tag, payload) = line
            .split_first()
            .ok_or_else(|| bad(String::from("empty record")))?;
        let payload = std::str::from_utf8(payload)
            .map_err(|_| bad(format!("non UTF-8 {} record", char::from(tag))))?;
        let number = |what: &str| {
            payload
                .trim()
                .parse::<u64>()
                .map_err(|_| bad(format!("bad {what} {payload:?}")))
        };

        Ok(match tag {
            TAG_SIZE => Self::Size(
                SizeRecord::decode(payload).ok_or_else(|| bad(format!("bad size record {payload:?}")))?,
            ),
            TAG_ARRIVAL => {
                let mut parts = payload.split_whitespace();
                let secs = parts.next().and_then(|s| s.parse().ok());
                let micros = parts.next().map_or(Some(0), |s| s.parse().ok());
                match (secs, micros) {
                    (Some(secs), Some(micros)) => Self::Arrival { secs, micros },
                    _ => return Err(bad(format!("bad arrival time {payload:?}"))),
                }
            }
            TAG_CREATED => Self::Created(number("creation time")?),
            TAG_WARN => Self::Warn(number("warning time")?),
            TAG_CONTENT => Self::Content {
                length: number("content length")?,
            },
            TAG_SENDER => Self::Sender(payload.to_string()),
            TAG_ATTRIBUTE => {
                let (name, value) = payload
                    .split_once('=')
                    .filter(|(name, _)| !name.is_empty())
                    .ok_or_else(|| bad(format!("bad attribute {payload:?}")))?;
                Self::Attribute {
                    name: name.to_string(),
                    value: value.to_string(),
                }
            }
            TAG_VERP => Self::Verp(payload.to_string()),
            TAG_FILTER => Self::ContentFilter(payload.to_string()),
            TAG_REDIRECT => Self::Redirect(payload.to_string()),
            TAG_ORIGINAL => Self::OriginalRecipient(payload.to_string()),
            TAG_RECIPIENT => Self::Recipient(payload.to_string()),
            TAG_DONE => Self::Done(payload.to_string()),
            TAG_EXTRACTED => Self::Extracted,
            TAG_END => Self::End,
            other => return Err(bad(format!("unknown record type {:?}", char::from(other)))),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip(record: &Record) -> Record {
        let line = record.encode().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        Record::decode(&line[..line.len() - 1], 0).unwrap()
    }

    #[test]
    fn test_size_record_is_fixed_width() {
        let small = Record::Size(SizeRecord::default()).encode().unwrap();
        let large = Record::Size(SizeRecord {
            data_size: 123_456_789,
            data_offset: 987_654,
            rcpt_count: 10_000,
            mixed: true,
        })
        .encode()
        .unwrap();
        assert_eq!(small.len(), large.len());
    }

    #[test]
    fn test_warn_record_is_fixed_width() {
        let sent = Record::Warn(0).encode().unwrap();
        let pending = Record::Warn(1_700_000_000).encode().unwrap();
        assert_eq!(sent.len(), pending.len());
        assert_eq!(round_trip(&Record::Warn(1_700_000_000)), Record::Warn(1_700_000_000));
    }

    #[test]
    fn test_attribute_records() {
        let record = Record::Attribute {
            name: String::from("encoding"),
            value: String::from("8bit=yes"),
        };
        assert_eq!(round_trip(&record), record);

        assert!(Record::decode(b"A=value", 12).is_err());
        assert!(Record::decode(b"Anovalue", 12).is_err());
    }

    #[test]
    fn test_newlines_are_refused() {
        assert!(Record::Recipient(String::from("a\nb@example.com")).encode().is_err());
    }

    #[test]
    fn test_decode_errors_carry_offset() {
        let Err(SpoolError::Record { offset, .. }) = Record::decode(b"?junk", 42) else {
            panic!("expected a record error");
        };
        assert_eq!(offset, 42);

        assert!(Record::decode(b"Tsoon", 0).is_err());
        assert!(Record::decode(b"C1 2", 0).is_err());
        assert!(Record::decode(b"", 0).is_err());
    }

    #[test]
    fn test_arrival_without_micros() {
        assert_eq!(
            Record::decode(b"T1700000000", 0).unwrap(),
            Record::Arrival {
                secs: 1_700_000_000,
                micros: 0
            }
        );
    }
}
