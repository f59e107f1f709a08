use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Seek, SeekFrom},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use crate::{
    Result, SpoolError, lock,
    record::{self, Record},
};

/// Sequential record reader over an open queue file.
///
/// The reader tracks the byte offset of every record so callers can remember
/// where to resume and where each recipient lives. In-place updates (marking
/// a recipient done, clearing the warn time) go through positioned writes and
/// leave the read position alone.
#[derive(Debug)]
pub struct EnvelopeReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    line: Vec<u8>,
}

impl EnvelopeReader {
    /// Open for reading and in-place updates.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset: 0,
            line: Vec::with_capacity(256),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the next record to be read.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.offset = self.reader.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Skip `length` bytes forward from the current position.
    pub fn skip(&mut self, length: u64) -> Result<()> {
        let delta = i64::try_from(length).map_err(|_| SpoolError::Record {
            offset: self.offset,
            detail: format!("skip of {length} bytes is out of range"),
        })?;
        self.reader.seek_relative(delta)?;
        self.offset += length;
        Ok(())
    }

    /// Try to take the exclusive advisory lock without waiting.
    ///
    /// Returns `false` when another process holds it.
    pub fn try_lock(&self) -> Result<bool> {
        Ok(lock::try_lock_exclusive(self.reader.get_ref())?)
    }

    /// Read the next record and the offset it started at.
    ///
    /// Content records are returned as-is; the caller decides whether to skip
    /// the content that follows. Returns `None` at end of file, including a
    /// truncated final line.
    pub fn next_record(&mut self) -> Result<Option<(u64, Record)>> {
        let start = self.offset;
        self.line.clear();

        let read = self.reader.read_until(b'\n', &mut self.line)?;
        if read == 0 || self.line.last() != Some(&b'\n') {
            self.offset += read as u64;
            return Ok(None);
        }

        self.offset += read as u64;
        let record = Record::decode(&self.line[..read - 1], start)?;
        Ok(Some((start, record)))
    }

    /// Flip the recipient record at `offset` to done.
    pub fn mark_done(&self, offset: u64) -> Result<()> {
        rewrite_tag(self.reader.get_ref(), offset, record::TAG_RECIPIENT, record::TAG_DONE)
    }

    /// Overwrite the warn record at `offset` with a new time.
    pub fn rewrite_warn(&self, offset: u64, secs: u64) -> Result<()> {
        let file = self.reader.get_ref();
        expect_tag(file, offset, record::TAG_WARN)?;
        file.write_all_at(&Record::Warn(secs).encode()?, offset)?;
        Ok(())
    }
}

/// Mark one recipient done without holding a reader open.
///
/// This is what delivery agents do after they finish with a recipient. A
/// record that is already done is left alone.
pub fn mark_done(path: impl AsRef<Path>, offset: u64) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    match rewrite_tag(&file, offset, record::TAG_RECIPIENT, record::TAG_DONE) {
        Err(SpoolError::Record { .. }) if expect_tag(&file, offset, record::TAG_DONE).is_ok() => {
            Ok(())
        }
        other => other,
    }
}

fn expect_tag(file: &File, offset: u64, tag: u8) -> Result<()> {
    let mut found = [0_u8; 1];
    file.read_exact_at(&mut found, offset)?;
    if found[0] == tag {
        Ok(())
    } else {
        Err(SpoolError::Record {
            offset,
            detail: format!(
                "expected {} record, found {:?}",
                char::from(tag),
                char::from(found[0])
            ),
        })
    }
}

fn rewrite_tag(file: &File, offset: u64, from: u8, to: u8) -> Result<()> {
    expect_tag(file, offset, from)?;
    file.write_all_at(&[to], offset)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{QueueArea, QueueStore, writer::EnvelopeWriter};

    #[test]
    fn test_reads_records_with_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.init().unwrap();

        let id = EnvelopeWriter::new()
            .arrival(1_700_000_000, 5)
            .sender("sender@example.com")
            .recipient("one@example.com")
            .content(b"Subject: hi\r\n\r\nbody\r\n")
            .commit(&store, QueueArea::Incoming)
            .unwrap();

        let mut reader = EnvelopeReader::open(store.path(QueueArea::Incoming, &id)).unwrap();
        let mut tags = Vec::new();
        let mut recipient_offset = None;
        while let Some((offset, record)) = reader.next_record().unwrap() {
            if let Record::Content { length } = record {
                reader.skip(length).unwrap();
            }
            if matches!(record, Record::Recipient(_)) {
                recipient_offset = Some(offset);
            }
            tags.push(char::from(record.tag()));
        }

        assert_eq!(tags, vec!['C', 'T', 'S', 'R', 'M', 'X', 'E']);

        let offset = recipient_offset.unwrap();
        reader.mark_done(offset).unwrap();
        reader.seek(offset).unwrap();
        assert_eq!(
            reader.next_record().unwrap(),
            Some((offset, Record::Done(String::from("one@example.com"))))
        );

        // Already done: not an error for the standalone helper
        mark_done(reader.path(), offset).unwrap();
        assert!(reader.mark_done(offset).is_err());
    }
}
