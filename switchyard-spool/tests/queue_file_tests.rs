//! A queue file's life across the areas, as the scheduler and agents see it.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::{Duration, UNIX_EPOCH};

use pretty_assertions::assert_eq;
use switchyard_spool::{
    EnvelopeReader, EnvelopeWriter, QueueArea, QueueStore, Record, mark_done,
    store::{MODE_EXPIRE, MODE_READY},
};

fn store() -> (tempfile::TempDir, QueueStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::new(dir.path());
    store.init().unwrap();
    (dir, store)
}

fn recipients(reader: &mut EnvelopeReader) -> Vec<(u64, Record)> {
    let mut found = Vec::new();
    while let Some((offset, record)) = reader.next_record().unwrap() {
        match record {
            Record::Content { length } => reader.skip(length).unwrap(),
            Record::Recipient(_) | Record::Done(_) => found.push((offset, record)),
            _ => {}
        }
    }
    found
}

#[test]
fn test_committed_file_is_ready_and_readable() {
    let (_dir, store) = store();
    let queue_id = EnvelopeWriter::new()
        .arrival(1_700_000_000, 250)
        .sender("sender@example.net")
        .recipient("a@example.com")
        .recipient("b@example.com")
        .content(b"Subject: x\r\n\r\nbody\r\n")
        .commit(&store, QueueArea::Incoming)
        .unwrap();

    let check = store.open_ok(QueueArea::Incoming, &queue_id).unwrap().unwrap();
    assert_eq!(check.mode & 0o700, MODE_READY);
    assert!(!check.expire);
    assert!(!check.unthrottle);

    let mut reader = EnvelopeReader::open(store.path(QueueArea::Incoming, &queue_id)).unwrap();
    let found = recipients(&mut reader);
    assert_eq!(
        found.iter().map(|(_, record)| record.clone()).collect::<Vec<_>>(),
        vec![
            Record::Recipient(String::from("a@example.com")),
            Record::Recipient(String::from("b@example.com")),
        ]
    );
}

#[test]
fn test_done_recipients_stay_done() {
    let (_dir, store) = store();
    let queue_id = EnvelopeWriter::new()
        .arrival(1_700_000_000, 0)
        .sender("")
        .recipient("a@example.com")
        .recipient("b@example.com")
        .content(b"body\r\n")
        .commit(&store, QueueArea::Active)
        .unwrap();
    let path = store.path(QueueArea::Active, &queue_id);

    let first = recipients(&mut EnvelopeReader::open(&path).unwrap())[0].0;
    mark_done(&path, first).unwrap();
    // A second agent finishing the same recipient is harmless.
    mark_done(&path, first).unwrap();

    let found = recipients(&mut EnvelopeReader::open(&path).unwrap());
    assert_eq!(found[0], (first, Record::Done(String::from("a@example.com"))));
    assert_eq!(found[1].1, Record::Recipient(String::from("b@example.com")));
}

#[test]
fn test_expire_request_and_requeue() {
    let (_dir, store) = store();
    let queue_id = EnvelopeWriter::new()
        .arrival(1_700_000_000, 0)
        .sender("sender@example.net")
        .recipient("a@example.com")
        .content(b"body\r\n")
        .commit(&store, QueueArea::Deferred)
        .unwrap();

    store.request_expire(QueueArea::Deferred, &queue_id).unwrap();
    let check = store.open_ok(QueueArea::Deferred, &queue_id).unwrap().unwrap();
    assert!(check.expire);
    assert_eq!(check.mode & MODE_EXPIRE, MODE_EXPIRE);

    let when = UNIX_EPOCH + Duration::from_secs(1_800_000_000);
    assert_eq!(store.move_all(QueueArea::Deferred, QueueArea::Incoming, when).unwrap(), 1);
    assert!(!store.exists(QueueArea::Deferred, &queue_id));

    let check = store.open_ok(QueueArea::Incoming, &queue_id).unwrap().unwrap();
    assert_eq!(check.modified, when);
    assert!(check.expire);
}

#[test]
fn test_unready_file_is_not_offered() {
    let (_dir, store) = store();
    let queue_id = EnvelopeWriter::new()
        .arrival(1_700_000_000, 0)
        .sender("sender@example.net")
        .recipient("a@example.com")
        .content(b"body\r\n")
        .commit(&store, QueueArea::Incoming)
        .unwrap();

    store.set_mode(QueueArea::Incoming, &queue_id, 0o600).unwrap();
    assert_eq!(store.open_ok(QueueArea::Incoming, &queue_id).unwrap(), None);
    assert_eq!(store.list(QueueArea::Incoming).unwrap(), vec![queue_id]);
}
