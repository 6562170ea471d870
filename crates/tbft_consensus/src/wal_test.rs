use std::fs::OpenOptions;
use std::io::Write;

use assert_matches::assert_matches;
use prost::Message;
use tbft_protobuf::consensus::{WalEntry, WalEntryType};
use tempfile::TempDir;

use crate::wal::{Wal, WalError, WalFrame, LOG_FILE_NAME};

const MAX_ENTRY_SIZE: usize = 1024;

fn open(dir: &TempDir) -> Wal {
    Wal::open(dir.path(), MAX_ENTRY_SIZE, true).unwrap()
}

fn append_raw(dir: &TempDir, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(dir.path().join(LOG_FILE_NAME)).unwrap();
    file.write_all(bytes).unwrap();
}

#[test]
fn new_log_is_empty() {
    let dir = TempDir::new().unwrap();
    let wal = open(&dir);

    assert!(wal.is_empty());
    assert_eq!(wal.last_index(), 0);
    assert_eq!(wal.first_index(), 1);
}

#[test]
fn entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let mut wal = open(&dir);
        assert_eq!(wal.write(b"first".to_vec()).unwrap(), 1);
        assert_eq!(wal.write(b"second".to_vec()).unwrap(), 2);
        assert_eq!(wal.read(1).unwrap(), b"first");
        // Reads do not disturb appends.
        assert_eq!(wal.write(b"third".to_vec()).unwrap(), 3);
    }

    let mut wal = open(&dir);
    assert_eq!((wal.first_index(), wal.last_index()), (1, 3));
    assert_eq!(wal.read(2).unwrap(), b"second");
    assert_eq!(wal.read(3).unwrap(), b"third");
    assert_matches!(wal.read(4), Err(WalError::NotFound(4)));
    assert_matches!(wal.read(0), Err(WalError::NotFound(0)));
}

#[test]
fn typed_entries() {
    let dir = TempDir::new().unwrap();
    let mut wal = open(&dir);
    let entry = WalEntry {
        height: 7,
        height_first_index: 1,
        entry_type: WalEntryType::Timeout,
        data: vec![1, 2, 3],
    };

    let index = wal.write_entry(entry.clone()).unwrap();

    assert_eq!(wal.read_entry(index).unwrap(), entry);
}

#[test]
fn torn_tail_is_dropped_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let mut wal = open(&dir);
        wal.write(b"complete".to_vec()).unwrap();
    }
    let frame = WalFrame { index: 2, data: b"never finished".to_vec() }.encode_length_delimited_to_vec();
    append_raw(&dir, &frame[..frame.len() / 2]);

    let mut wal = open(&dir);
    assert_eq!(wal.last_index(), 1);
    assert_eq!(wal.write(b"after crash".to_vec()).unwrap(), 2);
    drop(wal);

    let mut wal = open(&dir);
    assert_eq!(wal.read(1).unwrap(), b"complete");
    assert_eq!(wal.read(2).unwrap(), b"after crash");
}

#[test]
fn gap_in_indices_is_an_error() {
    let dir = TempDir::new().unwrap();
    {
        let mut wal = open(&dir);
        wal.write(b"one".to_vec()).unwrap();
    }
    append_raw(&dir, &WalFrame { index: 3, data: vec![] }.encode_length_delimited_to_vec());

    assert_matches!(
        Wal::open(dir.path(), MAX_ENTRY_SIZE, true),
        Err(WalError::OutOfOrder { expected: 2, found: 3 })
    );
}

#[test]
fn oversized_entry_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut wal = open(&dir);

    assert_matches!(
        wal.write(vec![0; MAX_ENTRY_SIZE + 1]),
        Err(WalError::EntryTooLarge { max: MAX_ENTRY_SIZE, .. })
    );
    assert!(wal.is_empty());
}

#[test]
fn truncate_front_keeps_later_entries() {
    let dir = TempDir::new().unwrap();
    let mut wal = open(&dir);
    for i in 1..=5u8 {
        wal.write(vec![i]).unwrap();
    }

    wal.truncate_front(4).unwrap();

    assert_eq!((wal.first_index(), wal.last_index()), (4, 5));
    assert_matches!(wal.read(3), Err(WalError::NotFound(3)));
    assert_eq!(wal.read(4).unwrap(), vec![4]);
    assert_eq!(wal.write(vec![6]).unwrap(), 6);
    drop(wal);

    let mut wal = open(&dir);
    assert_eq!((wal.first_index(), wal.last_index()), (4, 6));
    assert_eq!(wal.read(6).unwrap(), vec![6]);
}

#[test]
fn truncate_front_never_drops_the_newest_entry() {
    let dir = TempDir::new().unwrap();
    let mut wal = open(&dir);
    wal.write(vec![1]).unwrap();
    wal.write(vec![2]).unwrap();

    wal.truncate_front(100).unwrap();

    assert_eq!((wal.first_index(), wal.last_index()), (2, 2));
    // Truncating below the first index is a no-op.
    wal.truncate_front(1).unwrap();
    assert_eq!(wal.read(2).unwrap(), vec![2]);
}

#[test]
fn second_writer_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let _wal = open(&dir);

    assert_matches!(Wal::open(dir.path(), MAX_ENTRY_SIZE, true), Err(WalError::Locked(_)));
}
