use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use rocksdb::{ColumnFamily, IteratorMode, Options, WriteOptions, DB};
use tracing::info;

use super::{decode_frame, encode_frame, JournalEntry, JournalMedium};
use crate::JournalError;

pub const JOURNAL_COLUMN_FAMILY: &str = "container_journal";

/// Journal stored in a RocksDB column family.
///
/// Keys are big-endian sequence numbers so iteration order is append order.
/// Values carry the same frame as the file journal so corruption is caught
/// by the checksum.
pub struct RocksDbJournal {
    db: DB,
    next_sequence: AtomicU64,
    sync_on_append: bool,
}

impl RocksDbJournal {
    pub fn open(path: &Path, sync_on_append: bool) -> Result<Self, JournalError> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = DB::open_cf(&db_opts, path, [JOURNAL_COLUMN_FAMILY])?;

        let next_sequence = {
            let cf = column_family(&db)?;
            match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    sequence_from_key(&key).ok_or(JournalError::InvalidKey(key.len()))? + 1
                }
                None => 0,
            }
        };
        info!(
            path = %path.display(),
            next_sequence,
            sync_on_append,
            "opened container journal column family"
        );

        Ok(Self {
            db,
            next_sequence: AtomicU64::new(next_sequence),
            sync_on_append,
        })
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_on_append);
        write_opts
    }
}

fn column_family(db: &DB) -> Result<&ColumnFamily, JournalError> {
    db.cf_handle(JOURNAL_COLUMN_FAMILY)
        .ok_or(JournalError::MissingColumnFamily(JOURNAL_COLUMN_FAMILY))
}

fn sequence_from_key(key: &[u8]) -> Option<u64> {
    let key: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(key))
}

impl JournalMedium for RocksDbJournal {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    fn append(&self, body: &[u8]) -> Result<(), JournalError> {
        let cf = column_family(&self.db)?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.db.put_cf_opt(
            cf,
            sequence.to_be_bytes(),
            encode_frame(body),
            &self.write_options(),
        )?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let cf = column_family(&self.db)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match sequence_from_key(&key) {
                Some(sequence) => entries.push(decode_frame(sequence, &value)),
                None => entries.push(JournalEntry::Corrupt {
                    position: entries.len() as u64,
                    error: JournalError::InvalidKey(key.len()),
                }),
            }
        }
        Ok(entries)
    }
}
