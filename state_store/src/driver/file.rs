use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{info, warn};

use super::{encode_frame, scan_frames, JournalEntry, JournalMedium};
use crate::JournalError;

pub const JOURNAL_FILE_NAME: &str = "containers.journal";

struct FileState {
    file: File,
    /// Length the file is cut back to before appending, dropping an
    /// interrupted final write.
    valid_len: u64,
}

/// Append-only journal file.
pub struct FileJournal {
    path: PathBuf,
    sync_on_append: bool,
    state: Mutex<FileState>,
}

impl FileJournal {
    /// Opens (or creates) `<dir>/containers.journal`.
    pub fn open(dir: &Path, sync_on_append: bool) -> Result<Self, JournalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let scan = scan_frames(&contents);
        if scan.valid_len < contents.len() {
            warn!(
                path = %path.display(),
                torn_bytes = contents.len() - scan.valid_len,
                "journal ends with an incomplete record"
            );
        }
        info!(
            path = %path.display(),
            entries = scan.entries.len(),
            "opened container journal file"
        );

        Ok(Self {
            path,
            sync_on_append,
            state: Mutex::new(FileState {
                file,
                valid_len: scan.valid_len as u64,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FileState>, JournalError> {
        self.state.lock().map_err(|_| JournalError::Poisoned)
    }
}

impl JournalMedium for FileJournal {
    fn name(&self) -> &'static str {
        "file"
    }

    fn append(&self, body: &[u8]) -> Result<(), JournalError> {
        let frame = encode_frame(body);
        let mut state = self.lock()?;
        let len = state.file.metadata()?.len();
        if len > state.valid_len {
            warn!(
                path = %self.path.display(),
                torn_bytes = len - state.valid_len,
                "discarding incomplete trailing record before append"
            );
            state.file.set_len(state.valid_len)?;
        }
        state.file.write_all(&frame)?;
        if self.sync_on_append {
            state.file.sync_data()?;
        }
        state.valid_len += frame.len() as u64;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        // Hold the lock so a concurrent append is never observed half written.
        let _state = self.lock()?;
        let contents = fs::read(&self.path)?;
        Ok(scan_frames(&contents).entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies(entries: &[JournalEntry]) -> Vec<Vec<u8>> {
        entries
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Record { body, .. } => Some(body.to_vec()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), true).unwrap();
            journal.append(b"first").unwrap();
            journal.append(b"second").unwrap();
        }
        let journal = FileJournal::open(dir.path(), true).unwrap();
        journal.append(b"third").unwrap();
        let entries = journal.entries().unwrap();
        assert_eq!(
            bodies(&entries),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn test_torn_tail_reported_then_discarded_on_append() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), false).unwrap();
            journal.append(b"first").unwrap();
        }
        // Simulate a crash in the middle of writing the second record.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(JOURNAL_FILE_NAME))
                .unwrap();
            file.write_all(&encode_frame(b"second")[..9]).unwrap();
        }

        let journal = FileJournal::open(dir.path(), false).unwrap();
        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1], JournalEntry::TornTail { len: 9, .. }));

        journal.append(b"third").unwrap();
        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(bodies(&entries), vec![b"first".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn test_damaged_length_keeps_later_records_across_append() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), false).unwrap();
            journal.append(b"first").unwrap();
            journal.append(b"second").unwrap();
            journal.append(b"third").unwrap();
        }
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let mut bytes = fs::read(&path).unwrap();
        let original_len = bytes.len() as u64;
        bytes[4] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        let journal = FileJournal::open(dir.path(), false).unwrap();
        journal.append(b"fourth").unwrap();
        assert!(fs::metadata(&path).unwrap().len() > original_len);

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 4);
        assert!(matches!(entries[0], JournalEntry::Corrupt { position: 0, .. }));
        assert_eq!(
            bodies(&entries),
            vec![b"second".to_vec(), b"third".to_vec(), b"fourth".to_vec()]
        );
    }
}
