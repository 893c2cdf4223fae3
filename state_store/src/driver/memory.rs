use std::sync::Mutex;

use super::{encode_frame, scan_frames, JournalEntry, JournalMedium};
use crate::JournalError;

/// In-process journal with the same framing as the file journal.
#[derive(Default)]
pub struct MemoryJournal {
    buf: Mutex<Vec<u8>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from previously captured journal bytes, e.g. a crashed log.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buf: Mutex::new(bytes),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, JournalError> {
        Ok(self.buf.lock().map_err(|_| JournalError::Poisoned)?.clone())
    }
}

impl JournalMedium for MemoryJournal {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn append(&self, body: &[u8]) -> Result<(), JournalError> {
        let mut buf = self.buf.lock().map_err(|_| JournalError::Poisoned)?;
        let valid_len = scan_frames(&buf).valid_len;
        buf.truncate(valid_len);
        buf.extend_from_slice(&encode_frame(body));
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let buf = self.buf.lock().map_err(|_| JournalError::Poisoned)?;
        Ok(scan_frames(&buf).entries)
    }
}
