use std::io::Write;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use state_store::{driver::JournalEntry, record::ContainerStateRecord, ContainerJournal};

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct InspectSummary {
    pub records: usize,
    pub corrupt: usize,
    pub torn_tail: usize,
}

/// Writes one JSON line per journal entry followed by a summary line.
pub fn inspect_journal<W: Write>(journal: &ContainerJournal, out: &mut W) -> Result<InspectSummary> {
    let mut summary = InspectSummary::default();
    for entry in journal.entries()? {
        let line = match entry {
            JournalEntry::Record { position, body } => match ContainerStateRecord::decode(&body) {
                Ok(record) => {
                    summary.records += 1;
                    json!({ "position": position, "record": record })
                }
                Err(err) => {
                    summary.corrupt += 1;
                    json!({ "position": position, "defect": "corrupt", "error": err.to_string() })
                }
            },
            JournalEntry::Corrupt { position, error } => {
                summary.corrupt += 1;
                json!({ "position": position, "defect": "corrupt", "error": error.to_string() })
            }
            JournalEntry::TornTail { position, len } => {
                summary.torn_tail += 1;
                json!({ "position": position, "defect": "torn_tail", "bytes": len })
            }
        };
        writeln!(out, "{}", line)?;
    }
    writeln!(
        out,
        "{}",
        json!({ "medium": journal.medium_name(), "summary": &summary })
    )?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_allocated_container, mock_new_container};
    use state_store::{
        driver::{encode_frame, memory::MemoryJournal},
        record::ContainerStateRecord,
    };

    use super::*;

    #[test]
    fn test_inspect_reports_records_and_defects() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_frame(
            &ContainerStateRecord::from(&mock_new_container(1, 7)).encode(),
        ));
        bytes.extend_from_slice(&encode_frame(&[0, 0, 0, 1, 0, 0, 0, 9]));
        let tail = encode_frame(&ContainerStateRecord::from(&mock_allocated_container(1, 7)).encode());
        bytes.extend_from_slice(&tail[..6]);
        let journal = ContainerJournal::new(Box::new(MemoryJournal::from_bytes(bytes)));

        let mut out = Vec::new();
        let summary = inspect_journal(&journal, &mut out).unwrap();
        assert_eq!(
            summary,
            InspectSummary {
                records: 1,
                corrupt: 1,
                torn_tail: 1,
            }
        );

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["record"]["resource_request_priority"], 7);
        assert_eq!(lines[0]["record"]["external_id"], serde_json::Value::Null);
        assert_eq!(lines[1]["defect"], "corrupt");
        assert_eq!(lines[2]["defect"], "torn_tail");
        assert_eq!(lines[3]["summary"]["records"], 1);
        assert_eq!(lines[3]["medium"], "memory");
    }
}
