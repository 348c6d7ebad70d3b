//! Wire protocol for the Ensemble Dispatcher, grounded on
//! `mpi_ensemble_pull.py`'s `Tags` class. A tagged-union message type
//! replaces the original's ad hoc string-mixed-with-tag protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Exit = 0,
    New = 1,
    Kill = 2,
    Continue = 3,
    Ask = 4,
    Done = 5,
    Error = 6,
}

impl Tag {
    pub fn from_raw(raw: i32) -> Option<Tag> {
        match raw {
            0 => Some(Tag::Exit),
            1 => Some(Tag::New),
            2 => Some(Tag::Kill),
            3 => Some(Tag::Continue),
            4 => Some(Tag::Ask),
            5 => Some(Tag::Done),
            6 => Some(Tag::Error),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NewJobPayload {
    pub workdir: String,
    pub name: String,
    pub cuteid: String,
    pub cmd: String,
    pub envs: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DonePayload {
    pub elapsed_seconds: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorPayload {
    pub retcode: i32,
    pub tail: String,
}

/// A manifest line: `<uuid> <absolute_workdir> <serial_node_packing_count> <command>`.
#[derive(Clone, Debug)]
pub struct ManifestEntry {
    pub task_id: uuid::Uuid,
    pub workdir: String,
    pub packing_count: u32,
    pub command: String,
}

/// Parses the manifest file, skipping malformed lines with a warning.
pub fn parse_manifest(content: &str) -> Vec<ManifestEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, ' ');
            let id_str = parts.next()?;
            let workdir = parts.next()?;
            let packing_str = parts.next()?;
            let command = parts.next()?;
            let task_id = match uuid::Uuid::parse_str(id_str) {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(line, "skipping malformed manifest line");
                    return None;
                }
            };
            let packing_count: u32 = match packing_str.parse() {
                Ok(n) if n > 0 => n,
                _ => {
                    tracing::warn!(line, "skipping manifest line with invalid packing count");
                    return None;
                }
            };
            Some(ManifestEntry { task_id, workdir: workdir.to_string(), packing_count, command: command.to_string() })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_skips_malformed_lines() {
        let content = format!("{} /tmp/a 2 echo hi\nnot-a-uuid garbage\n", uuid::Uuid::nil());
        let entries = parse_manifest(&content);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].workdir, "/tmp/a");
        assert_eq!(entries[0].packing_count, 2);
        assert_eq!(entries[0].command, "echo hi");
    }

    #[test]
    fn manifest_skips_invalid_packing_count() {
        let content = format!("{} /tmp/a 0 echo hi\n", uuid::Uuid::nil());
        assert!(parse_manifest(&content).is_empty());
    }
}
