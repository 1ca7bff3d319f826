//! Partition side-index
//!
//! Each partition keeps an `index.json` listing every block allocated to
//! every object in that partition. `current_offset` equals `block_offset`
//! for the one block currently open for appends and is zero for sealed
//! blocks; at most one entry per object has a non-zero `current_offset`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One block owned by one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub device_id: u32,
    pub block_offset: i64,
    pub current_offset: i64,
}

/// Read a partition index. A missing or empty file is an empty index;
/// an unparseable one surfaces as `BadIndex` (callers treat it as empty
/// and the next write rebuilds it).
pub fn read_index(path: &Path) -> Result<Vec<IndexEntry>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    if data.is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_slice(&data).map_err(|e| Error::BadIndex(e.to_string()))
}

/// Write a partition index atomically: four-space pretty JSON to a
/// temporary file, then rename over the target.
pub fn write_index(path: &Path, entries: &[IndexEntry]) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(entries, &mut ser)?;
    buf.push(b'\n');

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_index_is_empty() {
        let dir = TempDir::new().unwrap();
        let entries = read_index(&dir.path().join("index.json")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_empty_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"").unwrap();
        assert!(read_index(&path).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_index_is_bad_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(read_index(&path), Err(Error::BadIndex(_))));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let entries = vec![
            IndexEntry {
                device_id: 7,
                block_offset: 0,
                current_offset: 0,
            },
            IndexEntry {
                device_id: 7,
                block_offset: 4096,
                current_offset: 4096,
            },
        ];

        write_index(&path, &entries).unwrap();
        assert_eq!(read_index(&path).unwrap(), entries);
    }

    #[test]
    fn test_index_is_pretty_printed_with_four_spaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        write_index(
            &path,
            &[IndexEntry {
                device_id: 1,
                block_offset: 0,
                current_offset: 0,
            }],
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n    {\n        \"device_id\": 1"));
        assert!(text.ends_with("\n"));
    }
}
