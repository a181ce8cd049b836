/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The durable version log: the [`LogStore`] trait the persistence manager writes through, the
//! on-disk record layout, and the provided [`FileLogStore`] implementation.
//!
//! Each subgroup owns one append-only log. Records are written contiguously in version order:
//!
//! ```text
//! version: i64 | hlc.wall: u64 | hlc.logical: u64 | payload_len: u32 | payload | sig_len: u16 | sig
//! ```
//!
//! all integers little-endian. Truncation removes trailing records with versions strictly
//! greater than a given version; it exists so a replica that crashed mid-write, or whose tail
//! was never globally persisted, can realign its log with the group.

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use crate::types::basic::{Hlc, SubgroupId, Version};

/// One persisted version of one subgroup's state.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct LogRecord {
    pub version: Version,
    pub hlc: Hlc,
    pub payload: Vec<u8>,
    /// Chained signature over this record; empty when the log is unsigned.
    pub signature: Vec<u8>,
}

impl LogRecord {
    /// Serialize into the on-disk layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(8 + 8 + 8 + 4 + self.payload.len() + 2 + self.signature.len());
        bytes.extend_from_slice(&self.version.int().to_le_bytes());
        bytes.extend_from_slice(&self.hlc.wall.to_le_bytes());
        bytes.extend_from_slice(&self.hlc.logical.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&(self.signature.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    /// The bytes a record's signature is computed over: everything up to, but excluding, the
    /// signature fields.
    pub fn signed_prefix(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 8 + 8 + 4 + self.payload.len());
        bytes.extend_from_slice(&self.version.int().to_le_bytes());
        bytes.extend_from_slice(&self.hlc.wall.to_le_bytes());
        bytes.extend_from_slice(&self.hlc.logical.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Deserialize one record from the front of `bytes`, returning it and the number of bytes
    /// consumed.
    pub fn decode(bytes: &[u8]) -> Result<(LogRecord, usize), LogError> {
        let mut cursor = 0usize;
        let read = |cursor: &mut usize, len: usize| -> Result<&[u8], LogError> {
            let end = *cursor + len;
            let slice = bytes.get(*cursor..end).ok_or(LogError::Corrupt)?;
            *cursor = end;
            Ok(slice)
        };

        let version = i64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let wall = u64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let logical = u64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let payload_len = u32::from_le_bytes(read(&mut cursor, 4)?.try_into().unwrap()) as usize;
        let payload = read(&mut cursor, payload_len)?.to_vec();
        let sig_len = u16::from_le_bytes(read(&mut cursor, 2)?.try_into().unwrap()) as usize;
        let signature = read(&mut cursor, sig_len)?.to_vec();

        Ok((
            LogRecord {
                version: Version::from_int(version),
                hlc: Hlc::new(wall, logical),
                payload,
                signature,
            },
            cursor,
        ))
    }
}

/// Backing storage for subgroup version logs. The persistence worker is the only writer; the
/// view manager reads tails for state transfer and signature catch-up.
pub trait LogStore: Send + 'static {
    /// Append `record` to `subgroup`'s log. Appending a version at or below the log's last
    /// version is a no-op: versions are appended exactly once, and retries after a view change
    /// must not duplicate them.
    fn append(&mut self, subgroup: SubgroupId, record: &LogRecord) -> Result<(), LogError>;

    /// Remove every record with version strictly greater than `above`.
    fn truncate(&mut self, subgroup: SubgroupId, above: Version) -> Result<(), LogError>;

    /// Every record with `from < version <= to`, in version order.
    fn read_range(
        &mut self,
        subgroup: SubgroupId,
        from: Version,
        to: Version,
    ) -> Result<Vec<LogRecord>, LogError>;

    /// The record at exactly `version`, if present.
    fn read(&mut self, subgroup: SubgroupId, version: Version) -> Result<Option<LogRecord>, LogError> {
        Ok(self
            .read_range(subgroup, Version::from_int(version.int() - 1), version)?
            .into_iter()
            .next())
    }

    /// The highest version in `subgroup`'s log, or [`Version::NONE`] for an empty log.
    fn last_version(&mut self, subgroup: SubgroupId) -> Result<Version, LogError>;
}

/// Why a log operation failed. `Io` maps to the persistence-failure class surfaced through the
/// persistence callbacks; `Corrupt` additionally pins the verified watermark.
#[derive(Debug)]
pub enum LogError {
    Io(io::Error),
    Corrupt,
}

impl From<io::Error> for LogError {
    fn from(source: io::Error) -> LogError {
        LogError::Io(source)
    }
}

/// One `subgroup_<id>.log` file per subgroup under a base directory, with an in-memory offset
/// index rebuilt on open.
pub struct FileLogStore {
    dir: PathBuf,
    logs: HashMap<SubgroupId, SubgroupLog>,
}

struct SubgroupLog {
    file: File,
    /// (version, offset) per record, in file order.
    index: Vec<(Version, u64)>,
    tail: u64,
}

impl FileLogStore {
    /// Open (creating if needed) a log store rooted at `dir`, scanning any existing logs to
    /// rebuild their indices.
    pub fn open(dir: impl Into<PathBuf>) -> Result<FileLogStore, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut logs = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(id) = name
                .strip_prefix("subgroup_")
                .and_then(|rest| rest.strip_suffix(".log"))
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            logs.insert(SubgroupId::new(id), SubgroupLog::open(&path)?);
        }
        Ok(FileLogStore { dir, logs })
    }

    fn log(&mut self, subgroup: SubgroupId) -> Result<&mut SubgroupLog, LogError> {
        if !self.logs.contains_key(&subgroup) {
            let path = self.dir.join(format!("subgroup_{}.log", subgroup.int()));
            self.logs.insert(subgroup, SubgroupLog::open(&path)?);
        }
        Ok(self.logs.get_mut(&subgroup).unwrap())
    }
}

impl SubgroupLog {
    fn open(path: &std::path::Path) -> Result<SubgroupLog, LogError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut index = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let (record, consumed) = LogRecord::decode(&bytes[offset..])?;
            index.push((record.version, offset as u64));
            offset += consumed;
        }
        Ok(SubgroupLog {
            file,
            index,
            tail: offset as u64,
        })
    }

    fn last_version(&self) -> Version {
        self.index.last().map(|(version, _)| *version).unwrap_or(Version::NONE)
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, subgroup: SubgroupId, record: &LogRecord) -> Result<(), LogError> {
        let log = self.log(subgroup)?;
        if record.version <= log.last_version() {
            return Ok(());
        }
        let bytes = record.encode();
        log.file.seek(SeekFrom::Start(log.tail))?;
        log.file.write_all(&bytes)?;
        log.file.sync_data()?;
        log.index.push((record.version, log.tail));
        log.tail += bytes.len() as u64;
        Ok(())
    }

    fn truncate(&mut self, subgroup: SubgroupId, above: Version) -> Result<(), LogError> {
        let log = self.log(subgroup)?;
        let keep = log.index.partition_point(|(version, _)| *version <= above);
        if keep == log.index.len() {
            return Ok(());
        }
        let new_tail = log.index[keep].1;
        log.file.set_len(new_tail)?;
        log.file.sync_data()?;
        log.index.truncate(keep);
        log.tail = new_tail;
        Ok(())
    }

    fn read_range(
        &mut self,
        subgroup: SubgroupId,
        from: Version,
        to: Version,
    ) -> Result<Vec<LogRecord>, LogError> {
        let log = self.log(subgroup)?;
        let start = log.index.partition_point(|(version, _)| *version <= from);
        let mut records = Vec::new();
        for (version, offset) in log.index.iter().skip(start) {
            if *version > to {
                break;
            }
            log.file.seek(SeekFrom::Start(*offset))?;
            let mut header = [0u8; 28];
            log.file.read_exact(&mut header)?;
            let payload_len = u32::from_le_bytes(header[24..28].try_into().unwrap()) as usize;
            let mut rest = vec![0u8; payload_len + 2];
            log.file.read_exact(&mut rest)?;
            let sig_len =
                u16::from_le_bytes(rest[payload_len..payload_len + 2].try_into().unwrap()) as usize;
            let mut sig = vec![0u8; sig_len];
            log.file.read_exact(&mut sig)?;

            let mut bytes = Vec::with_capacity(28 + rest.len() + sig.len());
            bytes.extend_from_slice(&header);
            bytes.extend_from_slice(&rest);
            bytes.extend_from_slice(&sig);
            let (record, _) = LogRecord::decode(&bytes)?;
            records.push(record);
        }
        Ok(records)
    }

    fn last_version(&mut self, subgroup: SubgroupId) -> Result<Version, LogError> {
        Ok(self.log(subgroup)?.last_version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::ViewId;

    fn record(index: u64, payload: &[u8]) -> LogRecord {
        LogRecord {
            version: Version::new(ViewId::new(1), index),
            hlc: Hlc::new(1000 + index, 0),
            payload: payload.to_vec(),
            signature: vec![0xab; 64],
        }
    }

    #[test]
    fn records_encode_and_decode_exactly() {
        let original = record(4, b"counter state");
        let bytes = original.encode();
        let (decoded, consumed) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn short_buffers_are_corrupt_not_panics() {
        let bytes = record(0, b"x").encode();
        assert!(matches!(LogRecord::decode(&bytes[..10]), Err(LogError::Corrupt)));
    }

    #[test]
    fn file_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let subgroup = SubgroupId::new(0);
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            for index in 0..5 {
                store.append(subgroup, &record(index, b"payload")).unwrap();
            }
        }
        let mut store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(
            store.last_version(subgroup).unwrap(),
            Version::new(ViewId::new(1), 4)
        );
        let all = store
            .read_range(subgroup, Version::NONE, Version::new(ViewId::new(1), 4))
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn duplicate_appends_are_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(dir.path()).unwrap();
        let subgroup = SubgroupId::new(1);
        store.append(subgroup, &record(0, b"first")).unwrap();
        store.append(subgroup, &record(0, b"again")).unwrap();
        let all = store
            .read_range(subgroup, Version::NONE, Version::new(ViewId::new(1), 0))
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, b"first");
    }

    #[test]
    fn truncation_removes_strictly_greater_versions() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(dir.path()).unwrap();
        let subgroup = SubgroupId::new(2);
        for index in 0..10 {
            store.append(subgroup, &record(index, b"v")).unwrap();
        }
        store
            .truncate(subgroup, Version::new(ViewId::new(1), 6))
            .unwrap();
        assert_eq!(
            store.last_version(subgroup).unwrap(),
            Version::new(ViewId::new(1), 6)
        );
        // Appends continue after the truncation point.
        store.append(subgroup, &record(7, b"w")).unwrap();
        assert_eq!(
            store.last_version(subgroup).unwrap(),
            Version::new(ViewId::new(1), 7)
        );
    }
}
