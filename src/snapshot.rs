//! Checksummed on-disk snapshots of routing table and storage state.
//!
//! A snapshot is a bencoded body wrapped with a version number and a
//! CRC32 of the body, written atomically via a temp file rename. A node
//! restarted with a snapshot rejoins the network without bootstrapping
//! from scratch.

use std::fs;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::common::{Id, Node};
use crate::error::SnapshotError;
use crate::messages::{bytes_to_nodes, nodes_to_bytes};
use crate::storage::StoredValue;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const SNAPSHOT_VERSION: u64 = 1;

/// The persisted state of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub records: Vec<(Id, StoredValue)>,
}

/// Write a snapshot to `path`, replacing whatever was there.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let body = serde_bencode::to_bytes(&internal::Body::from_snapshot(snapshot))?;

    let file = internal::File {
        version: SNAPSHOT_VERSION,
        checksum: CASTAGNOLI.checksum(&body),
        body,
    };

    let bytes = serde_bencode::to_bytes(&file)?;

    // Write then rename, so a crash never leaves a torn snapshot.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

/// Read a snapshot from `path`, verifying version and checksum.
pub fn load(path: &Path) -> Result<Snapshot, SnapshotError> {
    let bytes = fs::read(path)?;

    let file: internal::File = serde_bencode::from_bytes(&bytes)?;

    if file.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(file.version));
    }

    if CASTAGNOLI.checksum(&file.body) != file.checksum {
        return Err(SnapshotError::ChecksumMismatch);
    }

    let body: internal::Body = serde_bencode::from_bytes(&file.body)?;
    body.into_snapshot()
}

mod internal {
    use super::*;

    use std::convert::TryInto;

    use bytes::Bytes;

    use crate::error::MessageError;

    #[derive(Serialize, Deserialize, Debug)]
    pub(super) struct File {
        #[serde(rename = "v")]
        pub version: u64,

        #[serde(rename = "c")]
        pub checksum: u32,

        #[serde(rename = "b", with = "serde_bytes")]
        pub body: Vec<u8>,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub(super) struct Body {
        #[serde(rename = "n", with = "serde_bytes")]
        nodes: Vec<u8>,

        #[serde(rename = "r")]
        records: Vec<Record>,
    }

    #[derive(Serialize, Deserialize, Debug)]
    struct Record {
        #[serde(rename = "k", with = "serde_bytes")]
        key: Vec<u8>,

        #[serde(rename = "v", with = "serde_bytes")]
        value: Vec<u8>,

        #[serde(rename = "p", with = "serde_bytes")]
        publisher: Vec<u8>,

        /// Seconds since the unix epoch.
        #[serde(rename = "e")]
        expires_at: u64,

        #[serde(rename = "l")]
        local: u8,
    }

    impl Body {
        pub(super) fn from_snapshot(snapshot: &Snapshot) -> Body {
            Body {
                nodes: nodes_to_bytes(&snapshot.nodes),
                records: snapshot
                    .records
                    .iter()
                    .map(|(key, stored)| Record {
                        key: key.to_vec(),
                        value: stored.value.to_vec(),
                        publisher: stored.publisher.to_vec(),
                        expires_at: stored
                            .expires_at
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or(Duration::ZERO)
                            .as_secs(),
                        local: stored.local as u8,
                    })
                    .collect(),
            }
        }

        pub(super) fn into_snapshot(self) -> Result<Snapshot, SnapshotError> {
            let nodes = bytes_to_nodes(&self.nodes).map_err(invalid_data)?;

            let mut records = Vec::with_capacity(self.records.len());

            for record in self.records {
                let key = Id::from_bytes(&record.key)
                    .ok_or_else(|| invalid_data_str("bad record key"))?;

                let publisher: [u8; 32] = record
                    .publisher
                    .as_slice()
                    .try_into()
                    .map_err(|_| invalid_data_str("bad record publisher"))?;

                records.push((
                    key,
                    StoredValue {
                        value: Bytes::from(record.value),
                        publisher,
                        expires_at: UNIX_EPOCH + Duration::from_secs(record.expires_at),
                        local: record.local == 1,
                    },
                ));
            }

            Ok(Snapshot { nodes, records })
        }
    }

    fn invalid_data(error: MessageError) -> SnapshotError {
        SnapshotError::IO(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            error.to_string(),
        ))
    }

    fn invalid_data_str(message: &str) -> SnapshotError {
        SnapshotError::IO(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        ))
    }
}
