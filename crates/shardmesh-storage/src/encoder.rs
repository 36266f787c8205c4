//! Record encoding for shard payloads.

use crate::{Result, StorageError};
use bytes::Bytes;
use shardmesh_types::Record;

/// Converts a group of records to shard payload bytes and back.
pub trait RecordEncoder: Send + Sync {
    /// Encodes records into a payload.
    fn encode(&self, records: &[Record]) -> Result<Bytes>;

    /// Decodes a payload into records, preserving order.
    fn decode(&self, payload: &[u8]) -> Result<Vec<Record>>;

    /// Format name stored in dataset metadata.
    fn format(&self) -> &'static str;
}

/// Encodes records as newline-delimited JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesEncoder;

impl RecordEncoder for JsonLinesEncoder {
    fn encode(&self, records: &[Record]) -> Result<Bytes> {
        let mut out = Vec::new();
        for record in records {
            serde_json::to_writer(&mut out, record)?;
            out.push(b'\n');
        }
        Ok(Bytes::from(out))
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<Record>> {
        payload
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
            .map(|(n, line)| {
                serde_json::from_slice(line)
                    .map_err(|e| StorageError::Corruption(format!("line {}: {e}", n + 1)))
            })
            .collect()
    }

    fn format(&self) -> &'static str {
        "jsonl"
    }
}
