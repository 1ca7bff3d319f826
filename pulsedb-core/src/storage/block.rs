//! Block header and record codec
//!
//! A block is a fixed-size region of a partition's data file: a 25-byte
//! header followed by densely appended records. A record is a u32 LE
//! timestamp followed by the value encoded per the counter's declared
//! type; there is no per-record type marker. Unused trailing bytes of a
//! block are zero-filled and ignored on read.

use crate::{DataPoint, Result, Timestamp, Value, ValueType};
use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

/// Block header, stored little-endian at the start of every block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub object_id: u32,
    pub start_timestamp: Timestamp,
    pub end_timestamp: Timestamp,
    pub next_block_offset: i64,
    pub record_count: u32,
    pub data_type: u8,
}

impl BlockHeader {
    /// Header size in bytes
    pub const SIZE: usize = 25;

    /// A fresh header for a block receiving its first record
    pub fn new(object_id: u32, data_type: ValueType, timestamp: Timestamp) -> Self {
        Self {
            object_id,
            start_timestamp: timestamp,
            end_timestamp: timestamp,
            next_block_offset: 0,
            record_count: 1,
            data_type: data_type.tag(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.object_id);
        buf.put_u32_le(self.start_timestamp);
        buf.put_u32_le(self.end_timestamp);
        buf.put_i64_le(self.next_block_offset);
        buf.put_u32_le(self.record_count);
        buf.put_u8(self.data_type);

        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(crate::Error::Decode("block header too short".to_string()));
        }

        let mut cursor = &data[..Self::SIZE];
        Ok(Self {
            object_id: cursor.get_u32_le(),
            start_timestamp: cursor.get_u32_le(),
            end_timestamp: cursor.get_u32_le(),
            next_block_offset: cursor.get_i64_le(),
            record_count: cursor.get_u32_le(),
            data_type: cursor.get_u8(),
        })
    }

    /// Fold one more record into the header
    pub fn absorb(&mut self, timestamp: Timestamp) {
        self.record_count += 1;
        if timestamp > self.end_timestamp {
            self.end_timestamp = timestamp;
        }
        if self.start_timestamp == 0 {
            self.start_timestamp = timestamp;
        }
    }
}

/// Serialize one record: u32 LE timestamp + value bytes.
///
/// Int and Float are 8 bytes LE; strings carry a u32 LE length prefix.
pub fn encode_record(timestamp: Timestamp, value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u32_le(timestamp);

    match value {
        Value::Int(v) => buf.put_i64_le(*v),
        Value::Float(v) => buf.put_f64_le(*v),
        Value::Str(s) => {
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
    }

    buf.to_vec()
}

/// Walk a block payload (the block minus its header), decoding records
/// whose timestamp falls in `[from, to]`.
///
/// The walk terminates when a timestamp read cannot be completed; a
/// malformed string record ends the walk with whatever was accumulated.
pub fn decode_records(
    payload: &[u8],
    from: Timestamp,
    to: Timestamp,
    value_type: ValueType,
) -> Vec<DataPoint> {
    let mut points = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= payload.len() {
        let mut cursor = &payload[offset..];
        let timestamp = cursor.get_u32_le();
        offset += 4;

        if timestamp < from || timestamp > to {
            // Out of range: advance by the value stride for this type.
            match value_type {
                ValueType::Int | ValueType::Float => offset += 8,
                ValueType::Str => {
                    if offset + 4 > payload.len() {
                        warn!("string record truncated at length prefix");
                        break;
                    }
                    let len = (&payload[offset..]).get_u32_le() as usize;
                    offset += 4 + len;
                }
            }
            continue;
        }

        let value = match value_type {
            ValueType::Int => {
                if offset + 8 > payload.len() {
                    break;
                }
                let v = (&payload[offset..]).get_i64_le();
                offset += 8;
                Value::Int(v)
            }
            ValueType::Float => {
                if offset + 8 > payload.len() {
                    break;
                }
                let v = (&payload[offset..]).get_f64_le();
                offset += 8;
                Value::Float(v)
            }
            ValueType::Str => {
                if offset + 4 > payload.len() {
                    warn!("string record truncated at length prefix");
                    break;
                }
                let len = (&payload[offset..]).get_u32_le() as usize;
                offset += 4;
                if offset + len > payload.len() {
                    warn!(len, "string record length exceeds payload");
                    break;
                }
                let s = match std::str::from_utf8(&payload[offset..offset + len]) {
                    Ok(s) => s.to_string(),
                    Err(_) => {
                        warn!("string record is not valid UTF-8");
                        break;
                    }
                };
                offset += len;
                Value::Str(s)
            }
        };

        points.push(DataPoint { timestamp, value });
    }

    points
}
