//! WAL record types and their on-disk framing.
//!
//! Records carry logical redo information (key and value bytes), never page
//! images, so replaying one twice leaves the index in the same state.
//!
//! Each record is stored as one frame:
//!
//! ```text
//! [len: u32 LE][crc32 of body: u32 LE][body: bincode(WalRecord)]
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::error::{StorageError, StorageResult};

/// Bytes in a frame before the record body.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single encoded record. Anything larger in a length
/// prefix is treated as garbage from a torn write.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Log Sequence Number - a unique identifier for WAL records.
/// LSNs are monotonically increasing and used to order log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// LSN 0 never names a record.
    pub const INVALID: Lsn = Lsn(0);

    pub fn next(&self) -> Self {
        Lsn(self.0 + 1)
    }

    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecordHeader {
    /// Assigned by [`super::WalManager::append`].
    pub lsn: Lsn,
    /// Transaction that produced the record, 0 for checkpoint markers.
    pub transaction_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordPayload {
    Begin,
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Commit { commit_timestamp: u64 },
    Rollback,
    /// Everything before this marker is reflected in the data file.
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: WalRecordPayload,
}

impl WalRecord {
    fn new(transaction_id: u64, payload: WalRecordPayload) -> Self {
        Self {
            header: WalRecordHeader {
                lsn: Lsn::INVALID,
                transaction_id,
            },
            payload,
        }
    }

    pub fn begin(transaction_id: u64) -> Self {
        Self::new(transaction_id, WalRecordPayload::Begin)
    }

    pub fn put(transaction_id: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self::new(transaction_id, WalRecordPayload::Put { key, value })
    }

    pub fn delete(transaction_id: u64, key: Vec<u8>) -> Self {
        Self::new(transaction_id, WalRecordPayload::Delete { key })
    }

    pub fn commit(transaction_id: u64, commit_timestamp: u64) -> Self {
        Self::new(transaction_id, WalRecordPayload::Commit { commit_timestamp })
    }

    pub fn rollback(transaction_id: u64) -> Self {
        Self::new(transaction_id, WalRecordPayload::Rollback)
    }

    pub fn checkpoint() -> Self {
        Self::new(0, WalRecordPayload::Checkpoint)
    }

    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    pub fn transaction_id(&self) -> u64 {
        self.header.transaction_id
    }

    /// Appends this record as one frame.
    pub fn encode_frame(&self, buf: &mut BytesMut) -> StorageResult<()> {
        let body = bincode::serialize(self)?;
        if body.len() > MAX_RECORD_SIZE {
            return Err(StorageError::EntryTooLarge {
                required: body.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        buf.reserve(FRAME_HEADER_SIZE + body.len());
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(crc32fast::hash(&body));
        buf.put_slice(&body);
        Ok(())
    }
}

/// Result of decoding the frame at the front of a buffer.
#[derive(Debug)]
pub enum FrameDecode {
    /// A valid record and the number of bytes it occupied.
    Record(WalRecord, usize),
    /// The buffer ends inside a frame.
    Incomplete,
    /// Checksum or length mismatch, or an undecodable body.
    Corrupt,
}

pub fn decode_frame(buf: &[u8]) -> FrameDecode {
    if buf.len() < FRAME_HEADER_SIZE {
        return FrameDecode::Incomplete;
    }

    let mut header = &buf[..FRAME_HEADER_SIZE];
    let len = header.get_u32_le() as usize;
    let checksum = header.get_u32_le();
    if len == 0 || len > MAX_RECORD_SIZE {
        return FrameDecode::Corrupt;
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return FrameDecode::Incomplete;
    }

    let body = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len];
    if crc32fast::hash(body) != checksum {
        return FrameDecode::Corrupt;
    }
    match bincode::deserialize::<WalRecord>(body) {
        Ok(record) => FrameDecode::Record(record, FRAME_HEADER_SIZE + len),
        Err(_) => FrameDecode::Corrupt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn() {
        let lsn = Lsn::default();
        assert!(lsn.is_invalid());

        let next_lsn = lsn.next();
        assert_eq!(next_lsn.0, 1);
        assert!(!next_lsn.is_invalid());
        assert!(lsn < next_lsn);
    }

    #[test]
    fn test_frame_decodes_what_was_encoded() -> StorageResult<()> {
        let mut record = WalRecord::put(7, b"key".to_vec(), b"value".to_vec());
        record.header.lsn = Lsn(42);

        let mut buf = BytesMut::new();
        record.encode_frame(&mut buf)?;
        WalRecord::commit(7, 3).encode_frame(&mut buf)?;

        match decode_frame(&buf) {
            FrameDecode::Record(decoded, used) => {
                assert_eq!(decoded, record);
                let rest = &buf[used..];
                assert!(matches!(
                    decode_frame(rest),
                    FrameDecode::Record(WalRecord { payload: WalRecordPayload::Commit { commit_timestamp: 3 }, .. }, _)
                ));
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_truncated_frame_is_incomplete() -> StorageResult<()> {
        let mut buf = BytesMut::new();
        WalRecord::delete(1, b"gone".to_vec()).encode_frame(&mut buf)?;

        assert!(matches!(decode_frame(&buf[..3]), FrameDecode::Incomplete));
        assert!(matches!(
            decode_frame(&buf[..buf.len() - 1]),
            FrameDecode::Incomplete
        ));
        Ok(())
    }

    #[test]
    fn test_flipped_bit_is_corrupt() -> StorageResult<()> {
        let mut buf = BytesMut::new();
        WalRecord::begin(9).encode_frame(&mut buf)?;
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        assert!(matches!(decode_frame(&buf), FrameDecode::Corrupt));
        Ok(())
    }
}
