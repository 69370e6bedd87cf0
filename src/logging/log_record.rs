use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::pages::{Lsn, INVALID_LSN};
use crate::tuple::{Rid, Tuple};

/// serialized size of [`LogRecordHeader`]
pub const LOG_HEADER_SIZE: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordType {
    Invalid,
    Insert,
    MarkDelete,
    ApplyDelete,
    RollbackDelete,
    Update,
    NewPage,
    Begin,
    Commit,
    Abort,
}

/// Fixed 20-byte prefix of every log record:
/// `size (4) | lsn (4) | prev_lsn (4) | txn_id (4) | type (4)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LogRecordHeader {
    pub size: i32,
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: u32,
    pub record_type: LogRecordType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    None,
    /// INSERT / MARKDELETE / APPLYDELETE / ROLLBACKDELETE
    TupleOp { rid: Rid, tuple: Tuple },
    Update {
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    },
}

#[derive(Clone, Debug)]
pub struct LogRecord {
    pub header: LogRecordHeader,
    pub payload: LogPayload,
}

impl LogRecord {
    fn new(txn_id: u32, prev_lsn: Lsn, record_type: LogRecordType, payload: LogPayload) -> Self {
        Self {
            header: LogRecordHeader {
                size: 0,
                lsn: INVALID_LSN,
                prev_lsn,
                txn_id,
                record_type,
            },
            payload,
        }
    }

    pub fn begin(txn_id: u32, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Begin, LogPayload::None)
    }

    pub fn commit(txn_id: u32, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Commit, LogPayload::None)
    }

    pub fn abort(txn_id: u32, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Abort, LogPayload::None)
    }

    pub fn new_page(txn_id: u32, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::NewPage, LogPayload::None)
    }

    pub fn insert(txn_id: u32, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::Insert,
            LogPayload::TupleOp { rid, tuple },
        )
    }

    pub fn mark_delete(txn_id: u32, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::MarkDelete,
            LogPayload::TupleOp { rid, tuple },
        )
    }

    pub fn apply_delete(txn_id: u32, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::ApplyDelete,
            LogPayload::TupleOp { rid, tuple },
        )
    }

    pub fn update(txn_id: u32, prev_lsn: Lsn, rid: Rid, old_tuple: Tuple, new_tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::Update,
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            },
        )
    }

    /// Serializes header + payload, fixing up the header's `size` field
    /// first. bincode writes the header fields fixed-width little-endian, so
    /// the prefix is exactly [`LOG_HEADER_SIZE`] bytes.
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        let body = match &self.payload {
            LogPayload::None => Vec::new(),
            LogPayload::TupleOp { rid, tuple } => {
                let mut body = bincode::serialize(rid)?;
                body.extend(bincode::serialize(tuple)?);
                body
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                let mut body = bincode::serialize(rid)?;
                body.extend(bincode::serialize(old_tuple)?);
                body.extend(bincode::serialize(new_tuple)?);
                body
            }
        };

        self.header.size = (LOG_HEADER_SIZE + body.len()) as i32;
        let mut bytes = bincode::serialize(&self.header)?;
        debug_assert_eq!(bytes.len(), LOG_HEADER_SIZE);
        bytes.extend(body);
        Ok(bytes)
    }
}
