use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, PageId, Rid, TxnId};

/// Fixed header of five little-endian u32 fields: size, lsn, txn_id,
/// prev_lsn, type.
pub const LOG_HEADER_SIZE: usize = 20;

/// Wire discriminants for the record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogRecordType {
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    Begin = 6,
    Commit = 7,
    Abort = 8,
    NewPage = 9,
}

impl LogRecordType {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Insert,
            2 => Self::MarkDelete,
            3 => Self::ApplyDelete,
            4 => Self::RollbackDelete,
            5 => Self::Update,
            6 => Self::Begin,
            7 => Self::Commit,
            8 => Self::Abort,
            9 => Self::NewPage,
            _ => return None,
        })
    }
}

/// Type-specific payload of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert { rid: Rid, tuple: Vec<u8> },
    MarkDelete { rid: Rid, tuple: Vec<u8> },
    ApplyDelete { rid: Rid, tuple: Vec<u8> },
    RollbackDelete { rid: Rid, tuple: Vec<u8> },
    Update { rid: Rid, old_tuple: Vec<u8>, new_tuple: Vec<u8> },
    NewPage { prev_page_id: PageId, page_id: PageId },
}

impl LogPayload {
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Begin => LogRecordType::Begin,
            Self::Commit => LogRecordType::Commit,
            Self::Abort => LogRecordType::Abort,
            Self::Insert { .. } => LogRecordType::Insert,
            Self::MarkDelete { .. } => LogRecordType::MarkDelete,
            Self::ApplyDelete { .. } => LogRecordType::ApplyDelete,
            Self::RollbackDelete { .. } => LogRecordType::RollbackDelete,
            Self::Update { .. } => LogRecordType::Update,
            Self::NewPage { .. } => LogRecordType::NewPage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn: 0,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    /// Serialized footprint, header included.
    pub fn size(&self) -> usize {
        LOG_HEADER_SIZE
            + match &self.payload {
                LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => 0,
                LogPayload::Insert { tuple, .. }
                | LogPayload::MarkDelete { tuple, .. }
                | LogPayload::ApplyDelete { tuple, .. }
                | LogPayload::RollbackDelete { tuple, .. } => Rid::ENCODED_SIZE + 4 + tuple.len(),
                LogPayload::Update {
                    old_tuple,
                    new_tuple,
                    ..
                } => Rid::ENCODED_SIZE + 4 + old_tuple.len() + 4 + new_tuple.len(),
                LogPayload::NewPage { .. } => 8,
            }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.size();
        let mut buf = vec![0u8; size];
        LittleEndian::write_u32(&mut buf[0..4], size as u32);
        LittleEndian::write_u32(&mut buf[4..8], self.lsn);
        LittleEndian::write_u32(&mut buf[8..12], self.txn_id);
        LittleEndian::write_u32(&mut buf[12..16], self.prev_lsn);
        LittleEndian::write_u32(&mut buf[16..20], self.payload.record_type() as u32);

        let mut pos = LOG_HEADER_SIZE;
        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Insert { rid, tuple }
            | LogPayload::MarkDelete { rid, tuple }
            | LogPayload::ApplyDelete { rid, tuple }
            | LogPayload::RollbackDelete { rid, tuple } => {
                rid.encode(&mut buf[pos..pos + Rid::ENCODED_SIZE]);
                pos += Rid::ENCODED_SIZE;
                write_blob(&mut buf, &mut pos, tuple);
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                rid.encode(&mut buf[pos..pos + Rid::ENCODED_SIZE]);
                pos += Rid::ENCODED_SIZE;
                write_blob(&mut buf, &mut pos, old_tuple);
                write_blob(&mut buf, &mut pos, new_tuple);
            }
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                LittleEndian::write_u32(&mut buf[pos..pos + 4], *prev_page_id);
                LittleEndian::write_u32(&mut buf[pos + 4..pos + 8], *page_id);
            }
        }
        buf
    }

    /// Parse one record off the front of `buf`. `None` means the bytes do
    /// not hold a complete record (truncated tail or zeroed buffer) and
    /// terminates a recovery scan.
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < LOG_HEADER_SIZE {
            return None;
        }
        let size = LittleEndian::read_u32(&buf[0..4]) as usize;
        if size < LOG_HEADER_SIZE || size > buf.len() {
            return None;
        }
        let lsn = LittleEndian::read_u32(&buf[4..8]);
        let txn_id = LittleEndian::read_u32(&buf[8..12]);
        let prev_lsn = LittleEndian::read_u32(&buf[12..16]);
        let record_type = LogRecordType::from_u32(LittleEndian::read_u32(&buf[16..20]))?;

        let body = &buf[LOG_HEADER_SIZE..size];
        let payload = match record_type {
            LogRecordType::Begin => LogPayload::Begin,
            LogRecordType::Commit => LogPayload::Commit,
            LogRecordType::Abort => LogPayload::Abort,
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                let mut pos = 0;
                let rid = read_rid(body, &mut pos)?;
                let tuple = read_blob(body, &mut pos)?;
                match record_type {
                    LogRecordType::Insert => LogPayload::Insert { rid, tuple },
                    LogRecordType::MarkDelete => LogPayload::MarkDelete { rid, tuple },
                    LogRecordType::ApplyDelete => LogPayload::ApplyDelete { rid, tuple },
                    _ => LogPayload::RollbackDelete { rid, tuple },
                }
            }
            LogRecordType::Update => {
                let mut pos = 0;
                let rid = read_rid(body, &mut pos)?;
                let old_tuple = read_blob(body, &mut pos)?;
                let new_tuple = read_blob(body, &mut pos)?;
                LogPayload::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordType::NewPage => {
                if body.len() < 8 {
                    return None;
                }
                LogPayload::NewPage {
                    prev_page_id: LittleEndian::read_u32(&body[0..4]),
                    page_id: LittleEndian::read_u32(&body[4..8]),
                }
            }
        };

        Some(Self {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        })
    }
}

fn write_blob(buf: &mut [u8], pos: &mut usize, data: &[u8]) {
    LittleEndian::write_u32(&mut buf[*pos..*pos + 4], data.len() as u32);
    *pos += 4;
    buf[*pos..*pos + data.len()].copy_from_slice(data);
    *pos += data.len();
}

fn read_blob(buf: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    if *pos + 4 > buf.len() {
        return None;
    }
    let len = LittleEndian::read_u32(&buf[*pos..*pos + 4]) as usize;
    *pos += 4;
    if *pos + len > buf.len() {
        return None;
    }
    let data = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Some(data)
}

fn read_rid(buf: &[u8], pos: &mut usize) -> Option<Rid> {
    if *pos + Rid::ENCODED_SIZE > buf.len() {
        return None;
    }
    let rid = Rid::decode(&buf[*pos..*pos + Rid::ENCODED_SIZE]);
    *pos += Rid::ENCODED_SIZE;
    Some(rid)
}
