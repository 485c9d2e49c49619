use crate::errors::DbError;
use crate::types::{Lsn, NO_PAGE, PageId, TxId, now_micros};
use crc32fast::Hasher as Crc32;

/// Type tag carried by serialized log records.
pub const LOG_ENTRY_TAG: &str = "logentry";

/// Operation recorded in the write-ahead log. Byte values are part of the
/// file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    Insert = 0,
    Update = 1,
    Delete = 2,
    Commit = 3,
    Rollback = 4,
    Checkpoint = 5,
}

impl LogOp {
    /// # Errors
    /// `Corruption` for a byte outside the known set.
    pub fn from_u8(value: u8) -> Result<Self, DbError> {
        match value {
            0 => Ok(Self::Insert),
            1 => Ok(Self::Update),
            2 => Ok(Self::Delete),
            3 => Ok(Self::Commit),
            4 => Ok(Self::Rollback),
            5 => Ok(Self::Checkpoint),
            other => Err(DbError::Corruption(format!("unknown log op byte {other}"))),
        }
    }

    /// Data ops carry page images; Commit/Rollback/Checkpoint do not.
    #[must_use]
    pub const fn is_data_op(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// One write-ahead log record.
///
/// Serialized payload (after the type tag; all integers little-endian):
///
///   i64 lsn | u32 tx_len | tx utf8 | u8 op | i64 page_id |
///   u32 before_len | before | u32 after_len | after |
///   i64 timestamp | u32 checksum
///
/// The checksum is CRC32 over every payload byte preceding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub tx_id: TxId,
    pub op: LogOp,
    pub page_id: PageId,
    pub before_image: Vec<u8>,
    pub after_image: Vec<u8>,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    pub checksum: u32,
}

impl LogRecord {
    /// New record with the LSN left for the WAL to assign.
    #[must_use]
    pub fn new(
        op: LogOp,
        tx_id: impl Into<TxId>,
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Self {
        Self {
            lsn: 0,
            tx_id: tx_id.into(),
            op,
            page_id,
            before_image,
            after_image,
            timestamp: now_micros(),
            checksum: 0,
        }
    }

    /// Control record (Commit/Rollback) with no page scope.
    #[must_use]
    pub fn control(op: LogOp, tx_id: impl Into<TxId>) -> Self {
        Self::new(op, tx_id, NO_PAGE, Vec::new(), Vec::new())
    }

    /// Serialize, stamping the checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let tag = LOG_ENTRY_TAG.as_bytes();
        let mut out = Vec::with_capacity(
            4 + tag.len() + 64 + self.tx_id.len() + self.before_image.len() + self.after_image.len(),
        );
        out.extend_from_slice(&u32::try_from(tag.len()).expect("short tag").to_le_bytes());
        out.extend_from_slice(tag);
        let payload_start = out.len();
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(
            &u32::try_from(self.tx_id.len()).expect("tx id fits in u32").to_le_bytes(),
        );
        out.extend_from_slice(self.tx_id.as_bytes());
        out.push(self.op as u8);
        out.extend_from_slice(&self.page_id.to_le_bytes());
        out.extend_from_slice(
            &u32::try_from(self.before_image.len()).expect("image fits in u32").to_le_bytes(),
        );
        out.extend_from_slice(&self.before_image);
        out.extend_from_slice(
            &u32::try_from(self.after_image.len()).expect("image fits in u32").to_le_bytes(),
        );
        out.extend_from_slice(&self.after_image);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        let mut hasher = Crc32::new();
        hasher.update(&out[payload_start..]);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    /// Deserialize and verify the checksum.
    ///
    /// # Errors
    /// `Corruption` on a truncated frame, wrong tag, or checksum mismatch.
    pub fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        let mut cursor = Cursor::new(bytes);
        let tag_len = cursor.read_u32()? as usize;
        let tag = cursor.read_bytes(tag_len)?;
        if tag != LOG_ENTRY_TAG.as_bytes() {
            return Err(DbError::Corruption(format!(
                "expected tag {LOG_ENTRY_TAG:?}, found {:?}",
                String::from_utf8_lossy(tag)
            )));
        }
        let payload_start = cursor.pos;
        let lsn = cursor.read_i64()?;
        let tx_len = cursor.read_u32()? as usize;
        let tx_id = std::str::from_utf8(cursor.read_bytes(tx_len)?)
            .map_err(|e| DbError::Corruption(format!("tx id not UTF-8: {e}")))?
            .to_string();
        let op = LogOp::from_u8(cursor.read_u8()?)?;
        let page_id = cursor.read_i64()?;
        let before_len = cursor.read_u32()? as usize;
        let before_image = cursor.read_bytes(before_len)?.to_vec();
        let after_len = cursor.read_u32()? as usize;
        let after_image = cursor.read_bytes(after_len)?.to_vec();
        let timestamp = cursor.read_i64()?;
        let payload_end = cursor.pos;
        let checksum = cursor.read_u32()?;
        let mut hasher = Crc32::new();
        hasher.update(&bytes[payload_start..payload_end]);
        let computed = hasher.finalize();
        if computed != checksum {
            return Err(DbError::Corruption(format!(
                "log record lsn {lsn}: checksum mismatch (stored {checksum:#x}, computed {computed:#x})"
            )));
        }
        Ok(Self { lsn, tx_id, op, page_id, before_image, after_image, timestamp, checksum })
    }

    /// True iff the stored checksum matches a fresh encode.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        Self::decode(&self.encode()).is_ok_and(|decoded| {
            decoded.lsn == self.lsn && decoded.tx_id == self.tx_id && decoded.op == self.op
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DbError> {
        if self.pos + len > self.bytes.len() {
            return Err(DbError::Corruption(format!(
                "log record truncated at offset {} (wanted {len} bytes)",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DbError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DbError> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().expect("4-byte slice")))
    }

    fn read_i64(&mut self) -> Result<i64, DbError> {
        Ok(i64::from_le_bytes(self.read_bytes(8)?.try_into().expect("8-byte slice")))
    }
}
