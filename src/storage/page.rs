use crate::errors::DbError;
use crate::types::{NO_PAGE, PageId};

/// Fixed page size of the data file.
pub const PAGE_SIZE: usize = 4096;
/// Bytes reserved for the page header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 32;
/// Usable payload bytes per page.
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// On-disk page kind. The byte values are part of the file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Free = 0,
    Header = 1,
    InternalNode = 2,
    LeafNode = 3,
    Data = 4,
    Overflow = 5,
}

impl PageType {
    /// # Errors
    /// `Corruption` for a byte outside the known set.
    pub fn from_u8(value: u8) -> Result<Self, DbError> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Header),
            2 => Ok(Self::InternalNode),
            3 => Ok(Self::LeafNode),
            4 => Ok(Self::Data),
            5 => Ok(Self::Overflow),
            other => Err(DbError::Corruption(format!("unknown page type byte {other}"))),
        }
    }
}

/// Page header, 32 bytes little-endian:
///
///   page_id      : i64  (offset 0)
///   page_type    : u8   (offset 8)
///   data_size    : i32 stored in 3 bytes (offset 9)
///   next_page_id : i64  (offset 12)
///   prev_page_id : i64  (offset 20)
///   checksum     : u32  (offset 28)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_id: PageId,
    pub page_type: PageType,
    pub data_size: i32,
    pub next_page_id: PageId,
    pub prev_page_id: PageId,
    pub checksum: u32,
}

/// XOR-fold a 64-bit field into 32 bits.
const fn fold(v: i64) -> u32 {
    let v = v as u64;
    ((v >> 32) as u32) ^ (v as u32)
}

impl PageHeader {
    #[must_use]
    pub const fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            data_size: 0,
            next_page_id: NO_PAGE,
            prev_page_id: NO_PAGE,
            checksum: 0,
        }
    }

    /// Checksum over the header fields (everything except the checksum
    /// slot itself).
    #[must_use]
    pub const fn compute_checksum(&self) -> u32 {
        fold(self.page_id)
            ^ (self.page_type as u32)
            ^ (self.data_size as u32)
            ^ fold(self.next_page_id)
            ^ fold(self.prev_page_id)
    }

    #[must_use]
    pub const fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.page_id.to_le_bytes());
        buf[8] = self.page_type as u8;
        buf[9..12].copy_from_slice(&self.data_size.to_le_bytes()[..3]);
        buf[12..20].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.prev_page_id.to_le_bytes());
        buf[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// # Errors
    /// `Corruption` on a short buffer or unknown page type byte.
    pub fn decode(buf: &[u8]) -> Result<Self, DbError> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(DbError::Corruption(format!("page header truncated: {} bytes", buf.len())));
        }
        let page_id = i64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice"));
        let page_type = PageType::from_u8(buf[8])?;
        let mut size_bytes = [0u8; 4];
        size_bytes[..3].copy_from_slice(&buf[9..12]);
        let data_size = i32::from_le_bytes(size_bytes);
        let next_page_id = i64::from_le_bytes(buf[12..20].try_into().expect("8-byte slice"));
        let prev_page_id = i64::from_le_bytes(buf[20..28].try_into().expect("8-byte slice"));
        let checksum = u32::from_le_bytes(buf[28..32].try_into().expect("4-byte slice"));
        Ok(Self { page_id, page_type, data_size, next_page_id, prev_page_id, checksum })
    }
}

/// A fixed-size page: header plus payload. The payload buffer is always
/// `PAGE_DATA_SIZE` bytes; `header.data_size` says how much is meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub header: PageHeader,
    data: Vec<u8>,
}

impl Page {
    #[must_use]
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self { header: PageHeader::new(page_id, page_type), data: vec![0u8; PAGE_DATA_SIZE] }
    }

    /// Create a page carrying `data`.
    ///
    /// # Errors
    /// `InvalidArgument` if `data` exceeds the page payload area.
    pub fn with_data(page_id: PageId, page_type: PageType, data: &[u8]) -> Result<Self, DbError> {
        let mut page = Self::new(page_id, page_type);
        page.set_data(data)?;
        Ok(page)
    }

    /// Meaningful payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let len = usize::try_from(self.header.data_size.max(0)).unwrap_or(0).min(PAGE_DATA_SIZE);
        &self.data[..len]
    }

    /// Replace the payload and refresh `data_size`.
    ///
    /// # Errors
    /// `InvalidArgument` if `data` exceeds the page payload area.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), DbError> {
        if data.len() > PAGE_DATA_SIZE {
            return Err(DbError::InvalidArgument(format!(
                "page payload {} exceeds {PAGE_DATA_SIZE} bytes",
                data.len()
            )));
        }
        self.data.fill(0);
        self.data[..data.len()].copy_from_slice(data);
        self.header.data_size = i32::try_from(data.len()).expect("payload fits in i32");
        Ok(())
    }

    /// Recompute the header checksum. Called before every serialization.
    pub fn seal(&mut self) {
        self.header.checksum = self.header.compute_checksum();
    }

    /// Serialize to the full on-disk image. Seals the header first.
    pub fn encode(&mut self) -> [u8; PAGE_SIZE] {
        self.seal();
        let mut buf = [0u8; PAGE_SIZE];
        buf[..PAGE_HEADER_SIZE].copy_from_slice(&self.header.encode());
        buf[PAGE_HEADER_SIZE..].copy_from_slice(&self.data);
        buf
    }

    /// Deserialize a full page image, verifying the header checksum for
    /// every page type except `Free`.
    ///
    /// # Errors
    /// `Corruption` on a short buffer, unknown type byte, or checksum
    /// mismatch.
    pub fn decode(buf: &[u8]) -> Result<Self, DbError> {
        if buf.len() < PAGE_SIZE {
            return Err(DbError::Corruption(format!("page truncated: {} bytes", buf.len())));
        }
        let header = PageHeader::decode(&buf[..PAGE_HEADER_SIZE])?;
        if header.page_type != PageType::Free && !header.verify_checksum() {
            return Err(DbError::Corruption(format!(
                "page {} checksum mismatch (stored {:#x}, computed {:#x})",
                header.page_id,
                header.checksum,
                header.compute_checksum()
            )));
        }
        Ok(Self { header, data: buf[PAGE_HEADER_SIZE..PAGE_SIZE].to_vec() })
    }
}
