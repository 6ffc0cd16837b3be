//! B-tree constants, page-kind tags, and the database header
//!
//! Every B-tree page carries a one-byte kind tag at its header offset
//! (offset 100 on page 1, 0 elsewhere). The tag composes four bits:
//! integer-keyed, zero-data, data-on-leaves, leaf. Overflow and free-list
//! pages are reached only through typed pointers and carry no tag.

use crate::config::TextEncoding;
use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u16, read_u32, write_u16, write_u32};

// Page kind flag bits
pub const PTF_INTKEY: u8 = 0x01;
pub const PTF_ZERODATA: u8 = 0x02;
pub const PTF_LEAFDATA: u8 = 0x04;
pub const PTF_LEAF: u8 = 0x08;

// The four tag values
pub const PTF_TABLE_LEAF: u8 = PTF_INTKEY | PTF_LEAFDATA | PTF_LEAF;
pub const PTF_TABLE_INTERIOR: u8 = PTF_INTKEY | PTF_LEAFDATA;
pub const PTF_INDEX_LEAF: u8 = PTF_ZERODATA | PTF_LEAF;
pub const PTF_INDEX_INTERIOR: u8 = PTF_ZERODATA;

// Page header layout
pub const PAGE_HDR_FLAGS: usize = 0;
pub const PAGE_HDR_FREEBLOCK: usize = 1;
pub const PAGE_HDR_NCELL: usize = 3;
pub const PAGE_HDR_CONTENT_START: usize = 5;
pub const PAGE_HDR_FRAG_BYTES: usize = 7;
pub const PAGE_HDR_RIGHT_CHILD: usize = 8;

pub const PAGE_HEADER_SIZE_LEAF: usize = 8;
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;
pub const CELL_PTR_SIZE: usize = 2;

/// Embedded-payload tuning constants (fractions of usable space, /255)
pub const MAX_EMBEDDED: u32 = 64;
pub const MIN_EMBEDDED: u32 = 32;

/// Offset of the B-tree header on page 1 (the database header precedes it)
pub const PAGE1_HEADER_OFFSET: usize = 100;

/// 16-byte magic at the start of every database file
pub const FILE_MAGIC: &[u8; 16] = b"Strata format 1\0";

/// Current file format version
pub const FILE_FORMAT_VERSION: u8 = 1;

/// Smallest number of cells a non-root page should keep; pages below
/// one third of their cell budget trigger a balance.
pub const MIN_FILL_DIVISOR: u32 = 3;

// Database header field offsets (page 1, bytes 0..100)
pub const DBH_MAGIC: usize = 0;
pub const DBH_PAGE_SIZE: usize = 16;
pub const DBH_FILE_FORMAT: usize = 18;
pub const DBH_TEXT_ENCODING: usize = 19;
pub const DBH_RESERVED_BYTES: usize = 20;
pub const DBH_CHANGE_COUNTER: usize = 24;
pub const DBH_SCHEMA_COOKIE: usize = 28;
pub const DBH_USER_COOKIE: usize = 32;
pub const DBH_FREELIST_TRUNK: usize = 36;
pub const DBH_FREELIST_COUNT: usize = 40;
pub const DBH_PAGE_COUNT: usize = 44;

/// Transaction states of a tree handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransState {
    None = 0,
    Read = 1,
    Write = 2,
}

/// Cursor position states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CursorPos {
    /// Positioned on an existing cell
    Valid,
    /// Before first / after last / empty tree
    Invalid,
    /// The tree changed underneath; the cursor must re-seek before use
    RequireSeek,
}

/// Metadata fields stored in the database header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaField {
    SchemaCookie,
    UserCookie,
    FreelistTrunk,
    FreelistCount,
    PageCount,
}

impl MetaField {
    pub fn offset(self) -> usize {
        match self {
            MetaField::SchemaCookie => DBH_SCHEMA_COOKIE,
            MetaField::UserCookie => DBH_USER_COOKIE,
            MetaField::FreelistTrunk => DBH_FREELIST_TRUNK,
            MetaField::FreelistCount => DBH_FREELIST_COUNT,
            MetaField::PageCount => DBH_PAGE_COUNT,
        }
    }
}

// ============================================================================
// Page limits
// ============================================================================

/// Geometry of one page: size, usable size, and header offset (100 on
/// page 1, 0 elsewhere).
#[derive(Clone, Copy, Debug)]
pub struct PageLimits {
    pub page_size: u32,
    pub usable_size: u32,
    pub header_offset: usize,
}

impl PageLimits {
    pub fn new(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: 0,
        }
    }

    pub fn for_page1(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: PAGE1_HEADER_OFFSET,
        }
    }

    pub fn for_page(page_size: u32, usable_size: u32, pgno: Pgno) -> Self {
        if pgno == 1 {
            Self::for_page1(page_size, usable_size)
        } else {
            Self::new(page_size, usable_size)
        }
    }

    /// Largest payload stored entirely within a leaf or interior cell.
    pub fn max_local(&self, is_leaf: bool) -> u32 {
        let usable = self.usable_size;
        if is_leaf {
            (usable.saturating_sub(35).saturating_mul(MAX_EMBEDDED) / 255).saturating_sub(23)
        } else {
            (usable.saturating_sub(12).saturating_mul(MAX_EMBEDDED) / 255).saturating_sub(23)
        }
    }

    /// Smallest local portion of a payload that spills to overflow pages.
    pub fn min_local(&self) -> u32 {
        (self
            .usable_size
            .saturating_sub(12)
            .saturating_mul(MIN_EMBEDDED)
            / 255)
            .saturating_sub(23)
    }

    /// Bytes of overflow payload per chain page (4 bytes go to the link).
    pub fn overflow_capacity(&self) -> u32 {
        self.usable_size - 4
    }
}

// ============================================================================
// Database header
// ============================================================================

/// Parsed page-1 database header.
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_size: u32,
    pub file_format: u8,
    pub text_encoding: TextEncoding,
    pub reserved_bytes: u8,
    pub change_counter: u32,
    pub schema_cookie: u32,
    pub user_cookie: u32,
    pub freelist_trunk: Pgno,
    pub freelist_count: u32,
    pub page_count: u32,
}

impl DbHeader {
    /// Fresh header for a database being created.
    pub fn new(page_size: u32, reserved_bytes: u8, text_encoding: TextEncoding) -> Self {
        Self {
            page_size,
            file_format: FILE_FORMAT_VERSION,
            text_encoding,
            reserved_bytes,
            change_counter: 0,
            schema_cookie: 0,
            user_cookie: 0,
            freelist_trunk: 0,
            freelist_count: 0,
            page_count: 1,
        }
    }

    /// Parse and validate the header from page 1.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PAGE1_HEADER_OFFSET {
            return Err(Error::with_message(ErrorCode::Corrupt, "page 1 too small"));
        }
        if &data[DBH_MAGIC..DBH_MAGIC + 16] != FILE_MAGIC {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!(
                    "bad file magic: {}",
                    hex::encode(&data[DBH_MAGIC..DBH_MAGIC + 16])
                ),
            ));
        }

        let raw = read_u16(data, DBH_PAGE_SIZE).ok_or_else(|| Error::new(ErrorCode::Corrupt))?;
        let page_size = if raw == 1 { 65536 } else { raw as u32 };
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("bad page size {}", page_size),
            ));
        }

        let file_format = data[DBH_FILE_FORMAT];
        if file_format > FILE_FORMAT_VERSION {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("unsupported file format {}", file_format),
            ));
        }

        let text_encoding = TextEncoding::from_u8(data[DBH_TEXT_ENCODING])
            .ok_or_else(|| Error::with_message(ErrorCode::Corrupt, "bad text encoding"))?;

        Ok(Self {
            page_size,
            file_format,
            text_encoding,
            reserved_bytes: data[DBH_RESERVED_BYTES],
            change_counter: read_u32(data, DBH_CHANGE_COUNTER).unwrap_or(0),
            schema_cookie: read_u32(data, DBH_SCHEMA_COOKIE).unwrap_or(0),
            user_cookie: read_u32(data, DBH_USER_COOKIE).unwrap_or(0),
            freelist_trunk: read_u32(data, DBH_FREELIST_TRUNK).unwrap_or(0),
            freelist_count: read_u32(data, DBH_FREELIST_COUNT).unwrap_or(0),
            page_count: read_u32(data, DBH_PAGE_COUNT).unwrap_or(0),
        })
    }

    /// Write the header into the first 100 bytes of page 1.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < PAGE1_HEADER_OFFSET {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        data[..PAGE1_HEADER_OFFSET].fill(0);
        data[DBH_MAGIC..DBH_MAGIC + 16].copy_from_slice(FILE_MAGIC);
        let encoded_size = if self.page_size == 65536 {
            1u16
        } else {
            self.page_size as u16
        };
        write_u16(data, DBH_PAGE_SIZE, encoded_size)?;
        data[DBH_FILE_FORMAT] = self.file_format;
        data[DBH_TEXT_ENCODING] = self.text_encoding as u8;
        data[DBH_RESERVED_BYTES] = self.reserved_bytes;
        write_u32(data, DBH_CHANGE_COUNTER, self.change_counter)?;
        write_u32(data, DBH_SCHEMA_COOKIE, self.schema_cookie)?;
        write_u32(data, DBH_USER_COOKIE, self.user_cookie)?;
        write_u32(data, DBH_FREELIST_TRUNK, self.freelist_trunk)?;
        write_u32(data, DBH_FREELIST_COUNT, self.freelist_count)?;
        write_u32(data, DBH_PAGE_COUNT, self.page_count)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
