use std::fmt;

use crate::{
    error::{ErrorKind, SmallError},
    io::{read_exact, Decodeable, SmallWriter},
    types::{Lsn, PageId, TxnId},
};

/// Size of the fixed header at the start of every page except page 0
/// (the meta page, which carries its own layout).
pub const PAGE_HEADER_SIZE: usize = 32;

/// Magic bytes at offset 0 of the meta page.
pub const FILE_MAGIC: &[u8; 8] = b"SMALLDOC";

/// On-disk format version.
pub const FILE_VERSION: u32 = 1;

#[derive(PartialEq, Copy, Clone, Eq, Hash)]
pub enum PageCategory {
    Meta,
    Data,
    IndexInternal,
    IndexLeaf,
    FreeList,
    Overflow,
    IdMap,
    Catalog,
}

impl PageCategory {
    pub fn to_u16(&self) -> u16 {
        match self {
            PageCategory::Meta => 1,
            PageCategory::Data => 2,
            PageCategory::IndexInternal => 3,
            PageCategory::IndexLeaf => 4,
            PageCategory::FreeList => 5,
            PageCategory::Overflow => 6,
            PageCategory::IdMap => 7,
            PageCategory::Catalog => 8,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self, SmallError> {
        match value {
            1 => Ok(PageCategory::Meta),
            2 => Ok(PageCategory::Data),
            3 => Ok(PageCategory::IndexInternal),
            4 => Ok(PageCategory::IndexLeaf),
            5 => Ok(PageCategory::FreeList),
            6 => Ok(PageCategory::Overflow),
            7 => Ok(PageCategory::IdMap),
            8 => Ok(PageCategory::Catalog),
            _ => Err(SmallError::new(
                ErrorKind::Corruption,
                &format!("invalid page type: {}", value),
            )),
        }
    }
}

impl fmt::Display for PageCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PageCategory::Meta => write!(f, "META"),
            PageCategory::Data => write!(f, "DATA"),
            PageCategory::IndexInternal => write!(f, "INDEX_INTERNAL"),
            PageCategory::IndexLeaf => write!(f, "INDEX_LEAF"),
            PageCategory::FreeList => write!(f, "FREE_LIST"),
            PageCategory::Overflow => write!(f, "OVERFLOW"),
            PageCategory::IdMap => write!(f, "ID_MAP"),
            PageCategory::Catalog => write!(f, "CATALOG"),
        }
    }
}

impl fmt::Debug for PageCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Fixed 32-byte header at the start of every non-meta page.
///
/// # Format
///
/// - 8 bytes: page id
/// - 2 bytes: page type
/// - 2 bytes: free bytes in the payload region
/// - 8 bytes: next page id of the chain this page belongs to (0 = none)
/// - 8 bytes: id of the last transaction that wrote the page
/// - 4 bytes: crc32 of the payload region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageHeader {
    pub page_id: PageId,
    pub category: PageCategory,
    pub free_bytes: u16,
    pub next_page_id: PageId,
    pub txn_id: TxnId,
    pub checksum: u32,
}

impl PageHeader {
    pub fn new(page_id: PageId, category: PageCategory) -> Self {
        Self {
            page_id,
            category,
            free_bytes: 0,
            next_page_id: 0,
            txn_id: 0,
            checksum: 0,
        }
    }

    /// Read the header out of a full page image.
    pub fn read_from_page(image: &[u8]) -> Result<Self, SmallError> {
        let mut reader = std::io::Cursor::new(&image[..PAGE_HEADER_SIZE]);
        let page_id = u64::decode_from(&mut reader);
        let category = PageCategory::from_u16(u16::decode_from(&mut reader))?;
        let free_bytes = u16::decode_from(&mut reader);
        let next_page_id = u64::decode_from(&mut reader);
        let txn_id = u64::decode_from(&mut reader);
        let checksum = u32::decode_from(&mut reader);
        Ok(Self {
            page_id,
            category,
            free_bytes,
            next_page_id,
            txn_id,
            checksum,
        })
    }

    /// Write the header into a full page image.
    pub fn write_to_page(&self, image: &mut [u8]) {
        let mut writer = SmallWriter::new();
        writer.write(&self.page_id);
        writer.write(&self.category.to_u16());
        writer.write(&self.free_bytes);
        writer.write(&self.next_page_id);
        writer.write(&self.txn_id);
        writer.write(&self.checksum);
        image[..PAGE_HEADER_SIZE].copy_from_slice(&writer.to_padded_bytes(PAGE_HEADER_SIZE));
    }
}

/// crc32 of a page's payload region (everything after the header).
pub fn payload_checksum(image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&image[PAGE_HEADER_SIZE..]);
    hasher.finalize()
}

/// Stamp `txn_id` and a fresh payload checksum into a page image.
/// Called once per staged page when a transaction enters its commit
/// sequence.
pub fn seal_page(image: &mut [u8], txn_id: TxnId) -> Result<(), SmallError> {
    let mut header = PageHeader::read_from_page(image)?;
    header.txn_id = txn_id;
    header.checksum = payload_checksum(image);
    header.write_to_page(image);
    Ok(())
}

/// Verify the stored payload checksum of a page image.
///
/// An all-zero header means the page was allocated past the old end of
/// file and never written; that is a valid empty page, not corruption.
pub fn verify_page(page_id: PageId, image: &[u8]) -> Result<(), SmallError> {
    if image[..PAGE_HEADER_SIZE].iter().all(|b| *b == 0) {
        return Ok(());
    }

    let header = PageHeader::read_from_page(image)?;
    let actual = payload_checksum(image);
    if header.checksum != actual {
        return Err(SmallError::new(
            ErrorKind::Corruption,
            &format!(
                "page {} checksum mismatch: stored {:08x}, actual {:08x}",
                page_id, header.checksum, actual
            ),
        ));
    }
    Ok(())
}

/// The content of page 0.
///
/// # Format
///
/// - 8 bytes: magic
/// - 4 bytes: format version
/// - 4 bytes: page size
/// - 8 bytes: free list head (0 = empty)
/// - 8 bytes: catalog root (0 = no collections yet)
/// - 8 bytes: checkpoint lsn
/// - 8 bytes: page watermark (first never-allocated page id)
/// - 4 bytes: crc32 of the preceding fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetaPage {
    pub page_size: u32,
    pub free_list_head: PageId,
    pub catalog_root: PageId,
    pub checkpoint_lsn: Lsn,
    pub page_watermark: PageId,
}

const META_CHECKED_LEN: usize = 48;

impl MetaPage {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            free_list_head: 0,
            catalog_root: 0,
            checkpoint_lsn: 0,
            // page 0 is the meta page itself
            page_watermark: 1,
        }
    }

    pub fn read_from_page(image: &[u8]) -> Result<Self, SmallError> {
        let mut reader = std::io::Cursor::new(image);

        let magic = read_exact(&mut reader, 8);
        if magic != FILE_MAGIC {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                &format!("bad file magic: {}", hex::encode(&magic)),
            ));
        }

        let version = u32::decode_from(&mut reader);
        if version != FILE_VERSION {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                &format!("unsupported file version: {}", version),
            ));
        }

        let page_size = u32::decode_from(&mut reader);
        let free_list_head = u64::decode_from(&mut reader);
        let catalog_root = u64::decode_from(&mut reader);
        let checkpoint_lsn = u64::decode_from(&mut reader);
        let page_watermark = u64::decode_from(&mut reader);
        let checksum = u32::decode_from(&mut reader);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&image[..META_CHECKED_LEN]);
        if checksum != hasher.finalize() {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                "meta page checksum mismatch",
            ));
        }

        Ok(Self {
            page_size,
            free_list_head,
            catalog_root,
            checkpoint_lsn,
            page_watermark,
        })
    }

    pub fn write_to_page(&self, image: &mut [u8]) {
        let mut writer = SmallWriter::new();
        writer.write_bytes(FILE_MAGIC);
        writer.write(&FILE_VERSION);
        writer.write(&self.page_size);
        writer.write(&self.free_list_head);
        writer.write(&self.catalog_root);
        writer.write(&self.checkpoint_lsn);
        writer.write(&self.page_watermark);
        debug_assert_eq!(writer.size(), META_CHECKED_LEN);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&writer.to_bytes());
        writer.write(&hasher.finalize());

        let bytes = writer.to_bytes();
        image[..bytes.len()].copy_from_slice(&bytes);
    }
}
