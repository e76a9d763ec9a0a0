use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use log::{debug, info, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{
    config::{AccessMode, DbConfig},
    error::{ErrorKind, SmallError},
    storage::page::{self, MetaPage},
    types::{PageId, SmallResult},
};

enum MapKind {
    Ro(Mmap),
    Rw(MmapMut),
}

impl MapKind {
    fn bytes(&self) -> &[u8] {
        match self {
            MapKind::Ro(map) => &map[..],
            MapKind::Rw(map) => &map[..],
        }
    }
}

/// The paged database file, memory-mapped.
///
/// Reads resolve directly against the mapped region. Writes copy into
/// the mapped region and reach disk on `flush` (or when the OS decides
/// to write back). The file grows in whole growth blocks to amortize
/// the remap cost.
///
/// Page allocation and the free-list chain are transactional and live
/// in `Transaction::allocate_page` / `free_page`: the free-list head
/// sits in the meta page, and meta mutations must flow through staged
/// page images so a crashed allocation replays (or vanishes) with its
/// transaction.
pub struct PageFile {
    path: PathBuf,
    file: File,
    map: MapKind,
    page_size: usize,
    growth_block: usize,
    access: AccessMode,
    capacity_pages: u64,
}

impl PageFile {
    /// Open or create the page file. For a fresh file the meta page is
    /// written immediately; for an existing file the stored page size
    /// wins over the configured one, and a torn tail from a crashed
    /// growth is truncated to the last whole page.
    pub fn open<P: AsRef<Path>>(path: P, config: &DbConfig) -> Result<PageFile, SmallError> {
        let path = path.as_ref().to_path_buf();
        let writable = config.access == AccessMode::ReadWrite;

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(&path)?;

        if writable {
            file.try_lock_exclusive()
                .map_err(|e| SmallError::io(&format!("cannot lock {:?}: {}", path, e)))?;
        } else {
            file.lock_shared()
                .map_err(|e| SmallError::io(&format!("cannot lock {:?}: {}", path, e)))?;
        }

        let len = file.metadata()?.len();
        let growth_block = config.growth_block.bytes();

        if len == 0 {
            if !writable {
                return Err(SmallError::io(&format!(
                    "cannot create {:?} in read-only mode",
                    path
                )));
            }
            return Self::create(path, file, config);
        }

        // learn the real page size from the meta page before any page
        // arithmetic
        let mut head = vec![0u8; 64];
        read_at(&file, 0, &mut head)?;
        let meta = MetaPage::read_from_page(&head)?;
        let page_size = meta.page_size as usize;

        let mut len = len;
        if len % page_size as u64 != 0 {
            let whole = len - (len % page_size as u64);
            warn!(
                "page file has a torn tail ({} bytes), truncating to {}",
                len, whole
            );
            if writable {
                file.set_len(whole)?;
            }
            len = whole;
        }

        let map = Self::map_file(&file, writable, len as usize)?;

        info!(
            "opened page file {:?}: page_size={}, pages={}, watermark={}",
            path,
            page_size,
            len / page_size as u64,
            meta.page_watermark
        );

        Ok(PageFile {
            path,
            file,
            map,
            page_size,
            growth_block,
            access: config.access,
            capacity_pages: len / page_size as u64,
        })
    }

    fn create(path: PathBuf, file: File, config: &DbConfig) -> Result<PageFile, SmallError> {
        let page_size = config.page_size.bytes();
        let growth_block = config.growth_block.bytes();

        file.set_len(growth_block as u64)?;
        let mut map = match Self::map_file(&file, true, growth_block)? {
            MapKind::Rw(map) => map,
            MapKind::Ro(_) => unreachable!(),
        };

        let meta = MetaPage::new(page_size as u32);
        meta.write_to_page(&mut map[..page_size]);
        map.flush()?;

        info!(
            "created page file {:?}: page_size={}, initial bytes={}",
            path, page_size, growth_block
        );

        Ok(PageFile {
            path,
            file,
            map: MapKind::Rw(map),
            page_size,
            growth_block,
            access: config.access,
            capacity_pages: (growth_block / page_size) as u64,
        })
    }

    fn map_file(file: &File, writable: bool, len: usize) -> Result<MapKind, SmallError> {
        if writable {
            let map = unsafe { MmapOptions::new().len(len).map_mut(file) }
                .map_err(|e| SmallError::io(&format!("mmap failed: {}", e)))?;
            Ok(MapKind::Rw(map))
        } else {
            let map = unsafe { MmapOptions::new().len(len).map(file) }
                .map_err(|e| SmallError::io(&format!("mmap failed: {}", e)))?;
            Ok(MapKind::Ro(map))
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity_pages(&self) -> u64 {
        self.capacity_pages
    }

    pub fn is_writable(&self) -> bool {
        self.access == AccessMode::ReadWrite
    }

    fn check_bounds(&self, page_id: PageId) -> SmallResult {
        if page_id >= self.capacity_pages {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                &format!(
                    "page {} out of bounds (capacity {})",
                    page_id, self.capacity_pages
                ),
            ));
        }
        Ok(())
    }

    /// Borrow a page straight out of the mapped region (zero-copy).
    /// The payload checksum is verified before the slice is handed out.
    pub fn page_slice(&self, page_id: PageId) -> Result<&[u8], SmallError> {
        self.check_bounds(page_id)?;
        let start = page_id as usize * self.page_size;
        let slice = &self.map.bytes()[start..start + self.page_size];
        if page_id != 0 {
            page::verify_page(page_id, slice)?;
        }
        Ok(slice)
    }

    /// Copy a page into `dest`, verifying the payload checksum.
    pub fn read_page(&self, page_id: PageId, dest: &mut [u8]) -> SmallResult {
        let slice = self.page_slice(page_id)?;
        dest[..self.page_size].copy_from_slice(slice);
        Ok(())
    }

    /// Copy a page image into the mapped region, growing the file when
    /// the page lies past the current capacity. Only the checkpoint
    /// path and recovery write here; everything else stages images in a
    /// transaction.
    pub fn write_page(&mut self, page_id: PageId, src: &[u8]) -> SmallResult {
        if self.access == AccessMode::Read {
            return Err(SmallError::new(
                ErrorKind::ReadOnly,
                "write_page on a read-only page file",
            ));
        }
        if page_id >= self.capacity_pages {
            self.ensure_capacity(page_id + 1)?;
        }

        let start = page_id as usize * self.page_size;
        match &mut self.map {
            MapKind::Rw(map) => {
                map[start..start + self.page_size].copy_from_slice(&src[..self.page_size]);
                Ok(())
            }
            MapKind::Ro(_) => unreachable!(),
        }
    }

    /// Grow the file (in whole growth blocks) until it holds at least
    /// `pages` pages, then remap.
    pub fn ensure_capacity(&mut self, pages: u64) -> SmallResult {
        if pages <= self.capacity_pages {
            return Ok(());
        }
        if self.access == AccessMode::Read {
            return Err(SmallError::new(
                ErrorKind::ReadOnly,
                "cannot grow a read-only page file",
            ));
        }

        let needed = pages * self.page_size as u64;
        let mut new_len = self.capacity_pages * self.page_size as u64;
        while new_len < needed {
            new_len += self.growth_block as u64;
        }

        // flush before dropping the old map so no dirty bytes are lost
        // if the remap fails
        if let MapKind::Rw(map) = &self.map {
            map.flush()?;
        }

        self.file.set_len(new_len).map_err(|e| {
            SmallError::new(
                ErrorKind::Capacity,
                &format!("cannot grow {:?} to {} bytes: {}", self.path, new_len, e),
            )
        })?;
        self.map = Self::map_file(&self.file, true, new_len as usize)?;
        self.capacity_pages = new_len / self.page_size as u64;

        debug!(
            "grew page file {:?} to {} bytes ({} pages)",
            self.path, new_len, self.capacity_pages
        );
        Ok(())
    }

    pub fn read_meta(&self) -> Result<MetaPage, SmallError> {
        MetaPage::read_from_page(&self.map.bytes()[..self.page_size])
    }

    /// Rewrite page 0. Used at creation and by the checkpoint when it
    /// advances `checkpoint_lsn`; regular meta mutations (free list,
    /// catalog root, watermark) travel as staged images through the WAL.
    pub fn write_meta(&mut self, meta: &MetaPage) -> SmallResult {
        let mut image = vec![0u8; self.page_size];
        meta.write_to_page(&mut image);
        self.write_page(0, &image)
    }

    /// msync the whole mapping.
    pub fn flush(&self) -> SmallResult {
        if let MapKind::Rw(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}

fn read_at(file: &File, offset: u64, dest: &mut [u8]) -> SmallResult {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{seal_page, PageCategory, PageHeader};

    fn config() -> DbConfig {
        let mut config = DbConfig::default();
        config.page_size = crate::config::PageSize::Small;
        config.growth_block = crate::config::GrowthBlock::Small;
        config
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");

        {
            let file = PageFile::open(&path, &config()).unwrap();
            let meta = file.read_meta().unwrap();
            assert_eq!(meta.page_size, 8192);
            assert_eq!(meta.page_watermark, 1);
        }

        let file = PageFile::open(&path, &config()).unwrap();
        assert_eq!(file.page_size(), 8192);
        assert_eq!(file.capacity_pages(), 64);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let mut file = PageFile::open(&path, &config()).unwrap();

        let mut image = vec![0u8; 8192];
        PageHeader::new(3, PageCategory::Data).write_to_page(&mut image);
        image[100] = 0xab;
        seal_page(&mut image, 1).unwrap();

        file.write_page(3, &image).unwrap();

        let mut out = vec![0u8; 8192];
        file.read_page(3, &mut out).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn test_growth_past_initial_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let mut file = PageFile::open(&path, &config()).unwrap();
        assert_eq!(file.capacity_pages(), 64);

        let mut image = vec![0u8; 8192];
        PageHeader::new(100, PageCategory::Data).write_to_page(&mut image);
        seal_page(&mut image, 1).unwrap();
        file.write_page(100, &image).unwrap();

        assert_eq!(file.capacity_pages(), 128);
        let mut out = vec![0u8; 8192];
        file.read_page(100, &mut out).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        {
            let _ = PageFile::open(&path, &config()).unwrap();
        }

        // simulate a crash in the middle of a growth: a ragged tail
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len + 1234).unwrap();
        drop(file);

        let file = PageFile::open(&path, &config()).unwrap();
        assert_eq!(file.capacity_pages(), 64);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        {
            let _ = PageFile::open(&path, &config()).unwrap();
        }

        let mut ro_config = config();
        ro_config.access = AccessMode::Read;
        let mut file = PageFile::open(&path, &ro_config).unwrap();

        let image = vec![0u8; 8192];
        let err = file.write_page(1, &image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
    }

    #[test]
    fn test_corrupted_page_fails_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        {
            let mut file = PageFile::open(&path, &config()).unwrap();
            let mut image = vec![0u8; 8192];
            PageHeader::new(2, PageCategory::Data).write_to_page(&mut image);
            seal_page(&mut image, 1).unwrap();
            // flip a payload byte after sealing
            image[5000] ^= 0xff;
            file.write_page(2, &image).unwrap();
            file.flush().unwrap();
        }

        let file = PageFile::open(&path, &config()).unwrap();
        let mut out = vec![0u8; 8192];
        let err = file.read_page(2, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }
}
