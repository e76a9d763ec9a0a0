//! Overflow chains for payloads too large for a single data page.
//!
//! Each overflow page body is `chunk_len u32 | chunk bytes`, pages are
//! linked through the header's `next_page_id`, and the owning data
//! slot records the total length plus the first page of the chain.

use std::convert::TryInto;

use log::debug;

use crate::{
    error::{ErrorKind, SmallError},
    storage::page::{PageCategory, PageHeader, PAGE_HEADER_SIZE},
    transaction::Transaction,
    types::PageId,
};

fn chunk_capacity(tx: &Transaction) -> usize {
    tx.page_size() - PAGE_HEADER_SIZE - 4
}

/// Spill `payload` into a fresh chain. Returns the first page id.
pub(crate) fn write_chain(tx: &mut Transaction, payload: &[u8]) -> Result<PageId, SmallError> {
    debug_assert!(!payload.is_empty());
    let capacity = chunk_capacity(tx);
    let chunks: Vec<&[u8]> = payload.chunks(capacity).collect();

    let mut pages = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        pages.push(tx.allocate_page(PageCategory::Overflow)?);
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let next = if i + 1 < pages.len() { pages[i + 1] } else { 0 };
        let image = tx.get_mut_page(pages[i])?;

        let mut header = PageHeader::read_from_page(image)?;
        header.next_page_id = next;
        header.write_to_page(image);

        let body = &mut image[PAGE_HEADER_SIZE..];
        body[..4].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        body[4..4 + chunk.len()].copy_from_slice(chunk);
    }

    debug!(
        "overflow chain written: {} bytes over {} page(s), head {}",
        payload.len(),
        pages.len(),
        pages[0]
    );
    Ok(pages[0])
}

/// Reassemble a payload from its chain.
pub(crate) fn read_chain(
    tx: &Transaction,
    first_page: PageId,
    total_len: usize,
) -> Result<Vec<u8>, SmallError> {
    let mut payload = Vec::with_capacity(total_len);
    let mut page_id = first_page;

    while page_id != 0 {
        let image = tx.read_page(page_id)?;
        let header = PageHeader::read_from_page(&image)?;
        if header.category != PageCategory::Overflow {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                &format!("page {} is not an overflow page", page_id),
            ));
        }
        let body = &image[PAGE_HEADER_SIZE..];
        let len = u32::from_le_bytes(body[..4].try_into().unwrap()) as usize;
        payload.extend_from_slice(&body[4..4 + len]);
        page_id = header.next_page_id;
    }

    if payload.len() != total_len {
        return Err(SmallError::new(
            ErrorKind::Corruption,
            &format!(
                "overflow chain at {} yields {} bytes, expected {}",
                first_page,
                payload.len(),
                total_len
            ),
        ));
    }
    Ok(payload)
}

/// Release every page of a chain. Returns how many were freed.
pub(crate) fn free_chain(tx: &mut Transaction, first_page: PageId) -> Result<usize, SmallError> {
    let mut page_id = first_page;
    let mut freed = 0;

    while page_id != 0 {
        let image = tx.read_page(page_id)?;
        let header = PageHeader::read_from_page(&image)?;
        let next = header.next_page_id;
        tx.free_page(page_id)?;
        freed += 1;
        page_id = next;
    }

    debug!("overflow chain at {} freed ({} pages)", first_page, freed);
    Ok(freed)
}
