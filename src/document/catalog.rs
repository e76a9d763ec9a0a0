use std::{collections::BTreeMap, convert::TryInto};

use log::debug;

use crate::{
    document::doc_id::IdKind,
    error::{ErrorKind, SmallError},
    io::{Decodeable, SmallWriter},
    storage::page::{PageCategory, PageHeader, PAGE_HEADER_SIZE},
    transaction::Transaction,
    types::{PageId, SmallResult},
};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub field: String,
    pub unique: bool,
    pub root: PageId,
}

/// Catalog entry of one collection: the roots everything else hangs
/// off, plus the live document count and the schema stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    pub name: String,
    pub id_kind: IdKind,
    pub id_map_root: PageId,

    /// Head of the chain of data pages; fresh pages are pushed to the
    /// front so inserts find free space early in the walk.
    pub data_head: PageId,

    pub indexes: Vec<IndexDef>,
    pub doc_count: u64,
    pub schema_version: u32,
    pub schema_hash: u32,
}

impl CollectionMeta {
    pub fn new(name: &str, id_kind: IdKind) -> Self {
        Self {
            name: name.to_string(),
            id_kind,
            id_map_root: 0,
            data_head: 0,
            indexes: Vec::new(),
            doc_count: 0,
            schema_version: 0,
            schema_hash: 0,
        }
    }

    pub fn index(&self, field: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|def| def.field == field)
    }
}

/// The collection registry, persisted as a chain of catalog pages
/// rooted in the meta page.
///
/// The in-memory copy always reflects committed state; transactions
/// mutate a clone-on-write patch that replaces it at commit.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    collections: BTreeMap<String, CollectionMeta>,

    /// Pages of the persisted chain, reused on rewrite.
    pages: Vec<PageId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CollectionMeta> {
        self.collections.get_mut(name)
    }

    pub fn insert(&mut self, meta: CollectionMeta) {
        self.collections.insert(meta.name.clone(), meta);
    }

    pub fn remove(&mut self, name: &str) -> Option<CollectionMeta> {
        self.collections.remove(name)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        if self.collections.contains_key(new) {
            return false;
        }
        match self.collections.remove(old) {
            None => false,
            Some(mut meta) => {
                meta.name = new.to_string();
                self.collections.insert(new.to_string(), meta);
                true
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub(crate) fn pages(&self) -> &[PageId] {
        &self.pages
    }

    pub(crate) fn set_pages(&mut self, pages: Vec<PageId>) {
        self.pages = pages;
    }

    pub(crate) fn encode_entries(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        writer.write(&(self.collections.len() as u32));
        for meta in self.collections.values() {
            writer.write(&meta.name);
            writer.write(&meta.id_kind.to_u8());
            writer.write(&meta.id_map_root);
            writer.write(&meta.data_head);
            writer.write(&meta.doc_count);
            writer.write(&meta.schema_version);
            writer.write(&meta.schema_hash);
            writer.write(&(meta.indexes.len() as u16));
            for def in &meta.indexes {
                writer.write(&def.field);
                writer.write(&(def.unique as u8));
                writer.write(&def.root);
            }
        }
        writer.to_bytes()
    }

    pub(crate) fn decode_entries(bytes: &[u8]) -> Result<Catalog, SmallError> {
        let mut reader = std::io::Cursor::new(bytes);
        let count = u32::decode_from(&mut reader);
        let mut collections = BTreeMap::new();
        for _ in 0..count {
            let name = String::decode_from(&mut reader);
            let id_kind = IdKind::from_u8(u8::decode_from(&mut reader))?;
            let id_map_root = u64::decode_from(&mut reader);
            let data_head = u64::decode_from(&mut reader);
            let doc_count = u64::decode_from(&mut reader);
            let schema_version = u32::decode_from(&mut reader);
            let schema_hash = u32::decode_from(&mut reader);
            let index_count = u16::decode_from(&mut reader);
            let mut indexes = Vec::with_capacity(index_count as usize);
            for _ in 0..index_count {
                indexes.push(IndexDef {
                    field: String::decode_from(&mut reader),
                    unique: u8::decode_from(&mut reader) != 0,
                    root: u64::decode_from(&mut reader),
                });
            }
            collections.insert(
                name.clone(),
                CollectionMeta {
                    name,
                    id_kind,
                    id_map_root,
                    data_head,
                    indexes,
                    doc_count,
                    schema_version,
                    schema_hash,
                },
            );
        }
        Ok(Catalog {
            collections,
            pages: Vec::new(),
        })
    }
}

/// Rewrite the catalog chain from the transaction's patch, growing or
/// shrinking the chain as needed and re-rooting the meta page when the
/// head moves.
pub(crate) fn persist_catalog(tx: &mut Transaction) -> SmallResult {
    let bytes = tx.catalog_mut().encode_entries();
    let mut pages = tx.catalog_mut().pages().to_vec();

    let chunk_capacity = tx.page_size() - PAGE_HEADER_SIZE - 4;
    let chunks: Vec<Vec<u8>> = bytes.chunks(chunk_capacity).map(|c| c.to_vec()).collect();

    while pages.len() < chunks.len() {
        let page_id = tx.allocate_page(PageCategory::Catalog)?;
        pages.push(page_id);
    }
    while pages.len() > chunks.len() {
        let page_id = pages.pop().unwrap();
        tx.free_page(page_id)?;
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let next = if i + 1 < pages.len() { pages[i + 1] } else { 0 };
        let image = tx.get_mut_page(pages[i])?;

        let mut header = PageHeader::read_from_page(image)?;
        header.category = PageCategory::Catalog;
        header.next_page_id = next;
        header.free_bytes = 0;
        header.write_to_page(image);

        let body = &mut image[PAGE_HEADER_SIZE..];
        body[..4].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        body[4..4 + chunk.len()].copy_from_slice(chunk);
        for byte in body[4 + chunk.len()..].iter_mut() {
            *byte = 0;
        }
    }

    let root = pages.first().copied().unwrap_or(0);
    tx.catalog_mut().set_pages(pages);

    let mut meta = tx.read_meta()?;
    if meta.catalog_root != root {
        meta.catalog_root = root;
        tx.stage_meta(&meta)?;
    }
    Ok(())
}

/// Walk the catalog chain and rebuild the registry. `read` resolves a
/// page id to its current committed image (overlay included).
pub(crate) fn load_catalog<F>(read: F, root: PageId) -> Result<Catalog, SmallError>
where
    F: Fn(PageId) -> Result<Vec<u8>, SmallError>,
{
    let mut bytes = Vec::new();
    let mut pages = Vec::new();
    let mut page_id = root;

    while page_id != 0 {
        let image = read(page_id)?;
        let header = PageHeader::read_from_page(&image)?;
        if header.category != PageCategory::Catalog {
            return Err(SmallError::new(
                ErrorKind::Corruption,
                &format!("page {} is not a catalog page", page_id),
            ));
        }
        let body = &image[PAGE_HEADER_SIZE..];
        let len = u32::from_le_bytes(body[..4].try_into().unwrap()) as usize;
        bytes.extend_from_slice(&body[4..4 + len]);
        pages.push(page_id);
        page_id = header.next_page_id;
    }

    let mut catalog = Catalog::decode_entries(&bytes)?;
    catalog.set_pages(pages);
    debug!(
        "catalog loaded: {} collection(s) on {} page(s)",
        catalog.len(),
        catalog.pages().len()
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut catalog = Catalog::new();
        let mut users = CollectionMeta::new("users", IdKind::Int64);
        users.id_map_root = 4;
        users.data_head = 9;
        users.doc_count = 12;
        users.indexes.push(IndexDef {
            field: "age".to_string(),
            unique: false,
            root: 11,
        });
        users.indexes.push(IndexDef {
            field: "email".to_string(),
            unique: true,
            root: 13,
        });
        catalog.insert(users);
        catalog.insert(CollectionMeta::new("orders", IdKind::ObjectId));

        let bytes = catalog.encode_entries();
        let decoded = Catalog::decode_entries(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get("users"), catalog.get("users"));
        assert_eq!(decoded.get("orders"), catalog.get("orders"));
    }

    #[test]
    fn test_rename_refuses_collision() {
        let mut catalog = Catalog::new();
        catalog.insert(CollectionMeta::new("a", IdKind::Int64));
        catalog.insert(CollectionMeta::new("b", IdKind::Int64));

        assert!(!catalog.rename("a", "b"));
        assert!(catalog.rename("a", "c"));
        assert!(catalog.get("c").is_some());
        assert_eq!(catalog.get("c").unwrap().name, "c");
        assert!(catalog.get("a").is_none());
    }

    #[test]
    fn test_empty_catalog_round_trip() {
        let bytes = Catalog::new().encode_entries();
        let decoded = Catalog::decode_entries(&bytes).unwrap();
        assert_eq!(decoded.len(), 0);
    }
}
