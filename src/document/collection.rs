use std::{collections::VecDeque, convert::TryInto, sync::Arc};

use bytes::Bytes;
use log::debug;

use crate::{
    btree::{key, BTree},
    database::DbContext,
    document::{
        catalog::{persist_catalog, CollectionMeta, IndexDef},
        doc_id::{DocId, IdKind},
        overflow,
        record::{self, Record},
    },
    error::{ErrorKind, SmallError},
    storage::{
        page::{PageCategory, PageHeader, PAGE_HEADER_SIZE},
        slotted::{SlottedPage, SlottedPageMut},
    },
    stream::{ChangeEvent, OpType, Subscription},
    transaction::Transaction,
    types::{PageId, SlotIndex, SmallResult},
    utils::now_millis,
};

const SLOT_INLINE: u8 = 0;
const SLOT_OVERFLOW: u8 = 1;

/// A record as stored in a data page slot: the document id followed by
/// either the inline payload or the root of an overflow chain.
///
/// # Format
///
/// - 1 byte: flags (inline / overflow)
/// - 1 byte: id kind
/// - 2 bytes: id length
/// - id bytes
/// - inline: `payload_len u32 | payload`
/// - overflow: `total_len u64 | first_overflow_page u64`
pub(crate) struct SlotRecord {
    pub id: DocId,
    pub body: SlotBody,
}

pub(crate) enum SlotBody {
    Inline(Vec<u8>),
    Overflow { total_len: u64, first_page: PageId },
}

impl SlotRecord {
    fn encode(&self) -> Vec<u8> {
        let id_bytes = self.id.to_bytes();
        let mut out = Vec::new();
        match &self.body {
            SlotBody::Inline(_) => out.push(SLOT_INLINE),
            SlotBody::Overflow { .. } => out.push(SLOT_OVERFLOW),
        }
        out.push(self.id.kind().to_u8());
        out.extend_from_slice(&(id_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&id_bytes);
        match &self.body {
            SlotBody::Inline(payload) => {
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
            }
            SlotBody::Overflow {
                total_len,
                first_page,
            } => {
                out.extend_from_slice(&total_len.to_le_bytes());
                out.extend_from_slice(&first_page.to_le_bytes());
            }
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<SlotRecord, SmallError> {
        let corrupt = || SmallError::new(ErrorKind::Corruption, "malformed document slot");
        if bytes.len() < 4 {
            return Err(corrupt());
        }
        let flags = bytes[0];
        let kind = IdKind::from_u8(bytes[1])?;
        let id_len = u16::from_le_bytes(bytes[2..4].try_into().unwrap()) as usize;
        if bytes.len() < 4 + id_len {
            return Err(corrupt());
        }
        let id = DocId::from_bytes(kind, &bytes[4..4 + id_len])?;
        let rest = &bytes[4 + id_len..];

        let body = match flags {
            SLOT_INLINE => {
                if rest.len() < 4 {
                    return Err(corrupt());
                }
                let len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
                if rest.len() < 4 + len {
                    return Err(corrupt());
                }
                SlotBody::Inline(rest[4..4 + len].to_vec())
            }
            SLOT_OVERFLOW => {
                if rest.len() < 16 {
                    return Err(corrupt());
                }
                SlotBody::Overflow {
                    total_len: u64::from_le_bytes(rest[..8].try_into().unwrap()),
                    first_page: u64::from_le_bytes(rest[8..16].try_into().unwrap()),
                }
            }
            _ => return Err(corrupt()),
        };
        Ok(SlotRecord { id, body })
    }
}

fn encode_location(page_id: PageId, slot: SlotIndex) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(&page_id.to_le_bytes());
    out.extend_from_slice(&slot.to_le_bytes());
    out
}

fn decode_location(bytes: &[u8]) -> Result<(PageId, SlotIndex), SmallError> {
    if bytes.len() != 10 {
        return Err(SmallError::new(
            ErrorKind::Corruption,
            "malformed id-map location",
        ));
    }
    Ok((
        u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
    ))
}

/// A typed handle onto one collection. Cheap to clone; all operations
/// run inside a caller-provided transaction.
#[derive(Clone)]
pub struct Collection {
    name: String,
    ctx: Arc<DbContext>,
}

impl Collection {
    pub(crate) fn new(name: &str, ctx: Arc<DbContext>) -> Self {
        Self {
            name: name.to_string(),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn meta(&self, tx: &Transaction) -> Option<CollectionMeta> {
        tx.collection_meta(&self.name)
    }

    /// Start building a query over this collection.
    pub fn query(&self) -> crate::query::Query {
        crate::query::Query::new(self.clone())
    }

    /// All documents matching a predicate, through the planner.
    pub fn find(
        &self,
        tx: &Transaction,
        predicate: crate::query::Expr,
    ) -> Result<Vec<(DocId, Record)>, SmallError> {
        self.query().filter(predicate).to_vec(tx)
    }

    /// Create the catalog entry on first use. The id kind is taken
    /// from the first explicitly supplied id, object-id otherwise.
    fn ensure_created(
        &self,
        tx: &mut Transaction,
        kind_hint: Option<IdKind>,
    ) -> Result<CollectionMeta, SmallError> {
        if let Some(meta) = self.meta(tx) {
            return Ok(meta);
        }
        let meta = CollectionMeta::new(&self.name, kind_hint.unwrap_or(IdKind::ObjectId));
        tx.catalog_mut().insert(meta.clone());
        persist_catalog(tx)?;
        debug!(
            "collection {} created (id kind {:?})",
            self.name,
            meta.id_kind
        );
        Ok(meta)
    }

    pub(crate) fn create_with_kind(&self, tx: &mut Transaction, kind: IdKind) -> SmallResult {
        self.ensure_created(tx, Some(kind)).map(|_| ())
    }

    fn generate_id(
        &self,
        tx: &Transaction,
        meta: &CollectionMeta,
    ) -> Result<DocId, SmallError> {
        match meta.id_kind {
            IdKind::ObjectId => Ok(DocId::new_object_id()),
            IdKind::Guid => Ok(DocId::new_guid()),
            IdKind::String => Ok(DocId::new_string()),
            IdKind::Int64 => {
                // resume after the greatest id currently in the map
                let id_map = BTree::id_map(meta.id_map_root);
                match id_map.last_entry(tx)? {
                    None => Ok(DocId::Int64(1)),
                    Some((key_bytes, _)) => match DocId::from_bytes(IdKind::Int64, &key_bytes)? {
                        DocId::Int64(v) => Ok(DocId::Int64(v + 1)),
                        _ => unreachable!(),
                    },
                }
            }
        }
    }

    /// Store a document. Fails with `DuplicateKey` when the id is
    /// already present or a unique index would be violated.
    pub fn insert(
        &self,
        tx: &mut Transaction,
        id: Option<DocId>,
        record: &Record,
    ) -> Result<DocId, SmallError> {
        self.insert_encoded(tx, id, record.encode())
    }

    fn insert_encoded(
        &self,
        tx: &mut Transaction,
        id: Option<DocId>,
        payload: Vec<u8>,
    ) -> Result<DocId, SmallError> {
        let kind_hint = id.as_ref().map(|id| id.kind());
        let mut meta = self.ensure_created(tx, kind_hint)?;

        let id = match id {
            Some(id) => {
                if id.kind() != meta.id_kind {
                    return Err(SmallError::new(
                        ErrorKind::SchemaMismatch,
                        &format!(
                            "collection {} is keyed by {:?}, got {:?}",
                            self.name,
                            meta.id_kind,
                            id.kind()
                        ),
                    ));
                }
                id
            }
            None => self.generate_id(tx, &meta)?,
        };
        let id_bytes = id.to_bytes();

        // every check precedes the first mutation, so a data-plane
        // failure leaves the write set untouched
        let mut id_map = BTree::id_map(meta.id_map_root);
        if id_map.seek(tx, &id_bytes)?.is_some() {
            return Err(SmallError::new(
                ErrorKind::DuplicateKey,
                &format!("id {} already exists in {}", id, self.name),
            ));
        }
        self.check_unique_indexes(tx, &meta, &payload, &id_bytes)?;

        let (page_id, slot) = self.store_payload(tx, &mut meta, &id, &payload)?;
        id_map.insert(tx, &id_bytes, &encode_location(page_id, slot))?;
        meta.id_map_root = id_map.root();

        self.index_insert_all(tx, &mut meta, &id_bytes, &payload)?;

        meta.doc_count += 1;
        tx.catalog_mut().insert(meta);
        persist_catalog(tx)?;

        self.push_event(tx, OpType::Insert, &id, Some(&payload));
        debug!("{} inserted {} into {}", tx, id, self.name);
        Ok(id)
    }

    /// Stream many documents into one transaction. A duplicate id
    /// surfaces as `Conflict` carrying the failing position.
    pub fn bulk_insert<I>(&self, tx: &mut Transaction, docs: I) -> Result<Vec<DocId>, SmallError>
    where
        I: IntoIterator<Item = (Option<DocId>, Record)>,
    {
        let mut ids = Vec::new();
        for (pos, (id, record)) in docs.into_iter().enumerate() {
            match self.insert(tx, id, &record) {
                Ok(id) => ids.push(id),
                Err(e) if e.kind() == ErrorKind::DuplicateKey => {
                    return Err(SmallError::new(
                        ErrorKind::Conflict,
                        &format!("bulk insert aborted at document {}: {}", pos, e),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ids)
    }

    pub fn find_by_id(
        &self,
        tx: &Transaction,
        id: &DocId,
    ) -> Result<Option<Record>, SmallError> {
        match self.find_raw(tx, id)? {
            None => Ok(None),
            Some(payload) => Record::decode(&payload).map(Some),
        }
    }

    /// The encoded payload of a document, straight from its page.
    pub fn find_raw(&self, tx: &Transaction, id: &DocId) -> Result<Option<Vec<u8>>, SmallError> {
        let meta = match self.meta(tx) {
            None => return Ok(None),
            Some(meta) => meta,
        };
        let id_map = BTree::id_map(meta.id_map_root);
        let location = match id_map.seek(tx, &id.to_bytes())? {
            None => return Ok(None),
            Some(bytes) => decode_location(&bytes)?,
        };
        let slot_record = self.load_slot(tx, location)?;
        self.materialize(tx, slot_record.body).map(Some)
    }

    fn load_slot(
        &self,
        tx: &Transaction,
        (page_id, slot): (PageId, SlotIndex),
    ) -> Result<SlotRecord, SmallError> {
        let image = tx.read_page(page_id)?;
        let reader = SlottedPage::new(&image[PAGE_HEADER_SIZE..]);
        let bytes = reader.slot(slot).ok_or_else(|| {
            SmallError::new(
                ErrorKind::Corruption,
                &format!("id-map points at empty slot {}:{}", page_id, slot),
            )
        })?;
        SlotRecord::decode(bytes)
    }

    fn materialize(&self, tx: &Transaction, body: SlotBody) -> Result<Vec<u8>, SmallError> {
        match body {
            SlotBody::Inline(payload) => Ok(payload),
            SlotBody::Overflow {
                total_len,
                first_page,
            } => overflow::read_chain(tx, first_page, total_len as usize),
        }
    }

    /// Replace a document's payload, in place when the new encoding
    /// fits the old slot, by delete-and-reinsert (same id) otherwise.
    pub fn update(
        &self,
        tx: &mut Transaction,
        id: &DocId,
        record: &Record,
    ) -> Result<bool, SmallError> {
        let mut meta = match self.meta(tx) {
            None => return Ok(false),
            Some(meta) => meta,
        };
        let id_bytes = id.to_bytes();
        let mut id_map = BTree::id_map(meta.id_map_root);
        let location = match id_map.seek(tx, &id_bytes)? {
            None => return Ok(false),
            Some(bytes) => decode_location(&bytes)?,
        };

        let old_slot = self.load_slot(tx, location)?;
        let old_overflow_root = match &old_slot.body {
            SlotBody::Overflow { first_page, .. } => Some(*first_page),
            _ => None,
        };
        let old_payload = self.materialize(tx, old_slot.body)?;
        let new_payload = record.encode();

        self.check_unique_on_update(tx, &meta, &old_payload, &new_payload, &id_bytes)?;

        // an old chain is never patched; a large document is always
        // rewritten as a fresh chain
        if let Some(first_page) = old_overflow_root {
            overflow::free_chain(tx, first_page)?;
        }

        let inline_record = SlotRecord {
            id: id.clone(),
            body: SlotBody::Inline(new_payload.clone()),
        };
        let inline_bytes = inline_record.encode();

        let moved = if self.fits_inline(tx, &inline_bytes) {
            !self.try_update_in_place(tx, location, &inline_bytes)?
        } else {
            true
        };

        if moved {
            self.remove_slot(tx, location)?;
            let (page_id, slot) = self.store_payload(tx, &mut meta, id, &new_payload)?;
            id_map.delete(tx, &id_bytes)?;
            id_map.insert(tx, &id_bytes, &encode_location(page_id, slot))?;
            meta.id_map_root = id_map.root();
        }

        self.reindex(tx, &mut meta, &id_bytes, &old_payload, &new_payload)?;

        tx.catalog_mut().insert(meta);
        persist_catalog(tx)?;

        self.push_event(tx, OpType::Update, id, Some(&new_payload));
        debug!("{} updated {} in {} (moved: {})", tx, id, self.name, moved);
        Ok(true)
    }

    fn try_update_in_place(
        &self,
        tx: &mut Transaction,
        (page_id, slot): (PageId, SlotIndex),
        bytes: &[u8],
    ) -> Result<bool, SmallError> {
        let image = tx.get_mut_page(page_id)?;
        let done = {
            let mut page = SlottedPageMut::new(&mut image[PAGE_HEADER_SIZE..]);
            page.update_in_place(slot, bytes)
        };
        if done {
            refresh_free_bytes(image)?;
        }
        Ok(done)
    }

    fn remove_slot(
        &self,
        tx: &mut Transaction,
        (page_id, slot): (PageId, SlotIndex),
    ) -> SmallResult {
        let image = tx.get_mut_page(page_id)?;
        {
            let mut page = SlottedPageMut::new(&mut image[PAGE_HEADER_SIZE..]);
            page.remove(slot);
        }
        refresh_free_bytes(image)?;
        Ok(())
    }

    /// Remove a document: tombstone its slot, release its overflow
    /// chain, unhook it from the ID map and every secondary index.
    pub fn delete(&self, tx: &mut Transaction, id: &DocId) -> Result<bool, SmallError> {
        let mut meta = match self.meta(tx) {
            None => return Ok(false),
            Some(meta) => meta,
        };
        let id_bytes = id.to_bytes();
        let mut id_map = BTree::id_map(meta.id_map_root);
        let location = match id_map.seek(tx, &id_bytes)? {
            None => return Ok(false),
            Some(bytes) => decode_location(&bytes)?,
        };

        let slot_record = self.load_slot(tx, location)?;
        let overflow_root = match &slot_record.body {
            SlotBody::Overflow { first_page, .. } => Some(*first_page),
            _ => None,
        };
        let old_payload = self.materialize(tx, slot_record.body)?;

        self.remove_slot(tx, location)?;
        if let Some(first_page) = overflow_root {
            overflow::free_chain(tx, first_page)?;
        }

        id_map.delete(tx, &id_bytes)?;
        meta.id_map_root = id_map.root();

        self.index_delete_all(tx, &mut meta, &id_bytes, &old_payload)?;

        meta.doc_count = meta.doc_count.saturating_sub(1);
        tx.catalog_mut().insert(meta);
        persist_catalog(tx)?;

        self.push_event(tx, OpType::Delete, id, Some(&old_payload));
        debug!("{} deleted {} from {}", tx, id, self.name);
        Ok(true)
    }

    pub fn count(&self, tx: &Transaction) -> u64 {
        self.meta(tx).map(|meta| meta.doc_count).unwrap_or(0)
    }

    /// Walk the data page chain, yielding every live document as
    /// `(id, encoded payload)`. One page is decoded at a time.
    pub fn scan<'a>(&self, tx: &'a Transaction) -> Result<CollectionScan<'a>, SmallError> {
        let head = self.meta(tx).map(|meta| meta.data_head).unwrap_or(0);
        Ok(CollectionScan {
            tx,
            collection: self.clone(),
            next_page: head,
            batch: VecDeque::new(),
        })
    }

    fn push_event(
        &self,
        tx: &mut Transaction,
        op: OpType,
        id: &DocId,
        payload: Option<&[u8]>,
    ) {
        let captured = if tx.payload_wanted(&self.name) {
            payload.map(Bytes::copy_from_slice)
        } else {
            None
        };
        let event = ChangeEvent {
            lsn: 0,
            unix_millis: now_millis(),
            txn_id: tx.id(),
            collection: self.name.clone(),
            op,
            doc_id: id.clone(),
            payload: captured,
        };
        tx.push_event(event);
    }

    // ------------------------------------------------------------------
    // physical placement
    // ------------------------------------------------------------------

    fn fits_inline(&self, tx: &Transaction, slot_bytes: &[u8]) -> bool {
        // must fit an otherwise empty data page
        let body_len = tx.page_size() - PAGE_HEADER_SIZE;
        slot_bytes.len() + 8 <= body_len
    }

    /// Place a payload: inline into a data page with room, or as an
    /// overflow chain with a small root slot. Returns the slot
    /// location recorded in the ID map.
    fn store_payload(
        &self,
        tx: &mut Transaction,
        meta: &mut CollectionMeta,
        id: &DocId,
        payload: &[u8],
    ) -> Result<(PageId, SlotIndex), SmallError> {
        let inline = SlotRecord {
            id: id.clone(),
            body: SlotBody::Inline(payload.to_vec()),
        };
        let inline_bytes = inline.encode();

        let slot_bytes = if self.fits_inline(tx, &inline_bytes) {
            inline_bytes
        } else {
            let first_page = overflow::write_chain(tx, payload)?;
            SlotRecord {
                id: id.clone(),
                body: SlotBody::Overflow {
                    total_len: payload.len() as u64,
                    first_page,
                },
            }
            .encode()
        };

        // walk the chain for a page with room, newest first
        let mut target = 0;
        let mut page_id = meta.data_head;
        while page_id != 0 {
            let image = tx.read_page(page_id)?;
            let header = PageHeader::read_from_page(&image)?;
            let reader = SlottedPage::new(&image[PAGE_HEADER_SIZE..]);
            if reader.fits(slot_bytes.len()) {
                target = page_id;
                break;
            }
            page_id = header.next_page_id;
        }

        if target == 0 {
            target = tx.allocate_page(PageCategory::Data)?;
            let old_head = meta.data_head;
            let image = tx.get_mut_page(target)?;
            SlottedPageMut::init(&mut image[PAGE_HEADER_SIZE..]);
            let mut header = PageHeader::read_from_page(image)?;
            header.next_page_id = old_head;
            header.write_to_page(image);
            meta.data_head = target;
        }

        let image = tx.get_mut_page(target)?;
        let slot = {
            let mut page = SlottedPageMut::new(&mut image[PAGE_HEADER_SIZE..]);
            page.insert(&slot_bytes).ok_or_else(|| {
                SmallError::new(
                    ErrorKind::Internal,
                    &format!("page {} rejected a fitting slot", target),
                )
            })?
        };
        refresh_free_bytes(image)?;
        Ok((target, slot))
    }

    // ------------------------------------------------------------------
    // secondary index maintenance
    // ------------------------------------------------------------------

    fn check_unique_indexes(
        &self,
        tx: &Transaction,
        meta: &CollectionMeta,
        payload: &[u8],
        _id_bytes: &[u8],
    ) -> SmallResult {
        for def in meta.indexes.iter().filter(|def| def.unique) {
            let cell = match record::raw_field(payload, &def.field)? {
                None => continue,
                Some(cell) => cell,
            };
            let tree = BTree::index(def.root);
            let (lo, hi) = key::eq_bounds(&cell, true);
            if !tree.range(tx, Some(&lo), Some(&hi), true)?.is_empty() {
                return Err(SmallError::new(
                    ErrorKind::DuplicateKey,
                    &format!("unique index on {} rejects {}", def.field, cell),
                ));
            }
        }
        Ok(())
    }

    fn check_unique_on_update(
        &self,
        tx: &Transaction,
        meta: &CollectionMeta,
        old_payload: &[u8],
        new_payload: &[u8],
        id_bytes: &[u8],
    ) -> SmallResult {
        for def in meta.indexes.iter().filter(|def| def.unique) {
            let new_cell = match record::raw_field(new_payload, &def.field)? {
                None => continue,
                Some(cell) => cell,
            };
            let old_cell = record::raw_field(old_payload, &def.field)?;
            if old_cell.as_ref() == Some(&new_cell) {
                continue;
            }
            let tree = BTree::index(def.root);
            let (lo, hi) = key::eq_bounds(&new_cell, true);
            let clash = tree
                .range(tx, Some(&lo), Some(&hi), true)?
                .into_iter()
                .any(|(_, value)| value != id_bytes);
            if clash {
                return Err(SmallError::new(
                    ErrorKind::DuplicateKey,
                    &format!("unique index on {} rejects {}", def.field, new_cell),
                ));
            }
        }
        Ok(())
    }

    fn index_insert_all(
        &self,
        tx: &mut Transaction,
        meta: &mut CollectionMeta,
        id_bytes: &[u8],
        payload: &[u8],
    ) -> SmallResult {
        for def in meta.indexes.iter_mut() {
            let cell = match record::raw_field(payload, &def.field)? {
                None => continue,
                Some(cell) => cell,
            };
            let mut tree = BTree::index(def.root);
            let entry = key::entry_key(&cell, id_bytes, def.unique);
            tree.insert(tx, &entry, id_bytes)?;
            def.root = tree.root();
        }
        Ok(())
    }

    fn index_delete_all(
        &self,
        tx: &mut Transaction,
        meta: &mut CollectionMeta,
        id_bytes: &[u8],
        payload: &[u8],
    ) -> SmallResult {
        for def in meta.indexes.iter_mut() {
            let cell = match record::raw_field(payload, &def.field)? {
                None => continue,
                Some(cell) => cell,
            };
            let mut tree = BTree::index(def.root);
            let entry = key::entry_key(&cell, id_bytes, def.unique);
            tree.delete(tx, &entry)?;
            def.root = tree.root();
        }
        Ok(())
    }

    fn reindex(
        &self,
        tx: &mut Transaction,
        meta: &mut CollectionMeta,
        id_bytes: &[u8],
        old_payload: &[u8],
        new_payload: &[u8],
    ) -> SmallResult {
        for def in meta.indexes.iter_mut() {
            let old_cell = record::raw_field(old_payload, &def.field)?;
            let new_cell = record::raw_field(new_payload, &def.field)?;
            if old_cell == new_cell {
                continue;
            }
            let mut tree = BTree::index(def.root);
            if let Some(cell) = old_cell {
                tree.delete(tx, &key::entry_key(&cell, id_bytes, def.unique))?;
            }
            if let Some(cell) = new_cell {
                tree.insert(tx, &key::entry_key(&cell, id_bytes, def.unique), id_bytes)?;
            }
            def.root = tree.root();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // index lifecycle
    // ------------------------------------------------------------------

    /// Create a secondary index on `field`, backfilling existing
    /// documents. Returns false when the index already exists.
    pub fn ensure_index(
        &self,
        tx: &mut Transaction,
        field: &str,
        unique: bool,
    ) -> Result<bool, SmallError> {
        let mut meta = self.ensure_created(tx, None)?;
        if meta.index(field).is_some() {
            return Ok(false);
        }

        let docs: Vec<(DocId, Vec<u8>)> = {
            let scan = self.scan(tx)?;
            let mut docs = Vec::new();
            for item in scan {
                docs.push(item?);
            }
            docs
        };

        let mut tree = BTree::index(0);
        for (id, payload) in &docs {
            let cell = match record::raw_field(payload, field)? {
                None => continue,
                Some(cell) => cell,
            };
            let id_bytes = id.to_bytes();
            let entry = key::entry_key(&cell, &id_bytes, unique);
            tree.insert(tx, &entry, &id_bytes).map_err(|e| {
                if e.kind() == ErrorKind::DuplicateKey {
                    SmallError::new(
                        ErrorKind::DuplicateKey,
                        &format!("cannot build unique index on {}: duplicate value", field),
                    )
                } else {
                    e
                }
            })?;
        }

        meta.indexes.push(IndexDef {
            field: field.to_string(),
            unique,
            root: tree.root(),
        });
        tx.catalog_mut().insert(meta);
        persist_catalog(tx)?;
        debug!(
            "index on {}.{} built over {} document(s)",
            self.name,
            field,
            docs.len()
        );
        Ok(true)
    }

    /// Drop the index on `field`, releasing its pages.
    pub fn drop_index(&self, tx: &mut Transaction, field: &str) -> Result<bool, SmallError> {
        let mut meta = match self.meta(tx) {
            None => return Ok(false),
            Some(meta) => meta,
        };
        let pos = match meta.indexes.iter().position(|def| def.field == field) {
            None => return Ok(false),
            Some(pos) => pos,
        };

        let def = meta.indexes.remove(pos);
        let mut tree = BTree::index(def.root);
        tree.free_all(tx)?;

        tx.catalog_mut().insert(meta);
        persist_catalog(tx)?;
        Ok(true)
    }

    /// The schema stamp recorded for this collection, as
    /// `(version, content hash)`. Zero until a schema is declared.
    pub fn schema_version(&self, tx: &Transaction) -> Option<(u32, u32)> {
        self.meta(tx)
            .map(|meta| (meta.schema_version, meta.schema_hash))
    }

    /// Record the schema stamp the caller's codec produces. Declaring
    /// an older version than the stored one, or the same version with
    /// a different content hash, is a schema mismatch.
    pub fn declare_schema(&self, tx: &mut Transaction, version: u32, hash: u32) -> SmallResult {
        let mut meta = self.ensure_created(tx, None)?;
        if meta.schema_version > version {
            return Err(SmallError::new(
                ErrorKind::SchemaMismatch,
                &format!(
                    "collection {} already stores schema v{}, got v{}",
                    self.name, meta.schema_version, version
                ),
            ));
        }
        if meta.schema_version == version && meta.schema_version != 0 && meta.schema_hash != hash {
            return Err(SmallError::new(
                ErrorKind::SchemaMismatch,
                &format!(
                    "collection {} schema v{} has a different content hash",
                    self.name, version
                ),
            ));
        }
        meta.schema_version = version;
        meta.schema_hash = hash;
        tx.catalog_mut().insert(meta);
        persist_catalog(tx)
    }

    /// Subscribe to committed changes of this collection.
    pub fn watch(&self, capture_payload: bool) -> Subscription {
        self.ctx.dispatcher.subscribe(&self.name, capture_payload)
    }

    /// Release everything this collection owns: data pages, overflow
    /// chains, the ID map and all indexes, then the catalog entry.
    pub(crate) fn drop_all(&self, tx: &mut Transaction) -> Result<bool, SmallError> {
        let meta = match self.meta(tx) {
            None => return Ok(false),
            Some(meta) => meta,
        };

        // overflow chains first: they are only reachable via the slots
        let mut page_id = meta.data_head;
        while page_id != 0 {
            let image = tx.read_page(page_id)?;
            let header = PageHeader::read_from_page(&image)?;
            let next = header.next_page_id;
            let reader = SlottedPage::new(&image[PAGE_HEADER_SIZE..]);
            let slots: Vec<Vec<u8>> = reader.iter_slots().map(|(_, b)| b.to_vec()).collect();
            for bytes in slots {
                if let SlotBody::Overflow { first_page, .. } = SlotRecord::decode(&bytes)?.body {
                    overflow::free_chain(tx, first_page)?;
                }
            }
            tx.free_page(page_id)?;
            page_id = next;
        }

        BTree::id_map(meta.id_map_root).free_all(tx)?;
        for def in &meta.indexes {
            BTree::index(def.root).free_all(tx)?;
        }

        tx.catalog_mut().remove(&self.name);
        persist_catalog(tx)?;
        debug!("collection {} dropped", self.name);
        Ok(true)
    }
}

fn refresh_free_bytes(image: &mut Vec<u8>) -> SmallResult {
    let free = {
        let reader = SlottedPage::new(&image[PAGE_HEADER_SIZE..]);
        reader.free_bytes() as u16
    };
    let mut header = PageHeader::read_from_page(image)?;
    header.free_bytes = free;
    header.write_to_page(image);
    Ok(())
}

/// Lazy iterator over a collection's data chain.
pub struct CollectionScan<'a> {
    tx: &'a Transaction,
    collection: Collection,
    next_page: PageId,
    batch: VecDeque<(DocId, Vec<u8>)>,
}

impl<'a> Iterator for CollectionScan<'a> {
    type Item = Result<(DocId, Vec<u8>), SmallError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.batch.pop_front() {
                return Some(Ok(item));
            }
            if self.next_page == 0 {
                return None;
            }

            let image = match self.tx.read_page(self.next_page) {
                Err(e) => return Some(Err(e)),
                Ok(image) => image,
            };
            let header = match PageHeader::read_from_page(&image) {
                Err(e) => return Some(Err(e)),
                Ok(header) => header,
            };
            self.next_page = header.next_page_id;

            let reader = SlottedPage::new(&image[PAGE_HEADER_SIZE..]);
            for (_, bytes) in reader.iter_slots() {
                let record = match SlotRecord::decode(bytes) {
                    Err(e) => return Some(Err(e)),
                    Ok(record) => record,
                };
                let payload = match self.collection.materialize(self.tx, record.body) {
                    Err(e) => return Some(Err(e)),
                    Ok(payload) => payload,
                };
                self.batch.push_back((record.id, payload));
            }
        }
    }
}
