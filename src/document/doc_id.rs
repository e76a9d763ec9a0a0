use std::{
    convert::TryInto,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;

use crate::{
    document::record::Cell,
    error::{ErrorKind, SmallError},
};

/// The key kind of a collection, fixed at creation and recorded in the
/// catalog. It decides both the id generation rule and the byte
/// encoding of the ID map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    ObjectId,
    Int64,
    Guid,
    String,
}

impl IdKind {
    pub fn to_u8(&self) -> u8 {
        match self {
            IdKind::ObjectId => 0,
            IdKind::Int64 => 1,
            IdKind::Guid => 2,
            IdKind::String => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, SmallError> {
        match value {
            0 => Ok(IdKind::ObjectId),
            1 => Ok(IdKind::Int64),
            2 => Ok(IdKind::Guid),
            3 => Ok(IdKind::String),
            _ => Err(SmallError::new(
                ErrorKind::Corruption,
                &format!("invalid id kind tag: {}", value),
            )),
        }
    }
}

/// A document identifier.
///
/// `to_bytes` is order-preserving per kind, so the ID map iterates in
/// id order and incremental Int64 ids can resume from the map's last
/// key after a reopen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocId {
    ObjectId([u8; 12]),
    Int64(i64),
    Guid([u8; 16]),
    String(String),
}

static OBJECT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Per-process entropy of generated object ids.
static PROCESS_NONCE: Lazy<[u8; 5]> = Lazy::new(|| {
    let bytes: [u8; 8] = rand::random();
    bytes[..5].try_into().unwrap()
});

impl DocId {
    pub fn kind(&self) -> IdKind {
        match self {
            DocId::ObjectId(_) => IdKind::ObjectId,
            DocId::Int64(_) => IdKind::Int64,
            DocId::Guid(_) => IdKind::Guid,
            DocId::String(_) => IdKind::String,
        }
    }

    /// Time-ordered 12-byte id: unix seconds, process nonce, counter.
    pub fn new_object_id() -> DocId {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let counter = OBJECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&PROCESS_NONCE[..]);
        bytes[9..].copy_from_slice(&counter.to_be_bytes()[1..]);
        DocId::ObjectId(bytes)
    }

    pub fn new_guid() -> DocId {
        DocId::Guid(rand::random())
    }

    /// Random uuid-shaped string, for collections keyed by string.
    pub fn new_string() -> DocId {
        let bytes: [u8; 16] = rand::random();
        let h = hex::encode(bytes);
        DocId::String(format!(
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        ))
    }

    /// Canonical ordered byte form, the ID map key.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DocId::ObjectId(v) => v.to_vec(),
            DocId::Int64(v) => ((*v as u64) ^ (1u64 << 63)).to_be_bytes().to_vec(),
            DocId::Guid(v) => v.to_vec(),
            DocId::String(v) => v.as_bytes().to_vec(),
        }
    }

    pub fn from_bytes(kind: IdKind, bytes: &[u8]) -> Result<DocId, SmallError> {
        match kind {
            IdKind::ObjectId => {
                let raw: [u8; 12] = bytes.try_into().map_err(|_| bad_id_len(bytes))?;
                Ok(DocId::ObjectId(raw))
            }
            IdKind::Int64 => {
                let raw: [u8; 8] = bytes.try_into().map_err(|_| bad_id_len(bytes))?;
                Ok(DocId::Int64(
                    (u64::from_be_bytes(raw) ^ (1u64 << 63)) as i64,
                ))
            }
            IdKind::Guid => {
                let raw: [u8; 16] = bytes.try_into().map_err(|_| bad_id_len(bytes))?;
                Ok(DocId::Guid(raw))
            }
            IdKind::String => Ok(DocId::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| SmallError::new(ErrorKind::Corruption, "id is not utf-8"))?,
            )),
        }
    }

    pub fn to_cell(&self) -> Cell {
        match self {
            DocId::ObjectId(v) => Cell::ObjectId(*v),
            DocId::Int64(v) => Cell::Int64(*v),
            DocId::Guid(v) => Cell::Guid(*v),
            DocId::String(v) => Cell::String(v.clone()),
        }
    }
}

fn bad_id_len(bytes: &[u8]) -> SmallError {
    SmallError::new(
        ErrorKind::Corruption,
        &format!("id has unexpected length {}", bytes.len()),
    )
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DocId::ObjectId(v) => write!(f, "{}", hex::encode(v)),
            DocId::Int64(v) => write!(f, "{}", v),
            DocId::Guid(v) => write!(f, "{}", hex::encode(v)),
            DocId::String(v) => write!(f, "{}", v),
        }
    }
}
