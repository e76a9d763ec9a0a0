use std::sync::{Arc, RwLock};

use crate::error::SmallError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, SmallError>;
pub type SmallResult = Result<(), SmallError>;

/// Identifier of a page in the page file. Page 0 is the meta page.
pub type PageId = u64;

/// Index of a slot inside a data page's slot directory.
pub type SlotIndex = u16;

/// Identifier of a transaction. Increases monotonically per engine.
pub type TxnId = u64;

/// Log sequence number: the monotonic identifier assigned to a WAL
/// commit record. `0` means "nothing committed yet".
pub type Lsn = u64;
