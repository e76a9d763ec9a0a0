mod database;

pub mod btree;
pub mod config;
pub mod document;
pub mod error;
pub mod io;
pub mod query;
pub mod storage;
pub mod stream;
pub mod transaction;
pub mod tx_log;
pub mod types;
pub mod utils;

pub use config::{AccessMode, DbConfig, GrowthBlock, PageSize};
pub use database::Database;
pub use document::{Cell, Collection, DocId, IdKind, Record};
pub use error::{ErrorKind, SmallError};
pub use query::{Expr, Op};
pub use stream::{ChangeEvent, OpType, Subscription};
pub use transaction::Transaction;
pub use tx_log::CheckpointMode;
