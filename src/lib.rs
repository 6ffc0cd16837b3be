//! Strata - transactional storage core for an embeddable single-file
//! database
//!
//! The crate covers the durable half of a database engine: a paged file
//! manager with a rollback journal (`storage::pager`), a reference-counted
//! page cache (`storage::pcache`), ordered key/payload storage with
//! cursors (`storage::btree`), a self-describing record codec
//! (`storage::record`), and the shared primitives underneath (`os`,
//! `mem`, `util`). SQL parsing, planning, and execution live elsewhere
//! and talk to this crate through B-tree cursors.

pub mod config;
pub mod error;
pub mod mem;
pub mod os;
pub mod random;
pub mod storage;
pub mod types;
pub mod util;

// Re-export the main public types
pub use config::{
    BusyHandler, Context, DbConfig, InterruptFlag, PageCodec, SyncMode, TempStore, TextEncoding,
};
pub use error::{Error, ErrorCode, IoKind, Result};
pub use storage::btree::types::{MetaField, TransState};
pub use storage::btree::{Btree, CursorId};
pub use storage::pager::{JournalMode, Pager, PagerState};
pub use storage::record::{decode_record, encode_record, CollSeq, KeyInfo, RecordView, SortOrder};
pub use types::{LockLevel, Pgno, RowId, Value};
pub use util::bitvec::Bitvec;
