//! Storage layer: pager, page cache, B-tree, record codec.

pub mod btree;
pub mod pager;
pub mod pcache;
pub mod record;
