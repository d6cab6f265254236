mod builder;
mod cmp;
mod codec;
mod consts;
mod db_impl;
mod db_iter;
mod env;
mod error;
mod filenames;
mod filter;
mod format;
mod iterator;
mod log;
mod memtable;
mod merge;
mod options;
mod skiplist;
mod slice;
mod snapshot;
mod sstable;
mod table_cache;
mod types;
mod utils;
mod version;
mod version_edit;
mod version_set;
mod write_batch;

pub use cmp::{BitwiseComparator, Comparator};
pub use db_impl::Db;
pub use db_iter::DbIter;
pub use env::posix::PosixEnv;
pub use env::Env;
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use log::{LogReader, LogWriter};
pub use memtable::{LookupKey, MemTable};
pub use options::{Compress, Options, ReadOption, WriteOption};
pub use snapshot::Snapshot;
pub use types::{SequenceNumber, ValueType};
pub use write_batch::WriteBatch;
