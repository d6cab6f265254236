use std::sync::Arc;

use crate::{
    cmp::{BitwiseComparator, Comparator},
    error::Error,
    filter::FilterPolicy,
    snapshot::Snapshot,
    sstable::block::Block,
    utils::cache::Cache,
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Compress {
    No = 0x0,
    Snappy = 0x1,
}

impl Compress {
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for Compress {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x0 => Ok(Self::No),
            0x1 => Ok(Self::Snappy),
            _ => Err(Error::Corruption("unknown compression type".into())),
        }
    }
}

#[derive(Clone)]
pub struct Options {
    pub comparator: Arc<dyn Comparator>,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    pub block_size: usize,
    pub block_restart_interval: u32,
    pub max_open_files: u64,
    pub max_file_size: usize,
    pub write_buffer_size: u64,

    pub compression_type: Compress,
    pub paranoid_checks: bool,
    pub error_if_exists: bool,
    pub create_if_missing: bool,

    pub block_cache: Option<Arc<dyn Cache<Vec<u8>, Block>>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            comparator: Arc::new(BitwiseComparator {}),
            filter_policy: None,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_open_files: 1000,
            max_file_size: 2 * 1024 * 1024,
            write_buffer_size: 4 * 1024 * 1024,
            compression_type: Compress::No,
            paranoid_checks: false,
            error_if_exists: false,
            create_if_missing: false,
            block_cache: None,
        }
    }
}

#[derive(Clone)]
pub struct ReadOption {
    pub verify_checksum: bool,
    pub fill_cache: bool,
    pub snapshot: Option<Arc<Snapshot>>,
}

impl Default for ReadOption {
    fn default() -> Self {
        ReadOption {
            verify_checksum: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct WriteOption {
    pub sync: bool,
}

impl WriteOption {
    pub fn sync() -> Self {
        WriteOption { sync: true }
    }
}
