use std::sync::Arc;

use crate::{
    env::Env,
    error::Result,
    filenames::{sst_table_file_name, table_file_name},
    options::{Options, ReadOption},
    sstable::Table,
    utils::cache::{Cache, ShardLruCache},
};

// Keeps recently used tables open, bounded by max_open_files less a
// reserve for the engine's own descriptors.
pub struct TableCache<E: Env> {
    env: E,
    db_name: String,
    options: Arc<Options>,
    cache: Arc<ShardLruCache<u64, Table<E::RandomAccessFile>>>,
}

impl<E: Env> Clone for TableCache<E> {
    fn clone(&self) -> Self {
        TableCache {
            env: self.env.clone(),
            db_name: self.db_name.clone(),
            options: self.options.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<E: Env> TableCache<E> {
    pub fn new(db_name: String, options: Arc<Options>, env: E, size: u64) -> Self {
        TableCache {
            db_name,
            env,
            options,
            cache: Arc::new(ShardLruCache::new(size)),
        }
    }

    pub fn find_table(
        &self,
        file_number: u64,
        file_size: u64,
    ) -> Result<Arc<Table<E::RandomAccessFile>>> {
        if let Some(table) = self.cache.lookup(&file_number) {
            return Ok(table);
        }

        let file = self.open_table_file(file_number)?;
        let table = Table::open(self.options.clone(), file, file_size)?;
        Ok(self
            .cache
            .insert(file_number, table, 1)
            .expect("cache insert always yields a handle"))
    }

    // Point probe through the cached table; None when the table holds no
    // entry at or after the internal key.
    pub fn get(
        &self,
        option: &ReadOption,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(option, internal_key)
    }

    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }

    fn open_table_file(&self, file_number: u64) -> Result<E::RandomAccessFile> {
        let file_name = table_file_name(&self.db_name, file_number);
        match self.env.new_random_access_file(&file_name) {
            Ok(file) => Ok(file),
            Err(_) => {
                // Fall back to the legacy extension.
                let old_name = sst_table_file_name(&self.db_name, file_number);
                Ok(self.env.new_random_access_file(&old_name)?)
            }
        }
    }
}
