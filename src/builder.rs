use std::{mem::forget, sync::Arc};

use crate::{
    env::Env,
    error::Result,
    filenames::table_file_name,
    iterator::DBIterator,
    options::{Options, ReadOption},
    sstable::{Table, TableBuilder},
    table_cache::TableCache,
    utils::release::DropRelease,
    version::FileMetaData,
};

// Drain an internal-key iterator into a fresh table file, filling meta.
// A zero file_size afterwards means the input was empty and no file was
// kept on disk.
pub fn build_table<E: Env>(
    db_name: &str,
    env: E,
    options: &Arc<Options>,
    table_cache: &TableCache<E>,
    mut iter: Box<dyn DBIterator>,
    meta: &mut FileMetaData,
) -> Result<()> {
    meta.file_size = 0;
    iter.seek_to_first();

    let file_name = table_file_name(db_name, meta.number);
    let guard_env = env.clone();
    let guard_name = file_name.clone();
    let release_on_failure = DropRelease::new(move || {
        let _ = guard_env.delete_file(&guard_name);
    });

    if iter.valid() {
        let file = env.new_writable_file(&file_name)?;
        let mut builder = TableBuilder::new(options.clone(), file);

        meta.smallest.decode(iter.key());
        let mut largest = Vec::new();
        while iter.valid() {
            largest.clear();
            largest.extend_from_slice(iter.key());
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        meta.largest.decode(&largest);
        meta.file_size = builder.finish(true)?;
        iter.status()?;

        // Verify the new table is readable before it becomes visible.
        let table = table_cache.find_table(meta.number, meta.file_size)?;
        let mut check = Table::iter(
            table,
            ReadOption {
                verify_checksum: options.paranoid_checks,
                fill_cache: false,
                snapshot: None,
            },
        );
        check.status()?;
    }

    if meta.file_size > 0 {
        forget(release_on_failure);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cmp::{BitwiseComparator, InternalKeyComparator},
        env::posix::PosixEnv,
        format::ParsedInternalKey,
        memtable::MemTable,
        types::ValueType,
    };

    #[test]
    fn test_build_table_from_memtable() {
        let dir = tempfile::Builder::new()
            .prefix("silt_builder")
            .tempdir()
            .unwrap();
        let db_name = dir.path().to_str().unwrap();
        let env = PosixEnv {};
        let options = Arc::new(Options::default());
        let table_cache = TableCache::new(db_name.to_string(), options.clone(), env, 100);

        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let mem = MemTable::new(icmp);
        for (i, key) in ["apple", "banana", "cherry"].iter().enumerate() {
            mem.add(
                i as u64 + 1,
                ValueType::Value,
                key.as_bytes(),
                b"fruit".as_ref(),
            );
        }

        let mut meta = FileMetaData {
            number: 7,
            ..Default::default()
        };
        build_table(db_name, env, &options, &table_cache, mem.iter(), &mut meta).unwrap();

        assert!(meta.file_size > 0);
        assert_eq!(meta.smallest.user_key(), b"apple");
        assert_eq!(meta.largest.user_key(), b"cherry");
        assert!(env.file_exists(&table_file_name(db_name, 7)));

        // The produced table must scan back in order.
        let table = table_cache.find_table(meta.number, meta.file_size).unwrap();
        let mut iter = Table::iter(table, ReadOption::default());
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            let parsed = ParsedInternalKey::try_parse(iter.key()).unwrap();
            assert_eq!(iter.value(), b"fruit");
            assert!(!parsed.user_key.is_empty());
            count += 1;
            iter.next();
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_build_table_empty_input() {
        let dir = tempfile::Builder::new()
            .prefix("silt_builder")
            .tempdir()
            .unwrap();
        let db_name = dir.path().to_str().unwrap();
        let env = PosixEnv {};
        let options = Arc::new(Options::default());
        let table_cache = TableCache::new(db_name.to_string(), options.clone(), env, 100);

        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let mem = MemTable::new(icmp);

        let mut meta = FileMetaData {
            number: 9,
            ..Default::default()
        };
        build_table(db_name, env, &options, &table_cache, mem.iter(), &mut meta).unwrap();
        assert_eq!(meta.file_size, 0);
        assert!(!env.file_exists(&table_file_name(db_name, 9)));
    }
}
