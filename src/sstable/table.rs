use std::{io::Write, sync::Arc};

use snap::write::FrameEncoder;

use crate::{
    cmp::BitwiseComparator,
    codec::NumberEncoder,
    env::{RandomAccessFile, WritableFile},
    error::{Error, Result},
    iterator::DBIterator,
    options::{Compress, Options, ReadOption},
    sstable::{
        block::{Block, BlockIter},
        block_builder::BlockBuilder,
        filter_block::{FilterBlockBuilder, FilterBlockReader},
        format::{BlockContent, BlockHandle, Footer, BLOCK_TRAILER_SIZE, FULL_FOOTER_LENGTH},
        two_level_iterator::{BlockIterBuilder, TwoLevelIterator},
    },
};

pub struct Table<R: RandomAccessFile> {
    file: R,
    options: Arc<Options>,
    cache_id: u64,

    meta_index_handle: BlockHandle,
    index_block: Block,
    filter_block_data: Option<BlockContent>,
}

impl<R: RandomAccessFile> Table<R> {
    pub fn open(options: Arc<Options>, file: R, size: u64) -> Result<Self> {
        if (size as usize) < FULL_FOOTER_LENGTH {
            return Err(Error::Corruption("file too short to be a table".into()));
        }

        let mut scratch = [0u8; FULL_FOOTER_LENGTH];
        file.read_exact_at(&mut scratch, size - FULL_FOOTER_LENGTH as u64)?;
        let mut footer = Footer::default();
        footer.decode(&scratch)?;

        let read_options = ReadOption {
            verify_checksum: true,
            fill_cache: false,
            snapshot: None,
        };
        let index_content =
            BlockContent::read_block_from_file(&file, &footer.index_handle, &read_options)?;
        let index_block = Block::from_raw(index_content)?;

        // A missing or unreadable filter only costs extra block reads.
        let filter_block_data = Self::read_meta(&file, &options, &footer).unwrap_or(None);

        let cache_id = match options.block_cache {
            Some(ref cache) => cache.new_id(),
            None => 0,
        };

        Ok(Table {
            file,
            options,
            cache_id,
            meta_index_handle: footer.meta_index_handle,
            index_block,
            filter_block_data,
        })
    }

    fn read_meta(
        file: &R,
        options: &Arc<Options>,
        footer: &Footer,
    ) -> Result<Option<BlockContent>> {
        let policy = match options.filter_policy {
            Some(ref policy) => policy,
            None => return Ok(None),
        };

        let read_option = ReadOption {
            verify_checksum: true,
            fill_cache: false,
            snapshot: None,
        };
        let meta_content =
            BlockContent::read_block_from_file(file, &footer.meta_index_handle, &read_option)?;
        let meta_block = Block::from_raw(meta_content)?;

        let comparator = BitwiseComparator {};
        let mut iter = meta_block.iter(Arc::new(comparator));
        let mut key = Vec::from("filter.".as_bytes());
        key.extend_from_slice(policy.name().as_bytes());

        iter.seek(&key);
        if iter.valid() && iter.key() == key.as_slice() {
            let handle = BlockHandle::from_raw(iter.value())?;
            let filter_content = BlockContent::read_block_from_file(file, &handle, &read_option)?;
            return Ok(Some(filter_content));
        }
        Ok(None)
    }

    fn filter_reader(&self) -> Option<FilterBlockReader<'_>> {
        match (&self.filter_block_data, &self.options.filter_policy) {
            (Some(data), Some(policy)) => Some(FilterBlockReader::new(policy.clone(), data)),
            _ => None,
        }
    }

    fn read_block(&self, read_option: &ReadOption, handle: &BlockHandle) -> Result<Arc<Block>> {
        if let Some(ref cache) = self.options.block_cache {
            let mut cache_key = Vec::with_capacity(16);
            cache_key.encode_u64_le(self.cache_id).unwrap();
            cache_key.encode_u64_le(handle.offset()).unwrap();

            if let Some(block) = cache.lookup(&cache_key) {
                return Ok(block);
            }
            let content = BlockContent::read_block_from_file(&self.file, handle, read_option)?;
            let block = Block::from_raw(content)?;
            if read_option.fill_cache {
                let charge = block.size() as u64;
                let cached = cache
                    .insert(cache_key, block, charge)
                    .expect("cache insert always yields a handle");
                return Ok(cached);
            }
            return Ok(Arc::new(block));
        }

        let content = BlockContent::read_block_from_file(&self.file, handle, read_option)?;
        Ok(Arc::new(Block::from_raw(content)?))
    }

    fn block_iter_from_index(
        &self,
        read_option: &ReadOption,
        index_value: &[u8],
    ) -> Result<BlockIter> {
        let handle = BlockHandle::from_raw(index_value)?;
        let block = self.read_block(read_option, &handle)?;
        Ok(block.iter(self.options.comparator.clone()))
    }

    pub fn iter(
        self: Arc<Table<R>>,
        option: ReadOption,
    ) -> TwoLevelIterator<BlockIter, TableBlockIterBuilder<R>> {
        let index_iter = self.index_block.iter(self.options.comparator.clone());
        let block_iter_builder = TableBlockIterBuilder { table: self };
        TwoLevelIterator::new(index_iter, block_iter_builder, option)
    }

    // Point probe: the first entry at or after key, or None when the
    // bloom filter or index rules the key out.
    pub fn internal_get(
        &self,
        option: &ReadOption,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(self.options.comparator.clone());
        index_iter.seek(key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let handle = BlockHandle::from_raw(index_iter.value())?;
        if let Some(filter) = self.filter_reader() {
            if !filter.key_may_match(handle.offset() as usize, key) {
                return Ok(None);
            }
        }

        let block = self.read_block(option, &handle)?;
        let mut block_iter = block.iter(self.options.comparator.clone());
        block_iter.seek(key);
        if block_iter.valid() {
            let found = (block_iter.key().to_vec(), block_iter.value().to_vec());
            block_iter.status()?;
            return Ok(Some(found));
        }
        block_iter.status()?;
        Ok(None)
    }

    // Byte offset within the file where key would live; used only for
    // size estimation.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.options.comparator.clone());
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok(handle) = BlockHandle::from_raw(index_iter.value()) {
                return handle.offset();
            }
        }
        // Past the last key: close to the start of the metaindex.
        self.meta_index_handle.offset()
    }
}

pub struct TableBlockIterBuilder<R: RandomAccessFile> {
    table: Arc<Table<R>>,
}

impl<R: RandomAccessFile> BlockIterBuilder for TableBlockIterBuilder<R> {
    type Iter = BlockIter;

    fn build(&self, option: &ReadOption, index_val: &[u8]) -> Result<Self::Iter> {
        self.table.block_iter_from_index(option, index_val)
    }
}

pub struct TableBuilder<W: WritableFile> {
    options: Arc<Options>,
    file: W,

    offset: u64,
    data_block: BlockBuilder,
    index_block: BlockBuilder,

    last_key: Vec<u8>,
    num_entries: u64,

    filter_block: Option<FilterBlockBuilder>,

    // The handle of a flushed data block is only added to the index once
    // the next key arrives, so the index key can be a short separator.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    compress_out: Vec<u8>,
}

impl<W: WritableFile> TableBuilder<W> {
    pub fn new(options: Arc<Options>, file: W) -> Self {
        let data_block =
            BlockBuilder::new(options.comparator.clone(), options.block_restart_interval);
        let index_block = BlockBuilder::new(options.comparator.clone(), 1);
        let filter_block = options.filter_policy.clone().map(|policy| {
            let mut builder = FilterBlockBuilder::new(policy);
            builder.start_block(0);
            builder
        });
        TableBuilder {
            options,
            file,
            offset: 0,
            data_block,
            index_block,
            last_key: Vec::new(),
            num_entries: 0,
            filter_block,
            pending_index_entry: false,
            pending_handle: Default::default(),
            compress_out: Vec::new(),
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.num_entries > 0 {
            debug_assert_eq!(
                self.options.comparator.compare(key, &self.last_key),
                std::cmp::Ordering::Greater
            );
        }

        if self.pending_index_entry {
            assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(ref mut filter) = self.filter_block {
            filter.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let data_block = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(
                self.options.comparator.clone(),
                self.options.block_restart_interval,
            ),
        );
        if data_block.is_empty() {
            return Ok(());
        }
        assert!(!self.pending_index_entry);

        self.offset = write_block(
            &mut self.file,
            data_block,
            &mut self.pending_handle,
            self.options.compression_type,
            &mut self.compress_out,
            self.offset,
        )?;
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(ref mut filter) = self.filter_block {
            filter.start_block(self.offset as usize);
        }
        Ok(())
    }

    pub fn finish(mut self, sync: bool) -> Result<u64> {
        self.flush()?;

        // Filter block, then the metaindex that names it.
        let mut meta_index_block = BlockBuilder::new(
            self.options.comparator.clone(),
            self.options.block_restart_interval,
        );
        if let Some(filter_builder) = self.filter_block.take() {
            let mut filter_block_handle = BlockHandle::default();
            let content = filter_builder.finish();
            self.offset = write_raw_block(
                &mut self.file,
                &content,
                Compress::No,
                &mut filter_block_handle,
                self.offset,
            )?;

            if let Some(policy) = &self.options.filter_policy {
                let mut key = Vec::from("filter.".as_bytes());
                key.extend_from_slice(policy.name().as_bytes());
                let mut handle_encoding = Vec::new();
                filter_block_handle.encode(&mut handle_encoding);
                meta_index_block.add(&key[..], &handle_encoding[..]);
            }
        }

        let mut meta_index_block_handle = BlockHandle::default();
        self.offset = write_block(
            &mut self.file,
            meta_index_block,
            &mut meta_index_block_handle,
            self.options.compression_type,
            &mut self.compress_out,
            self.offset,
        )?;

        if self.pending_index_entry {
            self.options
                .comparator
                .find_shortest_successor(&mut self.last_key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }
        let mut index_block_handle = BlockHandle::default();
        let index_block = std::mem::replace(
            &mut self.index_block,
            BlockBuilder::new(self.options.comparator.clone(), 1),
        );
        self.offset = write_block(
            &mut self.file,
            index_block,
            &mut index_block_handle,
            self.options.compression_type,
            &mut self.compress_out,
            self.offset,
        )?;

        let footer = Footer::new(meta_index_block_handle, index_block_handle);
        let mut buf = Vec::with_capacity(FULL_FOOTER_LENGTH);
        footer.encode(&mut buf);
        self.file.append(&buf)?;
        self.offset += buf.len() as u64;

        self.file.flush()?;
        if sync {
            self.file.sync()?;
        }
        Ok(self.offset)
    }
}

fn write_block<W: WritableFile>(
    file: &mut W,
    block: BlockBuilder,
    handle: &mut BlockHandle,
    compress_type: Compress,
    compress_out: &mut Vec<u8>,
    offset: u64,
) -> Result<u64> {
    let raw = block.finish();
    let (compress_type, block_content) = match compress_type {
        Compress::No => (Compress::No, raw.as_slice()),
        Compress::Snappy => {
            compress_out.clear();
            {
                let mut encoder = FrameEncoder::new(&mut *compress_out);
                encoder.write_all(&raw)?;
            }
            // Keep the compressed form only when it saves at least 12.5%.
            if compress_out.len() < raw.len() - (raw.len() / 8) {
                (Compress::Snappy, compress_out.as_slice())
            } else {
                (Compress::No, raw.as_slice())
            }
        }
    };

    write_raw_block(file, block_content, compress_type, handle, offset)
}

fn write_raw_block<W: WritableFile>(
    file: &mut W,
    block_content: &[u8],
    compress_type: Compress,
    handle: &mut BlockHandle,
    offset: u64,
) -> Result<u64> {
    handle.set_offset(offset);
    handle.set_size(block_content.len() as u64);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(block_content);
    hasher.update(&[compress_type.as_byte()]);
    let checksum = hasher.finalize();

    let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
    trailer.encode_u8(compress_type.as_byte())?;
    trailer.encode_u32_le(checksum)?;

    file.append(block_content)?;
    file.append(&trailer)?;

    Ok(offset + block_content.len() as u64 + BLOCK_TRAILER_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{cmp::BitwiseComparator, env::IoResult, filter::BloomFilterPolicy};

    #[derive(Clone)]
    pub struct MemFile {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl MemFile {
        pub fn new() -> Self {
            MemFile {
                data: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn len(&self) -> usize {
            self.data.lock().unwrap().len()
        }
    }

    impl RandomAccessFile for MemFile {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> IoResult<usize> {
            let data = self.data.lock().unwrap();
            let data = &data[offset as usize..offset as usize + buf.len()];
            buf.copy_from_slice(data);
            Ok(buf.len())
        }

        fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> IoResult<()> {
            self.read_at(buf, offset)?;
            Ok(())
        }
    }

    impl WritableFile for MemFile {
        fn append(&mut self, data: &[u8]) -> IoResult<()> {
            self.data.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> IoResult<()> {
            Ok(())
        }

        fn sync(&mut self) -> IoResult<()> {
            Ok(())
        }
    }

    fn test_options(filter: bool, compress: Compress) -> Arc<Options> {
        Arc::new(Options {
            comparator: Arc::new(BitwiseComparator {}),
            filter_policy: if filter {
                Some(Arc::new(BloomFilterPolicy::new(10)))
            } else {
                None
            },
            block_restart_interval: 3,
            block_size: 1024,
            compression_type: compress,
            ..Default::default()
        })
    }

    fn test_data(n: usize) -> Vec<(String, String)> {
        (0..n)
            .map(|i| (format!("key{:06}", i), format!("value:{:06}", i)))
            .collect()
    }

    fn build_and_check(options: Arc<Options>) {
        let datas = test_data(5000);

        let file = MemFile::new();
        let mut builder = TableBuilder::new(options.clone(), file.clone());
        for (k, v) in datas.iter() {
            builder.add(k.as_bytes(), v.as_bytes()).unwrap();
        }
        assert_eq!(builder.num_entries(), datas.len() as u64);
        let size = builder.finish(true).unwrap();
        assert_eq!(size as usize, file.len());

        let table = Arc::new(Table::open(options, file.clone(), size).unwrap());

        // Full scan in order.
        let read_option = ReadOption {
            verify_checksum: true,
            fill_cache: false,
            snapshot: None,
        };
        let mut data_iter = datas.iter();
        let mut iter = table.clone().iter(read_option.clone());
        iter.seek_to_first();
        while iter.valid() {
            let (origin_key, origin_value) = data_iter.next().unwrap();
            assert_eq!(iter.key(), origin_key.as_bytes());
            assert_eq!(iter.value(), origin_value.as_bytes());
            iter.next();
        }
        assert!(data_iter.next().is_none());
        iter.status().unwrap();

        // Point probes.
        let (k, v) = &datas[2345];
        let found = table.internal_get(&read_option, k.as_bytes()).unwrap();
        let (fk, fv) = found.unwrap();
        assert_eq!(fk, k.as_bytes());
        assert_eq!(fv, v.as_bytes());

        // A missing key resolves to the next entry or nothing, never a
        // false equal.
        let found = table
            .internal_get(&read_option, b"key999999x".as_ref())
            .unwrap();
        assert!(found.is_none() || found.unwrap().0 != b"key999999x");
    }

    #[test]
    fn test_table_round_trip_plain() {
        build_and_check(test_options(false, Compress::No));
    }

    #[test]
    fn test_table_round_trip_filtered() {
        build_and_check(test_options(true, Compress::No));
    }

    #[test]
    fn test_table_round_trip_snappy() {
        build_and_check(test_options(true, Compress::Snappy));
    }

    #[test]
    fn test_table_seek() {
        let options = test_options(true, Compress::No);
        let datas = test_data(100);

        let file = MemFile::new();
        let mut builder = TableBuilder::new(options.clone(), file.clone());
        for (k, v) in datas.iter() {
            builder.add(k.as_bytes(), v.as_bytes()).unwrap();
        }
        let size = builder.finish(true).unwrap();
        let table = Arc::new(Table::open(options, file, size).unwrap());

        let mut iter = table.iter(ReadOption::default());
        iter.seek(b"key000050");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000050");

        iter.seek(b"key0000505");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000051");

        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_approximate_offset_is_monotonic() {
        let options = test_options(false, Compress::No);
        let datas = test_data(2000);

        let file = MemFile::new();
        let mut builder = TableBuilder::new(options.clone(), file.clone());
        for (k, v) in datas.iter() {
            builder.add(k.as_bytes(), v.as_bytes()).unwrap();
        }
        let size = builder.finish(true).unwrap();
        let table = Table::open(options, file, size).unwrap();

        let early = table.approximate_offset_of(b"key000010");
        let late = table.approximate_offset_of(b"key001900");
        let past = table.approximate_offset_of(b"zzz");
        assert!(early <= late);
        assert!(late <= past);
        assert!(past <= size);
    }
}
