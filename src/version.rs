use std::{
    cmp::Ordering,
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
};

use crate::{
    cmp::{Comparator, InternalKeyComparator},
    codec::NumberDecoder,
    consts::{max_grand_parent_overlap_bytes, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS},
    env::Env,
    error::{Error, Result},
    format::{InternalKey, ParsedInternalKey},
    iterator::DBIterator,
    memtable::LookupKey,
    options::{Options, ReadOption},
    sstable::{two_level_iterator::BlockIterBuilder, Table},
    table_cache::TableCache,
    types::{ValueType, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK},
};

pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    // Budget of lookups that may probe this file without answering
    // before it is nominated for compaction.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn init_allowed_seeks(&self) {
        let seeks = std::cmp::max(100, (self.file_size / 16384) as i64);
        self.allowed_seeks.store(seeks, AtomicOrdering::Relaxed);
    }
}

impl Default for FileMetaData {
    fn default() -> Self {
        FileMetaData {
            number: 0,
            file_size: 0,
            smallest: InternalKey::empty(),
            largest: InternalKey::empty(),
            allowed_seeks: AtomicI64::new(1 << 30),
        }
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        FileMetaData {
            number: self.number,
            file_size: self.file_size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            allowed_seeks: AtomicI64::new(self.allowed_seeks.load(AtomicOrdering::Relaxed)),
        }
    }
}

impl fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMetaData")
            .field("number", &self.number)
            .field("file_size", &self.file_size)
            .field("smallest", &self.smallest)
            .field("largest", &self.largest)
            .finish()
    }
}

pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

pub fn max_bytes_for_level(level: usize) -> f64 {
    // L1 targets 10 MiB, growing tenfold per level.
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

// Index of the first file whose largest key is >= the internal key.
pub fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    internal_key: &[u8],
) -> usize {
    files
        .partition_point(|f| icmp.compare(f.largest.encode(), internal_key) == Ordering::Less)
}

fn after_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    match user_key {
        Some(key) => ucmp.compare(key, f.largest.user_key()) == Ordering::Greater,
        None => false,
    }
}

fn before_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    match user_key {
        Some(key) => ucmp.compare(key, f.smallest.user_key()) == Ordering::Less,
        None => false,
    }
}

pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();
    if !disjoint_sorted_files {
        return files.iter().any(|f| {
            !(after_file(ucmp.as_ref(), smallest_user_key, f)
                || before_file(ucmp.as_ref(), largest_user_key, f))
        });
    }

    let index = match smallest_user_key {
        Some(key) => {
            let small = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encode())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !before_file(ucmp.as_ref(), largest_user_key, &files[index])
}

pub struct Version<E: Env> {
    icmp: InternalKeyComparator,
    options: Arc<Options>,
    table_cache: TableCache<E>,

    pub files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    // Seek-driven compaction candidate, set by update_stats.
    file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,

    // Size-driven compaction state, filled by VersionSet::finalize.
    pub compaction_score: f64,
    pub compaction_level: i32,
}

impl<E: Env> Version<E> {
    pub fn new(
        icmp: InternalKeyComparator,
        options: Arc<Options>,
        table_cache: TableCache<E>,
    ) -> Self {
        Version {
            icmp,
            options,
            table_cache,
            files: Default::default(),
            file_to_compact: Mutex::new(None),
            compaction_score: -1.0,
            compaction_level: -1,
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_total_file_size(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    pub fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().unwrap().clone()
    }

    pub fn live_files(&self, live: &mut HashSet<u64>) {
        for level in self.files.iter() {
            for f in level.iter() {
                live.insert(f.number);
            }
        }
    }

    // Probe levels top-down for the newest entry at or below the lookup
    // sequence. Also reports the first file probed without answering so
    // the caller can charge its seek budget.
    pub fn get(
        &self,
        option: &ReadOption,
        key: &LookupKey,
    ) -> Result<(Option<Vec<u8>>, Option<(Arc<FileMetaData>, usize)>)> {
        let internal_key = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator();

        let mut seek_file: Option<(Arc<FileMetaData>, usize)> = None;
        let mut last_file_read: Option<(Arc<FileMetaData>, usize)> = None;

        for level in 0..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let candidates: Vec<Arc<FileMetaData>> = if level == 0 {
                // L0 files overlap; probe every cover, newest first.
                let mut tmp: Vec<Arc<FileMetaData>> = files
                    .iter()
                    .filter(|f| {
                        ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                            && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
                    })
                    .cloned()
                    .collect();
                tmp.sort_by(|a, b| b.number.cmp(&a.number));
                tmp
            } else {
                let index = find_file(&self.icmp, files, internal_key);
                if index >= files.len() {
                    Vec::new()
                } else {
                    let f = files[index].clone();
                    if ucmp.compare(user_key, f.smallest.user_key()) == Ordering::Less {
                        Vec::new()
                    } else {
                        vec![f]
                    }
                }
            };

            for f in candidates {
                if seek_file.is_none() && last_file_read.is_some() {
                    // More than one file probed for this lookup.
                    seek_file = last_file_read.clone();
                }
                last_file_read = Some((f.clone(), level));

                let found =
                    self.table_cache
                        .get(option, f.number, f.file_size, internal_key)?;
                if let Some((found_key, value)) = found {
                    match ParsedInternalKey::try_parse(&found_key) {
                        None => {
                            return Err(Error::Corruption(
                                "corrupted internal key in table".into(),
                            ))
                        }
                        Some(parsed) => {
                            if ucmp.compare(parsed.user_key, user_key) == Ordering::Equal {
                                let result = match parsed.val_type {
                                    ValueType::Value => Some(value),
                                    ValueType::Deletion => None,
                                };
                                return Ok((result, seek_file));
                            }
                        }
                    }
                }
            }
        }

        Ok((None, seek_file))
    }

    // Charge a seek to the reported file. True when the file exhausted
    // its budget and a compaction should be considered.
    pub fn update_stats(&self, stats: Option<(Arc<FileMetaData>, usize)>) -> bool {
        if let Some((f, level)) = stats {
            let prior = f.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed);
            // Bottom-level files have nowhere to compact into.
            if prior <= 1 && level + 1 < NUM_LEVELS {
                let mut to_compact = self.file_to_compact.lock().unwrap();
                if to_compact.is_none() {
                    *to_compact = Some((f, level));
                    return true;
                }
            }
        }
        false
    }

    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    // Push a fresh memtable dump below L0 while it overlaps nothing and
    // its grandparent overlap stays bounded.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            let limit = InternalKey::new(largest_user_key, 0, ValueType::Deletion);
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key))
                {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let overlaps = self.overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    if total_file_size(&overlaps) > max_grand_parent_overlap_bytes(&self.options) {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    // All files in a level touching [begin, end]. For L0 the range grows
    // to cover transitively overlapping files.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let f = self.files[level][i].clone();
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();

            if user_begin
                .as_ref()
                .map_or(false, |b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                continue;
            }
            if user_end
                .as_ref()
                .map_or(false, |e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                continue;
            }

            if level == 0 {
                // L0 files overlap each other; widen and restart.
                if user_begin
                    .as_ref()
                    .map_or(false, |b| ucmp.compare(file_start, b) == Ordering::Less)
                {
                    user_begin = Some(file_start.to_vec());
                    inputs.clear();
                    i = 0;
                    continue;
                }
                if user_end
                    .as_ref()
                    .map_or(false, |e| ucmp.compare(file_limit, e) == Ordering::Greater)
                {
                    user_end = Some(file_limit.to_vec());
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
        inputs
    }

    pub fn append_iterators(
        &self,
        option: &ReadOption,
        iters: &mut Vec<Box<dyn DBIterator>>,
    ) -> Result<()> {
        for f in self.files[0].iter() {
            let table = self.table_cache.find_table(f.number, f.file_size)?;
            iters.push(Box::new(Table::iter(table, option.clone())));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(self.new_concatenating_iterator(option, level));
            }
        }
        Ok(())
    }

    pub fn new_concatenating_iterator(
        &self,
        option: &ReadOption,
        level: usize,
    ) -> Box<dyn DBIterator> {
        Box::new(crate::sstable::two_level_iterator::TwoLevelIterator::new(
            LevelFileNumIterator::new(self.icmp.clone(), self.files[level].clone()),
            LevelTableIterBuilder {
                table_cache: self.table_cache.clone(),
            },
            option.clone(),
        ))
    }

    pub fn approximate_offset_of(&self, internal_key: &InternalKey) -> u64 {
        let mut result = 0;
        for (level, files) in self.files.iter().enumerate() {
            for f in files.iter() {
                if self.icmp.compare(f.largest.encode(), internal_key.encode())
                    != Ordering::Greater
                {
                    // Entirely before the key.
                    result += f.file_size;
                } else if self.icmp.compare(f.smallest.encode(), internal_key.encode())
                    == Ordering::Greater
                {
                    // Entirely after; deeper levels are sorted.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.find_table(f.number, f.file_size) {
                    result += table.approximate_offset_of(internal_key.encode());
                }
            }
        }
        result
    }
}

impl<E: Env> fmt::Debug for Version<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Version");
        for (level, files) in self.files.iter().enumerate() {
            if !files.is_empty() {
                let nums: Vec<u64> = files.iter().map(|f| f.number).collect();
                s.field(&format!("level{}", level), &nums);
            }
        }
        s.finish()
    }
}

// Applies edits from a base version to produce the next one.
pub struct VersionBuilder<E: Env> {
    base: Arc<Version<E>>,
    icmp: InternalKeyComparator,
    deleted: [HashSet<u64>; NUM_LEVELS],
    added: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
}

impl<E: Env> VersionBuilder<E> {
    pub fn new(base: Arc<Version<E>>, icmp: InternalKeyComparator) -> Self {
        VersionBuilder {
            base,
            icmp,
            deleted: Default::default(),
            added: Default::default(),
        }
    }

    pub fn apply(&mut self, edit: &crate::version_edit::VersionEdit, compact_pointers: &mut [Vec<u8>; NUM_LEVELS]) {
        for (level, key) in edit.compact_pointers.iter() {
            compact_pointers[*level] = key.encode().to_vec();
        }
        for (level, num) in edit.deleted_files.iter() {
            self.deleted[*level].insert(*num);
        }
        for (level, f) in edit.new_files.iter() {
            let meta = Arc::new(f.clone());
            meta.init_allowed_seeks();
            self.deleted[*level].remove(&meta.number);
            self.added[*level].push(meta);
        }
    }

    pub fn save_to(&self, version: &mut Version<E>) {
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .cloned()
                .collect();
            files.extend(
                self.added[level]
                    .iter()
                    .filter(|f| !self.deleted[level].contains(&f.number))
                    .cloned(),
            );
            if level == 0 {
                // L0 lookup order is by file number, newest last here;
                // readers sort by number as needed.
                files.sort_by(|a, b| a.number.cmp(&b.number));
            } else {
                files.sort_by(|a, b| {
                    self.icmp
                        .compare(a.smallest.encode(), b.smallest.encode())
                });
                debug_assert!(files.windows(2).all(|w| {
                    self.icmp
                        .compare(w[0].largest.encode(), w[1].smallest.encode())
                        == Ordering::Less
                }));
            }
            version.files[level] = files;
        }
    }
}

// Yields (largest key -> encoded file number and size) over one sorted
// level, feeding the two-level concatenating iterator.
pub struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: std::cell::RefCell<Vec<u8>>,
}

impl LevelFileNumIterator {
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        LevelFileNumIterator {
            icmp,
            files,
            index,
            value_buf: std::cell::RefCell::new(vec![0u8; 16]),
        }
    }

    fn fill_value(&self) {
        use crate::codec::NumberEncoder;
        let f = &self.files[self.index];
        let mut buf = self.value_buf.borrow_mut();
        buf.clear();
        buf.encode_u64_le(f.number).unwrap();
        buf.encode_u64_le(f.file_size).unwrap();
    }
}

impl DBIterator for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
    }

    fn seek_to_last(&mut self) {
        self.index = self.files.len().saturating_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.index += 1;
    }

    fn prev(&mut self) {
        if self.index == 0 {
            self.index = self.files.len();
        } else {
            self.index -= 1;
        }
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.files[self.index].largest.encode()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.fill_value();
        let buf = self.value_buf.borrow();
        // The buffer outlives the borrow; hand out a raw view.
        unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) }
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LevelTableIterBuilder<E: Env> {
    pub table_cache: TableCache<E>,
}

impl<E: Env> BlockIterBuilder for LevelTableIterBuilder<E> {
    type Iter = crate::sstable::two_level_iterator::TwoLevelIterator<
        crate::sstable::block::BlockIter,
        crate::sstable::table::TableBlockIterBuilder<E::RandomAccessFile>,
    >;

    fn build(&self, option: &ReadOption, index_val: &[u8]) -> Result<Self::Iter> {
        let mut buf = index_val;
        let file_num = buf.decode_u64_le()?;
        let file_size = buf.decode_u64_le()?;
        let table = self.table_cache.find_table(file_num, file_size)?;
        Ok(Table::iter(table, option.clone()))
    }
}
