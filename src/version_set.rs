use std::{
    cmp::Ordering,
    collections::HashSet,
    fmt::Debug,
    path::Path,
    sync::Arc,
};

use crate::{
    cmp::{Comparator, InternalKeyComparator},
    consts::{
        expanded_compaction_byte_size_limit, max_file_size_for_level,
        max_grand_parent_overlap_bytes, L0_COMPACTION_TRIGGER, NUM_LEVELS,
    },
    env::{read_file_to_string, Env},
    error::{Error, Result},
    filenames::{current_file_name, descriptor_file_name, set_current_file},
    format::InternalKey,
    iterator::DBIterator,
    log::{LogReader, LogWriter},
    merge::MergingIterator,
    options::{Options, ReadOption},
    table_cache::TableCache,
    types::SequenceNumber,
    version::{
        total_file_size, FileMetaData, LevelFileNumIterator, LevelTableIterBuilder, Version,
        VersionBuilder,
    },
    version_edit::VersionEdit,
};

pub struct VersionSet<E: Env> {
    env: E,
    db_name: String,
    options: Arc<Options>,
    table_cache: TableCache<E>,
    icmp: InternalKeyComparator,

    last_sequence: SequenceNumber,
    next_file_number: u64,
    manifest_file_number: u64,
    log_number: u64,
    prev_log_number: u64,

    // All versions still referenced somewhere; the last entry is current.
    versions: Vec<Arc<Version<E>>>,

    // Per-level cursor (largest key of the last compaction) so size
    // compactions rotate through the keyspace.
    compact_pointer: [Vec<u8>; NUM_LEVELS],
    descriptor_log: Option<LogWriter<E::WritableFile>>,

    // File numbers handed out but not yet installed in any version;
    // they must survive obsolete-file collection.
    pub pending_outputs: HashSet<u64>,
}

impl<E: Env> VersionSet<E> {
    pub fn new(
        env: E,
        db_name: String,
        options: Arc<Options>,
        table_cache: TableCache<E>,
        icmp: InternalKeyComparator,
    ) -> Self {
        let v = Version::new(icmp.clone(), options.clone(), table_cache.clone());
        VersionSet {
            env,
            db_name,
            options,
            table_cache,
            icmp,
            last_sequence: 0,
            next_file_number: 2,
            manifest_file_number: 0,
            log_number: 0,
            prev_log_number: 0,
            versions: vec![Arc::new(v)],
            compact_pointer: Default::default(),
            descriptor_log: None,
            pending_outputs: HashSet::new(),
        }
    }

    pub fn current(&self) -> Arc<Version<E>> {
        self.versions.last().unwrap().clone()
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, n: SequenceNumber) {
        assert!(n >= self.last_sequence);
        self.last_sequence = n;
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let ret = self.next_file_number;
        self.next_file_number += 1;
        ret
    }

    // Give back an unused allocation if nothing newer was handed out.
    pub fn reuse_file_number(&mut self, file_number: u64) {
        if self.next_file_number == file_number + 1 {
            self.next_file_number = file_number;
        }
    }

    pub fn mark_file_number_used(&mut self, file_number: u64) {
        if self.next_file_number <= file_number {
            self.next_file_number = file_number + 1;
        }
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current().num_files(level)
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        self.current().level_total_file_size(level)
    }

    pub fn live_files(&self, live: &mut HashSet<u64>) {
        for v in self.versions.iter() {
            v.live_files(live);
        }
    }

    pub fn needs_compaction(&self) -> bool {
        let current = self.current();
        current.compaction_score >= 1.0 || current.file_to_compact().is_some()
    }

    // Drop versions no longer pinned by snapshots, iterators, or
    // in-flight reads. The current version always stays.
    fn prune_versions(&mut self) {
        let current = self.current();
        self.versions
            .retain(|v| Arc::strong_count(v) > 1 || Arc::ptr_eq(v, &current));
    }

    fn finalize(&self, version: &mut Version<E>) {
        let mut best_level = -1i32;
        let mut best_score = -1f64;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // File count, not bytes: every L0 file widens reads.
                version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                version.level_total_file_size(level) as f64
                    / crate::version::max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level as i32;
                best_score = score;
            }
        }
        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    // Load the catalog named by CURRENT. Returns true when the caller
    // should write a fresh manifest (always, since manifests are not
    // reused across opens).
    pub fn recover(&mut self) -> Result<bool> {
        let mut current = String::with_capacity(64);
        let current_file = current_file_name(&self.db_name);
        read_file_to_string(self.env.clone(), &current_file, &mut current)?;
        if current.is_empty() || !current.ends_with('\n') {
            return Err(Error::Corruption(
                "CURRENT file does not end with newline".into(),
            ));
        }
        current.truncate(current.len() - 1);

        let descriptor_name = Path::new(&self.db_name).join(&current);
        let file = self.env.new_sequential_file(&descriptor_name)?;
        let mut reader = LogReader::new(file, true);
        let mut record = Vec::new();
        let mut builder = VersionBuilder::new(self.current(), self.icmp.clone());

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while reader.read_record(&mut record)?.is_some() {
            let mut edit = VersionEdit::default();
            edit.decode(record.as_slice())?;
            if let Some(name) = edit.comparator.as_ref() {
                if name != self.icmp.user_comparator().name() {
                    return Err(Error::InvalidArgument(format!(
                        "comparator {} does not match existing comparator {}",
                        self.icmp.user_comparator().name(),
                        name,
                    )));
                }
            }
            builder.apply(&edit, &mut self.compact_pointer);

            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("no next-file entry in manifest".into()))?;
        let log_number =
            log_number.ok_or_else(|| Error::Corruption("no log-number entry in manifest".into()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::Corruption("no last-sequence entry in manifest".into()))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        let mut version = Version::new(
            self.icmp.clone(),
            self.options.clone(),
            self.table_cache.clone(),
        );
        builder.save_to(&mut version);
        self.finalize(&mut version);
        self.versions.push(Arc::new(version));
        self.prune_versions();

        self.manifest_file_number = next_file_number;
        self.next_file_number = next_file_number + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        Ok(true)
    }

    // Apply the edit to the current version, persist it to the manifest,
    // and install the result. The engine mutex is held throughout; the
    // write path only touches the version set briefly, so the manifest
    // append does not sit on the hot path.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        if let Some(n) = edit.log_number {
            assert!(n >= self.log_number);
            assert!(n < self.next_file_number);
        } else {
            edit.set_log_number(self.log_number);
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut version = Version::new(
            self.icmp.clone(),
            self.options.clone(),
            self.table_cache.clone(),
        );
        {
            let mut builder = VersionBuilder::new(self.current(), self.icmp.clone());
            builder.apply(edit, &mut self.compact_pointer);
            builder.save_to(&mut version);
        }
        self.finalize(&mut version);

        // The first edit after open creates a fresh manifest seeded with a
        // snapshot of the current state, then repoints CURRENT.
        let mut created_manifest = false;
        if self.descriptor_log.is_none() {
            created_manifest = true;
            let manifest_name = descriptor_file_name(&self.db_name, self.manifest_file_number);
            let manifest_file = self.env.new_writable_file(&manifest_name)?;
            let mut writer = LogWriter::new(manifest_file);
            match self.write_snapshot(&mut writer) {
                Ok(_) => self.descriptor_log = Some(writer),
                Err(e) => {
                    let _ = self.env.delete_file(&manifest_name);
                    return Err(e);
                }
            }
        }

        let mut record = Vec::new();
        edit.encode(&mut record);
        let writer = self.descriptor_log.as_mut().unwrap();
        writer.add_record(&record)?;
        writer.sync()?;

        if created_manifest {
            set_current_file(self.env.clone(), &self.db_name, self.manifest_file_number)?;
        }

        self.versions.push(Arc::new(version));
        self.prune_versions();

        self.log_number = edit.log_number.unwrap();
        self.prev_log_number = edit.prev_log_number.unwrap();

        Ok(())
    }

    fn write_snapshot(&self, writer: &mut LogWriter<E::WritableFile>) -> Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator(self.icmp.user_comparator().name());

        for (level, cursor) in self.compact_pointer.iter().enumerate() {
            if !cursor.is_empty() {
                let mut key = InternalKey::empty();
                key.decode(cursor);
                edit.add_compact_pointer(level, key);
            }
        }

        for (level, files) in self.current().files.iter().enumerate() {
            for f in files.iter() {
                edit.add_new_file(
                    level,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
            }
        }

        let mut record = Vec::new();
        edit.encode(&mut record);
        writer.add_record(&record)?;
        Ok(())
    }

    fn range_of(&self, inputs: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
        assert!(!inputs.is_empty());
        let mut smallest = inputs[0].smallest.clone();
        let mut largest = inputs[0].largest.clone();
        for f in inputs.iter().skip(1) {
            if self.icmp.compare(f.smallest.encode(), smallest.encode()) == Ordering::Less {
                smallest = f.smallest.clone();
            }
            if self.icmp.compare(f.largest.encode(), largest.encode()) == Ordering::Greater {
                largest = f.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn range_of_2(
        &self,
        inputs0: &[Arc<FileMetaData>],
        inputs1: &[Arc<FileMetaData>],
    ) -> (InternalKey, InternalKey) {
        let mut all = inputs0.to_vec();
        all.extend_from_slice(inputs1);
        self.range_of(&all)
    }

    pub fn pick_compaction(&mut self) -> Option<Compaction<E>> {
        let current = self.current();

        // Size triggers dominate seek triggers.
        let size_compaction = current.compaction_score >= 1.0;
        let seek_compaction = current.file_to_compact();

        let mut c = if size_compaction {
            let level = current.compaction_level as usize;
            assert!(level + 1 < NUM_LEVELS);
            let mut c = Compaction::new(&self.options, level, self.icmp.clone());

            // Resume after the last compacted key in this level.
            for f in current.files[level].iter() {
                if self.compact_pointer[level].is_empty()
                    || self
                        .icmp
                        .compare(f.largest.encode(), &self.compact_pointer[level])
                        == Ordering::Greater
                {
                    c.inputs[0].push(f.clone());
                    break;
                }
            }
            if c.inputs[0].is_empty() {
                // Wrap around.
                c.inputs[0].push(current.files[level][0].clone());
            }
            c
        } else if let Some((f, level)) = seek_compaction {
            let mut c = Compaction::new(&self.options, level, self.icmp.clone());
            c.inputs[0].push(f);
            c
        } else {
            return None;
        };

        c.input_version = Some(current.clone());

        if c.level == 0 {
            // L0 files overlap; take every transitive neighbor.
            let (smallest, largest) = self.range_of(&c.inputs[0]);
            c.inputs[0] = current.overlapping_inputs(0, Some(&smallest), Some(&largest));
            assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    // A manual slice over [begin, end] in the level; None when nothing
    // overlaps. Large ranges are trimmed to bound the slice.
    pub fn pick_range_compaction(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction<E>> {
        let current = self.current();
        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        if level > 0 {
            let limit = max_file_size_for_level(&self.options, level);
            let mut total = 0;
            for (i, f) in inputs.iter().enumerate() {
                total += f.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(&self.options, level, self.icmp.clone());
        c.input_version = Some(current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction<E>) {
        let current = c.input_version.clone().unwrap();
        let level = c.level;
        let (smallest, mut largest) = self.range_of(&c.inputs[0]);

        c.inputs[1] = current.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        let (mut all_start, mut all_limit) = self.range_of_2(&c.inputs[0], &c.inputs[1]);

        // Try growing the level-L side without touching more of L+1.
        if !c.inputs[1].is_empty() {
            let expanded0 = current.overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = self.range_of(&expanded0);
                let expanded1 =
                    current.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                if expanded1.len() == c.inputs[1].len() {
                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let all = self.range_of_2(&c.inputs[0], &c.inputs[1]);
                    all_start = all.0;
                    all_limit = all.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Future picks in this level resume past the chosen range even if
        // this compaction later fails.
        self.compact_pointer[level] = largest.encode().to_vec();
        c.edit.add_compact_pointer(level, largest);
    }

    pub fn make_input_iterator(&self, c: &Compaction<E>) -> Result<Box<dyn DBIterator>> {
        let option = ReadOption {
            verify_checksum: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut list: Vec<Box<dyn DBIterator>> = Vec::new();
        for which in 0..2 {
            if c.inputs[which].is_empty() {
                continue;
            }
            if c.level + which == 0 {
                for f in c.inputs[which].iter() {
                    let table = self.table_cache.find_table(f.number, f.file_size)?;
                    list.push(Box::new(crate::sstable::Table::iter(table, option.clone())));
                }
            } else {
                list.push(Box::new(
                    crate::sstable::two_level_iterator::TwoLevelIterator::new(
                        LevelFileNumIterator::new(self.icmp.clone(), c.inputs[which].clone()),
                        LevelTableIterBuilder {
                            table_cache: self.table_cache.clone(),
                        },
                        option.clone(),
                    ),
                ));
            }
        }
        Ok(Box::new(MergingIterator::new(self.icmp.clone(), list)))
    }
}

impl<E: Env> Debug for VersionSet<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("db_name", &self.db_name)
            .field("last_sequence", &self.last_sequence)
            .field("next_file_number", &self.next_file_number)
            .field("manifest_file_number", &self.manifest_file_number)
            .field("log_number", &self.log_number)
            .field("prev_log_number", &self.prev_log_number)
            .field("current", &self.current())
            .field("pending_outputs", &self.pending_outputs)
            .finish()
    }
}

// One planned compaction: inputs from level and level+1, grandparents for
// overlap accounting, and the edit that will install the outputs.
pub struct Compaction<E: Env> {
    pub level: usize,
    max_output_file_size: u64,
    max_grand_parent_overlap: u64,
    icmp: InternalKeyComparator,

    pub input_version: Option<Arc<Version<E>>>,
    pub edit: VersionEdit,
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
    grandparents: Vec<Arc<FileMetaData>>,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursors for is_base_level_for_key; valid because keys
    // arrive in ascending user-key order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl<E: Env> Compaction<E> {
    fn new(options: &Arc<Options>, level: usize, icmp: InternalKeyComparator) -> Self {
        Compaction {
            level,
            max_output_file_size: max_file_size_for_level(options, level),
            max_grand_parent_overlap: max_grand_parent_overlap_bytes(options),
            icmp,
            input_version: None,
            edit: VersionEdit::default(),
            inputs: Default::default(),
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    // A single input file with no level+1 overlap can be renamed into the
    // next level, as long as it does not drown the grandparent level.
    pub fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grand_parent_overlap
    }

    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in self.inputs[which].iter() {
                self.edit.add_delete_file(self.level + which, f.number);
            }
        }
    }

    // True when no level deeper than the output contains the user key,
    // so an obsolete tombstone can be dropped.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let ucmp = self.icmp.user_comparator();
        let version = self.input_version.as_ref().unwrap();
        for level in (self.level + 2)..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    // Split outputs early when they would overlap too much of level+2,
    // bounding the cost of compacting the output later.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encode(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grand_parent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }
}
