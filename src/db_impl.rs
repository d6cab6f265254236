use std::{
    collections::{HashSet, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use crate::{
    builder::build_table,
    cmp::InternalKeyComparator,
    consts::{L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, NUM_LEVELS},
    db_iter::DbIter,
    env::Env,
    error::{Error, Result},
    filenames::{
        current_file_name, descriptor_file_name, lock_file_name, log_file_name, parse_file_name,
        set_current_file, table_file_name, FileType,
    },
    filter::InternalFilterPolicy,
    format::{InternalKey, ParsedInternalKey},
    iterator::DBIterator,
    log::{LogReader, LogWriter},
    memtable::{LookupKey, MemTable},
    merge::MergingIterator,
    options::{Options, ReadOption, WriteOption},
    snapshot::{Snapshot, SnapshotList},
    sstable::{Table, TableBuilder},
    table_cache::TableCache,
    types::{SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER},
    version::{FileMetaData, Version},
    version_edit::VersionEdit,
    version_set::{Compaction, VersionSet},
    write_batch::WriteBatch,
};

const NUM_NON_TABLE_CACHE_FILES: u64 = 10;

fn table_cache_size(options: &Options) -> u64 {
    options.max_open_files.saturating_sub(NUM_NON_TABLE_CACHE_FILES)
}

// Tables and blocks order internal keys and filter on the user portion;
// swap in the engine-level wrappers while the caller's comparator stays
// reachable through the internal one.
fn sanitize_options(mut options: Options, icmp: &InternalKeyComparator) -> Options {
    options.comparator = Arc::new(icmp.clone());
    if let Some(policy) = options.filter_policy.take() {
        options.filter_policy = Some(Arc::new(InternalFilterPolicy::new(policy)));
    }
    options
}

enum WriterSignal {
    Done(Result<()>),
    Lead,
}

struct Writer {
    batch: Option<WriteBatch>,
    sync: bool,
    tx: Sender<WriterSignal>,
}

struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

#[derive(Default, Clone, Copy)]
struct CompactionStats {
    bytes_read: u64,
    bytes_written: u64,
}

struct CompactionState<E: Env> {
    compaction: Compaction<E>,
    smallest_snapshot: SequenceNumber,
    outputs: Vec<FileMetaData>,
    builder: Option<TableBuilder<E::WritableFile>>,
    total_bytes: u64,
}

impl<E: Env> CompactionState<E> {
    fn new(compaction: Compaction<E>, smallest_snapshot: SequenceNumber) -> Self {
        CompactionState {
            compaction,
            smallest_snapshot,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        }
    }

    fn current_output(&mut self) -> &mut FileMetaData {
        self.outputs.last_mut().unwrap()
    }
}

struct DbState<E: Env> {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,

    wal: Option<LogWriter<E::WritableFile>>,
    log_file_number: u64,

    versions: VersionSet<E>,

    writers: VecDeque<Writer>,
    snapshots: SnapshotList,

    background_compaction_scheduled: bool,
    background_error: Option<Error>,
    manual_compaction: Option<Arc<Mutex<ManualCompaction>>>,

    stats: [CompactionStats; NUM_LEVELS],
}

pub struct DbInner<E: Env> {
    db_name: String,
    env: E,
    options: Arc<Options>,
    internal_comparator: InternalKeyComparator,
    table_cache: TableCache<E>,

    // The engine mutex; every piece of mutable engine state lives behind
    // it. Heavy I/O (WAL append, table builds, merge loops) runs with it
    // released.
    state: Mutex<DbState<E>>,
    background_work_finished: Condvar,

    shutting_down: AtomicBool,
    // Mirrors state.imm.is_some() so the compaction merge loop can poll
    // for flush preemption without taking the mutex.
    has_imm: AtomicBool,

    compaction_trigger: (Sender<()>, Receiver<()>),
    db_lock: Mutex<Option<E::FileLock>>,
}

pub struct Db<E: Env> {
    inner: Arc<DbInner<E>>,
    bg_worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<E: Env> Db<E> {
    pub fn open(options: Options, db_name: impl Into<String>, env: E) -> Result<Db<E>> {
        let db_name = db_name.into();
        let inner = Arc::new(DbInner::new(options, &db_name, env));

        let mut edit = VersionEdit::default();
        let mut save_manifest = false;
        inner.recover(&mut edit, &mut save_manifest)?;

        {
            let mut state = inner.state.lock().unwrap();
            let new_log_number = state.versions.new_file_number();
            let file = inner
                .env
                .new_writable_file(&log_file_name(&db_name, new_log_number))?;
            state.wal = Some(LogWriter::new(file));
            state.log_file_number = new_log_number;

            if save_manifest {
                edit.set_prev_log_number(0);
                edit.set_log_number(new_log_number);
                state.versions.log_and_apply(&mut edit)?;
            }

            inner.delete_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("silt-compaction".to_string())
                .spawn(move || {
                    while inner.compaction_trigger.1.recv().is_ok() {
                        if inner.shutting_down.load(Ordering::Acquire) {
                            inner.finish_background_work_on_shutdown();
                            break;
                        }
                        inner.background_call();
                    }
                })
                .map_err(|e| Error::IOError(e.to_string()))?
        };

        Ok(Db {
            inner,
            bg_worker: Mutex::new(Some(worker)),
        })
    }

    pub fn put(&self, options: &WriteOption, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.inner.write(options, Some(batch))
    }

    pub fn delete(&self, options: &WriteOption, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.inner.write(options, Some(batch))
    }

    pub fn write(&self, options: &WriteOption, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, Some(batch))
    }

    pub fn get(&self, options: &ReadOption, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    pub fn iter(&self, options: &ReadOption) -> Result<DbIter<E>> {
        self.inner.iter(options)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot()
    }

    pub fn release_snapshot(&self, snapshot: Arc<Snapshot>) {
        self.inner.release_snapshot(snapshot)
    }

    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        self.inner.approximate_sizes(ranges)
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    pub fn close(&self) -> Result<()> {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Wake the worker so it can observe the flag and drain.
        let _ = self.inner.compaction_trigger.0.send(());
        {
            let mut state = self.inner.state.lock().unwrap();
            while state.background_compaction_scheduled {
                state = self.inner.background_work_finished.wait(state).unwrap();
            }
        }
        if let Some(handle) = self.bg_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.background_work_finished.notify_all();

        if let Some(lock) = self.inner.db_lock.lock().unwrap().take() {
            self.inner.env.unlock_file(lock)?;
        }
        Ok(())
    }
}

impl<E: Env> Drop for Db<E> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<E: Env> DbInner<E> {
    fn new(options: Options, db_name: impl Into<String>, env: E) -> Self {
        let db_name = db_name.into();
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let options = Arc::new(sanitize_options(options, &icmp));
        let table_cache = TableCache::new(
            db_name.clone(),
            options.clone(),
            env.clone(),
            table_cache_size(&options),
        );

        let versions = VersionSet::new(
            env.clone(),
            db_name.clone(),
            options.clone(),
            table_cache.clone(),
            icmp.clone(),
        );

        DbInner {
            db_name,
            env,
            internal_comparator: icmp.clone(),
            table_cache,
            state: Mutex::new(DbState {
                mem: Arc::new(MemTable::new(icmp)),
                imm: None,
                wal: None,
                log_file_number: 0,
                versions,
                writers: VecDeque::new(),
                snapshots: SnapshotList::new(),
                background_compaction_scheduled: false,
                background_error: None,
                manual_compaction: None,
                stats: [CompactionStats::default(); NUM_LEVELS],
            }),
            background_work_finished: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            compaction_trigger: unbounded(),
            db_lock: Mutex::new(None),
            options,
        }
    }

    // ===== open/recovery =====

    fn new_db(&self) -> Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator(self.internal_comparator.user_comparator().name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(&self.db_name, 1);
        let file = self.env.new_writable_file(&manifest)?;
        let mut log = LogWriter::new(file);
        let mut record = Vec::new();
        edit.encode(&mut record);

        let mut res = log.add_record(&record);
        if res.is_ok() {
            res = log.sync();
        }
        match res {
            Ok(()) => set_current_file(self.env.clone(), &self.db_name, 1),
            Err(e) => {
                let _ = self.env.delete_file(&manifest);
                Err(e)
            }
        }
    }

    fn recover(&self, edit: &mut VersionEdit, save_manifest: &mut bool) -> Result<()> {
        let db_path = Path::new(&self.db_name);
        let _ = self.env.create_dir(db_path);

        let lock = self
            .env
            .lock_file(&lock_file_name(&self.db_name))
            .map_err(|e| Error::LockError(e.to_string()))?;
        *self.db_lock.lock().unwrap() = Some(lock);

        if !self.env.file_exists(&current_file_name(&self.db_name)) {
            if self.options.create_if_missing {
                self.new_db()?;
            } else {
                return Err(Error::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    self.db_name
                )));
            }
        } else if self.options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                self.db_name
            )));
        }

        let mut state = self.state.lock().unwrap();
        *save_manifest = state.versions.recover()?;

        // Replay every log at or after the one the manifest names.
        let min_log = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();
        let mut file_names = Vec::new();
        self.env.get_children(db_path, &mut file_names)?;

        let mut expected = HashSet::new();
        state.versions.live_files(&mut expected);

        let mut logs = Vec::new();
        for f in file_names.iter() {
            if let Ok((number, file_type)) = parse_file_name(f) {
                expected.remove(&number);
                if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                    logs.push(number);
                }
            }
        }
        if !expected.is_empty() {
            return Err(Error::Corruption(format!(
                "{} missing table files, e.g. {:06}",
                expected.len(),
                expected.iter().next().unwrap()
            )));
        }
        drop(state);

        logs.sort_unstable();
        let mut max_sequence = 0;
        for number in logs.iter() {
            self.recover_log_file(*number, save_manifest, edit, &mut max_sequence)?;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(last) = logs.last() {
            state.versions.mark_file_number_used(*last);
        }
        if state.versions.last_sequence() < max_sequence {
            state.versions.set_last_sequence(max_sequence);
        }
        Ok(())
    }

    fn recover_log_file(
        &self,
        log_number: u64,
        save_manifest: &mut bool,
        edit: &mut VersionEdit,
        max_sequence: &mut SequenceNumber,
    ) -> Result<()> {
        let fname = log_file_name(&self.db_name, log_number);
        let file = self.env.new_sequential_file(&fname)?;
        let mut reader = LogReader::new(file, true);

        let mut mem: Option<Arc<MemTable>> = None;
        let mut record = Vec::with_capacity(1024);
        loop {
            match reader.read_record(&mut record) {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    if self.options.paranoid_checks {
                        return Err(e);
                    }
                    // A damaged record ends the usable log.
                    break;
                }
            }
            if record.len() < 12 {
                if self.options.paranoid_checks {
                    return Err(Error::Corruption("log record too small".into()));
                }
                continue;
            }

            let mut batch = WriteBatch::new();
            batch.set_content(record.clone())?;

            if mem.is_none() {
                mem = Some(Arc::new(MemTable::new(self.internal_comparator.clone())));
            }
            let memtable = mem.as_ref().unwrap().clone();
            batch.insert_into(&memtable)?;

            if batch.count() > 0 {
                let last_sequence = batch.sequence() + batch.count() as SequenceNumber - 1;
                if last_sequence > *max_sequence {
                    *max_sequence = last_sequence;
                }
            }

            if memtable.approximate_memory_usage() > self.options.write_buffer_size as usize {
                *save_manifest = true;
                let full = mem.take().unwrap();
                self.write_level0_table_at_open(full, edit)?;
            }
        }

        if let Some(m) = mem {
            *save_manifest = true;
            self.write_level0_table_at_open(m, edit)?;
        }
        Ok(())
    }

    fn write_level0_table_at_open(&self, mem: Arc<MemTable>, edit: &mut VersionEdit) -> Result<()> {
        let state = self.state.lock().unwrap();
        let (state, res) = self.write_level0_table(state, mem, edit, None);
        drop(state);
        res
    }

    // ===== write path =====

    pub fn write(&self, options: &WriteOption, batch: Option<WriteBatch>) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown("database is closing".into()));
        }

        let (tx, rx) = bounded(1);
        let is_leader = {
            let mut state = self.state.lock().unwrap();
            state.writers.push_back(Writer {
                batch,
                sync: options.sync,
                tx,
            });
            state.writers.len() == 1
        };

        if !is_leader {
            match rx.recv()? {
                WriterSignal::Done(result) => return result,
                WriterSignal::Lead => {}
            }
        }
        self.run_write_leader()
    }

    // The queue head commits a group of batches: one WAL record, one
    // memtable replay, one sequence range.
    fn run_write_leader(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let force = state.writers.front().unwrap().batch.is_none();
        let sync = state.writers.front().unwrap().sync;

        let (mut state, room) = self.make_room_for_write(state, force);
        let mut last_sequence = state.versions.last_sequence();
        let mut group_count = 1;
        let mut result = room;

        if result.is_ok() && !force {
            let (mut batch, count) = Self::build_batch_group(&mut state);
            group_count = count;
            batch.set_sequence(last_sequence + 1);
            last_sequence += batch.count() as u64;

            // WAL append and memtable replay run without the mutex; the
            // leader has exclusive use of both by construction.
            let mut wal = state.wal.take().unwrap();
            let mem = state.mem.clone();
            drop(state);

            let mut sync_error = false;
            let mut status = wal.add_record(batch.content());
            if status.is_ok() && sync {
                status = wal.sync();
                if status.is_err() {
                    sync_error = true;
                }
            }
            if status.is_ok() {
                status = batch.insert_into(&mem);
            }

            state = self.state.lock().unwrap();
            state.wal = Some(wal);
            if sync_error {
                // The tail of the WAL is in an unknown state; refuse all
                // further writes until reopen.
                self.record_background_error(
                    &mut state,
                    status.as_ref().unwrap_err().clone(),
                );
            }
            state.versions.set_last_sequence(last_sequence);
            result = status;
        }

        for i in 0..group_count {
            let w = state.writers.pop_front().unwrap();
            if i > 0 {
                let _ = w.tx.send(WriterSignal::Done(result.clone()));
            }
        }
        if let Some(front) = state.writers.front() {
            let _ = front.tx.send(WriterSignal::Lead);
        }
        result
    }

    // Concatenate queued batches behind the leader, bounded so one huge
    // group cannot starve small writers, and without mixing durability
    // classes: a non-sync leader never absorbs a sync follower.
    fn build_batch_group(state: &mut DbState<E>) -> (WriteBatch, usize) {
        let leader = state.writers.front_mut().unwrap();
        let leader_sync = leader.sync;
        let batch = leader.batch.take().unwrap();

        // Small leaders keep a small cap so a burst of large writes does
        // not add unexpected latency to a tiny one.
        let leader_size = batch.approximate_size();
        let max_size = if leader_size <= (128 << 10) {
            leader_size + (128 << 10)
        } else {
            1 << 20
        };

        let mut group = batch;
        let mut size = leader_size;
        let mut count = 1;
        for w in state.writers.iter().skip(1) {
            if w.sync && !leader_sync {
                break;
            }
            let follower = match w.batch.as_ref() {
                Some(b) => b,
                // A rotation request must become leader to take effect.
                None => break,
            };
            size += follower.approximate_size();
            if size > max_size {
                break;
            }
            group.append(follower);
            count += 1;
        }
        (group, count)
    }

    fn make_room_for_write<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        force: bool,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let mut allow_delay = !force;
        let mut force = force;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return (state, Err(Error::Shutdown("database is closing".into())));
            }
            if let Some(err) = state.background_error.as_ref() {
                let err = err.background();
                return (state, Err(err));
            }
            if allow_delay && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER {
                // Convert an impending stall into one short pause per
                // write, letting the compactor share the disk.
                drop(state);
                thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                state = self.state.lock().unwrap();
                continue;
            }
            if !force
                && state.mem.approximate_memory_usage()
                    <= self.options.write_buffer_size as usize
            {
                break;
            }
            if state.imm.is_some() {
                // The previous rotation has not been flushed yet.
                state = self.background_work_finished.wait(state).unwrap();
                continue;
            }
            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                state = self.background_work_finished.wait(state).unwrap();
                continue;
            }

            // Rotate to a fresh WAL and memtable.
            let new_log_number = state.versions.new_file_number();
            let file = match self
                .env
                .new_writable_file(&log_file_name(&self.db_name, new_log_number))
            {
                Ok(f) => f,
                Err(e) => {
                    state.versions.reuse_file_number(new_log_number);
                    return (state, Err(e.into()));
                }
            };
            state.wal = Some(LogWriter::new(file));
            state.log_file_number = new_log_number;

            let imm = std::mem::replace(
                &mut state.mem,
                Arc::new(MemTable::new(self.internal_comparator.clone())),
            );
            state.imm = Some(imm);
            self.has_imm.store(true, Ordering::Release);
            force = false;
            self.maybe_schedule_compaction(&mut state);
        }
        (state, Ok(()))
    }

    // ===== read path =====

    pub fn get(&self, option: &ReadOption, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.background_error.as_ref() {
            return Err(err.background());
        }
        let snapshot = match option.snapshot {
            Some(ref s) => s.sequence(),
            None => state.versions.last_sequence(),
        };
        let mem = state.mem.clone();
        let imm = state.imm.clone();
        let current = state.versions.current();
        drop(state);

        let lookup_key = LookupKey::new(key, snapshot);
        if let Some(result) = mem.get(&lookup_key) {
            return Ok(result);
        }
        if let Some(ref imm) = imm {
            if let Some(result) = imm.get(&lookup_key) {
                return Ok(result);
            }
        }

        let (value, seek_stats) = current.get(option, &lookup_key)?;
        if current.update_stats(seek_stats) {
            let mut state = self.state.lock().unwrap();
            self.maybe_schedule_compaction(&mut state);
        }
        Ok(value)
    }

    pub fn iter(&self, option: &ReadOption) -> Result<DbIter<E>> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.background_error.as_ref() {
            return Err(err.background());
        }
        let sequence = match option.snapshot {
            Some(ref s) => s.sequence(),
            None => state.versions.last_sequence(),
        };
        let mem = state.mem.clone();
        let imm = state.imm.clone();
        let current = state.versions.current();

        let mut children = vec![mem.iter()];
        if let Some(ref imm) = imm {
            children.push(imm.iter());
        }
        current.append_iterators(option, &mut children)?;
        drop(state);

        let merged = MergingIterator::new(self.internal_comparator.clone(), children);
        Ok(DbIter::new(
            Box::new(merged),
            self.internal_comparator.user_comparator(),
            sequence,
            mem,
            imm,
            current,
        ))
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        let mut state = self.state.lock().unwrap();
        let sequence = state.versions.last_sequence();
        state.snapshots.acquire(sequence)
    }

    pub fn release_snapshot(&self, snapshot: Arc<Snapshot>) {
        let mut state = self.state.lock().unwrap();
        state.snapshots.release(&snapshot);
    }

    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let current = self.state.lock().unwrap().versions.current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = InternalKey::new(start, MAX_SEQUENCE_NUMBER, ValueType::Value);
                let k2 = InternalKey::new(limit, MAX_SEQUENCE_NUMBER, ValueType::Value);
                current
                    .approximate_offset_of(&k2)
                    .saturating_sub(current.approximate_offset_of(&k1))
            })
            .collect()
    }

    pub fn property(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        if let Some(rest) = name.strip_prefix("num-files-at-level") {
            let level: usize = rest.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }
        if name == "stats" {
            let mut out = String::new();
            out.push_str("                               Compactions\n");
            out.push_str("Level  Files Size(MB) Read(MB) Write(MB)\n");
            out.push_str("-----------------------------------------\n");
            for level in 0..NUM_LEVELS {
                let files = state.versions.num_level_files(level);
                let stats = state.stats[level];
                if files > 0 || stats.bytes_read > 0 || stats.bytes_written > 0 {
                    out.push_str(&format!(
                        "{:3} {:8} {:8.1} {:8.1} {:9.1}\n",
                        level,
                        files,
                        state.versions.num_level_bytes(level) as f64 / 1048576.0,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0,
                    ));
                }
            }
            return Some(out);
        }
        None
    }

    // ===== manual compaction =====

    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut max_level_with_files = 1;
        {
            let state = self.state.lock().unwrap();
            let current = state.versions.current();
            for level in 1..NUM_LEVELS {
                if current.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        self.flush_memtable()?;
        for level in 0..max_level_with_files {
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    fn flush_memtable(&self) -> Result<()> {
        // An empty batch forces rotation, then we wait out the flush.
        self.write(&WriteOption::default(), None)?;

        let mut state = self.state.lock().unwrap();
        while state.imm.is_some() && state.background_error.is_none() {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Shutdown("database is closing".into()));
            }
            state = self.background_work_finished.wait(state).unwrap();
        }
        if let Some(err) = state.background_error.as_ref() {
            return Err(err.background());
        }
        Ok(())
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let manual = Arc::new(Mutex::new(ManualCompaction {
            level,
            done: false,
            begin: begin.map(|k| InternalKey::new(k, MAX_SEQUENCE_NUMBER, ValueType::Value)),
            end: end.map(|k| InternalKey::new(k, 0, ValueType::Deletion)),
        }));

        let mut state = self.state.lock().unwrap();
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Shutdown("database is closing".into()));
            }
            if let Some(err) = state.background_error.as_ref() {
                return Err(err.background());
            }
            if manual.lock().unwrap().done {
                break;
            }
            if state.manual_compaction.is_none() {
                state.manual_compaction = Some(manual.clone());
                self.maybe_schedule_compaction(&mut state);
            }
            state = self.background_work_finished.wait(state).unwrap();
        }

        if let Some(m) = state.manual_compaction.as_ref() {
            if Arc::ptr_eq(m, &manual) {
                state.manual_compaction = None;
            }
        }
        Ok(())
    }

    // ===== background work =====

    fn record_background_error(&self, state: &mut DbState<E>, e: Error) {
        if state.background_error.is_none() {
            state.background_error = Some(e);
        }
        self.background_work_finished.notify_all();
    }

    fn maybe_schedule_compaction(&self, state: &mut DbState<E>) {
        if state.background_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if state.background_error.is_some() {
            return;
        }
        if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !state.versions.needs_compaction()
        {
            return;
        }
        state.background_compaction_scheduled = true;
        let _ = self.compaction_trigger.0.send(());
    }

    fn finish_background_work_on_shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.background_compaction_scheduled = false;
        drop(state);
        self.background_work_finished.notify_all();
    }

    fn background_call(&self) {
        let mut state = self.state.lock().unwrap();
        if state.background_compaction_scheduled
            && !self.shutting_down.load(Ordering::Acquire)
            && state.background_error.is_none()
        {
            state = self.background_compaction(state);
        }
        state.background_compaction_scheduled = false;

        // More work may have arrived while this round ran.
        self.maybe_schedule_compaction(&mut state);
        drop(state);
        self.background_work_finished.notify_all();
    }

    fn background_compaction<'a>(
        &'a self,
        state: MutexGuard<'a, DbState<E>>,
    ) -> MutexGuard<'a, DbState<E>> {
        let mut state = state;

        if state.imm.is_some() {
            let (mut state, res) = self.compact_memtable(state);
            if let Err(e) = res {
                if !self.shutting_down.load(Ordering::Acquire) {
                    self.record_background_error(&mut state, e);
                }
            }
            return state;
        }

        let manual = state.manual_compaction.clone();
        let (compaction, manual_end) = match manual {
            Some(ref m) => {
                let mut mc = m.lock().unwrap();
                let c = state.versions.pick_range_compaction(
                    mc.level,
                    mc.begin.as_ref(),
                    mc.end.as_ref(),
                );
                mc.done = c.is_none();
                let manual_end = c
                    .as_ref()
                    .map(|c| c.input(0, c.num_input_files(0) - 1).largest.clone());
                (c, manual_end)
            }
            None => (state.versions.pick_compaction(), None),
        };

        let is_manual = manual.is_some();
        let mut status = Ok(());
        match compaction {
            None => {}
            Some(mut c) if !is_manual && c.is_trivial_move() => {
                // Relocate the file without rewriting a byte.
                let f = c.input(0, 0).clone();
                let level = c.level();
                c.edit_mut().add_delete_file(level, f.number);
                c.edit_mut().add_new_file(
                    level + 1,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
                status = state.versions.log_and_apply(c.edit_mut());
                c.release_inputs();
                self.delete_obsolete_files(&mut state);
            }
            Some(c) => {
                let (s, res) = self.do_compaction_work(state, c);
                state = s;
                status = res;
                self.delete_obsolete_files(&mut state);
            }
        }

        if let Err(ref e) = status {
            if !self.shutting_down.load(Ordering::Acquire) {
                self.record_background_error(&mut state, e.clone());
            }
        }

        if let Some(m) = manual {
            let mut mc = m.lock().unwrap();
            if status.is_err() {
                mc.done = true;
            }
            if !mc.done {
                // Partial progress: resume after the compacted slice.
                mc.begin = manual_end;
            }
            state.manual_compaction = None;
        }
        state
    }

    fn compact_memtable<'a>(
        &'a self,
        state: MutexGuard<'a, DbState<E>>,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let imm = match state.imm {
            Some(ref m) => m.clone(),
            None => return (state, Ok(())),
        };
        let base = state.versions.current();
        let mut edit = VersionEdit::default();

        let (mut state, mut res) = self.write_level0_table(state, imm, &mut edit, Some(base));

        if res.is_ok() && self.shutting_down.load(Ordering::Acquire) {
            res = Err(Error::Shutdown(
                "database closed during memtable flush".into(),
            ));
        }
        if res.is_ok() {
            edit.set_prev_log_number(0);
            edit.set_log_number(state.log_file_number);
            res = state.versions.log_and_apply(&mut edit);
        }
        if res.is_ok() {
            state.imm = None;
            self.has_imm.store(false, Ordering::Release);
            self.delete_obsolete_files(&mut state);
        }
        (state, res)
    }

    fn write_level0_table<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        mem: Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<Arc<Version<E>>>,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let number = state.versions.new_file_number();
        state.versions.pending_outputs.insert(number);
        let mut meta = FileMetaData {
            number,
            ..Default::default()
        };
        let iter = mem.iter();
        drop(state);

        let res = build_table(
            &self.db_name,
            self.env.clone(),
            &self.options,
            &self.table_cache,
            iter,
            &mut meta,
        );

        let mut state = self.state.lock().unwrap();
        state.versions.pending_outputs.remove(&number);

        let mut level = 0;
        if res.is_ok() && meta.file_size > 0 {
            if let Some(base) = base {
                level = base
                    .pick_level_for_memtable_output(meta.smallest.user_key(), meta.largest.user_key());
            }
            edit.add_new_file(
                level,
                meta.number,
                meta.file_size,
                meta.smallest.clone(),
                meta.largest.clone(),
            );
        }
        state.stats[level].bytes_written += meta.file_size;
        (state, res)
    }

    fn do_compaction_work<'a>(
        &'a self,
        state: MutexGuard<'a, DbState<E>>,
        compaction: Compaction<E>,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let mut state = state;
        let smallest_snapshot = if state.snapshots.is_empty() {
            state.versions.last_sequence()
        } else {
            state.snapshots.oldest()
        };

        let input = match state.versions.make_input_iterator(&compaction) {
            Ok(i) => i,
            Err(e) => return (state, Err(e)),
        };

        let level = compaction.level();
        let bytes_read = crate::version::total_file_size(&compaction.inputs[0])
            + crate::version::total_file_size(&compaction.inputs[1]);
        let mut compact = CompactionState::new(compaction, smallest_snapshot);
        drop(state);

        let result = self.compaction_merge_loop(&mut compact, input);

        let mut state = self.state.lock().unwrap();
        let result = match result {
            Ok(()) => self.install_compaction_results(&mut state, &mut compact),
            Err(e) => Err(e),
        };

        for out in compact.outputs.iter() {
            state.versions.pending_outputs.remove(&out.number);
        }
        state.stats[level + 1].bytes_read += bytes_read;
        state.stats[level + 1].bytes_written += compact.total_bytes;
        compact.compaction.release_inputs();
        (state, result)
    }

    // The merge itself, run without the engine mutex. Flushes preempt:
    // the immutable memtable is checked between iterator steps.
    fn compaction_merge_loop(
        &self,
        compact: &mut CompactionState<E>,
        mut input: Box<dyn DBIterator>,
    ) -> Result<()> {
        input.seek_to_first();

        let ucmp = self.internal_comparator.user_comparator();
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;
        let mut key = Vec::new();

        while input.valid() {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Shutdown("database closed during compaction".into()));
            }

            if self.has_imm.load(Ordering::Relaxed) {
                let state = self.state.lock().unwrap();
                if state.imm.is_some() {
                    let (state, res) = self.compact_memtable(state);
                    drop(state);
                    res?;
                    self.background_work_finished.notify_all();
                }
            }

            key.clear();
            key.extend_from_slice(input.key());

            if compact.compaction.should_stop_before(&key) && compact.builder.is_some() {
                self.finish_compaction_output(compact)?;
            }

            let mut drop_entry = false;
            match ParsedInternalKey::try_parse(&key) {
                None => {
                    if self.options.paranoid_checks {
                        return Err(Error::Corruption(
                            "unparsable internal key in compaction".into(),
                        ));
                    }
                    // Keep the bytes verbatim and forget key history.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Some(parsed) => {
                    let first_occurrence = match current_user_key {
                        Some(ref k) => {
                            ucmp.compare(k, parsed.user_key) != std::cmp::Ordering::Equal
                        }
                        None => true,
                    };
                    if first_occurrence {
                        current_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= compact.smallest_snapshot {
                        // Shadowed by a newer revision already emitted.
                        drop_entry = true;
                    } else if parsed.val_type == ValueType::Deletion
                        && parsed.sequence <= compact.smallest_snapshot
                        && compact.compaction.is_base_level_for_key(parsed.user_key)
                    {
                        // No deeper level holds this key, so the tombstone
                        // has nothing left to shadow.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                if compact.builder.is_none() {
                    self.open_compaction_output_file(compact)?;
                }
                let builder = compact.builder.as_mut().unwrap();
                if builder.num_entries() == 0 {
                    compact.outputs.last_mut().unwrap().smallest.decode(&key);
                }
                compact.outputs.last_mut().unwrap().largest.decode(&key);
                builder.add(&key, input.value())?;

                if compact.builder.as_ref().unwrap().file_size()
                    >= compact.compaction.max_output_file_size()
                {
                    self.finish_compaction_output(compact)?;
                }
            }

            input.next();
        }

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown("database closed during compaction".into()));
        }
        if compact.builder.is_some() {
            self.finish_compaction_output(compact)?;
        }
        input.status()
    }

    fn open_compaction_output_file(&self, compact: &mut CompactionState<E>) -> Result<()> {
        let file_number = {
            let mut state = self.state.lock().unwrap();
            let n = state.versions.new_file_number();
            state.versions.pending_outputs.insert(n);
            n
        };
        compact.outputs.push(FileMetaData {
            number: file_number,
            ..Default::default()
        });

        let file_name = table_file_name(&self.db_name, file_number);
        let file = self.env.new_writable_file(&file_name)?;
        compact.builder = Some(TableBuilder::new(self.options.clone(), file));
        Ok(())
    }

    fn finish_compaction_output(&self, compact: &mut CompactionState<E>) -> Result<()> {
        let builder = compact.builder.take().unwrap();
        let output_number = compact.current_output().number;
        assert!(output_number > 0);

        let entries = builder.num_entries();
        let bytes = builder.finish(true)?;
        compact.current_output().file_size = bytes;
        compact.total_bytes += bytes;

        if entries > 0 {
            // Make sure the new table is usable before installing it.
            let table = self.table_cache.find_table(output_number, bytes)?;
            let mut iter = Table::iter(
                table,
                ReadOption {
                    verify_checksum: self.options.paranoid_checks,
                    fill_cache: false,
                    snapshot: None,
                },
            );
            iter.status()?;
        }
        Ok(())
    }

    fn install_compaction_results(
        &self,
        state: &mut DbState<E>,
        compact: &mut CompactionState<E>,
    ) -> Result<()> {
        compact.compaction.add_input_deletions();
        let level = compact.compaction.level();
        for out in compact.outputs.iter() {
            compact.compaction.edit_mut().add_new_file(
                level + 1,
                out.number,
                out.file_size,
                out.smallest.clone(),
                out.largest.clone(),
            );
        }
        state.versions.log_and_apply(compact.compaction.edit_mut())
    }

    // Remove files no installed version references and nothing in
    // flight still claims.
    fn delete_obsolete_files(&self, state: &mut DbState<E>) {
        if state.background_error.is_some() {
            // State of the last edit is uncertain; keep everything.
            return;
        }

        let mut live = state.versions.pending_outputs.clone();
        state.versions.live_files(&mut live);

        let mut file_names = Vec::new();
        if self
            .env
            .get_children(Path::new(&self.db_name), &mut file_names)
            .is_err()
        {
            return;
        }

        for name in file_names {
            if let Ok((number, file_type)) = parse_file_name(&name) {
                let keep = match file_type {
                    FileType::Log => {
                        number >= state.versions.log_number()
                            || number == state.versions.prev_log_number()
                    }
                    FileType::Descriptor => number >= state.versions.manifest_file_number(),
                    FileType::Table | FileType::Temp => live.contains(&number),
                    FileType::Current | FileType::DBLock | FileType::InfoLog => true,
                };
                if !keep {
                    if file_type == FileType::Table {
                        self.table_cache.evict(number);
                    }
                    let _ = self
                        .env
                        .delete_file(&Path::new(&self.db_name).join(&name));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::posix::PosixEnv;
    use tempfile::TempDir;

    fn test_dir() -> TempDir {
        tempfile::Builder::new().prefix("silt_db").tempdir().unwrap()
    }

    fn open_db(dir: &TempDir, options: Options) -> Db<PosixEnv> {
        let mut options = options;
        options.create_if_missing = true;
        Db::open(options, dir.path().to_str().unwrap(), PosixEnv {}).unwrap()
    }

    fn put(db: &Db<PosixEnv>, key: &str, value: &str) {
        db.put(&WriteOption::default(), key.as_bytes(), value.as_bytes())
            .unwrap();
    }

    fn get(db: &Db<PosixEnv>, key: &str) -> Option<String> {
        db.get(&ReadOption::default(), key.as_bytes())
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap())
    }

    fn collect(db: &Db<PosixEnv>) -> Vec<(String, String)> {
        let mut iter = db.iter(&ReadOption::default()).unwrap();
        iter.seek_to_first();
        let mut out = Vec::new();
        while iter.valid() {
            out.push((
                String::from_utf8(iter.key().to_vec()).unwrap(),
                String::from_utf8(iter.value().to_vec()).unwrap(),
            ));
            iter.next();
        }
        out
    }

    #[test]
    fn test_open_missing_db_fails_without_create() {
        let dir = test_dir();
        let options = Options::default();
        let result = Db::open(
            options,
            dir.path().join("nope").to_str().unwrap(),
            PosixEnv {},
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_error_if_exists() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());
        db.close().unwrap();
        drop(db);

        let mut options = Options::default();
        options.create_if_missing = true;
        options.error_if_exists = true;
        let result = Db::open(options, dir.path().to_str().unwrap(), PosixEnv {});
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_basic_round_trip() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        put(&db, "a", "1");
        put(&db, "b", "2");
        db.delete(&WriteOption::default(), b"a").unwrap();

        assert_eq!(get(&db, "a"), None);
        assert_eq!(get(&db, "b"), Some("2".to_string()));
        assert_eq!(collect(&db), vec![("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn test_overwrite_returns_newest() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        put(&db, "k", "v1");
        put(&db, "k", "v2");
        put(&db, "k", "v3");
        assert_eq!(get(&db, "k"), Some("v3".to_string()));
        assert_eq!(collect(&db), vec![("k".to_string(), "v3".to_string())]);
    }

    #[test]
    fn test_empty_key_and_value() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        put(&db, "", "empty-key");
        put(&db, "empty-value", "");
        assert_eq!(get(&db, ""), Some("empty-key".to_string()));
        assert_eq!(get(&db, "empty-value"), Some("".to_string()));
    }

    #[test]
    fn test_delete_missing_key_is_legal() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());
        db.delete(&WriteOption::default(), b"ghost").unwrap();
        assert_eq!(get(&db, "ghost"), None);
    }

    #[test]
    fn test_empty_batch_commits_without_sequences() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        let before = db.inner.state.lock().unwrap().versions.last_sequence();
        db.write(&WriteOption::default(), WriteBatch::new()).unwrap();
        let after = db.inner.state.lock().unwrap().versions.last_sequence();
        assert_eq!(before, after);
    }

    #[test]
    fn test_atomic_batch() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        let mut batch = WriteBatch::new();
        batch.put(b"x", b"1");
        batch.put(b"y", b"2");
        batch.delete(b"x");
        db.write(&WriteOption::default(), batch).unwrap();

        assert_eq!(get(&db, "x"), None);
        assert_eq!(get(&db, "y"), Some("2".to_string()));
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        put(&db, "k", "v1");
        let snapshot = db.snapshot();
        put(&db, "k", "v2");

        assert_eq!(get(&db, "k"), Some("v2".to_string()));

        let old = ReadOption {
            snapshot: Some(snapshot.clone()),
            ..Default::default()
        };
        assert_eq!(
            db.get(&old, b"k").unwrap(),
            Some(b"v1".to_vec()),
        );

        // Deletions after the snapshot stay invisible to it too.
        db.delete(&WriteOption::default(), b"k").unwrap();
        assert_eq!(get(&db, "k"), None);
        assert_eq!(db.get(&old, b"k").unwrap(), Some(b"v1".to_vec()));

        db.release_snapshot(snapshot);
    }

    #[test]
    fn test_snapshot_iterator_is_stable() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        put(&db, "a", "1");
        put(&db, "b", "2");
        let snapshot = db.snapshot();
        put(&db, "b", "changed");
        put(&db, "c", "3");

        let opts = ReadOption {
            snapshot: Some(snapshot.clone()),
            ..Default::default()
        };
        let mut iter = db.iter(&opts).unwrap();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push((
                String::from_utf8(iter.key().to_vec()).unwrap(),
                String::from_utf8(iter.value().to_vec()).unwrap(),
            ));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
        db.release_snapshot(snapshot);
    }

    #[test]
    fn test_iterator_seek_and_prev() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        for (k, v) in [("a", "1"), ("c", "3"), ("e", "5")] {
            put(&db, k, v);
        }

        let mut iter = db.iter(&ReadOption::default()).unwrap();
        iter.seek(b"b");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"c");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"a");

        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"e");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"c");
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = test_dir();
        {
            let db = open_db(&dir, Options::default());
            put(&db, "persist", "yes");
            put(&db, "also", "this");
            db.close().unwrap();
        }

        let db = open_db(&dir, Options::default());
        assert_eq!(get(&db, "persist"), Some("yes".to_string()));
        assert_eq!(get(&db, "also"), Some("this".to_string()));

        // Sequences resume past recovered writes.
        put(&db, "more", "data");
        assert_eq!(get(&db, "more"), Some("data".to_string()));
    }

    #[test]
    fn test_recovery_replays_unsynced_writes() {
        let dir = test_dir();
        {
            let db = open_db(&dir, Options::default());
            for i in 0..1000 {
                put(&db, &format!("key{:04}", i), &format!("value{:04}", i));
            }
            // No explicit close: drop joins the worker but the WAL was
            // never synced, mimicking a crash with an intact tail.
        }

        let db = open_db(&dir, Options::default());
        for i in 0..1000 {
            assert_eq!(
                get(&db, &format!("key{:04}", i)),
                Some(format!("value{:04}", i)),
                "key{:04}",
                i
            );
        }
    }

    #[test]
    fn test_write_buffer_rotation_spills_to_tables() {
        let dir = test_dir();
        let mut options = Options::default();
        options.write_buffer_size = 64 * 1024;
        let db = open_db(&dir, options);

        let value = "v".repeat(512);
        for i in 0..1000 {
            put(&db, &format!("key{:05}", i), &value);
        }

        // Rotation must have produced table files at some level.
        let total: usize = (0..NUM_LEVELS)
            .map(|l| {
                db.property(&format!("num-files-at-level{}", l))
                    .unwrap()
                    .parse::<usize>()
                    .unwrap()
            })
            .sum();
        assert!(total > 0, "no table files were produced");

        for i in (0..1000).step_by(97) {
            assert_eq!(get(&db, &format!("key{:05}", i)), Some(value.clone()));
        }
    }

    #[test]
    fn test_reopen_after_spill() {
        let dir = test_dir();
        {
            let mut options = Options::default();
            options.write_buffer_size = 64 * 1024;
            let db = open_db(&dir, options);
            let value = "w".repeat(512);
            for i in 0..500 {
                put(&db, &format!("key{:05}", i), &value);
            }
            db.close().unwrap();
        }

        let db = open_db(&dir, Options::default());
        let value = "w".repeat(512);
        for i in (0..500).step_by(53) {
            assert_eq!(get(&db, &format!("key{:05}", i)), Some(value.clone()));
        }
    }

    #[test]
    fn test_compact_range_drops_tombstones() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        put(&db, "x", "v");
        db.delete(&WriteOption::default(), b"x").unwrap();
        put(&db, "keep", "me");

        db.compact_range(None, None).unwrap();

        assert_eq!(get(&db, "x"), None);
        assert_eq!(get(&db, "keep"), Some("me".to_string()));
        assert_eq!(collect(&db), vec![("keep".to_string(), "me".to_string())]);

        // After settling, everything lives in tables and the memtable
        // path no longer holds the tombstone.
        let state = db.inner.state.lock().unwrap();
        assert!(state.mem.is_empty());
        assert!(state.imm.is_none());
    }

    #[test]
    fn test_compaction_preserves_snapshot_revisions() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        put(&db, "k", "old");
        let snapshot = db.snapshot();
        put(&db, "k", "new");

        db.compact_range(None, None).unwrap();

        let opts = ReadOption {
            snapshot: Some(snapshot.clone()),
            ..Default::default()
        };
        assert_eq!(db.get(&opts, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(get(&db, "k"), Some("new".to_string()));
        db.release_snapshot(snapshot);
    }

    #[test]
    fn test_property_names() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());

        assert_eq!(db.property("num-files-at-level0"), Some("0".to_string()));
        assert!(db.property("num-files-at-level99").is_none());
        assert!(db.property("stats").is_some());
        assert!(db.property("unknown").is_none());
    }

    #[test]
    fn test_approximate_sizes_grow_with_data() {
        let dir = test_dir();
        let mut options = Options::default();
        options.write_buffer_size = 64 * 1024;
        let db = open_db(&dir, options);

        let value = "z".repeat(1024);
        for i in 0..500 {
            put(&db, &format!("key{:05}", i), &value);
        }
        db.compact_range(None, None).unwrap();

        let sizes = db.approximate_sizes(&[
            (b"key00000".as_ref(), b"key00499".as_ref()),
            (b"zz".as_ref(), b"zzz".as_ref()),
        ]);
        assert!(sizes[0] > 0);
        assert_eq!(sizes[1], 0);
    }

    #[test]
    fn test_writes_after_close_fail() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());
        put(&db, "a", "1");
        db.close().unwrap();

        let result = db.put(&WriteOption::default(), b"b", b"2");
        assert!(matches!(result, Err(Error::Shutdown(_))));
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());
        put(&db, "a", "1");

        let mut options = Options::default();
        options.create_if_missing = true;
        let second = Db::open(options, dir.path().to_str().unwrap(), PosixEnv {});
        assert!(matches!(second, Err(Error::LockError(_))));

        drop(db);
        let db = open_db(&dir, Options::default());
        assert_eq!(get(&db, "a"), Some("1".to_string()));
    }

    #[test]
    fn test_concurrent_writers_group_commit() {
        let dir = test_dir();
        let db = Arc::new(open_db(&dir, Options::default()));

        let mut handles = Vec::new();
        for t in 0..4 {
            let db = db.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    db.put(
                        &WriteOption::default(),
                        format!("t{}k{:04}", t, i).as_bytes(),
                        format!("v{}", i).as_bytes(),
                    )
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..4 {
            for i in (0..250).step_by(41) {
                assert_eq!(
                    get(&db, &format!("t{}k{:04}", t, i)),
                    Some(format!("v{}", i))
                );
            }
        }

        // Every committed write consumed exactly one sequence number.
        let last = db.inner.state.lock().unwrap().versions.last_sequence();
        assert_eq!(last, 1000);
    }

    #[test]
    fn test_sync_write_round_trip() {
        let dir = test_dir();
        let db = open_db(&dir, Options::default());
        db.put(&WriteOption::sync(), b"durable", b"bit")
            .unwrap();
        assert_eq!(get(&db, "durable"), Some("bit".to_string()));
    }

    #[test]
    fn test_bloom_filtered_db_round_trip() {
        let dir = test_dir();
        let mut options = Options::default();
        options.filter_policy = Some(Arc::new(crate::filter::BloomFilterPolicy::new(10)));
        options.write_buffer_size = 64 * 1024;
        let db = open_db(&dir, options);

        let value = "f".repeat(256);
        for i in 0..600 {
            put(&db, &format!("key{:05}", i), &value);
        }
        db.compact_range(None, None).unwrap();

        for i in (0..600).step_by(71) {
            assert_eq!(get(&db, &format!("key{:05}", i)), Some(value.clone()));
        }
        assert_eq!(get(&db, "missing"), None);
    }
}
