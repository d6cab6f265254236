use crate::options::Options;

pub const NUM_LEVELS: usize = 7;

// Level-0 file-count thresholds. Compaction starts at the trigger; writes
// are paced at the slowdown mark and blocked at the stop mark.
pub const L0_COMPACTION_TRIGGER: usize = 4;
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

// Highest level a fresh memtable dump may be placed in when it overlaps
// nothing below it.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

pub fn max_file_size_for_level(options: &Options, _level: usize) -> u64 {
    options.max_file_size as u64
}

pub fn max_grand_parent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size as u64
}

pub fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * options.max_file_size as u64
}
