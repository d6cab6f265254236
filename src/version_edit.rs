use crate::{
    codec::{read_length_prefixed_slice, write_length_prefixed_slice, VarIntReader, VarIntWriter},
    consts::NUM_LEVELS,
    error::{Error, Result},
    format::InternalKey,
    types::SequenceNumber,
    version::FileMetaData,
};

// Manifest record tags.
const COMPARATOR: u32 = 1;
const LOG_NUMBER: u32 = 2;
const NEXT_FILE_NUMBER: u32 = 3;
const LAST_SEQUENCE: u32 = 4;
const COMPACT_POINTER: u32 = 5;
const DELETED_FILE: u32 = 6;
const NEW_FILE: u32 = 7;
// 8 is reserved.
const PREV_LOG_NUMBER: u32 = 9;

#[derive(Default)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,

    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn clear(&mut self) {
        *self = VersionEdit::default();
    }

    pub fn set_comparator(&mut self, name: impl Into<String>) {
        self.comparator = Some(name.into());
    }

    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    pub fn set_prev_log_number(&mut self, num: u64) {
        self.prev_log_number = Some(num);
    }

    pub fn set_next_file_number(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    pub fn set_last_sequence(&mut self, num: SequenceNumber) {
        self.last_sequence = Some(num);
    }

    pub fn add_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn add_new_file(
        &mut self,
        level: usize,
        file_num: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        let file_meta = FileMetaData {
            number: file_num,
            file_size,
            smallest,
            largest,
            ..Default::default()
        };
        self.new_files.push((level, file_meta));
    }

    pub fn add_delete_file(&mut self, level: usize, file_num: u64) {
        self.deleted_files.push((level, file_num));
    }

    pub fn encode(&self, dst: &mut Vec<u8>) {
        if let Some(c) = self.comparator.as_ref() {
            dst.write_var_u32(COMPARATOR).unwrap();
            write_length_prefixed_slice(dst, c.as_bytes());
        }
        if let Some(n) = self.log_number {
            dst.write_var_u32(LOG_NUMBER).unwrap();
            dst.write_var_u64(n).unwrap();
        }
        if let Some(n) = self.prev_log_number {
            dst.write_var_u32(PREV_LOG_NUMBER).unwrap();
            dst.write_var_u64(n).unwrap();
        }
        if let Some(n) = self.next_file_number {
            dst.write_var_u32(NEXT_FILE_NUMBER).unwrap();
            dst.write_var_u64(n).unwrap();
        }
        if let Some(n) = self.last_sequence {
            dst.write_var_u32(LAST_SEQUENCE).unwrap();
            dst.write_var_u64(n).unwrap();
        }
        for (level, key) in self.compact_pointers.iter() {
            dst.write_var_u32(COMPACT_POINTER).unwrap();
            dst.write_var_u32(*level as u32).unwrap();
            write_length_prefixed_slice(dst, key.encode());
        }
        for (level, num) in self.deleted_files.iter() {
            dst.write_var_u32(DELETED_FILE).unwrap();
            dst.write_var_u32(*level as u32).unwrap();
            dst.write_var_u64(*num).unwrap();
        }
        for (level, f) in self.new_files.iter() {
            dst.write_var_u32(NEW_FILE).unwrap();
            dst.write_var_u32(*level as u32).unwrap();
            dst.write_var_u64(f.number).unwrap();
            dst.write_var_u64(f.file_size).unwrap();
            write_length_prefixed_slice(dst, f.smallest.encode());
            write_length_prefixed_slice(dst, f.largest.encode());
        }
    }

    pub fn decode(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let (tag, _) = src.read_var_u32()?;
            match tag {
                COMPARATOR => {
                    let name = read_length_prefixed_slice(&mut src)
                        .map_err(|_| corruption("comparator name"))?;
                    self.comparator = Some(String::from_utf8_lossy(name).to_string());
                }
                LOG_NUMBER => {
                    let (n, _) = src.read_var_u64().map_err(|_| corruption("log number"))?;
                    self.log_number = Some(n);
                }
                PREV_LOG_NUMBER => {
                    let (n, _) = src
                        .read_var_u64()
                        .map_err(|_| corruption("prev log number"))?;
                    self.prev_log_number = Some(n);
                }
                NEXT_FILE_NUMBER => {
                    let (n, _) = src
                        .read_var_u64()
                        .map_err(|_| corruption("next file number"))?;
                    self.next_file_number = Some(n);
                }
                LAST_SEQUENCE => {
                    let (n, _) = src
                        .read_var_u64()
                        .map_err(|_| corruption("last sequence"))?;
                    self.last_sequence = Some(n);
                }
                COMPACT_POINTER => {
                    let level = get_level(&mut src)?;
                    let key = get_internal_key(&mut src)?;
                    self.compact_pointers.push((level, key));
                }
                DELETED_FILE => {
                    let level = get_level(&mut src)?;
                    let (num, _) = src
                        .read_var_u64()
                        .map_err(|_| corruption("deleted file"))?;
                    self.deleted_files.push((level, num));
                }
                NEW_FILE => {
                    let level = get_level(&mut src)?;
                    let (number, _) = src.read_var_u64().map_err(|_| corruption("new file"))?;
                    let (file_size, _) =
                        src.read_var_u64().map_err(|_| corruption("new file"))?;
                    let smallest = get_internal_key(&mut src)?;
                    let largest = get_internal_key(&mut src)?;
                    let file_meta = FileMetaData {
                        number,
                        file_size,
                        smallest,
                        largest,
                        ..Default::default()
                    };
                    self.new_files.push((level, file_meta));
                }
                _ => {
                    return Err(corruption("unknown tag"));
                }
            }
        }
        Ok(())
    }
}

fn corruption(msg: &str) -> Error {
    Error::Corruption(format!("VersionEdit: {}", msg))
}

fn get_level(src: &mut &[u8]) -> Result<usize> {
    let (level, _) = src.read_var_u32().map_err(|_| corruption("level"))?;
    if (level as usize) < NUM_LEVELS {
        Ok(level as usize)
    } else {
        Err(corruption("level larger than configured maximum"))
    }
}

fn get_internal_key(src: &mut &[u8]) -> Result<InternalKey> {
    let data = read_length_prefixed_slice(src).map_err(|_| corruption("internal key"))?;
    let mut key = InternalKey::empty();
    if !key.decode(data) {
        return Err(corruption("internal key decode failed"));
    }
    Ok(key)
}
