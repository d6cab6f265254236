use crc::{Crc, CRC_32_ISCSI};
use std::io::Cursor;

use crate::codec::{NumberDecoder, NumberEncoder};
use crate::env::{SequencialFile, WritableFile};
use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 32 * 1024;
// 32-bit crc + 16-bit length + 8-bit type.
pub const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(Error::Corruption("unknown record type".into())),
        }
    }
}

pub struct LogWriter<W: WritableFile> {
    writer: W,
    current_block_offset: usize,
    block_size: usize,
    digest: Crc<u32>,
}

impl<W: WritableFile> LogWriter<W> {
    pub fn new(writer: W) -> LogWriter<W> {
        LogWriter {
            writer,
            current_block_offset: 0,
            block_size: BLOCK_SIZE,
            digest: Crc::<u32>::new(&CRC_32_ISCSI),
        }
    }

    pub fn add_record<P: AsRef<[u8]>>(&mut self, record: P) -> Result<()> {
        let mut record = record.as_ref();
        let mut first_frag = true;
        loop {
            let left = self.block_size - self.current_block_offset;
            if left < HEADER_SIZE {
                // Not enough room for a header; pad the block trailer.
                if left > 0 {
                    self.writer.append(&vec![0; left])?;
                }
                self.current_block_offset = 0;
            }

            let avail_size = self.block_size - self.current_block_offset - HEADER_SIZE;
            let data_frag_size = if record.len() < avail_size {
                record.len()
            } else {
                avail_size
            };

            let record_type = if first_frag && data_frag_size == record.len() {
                RecordType::Full
            } else if first_frag {
                RecordType::First
            } else if data_frag_size == record.len() {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            self.emit_record(record_type, &record[..data_frag_size])?;

            record = &record[data_frag_size..];
            first_frag = false;
            if record.is_empty() && record_type != RecordType::First {
                break;
            }
        }
        Ok(())
    }

    fn emit_record(&mut self, t: RecordType, data: &[u8]) -> Result<()> {
        let mut digest = self.digest.digest();
        digest.update(&[t as u8]);
        digest.update(data);
        let chksum = digest.finalize();

        let mut buf = Cursor::new([0u8; HEADER_SIZE]);
        buf.encode_u32_le(chksum)?;
        buf.encode_u16_le(data.len() as u16)?;
        buf.encode_u8(t as u8)?;

        self.writer.append(buf.get_ref())?;
        self.writer.append(data)?;
        self.writer.flush()?;

        self.current_block_offset += HEADER_SIZE + data.len();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync()?;
        Ok(())
    }
}

pub struct LogReader<R: SequencialFile> {
    file: R,
    crc: Crc<u32>,
    blk_off: usize,
    block_size: usize,
    checksum: bool,
    eof: bool,
}

impl<R: SequencialFile> LogReader<R> {
    pub fn new(file: R, checksum: bool) -> Self {
        LogReader {
            file,
            crc: Crc::<u32>::new(&CRC_32_ISCSI),
            blk_off: 0,
            block_size: BLOCK_SIZE,
            checksum,
            eof: false,
        }
    }

    // Fill buf from the underlying file, returning how many bytes landed.
    // Anything short of buf.len() means the file ended.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            read += n;
        }
        Ok(read)
    }

    // Returns Ok(None) at end of log. A record truncated by a crash is
    // treated as the end; a checksum mismatch is Corruption.
    pub fn read_record(&mut self, dst: &mut Vec<u8>) -> Result<Option<usize>> {
        dst.clear();
        let mut dst_offset: usize = 0;
        let mut in_fragmented_record = false;
        loop {
            if self.eof {
                // A partial record at the tail is dropped silently.
                dst.clear();
                return Ok(None);
            }

            let leftover = self.block_size - self.blk_off;
            if leftover < HEADER_SIZE {
                // Skip the zero-padded block trailer.
                if leftover > 0 {
                    let mut pad = [0u8; HEADER_SIZE];
                    self.read_full(&mut pad[..leftover])?;
                }
                self.blk_off = 0;
                continue;
            }

            let mut head = [0u8; HEADER_SIZE];
            let n = self.read_full(&mut head)?;
            if n < HEADER_SIZE {
                dst.clear();
                return Ok(None);
            }
            self.blk_off += HEADER_SIZE;

            let mut buf = Cursor::new(head);
            let expected_crc = buf.decode_u32_le()?;
            let length = buf.decode_u16_le()? as usize;
            let raw_type = buf.decode_u8()?;

            if self.blk_off + length > self.block_size {
                return Err(Error::Corruption("record length crosses block".into()));
            }

            dst.resize(dst_offset + length, 0);
            let n = self.read_full(&mut dst[dst_offset..dst_offset + length])?;
            if n < length {
                dst.clear();
                return Ok(None);
            }
            self.blk_off += length;

            let record_type = RecordType::try_from(raw_type)?;
            if self.checksum {
                let mut digest = self.crc.digest();
                digest.update(&[raw_type]);
                digest.update(&dst[dst_offset..dst_offset + length]);
                if digest.finalize() != expected_crc {
                    return Err(Error::Corruption("record checksum mismatch".into()));
                }
            }

            dst_offset += length;
            match record_type {
                RecordType::Full => {
                    if in_fragmented_record {
                        return Err(Error::Corruption(
                            "full record in middle of fragmented record".into(),
                        ));
                    }
                    return Ok(Some(dst_offset));
                }
                RecordType::First => {
                    if in_fragmented_record {
                        return Err(Error::Corruption("two first fragments in a row".into()));
                    }
                    in_fragmented_record = true;
                }
                RecordType::Middle => {
                    if !in_fragmented_record {
                        return Err(Error::Corruption("orphan middle fragment".into()));
                    }
                }
                RecordType::Last => {
                    if !in_fragmented_record {
                        return Err(Error::Corruption("orphan last fragment".into()));
                    }
                    return Ok(Some(dst_offset));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{self, TempDir};

    use crate::env::{posix::PosixEnv, Env, WritableFile};

    use super::*;
    use std::str;

    fn create_tmp_dir() -> TempDir {
        tempfile::Builder::new()
            .prefix("silt_log_test")
            .tempdir()
            .unwrap()
    }

    #[test]
    fn test_read_write_round_trip() {
        let big = "x".repeat(BLOCK_SIZE * 2 + 20);
        let datas = &["tide", "silt carries fine sediment", "", big.as_str()];

        let dir = create_tmp_dir();
        let file_path = dir.path().join("test.log");
        let env = PosixEnv {};
        {
            let file = env.new_writable_file(&file_path).unwrap();
            let mut writer = LogWriter::new(file);
            for data in datas {
                writer.add_record(*data).unwrap();
            }
            writer.flush().unwrap();
        }

        let file = env.new_sequential_file(&file_path).unwrap();
        let mut reader = LogReader::new(file, true);
        for data in datas {
            let mut dst = Vec::new();
            assert!(reader.read_record(&mut dst).unwrap().is_some());
            assert_eq!(str::from_utf8(&dst).unwrap(), *data);
        }
        let mut dst = Vec::new();
        assert!(reader.read_record(&mut dst).unwrap().is_none());
    }

    #[test]
    fn test_truncated_tail_is_end_of_log() {
        let dir = create_tmp_dir();
        let file_path = dir.path().join("test.log");
        let env = PosixEnv {};
        {
            let file = env.new_writable_file(&file_path).unwrap();
            let mut writer = LogWriter::new(file);
            writer.add_record("first record").unwrap();
            writer.add_record("second record").unwrap();
            writer.flush().unwrap();
        }

        // Chop bytes off the second record.
        let len = env.file_size(&file_path).unwrap();
        let data = std::fs::read(&file_path).unwrap();
        let mut file = env.new_writable_file(&file_path).unwrap();
        file.append(&data[..len - 5]).unwrap();
        drop(file);

        let file = env.new_sequential_file(&file_path).unwrap();
        let mut reader = LogReader::new(file, true);
        let mut dst = Vec::new();
        assert!(reader.read_record(&mut dst).unwrap().is_some());
        assert_eq!(&dst, b"first record");
        assert!(reader.read_record(&mut dst).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_fails_checksum() {
        let dir = create_tmp_dir();
        let file_path = dir.path().join("test.log");
        let env = PosixEnv {};
        {
            let file = env.new_writable_file(&file_path).unwrap();
            let mut writer = LogWriter::new(file);
            writer.add_record("a record worth guarding").unwrap();
        }

        let mut data = std::fs::read(&file_path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&file_path, &data).unwrap();

        let file = env.new_sequential_file(&file_path).unwrap();
        let mut reader = LogReader::new(file, true);
        let mut dst = Vec::new();
        assert!(matches!(
            reader.read_record(&mut dst),
            Err(Error::Corruption(_))
        ));
    }
}
