use std::{io::Read, ops::Deref};

use integer_encoding::VarInt;
use snap::read::FrameDecoder;

use crate::{
    codec::decode_u32_le,
    env::RandomAccessFile,
    error::{Error, Result},
    options::{Compress, ReadOption},
};

pub const FOOTER_LENGTH: usize = 40;
pub const FULL_FOOTER_LENGTH: usize = FOOTER_LENGTH + 8;
pub const MAGIC_FOOTER_ENCODED: [u8; 8] = [0x3c, 0xa9, 0x5e, 0xd1, 0x6b, 0x24, 0x51, 0x7d];
// 1-byte compression tag + 32-bit crc.
pub const BLOCK_TRAILER_SIZE: usize = 5;

#[derive(Clone, Copy, Default)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.offset.encode_var_vec());
        dst.extend_from_slice(&self.size.encode_var_vec());
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<usize> {
        let (offset, offset_len) = u64::decode_var(data)
            .ok_or_else(|| Error::Corruption("bad block handle".into()))?;
        let (size, size_len) = u64::decode_var(&data[offset_len..])
            .ok_or_else(|| Error::Corruption("bad block handle".into()))?;
        self.offset = offset;
        self.size = size;
        Ok(offset_len + size_len)
    }

    pub fn from_raw(data: &[u8]) -> Result<Self> {
        let mut handle = BlockHandle::default();
        handle.decode(data)?;
        Ok(handle)
    }
}

#[derive(Default, Clone, Copy)]
pub struct Footer {
    pub meta_index_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn new(meta_index_handle: BlockHandle, index_handle: BlockHandle) -> Footer {
        Footer {
            meta_index_handle,
            index_handle,
        }
    }

    pub fn encode(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.meta_index_handle.encode(dst);
        self.index_handle.encode(dst);
        dst.resize(start + FOOTER_LENGTH, 0);
        dst.extend_from_slice(&MAGIC_FOOTER_ENCODED);
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < FULL_FOOTER_LENGTH {
            return Err(Error::Corruption("footer too short".into()));
        }
        if data[FOOTER_LENGTH..FULL_FOOTER_LENGTH] != MAGIC_FOOTER_ENCODED {
            return Err(Error::Corruption("not a table file (bad magic)".into()));
        }

        let read = self.meta_index_handle.decode(data)?;
        self.index_handle.decode(&data[read..])?;
        Ok(())
    }
}

#[derive(Default)]
pub struct BlockContent {
    pub data: Vec<u8>,
}

impl BlockContent {
    pub fn new(data: Vec<u8>) -> Self {
        BlockContent { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_block_from_file<R: RandomAccessFile>(
        file: &R,
        handle: &BlockHandle,
        option: &ReadOption,
    ) -> Result<Self> {
        let n = handle.size as usize;
        let mut buf = vec![0; n + BLOCK_TRAILER_SIZE];
        file.read_exact_at(buf.as_mut(), handle.offset)
            .map_err(|_| Error::Corruption("truncated block read".into()))?;

        let data = buf.as_slice();
        if option.verify_checksum {
            let checksum = decode_u32_le(&data[n + 1..]);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&data[0..n + 1]);
            if checksum != hasher.finalize() {
                return Err(Error::Corruption("block checksum mismatch".into()));
            }
        }

        let compress_type = Compress::try_from(data[n])?;
        match compress_type {
            Compress::No => {
                buf.truncate(n);
                Ok(BlockContent { data: buf })
            }
            Compress::Snappy => {
                let mut uncompressed = Vec::new();
                let mut reader = FrameDecoder::new(&data[..n]);
                reader
                    .read_to_end(&mut uncompressed)
                    .map_err(|_| Error::Corruption("corrupted compressed block".into()))?;
                Ok(BlockContent { data: uncompressed })
            }
        }
    }
}

impl AsRef<[u8]> for BlockContent {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for BlockContent {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_handle_round_trip() {
        let handle = BlockHandle::new(1 << 30, 4096);
        let mut buf = Vec::new();
        handle.encode(&mut buf);

        let decoded = BlockHandle::from_raw(&buf).unwrap();
        assert_eq!(decoded.offset(), 1 << 30);
        assert_eq!(decoded.size(), 4096);
    }

    #[test]
    fn test_footer_round_trip() {
        let footer = Footer::new(BlockHandle::new(10, 20), BlockHandle::new(30, 40));
        let mut buf = Vec::new();
        footer.encode(&mut buf);
        assert_eq!(buf.len(), FULL_FOOTER_LENGTH);

        let mut decoded = Footer::default();
        decoded.decode(&buf).unwrap();
        assert_eq!(decoded.meta_index_handle.offset(), 10);
        assert_eq!(decoded.meta_index_handle.size(), 20);
        assert_eq!(decoded.index_handle.offset(), 30);
        assert_eq!(decoded.index_handle.size(), 40);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let footer = Footer::new(BlockHandle::new(1, 2), BlockHandle::new(3, 4));
        let mut buf = Vec::new();
        footer.encode(&mut buf);
        buf[FOOTER_LENGTH] ^= 0xff;

        let mut decoded = Footer::default();
        assert!(decoded.decode(&buf).is_err());
    }
}
