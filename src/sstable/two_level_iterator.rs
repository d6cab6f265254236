use crate::{
    error::{Error, Result},
    iterator::DBIterator,
    options::ReadOption,
};

pub trait BlockIterBuilder {
    type Iter: DBIterator;
    fn build(&self, option: &ReadOption, index_val: &[u8]) -> Result<Self::Iter>;
}

// Walks an index iterator whose values describe blocks, lazily opening a
// data iterator per block. Also drives the per-level file concatenation,
// where the "blocks" are whole tables.
pub struct TwoLevelIterator<I: DBIterator, B: BlockIterBuilder> {
    block_builder: B,
    option: ReadOption,
    index_iter: I,

    data_iter: Option<B::Iter>,
    data_block_handle: Vec<u8>,
    err: Option<Error>,
}

impl<I: DBIterator, B: BlockIterBuilder> TwoLevelIterator<I, B> {
    pub fn new(index_iter: I, block_builder: B, option: ReadOption) -> Self {
        TwoLevelIterator {
            block_builder,
            option,
            index_iter,
            data_iter: None,
            data_block_handle: Vec::new(),
            err: None,
        }
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iterator(None);
        } else {
            let handle = self.index_iter.value();
            if !(self.data_iter.is_some() && self.data_block_handle == handle) {
                match self.block_builder.build(&self.option, handle) {
                    Ok(data_iter) => {
                        self.data_block_handle.clear();
                        self.data_block_handle.extend_from_slice(handle);
                        self.set_data_iterator(Some(data_iter));
                    }
                    Err(err) => {
                        self.data_iter = None;
                        self.save_err(err);
                    }
                }
            }
        }
    }

    fn set_data_iterator(&mut self, data_iter: Option<B::Iter>) {
        if let Some(ref mut iter) = self.data_iter {
            if let Err(err) = iter.status() {
                self.save_err(err);
            }
        }
        self.data_iter = data_iter;
    }

    fn save_err(&mut self, err: Error) {
        self.err.get_or_insert(err);
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        loop {
            if let Some(ref data_iter) = self.data_iter {
                if data_iter.valid() {
                    break;
                }
            }
            if !self.index_iter.valid() {
                self.set_data_iterator(None);
                break;
            }

            self.index_iter.next();
            self.init_data_block();
            if let Some(ref mut iter) = self.data_iter {
                iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        loop {
            if let Some(ref data_iter) = self.data_iter {
                if data_iter.valid() {
                    break;
                }
            }
            if !self.index_iter.valid() {
                self.set_data_iterator(None);
                break;
            }

            self.index_iter.prev();
            self.init_data_block();
            if let Some(ref mut iter) = self.data_iter {
                iter.seek_to_last();
            }
        }
    }
}

impl<I: DBIterator, B: BlockIterBuilder> DBIterator for TwoLevelIterator<I, B> {
    fn valid(&self) -> bool {
        match self.data_iter {
            Some(ref iter) => iter.valid(),
            None => false,
        }
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(ref mut iter) = self.data_iter {
            iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(ref mut iter) = self.data_iter {
            iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(ref mut iter) = self.data_iter {
            iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        assert!(self.valid());
        if let Some(ref mut iter) = self.data_iter {
            iter.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        if let Some(ref mut iter) = self.data_iter {
            iter.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&mut self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(ref mut data_iter) = self.data_iter {
            data_iter.status()?;
        }
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
