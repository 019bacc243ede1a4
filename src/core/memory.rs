use once_cell::sync::OnceCell;

use super::params::*;
use super::ExecError;
use crate::common::{Gas, U256};

pub struct Memory {
    space: Vec<u8>,
}

impl Memory {
    #[inline(always)]
    pub fn get_max_mem() -> &'static U256 {
        static V: OnceCell<U256> = OnceCell::new();
        V.get_or_init(|| MAX_MEM_SIZE.into())
    }

    #[inline(always)]
    pub fn to_word_size(size: u64) -> u64 {
        if size > u64::MAX - 31 {
            (u64::MAX >> 5) + 1
        } else {
            (size + 31) >> 5
        }
    }

    pub fn new() -> Self {
        Self { space: Vec::new() }
    }

    /// Gas needed to make `[off, off + len)` addressable. The memory itself is untouched so the
    /// caller can charge before any effect takes place.
    #[inline(always)]
    pub fn expansion_cost(&self, off: U256, len: U256) -> Result<Gas, ExecError> {
        if len.is_zero() {
            return Ok(0)
        }
        let (end, overflow) = off.overflowing_add(len);
        if overflow || &end > Self::get_max_mem() {
            return Err(ExecError::OutOfMemory)
        }
        let cur_words = (self.space.len() as u64) >> 5;
        let new_words = Self::to_word_size(end.as_u64());
        Ok(new_words.saturating_sub(cur_words) * GAS_MEMORY)
    }

    fn resize(&mut self, end: u64) {
        if end > self.space.len() as u64 {
            let new_size = (Self::to_word_size(end) << 5) as usize;
            self.space.resize(new_size, 0);
        }
    }

    /// Mutable view of `[off, off + len)`; [Memory::expansion_cost] must have been checked.
    #[inline(always)]
    pub fn get_slice_mut(
        &mut self, off: U256, len: U256,
    ) -> Result<&mut [u8], ExecError> {
        if len.is_zero() {
            return Ok(&mut [])
        }
        let end = off
            .checked_add(len)
            .filter(|end| end <= Self::get_max_mem())
            .ok_or(ExecError::OutOfMemory)?;
        self.resize(end.as_u64());
        Ok(&mut self.space[off.as_usize()..end.as_usize()])
    }

    #[inline(always)]
    pub fn get_slice(&mut self, off: U256, len: U256) -> Result<&[u8], ExecError> {
        self.get_slice_mut(off, len).map(|s| &*s)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.space.len()
    }

    #[inline(always)]
    pub fn set(
        &mut self, off: U256, len: U256, data: &[u8],
    ) -> Result<(), ExecError> {
        let slice = self.get_slice_mut(off, len)?;
        let min_len = std::cmp::min(slice.len(), data.len());
        slice[..min_len].copy_from_slice(&data[..min_len]);
        Ok(())
    }
}

#[test]
fn test_memory_expansion_cost() {
    let mut mem = Memory::new();
    assert_eq!(mem.expansion_cost(0.into(), 0.into()).unwrap(), 0);
    assert_eq!(mem.expansion_cost(0.into(), 32.into()).unwrap(), GAS_MEMORY);
    assert_eq!(mem.expansion_cost(31.into(), 2.into()).unwrap(), 2 * GAS_MEMORY);
    mem.set(0.into(), 33.into(), &[1; 33]).unwrap();
    assert_eq!(mem.len(), 64);
    assert_eq!(mem.expansion_cost(0.into(), 64.into()).unwrap(), 0);
    assert_eq!(mem.expansion_cost(64.into(), 1.into()).unwrap(), GAS_MEMORY);
    assert!(mem.expansion_cost(U256::MAX, 2.into()).is_err());
}
