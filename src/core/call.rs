use std::cell::RefCell;
use std::sync::Arc;

use log::debug;
use sha3::Digest;

use super::alu;
use super::exec::{CallType, PostMessage};
use super::memory::Memory;
use super::params::*;
use super::stack::Stack;
use super::{gas_checked_add, get_data, Code, ExecError};
use crate::common::{checked_as_u64, Addr, Gas, Wei, U256};

pub(super) struct CallFrame<S> {
    pub pc: u64,
    pub memory: Memory,
    pub stack: Stack,
    pub code: Arc<dyn Code>,
    /// address of the executing contract
    pub callee: Addr,
    /// address of the caller
    pub caller: Addr,
    pub call_type: CallType<S>,
    input: Box<[u8]>,
    pub value: Wei,
    pub unused_gas: Gas,
    /// messages scheduled by POST in this frame or its finished children
    pub posts: Vec<PostMessage>,
}

macro_rules! make_unary_op {
    ($name: ident) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), ExecError> {
            self.use_gas(GAS_STEP)?;
            let a = self.stack.consume1()?;
            self.stack.push(alu::$name(a))
        }
    };
}

macro_rules! make_binary_op {
    ($name: ident) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), ExecError> {
            self.use_gas(GAS_STEP)?;
            let (a, b) = self.stack.consume2()?;
            self.stack.push(alu::$name(a, b))
        }
    };
}

macro_rules! make_ternary_op {
    ($name: ident) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), ExecError> {
            self.use_gas(GAS_STEP)?;
            let (a, b, c) = self.stack.consume3()?;
            self.stack.push(alu::$name(a, b, c))
        }
    };
}

impl<S> CallFrame<S> {
    #[inline]
    pub fn new(
        code: Arc<dyn Code>, input: Box<[u8]>, value: Wei, callee: Addr,
        caller: Addr, call_type: CallType<S>, gas: Gas,
    ) -> Self {
        Self {
            pc: 0x0,
            memory: Memory::new(),
            stack: Stack::new(),
            code,
            callee,
            caller,
            call_type,
            input,
            value,
            unused_gas: gas,
            posts: Vec::new(),
        }
    }

    make_binary_op!(add);
    make_binary_op!(mul);
    make_binary_op!(sub);
    make_binary_op!(div);
    make_binary_op!(sdiv);
    make_binary_op!(rem);
    make_binary_op!(smod);
    make_binary_op!(exp);
    make_unary_op!(neg);
    make_binary_op!(lt);
    make_binary_op!(gt);
    make_binary_op!(slt);
    make_binary_op!(sgt);
    make_binary_op!(eq);
    make_unary_op!(not);
    make_binary_op!(and);
    make_binary_op!(or);
    make_binary_op!(xor);
    make_binary_op!(byte);
    make_ternary_op!(add_mod);
    make_ternary_op!(mul_mod);

    /// Charge for making `[off, off + len)` addressable.
    #[inline(always)]
    pub fn use_mem_gas(&mut self, off: U256, len: U256) -> Result<(), ExecError> {
        let gas = self.memory.expansion_cost(off, len)?;
        self.use_gas(gas)
    }

    #[inline(always)]
    pub fn sha3(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_SHA3)?;
        let (off, len) = self.stack.consume2()?;
        self.use_mem_gas(off, len)?;
        let data = self.memory.get_slice(off, len)?;
        // big-endian words
        let digest = U256::from_big_endian(&sha3::Keccak256::digest(data));
        self.stack.push(digest)
    }

    #[inline(always)]
    pub fn addr(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.callee.clone().into())
    }

    #[inline(always)]
    pub fn caller(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.caller.clone().into())
    }

    #[inline(always)]
    pub fn call_value(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.value.clone().into())
    }

    #[inline(always)]
    pub fn call_data_load(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let data = if let Some(off) = checked_as_u64(&self.stack.consume1()?) {
            U256::from_big_endian(&get_data(&self.input, off, 32))
        } else {
            U256::zero()
        };
        self.stack.push(data)
    }

    #[inline(always)]
    pub fn call_data_size(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.input.len().into())
    }

    #[inline(always)]
    pub fn call_data_copy(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let (mem_off, data_off, len) = self.stack.consume3()?;
        self.use_mem_gas(mem_off, len)?;
        let data_off = checked_as_u64(&data_off).unwrap_or(u64::MAX);
        let data = get_data(&self.input, data_off, len.low_u64());
        self.memory.set(mem_off, len, &data)
    }

    #[inline(always)]
    pub fn code_size(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.code.as_bytes().len().into())
    }

    #[inline(always)]
    pub fn code_copy(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let (mem_off, code_off, len) = self.stack.consume3()?;
        self.use_mem_gas(mem_off, len)?;
        let code_off = checked_as_u64(&code_off).unwrap_or(u64::MAX);
        let data = get_data(self.code.as_bytes(), code_off, len.low_u64());
        self.memory.set(mem_off, len, &data)
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.consume1().map(|_| ())
    }

    #[inline(always)]
    pub fn mload(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let off = self.stack.consume1()?;
        let word = self.read_word(off)?;
        self.stack.push(word)
    }

    #[inline(always)]
    pub fn mstore(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let (off, val) = self.stack.consume2()?;
        self.write_word(off, val)
    }

    #[inline(always)]
    pub fn mstore8(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let (off, val) = self.stack.consume2()?;
        self.use_mem_gas(off, U256::one())?;
        let mem = self.memory.get_slice_mut(off, U256::one())?;
        mem[0] = val.low_u64() as u8;
        Ok(())
    }

    #[inline(always)]
    pub fn pc(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.pc.into())
    }

    #[inline(always)]
    pub fn msize(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.memory.len().into())
    }

    #[inline(always)]
    pub fn gas(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.push(self.unused_gas.into())
    }

    #[inline(always)]
    pub fn push(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        // Because `push` is never used recuresively, we use the thread local space to avoid the
        // repeated heap allocation (with some negligible RefCell deref overhead).
        thread_local! {
            static BYTES: RefCell<[u8; 32]> = RefCell::new([0; 32]);
        }
        // right-aligned, big endian
        BYTES.with(|b| {
            let mut b = b.borrow_mut();
            b.iter_mut().for_each(|m| *m = 0);
            b[32 - data.len()..].copy_from_slice(data);
            self.stack.push(U256::from_big_endian(&*b))
        })
    }

    #[inline(always)]
    pub fn dup(&mut self, pos: usize) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.dup(pos)
    }

    #[inline(always)]
    pub fn swap(&mut self, pos: usize) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        self.stack.swap(pos)
    }

    /// Decodes the flat RLP list at `[offset, offset + size)` into a word table at `pos`:
    ///
    /// ```notrust
    /// pos + 0            item count N
    /// pos + 32 * (2i+1)  pointer to the 32-byte chunk of item i
    /// pos + 32 * (2i+2)  (length << 8) | type
    /// pos + 32 * (2N+1)  N chunks, each item left-padded (or truncated) to 32 bytes
    /// ```
    ///
    /// Lists nested inside the top-level list are rejected. Pushes N.
    pub fn rlp_decode(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let (offset, size, pos) = self.stack.consume3()?;
        self.use_mem_gas(offset, size)?;
        let raw = self.memory.get_slice(offset, size)?.to_vec();
        let rlp = rlp::Rlp::new(&raw);
        if !rlp.is_list() {
            return Err(ExecError::InvalidRlp)
        }
        let count = rlp.item_count().map_err(|_| ExecError::InvalidRlp)?;
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let item = rlp.at(i).map_err(|_| ExecError::InvalidRlp)?;
            if item.is_list() {
                return Err(ExecError::NestedList)
            }
            items.push(item.data().map_err(|_| ExecError::InvalidRlp)?.to_vec());
        }
        let n = items.len() as u64;
        let table_len = U256::from(32 * (3 * n + 1));
        self.use_mem_gas(pos, table_len)?;
        let chunk_start = pos
            .checked_add(U256::from(32 * (2 * n + 1)))
            .ok_or(ExecError::OutOfMemory)?;
        self.write_word(pos, n.into())?;
        for (i, item) in items.iter().enumerate() {
            let i = i as u64;
            let chunk = chunk_start + U256::from(32 * i);
            let lentype = (U256::from(item.len()) << 8) | U256::from(RLP_ITEM_BYTES);
            self.write_word(pos + U256::from(32 * (2 * i + 1)), chunk)?;
            self.write_word(pos + U256::from(32 * (2 * i + 2)), lentype)?;
            let mut word = [0u8; 32];
            let len = std::cmp::min(item.len(), 32);
            word[32 - len..].copy_from_slice(&item[..len]);
            self.memory.set(chunk, 32.into(), &word)?;
        }
        self.stack.push(n.into())
    }

    /// Inverse of [CallFrame::rlp_decode]: reads N (pointer, length) word pairs starting at
    /// `offset`, encodes the referenced byte strings as one flat RLP list at `pos` and pushes the
    /// encoded length.
    pub fn rlp_encode(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_STEP)?;
        let (offset, n, pos) = self.stack.consume3()?;
        let n = checked_as_u64(&n).ok_or(ExecError::OutOfMemory)?;
        let mut stream = rlp::RlpStream::new_list(n as usize);
        for i in 0..n {
            // one step per item keeps long tables bounded by gas
            self.use_gas(GAS_STEP)?;
            let entry = offset
                .checked_add(U256::from(i) * U256::from(64))
                .ok_or(ExecError::OutOfMemory)?;
            let ptr = self.read_word(entry)?;
            let lentype = self.read_word(entry + U256::from(32))?;
            let len = checked_as_u64(&(lentype >> 8)).unwrap_or(32).min(32) as usize;
            let chunk = self.read_word(ptr)?;
            let mut word = [0u8; 32];
            chunk.to_big_endian(&mut word);
            stream.append(&&word[32 - len..]);
        }
        let out = stream.out();
        let out_len = U256::from(out.len());
        self.use_mem_gas(pos, out_len)?;
        self.memory.set(pos, out_len, &out)?;
        self.stack.push(out_len)
    }

    #[inline(always)]
    fn read_word(&mut self, off: U256) -> Result<U256, ExecError> {
        self.use_mem_gas(off, 32.into())?;
        Ok(U256::from_big_endian(self.memory.get_slice(off, 32.into())?))
    }

    #[inline(always)]
    fn write_word(&mut self, off: U256, val: U256) -> Result<(), ExecError> {
        self.use_mem_gas(off, 32.into())?;
        val.to_big_endian(self.memory.get_slice_mut(off, 32.into())?);
        Ok(())
    }

    /// Take `gas` out of this frame on behalf of a child call or a posted message.
    #[inline(always)]
    pub fn reserve_gas(&mut self, base: Gas, gas: &U256) -> Result<Gas, ExecError> {
        let gas = checked_as_u64(gas).ok_or(ExecError::GasIntOverflow)?;
        self.use_gas(gas_checked_add(base, gas)?)?;
        Ok(gas)
    }

    #[inline(always)]
    pub fn use_gas(&mut self, gas: Gas) -> Result<(), ExecError> {
        if self.unused_gas < gas {
            debug!("Out of Gas: {} < {}", self.unused_gas, gas);
            return Err(ExecError::OutOfGas)
        }
        self.unused_gas -= gas;
        Ok(())
    }
}
