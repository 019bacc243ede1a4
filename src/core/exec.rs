use std::cmp::Ordering;
use std::sync::Arc;

use bitvec::vec::BitVec;
use log::{debug, warn};
use num_traits::FromPrimitive;

use super::call::CallFrame;
use super::opcode::Opcode;
use super::params::*;
use super::{get_data, Code, ExecError, TxExecEnv, WorldState};
use crate::common::{checked_as_u64, Addr, Bytes, Gas, Hash, Wei, U256};

/// Helper trait that adds funds transfer functions to any [WorldState] objects.
pub trait Transferable {
    fn add_balance(&mut self, addr: &Addr, val: &Wei) -> Option<()>;
    fn sub_balance(&mut self, addr: &Addr, val: &Wei) -> Option<()>;
    fn transfer_balance(&mut self, from: &Addr, to: &Addr, val: &Wei) -> Option<()>;
}

impl<T> Transferable for T
where
    T: WorldState,
{
    fn add_balance(&mut self, addr: &Addr, val: &Wei) -> Option<()> {
        self.set_balance(addr, &self.get_balance(addr).checked_add(val)?);
        Some(())
    }

    fn sub_balance(&mut self, addr: &Addr, val: &Wei) -> Option<()> {
        self.set_balance(addr, &self.get_balance(addr).checked_sub(val)?);
        Some(())
    }

    fn transfer_balance(&mut self, from: &Addr, to: &Addr, val: &Wei) -> Option<()> {
        if &self.get_balance(from) < val {
            return None
        }
        self.sub_balance(from, val)?;
        self.add_balance(to, val)
    }
}

/// Simple code object implementation that can be constructed from raw byte code. PlainCode is
/// standalone and caches code hash and the instruction boundaries of the code itself.
pub struct PlainCode {
    code: Box<[u8]>,
    bitmap: BitVec,
    hash: Hash,
}

impl PlainCode {
    pub fn new(code: Box<[u8]>) -> Self {
        let bitmap = crate::common::gen_code_bitmap(&code);
        let hash = Hash::hash(&code);
        Self { code, bitmap, hash }
    }

    fn is_opcode(&self, dest: usize) -> bool {
        self.bitmap.get(dest).map(|b| *b).unwrap_or(false)
    }
}

impl Code for PlainCode {
    fn is_valid_jumpdest(&self, dest: &U256) -> bool {
        match checked_as_u64(dest) {
            Some(dest) => self.is_opcode(dest as usize),
            None => false,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.code
    }

    fn get_hash(&self) -> &Hash {
        &self.hash
    }
}

/// The decoded instruction.
struct Inst {
    opcode: Opcode,
    /// data being pushed by a PUSH* insruction, None if not PUSH*
    data: Option<Vec<u8>>,
    /// number used by DUP* and SWAP* instructions, ignored otherwise
    pos: usize,
}

/// A message scheduled by `POST`. It runs after the whole call tree of the transaction succeeds,
/// with the transaction sender as the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct PostMessage {
    pub to: Addr,
    pub value: Wei,
    pub input: Bytes,
    pub gas: Gas,
}

pub(super) struct CallArgs<S> {
    snapshot: S,
    ret_off: U256,
    ret_len: U256,
}

pub(super) struct CreateArgs<S> {
    snapshot: S,
    contract_addr: Addr,
}

pub(super) enum CallType<S> {
    /// bottom frame holding nothing but the return slot
    Root,
    Tx,
    Call(CallArgs<S>),
    Create(CreateArgs<S>),
}

/// The result of running contract code.
#[derive(Debug)]
pub enum TxExecResult {
    /// The execution finishes with some returned data, the unused gas and the messages it
    /// posted.
    Succeeded(Bytes, Gas, Vec<PostMessage>),
    /// The execution faulted; all gas given to it is consumed.
    Failed(ExecError),
}

impl TxExecResult {
    pub fn unused_gas(&self) -> Gas {
        match self {
            TxExecResult::Succeeded(_, gas, _) => *gas,
            TxExecResult::Failed(_) => 0,
        }
    }
}

pub struct TxExecContext<'a, S: WorldState> {
    call_stack: Vec<Box<CallFrame<S>>>,
    /// Top of the contract call stack, not included in `call_stack`
    cur_call: Box<CallFrame<S>>,
    state: &'a mut S,
    result: Option<TxExecResult>,

    // the following fields are immutable throughout the execution
    origin: Addr,
    gas_price: Wei,
    env: &'a TxExecEnv,
}

impl<'a, S: WorldState> TxExecContext<'a, S> {
    /// Create the execution context for one transaction-level run. `origin` is the transaction
    /// sender, which heads the `CALLSTACK` list.
    pub fn new(
        state: &'a mut S, env: &'a TxExecEnv, origin: Addr, gas_price: Wei,
    ) -> Self {
        Self {
            call_stack: Vec::new(),
            // dummy value, never executed
            cur_call: Box::new(CallFrame::new(
                Arc::new(PlainCode::new(Vec::new().into())),
                Vec::new().into(),
                Wei::zero().clone(),
                origin.clone(),
                origin.clone(),
                CallType::Root,
                0,
            )),
            state,
            result: None,
            origin,
            gas_price,
            env,
        }
    }

    /// Run `code` as `callee` on behalf of `caller`. Value has already been moved by the caller
    /// of this function; `value` is only what CALLVALUE reports. State changes of a failed run are
    /// left in place for the caller to roll back.
    pub fn run(
        mut self, caller: Addr, callee: Addr, code: Arc<dyn Code>, input: Box<[u8]>,
        value: Wei, gas: Gas,
    ) -> TxExecResult {
        if code.as_bytes().is_empty() {
            return TxExecResult::Succeeded(Bytes::empty(), gas, Vec::new())
        }
        self.call_push(code, input, value, callee, caller, CallType::Tx, gas);
        self.exec()
    }

    #[inline(always)]
    fn balance(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_BALANCE)?;
        let addr = call.stack.consume1()?.into();
        call.stack.push(self.state.get_balance(&addr).into())
    }

    #[inline(always)]
    fn nonce(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_NONCE)?;
        let addr = call.stack.consume1()?.into();
        call.stack.push(self.state.get_nonce(&addr).into())
    }

    #[inline(always)]
    fn origin(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_STEP)?;
        call.stack.push(self.origin.clone().into())
    }

    #[inline(always)]
    fn ext_code_size(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_STEP)?;
        let addr = call.stack.consume1()?.into();
        let code = self.state.get_code(&addr);
        call.stack.push(code.as_bytes().len().into())
    }

    #[inline(always)]
    fn ext_code_copy(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_STEP)?;
        let (addr, mem_off, code_off) = call.stack.consume3()?;
        let len = call.stack.consume1()?;
        call.use_mem_gas(mem_off, len)?;
        let code_off = checked_as_u64(&code_off).unwrap_or(u64::MAX);
        let code = self.state.get_code(&addr.into());
        let data = get_data(code.as_bytes(), code_off, len.low_u64());
        call.memory.set(mem_off, len, &data)
    }

    #[inline(always)]
    fn call_stack_at(&mut self) -> Result<(), ExecError> {
        self.cur_call.use_gas(GAS_STEP)?;
        let idx = self.cur_call.stack.consume1()?;
        let addrs = self.call_stack_addrs();
        let addr = checked_as_u64(&idx)
            .and_then(|i| addrs.get(i as usize))
            .map(|a| U256::from(a.clone()))
            .unwrap_or_default();
        self.cur_call.stack.push(addr)
    }

    #[inline(always)]
    fn call_stack_size(&mut self) -> Result<(), ExecError> {
        self.cur_call.use_gas(GAS_STEP)?;
        let size = self.call_stack_addrs().len() - 1;
        self.cur_call.stack.push(size.into())
    }

    /// The transaction origin followed by the executing contract of every live frame, outermost
    /// first.
    fn call_stack_addrs(&self) -> Vec<Addr> {
        let mut addrs = vec![self.origin.clone()];
        addrs.extend(self.call_stack.iter().skip(1).map(|f| f.callee.clone()));
        addrs.push(self.cur_call.callee.clone());
        addrs
    }

    #[inline(always)]
    fn env_word(&mut self, val: U256) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_STEP)?;
        call.stack.push(val)
    }

    #[inline(always)]
    fn sload(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_SLOAD)?;
        let key = call.stack.consume1()?.into();
        call.stack.push(self.state.get_state(&call.callee, &key))
    }

    #[inline(always)]
    fn sstore(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        let (key, val) = call.stack.consume2()?;
        let key = key.into();
        let cur = self.state.get_state(&call.callee, &key);
        call.use_gas(if cur.is_zero() && !val.is_zero() {
            GAS_SSTORE_SET
        } else if !cur.is_zero() && val.is_zero() {
            GAS_SSTORE_CLEAR
        } else {
            GAS_SSTORE_RESET
        })?;
        self.state.set_state(&call.callee, &key, &val);
        Ok(())
    }

    #[inline(always)]
    fn jump(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_STEP)?;
        let dest = call.stack.consume1()?;
        if !call.code.is_valid_jumpdest(&dest) {
            return Err(ExecError::InvalidJump)
        }
        // pc will be increased every iteration in the core loop
        call.pc = dest.as_u64().wrapping_sub(1);
        Ok(())
    }

    #[inline(always)]
    fn jumpi(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_STEP)?;
        let (dest, cond) = call.stack.consume2()?;
        if !cond.is_zero() {
            if !call.code.is_valid_jumpdest(&dest) {
                return Err(ExecError::InvalidJump)
            }
            call.pc = dest.as_u64().wrapping_sub(1);
        }
        Ok(())
    }

    #[inline(always)]
    fn create_begin(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_CREATE)?;
        let (value, off, len) = call.stack.consume3()?;
        call.use_mem_gas(off, len)?;
        let code = call.memory.get_slice(off, len)?.to_vec().into_boxed_slice();
        let value: Wei = value.into();
        let caller = call.callee.clone();

        // contract creation is a permissioned action once past genesis
        if self.env.block.number > 0 {
            if let Err(e) = self.env.protocol.validate_permission(
                &self.origin,
                "create",
                &*self.state,
            ) {
                debug!("create denied for {}: {}", self.origin, e);
                return self.cur_call.stack.push(U256::zero())
            }
        }
        if self.call_depth() >= MAX_CALL_DEPTH ||
            self.state.get_balance(&caller) < value
        {
            return self.cur_call.stack.push(U256::zero())
        }

        let nonce = self.state.get_nonce(&caller);
        self.state.set_nonce(
            &caller,
            nonce.checked_add(1).ok_or(ExecError::NonceIntOverflow)?,
        );
        let contract_addr = crate::common::create_addr(&caller, nonce);

        // the child gets everything left, the residual is returned when it finishes
        let gas_quota = self.cur_call.unused_gas;
        self.cur_call.use_gas(gas_quota)?;

        let snapshot = self.state.snapshot();
        self.state.create_account(&contract_addr);
        // balance was checked above
        if self.state.transfer_balance(&caller, &contract_addr, &value).is_none() {
            return Err(ExecError::InsufficientBalance)
        }
        let args = CreateArgs {
            snapshot,
            contract_addr: contract_addr.clone(),
        };
        if code.is_empty() {
            return self.create_end(args, Bytes::empty(), gas_quota, Vec::new(), Ok(()))
        }
        let code = Arc::new(PlainCode::new(code)) as Arc<dyn Code>;
        self.call_push(
            code,
            Vec::new().into(),
            value,
            contract_addr,
            caller,
            CallType::Create(args),
            gas_quota,
        );
        Ok(())
    }

    #[inline(always)]
    fn create_end(
        &mut self, args: CreateArgs<S>, data: Bytes, unused_gas: Gas,
        posts: Vec<PostMessage>, ret: Result<(), ExecError>,
    ) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        match ret {
            Ok(()) => {
                self.state.set_code(&args.contract_addr, &data);
                call.unused_gas += unused_gas;
                call.posts.extend(posts);
                call.stack.push(args.contract_addr.into())
            }
            Err(err) => {
                debug!("create failed: {}", err);
                self.state.rollback(args.snapshot);
                call.stack.push(U256::zero())
            }
        }
    }

    #[inline(always)]
    fn call_begin(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        let args = call.stack.consume_n(7)?;
        let (gas, addr, value) = (args[0], args[1], args[2]);
        let (in_off, in_len, ret_off, ret_len) = (args[3], args[4], args[5], args[6]);
        call.use_mem_gas(in_off, in_len)?;
        let input: Box<[u8]> = call.memory.get_slice(in_off, in_len)?.into();
        call.use_mem_gas(ret_off, ret_len)?;
        call.memory.get_slice_mut(ret_off, ret_len)?;
        let gas = call.reserve_gas(GAS_CALL, &gas)?;

        let callee: Addr = addr.into();
        let caller = call.callee.clone();
        let value: Wei = value.into();
        if self.call_depth() >= MAX_CALL_DEPTH ||
            self.state.get_balance(&caller) < value
        {
            let call = &mut self.cur_call;
            call.unused_gas += gas;
            return call.stack.push(U256::zero())
        }

        let snapshot = self.state.snapshot();
        if !self.state.exist(&callee) {
            self.state.create_account(&callee);
        }
        if self.state.transfer_balance(&caller, &callee, &value).is_none() {
            return Err(ExecError::InsufficientBalance)
        }
        let args = CallArgs {
            snapshot,
            ret_off,
            ret_len,
        };

        if let Some(contract) = self.env.precompiled_contracts.get(&callee) {
            let required = contract.required_gas(&input);
            let ret = if required > gas {
                Err(ExecError::OutOfGas)
            } else {
                contract.run(&input)
            };
            return match ret {
                Ok(data) => self.call_end(args, data, gas - required, Vec::new(), Ok(())),
                Err(err) => self.call_end(args, Bytes::empty(), 0, Vec::new(), Err(err)),
            }
        }
        let code = self.state.get_code(&callee);
        if code.as_bytes().is_empty() {
            return self.call_end(args, Bytes::empty(), gas, Vec::new(), Ok(()))
        }
        self.call_push(code, input, value, callee, caller, CallType::Call(args), gas);
        Ok(())
    }

    #[inline(always)]
    fn call_end(
        &mut self, args: CallArgs<S>, data: Bytes, unused_gas: Gas,
        posts: Vec<PostMessage>, ret: Result<(), ExecError>,
    ) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        match ret {
            Ok(()) => {
                call.memory.set(args.ret_off, args.ret_len, &data)?;
                call.unused_gas += unused_gas;
                call.posts.extend(posts);
                call.stack.push(U256::one())
            }
            Err(err) => {
                debug!("call failed: {}", err);
                self.state.rollback(args.snapshot);
                call.stack.push(U256::zero())
            }
        }
    }

    #[inline(always)]
    fn post(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        let args = call.stack.consume_n(5)?;
        let (gas, to, value, in_off, in_len) = (args[0], args[1], args[2], args[3], args[4]);
        call.use_mem_gas(in_off, in_len)?;
        let input: Bytes = call.memory.get_slice(in_off, in_len)?.into();
        // the message's gas is held back from this frame until it runs
        let gas = call.reserve_gas(GAS_CALL, &gas)?;
        call.posts.push(PostMessage {
            to: to.into(),
            value: value.into(),
            input,
            gas,
        });
        Ok(())
    }

    #[inline(always)]
    fn return_(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_STEP)?;
        let (off, len) = call.stack.consume2()?;
        call.use_mem_gas(off, len)?;
        let data = call.memory.get_slice(off, len)?.into();
        self.finish_call(data, Ok(()))
    }

    #[inline(always)]
    fn suicide(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_SUICIDE)?;
        let receiver: Addr = call.stack.consume1()?.into();
        let callee = call.callee.clone();
        let balance = self.state.get_balance(&callee);
        self.state
            .add_balance(&receiver, &balance)
            .ok_or(ExecError::InsufficientBalance)?;
        self.state.delete_account(&callee);
        self.finish_call(Bytes::empty(), Ok(()))
    }

    // end of instruction impl

    #[inline(always)]
    fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    #[inline(always)]
    fn call_push(
        &mut self, code: Arc<dyn Code>, input: Box<[u8]>, value: Wei,
        callee: Addr, caller: Addr, call_type: CallType<S>, gas: Gas,
    ) {
        let mut old_call = Box::new(CallFrame::new(
            code, input, value, callee, caller, call_type, gas,
        ));
        std::mem::swap(&mut self.cur_call, &mut old_call);
        self.call_stack.push(old_call);
    }

    #[inline(always)]
    fn call_pop(&mut self) -> Option<Box<CallFrame<S>>> {
        let mut frame = self.call_stack.pop()?;
        std::mem::swap(&mut self.cur_call, &mut frame);
        Some(frame)
    }

    #[inline(always)]
    fn tx_end(
        &mut self, data: Bytes, unused_gas: Gas, posts: Vec<PostMessage>,
        ret: Result<(), ExecError>,
    ) {
        self.result = Some(match ret {
            Ok(()) => TxExecResult::Succeeded(data, unused_gas, posts),
            Err(err) => TxExecResult::Failed(err),
        })
    }

    #[inline(always)]
    fn finish_call(
        &mut self, data: Bytes, ret: Result<(), ExecError>,
    ) -> Result<(), ExecError> {
        let frame = match self.call_pop() {
            Some(frame) => frame,
            None => {
                warn!("finishing a call with an empty call stack");
                self.result = Some(TxExecResult::Failed(ret.err().unwrap_or(ExecError::Depth)));
                return Ok(())
            }
        };
        let frame = *frame;
        match frame.call_type {
            CallType::Root => (),
            CallType::Tx => self.tx_end(data, frame.unused_gas, frame.posts, ret),
            CallType::Create(args) => {
                self.create_end(args, data, frame.unused_gas, frame.posts, ret)?
            }
            CallType::Call(args) => {
                self.call_end(args, data, frame.unused_gas, frame.posts, ret)?
            }
        }
        Ok(())
    }

    #[inline(always)]
    fn advance_pc(&mut self, skip: u64) {
        self.cur_call.pc = self.cur_call.pc.wrapping_add(skip + 1)
    }

    fn decode(code: &[u8], pc: usize) -> Inst {
        use Opcode::*;
        let raw_opcode = code.get(pc).copied().unwrap_or(Stop as u8);
        match raw_opcode {
            // Push* case (32)
            c @ (0x60..=0x7f) => Inst {
                opcode: Push,
                // truncated push data reads as zeros
                data: Some(get_data(code, pc as u64 + 1, (c - 0x60 + 1) as u64)),
                pos: 0,
            },
            // DUP* case (16)
            c @ (0x80..=0x8f) => Inst {
                opcode: Dup,
                data: None,
                pos: (c - 0x80 + 1) as usize,
            },
            // SWAP* case (16)
            c @ (0x90..=0x9f) => Inst {
                opcode: Swap,
                data: None,
                pos: (c - 0x90 + 1) as usize,
            },
            _ => Inst {
                opcode: FromPrimitive::from_u8(raw_opcode).unwrap_or(Invalid),
                data: None,
                pos: 0,
            },
        }
    }

    fn exec(mut self) -> TxExecResult {
        use Opcode::*;
        while self.result.is_none() {
            let code = self.cur_call.code.clone();
            let inst = Self::decode(code.as_bytes(), self.cur_call.pc as usize);
            let depth = self.call_depth();
            let env = self.env;
            let block = &env.block;
            let call = &mut self.cur_call;
            let mut succ = match inst.opcode {
                Stop => self.finish_call(Bytes::empty(), Ok(())),
                Add => call.add(),
                Mul => call.mul(),
                Sub => call.sub(),
                Div => call.div(),
                SDiv => call.sdiv(),
                Mod => call.rem(),
                SMod => call.smod(),
                Exp => call.exp(),
                Neg => call.neg(),
                Lt => call.lt(),
                Gt => call.gt(),
                Slt => call.slt(),
                Sgt => call.sgt(),
                Eql => call.eq(),
                Not => call.not(),
                And => call.and(),
                Or => call.or(),
                Xor => call.xor(),
                Byte => call.byte(),
                AddMod => call.add_mod(),
                MulMod => call.mul_mod(),
                Sha3 => call.sha3(),
                RlpDecode => call.rlp_decode(),
                RlpEncode => call.rlp_encode(),
                Addr => call.addr(),
                Balance => self.balance(),
                Origin => self.origin(),
                Caller => call.caller(),
                CallValue => call.call_value(),
                CallDataLoad => call.call_data_load(),
                CallDataSize => call.call_data_size(),
                CallDataCopy => call.call_data_copy(),
                CodeSize => call.code_size(),
                CodeCopy => call.code_copy(),
                GasPrice => self.env_word(self.gas_price.clone().into()),
                ExtCodeSize => self.ext_code_size(),
                ExtCodeCopy => self.ext_code_copy(),
                Nonce => self.nonce(),
                CallStack => self.call_stack_at(),
                CallStackSize => self.call_stack_size(),
                PrevHash => self.env_word(block.prev_hash.clone().into()),
                Coinbase => self.env_word(block.coinbase.clone().into()),
                Timestamp => self.env_word(block.timestamp.into()),
                Number => self.env_word(block.number.into()),
                Difficulty => self.env_word(block.difficulty),
                GasLimit => self.env_word(block.gas_limit.into()),
                GenDoug => self.env_word(env.gendoug.clone().into()),
                Pop => call.pop(),
                MLoad => call.mload(),
                MStore => call.mstore(),
                MStore8 => call.mstore8(),
                SLoad => self.sload(),
                SStore => self.sstore(),
                Jump => self.jump(),
                JumpI => self.jumpi(),
                PC => call.pc(),
                MSize => call.msize(),
                Gas => call.gas(),
                JumpDest => call.use_gas(GAS_STEP),
                Push => call.push(inst.data.as_deref().unwrap_or(&[])),
                Dup => call.dup(inst.pos),
                Swap => call.swap(inst.pos),
                Create => self.create_begin(),
                Call => self.call_begin(),
                Return => self.return_(),
                Post => self.post(),
                Suicide => self.suicide(),
                Invalid => Err(ExecError::InvalidOpcode),
            };
            while let Err(err) = succ {
                succ = self.finish_call(Bytes::empty(), Err(err));
            }
            // a frame entered by CALL/CREATE starts at its own pc 0, and a caller resumed after
            // its child finished sits on the one-byte CALL/CREATE
            match self.call_depth().cmp(&depth) {
                Ordering::Greater => (),
                Ordering::Less => self.advance_pc(0),
                Ordering::Equal => {
                    self.advance_pc(inst.data.as_ref().map(|d| d.len() as u64).unwrap_or(0))
                }
            }
        }
        self.result.unwrap_or(TxExecResult::Failed(ExecError::InvalidOpcode))
    }
}

/// Deliver a posted message from `origin`: move the value, run the target's code, and roll the
/// state back if anything fails.
pub fn apply_message<S: WorldState>(
    state: &mut S, env: &TxExecEnv, origin: &Addr, gas_price: &Wei, msg: &PostMessage,
) -> TxExecResult {
    let snapshot = state.snapshot();
    if !state.exist(&msg.to) {
        state.create_account(&msg.to);
    }
    if state.transfer_balance(origin, &msg.to, &msg.value).is_none() {
        state.rollback(snapshot);
        return TxExecResult::Failed(ExecError::InsufficientBalance)
    }
    let code = state.get_code(&msg.to);
    let ctx = TxExecContext::new(state, env, origin.clone(), gas_price.clone());
    let res = ctx.run(
        origin.clone(),
        msg.to.clone(),
        code,
        msg.input.to_vec().into(),
        msg.value.clone(),
        msg.gas,
    );
    if let TxExecResult::Failed(_) = res {
        state.rollback(snapshot);
    }
    res
}
