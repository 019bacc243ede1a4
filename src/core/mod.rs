//! The metered bytecode interpreter.
//!
//! A transaction's contract code runs in a [TxExecContext] which keeps every nested
//! `CALL`/`CREATE` as a frame on an explicit call stack instead of recursing. All reads and writes
//! go through the [WorldState] abstraction so the interpreter does not care whether it runs on a
//! block's working state or on a throw-away overlay (see
//! [ScratchState](../state/struct.ScratchState.html)).
use std::collections::hash_map::HashMap;
use std::sync::Arc;

mod alu;
mod call;
mod exec;
mod memory;
pub mod opcode;
pub mod params;
mod precompiled;
mod stack;

use crate::common::{Addr, Bytes, Gas, Hash, Wei, U256};
use crate::protocol::Protocol;
pub use exec::{
    apply_message, PlainCode, PostMessage, Transferable, TxExecContext, TxExecResult,
};
pub use precompiled::Ecrecover;

/// An immutable code object that can be read-shared by threads. For a simple, standalone
/// implementation, refer to [PlainCode].
pub trait Code: Send + Sync {
    /// Whether `dest` lands on an instruction (not inside PUSH data).
    fn is_valid_jumpdest(&self, dest: &U256) -> bool;
    fn as_bytes(&self) -> &[u8];
    fn get_hash(&self) -> &Hash;
}

/// Read half of a world state. Missing accounts read as zero-valued accounts.
pub trait WorldStateR {
    /// Get the value from the `account` state space, indexed by `key`.
    fn get_state(&self, account: &Addr, key: &Hash) -> U256;
    /// Get the balance of the `account`.
    fn get_balance(&self, account: &Addr) -> Wei;
    /// Get code of the contract account. If code does not exist, the Code object should return
    /// zero-byte slice.
    fn get_code(&self, account: &Addr) -> Arc<dyn Code>;
    /// Get nonce of the account.
    fn get_nonce(&self, account: &Addr) -> u64;
    /// Check if an account exists.
    fn exist(&self, account: &Addr) -> bool;
}

/// Write half of a world state. Writing to a missing account creates it.
pub trait WorldStateW {
    /// Set the key under the given account to a specified value. Zero deletes the slot.
    fn set_state(&mut self, account: &Addr, key: &Hash, val: &U256);
    /// Set the balance of the account.
    fn set_balance(&mut self, account: &Addr, balance: &Wei);
    /// Set the code of the contract account.
    fn set_code(&mut self, account: &Addr, code: &[u8]);
    /// Set the nonce of the account.
    fn set_nonce(&mut self, account: &Addr, nonce: u64);
    /// Create an empty account, keeping the balance of an existing one.
    fn create_account(&mut self, addr: &Addr);
    /// Delete an account.
    fn delete_account(&mut self, addr: &Addr);
}

/// A world state the interpreter can mutate and rewind.
pub trait WorldState: WorldStateR + WorldStateW {
    /// Create a quick clone of the existing state, which could be implemented in a Copy-on-Write
    /// fashion (see `src/state.rs`).
    fn snapshot(&self) -> Self;
    /// Rollback to a given snapshot.
    fn rollback(&mut self, state: Self);
}

/// Pre-compiled smart contract.
pub trait PrecompiledContract: Send + Sync {
    fn required_gas(&self, input: &[u8]) -> Gas;
    fn run(&self, input: &[u8]) -> Result<Bytes, ExecError>;
}

/// Block-level constants visible to the running code.
#[derive(Clone, Debug, Default)]
pub struct BlockEnv {
    pub coinbase: Addr,
    pub prev_hash: Hash,
    pub timestamp: u64,
    pub number: u64,
    pub difficulty: U256,
    pub gas_limit: Gas,
}

/// Execution environment for the interpreter. This captures the external information that is
/// required to run contract code, including the consensus policy consulted by permissioned
/// opcodes.
pub struct TxExecEnv {
    /// Block-related information.
    pub block: BlockEnv,
    /// Address of the system contract holding permissions and chain parameters.
    pub gendoug: Addr,
    /// Active consensus policy.
    pub protocol: Arc<dyn Protocol>,
    /// Precompiled smart contracts.
    pub precompiled_contracts: HashMap<Addr, Box<dyn PrecompiledContract>>,
}

impl TxExecEnv {
    pub fn new(block: BlockEnv, gendoug: Addr, protocol: Arc<dyn Protocol>) -> Self {
        let mut precompiled_contracts: HashMap<Addr, Box<dyn PrecompiledContract>> =
            HashMap::new();
        precompiled_contracts.insert(Addr::from(U256::one()), Box::new(Ecrecover));
        Self {
            block,
            gendoug,
            protocol,
            precompiled_contracts,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ExecError {
    #[error("out of gas")]
    OutOfGas,
    #[error("max call depth exceeded")]
    Depth,
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    #[error("invalid jump destination")]
    InvalidJump,
    #[error("gas uint64 overflow")]
    GasIntOverflow,
    #[error("nonce uint64 overflow")]
    NonceIntOverflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("permission denied")]
    PermissionDenied,
    #[error("nested lists are not supported")]
    NestedList,
    #[error("malformed rlp input")]
    InvalidRlp,
    #[error("precompiled contract failed")]
    PrecompiledFailed,
}

fn gas_checked_add(x: Gas, y: Gas) -> Result<Gas, ExecError> {
    x.checked_add(y).ok_or(ExecError::GasIntOverflow)
}

fn get_data(src: &[u8], mut off: u64, len: u64) -> Vec<u8> {
    let src_len = src.len() as u64;
    if off > src_len {
        off = src_len
    }
    let mut end = off.saturating_add(len);
    if end > src_len {
        end = src_len
    }
    let mut data = src[off as usize..end as usize].to_vec();
    // right-pad bytes
    data.resize(len as usize, 0);
    data
}

#[test]
fn test_get_data() {
    assert_eq!(
        get_data(&hex::decode("00010203").unwrap(), 0, 4),
        hex::decode("00010203").unwrap()
    );
    assert_eq!(
        get_data(&hex::decode("00010203").unwrap(), 2, 4),
        hex::decode("02030000").unwrap()
    );
    assert_eq!(get_data(&[1, 2], 9, 2), vec![0, 0]);
}
