//! Error types of the ledger engine. Interpreter faults live in [ExecError](crate::core::ExecError).
use thiserror::Error;

use crate::common::{Addr, Gas, Hash, Wei, U256};
use crate::core::ExecError;

/// A consensus policy said no.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{addr} does not have permission `{role}`")]
    Permission { addr: Addr, role: String },
    #[error("policy contract `{0}` rejected the request")]
    Contract(String),
    #[error("{0}")]
    Rejected(String),
}

/// Why a single transaction could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("invalid nonce: expected {expected}, got {got}")]
    Nonce { expected: u64, got: u64 },
    #[error("gas {gas} is below the intrinsic cost {required}")]
    IntrinsicGas { gas: Gas, required: Gas },
    #[error("gas {gas} exceeds the per-transaction limit {max}")]
    TxGasLimit { gas: Gas, max: Gas },
    #[error("block gas limit reached: {available} left, {gas} requested")]
    BlockGasLimit { available: Gas, gas: Gas },
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: Wei, need: Wei },
    #[error("transaction rejected: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid transaction signature")]
    Signature,
    #[error("gas fee overflow")]
    Overflow,
}

impl TxError {
    /// Transient failures: the transaction is dropped but the rest of the block still goes
    /// through.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            TxError::Nonce { .. } |
                TxError::IntrinsicGas { .. } |
                TxError::TxGasLimit { .. } |
                TxError::InsufficientBalance { .. }
        )
    }

    pub fn is_block_gas_limit(&self) -> bool {
        matches!(self, TxError::BlockGasLimit { .. })
    }
}

/// A block failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("transaction root mismatch: computed {expected}, header {got}")]
    TxRoot { expected: Hash, got: Hash },
    #[error("state root mismatch: computed {expected}, header {got}")]
    StateRoot { expected: Hash, got: Hash },
    #[error("receipt {index} does not match the replayed transaction")]
    Receipt { index: usize },
    #[error("uncle set digest mismatch")]
    UncleSha,
    #[error("invalid uncle {hash}: {reason}")]
    Uncle { hash: Hash, reason: &'static str },
    #[error("invalid difficulty: required {expected}, header {got}")]
    Difficulty { expected: U256, got: U256 },
    #[error("invalid gas limit: required {expected}, header {got}")]
    GasLimit { expected: Gas, got: Gas },
    #[error("gas used mismatch: computed {expected}, header {got}")]
    GasUsed { expected: Gas, got: Gas },
    #[error("invalid proof of work")]
    ProofOfWork,
    #[error("block signer {signer:?} is not the coinbase {coinbase}")]
    Signature { signer: Option<Addr>, coinbase: Addr },
    #[error("block time {time} is invalid after parent time {parent}")]
    BlockTime { time: u64, parent: u64 },
    #[error("block rejected: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors reported by the chain manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("unknown parent {0}")]
    BrokenChain(Hash),
    #[error("empty chain")]
    EmptyChain,
    #[error("total difficulty {td} does not exceed current {current}")]
    Td { td: U256, current: U256 },
    #[error("state {0} is not available")]
    MissingState(Hash),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("policy failure: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("vm fault: {0}")]
    Exec(#[from] ExecError),
    #[error("decode error: {0}")]
    Decode(#[from] rlp::DecoderError),
    #[error("store error: {0}")]
    Store(String),
    #[error("chain id mismatch: ours {ours}, theirs {theirs}")]
    ChainId { ours: Addr, theirs: Addr },
}

impl ChainError {
    /// The candidate was valid but not heavier than the canonical chain.
    pub fn is_td_error(&self) -> bool {
        matches!(self, ChainError::Td { .. })
    }
}

#[test]
fn test_error_classes() {
    assert!(TxError::Nonce {
        expected: 1,
        got: 0
    }
    .is_skippable());
    assert!(!TxError::Protocol(ProtocolError::Rejected("no".into())).is_skippable());
    assert!(TxError::BlockGasLimit {
        available: 0,
        gas: 1
    }
    .is_block_gas_limit());
    let e: ChainError = TxError::Signature.into();
    assert!(!e.is_td_error());
    assert!(ChainError::Td {
        td: 1.into(),
        current: 1.into()
    }
    .is_td_error());
}
