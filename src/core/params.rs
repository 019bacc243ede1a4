use crate::common::Gas;

pub const MAX_CALL_DEPTH: usize = 1024;
pub const MAX_STACK_DEPTH: usize = 1024;
pub const MAX_MEM_SIZE: usize = 0x1fffffffe0;

// gas consumption parameters
pub const GAS_STEP: Gas = 1;
pub const GAS_STOP: Gas = 0;
pub const GAS_SUICIDE: Gas = 0;
pub const GAS_SHA3: Gas = 20;
pub const GAS_SLOAD: Gas = 20;
pub const GAS_SSTORE: Gas = 100;
pub const GAS_BALANCE: Gas = 20;
pub const GAS_NONCE: Gas = 20;
pub const GAS_CREATE: Gas = 100;
pub const GAS_CALL: Gas = 20;
pub const GAS_MEMORY: Gas = 1;
pub const GAS_DATA: Gas = 5;
pub const GAS_TX: Gas = 500;

// SSTORE is priced by the slot transition instead of the plain step cost
pub const GAS_SSTORE_SET: Gas = 2 * GAS_SSTORE;
pub const GAS_SSTORE_RESET: Gas = GAS_SSTORE;
pub const GAS_SSTORE_CLEAR: Gas = 0;

/// Type tag written next to each length by RLPDECODE (byte strings only).
pub const RLP_ITEM_BYTES: u64 = 0;
