//! Pluggable consensus and permission policies.
//!
//! A [Protocol] answers every policy question the ledger engine asks: who may mine, transact or
//! create contracts, what difficulty a block must carry, whether a block or transaction is
//! acceptable and whether a proposed checkpoint can be trusted. The storage-backed policies read
//! their parameters from the system ("gendoug") account written at genesis; the layout of that
//! account's storage is defined by the slot helpers below.
use std::sync::Arc;

use crate::block::Block;
use crate::chain_manager::ChainReader;
use crate::common::{Addr, Hash, U256};
use crate::core::WorldStateR;
use crate::error::{ProtocolError, TxError, ValidationError};
use crate::genesis::{deploy_genesis, GenesisConfig};
use crate::pow;
use crate::state::State;
use crate::tx::Tx;

mod eth;
mod no;
mod stdlib;
mod vm;
mod yes;

pub use eth::EthModel;
pub use no::NoModel;
pub use stdlib::StdLibModel;
pub use vm::{VmModel, SYSCALLS};
pub use yes::YesModel;

pub const ROLE_MINE: &str = "mine";
pub const ROLE_CREATE: &str = "create";
pub const ROLE_TRANSACT: &str = "transact";

pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Configuration the policy was built from; its `address` is the system account.
    fn genesis(&self) -> &GenesisConfig;

    /// Whether `coinbase` should try to mine on top of `parent`. `state` is the parent's state.
    fn participate(&self, coinbase: &Addr, parent: &Block, state: &dyn WorldStateR) -> bool;

    /// Difficulty `block` must carry when built on `parent`.
    fn difficulty(&self, block: &Block, parent: &Block, state: &dyn WorldStateR) -> U256;

    fn validate_permission(
        &self, addr: &Addr, role: &str, state: &dyn WorldStateR,
    ) -> Result<(), ProtocolError>;

    /// Structural and policy checks of `block` against its parent and the parent's state.
    fn validate_block(
        &self, block: &Block, parent: &Block, state: &dyn WorldStateR,
    ) -> Result<(), ValidationError>;

    /// Checks run before a transaction is applied to `state`.
    fn validate_tx(&self, tx: &Tx, state: &dyn WorldStateR) -> Result<(), TxError>;

    /// Whether a peer-proposed checkpoint may be adopted.
    fn check_point(&self, proposed: &Hash, chain: &dyn ChainReader) -> bool;

    /// Populate the genesis block and its state. Returns the chain id.
    fn deploy(&self, genesis: &mut Block, state: &mut State) -> Result<Addr, ProtocolError> {
        deploy_genesis(self.genesis(), genesis, state)
    }
}

/// Build the policy named `name`: `"yes"`, `"no"`, `"std"`, `"vm"` or `"eth"`. Anything else
/// gets the permissive `"yes"` model.
pub fn new_protocol(name: &str, doug: Arc<GenesisConfig>) -> Arc<dyn Protocol> {
    match name {
        "no" => Arc::new(NoModel::new(doug)),
        "std" => Arc::new(StdLibModel::new(doug)),
        "vm" => Arc::new(VmModel::new(doug)),
        "eth" => Arc::new(EthModel::new(doug)),
        _ => Arc::new(YesModel::new(doug)),
    }
}

/// Per-address permission slot: `keccak(role ++ addr)`.
pub fn perm_slot(role: &str, addr: &Addr) -> Hash {
    Hash::hash_concat(&[role.as_bytes(), addr.as_bytes()])
}

/// Slot that, when non-zero, grants `role` to everyone.
pub fn public_slot(role: &str) -> Hash {
    Hash::hash_concat(&[b"public:", role.as_bytes()])
}

/// Slot of a named chain parameter.
pub fn var_slot(name: &str) -> Hash {
    Hash::hash(name.as_bytes())
}

/// Slot of the `i`-th registered miner; the count lives at `var_slot("miners")`.
pub fn miner_slot(i: u64) -> Hash {
    Hash::hash_concat(&[b"miner:", &i.to_be_bytes()])
}

pub fn stake_slot(addr: &Addr) -> Hash {
    Hash::hash_concat(&[b"stake:", addr.as_bytes()])
}

/// Short strings are stored right-aligned in a storage word.
pub fn str_to_word(s: &str) -> U256 {
    let b = s.as_bytes();
    U256::from_big_endian(&b[..b.len().min(32)])
}

pub fn word_to_string(w: &U256) -> String {
    let mut buf = [0u8; 32];
    w.to_big_endian(&mut buf);
    let start = buf.iter().position(|b| *b != 0).unwrap_or(32);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}

pub(crate) fn get_var(doug: &Addr, name: &str, state: &dyn WorldStateR) -> U256 {
    state.get_state(doug, &var_slot(name))
}

/// Storage-backed permission check shared by the std and vm policies.
pub(crate) fn has_permission(
    doug: &Addr, addr: &Addr, role: &str, state: &dyn WorldStateR,
) -> bool {
    !state.get_state(doug, &public_slot(role)).is_zero() ||
        !state.get_state(doug, &perm_slot(role, addr)).is_zero()
}

pub(crate) fn tx_role(tx: &Tx) -> &'static str {
    if tx.is_contract_creation() {
        ROLE_CREATE
    } else {
        ROLE_TRANSACT
    }
}

/// Registered miners in registration order.
pub fn miners(doug: &Addr, state: &dyn WorldStateR) -> Vec<Addr> {
    let n = get_var(doug, "miners", state).low_u64();
    (0..n)
        .map(|i| state.get_state(doug, &miner_slot(i)).into())
        .collect()
}

/// `2^exp`, saturating at the top bit.
pub fn pow2(exp: u64) -> U256 {
    U256::one() << exp.min(255) as usize
}

/// Move `old` by `old / 256` towards the target block time: down when the new block came late,
/// up otherwise.
pub fn adjust_difficulty(old: &U256, old_time: u64, new_time: u64, target: u64) -> U256 {
    let adj = *old >> 8;
    if new_time >= old_time.saturating_add(target) {
        *old - adj
    } else {
        old.saturating_add(adj)
    }
}

pub fn eth_difficulty(target: u64, block: &Block, parent: &Block) -> U256 {
    adjust_difficulty(parent.difficulty(), parent.time(), block.time(), target)
}

pub(crate) fn check_block_time(block: &Block, parent: &Block) -> Result<(), ValidationError> {
    if block.time() < parent.time() {
        return Err(ValidationError::BlockTime {
            time: block.time(),
            parent: parent.time(),
        })
    }
    Ok(())
}

pub(crate) fn check_signer(block: &Block) -> Result<(), ValidationError> {
    let signer = block.signer();
    if signer.as_ref() != Some(block.coinbase()) {
        return Err(ValidationError::Signature {
            signer,
            coinbase: block.coinbase().clone(),
        })
    }
    Ok(())
}

pub(crate) fn check_difficulty(block: &Block, required: U256) -> Result<(), ValidationError> {
    if block.difficulty() != &required {
        return Err(ValidationError::Difficulty {
            expected: required,
            got: *block.difficulty(),
        })
    }
    Ok(())
}

pub(crate) fn check_pow(block: &Block) -> Result<(), ValidationError> {
    if !pow::verify(
        &block.hash_no_nonce(),
        block.difficulty(),
        &block.header.nonce,
    ) {
        return Err(ValidationError::ProofOfWork)
    }
    Ok(())
}

pub(crate) fn check_nonce(tx: &Tx, state: &dyn WorldStateR) -> Result<(), TxError> {
    let expected = state.get_nonce(tx.from());
    if expected != tx.nonce() {
        return Err(TxError::Nonce {
            expected,
            got: tx.nonce(),
        })
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_difficulty() {
        let d = U256::from(1u64 << 20);
        assert_eq!(adjust_difficulty(&d, 100, 110, 10), d - (d >> 8));
        assert_eq!(adjust_difficulty(&d, 100, 109, 10), d + (d >> 8));
        // tiny difficulties never move
        assert_eq!(adjust_difficulty(&U256::from(255), 0, 0, 5), U256::from(255));
        assert_eq!(adjust_difficulty(&U256::MAX, 0, 0, 5), U256::MAX);
    }

    #[test]
    fn test_word_strings() {
        assert_eq!(word_to_string(&str_to_word("robin")), "robin");
        assert_eq!(word_to_string(&U256::zero()), "");
        assert_eq!(pow2(4), U256::from(16));
        assert_eq!(pow2(999), U256::one() << 255);
    }

    #[test]
    fn test_slots_are_distinct() {
        let a = Addr::from(U256::from(7));
        assert_ne!(perm_slot(ROLE_MINE, &a), perm_slot(ROLE_CREATE, &a));
        assert_ne!(public_slot(ROLE_MINE), var_slot("public:mine:"));
        assert_eq!(public_slot(ROLE_MINE), Hash::hash(b"public:mine"));
        assert_ne!(miner_slot(0), miner_slot(1));
    }

    #[test]
    fn test_factory() {
        let g = Arc::new(GenesisConfig::default());
        for (name, expect) in [
            ("yes", "yes"),
            ("no", "no"),
            ("std", "std"),
            ("vm", "vm"),
            ("eth", "eth"),
            ("whatever", "yes"),
        ] {
            assert_eq!(new_protocol(name, g.clone()).name(), expect);
        }
    }
}
