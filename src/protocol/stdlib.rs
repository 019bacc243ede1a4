use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use super::{
    adjust_difficulty, check_block_time, check_difficulty, check_nonce, check_pow, check_signer,
    eth_difficulty, get_var, has_permission, miners, pow2, tx_role, word_to_string, Protocol,
    ROLE_MINE,
};
use crate::block::Block;
use crate::chain_manager::ChainReader;
use crate::common::{Addr, Hash, U256};
use crate::core::WorldStateR;
use crate::error::{ProtocolError, TxError, ValidationError};
use crate::genesis::GenesisConfig;
use crate::tx::Tx;

/// Permissions and chain parameters are read from the storage of the system account.
///
/// The `consensus` parameter picks the difficulty rule: `"robin"` takes turns among the
/// registered miners, `"constant"` uses the base difficulty, anything else adjusts the parent's
/// difficulty towards `blocktime`.
pub struct StdLibModel {
    g: Arc<GenesisConfig>,
}

impl StdLibModel {
    pub fn new(g: Arc<GenesisConfig>) -> Self {
        Self { g }
    }

    fn doug(&self) -> &Addr {
        &self.g.address
    }

    pub fn has_permission(&self, addr: &Addr, role: &str, state: &dyn WorldStateR) -> bool {
        has_permission(self.doug(), addr, role, state)
    }

    fn consensus(&self, state: &dyn WorldStateR) -> String {
        word_to_string(&get_var(self.doug(), "consensus", state))
    }

    fn blocktime(&self, state: &dyn WorldStateR) -> u64 {
        get_var(self.doug(), "blocktime", state).low_u64()
    }

    fn base_difficulty(&self, state: &dyn WorldStateR) -> U256 {
        pow2(get_var(self.doug(), "difficulty", state).low_u64())
    }

    /// Position in the miner rotation of whoever should mine on top of `parent`.
    fn next_miner(&self, parent: &Block, miners: &[Addr]) -> usize {
        if parent.prev_hash() == Hash::zero() || miners.is_empty() {
            0
        } else {
            (parent.number() % miners.len() as u64) as usize
        }
    }

    fn robin_difficulty(&self, block: &Block, parent: &Block, state: &dyn WorldStateR) -> U256 {
        let base = adjust_difficulty(
            &self.base_difficulty(state),
            parent.time(),
            block.time(),
            self.blocktime(state),
        );
        let miners = miners(self.doug(), state);
        let n = miners.len();
        let next = self.next_miner(parent, &miners);
        // distance from the expected miner, or the whole ring for an outsider
        let i = (0..n)
            .find(|i| &miners[(next + i) % n] == block.coinbase())
            .unwrap_or(n);
        pow2(i as u64).saturating_mul(base)
    }
}

impl Protocol for StdLibModel {
    fn name(&self) -> &'static str {
        "std"
    }

    fn genesis(&self) -> &GenesisConfig {
        &self.g
    }

    /// In a round robin, only mine when close to our turn or when the expected miners have been
    /// quiet for long enough.
    fn participate(&self, coinbase: &Addr, parent: &Block, state: &dyn WorldStateR) -> bool {
        if self.consensus(state) != "robin" {
            return true
        }
        let miners = miners(self.doug(), state);
        let n = miners.len();
        if n == 0 {
            return true
        }
        let next = self.next_miner(parent, &miners);
        let i = (1..=n)
            .find(|i| &miners[(next + i) % n] == coinbase)
            .unwrap_or(n);
        if i <= n / 2 {
            return true
        }
        let behind = (i - n / 2) as u64;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let waited = now.saturating_sub(parent.time()) / self.blocktime(state).max(1);
        debug!(
            "{} is {} turns away, {} block times since the parent",
            coinbase, i, waited
        );
        waited > behind
    }

    fn difficulty(&self, block: &Block, parent: &Block, state: &dyn WorldStateR) -> U256 {
        match self.consensus(state).as_str() {
            "robin" => self.robin_difficulty(block, parent, state),
            "constant" => self.base_difficulty(state),
            _ => eth_difficulty(self.blocktime(state), block, parent),
        }
    }

    fn validate_permission(
        &self, addr: &Addr, role: &str, state: &dyn WorldStateR,
    ) -> Result<(), ProtocolError> {
        if self.has_permission(addr, role, state) {
            Ok(())
        } else {
            Err(ProtocolError::Permission {
                addr: addr.clone(),
                role: role.to_string(),
            })
        }
    }

    fn validate_block(
        &self, block: &Block, parent: &Block, state: &dyn WorldStateR,
    ) -> Result<(), ValidationError> {
        self.validate_permission(block.coinbase(), ROLE_MINE, state)?;
        check_signer(block)?;
        check_difficulty(block, self.difficulty(block, parent, state))?;
        check_block_time(block, parent)?;
        check_pow(block)
    }

    fn validate_tx(&self, tx: &Tx, state: &dyn WorldStateR) -> Result<(), TxError> {
        self.validate_permission(tx.from(), tx_role(tx), state)?;
        let max = get_var(self.doug(), "maxgastx", state);
        if !max.is_zero() && U256::from(tx.gas()) > max {
            return Err(TxError::TxGasLimit {
                gas: tx.gas(),
                max: max.low_u64(),
            })
        }
        check_nonce(tx, state)
    }

    fn check_point(&self, _: &Hash, _: &dyn ChainReader) -> bool {
        true
    }
}
