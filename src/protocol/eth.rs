use std::sync::Arc;

use super::{
    check_block_time, check_difficulty, check_nonce, check_pow, check_signer, eth_difficulty,
    Protocol,
};
use crate::block::Block;
use crate::chain_manager::ChainReader;
use crate::common::{Addr, Hash, U256};
use crate::core::WorldStateR;
use crate::error::{ProtocolError, TxError, ValidationError};
use crate::genesis::GenesisConfig;
use crate::tx::Tx;

/// Open proof-of-work chain: no permissions, difficulty chases the configured block time.
pub struct EthModel {
    g: Arc<GenesisConfig>,
}

impl EthModel {
    pub fn new(g: Arc<GenesisConfig>) -> Self {
        Self { g }
    }
}

impl Protocol for EthModel {
    fn name(&self) -> &'static str {
        "eth"
    }

    fn genesis(&self) -> &GenesisConfig {
        &self.g
    }

    fn participate(&self, _: &Addr, _: &Block, _: &dyn WorldStateR) -> bool {
        true
    }

    fn difficulty(&self, block: &Block, parent: &Block, _: &dyn WorldStateR) -> U256 {
        eth_difficulty(self.g.blocktime, block, parent)
    }

    fn validate_permission(
        &self, _: &Addr, _: &str, _: &dyn WorldStateR,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn validate_block(
        &self, block: &Block, parent: &Block, state: &dyn WorldStateR,
    ) -> Result<(), ValidationError> {
        check_signer(block)?;
        check_difficulty(block, self.difficulty(block, parent, state))?;
        check_block_time(block, parent)?;
        check_pow(block)
    }

    fn validate_tx(&self, tx: &Tx, state: &dyn WorldStateR) -> Result<(), TxError> {
        check_nonce(tx, state)
    }

    /// Checkpoints cannot be authenticated on an open chain.
    fn check_point(&self, _: &Hash, _: &dyn ChainReader) -> bool {
        false
    }
}
