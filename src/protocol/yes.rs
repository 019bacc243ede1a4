use std::sync::Arc;

use super::{pow2, Protocol};
use crate::block::Block;
use crate::chain_manager::ChainReader;
use crate::common::{Addr, Hash, U256};
use crate::core::WorldStateR;
use crate::error::{ProtocolError, TxError, ValidationError};
use crate::genesis::GenesisConfig;
use crate::tx::Tx;

/// Allows everything. Blocks carry the constant difficulty `2^difficulty` from the genesis
/// configuration.
pub struct YesModel {
    g: Arc<GenesisConfig>,
}

impl YesModel {
    pub fn new(g: Arc<GenesisConfig>) -> Self {
        Self { g }
    }
}

impl Protocol for YesModel {
    fn name(&self) -> &'static str {
        "yes"
    }

    fn genesis(&self) -> &GenesisConfig {
        &self.g
    }

    fn participate(&self, _: &Addr, _: &Block, _: &dyn WorldStateR) -> bool {
        true
    }

    fn difficulty(&self, _: &Block, _: &Block, _: &dyn WorldStateR) -> U256 {
        pow2(self.g.difficulty)
    }

    fn validate_permission(
        &self, _: &Addr, _: &str, _: &dyn WorldStateR,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn validate_block(
        &self, _: &Block, _: &Block, _: &dyn WorldStateR,
    ) -> Result<(), ValidationError> {
        Ok(())
    }

    fn validate_tx(&self, _: &Tx, _: &dyn WorldStateR) -> Result<(), TxError> {
        Ok(())
    }

    fn check_point(&self, _: &Hash, _: &dyn ChainReader) -> bool {
        true
    }
}
