use std::sync::Arc;

use super::{pow2, Protocol};
use crate::block::Block;
use crate::chain_manager::ChainReader;
use crate::common::{Addr, Hash, U256};
use crate::core::WorldStateR;
use crate::error::{ProtocolError, TxError, ValidationError};
use crate::genesis::GenesisConfig;
use crate::tx::Tx;

/// Rejects every block, transaction, permission and checkpoint. Useful for a node that only
/// follows a checkpoint and for testing the rejection paths.
pub struct NoModel {
    g: Arc<GenesisConfig>,
}

impl NoModel {
    pub fn new(g: Arc<GenesisConfig>) -> Self {
        Self { g }
    }
}

impl Protocol for NoModel {
    fn name(&self) -> &'static str {
        "no"
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
        &self, addr: &Addr, role: &str, _: &dyn WorldStateR,
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::Permission {
            addr: addr.clone(),
            role: role.to_string(),
        })
    }

    fn validate_block(
        &self, _: &Block, _: &Block, _: &dyn WorldStateR,
    ) -> Result<(), ValidationError> {
        Err(ProtocolError::Rejected("no blocks are accepted".into()).into())
    }

    fn validate_tx(&self, _: &Tx, _: &dyn WorldStateR) -> Result<(), TxError> {
        Err(ProtocolError::Rejected("no transactions are accepted".into()).into())
    }

    fn check_point(&self, _: &Hash, _: &dyn ChainReader) -> bool {
        false
    }
}
