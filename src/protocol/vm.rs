use std::collections::hash_map::HashMap;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;
use rlp::RlpStream;

use super::{eth_difficulty, has_permission, tx_role, var_slot, Protocol, YesModel, ROLE_MINE};
use crate::block::Block;
use crate::chain_manager::ChainReader;
use crate::common::{Addr, Hash, Wei, U256, U256RLP};
use crate::core::{TxExecContext, TxExecEnv, TxExecResult, WorldStateR};
use crate::error::{ProtocolError, TxError, ValidationError};
use crate::genesis::{deploy_genesis, GenesisConfig};
use crate::state::{ScratchState, State};
use crate::tx::Tx;

/// Names of the policy contracts a VM-delegated chain may install.
pub const SYSCALLS: [&str; 8] = [
    "permission-verify",
    "block-verify",
    "tx-verify",
    "compute-difficulty",
    "compute-participate",
    "participate",
    "precall",
    "postcall",
];

const SYSCALL_GAS: u64 = 10_000_000;
/// Target block time used when no difficulty contract is installed.
const DEFAULT_BLOCK_TIME: u64 = 300;

/// Every policy decision is delegated to a contract call. Calls run on a throw-away overlay of
/// the relevant state with the permissive policy, and a returned word greater than zero means
/// yes. Without a contract for a decision the storage-backed permission check is used.
pub struct VmModel {
    g: Arc<GenesisConfig>,
    yes: Arc<dyn Protocol>,
    contracts: RwLock<HashMap<&'static str, Addr>>,
}

fn word(ret: &[u8]) -> U256 {
    U256::from_big_endian(&ret[..ret.len().min(32)])
}

/// `len ++ rlp(header)` for the block and then the parent.
fn pack_block_parent(block: &Block, parent: &Block) -> Vec<u8> {
    let mut data = Vec::new();
    for h in [&block.header, &parent.header] {
        let enc = rlp::encode(h);
        let mut len = [0u8; 32];
        U256::from(enc.len()).to_big_endian(&mut len);
        data.extend_from_slice(&len);
        data.extend_from_slice(&enc);
    }
    data
}

impl VmModel {
    pub fn new(g: Arc<GenesisConfig>) -> Self {
        Self {
            yes: Arc::new(YesModel::new(g.clone())),
            g,
            contracts: RwLock::new(HashMap::new()),
        }
    }

    fn doug(&self) -> &Addr {
        &self.g.address
    }

    /// Record the address of a policy contract. Unknown names are ignored.
    pub fn set_syscall(&self, name: &str, addr: Addr) {
        if let Some(name) = SYSCALLS.iter().find(|n| **n == name) {
            self.contracts.write().insert(name, addr);
        }
    }

    /// Address of the `name` contract: the registered one, else the one recorded in the system
    /// account.
    pub fn syscall(&self, name: &str, state: &dyn WorldStateR) -> Option<Addr> {
        if let Some(addr) = self.contracts.read().get(name) {
            return Some(addr.clone())
        }
        let v = state.get_state(self.doug(), &var_slot(name));
        if v.is_zero() {
            None
        } else {
            Some(v.into())
        }
    }

    fn call(
        &self, name: &str, contract: &Addr, input: Vec<u8>, state: &dyn WorldStateR,
        block: Option<&Block>,
    ) -> Result<U256, ProtocolError> {
        let mut scratch = ScratchState::new(state);
        let env = TxExecEnv::new(
            block.map(Block::env).unwrap_or_default(),
            self.doug().clone(),
            self.yes.clone(),
        );
        let code = scratch.get_code(contract);
        let ctx =
            TxExecContext::new(&mut scratch, &env, self.doug().clone(), Wei::zero().clone());
        debug!("calling {} contract at {}", name, contract);
        match ctx.run(
            self.doug().clone(),
            contract.clone(),
            code,
            input.into(),
            Wei::zero().clone(),
            SYSCALL_GAS,
        ) {
            TxExecResult::Succeeded(ret, _, _) => Ok(word(&ret)),
            TxExecResult::Failed(e) => {
                debug!("{} contract failed: {}", name, e);
                Err(ProtocolError::Contract(name.to_string()))
            }
        }
    }

    fn approve(
        &self, name: &str, contract: &Addr, input: Vec<u8>, state: &dyn WorldStateR,
        block: Option<&Block>,
    ) -> Result<(), ProtocolError> {
        if self.call(name, contract, input, state, block)?.is_zero() {
            Err(ProtocolError::Contract(name.to_string()))
        } else {
            Ok(())
        }
    }
}

impl Protocol for VmModel {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn genesis(&self) -> &GenesisConfig {
        &self.g
    }

    fn participate(&self, coinbase: &Addr, parent: &Block, state: &dyn WorldStateR) -> bool {
        match self.syscall("compute-participate", state) {
            Some(c) => self
                .approve(
                    "compute-participate",
                    &c,
                    coinbase.to_word().as_bytes().to_vec(),
                    state,
                    Some(parent),
                )
                .is_ok(),
            None => self.validate_permission(coinbase, ROLE_MINE, state).is_ok(),
        }
    }

    fn difficulty(&self, block: &Block, parent: &Block, state: &dyn WorldStateR) -> U256 {
        match self.syscall("compute-difficulty", state) {
            Some(c) => self
                .call(
                    "compute-difficulty",
                    &c,
                    pack_block_parent(block, parent),
                    state,
                    Some(block),
                )
                // a broken difficulty contract makes every block invalid
                .unwrap_or_else(|_| U256::zero()),
            None => eth_difficulty(DEFAULT_BLOCK_TIME, block, parent),
        }
    }

    fn validate_permission(
        &self, addr: &Addr, role: &str, state: &dyn WorldStateR,
    ) -> Result<(), ProtocolError> {
        match self.syscall("permission-verify", state) {
            Some(c) => {
                let mut input = addr.to_word().as_bytes().to_vec();
                let mut r = [0u8; 32];
                let n = role.len().min(32);
                r[..n].copy_from_slice(&role.as_bytes()[..n]);
                input.extend_from_slice(&r);
                self.approve("permission-verify", &c, input, state, None)
            }
            None if has_permission(self.doug(), addr, role, state) => Ok(()),
            None => Err(ProtocolError::Permission {
                addr: addr.clone(),
                role: role.to_string(),
            }),
        }
    }

    fn validate_block(
        &self, block: &Block, parent: &Block, state: &dyn WorldStateR,
    ) -> Result<(), ValidationError> {
        let contract = match self.syscall("block-verify", state) {
            Some(c) => c,
            None => return Ok(self.validate_permission(block.coinbase(), ROLE_MINE, state)?),
        };
        let mut data = pack_block_parent(block, parent);
        let mut sig = RlpStream::new_list(3);
        match &block.sig {
            Some(s) => sig
                .append(&U256RLP(s.r))
                .append(&U256RLP(s.s))
                .append(&U256RLP(U256::from(s.v.saturating_sub(27)))),
            None => sig
                .append(&U256RLP(U256::zero()))
                .append(&U256RLP(U256::zero()))
                .append(&U256RLP(U256::zero())),
        };
        let sig = sig.out();
        let mut len = [0u8; 32];
        U256::from(sig.len()).to_big_endian(&mut len);
        data.extend_from_slice(&len);
        data.extend_from_slice(&sig);
        Ok(self.approve("block-verify", &contract, data, state, Some(block))?)
    }

    fn validate_tx(&self, tx: &Tx, state: &dyn WorldStateR) -> Result<(), TxError> {
        match self.syscall("tx-verify", state) {
            Some(c) => {
                let enc = tx.encode();
                let mut data = [0u8; 32].to_vec();
                U256::from(enc.len()).to_big_endian(&mut data);
                data.extend_from_slice(&enc);
                Ok(self.approve("tx-verify", &c, data, state, None)?)
            }
            None => Ok(self.validate_permission(tx.from(), tx_role(tx), state)?),
        }
    }

    fn check_point(&self, _: &Hash, _: &dyn ChainReader) -> bool {
        true
    }

    /// Deploy as usual, then pick up the addresses of the installed policy contracts.
    fn deploy(&self, genesis: &mut Block, state: &mut State) -> Result<Addr, ProtocolError> {
        if self.g.vm.is_none() {
            return Err(ProtocolError::Rejected(
                "the vm model needs a `vm` genesis section".into(),
            ))
        }
        let chain_id = deploy_genesis(&self.g, genesis, state)?;
        for name in SYSCALLS {
            let v = state.get_state(self.doug(), &var_slot(name));
            if !v.is_zero() {
                info!("{} contract installed at {}", name, Addr::from(v));
                self.contracts.write().insert(name, v.into());
            }
        }
        Ok(chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorldStateW;
    use crate::protocol::{perm_slot, ROLE_TRANSACT};

    // returns the first calldata word
    const ECHO: &str = "600035600052602060 00f2";
    // returns 0x77
    const CONST: &str = "6077600052602060 00f2";

    fn code(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).unwrap()
    }

    fn setup() -> (VmModel, State) {
        let g = GenesisConfig {
            address: Addr::from(U256::from(0xd0u64)),
            ..Default::default()
        };
        (VmModel::new(Arc::new(g)), State::new())
    }

    #[test]
    fn test_storage_fallback() {
        let (m, mut state) = setup();
        let a = Addr::from(U256::from(5));
        assert!(m.validate_permission(&a, ROLE_TRANSACT, &state).is_err());
        state.set_state(m.doug(), &perm_slot(ROLE_TRANSACT, &a), &U256::one());
        assert!(m.validate_permission(&a, ROLE_TRANSACT, &state).is_ok());
        let mut parent = Block::default();
        parent.header.difficulty = U256::from(1 << 12);
        let block = Block::new_child(&parent, a, 10, Default::default());
        assert_eq!(
            m.difficulty(&block, &parent, &state),
            eth_difficulty(DEFAULT_BLOCK_TIME, &block, &parent)
        );
    }

    #[test]
    fn test_contract_calls() {
        let (m, mut state) = setup();
        let perm = Addr::from(U256::from(0x100));
        let diff = Addr::from(U256::from(0x101));
        state.set_code(&perm, &code(ECHO));
        state.set_code(&diff, &code(CONST));
        // one through the system account, one registered directly
        state.set_state(m.doug(), &var_slot("permission-verify"), &perm.clone().into());
        m.set_syscall("compute-difficulty", diff.clone());
        m.set_syscall("not-a-syscall", diff);
        assert_eq!(m.contracts.read().len(), 1);

        let root = state.root();
        assert!(m
            .validate_permission(&Addr::from(U256::from(7)), ROLE_MINE, &state)
            .is_ok());
        assert_eq!(
            m.validate_permission(Addr::zero(), ROLE_MINE, &state),
            Err(ProtocolError::Contract("permission-verify".into()))
        );
        let parent = Block::default();
        let block = Block::new_child(&parent, Addr::default(), 1, Default::default());
        assert_eq!(m.difficulty(&block, &parent, &state), U256::from(0x77));
        // policy calls never touch the real state
        assert_eq!(state.root(), root);
    }
}
