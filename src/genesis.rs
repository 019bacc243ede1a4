//! Genesis configuration and deployment.
//!
//! Deployment turns a [GenesisConfig] into the genesis block and its state: accounts get their
//! balances, the system account receives chain parameters and permissions, the block is signed
//! and the chain id is taken from the signature.
use std::collections::btree_map::BTreeMap;
use std::sync::Arc;

use log::{debug, info};
use rand::RngCore;
use serde::Deserialize;

use crate::block::{calc_tx_sha, calc_uncle_sha, Block, Header};
use crate::common::{create_addr, Addr, Bytes, Hash, Wei, U256};
use crate::config::GENESIS_GAS_LIMIT;
use crate::core::{WorldStateR, WorldStateW};
use crate::error::ProtocolError;
use crate::protocol::{
    miner_slot, new_protocol, perm_slot, pow2, public_slot, stake_slot, str_to_word, var_slot,
    Protocol, ROLE_CREATE, ROLE_MINE, ROLE_TRANSACT, SYSCALLS,
};
use crate::state::State;
use crate::tx::{secret_to_addr, SecretKey};

/// Signing key of non-unique chains. Every node deploying the same configuration derives the
/// same chain id with it.
const STATIC_KEY: &[u8; 32] = b"11111111112222222222333333333322";

/// Replaces [Protocol::deploy]; must leave `state_root` consistent with the state and return the
/// chain id (see [chain_id_from_block]).
pub type Deployer =
    Box<dyn Fn(&mut Block, &mut State) -> Result<Addr, ProtocolError> + Send + Sync>;

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct GenesisAccount {
    pub address: Addr,
    pub name: String,
    pub balance: Wei,
    /// role name to permission value; non-zero grants
    pub permissions: BTreeMap<String, u64>,
    pub stake: u64,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct VmConsensus {
    #[serde(rename = "suite-name")]
    pub suite_name: String,
    /// Runtime code of the policy contracts, keyed by their slot name.
    pub contracts: BTreeMap<String, Bytes>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct GenesisConfig {
    /// The system account holding permissions and chain parameters.
    pub address: Addr,
    /// Sign with `private_key` (or a fresh key) instead of the well-known static one.
    pub unique: bool,
    #[serde(rename = "private-key")]
    pub private_key: Option<Bytes>,
    /// `yes`, `no`, `std`, `vm` or `eth`
    #[serde(rename = "model")]
    pub model_name: String,
    /// Only bankroll the accounts; no parameters or permissions are written.
    #[serde(rename = "no-gendoug")]
    pub no_gendoug: bool,
    /// Difficulty rule of the std model (`robin`, `constant`, anything else adjusts).
    pub consensus: String,
    /// Base difficulty exponent: blocks start at `2^difficulty`.
    pub difficulty: u64,
    #[serde(rename = "public:mine")]
    pub public_mine: u64,
    #[serde(rename = "public:create")]
    pub public_create: u64,
    #[serde(rename = "public:tx")]
    pub public_tx: u64,
    /// Gas allowed per transaction, zero for unlimited.
    pub maxgastx: u64,
    /// Target block time in seconds.
    pub blocktime: u64,
    pub vm: Option<VmConsensus>,
    pub accounts: Vec<GenesisAccount>,
}

impl GenesisConfig {
    /// Build the policy named by `model_name`.
    pub fn into_protocol(self) -> Arc<dyn Protocol> {
        let name = self.model_name.clone();
        new_protocol(&name, Arc::new(self))
    }

    fn signing_key(&self) -> Result<SecretKey, ProtocolError> {
        if !self.unique {
            return SecretKey::parse(STATIC_KEY)
                .map_err(|_| ProtocolError::Rejected("invalid static key".into()))
        }
        match &self.private_key {
            Some(k) => SecretKey::parse_slice(k)
                .map_err(|_| ProtocolError::Rejected("invalid genesis private key".into())),
            None => {
                let mut rng = rand::thread_rng();
                let mut seed = [0u8; 32];
                loop {
                    rng.fill_bytes(&mut seed);
                    if let Ok(k) = SecretKey::parse(&seed) {
                        return Ok(k)
                    }
                }
            }
        }
    }
}

/// The fixed genesis header; deployment fills in difficulty, state root and signature.
pub fn genesis_block() -> Block {
    Block {
        header: Header {
            prev_hash: Hash::zero().clone(),
            uncle_sha: calc_uncle_sha(&[]),
            coinbase: Addr::zero().clone(),
            state_root: State::new().root(),
            tx_sha: calc_tx_sha(&[]),
            difficulty: U256::zero(),
            number: 0,
            min_gas_price: Wei::zero().clone(),
            gas_limit: GENESIS_GAS_LIMIT,
            gas_used: 0,
            time: 0,
            extra: Bytes::empty(),
            nonce: Hash::hash(&[42]).as_bytes().into(),
        },
        ..Default::default()
    }
}

/// Seal the genesis block: record the state root, sign, and derive the chain id from the first
/// 20 bytes of the signature's digest.
pub fn chain_id_from_block(block: &mut Block, state: &State, key: &SecretKey) -> Addr {
    block.header.state_root = state.root();
    debug!("signing genesis with {}", secret_to_addr(key));
    block.sign(key);
    chain_id_of(block).unwrap_or_default()
}

/// Chain id of a sealed genesis block, `None` when it is unsigned.
pub fn chain_id_of(block: &Block) -> Option<Addr> {
    let sig = block.sig.as_ref()?.to_bytes();
    Some(Addr::from_slice(&Hash::hash(&sig).as_bytes()[..20]))
}

fn set_var(state: &mut State, doug: &Addr, name: &str, v: U256) {
    state.set_state(doug, &var_slot(name), &v);
}

fn set_values(g: &GenesisConfig, state: &mut State) {
    let doug = &g.address;
    set_var(state, doug, "consensus", str_to_word(&g.consensus));
    set_var(state, doug, "difficulty", g.difficulty.into());
    set_var(state, doug, "maxgastx", g.maxgastx.into());
    set_var(state, doug, "blocktime", g.blocktime.into());
    for (role, v) in [
        (ROLE_MINE, g.public_mine),
        (ROLE_CREATE, g.public_create),
        (ROLE_TRANSACT, g.public_tx),
    ] {
        state.set_state(doug, &public_slot(role), &v.into());
    }
}

fn bankroll(g: &GenesisConfig, state: &mut State) {
    for acc in &g.accounts {
        state.set_balance(&acc.address, &acc.balance);
    }
}

fn grant_permissions(g: &GenesisConfig, state: &mut State) {
    let doug = &g.address;
    for acc in &g.accounts {
        for (role, v) in &acc.permissions {
            state.set_state(doug, &perm_slot(role, &acc.address), &(*v).into());
        }
        if acc.permissions.get(ROLE_MINE).copied().unwrap_or(0) != 0 {
            let n = state.get_state(doug, &var_slot("miners")).low_u64();
            state.set_state(doug, &miner_slot(n), &acc.address.clone().into());
            state.set_state(doug, &stake_slot(&acc.address), &acc.stake.into());
            set_var(state, doug, "miners", (n + 1).into());
            debug!("registered miner {} ({})", acc.name, acc.address);
        }
    }
}

fn install_vm_contracts(g: &GenesisConfig, state: &mut State) -> Result<(), ProtocolError> {
    let vm = match &g.vm {
        Some(vm) => vm,
        None => return Ok(()),
    };
    for (name, code) in &vm.contracts {
        let pos = SYSCALLS.iter().position(|n| n == name).ok_or_else(|| {
            ProtocolError::Rejected(format!("unknown policy contract `{}`", name))
        })?;
        let addr = create_addr(&g.address, pos as u64 + 1);
        state.create_account(&addr);
        state.set_code(&addr, code);
        set_var(state, &g.address, name, addr.clone().into());
        info!("installed {} contract at {}", name, addr);
    }
    Ok(())
}

/// Apply `g` to the genesis block and its state. Returns the chain id.
pub fn deploy_genesis(
    g: &GenesisConfig, block: &mut Block, state: &mut State,
) -> Result<Addr, ProtocolError> {
    block.header.difficulty = pow2(g.difficulty);
    let key = g.signing_key()?;
    if g.no_gendoug {
        bankroll(g, state);
    } else {
        info!("deploying system account {}", g.address);
        if !state.exist(&g.address) {
            state.create_account(&g.address);
        }
        set_values(g, state);
        bankroll(g, state);
        grant_permissions(g, state);
        install_vm_contracts(g, state)?;
    }
    let chain_id = chain_id_from_block(block, state, &key);
    info!("genesis {} deployed, chain id {}", block.hash(), chain_id);
    Ok(chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::miners;

    const JSON: &str = r#"{
        "address": "0x00000000000000000000000000000000000000d0",
        "model": "std",
        "consensus": "robin",
        "difficulty": 3,
        "public:create": 1,
        "maxgastx": 5000,
        "blocktime": 10,
        "accounts": [
            {
                "address": "0x0000000000000000000000000000000000000001",
                "name": "alice",
                "balance": "0x3e8",
                "permissions": {"mine": 1, "transact": 1},
                "stake": 5
            },
            {
                "address": "0x0000000000000000000000000000000000000002",
                "name": "bob",
                "balance": "0x10",
                "permissions": {"transact": 1}
            }
        ]
    }"#;

    #[test]
    fn test_parse_and_deploy() {
        let g: GenesisConfig = serde_json::from_str(JSON).unwrap();
        assert_eq!(g.model_name, "std");
        assert_eq!(g.accounts.len(), 2);
        let mut block = genesis_block();
        let mut state = State::new();
        let id = deploy_genesis(&g, &mut block, &mut state).unwrap();
        let alice = Addr::from(U256::from(1));
        let bob = Addr::from(U256::from(2));
        assert_eq!(state.get_balance(&alice), 1000u64.into());
        assert_eq!(block.header.difficulty, U256::from(8));
        assert_eq!(block.header.state_root, state.root());
        assert_eq!(block.signer(), Some(secret_to_addr(&SecretKey::parse(STATIC_KEY).unwrap())));
        assert_eq!(miners(&g.address, &state), vec![alice.clone()]);

        let p = g.clone().into_protocol();
        assert_eq!(p.name(), "std");
        assert!(p.validate_permission(&alice, ROLE_MINE, &state).is_ok());
        assert!(p.validate_permission(&bob, ROLE_MINE, &state).is_err());
        assert!(p.validate_permission(&bob, ROLE_CREATE, &state).is_ok());

        // same configuration, same chain
        let mut block2 = genesis_block();
        let id2 = deploy_genesis(&g, &mut block2, &mut State::new()).unwrap();
        assert_eq!(id, id2);
        assert_eq!(block.hash(), block2.hash());
    }

    #[test]
    fn test_unique_keys() {
        let g = GenesisConfig {
            unique: true,
            private_key: Some(vec![9u8; 32].into()),
            no_gendoug: true,
            ..Default::default()
        };
        let mut block = genesis_block();
        let mut state = State::new();
        let id = deploy_genesis(&g, &mut block, &mut state).unwrap();
        assert!(state.is_empty());
        assert_eq!(block.signer(), Some(secret_to_addr(&SecretKey::parse(&[9; 32]).unwrap())));
        let fresh = GenesisConfig {
            unique: true,
            ..Default::default()
        };
        let id2 = deploy_genesis(&fresh, &mut genesis_block(), &mut State::new()).unwrap();
        assert_ne!(id, id2);
        let bad = GenesisConfig {
            unique: true,
            private_key: Some(vec![0u8; 32].into()),
            ..Default::default()
        };
        assert!(deploy_genesis(&bad, &mut genesis_block(), &mut State::new()).is_err());
    }

    #[test]
    fn test_vm_contracts() {
        let mut contracts = BTreeMap::new();
        contracts.insert("compute-difficulty".to_string(), Bytes::from(vec![0x00]));
        let mut g = GenesisConfig {
            model_name: "vm".into(),
            vm: Some(VmConsensus {
                suite_name: "test".into(),
                contracts,
            }),
            ..Default::default()
        };
        let p = g.clone().into_protocol();
        let mut state = State::new();
        p.deploy(&mut genesis_block(), &mut state).unwrap();
        let addr: Addr = state.get_state(&g.address, &var_slot("compute-difficulty")).into();
        assert_eq!(&*state.get_code(&addr).as_bytes(), &[0x00]);

        g.vm = None;
        assert!(g.into_protocol().deploy(&mut genesis_block(), &mut State::new()).is_err());
    }
}
