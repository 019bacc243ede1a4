#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use qchain::block::{Block, Header};
use qchain::block_manager::BlockManager;
use qchain::block_pool::Peer;
use qchain::chain_manager::ChainManager;
use qchain::common::{Addr, Hash, Wei, U256};
use qchain::config::ChainConfig;
use qchain::error::ChainError;
use qchain::genesis::{GenesisAccount, GenesisConfig};
use qchain::reactor::Reactor;
use qchain::store::{Database, MemDatabase};
use qchain::tx::{secret_to_addr, SecretKey, Tx};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn key(i: u8) -> SecretKey {
    SecretKey::parse(&[i; 32]).unwrap()
}

pub fn addr(i: u8) -> Addr {
    secret_to_addr(&key(i))
}

pub const ALICE: u8 = 1;
pub const BOB: u8 = 2;

pub fn initial_balance() -> Wei {
    (U256::from(10u64).pow(U256::from(18u64))).into()
}

pub fn genesis() -> GenesisConfig {
    GenesisConfig {
        model_name: "yes".into(),
        difficulty: 4,
        accounts: vec![GenesisAccount {
            address: addr(ALICE),
            name: "alice".into(),
            balance: initial_balance(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn reward() -> U256 {
    ChainConfig::default().block_reward.into()
}

/// A chain manager plus a block builder that can mine on any known block.
pub struct Node {
    pub db: Arc<dyn Database>,
    pub reactor: Arc<Reactor>,
    pub chain: Arc<ChainManager>,
    builder: BlockManager,
}

impl Node {
    pub fn new() -> Self {
        Self::open(Arc::new(MemDatabase::new()))
    }

    pub fn open(db: Arc<dyn Database>) -> Self {
        Self::with_capacity(db, 64)
    }

    /// `capacity` is the per-subscriber buffer of the node's reactor.
    pub fn with_capacity(db: Arc<dyn Database>, capacity: usize) -> Self {
        init_logger();
        let reactor = Arc::new(Reactor::new(capacity));
        let config = ChainConfig::default();
        let chain = Arc::new(
            ChainManager::new(
                db.clone(),
                genesis().into_protocol(),
                config.clone(),
                reactor.clone(),
                None,
            )
            .unwrap(),
        );
        let builder = BlockManager::new(chain.protocol().clone(), &config);
        Self {
            db,
            reactor,
            chain,
            builder,
        }
    }

    pub fn try_build_on(
        &self, parent: &Block, miner: u8, time: u64, txs: &[Tx], uncles: Vec<Header>,
    ) -> Result<Block, ChainError> {
        let state = self
            .chain
            .state_at(&parent.hash())
            .ok_or_else(|| ChainError::MissingState(parent.hash()))?;
        let (block, _) = self.builder.build_block(
            parent,
            state,
            &key(miner),
            time,
            txs,
            uncles,
            &*self.chain,
        )?;
        Ok(block)
    }

    pub fn build_on(&self, parent: &Block, miner: u8, time: u64) -> Block {
        self.try_build_on(parent, miner, time, &[], Vec::new()).unwrap()
    }

    /// Mine a block with `txs` on the current head and add it.
    pub fn mine(&self, miner: u8, txs: &[Tx]) -> Block {
        let head = self.chain.current_block();
        let block = self
            .try_build_on(&head, miner, head.time() + 10, txs, Vec::new())
            .unwrap();
        self.chain.add_chain(&[block.clone()]).unwrap();
        block
    }

    pub fn balance(&self, who: &Addr) -> Wei {
        use qchain::core::WorldStateR;
        self.chain.current_state().unwrap().get_balance(who)
    }
}

/// Records what the pool asks for.
#[derive(Default)]
pub struct MockPeer {
    pub id: String,
    pub blocks: Mutex<Vec<Hash>>,
    pub states: Mutex<Vec<Hash>>,
}

impl MockPeer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Peer for MockPeer {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn fetch_blocks(&self, hashes: Vec<Hash>) {
        self.blocks.lock().extend(hashes);
    }

    async fn fetch_hashes(&self) {}

    async fn fetch_state(&self, root: Hash) {
        self.states.lock().push(root);
    }
}
