use std::time::Duration;

use crate::common::{Gas, Wei, U256};

/// Gas limit of the genesis block.
pub const GENESIS_GAS_LIMIT: Gas = 1_000_000;
/// Lower bound of any block's gas limit.
pub const MIN_GAS_LIMIT: Gas = 125_000;

/// Tunables of the ledger engine. Build one with [ChainConfig::default] and the `with_*`
/// setters.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    /// Base reward paid to a block's coinbase.
    pub block_reward: Wei,
    /// Fork-tree links more than this many blocks behind the canonical head are dropped.
    pub fork_depth: u64,
    /// How many generations back an uncle's parent may be.
    pub uncle_depth: u64,
    /// Number of world states kept in memory.
    pub state_cache: usize,
    pub pool: PoolConfig,
}

/// Timing of the block pool's background cycles.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// A request unanswered for this long is considered failed.
    pub request_timeout: Duration,
    /// Give up on a hash after this many requests.
    pub max_requests: u32,
    /// Upper bound of hashes requested from one peer per round.
    pub hashes_per_peer: usize,
    pub distribute_interval: Duration,
    pub chain_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_requests: 10,
            hashes_per_peer: 200,
            distribute_interval: Duration::from_millis(500),
            chain_interval: Duration::from_millis(500),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            // 1500 * 10^15
            block_reward: (U256::from(1500u64) * U256::exp10(15)).into(),
            fork_depth: 256,
            uncle_depth: 6,
            state_cache: 512,
            pool: PoolConfig::default(),
        }
    }
}

impl ChainConfig {
    pub fn with_block_reward(mut self, reward: Wei) -> Self {
        self.block_reward = reward;
        self
    }

    pub fn with_fork_depth(mut self, depth: u64) -> Self {
        self.fork_depth = depth;
        self
    }

    pub fn with_uncle_depth(mut self, depth: u64) -> Self {
        self.uncle_depth = depth;
        self
    }

    pub fn with_state_cache(mut self, n: usize) -> Self {
        self.state_cache = n;
        self
    }

    pub fn with_pool_timing(
        mut self, request_timeout: Duration, distribute_interval: Duration,
        chain_interval: Duration,
    ) -> Self {
        self.pool.request_timeout = request_timeout;
        self.pool.distribute_interval = distribute_interval;
        self.pool.chain_interval = chain_interval;
        self
    }

    pub fn with_pool_limits(mut self, max_requests: u32, hashes_per_peer: usize) -> Self {
        self.pool.max_requests = max_requests;
        self.pool.hashes_per_peer = hashes_per_peer;
        self
    }
}

#[test]
fn test_builder() {
    let c = ChainConfig::default()
        .with_block_reward(32u64.into())
        .with_fork_depth(4)
        .with_pool_timing(
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        );
    assert_eq!(c.block_reward, 32u64.into());
    assert_eq!(c.fork_depth, 4);
    assert_eq!(c.uncle_depth, 6);
    assert_eq!(c.pool.chain_interval, Duration::from_millis(30));
}
