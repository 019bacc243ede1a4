//! Collects hashes and blocks announced by peers and feeds linked runs of them to the chain.
//!
//! Hashes are fetched from the peers they were announced by, spread over all connected peers
//! and retried on timeout. Two background cycles drive the pool: one requests blocks (or the
//! awaited checkpoint block), the other hands the longest run of held blocks whose parent is
//! known to [ChainManager::add_chain].
use std::collections::hash_map::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};

use crate::block::Block;
use crate::chain_manager::ChainManager;
use crate::common::Hash;
use crate::config::PoolConfig;
use crate::error::ChainError;
use crate::reactor::{topics, Event, Reactor};
use crate::state::State;

/// After this many timed out requests a hash goes back to the peer that announced it.
const RETARGET_AFTER: u32 = 5;

/// Outbound side of a connected peer. Responses come back through [BlockPool::add_hash],
/// [BlockPool::add] and [BlockPool::add_state].
#[async_trait]
pub trait Peer: Send + Sync {
    fn id(&self) -> String;
    async fn fetch_blocks(&self, hashes: Vec<Hash>);
    /// Ask for the hashes of the peer's chain.
    async fn fetch_hashes(&self);
    async fn fetch_state(&self, root: Hash);
}

struct Item {
    /// announced by
    from: Option<Arc<dyn Peer>>,
    /// last requested from
    peer: Option<Arc<dyn Peer>>,
    block: Option<Block>,
    req_at: Instant,
    requested: u32,
}

#[derive(Default)]
struct PoolInner {
    hashes: Vec<Hash>,
    items: HashMap<Hash, Item>,
    /// checkpoint block waiting for its state
    checkpoint: Option<Block>,
    hashes_requested_at: Option<Instant>,
    syncing: bool,
    chain_length: usize,
    blocks_processed: usize,
}

impl PoolInner {
    fn remove(&mut self, hash: &Hash) {
        self.hashes.retain(|h| h != hash);
        self.items.remove(hash);
    }
}

pub struct BlockPool {
    chain: Arc<ChainManager>,
    reactor: Arc<Reactor>,
    config: PoolConfig,
    peers: RwLock<Vec<Arc<dyn Peer>>>,
    inner: Mutex<PoolInner>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockPool {
    pub fn new(chain: Arc<ChainManager>, reactor: Arc<Reactor>, config: PoolConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            chain,
            reactor,
            config,
            peers: RwLock::new(Vec::new()),
            inner: Mutex::new(PoolInner::default()),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_peer(&self, peer: Arc<dyn Peer>) {
        let mut peers = self.peers.write();
        if peers.iter().all(|p| p.id() != peer.id()) {
            debug!("peer {} connected", peer.id());
            peers.push(peer);
        }
    }

    pub fn remove_peer(&self, id: &str) {
        self.peers.write().retain(|p| p.id() != id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.read().clone()
    }

    /// Number of known hashes, fetched or not.
    pub fn len(&self) -> usize {
        self.inner.lock().hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every hash and block.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.hashes.clear();
        inner.items.clear();
    }

    /// Whether the pool tracks the chain's current head.
    pub fn has_latest_hash(&self) -> bool {
        let head = self.chain.current_block_hash();
        self.inner.lock().items.contains_key(&head)
    }

    /// Whether `hash` is a block we share with a peer. The awaited checkpoint counts as known.
    pub fn has_common_hash(&self, hash: &Hash) -> bool {
        if self.chain.waiting_for_checkpoint() && self.chain.is_checkpoint(hash) {
            debug!("still waiting for checkpoint {}", hash);
            return true
        }
        self.chain.get_block(hash).is_some()
    }

    /// Blocks received and not yet handed to the chain.
    pub fn blocks(&self) -> Vec<Block> {
        self.inner
            .lock()
            .items
            .values()
            .filter_map(|i| i.block.clone())
            .collect()
    }

    pub fn remove(&self, hash: &Hash) {
        self.inner.lock().remove(hash);
    }

    /// Largest number of hashes the pool has tracked at once.
    pub fn chain_length(&self) -> usize {
        self.inner.lock().chain_length
    }

    /// Blocks accepted into the pool so far.
    pub fn blocks_processed(&self) -> usize {
        self.inner.lock().blocks_processed
    }

    /// Register a hash announced by `peer`. It is fetched by a later distribution round.
    pub fn add_hash(&self, hash: Hash, peer: &Arc<dyn Peer>) {
        let mut inner = self.inner.lock();
        if inner.items.contains_key(&hash) {
            return
        }
        inner.items.insert(
            hash.clone(),
            Item {
                from: Some(peer.clone()),
                peer: None,
                block: None,
                req_at: Instant::now(),
                requested: 0,
            },
        );
        inner.hashes.insert(0, hash);
    }

    /// Take in a block sent by `peer`, requested or not.
    pub async fn add(&self, block: Block, peer: &Arc<dyn Peer>) {
        let hash = block.hash();
        if self.chain.waiting_for_checkpoint() {
            if !self.chain.is_checkpoint(&hash) {
                return
            }
            info!("received checkpoint block #{} ({}) from {}", block.number(), hash, peer.id());
            let root = block.header.state_root.clone();
            let (chain, received) = (self.chain.clone(), block.clone());
            // may wait on subscribers of chainReady
            let res = match task::spawn_blocking(move || chain.receive_checkpoint_block(received))
                .await
            {
                Ok(res) => res,
                Err(e) => {
                    warn!("checkpoint import did not finish: {}", e);
                    return
                }
            };
            match res {
                Ok(_) => {}
                Err(ChainError::MissingState(_)) => {
                    self.inner.lock().checkpoint = Some(block);
                    let peers = self.peers();
                    join_all(peers.iter().map(|p| p.fetch_state(root.clone()))).await;
                }
                Err(e) => warn!("checkpoint block {} rejected: {}", hash, e),
            }
            return
        }

        if block.number() < self.chain.latest_checkpoint_number() || self.chain.has_block(&hash) {
            return
        }
        let mut inner = self.inner.lock();
        match inner.items.get_mut(&hash) {
            Some(item) => item.block = Some(block),
            None => {
                info!("got unrequested block #{} ({}) from {}", block.number(), hash, peer.id());
                inner.hashes.push(hash.clone());
                inner.items.insert(
                    hash,
                    Item {
                        from: Some(peer.clone()),
                        peer: Some(peer.clone()),
                        block: Some(block),
                        req_at: Instant::now(),
                        requested: 0,
                    },
                );
            }
        }
        inner.blocks_processed += 1;
    }

    /// Take in a world state sent by a peer. Completes the checkpoint bootstrap when it is the
    /// state of the held checkpoint block.
    pub fn add_state(&self, state: State) -> Result<bool, ChainError> {
        let root = self.chain.add_state(state);
        let block = {
            let mut inner = self.inner.lock();
            match &inner.checkpoint {
                Some(b) if b.header.state_root == root => inner.checkpoint.take(),
                _ => None,
            }
        };
        match block {
            Some(b) => self.chain.receive_checkpoint_block(b),
            None => Ok(false),
        }
    }

    /// Assign unfetched hashes to peers, at most `hashes_per_peer` each. Requests that timed out
    /// are retried, with the announcing peer after [RETARGET_AFTER] failures while it is still
    /// connected, and dropped after `max_requests`.
    pub fn distribute_hashes(&self) -> Vec<(Arc<dyn Peer>, Vec<Hash>)> {
        let peers = self.peers();
        if peers.is_empty() {
            return Vec::new()
        }
        let per_peer = self.config.hashes_per_peer;
        let amount = per_peer * peers.len();
        let now = Instant::now();
        let mut dist: Vec<Vec<Hash>> = vec![Vec::new(); peers.len()];
        let mut dropped = Vec::new();
        let mut assigned = 0;

        let mut inner = self.inner.lock();
        let PoolInner { hashes, items, .. } = &mut *inner;
        for hash in hashes.iter() {
            if assigned >= amount {
                break
            }
            let item = match items.get_mut(hash) {
                Some(item) if item.block.is_none() => item,
                _ => continue,
            };
            let failed = now.duration_since(item.req_at) > self.config.request_timeout;
            let target = if failed && item.requested >= self.config.max_requests {
                dropped.push(hash.clone());
                None
            } else if failed && item.requested > RETARGET_AFTER && item.peer.is_some() {
                item.from
                    .as_ref()
                    .and_then(|from| {
                        let id = from.id();
                        (0..peers.len()).find(|&i| peers[i].id() == id && dist[i].len() < per_peer)
                    })
                    .or_else(|| (0..peers.len()).find(|&i| dist[i].len() < per_peer))
            } else if failed || item.peer.is_none() {
                (0..peers.len()).find(|&i| dist[i].len() < per_peer)
            } else {
                None
            };
            if let Some(i) = target {
                item.req_at = now;
                item.peer = Some(peers[i].clone());
                item.requested += 1;
                dist[i].push(hash.clone());
                assigned += 1;
            }
        }
        for hash in &dropped {
            debug!("giving up on {}", hash);
            inner.remove(hash);
        }
        drop(inner);

        peers
            .into_iter()
            .zip(dist)
            .filter(|(_, hashes)| !hashes.is_empty())
            .collect()
    }

    /// One round of the download cycle.
    pub async fn download(&self) {
        let peers = self.peers();
        if self.chain.waiting_for_checkpoint() {
            let checkpoint = self.chain.latest_checkpoint_hash();
            join_all(peers.iter().map(|p| p.fetch_blocks(vec![checkpoint.clone()]))).await;
        } else {
            let requests = self.distribute_hashes();
            join_all(requests.into_iter().map(|(peer, hashes)| async move {
                debug!("requesting {} block(s) from {}", hashes.len(), peer.id());
                peer.fetch_blocks(hashes).await
            }))
            .await;
        }

        let (refetch, sync_changed) = {
            let mut inner = self.inner.lock();
            inner.chain_length = inner.chain_length.max(inner.hashes.len());
            let stale = inner
                .hashes_requested_at
                .map_or(true, |at| at.elapsed() >= self.config.request_timeout);
            let refetch = inner.hashes.is_empty() && stale && !peers.is_empty();
            if refetch {
                inner.hashes_requested_at = Some(Instant::now());
            }
            let syncing = !inner.hashes.is_empty();
            let changed = syncing != inner.syncing;
            inner.syncing = syncing;
            (refetch, changed.then_some(syncing))
        };
        if refetch {
            join_all(peers.iter().map(|p| p.fetch_hashes())).await;
        }
        if let Some(syncing) = sync_changed {
            let reactor = self.reactor.clone();
            let event = Event::Sync(syncing);
            let posted = task::spawn_blocking(move || reactor.post(topics::CHAIN_SYNC, event));
            if let Err(e) = posted.await {
                warn!("sync state change not delivered: {}", e);
            }
        }
    }

    /// Hand the longest linked run of held blocks whose first parent is known to the chain.
    /// A rejected run empties the pool. Returns the number of blocks taken out of the pool.
    pub fn check_chain(&self) -> Result<usize, ChainError> {
        if self.chain.waiting_for_checkpoint() {
            return Ok(0)
        }
        let mut blocks = self.blocks();
        blocks.sort_by_key(Block::number);
        let start = match blocks
            .iter()
            .position(|b| self.chain.get_block(b.prev_hash()).is_some())
        {
            Some(i) => i,
            None => return Ok(0),
        };
        let mut blocks = blocks.split_off(start);
        let end = (1..blocks.len())
            .find(|&i| blocks[i].prev_hash() != &blocks[i - 1].hash())
            .unwrap_or(blocks.len());
        blocks.truncate(end);

        match self.chain.add_chain(&blocks) {
            Ok(td) => debug!("{} block(s) from the pool accepted, td {}", blocks.len(), td),
            Err(e) if e.is_td_error() => debug!("pooled fork kept aside: {}", e),
            Err(e) => {
                warn!("pooled chain rejected, flushing the pool: {}", e);
                self.reset();
                return Err(e)
            }
        }
        let mut inner = self.inner.lock();
        for b in &blocks {
            inner.remove(&b.hash());
        }
        Ok(blocks.len())
    }

    /// Spawn the download and chain cycles on the current tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return
        }
        self.shutdown.send_replace(false);

        let pool = self.clone();
        let mut rx = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            let mut ticker = time::interval(pool.config.distribute_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.download().await,
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break
                        }
                    }
                }
            }
            debug!("download cycle stopped");
        }));

        let pool = self.clone();
        let mut rx = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            let mut ticker = time::interval(pool.config.chain_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // adding blocks takes the chain lock and waits on event subscribers
                        let p = pool.clone();
                        match task::spawn_blocking(move || p.check_chain()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => debug!("chain cycle: {}", e),
                            Err(e) => warn!("chain cycle task failed: {}", e),
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break
                        }
                    }
                }
            }
            debug!("chain cycle stopped");
        }));
        info!("block pool started");
    }

    /// Stop both cycles and wait for them to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let workers = std::mem::take(&mut *self.workers.lock());
        for w in workers {
            if let Err(e) = w.await {
                warn!("block pool worker exited abnormally: {}", e);
            }
        }
        info!("block pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::genesis::GenesisConfig;
    use crate::store::MemDatabase;
    use crate::tx::SecretKey;
    use std::time::Duration;

    #[derive(Default)]
    struct MockPeer {
        id: String,
        fetched: Mutex<Vec<Vec<Hash>>>,
    }

    #[async_trait]
    impl Peer for MockPeer {
        fn id(&self) -> String {
            self.id.clone()
        }

        async fn fetch_blocks(&self, hashes: Vec<Hash>) {
            self.fetched.lock().push(hashes);
        }

        async fn fetch_hashes(&self) {}

        async fn fetch_state(&self, _: Hash) {}
    }

    fn peer(id: &str) -> (Arc<MockPeer>, Arc<dyn Peer>) {
        let p = Arc::new(MockPeer {
            id: id.into(),
            ..Default::default()
        });
        (p.clone(), p)
    }

    fn chain() -> Arc<ChainManager> {
        let g = GenesisConfig {
            difficulty: 1,
            ..Default::default()
        };
        Arc::new(
            ChainManager::new(
                Arc::new(MemDatabase::new()),
                g.into_protocol(),
                ChainConfig::default(),
                Arc::new(Reactor::default()),
                None,
            )
            .unwrap(),
        )
    }

    fn pool(config: PoolConfig) -> BlockPool {
        BlockPool::new(chain(), Arc::new(Reactor::default()), config)
    }

    fn wait_out(p: &BlockPool) -> Vec<(Arc<dyn Peer>, Vec<Hash>)> {
        std::thread::sleep(Duration::from_millis(1));
        p.distribute_hashes()
    }

    #[test]
    fn test_distribution_bounds() {
        let p = pool(PoolConfig {
            hashes_per_peer: 2,
            ..Default::default()
        });
        let (a, pa) = peer("a");
        let (b, pb) = peer("b");
        p.add_peer(pa.clone());
        p.add_peer(pb);
        p.add_peer(pa.clone());
        assert_eq!(p.peer_count(), 2);
        for i in 0..5u8 {
            p.add_hash(Hash::hash(&[i]), &pa);
        }
        p.add_hash(Hash::hash(&[0]), &pa);
        assert_eq!(p.len(), 5);

        let dist = p.distribute_hashes();
        assert_eq!(dist.len(), 2);
        assert!(dist.iter().all(|(_, h)| h.len() == 2));
        // the newest hash comes first
        assert_eq!(dist[0].1[0], Hash::hash(&[4]));
        // requested ones are left alone until they time out
        let dist = p.distribute_hashes();
        assert_eq!(dist.len(), 1);
        assert_eq!(dist[0].1, vec![Hash::hash(&[0])]);
        assert!(p.distribute_hashes().is_empty());
        assert!(a.fetched.lock().is_empty() && b.fetched.lock().is_empty());
    }

    #[test]
    fn test_retry_ceiling() {
        let p = pool(PoolConfig {
            request_timeout: Duration::ZERO,
            max_requests: 3,
            ..Default::default()
        });
        let (_, pa) = peer("a");
        p.add_peer(pa.clone());
        p.add_hash(Hash::hash(b"x"), &pa);
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(1));
            assert_eq!(p.distribute_hashes().len(), 1);
        }
        std::thread::sleep(Duration::from_millis(1));
        assert!(p.distribute_hashes().is_empty());
        assert!(p.is_empty());
    }

    #[test]
    fn test_retarget_without_announcer() {
        let p = pool(PoolConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        });
        let (_, pa) = peer("a");
        let (_, pb) = peer("b");
        p.add_peer(pa.clone());
        p.add_peer(pb);
        p.add_hash(Hash::hash(b"x"), &pa);
        p.remove_peer("a");
        for _ in 0..p.config.max_requests {
            let dist = wait_out(&p);
            assert_eq!(dist.len(), 1);
            assert_eq!(dist[0].0.id(), "b");
        }
        assert!(wait_out(&p).is_empty());
        assert!(p.is_empty());
    }

    #[test]
    fn test_retarget_to_announcer() {
        let p = pool(PoolConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        });
        let (_, pa) = peer("a");
        let (_, pb) = peer("b");
        p.add_peer(pb.clone());
        p.add_peer(pa.clone());
        p.add_hash(Hash::hash(b"x"), &pa);
        let targets: Vec<String> = (0..p.config.max_requests)
            .map(|_| wait_out(&p)[0].0.id())
            .collect();
        let retargeted = RETARGET_AFTER as usize + 1;
        assert!(targets[..retargeted].iter().all(|id| id == "b"));
        assert!(targets[retargeted..].iter().all(|id| id == "a"));
    }

    #[tokio::test]
    async fn test_sync_post_leaves_runtime_free() {
        let reactor = Arc::new(Reactor::new(0));
        let sync = reactor.subscribe(topics::CHAIN_SYNC);
        let p = Arc::new(BlockPool::new(chain(), reactor, PoolConfig::default()));
        let (_, pa) = peer("a");
        p.add_peer(pa.clone());
        p.add_hash(Hash::hash(b"z"), &pa);

        let downloader = p.clone();
        let round = tokio::spawn(async move { downloader.download().await });
        // only completes while the single runtime thread is not stuck in the post
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            sync.recv_timeout(Duration::from_secs(5)),
            Ok(Event::Sync(true))
        ));
        round.await.unwrap();
    }

    #[tokio::test]
    async fn test_download_requests_hashes_when_empty() {
        let p = pool(PoolConfig::default());
        let (a, pa) = peer("a");
        p.add_peer(pa.clone());
        p.add_hash(Hash::hash(b"y"), &pa);
        p.download().await;
        assert_eq!(a.fetched.lock().clone(), vec![vec![Hash::hash(b"y")]]);
        assert_eq!(p.chain_length(), 1);
        p.remove(&Hash::hash(b"y"));
        p.download().await;
        assert_eq!(a.fetched.lock().len(), 1);
        assert!(!p.has_latest_hash());
        assert!(p.has_common_hash(&p.chain.genesis().hash()));
    }

    #[tokio::test]
    async fn test_add_and_check_chain() {
        let source = chain();
        let key = SecretKey::parse(&[3; 32]).unwrap();
        let mut blocks = Vec::new();
        for t in 1..=3 {
            let (b, _) = source.mine_block(&key, t * 10, &[], Vec::new()).unwrap();
            source.add_chain(&[b.clone()]).unwrap();
            blocks.push(b);
        }

        let p = pool(PoolConfig::default());
        let (_, pa) = peer("a");
        // out of order and with a gap at first
        p.add(blocks[2].clone(), &pa).await;
        p.add(blocks[1].clone(), &pa).await;
        assert_eq!(p.check_chain(), Ok(0));
        p.add(blocks[0].clone(), &pa).await;
        assert_eq!(p.blocks_processed(), 3);
        assert_eq!(p.check_chain(), Ok(3));
        assert!(p.is_empty());
        assert_eq!(p.chain.current_block_hash(), blocks[2].hash());
        // canonical blocks are ignored
        p.add(blocks[1].clone(), &pa).await;
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn test_bad_chain_flushes_pool() {
        let source = chain();
        let key = SecretKey::parse(&[3; 32]).unwrap();
        let (mut b, _) = source.mine_block(&key, 10, &[], Vec::new()).unwrap();
        b.header.state_root = Hash::hash(b"bogus");
        let p = pool(PoolConfig::default());
        let (_, pa) = peer("a");
        p.add(b, &pa).await;
        p.add_hash(Hash::hash(b"other"), &pa);
        assert!(p.check_chain().is_err());
        assert!(p.is_empty());
        assert_eq!(p.chain.current_block_number(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_cycles() {
        let source = chain();
        let key = SecretKey::parse(&[3; 32]).unwrap();
        let (b, _) = source.mine_block(&key, 10, &[], Vec::new()).unwrap();

        let p = Arc::new(pool(PoolConfig {
            distribute_interval: Duration::from_millis(10),
            chain_interval: Duration::from_millis(10),
            ..Default::default()
        }));
        let (a, pa) = peer("a");
        p.add_peer(pa.clone());
        p.add_hash(b.hash(), &pa);
        p.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.fetched.lock().first(), Some(&vec![b.hash()]));
        p.add(b.clone(), &pa).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        p.stop().await;
        assert_eq!(p.chain.current_block_hash(), b.hash());
    }
}
