//! The canonical chain, the fork tree next to it, and the fork choice between them.
//!
//! Blocks that do not extend the canonical head are kept in a fork tree together with their total
//! difficulty. Whenever a chain in the tree becomes strictly heavier than the canonical one, the
//! canonical blocks back to the common ancestor are swapped out for the fork. Equal total
//! difficulty never triggers a reorganization, so the first chain seen wins ties.
//!
//! All mutation goes through one mutex. The head (block, hash, total difficulty) sits behind a
//! separate `RwLock` so that readers always see a consistent triple without waiting for block
//! processing.
use std::collections::hash_map::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::block::{Block, BlockInfo, Header};
use crate::block_manager::{block_td, BlockManager};
use crate::common::{Addr, Hash, U256};
use crate::config::ChainConfig;
use crate::error::ChainError;
use crate::genesis::{chain_id_of, genesis_block, Deployer};
use crate::protocol::Protocol;
use crate::reactor::{topics, Event, Events, Reactor};
use crate::state::{State, StateDb};
use crate::state_transition::Message;
use crate::store::{keys, Database};
use crate::tx::{SecretKey, Tx};

/// Read access to blocks and states, as seen by block processing and consensus policies.
pub trait ChainReader {
    fn genesis(&self) -> Arc<Block>;
    fn current_block(&self) -> Arc<Block>;
    /// Total difficulty of the canonical head.
    fn td(&self) -> U256;
    /// A canonical or fork-tree block.
    fn get_block(&self, hash: &Hash) -> Option<Arc<Block>>;
    fn block_info(&self, hash: &Hash) -> Option<BlockInfo>;
    /// World state right after block `hash`.
    fn state_at(&self, hash: &Hash) -> Option<State>;
}

#[derive(Clone)]
struct Head {
    block: Arc<Block>,
    hash: Hash,
    td: U256,
}

impl Head {
    fn new(block: Arc<Block>, td: U256) -> Self {
        Self {
            hash: block.hash(),
            block,
            td,
        }
    }
}

#[derive(Clone)]
struct Link {
    block: Arc<Block>,
    td: U256,
}

impl Link {
    fn info(&self) -> BlockInfo {
        BlockInfo {
            number: self.block.number(),
            hash: self.block.hash(),
            parent: self.block.prev_hash().clone(),
            td: self.td,
        }
    }
}

struct Checkpoint {
    hash: Hash,
    block: Option<Arc<Block>>,
    /// accepted but the block has not arrived yet
    waiting: bool,
}

fn read_block(db: &dyn Database, hash: &Hash) -> Option<Arc<Block>> {
    let raw = db.get(hash.as_bytes())?;
    match Block::decode(&raw) {
        Ok(b) => Some(Arc::new(b)),
        Err(e) => {
            warn!("corrupted block record {}: {}", hash, e);
            None
        }
    }
}

fn read_info(db: &dyn Database, hash: &Hash) -> Option<BlockInfo> {
    let raw = db.get(&keys::block_info(hash))?;
    rlp::decode(&raw).ok()
}

fn td_bytes(td: &U256) -> [u8; 32] {
    let mut buf = [0u8; 32];
    td.to_big_endian(&mut buf);
    buf
}

struct ChainStore {
    db: Arc<dyn Database>,
    states: StateDb,
    fork_tree: HashMap<Hash, Link>,
    /// execution messages of processed blocks, published once they turn canonical
    messages: HashMap<Hash, (u64, Arc<Vec<Message>>)>,
    checkpoint: Checkpoint,
}

impl ChainStore {
    fn get_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        read_block(&*self.db, hash).or_else(|| self.fork_tree.get(hash).map(|l| l.block.clone()))
    }

    fn info(&self, hash: &Hash) -> Option<BlockInfo> {
        read_info(&*self.db, hash).or_else(|| self.fork_tree.get(hash).map(Link::info))
    }

    /// Make `block` the canonical head in the database.
    fn write_block(&self, block: &Block, td: &U256) {
        let hash = block.hash();
        let enc = block.encode();
        let info = BlockInfo {
            number: block.number(),
            hash: hash.clone(),
            parent: block.prev_hash().clone(),
            td: *td,
        };
        self.db.put(hash.as_bytes(), &enc);
        self.db.put(&keys::block_info(&hash), &rlp::encode(&info));
        self.db.put(keys::LAST_BLOCK, &enc);
        self.db.put(keys::LTD, &td_bytes(td));
    }

    fn erase_block(&self, hash: &Hash) {
        self.db.delete(hash.as_bytes());
        self.db.delete(&keys::block_info(hash));
    }
}

/// Chain as seen from inside the mutation lock, including the blocks of the candidate being
/// processed.
struct ChainView<'a> {
    store: &'a ChainStore,
    genesis: &'a Arc<Block>,
    head: &'a Head,
    working: &'a [Link],
}

impl<'a> ChainView<'a> {
    fn working(&self, hash: &Hash) -> Option<&Link> {
        self.working.iter().rev().find(|l| &l.block.hash() == hash)
    }
}

impl<'a> ChainReader for ChainView<'a> {
    fn genesis(&self) -> Arc<Block> {
        self.genesis.clone()
    }

    fn current_block(&self) -> Arc<Block> {
        self.head.block.clone()
    }

    fn td(&self) -> U256 {
        self.head.td
    }

    fn get_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        match self.working(hash) {
            Some(l) => Some(l.block.clone()),
            None => self.store.get_block(hash),
        }
    }

    fn block_info(&self, hash: &Hash) -> Option<BlockInfo> {
        match self.working(hash) {
            Some(l) => Some(l.info()),
            None => self.store.info(hash),
        }
    }

    fn state_at(&self, hash: &Hash) -> Option<State> {
        let block = self.get_block(hash)?;
        self.store.states.get(&block.header.state_root)
    }
}

struct ChainInner {
    store: ChainStore,
    processor: BlockManager,
}

pub struct ChainManager {
    protocol: Arc<dyn Protocol>,
    config: ChainConfig,
    reactor: Arc<Reactor>,
    db: Arc<dyn Database>,
    genesis: Arc<Block>,
    chain_id: Addr,
    inner: Mutex<ChainInner>,
    head: RwLock<Head>,
}

impl ChainManager {
    /// Open the chain stored in `db`, or deploy a new genesis block when there is none. The
    /// genesis block is populated by `deployer` when given, by the policy otherwise.
    pub fn new(
        db: Arc<dyn Database>, protocol: Arc<dyn Protocol>, config: ChainConfig,
        reactor: Arc<Reactor>, deployer: Option<Deployer>,
    ) -> Result<Self, ChainError> {
        let mut states = StateDb::new(db.clone(), config.state_cache);
        let (genesis, chain_id) = match db.get(keys::GENESIS_BLOCK) {
            Some(raw) => {
                info!("found genesis block");
                let genesis = Block::decode(&raw)?;
                let stored = db
                    .get(keys::CHAIN_ID)
                    .filter(|id| id.len() == 20)
                    .ok_or_else(|| ChainError::Store("no chain id for the stored genesis".into()))?;
                let chain_id = Addr::from_slice(&stored);
                check_chain_id(&genesis, &chain_id)?;
                (genesis, chain_id)
            }
            None => {
                info!("genesis block not found, deploying");
                let mut genesis = genesis_block();
                let mut state = State::new();
                let chain_id = match &deployer {
                    Some(deploy) => deploy(&mut genesis, &mut state)?,
                    None => protocol.deploy(&mut genesis, &mut state)?,
                };
                states.commit(state);
                db.put(keys::GENESIS_BLOCK, &genesis.encode());
                db.put(keys::CHAIN_ID, chain_id.as_bytes());
                (genesis, chain_id)
            }
        };
        let genesis = Arc::new(genesis);

        let store = ChainStore {
            db: db.clone(),
            states,
            fork_tree: HashMap::new(),
            messages: HashMap::new(),
            checkpoint: Checkpoint {
                hash: genesis.hash(),
                block: Some(genesis.clone()),
                waiting: false,
            },
        };
        let head = match db.get(keys::LAST_BLOCK) {
            Some(raw) => {
                let block = Arc::new(Block::decode(&raw)?);
                let td = db
                    .get(keys::LTD)
                    .filter(|b| b.len() <= 32)
                    .map(|b| U256::from_big_endian(&b))
                    .unwrap_or_default();
                Head::new(block, td)
            }
            None => {
                let td = block_td(&genesis);
                store.write_block(&genesis, &td);
                Head::new(genesis.clone(), td)
            }
        };
        let root = &head.block.header.state_root;
        if !store.states.contains(root) {
            return Err(ChainError::MissingState(root.clone()))
        }
        info!(
            "last block #{} ({}), chain id {}, genesis {}",
            head.block.number(),
            head.hash,
            chain_id,
            genesis.hash()
        );

        let processor = BlockManager::new(protocol.clone(), &config);
        let cm = Self {
            protocol,
            config,
            reactor,
            db,
            genesis,
            chain_id,
            inner: Mutex::new(ChainInner { store, processor }),
            head: RwLock::new(head),
        };
        let checkpoint = cm
            .db
            .get(keys::LATEST_CHECKPOINT)
            .filter(|raw| raw.len() == 32)
            .map(|raw| Hash::from_slice(&raw));
        if let Some(hash) = checkpoint {
            cm.update_checkpoint(&mut cm.inner.lock().store, hash);
        }
        Ok(cm)
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn chain_id(&self) -> &Addr {
        &self.chain_id
    }

    /// Check a peer's chain id against ours.
    pub fn validate_chain_id(&self, chain_id: &Addr) -> Result<(), ChainError> {
        if chain_id != &self.chain_id {
            return Err(ChainError::ChainId {
                ours: self.chain_id.clone(),
                theirs: chain_id.clone(),
            })
        }
        Ok(())
    }

    pub fn genesis(&self) -> Arc<Block> {
        self.genesis.clone()
    }

    pub fn current_block(&self) -> Arc<Block> {
        self.head.read().block.clone()
    }

    pub fn current_block_hash(&self) -> Hash {
        self.head.read().hash.clone()
    }

    pub fn current_block_number(&self) -> u64 {
        self.head.read().block.number()
    }

    pub fn td(&self) -> U256 {
        self.head.read().td
    }

    /// Whether `hash` is on the canonical chain.
    pub fn has_block(&self, hash: &Hash) -> bool {
        self.db.has(hash.as_bytes())
    }

    /// Canonical block first, then the fork tree.
    pub fn get_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        read_block(&*self.db, hash)
            .or_else(|| self.inner.lock().store.fork_tree.get(hash).map(|l| l.block.clone()))
    }

    pub fn block_info(&self, hash: &Hash) -> Option<BlockInfo> {
        read_info(&*self.db, hash).or_else(|| self.inner.lock().store.info(hash))
    }

    pub fn get_block_by_number(&self, number: u64) -> Option<Arc<Block>> {
        let mut block = self.current_block();
        if number > block.number() {
            return None
        }
        while block.number() > number {
            block = read_block(&*self.db, block.prev_hash())?;
        }
        Some(block)
    }

    /// Up to `max` hashes walking back from `hash` towards genesis.
    pub fn get_chain_hashes_from_hash(&self, hash: &Hash, max: u64) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut block = match self.get_block(hash) {
            Some(b) => b,
            None => return hashes,
        };
        for _ in 0..max {
            hashes.push(block.hash());
            if block.number() == 0 {
                break
            }
            block = match self.get_block(block.prev_hash()) {
                Some(b) => b,
                None => break,
            };
        }
        hashes
    }

    /// Whether `hash` sits in the fork tree.
    pub fn in_fork_tree(&self, hash: &Hash) -> bool {
        self.inner.lock().store.fork_tree.contains_key(hash)
    }

    pub fn fork_tree_len(&self) -> usize {
        self.inner.lock().store.fork_tree.len()
    }

    pub fn state_at(&self, hash: &Hash) -> Option<State> {
        let block = self.get_block(hash)?;
        self.inner.lock().store.states.get(&block.header.state_root)
    }

    pub fn current_state(&self) -> Option<State> {
        let root = self.current_block().header.state_root.clone();
        self.inner.lock().store.states.get(&root)
    }

    /// Make a state available for processing, e.g. one fetched from peers for a checkpoint.
    pub fn add_state(&self, state: State) -> Hash {
        self.inner.lock().store.states.commit(state)
    }

    fn post(&self, events: Events) {
        for (topic, event) in events {
            self.reactor.post(topic, event);
        }
    }

    /// Replay `chain` on top of its parent. On success the candidate's tail total difficulty is
    /// returned; a candidate that is valid but not heavier than the canonical chain gives
    /// [ChainError::Td]. Candidates off the canonical head are remembered in the fork tree either
    /// way.
    pub fn test_chain(&self, chain: &[Block]) -> Result<U256, ChainError> {
        let mut events = Vec::new();
        let tested = {
            let mut inner = self.inner.lock();
            self.test_locked(&mut inner, to_arcs(chain), &mut events)
        };
        self.post(events);
        Ok(tested?.last().map(|l| l.td).unwrap_or_default())
    }

    /// Make an already tested `chain` canonical: appended when it extends the head, swapped in
    /// by a reorganization when it is a heavier fork, kept in the fork tree otherwise.
    pub fn insert_chain(&self, chain: &[Block]) -> Result<(), ChainError> {
        let events = {
            let mut inner = self.inner.lock();
            self.insert_locked(&mut inner, to_arcs(chain))?
        };
        self.post(events);
        Ok(())
    }

    /// [ChainManager::test_chain] followed by [ChainManager::insert_chain], without releasing the
    /// chain in between.
    pub fn add_chain(&self, chain: &[Block]) -> Result<U256, ChainError> {
        let mut events = Vec::new();
        let added = {
            let mut inner = self.inner.lock();
            self.test_locked(&mut inner, to_arcs(chain), &mut events)
                .and_then(|links| {
                    let td = links.last().map(|l| l.td).unwrap_or_default();
                    let blocks = links.into_iter().map(|l| l.block).collect();
                    events.extend(self.insert_locked(&mut inner, blocks)?);
                    Ok(td)
                })
        };
        self.post(events);
        added
    }

    /// Transaction events of every block that passed are appended to `events`, also when a
    /// later block fails.
    fn test_locked(
        &self, inner: &mut ChainInner, chain: Vec<Arc<Block>>, events: &mut Events,
    ) -> Result<Vec<Link>, ChainError> {
        let first = chain.first().ok_or(ChainError::EmptyChain)?;
        let head = self.head.read().clone();
        let fork = first.prev_hash() != &head.hash;
        if fork {
            if inner.store.fork_tree.contains_key(first.prev_hash()) {
                info!("extending a fork at #{}", first.number());
            } else {
                info!(
                    "new fork off {} at #{}, head #{} ({})",
                    first.prev_hash(),
                    first.number(),
                    head.block.number(),
                    head.hash
                );
            }
        }

        let ChainInner { store, processor } = inner;
        let mut working: Vec<Link> = Vec::with_capacity(chain.len());
        for block in chain {
            let processed = {
                let view = ChainView {
                    store: &*store,
                    genesis: &self.genesis,
                    head: &head,
                    working: &working,
                };
                let parent = view
                    .get_block(block.prev_hash())
                    .ok_or_else(|| ChainError::BrokenChain(block.prev_hash().clone()))?;
                processor.process_with_parent(&block, &parent, &view)
            };
            let processed = processed.map_err(|e| {
                debug!("block #{} ({}) failed: {}", block.number(), block.hash(), e);
                e
            })?;
            debug!("block #{} ({}) passed", block.number(), block.hash());
            events.extend(processed.events);
            store.states.cache(processed.state);
            store
                .messages
                .insert(block.hash(), (block.number(), Arc::new(processed.messages)));
            working.push(Link {
                block,
                td: processed.td,
            });
        }

        if fork {
            for l in &working {
                store
                    .fork_tree
                    .entry(l.block.hash())
                    .or_insert_with(|| l.clone());
            }
        }
        let td = working.last().map(|l| l.td).unwrap_or_default();
        if td <= head.td {
            return Err(ChainError::Td { td, current: head.td })
        }
        Ok(working)
    }

    fn insert_locked(
        &self, inner: &mut ChainInner, chain: Vec<Arc<Block>>,
    ) -> Result<Events, ChainError> {
        let parent = chain
            .first()
            .ok_or(ChainError::EmptyChain)?
            .prev_hash()
            .clone();
        let mut td = inner
            .store
            .info(&parent)
            .ok_or_else(|| ChainError::BrokenChain(parent.clone()))?
            .td;
        let links: Vec<Link> = chain
            .into_iter()
            .map(|block| {
                td = td.saturating_add(block_td(&block));
                Link { block, td }
            })
            .collect();

        let head = self.head.read().clone();
        if parent == head.hash {
            return self.extend(inner, links)
        }
        if td > head.td {
            info!("a fork has overtaken the canonical chain ({} > {})", td, head.td);
            self.reorg(inner, &links)
        } else {
            debug!("fork at {} stays in the fork tree", parent);
            Ok(Vec::new())
        }
    }

    /// Append `links` to the canonical chain.
    fn extend(&self, inner: &mut ChainInner, links: Vec<Link>) -> Result<Events, ChainError> {
        let store = &mut inner.store;
        for l in &links {
            let root = &l.block.header.state_root;
            if !store.states.persist(root) {
                return Err(ChainError::MissingState(root.clone()))
            }
        }
        let mut events = Vec::new();
        let n = links.len();
        for l in links {
            let hash = l.block.hash();
            store.write_block(&l.block, &l.td);
            store.fork_tree.remove(&hash);
            *self.head.write() = Head::new(l.block.clone(), l.td);
            events.push((topics::NEW_BLOCK, Event::Block(l.block)));
            if let Some((_, m)) = store.messages.remove(&hash) {
                events.push((topics::MESSAGES, Event::Messages(m)));
            }
        }
        let head = self.head.read().clone();
        info!("imported {} block(s), head #{} ({})", n, head.block.number(), head.hash);
        self.evict(store, head.block.number());
        Ok(events)
    }

    /// Drop fork-tree entries too far behind the head.
    fn evict(&self, store: &mut ChainStore, head_number: u64) {
        let depth = self.config.fork_depth;
        let before = store.fork_tree.len();
        store
            .fork_tree
            .retain(|_, l| l.block.number().saturating_add(depth) >= head_number);
        store
            .messages
            .retain(|_, (n, _)| n.saturating_add(depth) >= head_number);
        if store.fork_tree.len() < before {
            debug!("evicted {} fork link(s)", before - store.fork_tree.len());
        }
    }

    /// Replace the canonical blocks back to the common ancestor with the branch ending in the
    /// last of `links`. The displaced blocks move into the fork tree.
    fn reorg(&self, inner: &mut ChainInner, links: &[Link]) -> Result<Events, ChainError> {
        let mut branch = Vec::new();
        let mut cur = match links.last() {
            Some(l) => l.block.hash(),
            None => return Err(ChainError::EmptyChain),
        };
        loop {
            let block = match links.iter().find(|l| l.block.hash() == cur) {
                Some(l) => l.block.clone(),
                None => match inner.store.fork_tree.get(&cur) {
                    Some(l) => l.block.clone(),
                    None => break,
                },
            };
            cur = block.prev_hash().clone();
            branch.push(block);
        }
        branch.reverse();
        let ancestor =
            read_block(&*self.db, &cur).ok_or_else(|| ChainError::BrokenChain(cur.clone()))?;
        let ancestor_td = read_info(&*self.db, &cur)
            .ok_or_else(|| ChainError::BrokenChain(cur.clone()))?
            .td;

        let old_head = self.head.read().clone();
        let mut displaced = Vec::new();
        let mut b = old_head.block.clone();
        while b.hash() != cur {
            let prev = b.prev_hash().clone();
            displaced.push(b);
            b = read_block(&*self.db, &prev).ok_or(ChainError::BrokenChain(prev))?;
        }
        displaced.reverse();
        info!(
            "reverting to #{} ({}), a reversion of {} block(s)",
            ancestor.number(),
            cur,
            displaced.len()
        );

        *self.head.write() = Head::new(ancestor, ancestor_td);
        // the branch was processed before; run it again before trusting it. Its transactions
        // were reported the first time.
        let events = match self
            .test_locked(inner, branch, &mut Vec::new())
            .and_then(|links| self.extend(inner, links))
        {
            Ok(events) => events,
            Err(e) => {
                error!("reorg failed on a branch that tested fine, keeping the old head: {}", e);
                *self.head.write() = old_head;
                return Err(e)
            }
        };

        for b in &displaced {
            inner.store.erase_block(&b.hash());
        }
        if !displaced.is_empty() {
            match self.test_locked(inner, displaced, &mut Vec::new()) {
                Ok(_) => {}
                Err(e) if e.is_td_error() => {}
                Err(e) => error!("displaced branch failed to re-process: {}", e),
            }
        }
        Ok(events)
    }

    /// Propose a new checkpoint. Accepted without question while the checkpoint is still the
    /// genesis block, by the policy's judgement afterwards.
    pub fn check_point(&self, proposed: &Hash) -> bool {
        let mut inner = self.inner.lock();
        let boot = inner.store.checkpoint.hash == self.genesis.hash();
        let accept = boot || {
            let head = self.head.read().clone();
            let view = ChainView {
                store: &inner.store,
                genesis: &self.genesis,
                head: &head,
                working: &[],
            };
            self.protocol.check_point(proposed, &view)
        };
        if accept {
            self.update_checkpoint(&mut inner.store, proposed.clone());
        } else {
            info!("checkpoint {} rejected by the {} policy", proposed, self.protocol.name());
        }
        accept
    }

    fn update_checkpoint(&self, store: &mut ChainStore, hash: Hash) {
        store.db.put(keys::LATEST_CHECKPOINT, hash.as_bytes());
        store.checkpoint = match store.get_block(&hash) {
            Some(block) => {
                info!("checkpoint set to #{} ({})", block.number(), hash);
                Checkpoint {
                    hash,
                    block: Some(block),
                    waiting: false,
                }
            }
            None => {
                info!("checkpoint {} not known, waiting for peers", hash);
                Checkpoint {
                    hash,
                    block: None,
                    waiting: true,
                }
            }
        };
    }

    pub fn is_checkpoint(&self, hash: &Hash) -> bool {
        &self.inner.lock().store.checkpoint.hash == hash
    }

    pub fn latest_checkpoint_hash(&self) -> Hash {
        self.inner.lock().store.checkpoint.hash.clone()
    }

    pub fn latest_checkpoint_block(&self) -> Option<Arc<Block>> {
        self.inner.lock().store.checkpoint.block.clone()
    }

    pub fn latest_checkpoint_number(&self) -> u64 {
        self.latest_checkpoint_block()
            .map(|b| b.number())
            .unwrap_or(0)
    }

    pub fn waiting_for_checkpoint(&self) -> bool {
        self.inner.lock().store.checkpoint.waiting
    }

    /// Adopt the awaited checkpoint block as the new head. Its state must have been added with
    /// [ChainManager::add_state] before. Returns false for any other block.
    pub fn receive_checkpoint_block(&self, block: Block) -> Result<bool, ChainError> {
        let events = {
            let mut inner = self.inner.lock();
            let store = &mut inner.store;
            let hash = block.hash();
            if !store.checkpoint.waiting || store.checkpoint.hash != hash {
                return Ok(false)
            }
            let root = block.header.state_root.clone();
            if !store.states.persist(&root) {
                return Err(ChainError::MissingState(root))
            }
            let td = self.head.read().td.saturating_add(block_td(&block));
            let block = Arc::new(block);
            store.write_block(&block, &td);
            *self.head.write() = Head::new(block.clone(), td);
            store.checkpoint = Checkpoint {
                hash,
                block: Some(block.clone()),
                waiting: false,
            };
            info!("received checkpoint block #{} ({})", block.number(), block.hash());
            vec![
                (topics::NEW_BLOCK, Event::Block(block)),
                (topics::CHAIN_READY, Event::Ready),
            ]
        };
        self.post(events);
        Ok(true)
    }

    /// Build and seal a block on top of the current head.
    pub fn mine_block(
        &self, key: &SecretKey, time: u64, txs: &[Tx], uncles: Vec<Header>,
    ) -> Result<(Block, Vec<Tx>), ChainError> {
        let inner = self.inner.lock();
        let head = self.head.read().clone();
        let state = inner
            .store
            .states
            .get(&head.block.header.state_root)
            .ok_or_else(|| ChainError::MissingState(head.block.header.state_root.clone()))?;
        let view = ChainView {
            store: &inner.store,
            genesis: &self.genesis,
            head: &head,
            working: &[],
        };
        inner
            .processor
            .build_block(&head.block, state, key, time, txs, uncles, &view)
    }

    /// Execution messages of a known block, recomputed.
    pub fn get_messages(&self, block: &Block) -> Result<Vec<Message>, ChainError> {
        let inner = self.inner.lock();
        let head = self.head.read().clone();
        let view = ChainView {
            store: &inner.store,
            genesis: &self.genesis,
            head: &head,
            working: &[],
        };
        inner.processor.get_messages(block, &view)
    }

    /// Go back to the genesis block and forget every fork.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let td = block_td(&self.genesis);
        inner.store.write_block(&self.genesis, &td);
        inner.store.fork_tree.clear();
        inner.store.messages.clear();
        *self.head.write() = Head::new(self.genesis.clone(), td);
        info!("chain reset to genesis {}", self.genesis.hash());
    }
}

impl ChainReader for ChainManager {
    fn genesis(&self) -> Arc<Block> {
        self.genesis.clone()
    }

    fn current_block(&self) -> Arc<Block> {
        ChainManager::current_block(self)
    }

    fn td(&self) -> U256 {
        ChainManager::td(self)
    }

    fn get_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        ChainManager::get_block(self, hash)
    }

    fn block_info(&self, hash: &Hash) -> Option<BlockInfo> {
        ChainManager::block_info(self, hash)
    }

    fn state_at(&self, hash: &Hash) -> Option<State> {
        ChainManager::state_at(self, hash)
    }
}

fn to_arcs(chain: &[Block]) -> Vec<Arc<Block>> {
    chain.iter().cloned().map(Arc::new).collect()
}

fn check_chain_id(genesis: &Block, chain_id: &Addr) -> Result<(), ChainError> {
    match chain_id_of(genesis) {
        Some(ours) if &ours == chain_id => Ok(()),
        ours => Err(ChainError::ChainId {
            ours: ours.unwrap_or_default(),
            theirs: chain_id.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::GenesisConfig;
    use crate::common::Wei;
    use crate::store::MemDatabase;
    use crate::tx::secret_to_addr;

    fn key() -> SecretKey {
        SecretKey::parse(&[7; 32]).unwrap()
    }

    fn open(db: Arc<dyn Database>) -> ChainManager {
        let g = GenesisConfig {
            model_name: "yes".into(),
            difficulty: 2,
            ..Default::default()
        };
        ChainManager::new(
            db,
            g.into_protocol(),
            ChainConfig::default(),
            Arc::new(Reactor::default()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_restart_resumes_head() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let cm = open(db.clone());
        assert_eq!(cm.current_block_number(), 0);
        assert_eq!(cm.td(), U256::from(4));
        let (b1, _) = cm.mine_block(&key(), 10, &[], Vec::new()).unwrap();
        cm.add_chain(&[b1.clone()]).unwrap();
        let (b2, _) = cm.mine_block(&key(), 20, &[], Vec::new()).unwrap();
        cm.add_chain(&[b2.clone()]).unwrap();
        assert_eq!(cm.current_block_hash(), b2.hash());
        let chain_id = cm.chain_id().clone();
        let td = cm.td();
        drop(cm);

        let cm = open(db);
        assert_eq!(cm.chain_id(), &chain_id);
        assert_eq!(cm.current_block_hash(), b2.hash());
        assert_eq!(cm.td(), td);
        assert_eq!(cm.get_block_by_number(1).unwrap().hash(), b1.hash());
        assert_eq!(
            cm.get_chain_hashes_from_hash(&b2.hash(), 10),
            vec![b2.hash(), b1.hash(), cm.genesis().hash()]
        );
        let state = cm.current_state().unwrap();
        assert_eq!(state.root(), b2.header.state_root);
        use crate::core::WorldStateR;
        let reward: Wei = ChainConfig::default().block_reward;
        assert_eq!(
            state.get_balance(&secret_to_addr(&key())),
            reward.checked_add(&reward).unwrap()
        );
    }

    #[test]
    fn test_chain_id_mismatch() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new());
        drop(open(db.clone()));
        db.put(keys::CHAIN_ID, &[1u8; 20]);
        let g = GenesisConfig::default();
        let res = ChainManager::new(
            db,
            g.into_protocol(),
            ChainConfig::default(),
            Arc::new(Reactor::default()),
            None,
        );
        assert!(matches!(res, Err(ChainError::ChainId { .. })));
    }

    #[test]
    fn test_broken_and_empty_chains() {
        let cm = open(Arc::new(MemDatabase::new()));
        assert_eq!(cm.test_chain(&[]), Err(ChainError::EmptyChain));
        let (mut b1, _) = cm.mine_block(&key(), 10, &[], Vec::new()).unwrap();
        b1.header.prev_hash = Hash::hash(b"nowhere");
        assert_eq!(
            cm.test_chain(&[b1]),
            Err(ChainError::BrokenChain(Hash::hash(b"nowhere")))
        );
        assert_eq!(cm.current_block_number(), 0);
    }

    #[test]
    fn test_custom_deployer() {
        let g = GenesisConfig::default();
        let deployer: Deployer = Box::new(|block: &mut Block, state: &mut State| {
            use crate::core::WorldStateW;
            state.set_balance(&Addr::from(U256::from(0xaa)), &5u64.into());
            let key = SecretKey::parse(&[1; 32]).unwrap();
            Ok(crate::genesis::chain_id_from_block(block, state, &key))
        });
        let cm = ChainManager::new(
            Arc::new(MemDatabase::new()),
            g.into_protocol(),
            ChainConfig::default(),
            Arc::new(Reactor::default()),
            Some(deployer),
        )
        .unwrap();
        use crate::core::WorldStateR;
        let state = cm.current_state().unwrap();
        assert_eq!(state.get_balance(&Addr::from(U256::from(0xaa))), 5u64.into());
        assert_eq!(chain_id_of(&cm.genesis()).as_ref(), Some(cm.chain_id()));
        assert!(cm.validate_chain_id(cm.chain_id()).is_ok());
        assert!(cm.validate_chain_id(Addr::zero()).is_err());
    }
}
