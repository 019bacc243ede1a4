//! Turning a block and its parent into a new world state.
use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};

use crate::block::{calc_gas_limit, calc_tx_sha, calc_uncle_sha, Block, Header, Receipt};
use crate::chain_manager::ChainReader;
use crate::common::{Addr, Gas, Hash, Wei, U256};
use crate::config::ChainConfig;
use crate::core::{Transferable, TxExecEnv};
use crate::error::{ChainError, ProtocolError, TxError, ValidationError};
use crate::pow;
use crate::protocol::Protocol;
use crate::reactor::{topics, Event, Events};
use crate::state::State;
use crate::state_transition::{apply_transaction, GasPool, Message};
use crate::tx::{secret_to_addr, SecretKey, Tx};

/// Transactions of one block after they went through the state transition.
#[derive(Default, Debug)]
pub struct TxBatch {
    pub receipts: Vec<Receipt>,
    pub handled: Vec<Tx>,
    /// left out because the block ran out of gas; they may go into a later block
    pub unhandled: Vec<Tx>,
    pub erroneous: Vec<(Tx, TxError)>,
    pub gas_used: Gas,
    pub messages: Vec<Message>,
    /// per-transaction outcomes, for the caller to post once it holds no locks
    pub events: Events,
}

/// A block that passed replay and validation.
pub struct Processed {
    pub td: U256,
    pub state: State,
    pub messages: Vec<Message>,
    pub events: Events,
}

/// Sum of the difficulties a block contributes to its chain: its own plus its uncles'.
pub fn block_td(block: &Block) -> U256 {
    block
        .uncles
        .iter()
        .fold(*block.difficulty(), |td, u| td.saturating_add(u.difficulty))
}

fn credit(state: &mut State, addr: &Addr, amount: U256) -> Result<(), ValidationError> {
    state
        .add_balance(addr, &Wei::from(amount))
        .ok_or_else(|| ProtocolError::Rejected(format!("balance overflow for {}", addr)).into())
}

/// Not thread safe: it keeps the state of the last processed block around for the next one, so
/// blocks of a candidate chain must be submitted one after another. The chain manager does that
/// under its mutation lock, which is why nothing here posts events itself.
pub struct BlockManager {
    protocol: Arc<dyn Protocol>,
    block_reward: U256,
    uncle_depth: u64,
    /// state after the last block whose total difficulty did not beat the chain
    transient: Option<(Hash, State)>,
}

impl BlockManager {
    pub fn new(protocol: Arc<dyn Protocol>, config: &ChainConfig) -> Self {
        Self {
            protocol,
            block_reward: config.block_reward.clone().into(),
            uncle_depth: config.uncle_depth,
            transient: None,
        }
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    fn exec_env(&self, block: &Block) -> TxExecEnv {
        TxExecEnv::new(
            block.env(),
            self.protocol.genesis().address.clone(),
            self.protocol.clone(),
        )
    }

    /// Run `txs` in order on `state`. Transient failures skip the transaction, running out of
    /// block gas stops the batch, anything else rejects the block. Receipts already carried by
    /// `block` must match the recomputed ones.
    pub fn process_transactions(
        &self, state: &mut State, block: &Block, txs: &[Tx],
    ) -> Result<TxBatch, ChainError> {
        let env = self.exec_env(block);
        let mut pool = GasPool::new(block.header.gas_limit);
        let mut batch = TxBatch::default();
        for (i, tx) in txs.iter().enumerate() {
            let out = match apply_transaction(state, &env, &mut pool, tx) {
                Ok(out) => out,
                Err(e) if e.is_block_gas_limit() => {
                    debug!("block gas exhausted, {} tx(s) left over", txs.len() - i);
                    for t in &txs[i..] {
                        batch.events.push((
                            topics::NEW_TX_POST_FAIL,
                            Event::TxFailed(Arc::new(t.clone()), e.clone()),
                        ));
                    }
                    batch.unhandled = txs[i..].to_vec();
                    break
                }
                Err(e) if e.is_skippable() => {
                    debug!("skipping tx {}: {}", tx.hash(), e);
                    batch.events.push((
                        topics::NEW_TX_POST_FAIL,
                        Event::TxFailed(Arc::new(tx.clone()), e.clone()),
                    ));
                    batch.erroneous.push((tx.clone(), e));
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            batch.gas_used += out.gas_used;
            let receipt = Receipt {
                tx_hash: tx.hash().clone(),
                post_state: state.root(),
                cumulative_gas: batch.gas_used,
            };
            let index = batch.receipts.len();
            if let Some(original) = block.receipts.get(index) {
                if original != &receipt {
                    return Err(ValidationError::Receipt { index }.into())
                }
            }
            batch
                .events
                .push((topics::NEW_TX_POST, Event::Tx(Arc::new(tx.clone()))));
            batch.messages.extend(out.messages);
            batch.receipts.push(receipt);
            batch.handled.push(tx.clone());
        }
        Ok(batch)
    }

    fn apply_diff(&self, state: &mut State, block: &Block) -> Result<TxBatch, ChainError> {
        self.process_transactions(state, block, &block.txs)
    }

    /// Replay `block` on top of `parent`. Returns the block's total difficulty and the resulting
    /// state.
    pub fn process_with_parent(
        &mut self, block: &Block, parent: &Block, chain: &dyn ChainReader,
    ) -> Result<Processed, ChainError> {
        let parent_hash = parent.hash();
        let mut state = match self.transient.take() {
            Some((hash, state)) if hash == parent_hash => state,
            _ => chain
                .state_at(&parent_hash)
                .ok_or_else(|| ChainError::MissingState(parent_hash.clone()))?,
        };
        let parent_state = state.clone();

        let gas_limit = calc_gas_limit(parent);
        if block.header.gas_limit != gas_limit {
            return Err(ValidationError::GasLimit {
                expected: gas_limit,
                got: block.header.gas_limit,
            }
            .into())
        }

        let batch = self.apply_diff(&mut state, block)?;
        if batch.gas_used != block.header.gas_used {
            return Err(ValidationError::GasUsed {
                expected: batch.gas_used,
                got: block.header.gas_used,
            }
            .into())
        }
        let tx_sha = calc_tx_sha(&batch.receipts);
        if tx_sha != block.header.tx_sha {
            return Err(ValidationError::TxRoot {
                expected: tx_sha,
                got: block.header.tx_sha.clone(),
            }
            .into())
        }

        self.protocol.validate_block(block, parent, &parent_state)?;
        self.accumulate_rewards(&mut state, block, parent, chain)?;

        let root = state.root();
        if root != block.header.state_root {
            return Err(ValidationError::StateRoot {
                expected: root,
                got: block.header.state_root.clone(),
            }
            .into())
        }

        let parent_td = chain
            .block_info(&parent_hash)
            .ok_or(ChainError::BrokenChain(parent_hash))?
            .td;
        let td = parent_td.saturating_add(block_td(block));
        if td > chain.td() {
            info!("processed block #{} ({})", block.number(), block.hash());
        } else {
            self.transient = Some((block.hash(), state.clone()));
        }
        Ok(Processed {
            td,
            state,
            messages: batch.messages,
            events: batch.events,
        })
    }

    /// Pay the block reward and the uncle rewards. Every uncle must be unique in the block, have
    /// a known parent at most `uncle_depth` generations back, and not be an ancestor or an uncle
    /// already included by one.
    pub fn accumulate_rewards(
        &self, state: &mut State, block: &Block, parent: &Block, chain: &dyn ChainReader,
    ) -> Result<(), ValidationError> {
        if calc_uncle_sha(&block.uncles) != block.header.uncle_sha {
            return Err(ValidationError::UncleSha)
        }
        let mut known = HashSet::new();
        if !block.uncles.is_empty() {
            known.insert(parent.hash());
            known.extend(parent.uncles.iter().map(Header::hash));
            let mut prev = parent.prev_hash().clone();
            for _ in 1..self.uncle_depth {
                let b = match chain.get_block(&prev) {
                    Some(b) => b,
                    None => break,
                };
                known.insert(b.hash());
                known.extend(b.uncles.iter().map(Header::hash));
                prev = b.prev_hash().clone();
            }
        }

        let mut reward = self.block_reward;
        let mut nonces = HashSet::new();
        nonces.insert(block.header.nonce.to_vec());
        for uncle in &block.uncles {
            let hash = uncle.hash();
            let bad = |reason| {
                debug!("rejecting uncle {}: {}", hash, reason);
                ValidationError::Uncle {
                    hash: hash.clone(),
                    reason,
                }
            };
            if !nonces.insert(uncle.nonce.to_vec()) {
                return Err(bad("nonce not unique"))
            }
            let uncle_parent = chain
                .get_block(&uncle.prev_hash)
                .ok_or_else(|| bad("unknown parent"))?;
            if uncle_parent.number().saturating_add(self.uncle_depth) < parent.number() {
                return Err(bad("too old"))
            }
            if !known.insert(hash.clone()) {
                return Err(bad("already in the chain"))
            }
            credit(state, &uncle.coinbase, self.block_reward * 15 / 16)?;
            reward = reward.saturating_add(self.block_reward / 32);
        }
        credit(state, block.coinbase(), reward)
    }

    /// Messages the block produces when replayed on its parent's state. Nothing is kept.
    pub fn get_messages(
        &self, block: &Block, chain: &dyn ChainReader,
    ) -> Result<Vec<Message>, ChainError> {
        let parent = chain
            .get_block(block.prev_hash())
            .ok_or_else(|| ChainError::BrokenChain(block.prev_hash().clone()))?;
        let mut state = chain
            .state_at(&parent.hash())
            .ok_or_else(|| ChainError::MissingState(parent.hash()))?;
        let batch = self.apply_diff(&mut state, block)?;
        self.accumulate_rewards(&mut state, block, &parent, chain)?;
        Ok(batch.messages)
    }

    /// Build, sign and seal a child of `parent` mined by the owner of `key`. Transactions that
    /// fail are left out; the ones that did not fit are returned.
    pub fn build_block(
        &self, parent: &Block, mut state: State, key: &SecretKey, time: u64, txs: &[Tx],
        uncles: Vec<Header>, chain: &dyn ChainReader,
    ) -> Result<(Block, Vec<Tx>), ChainError> {
        let mut block = Block::new_child(parent, secret_to_addr(key), time, Default::default());
        block.set_uncles(uncles);
        block.header.difficulty = self.protocol.difficulty(&block, parent, &state);

        let env = self.exec_env(&block);
        let mut pool = GasPool::new(block.header.gas_limit);
        let mut receipts = Vec::new();
        let mut included = Vec::new();
        let mut left = Vec::new();
        let mut gas_used = 0;
        for tx in txs {
            match apply_transaction(&mut state, &env, &mut pool, tx) {
                Ok(out) => {
                    gas_used += out.gas_used;
                    receipts.push(Receipt {
                        tx_hash: tx.hash().clone(),
                        post_state: state.root(),
                        cumulative_gas: gas_used,
                    });
                    included.push(tx.clone());
                }
                Err(e) if e.is_block_gas_limit() => left.push(tx.clone()),
                Err(e) => debug!("dropping tx {} from new block: {}", tx.hash(), e),
            }
        }
        block.txs = included;
        block.set_receipts(receipts);
        block.header.gas_used = gas_used;
        self.accumulate_rewards(&mut state, &block, parent, chain)?;
        block.header.state_root = state.root();
        block.sign(key);
        block.header.nonce = pow::search(&block.hash_no_nonce(), block.difficulty(), u64::MAX)
            .ok_or(ValidationError::ProofOfWork)?;
        Ok((block, left))
    }
}
