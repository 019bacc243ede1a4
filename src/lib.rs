//! # qchain: the core of a permissioned blockchain node
//!
//! qchain keeps a canonical chain of blocks, replays every incoming block through a metered
//! contract VM, and decides between competing chains by total difficulty. What a node may do
//! (mine, transact, create contracts) and how hard its blocks must be is left to a pluggable
//! consensus policy, which can read its rules from the storage of a system account or delegate
//! every decision to contracts.
//!
//! # Overview
//! The crate is split along the path a block takes:
//!
//! - [block_pool]: collects hashes and blocks announced by peers, requests missing ones, and hands
//!   linked runs of blocks to the chain manager.
//! - [chain_manager]: owns the canonical chain and the fork tree next to it, tests candidate
//!   chains and swaps the canonical chain for a heavier fork.
//! - [block_manager]: replays one block on its parent's state: transactions, consensus checks,
//!   block and uncle rewards, state root.
//! - [state_transition]: applies one transaction (gas purchase, value transfer, contract call or
//!   creation, refund).
//! - [core]: the non-recursive bytecode interpreter with its gas schedule.
//! - [protocol]: the consensus policies, [genesis]: building the genesis block and chain id.
//! - [reactor]: the topic based event bus every other component reports to.
//!
//! A chain is opened with [ChainManager::new](chain_manager/struct.ChainManager.html#method.new)
//! over any [Database](store/trait.Database.html); a second node opened over the same database
//! resumes at the stored head.
//!
//! # State
//! World states are plain copy-on-write maps ([state::State]). Taking a snapshot is a clone, and
//! rolling back means dropping the newer copy, so speculative execution (a trial block, a failed
//! nested call, a policy contract call) never needs an undo journal. States are addressed by
//! their root digest and only reach the database once their block becomes canonical.
//!
//! ```notrust
//!    peers --hashes/blocks--> [ BlockPool ] --linked run--> [ ChainManager ]
//!                                                                |   ^
//!                                                      replay    v   | td, state
//!                                                          [ BlockManager ] --> [ Protocol ]
//!                                                                |
//!                                                    per tx      v
//!                                                        [ state_transition ] --> [ core ]
//! ```

#[macro_use] extern crate num_derive;

#[macro_use]
pub mod common;
pub mod block;
pub mod block_manager;
pub mod block_pool;
pub mod chain_manager;
pub mod config;
pub mod core;
pub mod error;
pub mod genesis;
pub mod pow;
pub mod protocol;
pub mod reactor;
pub mod state;
pub mod state_transition;
pub mod store;
pub mod tx;
