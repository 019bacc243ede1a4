mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use qchain::block_pool::{BlockPool, Peer};
use qchain::common::{Bytes, Hash, Wei, U256};
use qchain::config::PoolConfig;
use qchain::error::{ChainError, ValidationError};
use qchain::reactor::{topics, Event};
use qchain::store::MemDatabase;
use qchain::tx::UnsignedTx;

fn transfer(nonce: u64, value: u64) -> qchain::tx::Tx {
    UnsignedTx {
        nonce,
        gas_price: 1u64.into(),
        gas: 1000,
        to: Some(addr(BOB)),
        value: value.into(),
        data: Bytes::empty(),
    }
    .sign(&key(ALICE))
}

fn td_of(node: &Node, blocks: usize) -> U256 {
    // genesis and every block carry the same constant difficulty
    *node.chain.genesis().difficulty() * U256::from(blocks + 1)
}

#[test]
fn test_replay_is_deterministic() {
    let a = Node::new();
    let mut blocks = Vec::new();
    for i in 0..3 {
        blocks.push(a.mine(9, &[transfer(i, 100)]));
    }

    let b = Node::new();
    assert_eq!(a.chain.chain_id(), b.chain.chain_id());
    let td = b.chain.test_chain(&blocks).unwrap();
    assert_eq!(td, a.chain.td());
    // tested but not inserted
    assert_eq!(b.chain.current_block_number(), 0);
    b.chain.insert_chain(&blocks).unwrap();
    assert_eq!(b.chain.current_block_hash(), a.chain.current_block_hash());
    assert_eq!(b.chain.td(), td_of(&b, 3));
    assert_eq!(
        b.chain.current_state().unwrap().root(),
        a.chain.current_state().unwrap().root()
    );
    assert_eq!(b.balance(&addr(BOB)), 300u64.into());
}

#[test]
fn test_gas_is_conserved() {
    let n = Node::new();
    n.mine(9, &[transfer(0, 100), transfer(1, 50)]);
    let alice = n.balance(&addr(ALICE));
    let bob = n.balance(&addr(BOB));
    let miner = n.balance(&addr(9));
    let spent = 2 * 500;
    assert_eq!(bob, 150u64.into());
    assert_eq!(
        alice,
        initial_balance()
            .checked_sub(&(150u64 + spent).into())
            .unwrap()
    );
    assert_eq!(miner, (reward() + U256::from(spent)).into());
    let total = U256::from(alice) + U256::from(bob) + U256::from(miner);
    assert_eq!(total, U256::from(initial_balance()) + reward());
}

#[test]
fn test_bad_nonce_tx_is_skipped() {
    let n = Node::new();
    let block = n.mine(9, &[transfer(5, 100), transfer(0, 100)]);
    assert_eq!(block.txs.len(), 1);
    assert_eq!(block.txs[0].nonce(), 0);
    assert_eq!(n.balance(&addr(BOB)), 100u64.into());
}

#[test]
fn test_fork_choice_and_reorgs() {
    let n = Node::new();
    let new_blocks = n.reactor.subscribe(topics::NEW_BLOCK);
    let g = n.chain.genesis();

    let a1 = n.build_on(&g, 6, 10);
    n.chain.add_chain(&[a1.clone()]).unwrap();
    // equal total difficulty: the first chain seen stays
    let b1 = n.build_on(&g, 7, 10);
    assert!(n.chain.add_chain(&[b1.clone()]).unwrap_err().is_td_error());
    assert_eq!(n.chain.current_block_hash(), a1.hash());
    assert!(n.chain.in_fork_tree(&b1.hash()));

    // B overtakes A
    let b2 = n.build_on(&b1, 7, 20);
    n.chain.add_chain(&[b2.clone()]).unwrap();
    assert_eq!(n.chain.current_block_hash(), b2.hash());
    assert_eq!(n.chain.td(), td_of(&n, 2));
    assert!(n.chain.in_fork_tree(&a1.hash()));
    assert!(!n.chain.in_fork_tree(&b1.hash()));
    assert!(!n.chain.has_block(&a1.hash()));
    assert_eq!(n.chain.get_block_by_number(1).unwrap().hash(), b1.hash());

    // C branches off b1 and overtakes B
    let c2 = n.build_on(&b1, 3, 30);
    assert!(n.chain.add_chain(&[c2.clone()]).unwrap_err().is_td_error());
    let c3 = n.build_on(&c2, 3, 40);
    n.chain.add_chain(&[c3.clone()]).unwrap();
    assert_eq!(n.chain.current_block_hash(), c3.hash());
    assert_eq!(n.chain.td(), td_of(&n, 3));
    assert!(n.chain.in_fork_tree(&b2.hash()));
    assert!(n.chain.has_block(&b1.hash()));
    assert_eq!(n.chain.get_block_by_number(2).unwrap().hash(), c2.hash());
    assert_eq!(
        n.chain.get_chain_hashes_from_hash(&c3.hash(), 10),
        vec![c3.hash(), c2.hash(), b1.hash(), g.hash()]
    );
    // the canonical state follows the canonical chain
    assert_eq!(n.balance(&addr(3)), (reward() * 2u64).into());
    assert_eq!(n.balance(&addr(6)), Wei::zero().clone());

    let announced: Vec<_> = new_blocks
        .try_iter()
        .map(|e| match e {
            Event::Block(b) => b.hash(),
            e => panic!("unexpected event {:?}", e),
        })
        .collect();
    assert_eq!(
        announced,
        vec![a1.hash(), b1.hash(), b2.hash(), c2.hash(), c3.hash()]
    );
}

#[test]
fn test_heavier_fork_in_one_batch() {
    let n = Node::new();
    let g = n.chain.genesis();
    let a1 = n.build_on(&g, 6, 10);
    n.chain.add_chain(&[a1.clone()]).unwrap();

    // build the fork on a second node that never saw a1
    let other = Node::new();
    let b1 = other.mine(7, &[]);
    let b2 = other.mine(7, &[]);
    n.chain.add_chain(&[b1.clone(), b2.clone()]).unwrap();
    assert_eq!(n.chain.current_block_hash(), b2.hash());
    assert!(n.chain.in_fork_tree(&a1.hash()));
    assert_eq!(n.chain.fork_tree_len(), 1);
}

#[test]
fn test_uncle_rewards() {
    let n = Node::new();
    let g = n.chain.genesis();
    let a1 = n.build_on(&g, 6, 10);
    n.chain.add_chain(&[a1.clone()]).unwrap();
    let u1 = n.build_on(&g, 5, 11);
    assert!(n.chain.add_chain(&[u1.clone()]).is_err());

    let a2 = n
        .try_build_on(&a1, 6, 20, &[], vec![u1.header.clone()])
        .unwrap();
    n.chain.add_chain(&[a2.clone()]).unwrap();
    let base = reward();
    assert_eq!(n.balance(&addr(5)), (base * 15u64 / 16u64).into());
    assert_eq!(n.balance(&addr(6)), (base * 2u64 + base / 32u64).into());
    // the uncle's difficulty counts towards the total
    assert_eq!(n.chain.td(), td_of(&n, 3));

    // the same uncle cannot be paid twice
    let err = n
        .try_build_on(&a2, 6, 30, &[], vec![u1.header.clone()])
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::Validation(ValidationError::Uncle { .. })
    ));
    // an ancestor is no uncle
    let err = n
        .try_build_on(&a2, 6, 30, &[], vec![a1.header.clone()])
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::Validation(ValidationError::Uncle { .. })
    ));
}

#[test]
fn test_uncle_depth_limit() {
    use qchain::config::ChainConfig;

    let n = Node::new();
    let g = n.chain.genesis();
    let depth = ChainConfig::default().uncle_depth;
    let mut head = g.clone();
    for i in 1..=depth {
        head = Arc::new(n.build_on(&head, 6, i * 10));
        n.chain.add_chain(&[(*head).clone()]).unwrap();
    }
    assert_eq!(head.number(), depth);

    // the uncle's parent is exactly `depth` generations behind the new block's parent
    let u1 = n.build_on(&g, 5, 11);
    let at_limit = n
        .try_build_on(&head, 6, (depth + 1) * 10, &[], vec![u1.header.clone()])
        .unwrap();
    n.chain.add_chain(&[at_limit.clone()]).unwrap();
    let base = reward();
    assert_eq!(n.balance(&addr(5)), (base * 15u64 / 16u64).into());
    assert_eq!(
        n.balance(&addr(6)),
        (base * U256::from(depth + 1) + base / 32).into()
    );

    // one generation later a sibling of the uncle is too old
    let u2 = n.build_on(&g, 4, 12);
    let err = n
        .try_build_on(&at_limit, 6, (depth + 2) * 10, &[], vec![u2.header.clone()])
        .unwrap_err();
    assert_eq!(
        err,
        ChainError::Validation(ValidationError::Uncle {
            hash: u2.header.hash(),
            reason: "too old",
        })
    );
}

#[test]
fn test_tx_subscribers_can_read_the_chain() {
    // every post waits for the subscriber to take the event
    let n = Arc::new(Node::with_capacity(Arc::new(MemDatabase::new()), 0));
    let posted = n.reactor.subscribe(topics::NEW_TX_POST);
    let reader = n.clone();
    let consumer = thread::spawn(move || {
        let mut seen = Vec::new();
        while let Ok(Event::Tx(tx)) = posted.recv_timeout(Duration::from_secs(5)) {
            assert!(reader.chain.current_state().is_some());
            seen.push(tx.hash().clone());
            if seen.len() == 3 {
                break
            }
        }
        seen
    });

    let (done_tx, done) = mpsc::channel();
    let miner = n.clone();
    thread::spawn(move || {
        let block = miner.mine(9, &[transfer(0, 1), transfer(1, 1), transfer(2, 1)]);
        let _ = done_tx.send(block);
    });
    let block = done
        .recv_timeout(Duration::from_secs(5))
        .expect("adding the block stalled on a subscriber");
    let expected: Vec<Hash> = block.txs.iter().map(|t| t.hash().clone()).collect();
    assert_eq!(consumer.join().unwrap(), expected);
}

#[test]
fn test_tampered_blocks_are_rejected() {
    let a = Node::new();
    let block = a.mine(9, &[transfer(0, 100)]);
    let b = Node::new();

    let mut bad = block.clone();
    bad.header.gas_used += 1;
    assert!(matches!(
        b.chain.add_chain(&[bad]),
        Err(ChainError::Validation(ValidationError::GasUsed { .. }))
    ));
    let mut bad = block.clone();
    bad.header.gas_limit += 1;
    assert_eq!(
        b.chain.add_chain(&[bad]),
        Err(ChainError::Validation(ValidationError::GasLimit {
            expected: block.header.gas_limit,
            got: block.header.gas_limit + 1,
        }))
    );
    let mut bad = block.clone();
    bad.header.state_root = Hash::hash(b"bogus");
    assert!(matches!(
        b.chain.add_chain(&[bad]),
        Err(ChainError::Validation(ValidationError::StateRoot { .. }))
    ));
    // receipts are not part of the header, but they must match the replay
    let mut bad = block.clone();
    bad.receipts[0].cumulative_gas += 1;
    assert_eq!(
        b.chain.add_chain(&[bad]),
        Err(ChainError::Validation(ValidationError::Receipt { index: 0 }))
    );
    assert_eq!(b.chain.current_block_number(), 0);

    b.chain.add_chain(&[block.clone()]).unwrap();
    a.mine(9, &[]);
    let orphan = a.mine(9, &[]);
    assert!(matches!(
        b.chain.test_chain(&[orphan]),
        Err(ChainError::BrokenChain(_))
    ));
    assert_eq!(b.chain.current_block_hash(), block.hash());
}

#[tokio::test]
async fn test_checkpoint_bootstrap() {
    let source = Node::new();
    let blocks: Vec<_> = (0..3).map(|_| source.mine(9, &[])).collect();
    let checkpoint = blocks[2].clone();

    let n = Node::new();
    let ready = n.reactor.subscribe(topics::CHAIN_READY);
    assert!(n.chain.check_point(&checkpoint.hash()));
    assert!(n.chain.waiting_for_checkpoint());

    let pool = BlockPool::new(n.chain.clone(), n.reactor.clone(), PoolConfig::default());
    let peer = MockPeer::new("source");
    let dyn_peer: Arc<dyn Peer> = peer.clone();
    pool.add_peer(dyn_peer.clone());
    assert!(pool.has_common_hash(&checkpoint.hash()));

    // other blocks are ignored while waiting
    pool.add(blocks[0].clone(), &dyn_peer).await;
    assert!(pool.is_empty());
    pool.download().await;
    assert_eq!(peer.blocks.lock().clone(), vec![checkpoint.hash()]);

    pool.add(checkpoint.clone(), &dyn_peer).await;
    assert_eq!(
        peer.states.lock().clone(),
        vec![checkpoint.header.state_root.clone()]
    );
    assert!(n.chain.waiting_for_checkpoint());
    let state = source.chain.state_at(&checkpoint.hash()).unwrap();
    assert_eq!(pool.add_state(state), Ok(true));
    assert!(!n.chain.waiting_for_checkpoint());
    assert!(matches!(ready.try_recv(), Ok(Event::Ready)));
    assert_eq!(n.chain.current_block_hash(), checkpoint.hash());
    assert_eq!(n.chain.latest_checkpoint_number(), 3);

    // blocks behind the checkpoint are dropped, later ones are imported
    pool.add(blocks[1].clone(), &dyn_peer).await;
    assert!(pool.is_empty());
    let b4 = source.mine(9, &[]);
    pool.add(b4.clone(), &dyn_peer).await;
    assert_eq!(pool.check_chain(), Ok(1));
    assert_eq!(n.chain.current_block_hash(), b4.hash());

    // a restart resumes after the checkpoint
    let db = n.db.clone();
    drop(pool);
    drop(n);
    let n = Node::open(db);
    assert_eq!(n.chain.current_block_hash(), b4.hash());
    assert!(n.chain.is_checkpoint(&checkpoint.hash()));
    assert!(!n.chain.waiting_for_checkpoint());
    // later checkpoints are up to the policy, which accepts anything here
    assert!(n.chain.check_point(&b4.hash()));
    assert_eq!(n.chain.latest_checkpoint_number(), 4);
}

#[test]
fn test_reset() {
    let n = Node::new();
    n.mine(9, &[]);
    n.mine(9, &[]);
    n.chain.reset();
    assert_eq!(n.chain.current_block_number(), 0);
    assert_eq!(n.chain.td(), td_of(&n, 0));
    let b = n.mine(9, &[]);
    assert_eq!(b.number(), 1);
}
