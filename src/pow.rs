//! A plain Keccak proof of work: a nonce is valid when `keccak(hash_no_nonce ++ nonce)`, read as
//! a big-endian integer, does not exceed `2^256 / difficulty`.
use primitive_types::U512;

use crate::common::{Bytes, Hash, U256};

fn target(difficulty: &U256) -> U512 {
    (U512::one() << 256) / U512::from(*difficulty)
}

fn work(hash_no_nonce: &Hash, nonce: &[u8]) -> U512 {
    let h = Hash::hash_concat(&[hash_no_nonce.as_bytes(), nonce]);
    U512::from(U256::from(h))
}

pub fn verify(hash_no_nonce: &Hash, difficulty: &U256, nonce: &[u8]) -> bool {
    if difficulty.is_zero() {
        return true
    }
    work(hash_no_nonce, nonce) <= target(difficulty)
}

/// Try up to `max_tries` nonces (32-byte big-endian counters) and return the first valid one.
/// Counting starts at an offset taken from the header so that sibling blocks end up with
/// different nonces.
pub fn search(hash_no_nonce: &Hash, difficulty: &U256, max_tries: u64) -> Option<Bytes> {
    if difficulty.is_zero() {
        return Some(Bytes::empty())
    }
    let target = target(difficulty);
    let start = U256::from(hash_no_nonce.clone()).low_u64();
    let mut nonce = [0u8; 32];
    for i in 0..max_tries {
        U256::from(start.wrapping_add(i)).to_big_endian(&mut nonce);
        if work(hash_no_nonce, &nonce) <= target {
            return Some(nonce.to_vec().into())
        }
    }
    None
}

#[test]
fn test_search_and_verify() {
    let h = Hash::hash(b"header");
    let d = U256::from(1024u64);
    let nonce = search(&h, &d, 1 << 20).unwrap();
    assert!(verify(&h, &d, &nonce));
    // difficulty one accepts anything
    assert!(verify(&h, &U256::one(), b"x"));
    // a nonce good for a tiny difficulty almost never passes a huge one
    assert!(!verify(&h, &U256::MAX, &nonce) || work(&h, &nonce) <= U512::one());
}
