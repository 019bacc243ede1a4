//! Blocks, headers, receipts and the per-block side-table record.
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{Addr, Bytes, Gas, Hash, Wei, U256, U256RLP};
use crate::config::{GENESIS_GAS_LIMIT, MIN_GAS_LIMIT};
use crate::core::BlockEnv;
use crate::tx::{recover_plain, sign_hash, SecretKey, Tx};

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Header {
    pub prev_hash: Hash,
    pub uncle_sha: Hash,
    pub coinbase: Addr,
    pub state_root: Hash,
    pub tx_sha: Hash,
    pub difficulty: U256,
    pub number: u64,
    pub min_gas_price: Wei,
    pub gas_limit: Gas,
    pub gas_used: Gas,
    pub time: u64,
    pub extra: Bytes,
    pub nonce: Bytes,
}

impl Header {
    fn append_fields(&self, s: &mut RlpStream, with_nonce: bool) {
        s.begin_list(if with_nonce { 13 } else { 12 })
            .append(&self.prev_hash)
            .append(&self.uncle_sha)
            .append(&self.coinbase)
            .append(&self.state_root)
            .append(&self.tx_sha)
            .append(&U256RLP(self.difficulty))
            .append(&self.number)
            .append(&self.min_gas_price)
            .append(&self.gas_limit)
            .append(&self.gas_used)
            .append(&self.time)
            .append(&self.extra);
        if with_nonce {
            s.append(&self.nonce);
        }
    }

    pub fn hash(&self) -> Hash {
        Hash::hash(&rlp::encode(self))
    }

    /// Digest of everything but the nonce; this is what proof of work and block signatures
    /// commit to.
    pub fn hash_no_nonce(&self) -> Hash {
        let mut s = RlpStream::new();
        self.append_fields(&mut s, false);
        Hash::hash(&s.out())
    }
}

impl Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        self.append_fields(s, true)
    }
}

impl Decodable for Header {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 13 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        let difficulty: U256RLP = rlp.val_at(5)?;
        Ok(Self {
            prev_hash: rlp.val_at(0)?,
            uncle_sha: rlp.val_at(1)?,
            coinbase: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            tx_sha: rlp.val_at(4)?,
            difficulty: difficulty.0,
            number: rlp.val_at(6)?,
            min_gas_price: rlp.val_at(7)?,
            gas_limit: rlp.val_at(8)?,
            gas_used: rlp.val_at(9)?,
            time: rlp.val_at(10)?,
            extra: rlp.val_at(11)?,
            nonce: rlp.val_at(12)?,
        })
    }
}

#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
pub struct Receipt {
    pub tx_hash: Hash,
    /// state root right after the transaction
    pub post_state: Hash,
    pub cumulative_gas: Gas,
}

/// The miner's signature over [Header::hash_no_nonce].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockSig {
    pub r: U256,
    pub s: U256,
    /// recovery id + 27
    pub v: u8,
}

impl BlockSig {
    /// `r || s || v`
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        self.r.to_big_endian(&mut out[..32]);
        self.s.to_big_endian(&mut out[32..64]);
        out[64] = self.v;
        out
    }
}

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Tx>,
    pub receipts: Vec<Receipt>,
    pub uncles: Vec<Header>,
    pub sig: Option<BlockSig>,
}

impl Block {
    /// An empty child of `parent` with the derived gas limit. Difficulty, roots and nonce are
    /// left for the producer to fill in.
    pub fn new_child(parent: &Block, coinbase: Addr, time: u64, extra: Bytes) -> Self {
        Self {
            header: Header {
                prev_hash: parent.hash(),
                uncle_sha: calc_uncle_sha(&[]),
                coinbase,
                state_root: parent.header.state_root.clone(),
                tx_sha: calc_tx_sha(&[]),
                difficulty: U256::zero(),
                number: parent.header.number + 1,
                min_gas_price: parent.header.min_gas_price.clone(),
                gas_limit: calc_gas_limit(parent),
                gas_used: 0,
                time,
                extra,
                nonce: Bytes::empty(),
            },
            ..Default::default()
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn hash_no_nonce(&self) -> Hash {
        self.header.hash_no_nonce()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn prev_hash(&self) -> &Hash {
        &self.header.prev_hash
    }

    pub fn coinbase(&self) -> &Addr {
        &self.header.coinbase
    }

    pub fn difficulty(&self) -> &U256 {
        &self.header.difficulty
    }

    pub fn time(&self) -> u64 {
        self.header.time
    }

    /// Block constants as seen by contract code.
    pub fn env(&self) -> BlockEnv {
        BlockEnv {
            coinbase: self.header.coinbase.clone(),
            prev_hash: self.header.prev_hash.clone(),
            timestamp: self.header.time,
            number: self.header.number,
            difficulty: self.header.difficulty,
            gas_limit: self.header.gas_limit,
        }
    }

    pub fn set_uncles(&mut self, uncles: Vec<Header>) {
        self.header.uncle_sha = calc_uncle_sha(&uncles);
        self.uncles = uncles;
    }

    pub fn set_receipts(&mut self, receipts: Vec<Receipt>) {
        self.header.tx_sha = calc_tx_sha(&receipts);
        self.receipts = receipts;
    }

    pub fn sign(&mut self, secret: &SecretKey) -> &BlockSig {
        let (r, s, v) = sign_hash(&self.hash_no_nonce(), secret);
        self.sig.insert(BlockSig { r, s, v })
    }

    /// Address that signed this block, if the signature is present and valid.
    pub fn signer(&self) -> Option<Addr> {
        let sig = self.sig.as_ref()?;
        recover_plain(&self.hash_no_nonce(), sig.r, sig.s, sig.v.into(), false)
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        rlp::decode(bytes)
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5)
            .append(&self.header)
            .append_list(&self.txs)
            .append_list(&self.receipts)
            .append_list(&self.uncles);
        match &self.sig {
            Some(sig) => {
                s.begin_list(3)
                    .append(&U256RLP(sig.r))
                    .append(&U256RLP(sig.s))
                    .append(&sig.v);
            }
            None => {
                s.begin_list(0);
            }
        }
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        let sig = rlp.at(4)?;
        let sig = match sig.item_count()? {
            0 => None,
            3 => {
                let r: U256RLP = sig.val_at(0)?;
                let s: U256RLP = sig.val_at(1)?;
                Some(BlockSig {
                    r: r.0,
                    s: s.0,
                    v: sig.val_at(2)?,
                })
            }
            _ => return Err(DecoderError::RlpIncorrectListLen),
        };
        Ok(Self {
            header: rlp.val_at(0)?,
            txs: rlp.list_at(1)?,
            receipts: rlp.list_at(2)?,
            uncles: rlp.list_at(3)?,
            sig,
        })
    }
}

/// Side-table entry written when a block becomes canonical.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: Hash,
    pub parent: Hash,
    /// total difficulty up to and including this block
    pub td: U256,
}

impl Encodable for BlockInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4)
            .append(&self.number)
            .append(&self.hash)
            .append(&self.parent)
            .append(&U256RLP(self.td));
    }
}

impl Decodable for BlockInfo {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let td: U256RLP = rlp.val_at(3)?;
        Ok(Self {
            number: rlp.val_at(0)?,
            hash: rlp.val_at(1)?,
            parent: rlp.val_at(2)?,
            td: td.0,
        })
    }
}

pub fn calc_uncle_sha(uncles: &[Header]) -> Hash {
    let mut s = RlpStream::new();
    s.append_list(uncles);
    Hash::hash(&s.out())
}

pub fn calc_tx_sha(receipts: &[Receipt]) -> Hash {
    let mut s = RlpStream::new();
    s.append_list(receipts);
    Hash::hash(&s.out())
}

/// Gas limit of a child of `parent`: a slow moving average pulled towards 6/5 of the parent's
/// usage, never below [MIN_GAS_LIMIT].
pub fn calc_gas_limit(parent: &Block) -> Gas {
    if parent.header.number == 0 && parent.header.prev_hash == *Hash::zero() {
        // child of genesis
        return GENESIS_GAS_LIMIT
    }
    let prev = parent.header.gas_limit as u128 * 1023;
    let used = parent.header.gas_used as u128 * 6 / 5;
    let limit = ((prev + used) / 1024) as Gas;
    limit.max(MIN_GAS_LIMIT)
}
