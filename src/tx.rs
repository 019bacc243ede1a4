use once_cell::sync::OnceCell;
use rlp_derive::{RlpDecodable, RlpEncodable};
use sha3::Digest;

use crate::common::{
    create_addr, u256_1, Addr, Bytes, Gas, Hash, NullableAddr, Wei, U256, U256RLP,
};

pub use libsecp256k1::SecretKey;

/// The signed part of a transaction, in wire order.
#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
struct TxData {
    nonce: u64,
    gas_price: Wei,
    gas: Gas,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

/// A signed transaction with its sender already recovered. `Tx` is immutable; its hash is the
/// digest of its encoding.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tx {
    inner: TxData,
    tx_hash: Hash,
    from: Addr,
}

/// Transaction fields before signing.
#[derive(Clone, Default, Debug)]
pub struct UnsignedTx {
    pub nonce: u64,
    pub gas_price: Wei,
    pub gas: Gas,
    /// `None` creates a contract from `data`.
    pub to: Option<Addr>,
    pub value: Wei,
    pub data: Bytes,
}

impl UnsignedTx {
    pub fn sig_hash(&self) -> Hash {
        let mut stream = rlp::RlpStream::new_list(6);
        stream
            .append(&self.nonce)
            .append(&self.gas_price)
            .append(&self.gas)
            .append(&NullableAddr(self.to.clone()))
            .append(&self.value)
            .append(&self.data);
        Hash::hash(&stream.out())
    }

    pub fn sign(self, secret: &SecretKey) -> Tx {
        let sig_hash = self.sig_hash();
        let (r, s, v) = sign_hash(&sig_hash, secret);
        let inner = TxData {
            nonce: self.nonce,
            gas_price: self.gas_price,
            gas: self.gas,
            to: NullableAddr(self.to),
            value: self.value,
            data: self.data,
            v: U256RLP(v.into()),
            r: U256RLP(r),
            s: U256RLP(s),
        };
        let tx_hash = Hash::hash(&rlp::encode(&inner));
        Tx {
            inner,
            tx_hash,
            from: secret_to_addr(secret),
        }
    }
}

impl Tx {
    fn from_data(inner: TxData) -> Option<Self> {
        let unsigned = UnsignedTx {
            nonce: inner.nonce,
            gas_price: inner.gas_price.clone(),
            gas: inner.gas,
            to: inner.to.0.clone(),
            value: inner.value.clone(),
            data: inner.data.clone(),
        };
        let from = recover_plain(
            &unsigned.sig_hash(),
            inner.r.0,
            inner.s.0,
            inner.v.0,
            true,
        )?;
        let tx_hash = Hash::hash(&rlp::encode(&inner));
        Some(Self {
            inner,
            tx_hash,
            from,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Tx, rlp::DecoderError> {
        rlp::decode(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(&self.inner).to_vec()
    }

    pub fn from(&self) -> &Addr {
        &self.from
    }

    pub fn hash(&self) -> &Hash {
        &self.tx_hash
    }

    pub fn nonce(&self) -> u64 {
        self.inner.nonce
    }

    pub fn gas_price(&self) -> &Wei {
        &self.inner.gas_price
    }

    pub fn gas(&self) -> Gas {
        self.inner.gas
    }

    pub fn to(&self) -> Option<&Addr> {
        self.inner.to.0.as_ref()
    }

    pub fn value(&self) -> &Wei {
        &self.inner.value
    }

    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }

    pub fn is_contract_creation(&self) -> bool {
        self.inner.to.0.is_none()
    }

    /// Address of the contract this transaction creates.
    pub fn contract_addr(&self) -> Option<Addr> {
        if self.is_contract_creation() {
            Some(create_addr(&self.from, self.inner.nonce))
        } else {
            None
        }
    }
}

impl rlp::Encodable for Tx {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        self.inner.rlp_append(s)
    }
}

impl rlp::Decodable for Tx {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        let inner: TxData = rlp.as_val()?;
        Tx::from_data(inner).ok_or(rlp::DecoderError::Custom("invalid signature"))
    }
}

pub fn public_to_addr(pubkey: &libsecp256k1::PublicKey) -> Addr {
    let pubkey = pubkey.serialize();
    Addr::from_slice(&sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..])
}

pub fn secret_to_addr(secret: &SecretKey) -> Addr {
    public_to_addr(&libsecp256k1::PublicKey::from_secret_key(secret))
}

/// Sign a 32-byte digest, returning `(r, s, v)` with `v` in `{27, 28}`.
pub fn sign_hash(hash: &Hash, secret: &SecretKey) -> (U256, U256, u8) {
    let msg = libsecp256k1::Message::parse(&hash.clone().to_fixed_bytes());
    let (sig, recid) = libsecp256k1::sign(&msg, secret);
    let sig = sig.serialize();
    (
        U256::from_big_endian(&sig[..32]),
        U256::from_big_endian(&sig[32..]),
        recid.serialize() + 27,
    )
}

#[inline]
fn secp256k1_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| {
        U256::from_big_endian(&[
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c,
            0xd0, 0x36, 0x41, 0x41,
        ])
    })
}

#[inline]
fn secp256k1_half_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| secp256k1_n() / 2)
}

pub(crate) fn recover_plain(
    hash: &Hash, r: U256, s: U256, vb: U256, homestead: bool,
) -> Option<Addr> {
    use crate::common::Bytes32;
    if vb.bits() > 8 {
        return None
    }
    let v = vb.low_u64().checked_sub(27)?;
    if &r < u256_1() || &s < u256_1() {
        return None
    }
    if homestead && &s > secp256k1_half_n() {
        return None
    }
    if &r >= secp256k1_n() || &s >= secp256k1_n() || (v != 0 && v != 1) {
        return None
    }
    let r: Bytes32 = (&r).into();
    let s: Bytes32 = (&s).into();
    let mut r1 = libsecp256k1::curve::Scalar([0; 8]);
    let mut s1 = libsecp256k1::curve::Scalar([0; 8]);
    drop(r1.set_b32(&r));
    drop(s1.set_b32(&s));
    let sig = libsecp256k1::Signature { r: r1, s: s1 };
    let msg = libsecp256k1::Message::parse_slice(hash.as_bytes()).ok()?;
    let recover_id = libsecp256k1::RecoveryId::parse(v as u8).ok()?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recover_id).ok()?;
    Some(public_to_addr(&pubkey))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> SecretKey {
        SecretKey::parse(&[b; 32]).unwrap()
    }

    #[test]
    fn test_sign_and_recover() {
        let tx = UnsignedTx {
            nonce: 3,
            gas_price: 10u64.into(),
            gas: 1000,
            to: Some(U256::from(0xbeefu64).into()),
            value: 5u64.into(),
            data: vec![1, 2, 3].into(),
        }
        .sign(&key(0x11));
        assert_eq!(tx.from(), &secret_to_addr(&key(0x11)));
        let decoded = Tx::decode(&tx.encode()).unwrap();
        assert_eq!(decoded.from(), tx.from());
        assert_eq!(decoded.hash(), tx.hash());
        assert_eq!(decoded.nonce(), 3);
        assert!(!decoded.is_contract_creation());
        assert!(decoded.contract_addr().is_none());
    }

    #[test]
    fn test_tampered_tx_recovers_other_sender() {
        let tx = UnsignedTx {
            gas: 500,
            ..Default::default()
        }
        .sign(&key(0x22));
        let mut raw = tx.inner.clone();
        raw.nonce = 1;
        match Tx::from_data(raw) {
            Some(t) => assert_ne!(t.from(), tx.from()),
            None => (),
        }
        let mut raw = tx.inner.clone();
        raw.v = U256RLP(30.into());
        assert!(Tx::from_data(raw).is_none());
    }

    #[test]
    fn test_creation_addr() {
        let tx = UnsignedTx {
            nonce: 1,
            gas: 500,
            ..Default::default()
        }
        .sign(&key(0x33));
        assert!(tx.is_contract_creation());
        assert_eq!(tx.contract_addr(), Some(create_addr(tx.from(), 1)));
    }
}
