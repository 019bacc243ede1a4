use super::{get_data, ExecError, PrecompiledContract};
use crate::common::{Bytes, Gas, Hash, U256};

const GAS_ECRECOVER: Gas = 500;

/// Recovers the signer address of `(hash, v, r, s)`, each a 32-byte word. An invalid signature
/// yields empty output rather than an error.
pub struct Ecrecover;

impl PrecompiledContract for Ecrecover {
    fn required_gas(&self, _input: &[u8]) -> Gas {
        GAS_ECRECOVER
    }

    fn run(&self, input: &[u8]) -> Result<Bytes, ExecError> {
        let input = get_data(input, 0, 128);
        let hash = Hash::from_slice(&input[..32]);
        let v = U256::from_big_endian(&input[32..64]);
        let r = U256::from_big_endian(&input[64..96]);
        let s = U256::from_big_endian(&input[96..128]);
        Ok(match crate::tx::recover_plain(&hash, r, s, v, false) {
            Some(addr) => addr.to_word().as_bytes().into(),
            None => Bytes::empty(),
        })
    }
}
