//! Word arithmetic. Every result is taken modulo 2^256 and a result that would be negative is
//! clamped to zero.
use primitive_types::{U256, U512};

#[inline(always)]
pub fn add(a: U256, b: U256) -> U256 {
    a.overflowing_add(b).0
}

#[inline(always)]
pub fn sub(a: U256, b: U256) -> U256 {
    a.saturating_sub(b)
}

#[inline(always)]
pub fn mul(a: U256, b: U256) -> U256 {
    a.overflowing_mul(b).0
}

#[inline(always)]
pub fn div(a: U256, b: U256) -> U256 {
    match a.checked_div(b) {
        Some(r) => r,
        None => U256::zero(),
    }
}

/// Two's complement negation.
#[inline(always)]
pub fn neg(a: U256) -> U256 {
    a.overflowing_sub(U256::one()).0 ^ U256::MAX
}

#[inline(always)]
pub fn get_sign_abs(x: U256) -> (bool, U256) {
    if x.bit(255) {
        (true, neg(x))
    } else {
        (false, x)
    }
}

#[inline(always)]
pub fn sdiv(a: U256, b: U256) -> U256 {
    let (a_sign, a_abs) = get_sign_abs(a);
    let (b_sign, b_abs) = get_sign_abs(b);
    match a_abs.checked_div(b_abs) {
        // negative quotient
        Some(_) if a_sign ^ b_sign => U256::zero(),
        Some(r) => r,
        None => U256::zero(),
    }
}

#[inline(always)]
pub fn rem(a: U256, b: U256) -> U256 {
    match a.checked_rem(b) {
        Some(r) => r,
        None => U256::zero(),
    }
}

#[inline(always)]
pub fn smod(a: U256, b: U256) -> U256 {
    let (a_sign, a_abs) = get_sign_abs(a);
    let (_, b_abs) = get_sign_abs(b);
    match a_abs.checked_rem(b_abs) {
        // the remainder takes the dividend's sign
        Some(r) if a_sign && !r.is_zero() => U256::zero(),
        Some(r) => r,
        None => U256::zero(),
    }
}

#[inline(always)]
pub fn add_mod(a: U256, b: U256, n: U256) -> U256 {
    let a: U512 = a.into();
    let b: U512 = b.into();
    match (a + b).checked_rem(n.into()) {
        Some(r) => U256::try_from(r).unwrap_or_default(),
        None => U256::zero(),
    }
}

#[inline(always)]
pub fn mul_mod(a: U256, b: U256, n: U256) -> U256 {
    let a: U512 = a.into();
    let b: U512 = b.into();
    match (a * b).checked_rem(n.into()) {
        Some(r) => U256::try_from(r).unwrap_or_default(),
        None => U256::zero(),
    }
}

#[inline(always)]
pub fn exp(a: U256, b: U256) -> U256 {
    a.overflowing_pow(b).0
}

#[inline(always)]
fn bool_to_u256(t: bool) -> U256 {
    if t {
        U256::one()
    } else {
        U256::zero()
    }
}

#[inline(always)]
pub fn lt(a: U256, b: U256) -> U256 {
    bool_to_u256(a < b)
}

#[inline(always)]
pub fn gt(a: U256, b: U256) -> U256 {
    bool_to_u256(a > b)
}

#[inline(always)]
pub fn slt(a: U256, b: U256) -> U256 {
    let (a_sign, a_abs) = get_sign_abs(a);
    let (b_sign, b_abs) = get_sign_abs(b);
    if a_sign ^ b_sign {
        // different signs
        bool_to_u256(a_sign)
    } else {
        // same signs
        bool_to_u256(if a_abs == b_abs {
            false
        } else {
            (a_abs < b_abs) ^ a_sign
        })
    }
}

#[inline(always)]
pub fn sgt(a: U256, b: U256) -> U256 {
    let (a_sign, a_abs) = get_sign_abs(a);
    let (b_sign, b_abs) = get_sign_abs(b);
    if a_sign ^ b_sign {
        bool_to_u256(b_sign)
    } else {
        bool_to_u256(if a_abs == b_abs {
            false
        } else {
            (a_abs > b_abs) ^ b_sign
        })
    }
}

#[inline(always)]
pub fn eq(a: U256, b: U256) -> U256 {
    bool_to_u256(a == b)
}

/// Logical negation: 1 for zero, 0 otherwise.
#[inline(always)]
pub fn not(a: U256) -> U256 {
    bool_to_u256(a.is_zero())
}

#[inline(always)]
pub fn and(a: U256, b: U256) -> U256 {
    a & b
}

#[inline(always)]
pub fn or(a: U256, b: U256) -> U256 {
    a | b
}

#[inline(always)]
pub fn xor(a: U256, b: U256) -> U256 {
    a ^ b
}

/// The `i`-th most significant byte of `x`, zero when `i` is out of range.
#[inline(always)]
pub fn byte(i: U256, x: U256) -> U256 {
    if i >= 32.into() {
        return U256::zero()
    }
    let i = i.as_u32();
    (x >> (248 - (i << 3))) & 0xff.into()
}

#[test]
fn test_wraparound() {
    assert_eq!(add(U256::MAX, 2.into()), U256::one());
    assert_eq!(mul(U256::MAX, U256::MAX), U256::one());
    assert_eq!(mul(U256::one() << 255, 2.into()), U256::zero());
    assert_eq!(exp(2.into(), 256.into()), U256::zero());
    assert_eq!(exp(3.into(), 4.into()), 81.into());
}

#[test]
fn test_sub_clamps() {
    assert_eq!(sub(3.into(), 5.into()), U256::zero());
    assert_eq!(sub(5.into(), 3.into()), 2.into());
    assert_eq!(sub(U256::zero(), U256::MAX), U256::zero());
}

#[test]
fn test_signed_division_clamps() {
    let m3 = neg(3.into());
    assert_eq!(sdiv(9.into(), 3.into()), 3.into());
    assert_eq!(sdiv(m3, neg(1.into())), 3.into());
    assert_eq!(sdiv(m3, 1.into()), U256::zero());
    assert_eq!(sdiv(9.into(), U256::zero()), U256::zero());
    assert_eq!(smod(7.into(), neg(3.into())), 1.into());
    assert_eq!(smod(neg(7.into()), 3.into()), U256::zero());
    assert_eq!(smod(neg(6.into()), 3.into()), U256::zero());
}

#[test]
fn test_sign_cmp() {
    for i in -2i64..=2 {
        for j in -2i64..=2 {
            let to_word = |x: i64| {
                if x < 0 {
                    neg((-x as u64).into())
                } else {
                    (x as u64).into()
                }
            };
            assert_eq!(!slt(to_word(i), to_word(j)).is_zero(), i < j);
            assert_eq!(!sgt(to_word(i), to_word(j)).is_zero(), i > j);
        }
    }
}

#[test]
fn test_byte_and_not() {
    let x = U256::from_big_endian(&[0xab; 32]) ^ U256::from(0x11);
    assert_eq!(byte(0.into(), x), 0xab.into());
    assert_eq!(byte(31.into(), x), 0xba.into());
    assert_eq!(byte(32.into(), x), U256::zero());
    assert_eq!(not(U256::zero()), U256::one());
    assert_eq!(not(7.into()), U256::zero());
    assert_eq!(mul_mod(U256::MAX, U256::MAX, 7.into()), (U256::MAX % 7).pow(2.into()) % 7);
}
