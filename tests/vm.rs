use std::sync::Arc;

use qchain::common::{Addr, Hash, Wei, U256};
use qchain::core::{
    BlockEnv, Code, ExecError, PlainCode, PostMessage, TxExecContext, TxExecEnv, TxExecResult,
    WorldStateR, WorldStateW,
};
use qchain::genesis::GenesisConfig;
use qchain::state::State;

fn env() -> TxExecEnv {
    TxExecEnv::new(
        BlockEnv::default(),
        Addr::zero().clone(),
        GenesisConfig::default().into_protocol(),
    )
}

fn origin() -> Addr {
    U256::from(0xaa).into()
}

fn contract() -> Addr {
    U256::from(0xcc).into()
}

fn code(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str.replace(' ', "")).unwrap()
}

fn run_with(state: &mut State, code_hex: &str, input: &[u8], gas: u64) -> TxExecResult {
    let env = env();
    let code = Arc::new(PlainCode::new(code(code_hex).into_boxed_slice()));
    let ctx = TxExecContext::new(state, &env, origin(), Wei::from(1u64));
    ctx.run(
        origin(),
        contract(),
        code,
        input.to_vec().into_boxed_slice(),
        Wei::zero().clone(),
        gas,
    )
}

fn run(code_hex: &str, gas: u64) -> TxExecResult {
    run_with(&mut State::new(), code_hex, &[], gas)
}

fn slot0() -> Hash {
    U256::zero().into()
}

fn word(v: U256) -> [u8; 32] {
    let mut w = [0u8; 32];
    v.to_big_endian(&mut w);
    w
}

#[test]
fn test_sstore_pricing() {
    // PUSH1 v, PUSH1 0, SSTORE, STOP
    let store = |v: &str| format!("60{}60005500", v);
    let mut state = State::new();
    let ret = run_with(&mut state, &store("01"), &[], 1000);
    assert!(matches!(ret, TxExecResult::Succeeded(_, 798, _)));
    assert_eq!(state.get_state(&contract(), &slot0()), U256::one());

    let ret = run_with(&mut state, &store("02"), &[], 1000);
    assert!(matches!(ret, TxExecResult::Succeeded(_, 898, _)));
    assert_eq!(state.get_state(&contract(), &slot0()), U256::from(2));

    let ret = run_with(&mut state, &store("00"), &[], 1000);
    assert!(matches!(ret, TxExecResult::Succeeded(_, 998, _)));
    assert_eq!(state.get_state(&contract(), &slot0()), U256::zero());
}

#[test]
fn test_out_of_gas_before_write() {
    let mut state = State::new();
    let ret = run_with(&mut state, "600160005500", &[], 201);
    assert!(matches!(ret, TxExecResult::Failed(ExecError::OutOfGas)));
    assert_eq!(ret.unused_gas(), 0);
    assert_eq!(state.get_state(&contract(), &slot0()), U256::zero());
}

#[test]
fn test_word_arithmetic() {
    let max = format!("7f{}", "ff".repeat(32));
    let prog = [
        // ADD(2^256 - 1, 2)
        format!("{} 6002 01 600052", max),
        // SUB(1, 2) clamps at zero
        "6002 6001 03 602052".to_string(),
        // MUL(2^256 - 1, 2^256 - 1)
        format!("{} {} 02 604052", max, max),
        "6060 6000 f2".to_string(),
    ]
    .concat();
    match run(&prog, 1000) {
        TxExecResult::Succeeded(out, _, _) => {
            assert_eq!(&out[..32], &word(U256::one())[..]);
            assert_eq!(&out[32..64], &word(U256::zero())[..]);
            assert_eq!(&out[64..], &word(U256::one())[..]);
        }
        r => panic!("unexpected result {:?}", r),
    }
}

#[test]
fn test_jump_destinations() {
    // offset 4 is the operand of PUSH1 0xff
    assert!(matches!(
        run("600456 60ff 00", 100),
        TxExecResult::Failed(ExecError::InvalidJump)
    ));
    assert!(matches!(
        run("600556 60ff 00", 100),
        TxExecResult::Succeeded(..)
    ));
    // conditional jump with a zero condition falls through
    assert!(matches!(
        run("6000 6004 57 00", 100),
        TxExecResult::Succeeded(..)
    ));
}

#[test]
fn test_undefined_opcode() {
    assert!(matches!(run("ef", 100), TxExecResult::Failed(ExecError::InvalidOpcode)));
    assert!(matches!(run("6001 fe", 100), TxExecResult::Failed(ExecError::InvalidOpcode)));
    assert!(matches!(run("01", 100), TxExecResult::Failed(ExecError::StackUnderflow)));
}

#[test]
fn test_call_stack() {
    let prog = "3f 600052 6000 3e 602052 6001 3e 604052 6060 6000 f2";
    match run(prog, 1000) {
        TxExecResult::Succeeded(out, _, _) => {
            assert_eq!(&out[..32], &word(U256::one())[..]);
            assert_eq!(&out[32..64], &word(origin().into())[..]);
            assert_eq!(&out[64..], &word(contract().into())[..]);
        }
        r => panic!("unexpected result {:?}", r),
    }
}

#[test]
fn test_rlp_round_trip() {
    let input = hex::decode("c581ab82cdef").unwrap();
    let prog = concat!(
        // copy the call data to memory 0
        "6006 6000 6000 37",
        // decode it into a table at 0x200
        "610200 6006 6000 21",
        // encode the N entries starting at 0x220 into 0x300
        "610300 90 610220 22",
        "610300 f2",
    );
    match run_with(&mut State::new(), prog, &input, 10_000) {
        TxExecResult::Succeeded(out, _, _) => assert_eq!(&out[..], &input[..]),
        r => panic!("unexpected result {:?}", r),
    }
}

#[test]
fn test_rlp_nested_list() {
    let input = hex::decode("c3c20102").unwrap();
    let prog = "6004 6000 6000 37 610200 6004 6000 21 00";
    assert!(matches!(
        run_with(&mut State::new(), prog, &input, 10_000),
        TxExecResult::Failed(ExecError::NestedList)
    ));
    // a plain string is no list at all
    assert!(matches!(
        run_with(&mut State::new(), prog, &hex::decode("8201ff00").unwrap(), 10_000),
        TxExecResult::Failed(ExecError::InvalidRlp)
    ));
}

#[test]
fn test_post_is_collected() {
    // in_len, in_off, value, to, gas
    let prog = "6000 6000 6000 60a2 6005 f3 00";
    match run(prog, 100) {
        TxExecResult::Succeeded(_, unused, posts) => {
            // five pushes plus the base cost plus the reserved gas
            assert_eq!(unused, 70);
            assert_eq!(
                posts,
                vec![PostMessage {
                    to: U256::from(0xa2).into(),
                    value: Wei::zero().clone(),
                    input: Vec::new().into(),
                    gas: 5,
                }]
            );
        }
        r => panic!("unexpected result {:?}", r),
    }
    // posts of a failed run are dropped with it
    assert!(matches!(
        run("6000 6000 6000 60a2 6005 f3 fe", 100),
        TxExecResult::Failed(ExecError::InvalidOpcode)
    ));
}

#[test]
fn test_failed_call_rolls_back() {
    let callee: Addr = U256::from(0xbbbb).into();
    // ret_len, ret_off, in_len, in_off, value, addr, gas; then return the status word
    let caller = "6000 6000 6000 6000 6000 61bbbb 6103e8 f1 600052 6020 6000 f2";

    for (callee_code, status, slot) in [
        ("6001600055fe", U256::zero(), U256::zero()),
        ("60016000 5500", U256::one(), U256::one()),
    ] {
        let mut state = State::new();
        state.set_code(&callee, &code(callee_code));
        match run_with(&mut state, caller, &[], 10_000) {
            TxExecResult::Succeeded(out, _, _) => assert_eq!(&out[..], &word(status)[..]),
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(state.get_state(&callee, &slot0()), slot);
        // the callee keeps existing either way
        assert_eq!(state.get_code(&callee).as_bytes(), &code(callee_code)[..]);
    }
}

#[test]
fn test_caller_resumes_after_starved_callee() {
    let callee: Addr = U256::from(0xbbbb).into();
    let mut state = State::new();
    // runs out of gas on its third push
    state.set_code(&callee, &code("6001 6001 6001 00"));
    // CALL with two units of gas, then store 7 at slot 0
    let caller = "6000 6000 6000 6000 6000 61bbbb 6002 f1 6007 6000 55 00";
    let ret = run_with(&mut state, caller, &[], 10_000);
    assert!(matches!(ret, TxExecResult::Succeeded(..)), "unexpected result {:?}", ret);
    assert_eq!(state.get_state(&contract(), &slot0()), U256::from(7));
    assert_eq!(state.get_state(&callee, &slot0()), U256::zero());
}
