/// Instruction set of the interpreter. PUSH1..PUSH32, DUP1..DUP16 and SWAP1..SWAP16 are decoded
/// from their byte ranges (`0x60..=0x7f`, `0x80..=0x8f`, `0x90..=0x9f`) into [Opcode::Push],
/// [Opcode::Dup] and [Opcode::Swap] before dispatch.
#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    Stop = 0x00,
    Add = 0x01,
    Mul = 0x02,
    Sub = 0x03,
    Div = 0x04,
    SDiv = 0x05,
    Mod = 0x06,
    SMod = 0x07,
    Exp = 0x08,
    Neg = 0x09,
    Lt = 0x0a,
    Gt = 0x0b,
    Slt = 0x0c,
    Sgt = 0x0d,
    Eql = 0x0e,
    Not = 0x0f,

    And = 0x10,
    Or = 0x11,
    Xor = 0x12,
    Byte = 0x13,
    AddMod = 0x14,
    MulMod = 0x15,

    Sha3 = 0x20,
    RlpDecode = 0x21,
    RlpEncode = 0x22,

    Addr = 0x30,
    Balance = 0x31,
    Origin = 0x32,
    Caller = 0x33,
    CallValue = 0x34,
    CallDataLoad = 0x35,
    CallDataSize = 0x36,
    CallDataCopy = 0x37,
    CodeSize = 0x38,
    CodeCopy = 0x39,
    GasPrice = 0x3a,
    ExtCodeSize = 0x3b,
    ExtCodeCopy = 0x3c,
    Nonce = 0x3d,
    CallStack = 0x3e,
    CallStackSize = 0x3f,

    PrevHash = 0x40,
    Coinbase = 0x41,
    Timestamp = 0x42,
    Number = 0x43,
    Difficulty = 0x44,
    GasLimit = 0x45,
    GenDoug = 0x46,

    Pop = 0x50,
    MLoad = 0x51,
    MStore = 0x52,
    MStore8 = 0x53,
    SLoad = 0x54,
    SStore = 0x55,
    Jump = 0x56,
    JumpI = 0x57,
    PC = 0x58,
    MSize = 0x59,
    Gas = 0x5a,
    JumpDest = 0x5b,

    Push = 0x60,
    Dup = 0x80,
    Swap = 0x90,

    Create = 0xf0,
    Call = 0xf1,
    Return = 0xf2,
    Post = 0xf3,
    Invalid = 0xfe,
    Suicide = 0xff,
}

impl Opcode {
    /// Byte of PUSHn.
    pub fn push(n: usize) -> u8 {
        0x60 + (n as u8 - 1)
    }

    /// Byte of DUPn.
    pub fn dup(n: usize) -> u8 {
        0x80 + (n as u8 - 1)
    }

    /// Byte of SWAPn.
    pub fn swap(n: usize) -> u8 {
        0x90 + (n as u8 - 1)
    }
}

#[test]
fn test_opcode_decode() {
    use num_traits::FromPrimitive;
    assert_eq!(Opcode::from_u8(0x01), Some(Opcode::Add));
    assert_eq!(Opcode::from_u8(0x3e), Some(Opcode::CallStack));
    assert_eq!(Opcode::from_u8(0xf3), Some(Opcode::Post));
    assert_eq!(Opcode::from_u8(0x16), None);
    assert_eq!(Opcode::from_u8(0xfe), Some(Opcode::Invalid));
    assert_eq!(Opcode::from_u8(0x5c), None);
    assert_eq!(Opcode::push(32), 0x7f);
    assert_eq!(Opcode::swap(16), 0x9f);
}
