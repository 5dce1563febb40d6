//! The closed set of EVM instructions the analyses understand, together with
//! their stack signature.

use core::fmt::Display;
use core::str::FromStr;

use crate::error::CfgError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Opcode {
    Stop,
    Add,
    Mul,
    Sub,
    Div,
    SDiv,
    Mod,
    SMod,
    AddMod,
    MulMod,
    Exp,
    SignExtend,
    Lt,
    Gt,
    SLt,
    SGt,
    Eq,
    IsZero,
    And,
    Or,
    Xor,
    Not,
    Byte,
    Shl,
    Shr,
    Sar,
    Keccak256,
    Address,
    Balance,
    Origin,
    Caller,
    CallValue,
    CallDataLoad,
    CallDataSize,
    CallDataCopy,
    CodeSize,
    CodeCopy,
    GasPrice,
    ExtCodeSize,
    ExtCodeCopy,
    ReturnDataSize,
    ReturnDataCopy,
    ExtCodeHash,
    BlockHash,
    Coinbase,
    Timestamp,
    Number,
    PrevRandao,
    GasLimit,
    ChainId,
    SelfBalance,
    BaseFee,
    BlobHash,
    BlobBaseFee,
    Pop,
    MLoad,
    MStore,
    MStore8,
    SLoad,
    SStore,
    Jump,
    JumpI,
    Pc,
    MSize,
    Gas,
    JumpDest,
    TLoad,
    TStore,
    MCopy,
    /// `PUSH0` to `PUSH32`, the payload is the number of immediate bytes.
    Push(u8),
    /// `DUP1` to `DUP16`.
    Dup(u8),
    /// `SWAP1` to `SWAP16`.
    Swap(u8),
    /// `LOG0` to `LOG4`, the payload is the number of topics.
    Log(u8),
    Create,
    Call,
    CallCode,
    Return,
    DelegateCall,
    Create2,
    StaticCall,
    Revert,
    Invalid,
    SelfDestruct,
}

use Opcode::*;

/// Every opcode without a numeric payload, used for parsing.
const FIXED: &[Opcode] = &[
    Stop, Add, Mul, Sub, Div, SDiv, Mod, SMod, AddMod, MulMod, Exp, SignExtend, Lt, Gt, SLt, SGt,
    Eq, IsZero, And, Or, Xor, Not, Byte, Shl, Shr, Sar, Keccak256, Address, Balance, Origin,
    Caller, CallValue, CallDataLoad, CallDataSize, CallDataCopy, CodeSize, CodeCopy, GasPrice,
    ExtCodeSize, ExtCodeCopy, ReturnDataSize, ReturnDataCopy, ExtCodeHash, BlockHash, Coinbase,
    Timestamp, Number, PrevRandao, GasLimit, ChainId, SelfBalance, BaseFee, BlobHash,
    BlobBaseFee, Pop, MLoad, MStore, MStore8, SLoad, SStore, Jump, JumpI, Pc, MSize, Gas,
    JumpDest, TLoad, TStore, MCopy, Create, Call, CallCode, Return, DelegateCall, Create2,
    StaticCall, Revert, Invalid, SelfDestruct,
];

impl Opcode {
    /// The number of stack items consumed and produced.
    pub fn stack_effect(self) -> (usize, usize) {
        match self {
            Stop | JumpDest | Invalid => (0, 0),
            Add | Mul | Sub | Div | SDiv | Mod | SMod | Exp | SignExtend | Lt | Gt | SLt | SGt
            | Eq | And | Or | Xor | Byte | Shl | Shr | Sar | Keccak256 => (2, 1),
            AddMod | MulMod => (3, 1),
            IsZero | Not | Balance | CallDataLoad | ExtCodeSize | ExtCodeHash | BlockHash
            | BlobHash | MLoad | SLoad | TLoad => (1, 1),
            Address | Origin | Caller | CallValue | CallDataSize | CodeSize | GasPrice
            | ReturnDataSize | Coinbase | Timestamp | Number | PrevRandao | GasLimit | ChainId
            | SelfBalance | BaseFee | BlobBaseFee | Pc | MSize | Gas => (0, 1),
            CallDataCopy | CodeCopy | ReturnDataCopy | MCopy => (3, 0),
            ExtCodeCopy => (4, 0),
            Pop | Jump | SelfDestruct => (1, 0),
            MStore | MStore8 | SStore | TStore | JumpI | Return | Revert => (2, 0),
            Push(_) => (0, 1),
            Dup(n) => (n as usize, n as usize + 1),
            Swap(n) => (n as usize + 1, n as usize + 1),
            Log(n) => (n as usize + 2, 0),
            Create => (3, 1),
            Create2 => (4, 1),
            Call | CallCode => (7, 1),
            DelegateCall | StaticCall => (6, 1),
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Stop => "STOP",
            Add => "ADD",
            Mul => "MUL",
            Sub => "SUB",
            Div => "DIV",
            SDiv => "SDIV",
            Mod => "MOD",
            SMod => "SMOD",
            AddMod => "ADDMOD",
            MulMod => "MULMOD",
            Exp => "EXP",
            SignExtend => "SIGNEXTEND",
            Lt => "LT",
            Gt => "GT",
            SLt => "SLT",
            SGt => "SGT",
            Eq => "EQ",
            IsZero => "ISZERO",
            And => "AND",
            Or => "OR",
            Xor => "XOR",
            Not => "NOT",
            Byte => "BYTE",
            Shl => "SHL",
            Shr => "SHR",
            Sar => "SAR",
            Keccak256 => "KECCAK256",
            Address => "ADDRESS",
            Balance => "BALANCE",
            Origin => "ORIGIN",
            Caller => "CALLER",
            CallValue => "CALLVALUE",
            CallDataLoad => "CALLDATALOAD",
            CallDataSize => "CALLDATASIZE",
            CallDataCopy => "CALLDATACOPY",
            CodeSize => "CODESIZE",
            CodeCopy => "CODECOPY",
            GasPrice => "GASPRICE",
            ExtCodeSize => "EXTCODESIZE",
            ExtCodeCopy => "EXTCODECOPY",
            ReturnDataSize => "RETURNDATASIZE",
            ReturnDataCopy => "RETURNDATACOPY",
            ExtCodeHash => "EXTCODEHASH",
            BlockHash => "BLOCKHASH",
            Coinbase => "COINBASE",
            Timestamp => "TIMESTAMP",
            Number => "NUMBER",
            PrevRandao => "PREVRANDAO",
            GasLimit => "GASLIMIT",
            ChainId => "CHAINID",
            SelfBalance => "SELFBALANCE",
            BaseFee => "BASEFEE",
            BlobHash => "BLOBHASH",
            BlobBaseFee => "BLOBBASEFEE",
            Pop => "POP",
            MLoad => "MLOAD",
            MStore => "MSTORE",
            MStore8 => "MSTORE8",
            SLoad => "SLOAD",
            SStore => "SSTORE",
            Jump => "JUMP",
            JumpI => "JUMPI",
            Pc => "PC",
            MSize => "MSIZE",
            Gas => "GAS",
            JumpDest => "JUMPDEST",
            TLoad => "TLOAD",
            TStore => "TSTORE",
            MCopy => "MCOPY",
            Push(_) => "PUSH",
            Dup(_) => "DUP",
            Swap(_) => "SWAP",
            Log(_) => "LOG",
            Create => "CREATE",
            Call => "CALL",
            CallCode => "CALLCODE",
            Return => "RETURN",
            DelegateCall => "DELEGATECALL",
            Create2 => "CREATE2",
            StaticCall => "STATICCALL",
            Revert => "REVERT",
            Invalid => "INVALID",
            SelfDestruct => "SELFDESTRUCT",
        }
    }

    /// Ends the execution of the current call frame.
    pub fn is_halting(self) -> bool {
        matches!(self, Stop | Return | Revert | SelfDestruct | Invalid)
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Push(n) | Dup(n) | Swap(n) | Log(n) => write!(f, "{}{n}", self.mnemonic()),
            _ => f.write_str(self.mnemonic()),
        }
    }
}

fn parse_numbered(s: &str, prefix: &str, range: core::ops::RangeInclusive<u8>) -> Option<u8> {
    let n: u8 = s.strip_prefix(prefix)?.parse().ok()?;
    range.contains(&n).then_some(n)
}

impl FromStr for Opcode {
    type Err = CfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA3" => return Ok(Keccak256),
            "DIFFICULTY" => return Ok(PrevRandao),
            "ASSERTFAIL" => return Ok(Invalid),
            _ => {}
        }
        if let Some(op) = FIXED.iter().find(|op| op.mnemonic() == s) {
            return Ok(*op);
        }
        parse_numbered(s, "PUSH", 0..=32)
            .map(Push)
            .or_else(|| parse_numbered(s, "DUP", 1..=16).map(Dup))
            .or_else(|| parse_numbered(s, "SWAP", 1..=16).map(Swap))
            .or_else(|| parse_numbered(s, "LOG", 0..=4).map(Log))
            .ok_or_else(|| CfgError::UnknownOpcode(s.to_owned()))
    }
}
