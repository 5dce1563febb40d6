use crate::error::CfgError;
use crate::opcodes::Opcode;

#[test]
fn parse_mnemonics() {
    assert_eq!("ADD".parse(), Ok(Opcode::Add));
    assert_eq!("MSTORE8".parse(), Ok(Opcode::MStore8));
    assert_eq!("PUSH0".parse(), Ok(Opcode::Push(0)));
    assert_eq!("PUSH32".parse(), Ok(Opcode::Push(32)));
    assert_eq!("DUP16".parse(), Ok(Opcode::Dup(16)));
    assert_eq!("SWAP1".parse(), Ok(Opcode::Swap(1)));
    assert_eq!("LOG4".parse(), Ok(Opcode::Log(4)));
    assert_eq!("CALLCODE".parse(), Ok(Opcode::CallCode));
    assert_eq!("CALLDATACOPY".parse(), Ok(Opcode::CallDataCopy));
}

#[test]
fn parse_aliases() {
    assert_eq!("SHA3".parse(), Ok(Opcode::Keccak256));
    assert_eq!("KECCAK256".parse(), Ok(Opcode::Keccak256));
    assert_eq!("DIFFICULTY".parse(), Ok(Opcode::PrevRandao));
    assert_eq!("ASSERTFAIL".parse(), Ok(Opcode::Invalid));
    assert_eq!("INVALID".parse(), Ok(Opcode::Invalid));
}

#[test]
fn reject_unknown() {
    for bad in ["PUSH33", "DUP0", "DUP17", "SWAP0", "LOG5", "FOO", "", "push1"] {
        assert_eq!(
            bad.parse::<Opcode>(),
            Err(CfgError::UnknownOpcode(bad.to_owned())),
            "{bad}"
        );
    }
}

#[test]
fn print_round_trip() {
    for text in ["STOP", "PUSH0", "PUSH20", "DUP3", "SWAP16", "LOG0", "KECCAK256", "MCOPY"] {
        let op: Opcode = text.parse().unwrap();
        assert_eq!(op.to_string(), text);
    }
    assert_eq!(Opcode::Keccak256.to_string(), "KECCAK256");
}

#[test]
fn stack_effects() {
    assert_eq!(Opcode::Add.stack_effect(), (2, 1));
    assert_eq!(Opcode::MStore.stack_effect(), (2, 0));
    assert_eq!(Opcode::MLoad.stack_effect(), (1, 1));
    assert_eq!(Opcode::Push(1).stack_effect(), (0, 1));
    assert_eq!(Opcode::Dup(3).stack_effect(), (3, 4));
    assert_eq!(Opcode::Swap(2).stack_effect(), (3, 3));
    assert_eq!(Opcode::Log(2).stack_effect(), (4, 0));
    assert_eq!(Opcode::Call.stack_effect(), (7, 1));
    assert_eq!(Opcode::StaticCall.stack_effect(), (6, 1));
    assert_eq!(Opcode::ExtCodeCopy.stack_effect(), (4, 0));
    assert_eq!(Opcode::Create2.stack_effect(), (4, 1));
}

#[test]
fn halting() {
    assert!(Opcode::Return.is_halting());
    assert!(Opcode::Revert.is_halting());
    assert!(!Opcode::Jump.is_halting());
}
