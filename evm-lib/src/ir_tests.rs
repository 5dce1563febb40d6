use analysis::cfg::{CfgBlock, ControlFlowGraph, OpPos};

use crate::error::CfgError;
use crate::ir::*;
use crate::opcodes::Opcode;

fn block(address: u64) -> BlockId {
    BlockId::new(address)
}

#[test]
fn block_id_round_trip() {
    for id in [block(0), block(1234), BlockId::cloned(55, 0), BlockId::cloned(55, 12)] {
        assert_eq!(id.to_string().parse(), Ok(id));
    }
    assert_eq!(BlockId::cloned(55, 2).to_string(), "55_2");
    assert_eq!(
        "55_x".parse::<BlockId>(),
        Err(CfgError::MalformedBlockId("55_x".to_owned()))
    );
    assert!("".parse::<BlockId>().is_err());
    assert!("-3".parse::<BlockId>().is_err());
}

#[test]
fn block_id_order() {
    assert!(block(3) < BlockId::cloned(3, 0));
    assert!(BlockId::cloned(3, 0) < BlockId::cloned(3, 1));
    assert!(BlockId::cloned(3, 7) < block(4));
}

#[test]
fn program_point_round_trip() {
    let points = [
        OpPos::new(block(0), 0),
        OpPos::new(block(17), 4),
        OpPos::new(BlockId::cloned(17, 3), 12),
    ];
    for pos in points {
        assert_eq!(parse_program_point(&pos.to_string()), Ok(pos));
    }
    assert_eq!(
        OpPos::new(BlockId::cloned(17, 3), 12).to_string(),
        "17_3:12"
    );
    assert_eq!(
        parse_program_point("17_3"),
        Err(CfgError::MalformedProgramPoint("17_3".to_owned()))
    );
    assert_eq!(
        parse_program_point("17:3:1"),
        Err(CfgError::MalformedProgramPoint("17:3:1".to_owned()))
    );
}

#[test]
fn instruction_parsing() {
    let push: Instruction = "PUSH1 0x40".parse().unwrap();
    assert_eq!(push.opcode(), Opcode::Push(1));
    assert_eq!(push.push_value(), Some(64));
    assert_eq!(push.to_string(), "PUSH1 0x40");

    let push: Instruction = "PUSH2 ff".parse().unwrap();
    assert_eq!(push.push_value(), Some(255));

    let zero: Instruction = "PUSH0".parse().unwrap();
    assert_eq!(zero.push_value(), Some(0));

    let huge: Instruction = "PUSH32 0xffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
        .parse()
        .unwrap();
    assert_eq!(huge.push_value(), None);

    let store: Instruction = "MSTORE 64".parse().unwrap();
    assert_eq!(store.annotated_address(), Some(64));
    assert_eq!(store.push_value(), None);

    let load: Instruction = "MLOAD".parse().unwrap();
    assert_eq!(load.annotated_address(), None);
    assert_eq!(format!("{load:?}"), "MLOAD");

    assert_eq!(
        "FROB 1".parse::<Instruction>(),
        Err(CfgError::UnknownOpcode("FROB".to_owned()))
    );
    assert_eq!(
        "".parse::<Instruction>(),
        Err(CfgError::UnknownOpcode(String::new()))
    );
}

#[test]
fn cfg_successors() {
    let cfg = Cfg::new(vec![
        BasicBlock::conditional(
            block(0),
            parse_instructions(["PUSH1 0x10", "JUMPI"]).unwrap(),
            JumpTarget::Block(block(16)),
            block(5),
        ),
        BasicBlock::unconditional(
            block(5),
            parse_instructions(["JUMP"]).unwrap(),
            JumpTarget::Unresolved,
        )
        .with_jump_destinations([block(16), block(20)]),
        BasicBlock::falls_to(block(16), vec![], block(20)),
        BasicBlock::terminal(block(20), parse_instructions(["STOP"]).unwrap()),
    ])
    .unwrap();

    assert_eq!(cfg.blocks().len(), 4);
    assert_eq!(
        cfg.get(block(0)).unwrap().successors(),
        &[block(16), block(5)]
    );
    // Unresolved jumps are not followed.
    assert!(cfg.get(block(5)).unwrap().successors().is_empty());
    assert_eq!(cfg.get(block(5)).unwrap().jump_destinations().len(), 2);
    assert_eq!(cfg.get(block(20)).unwrap().last_opcode(), Some(Opcode::Stop));
    assert_eq!(
        cfg.instruction(OpPos::new(block(0), 1)).map(Instruction::opcode),
        Some(Opcode::JumpI)
    );
    assert!(cfg.instruction(OpPos::new(block(0), 2)).is_none());
}

#[test]
fn cfg_validation() {
    let dangling = Cfg::new(vec![BasicBlock::falls_to(block(0), vec![], block(9))]);
    assert_eq!(
        dangling.unwrap_err(),
        CfgError::DanglingEdge {
            from: block(0),
            to: block(9)
        }
    );

    let duplicate = Cfg::new(vec![
        BasicBlock::terminal(block(0), vec![]),
        BasicBlock::terminal(block(0), vec![]),
    ]);
    assert_eq!(duplicate.unwrap_err(), CfgError::DuplicateBlock(block(0)));

    let shape = Cfg::new(vec![BasicBlock::new(
        block(0),
        BlockKind::Terminal,
        vec![],
        JumpTarget::None,
        Some(block(0)),
    )]);
    assert!(matches!(
        shape,
        Err(CfgError::InvalidBlockShape {
            kind: BlockKind::Terminal,
            ..
        })
    ));

    let shape = Cfg::new(vec![BasicBlock::unconditional(
        block(0),
        vec![],
        JumpTarget::None,
    )]);
    assert!(matches!(
        shape,
        Err(CfgError::InvalidBlockShape {
            reason: "has no jump target",
            ..
        })
    ));
}

#[test]
fn cfg_print() {
    let cfg = Cfg::new(vec![
        BasicBlock::falls_to(block(0), parse_instructions(["PUSH1 0x40"]).unwrap(), block(2)),
        BasicBlock::terminal(block(2), parse_instructions(["MLOAD 64", "STOP"]).unwrap()),
    ])
    .unwrap();
    let expected = r#"digraph CFG {
  Node_0[label="PUSH1 0x40"]
  Node_2[label="MLOAD 64\nSTOP"]

  Node_0 -> Node_2
}
"#;
    assert_eq!(print(&cfg), expected);
}
