use std::collections::{BTreeMap, BTreeSet};

use analysis::AnalysisError;
use analysis::cfg::OpPos;
use test_log::test;

use super::offset_analysis::Offset;
use super::slots_analysis::SlotId;
use super::test_utils::{block, instrs, jump_to, single_block};
use super::{AnalysisConfig, perform_memory_analysis, perform_storage_analysis};
use crate::accesses::{AccessToken, MemAccess, StoreClass, StoreReport};
use crate::error::Error;
use crate::ir::{BasicBlock, Cfg, JumpTarget};

/// Allocates, stores 42 into the first word of the allocation, and jumps.
const STORE_AND_JUMP: [&str; 7] = [
    "PUSH1 0x40",
    "MLOAD 64",
    "PUSH1 0x2a",
    "DUP2",
    "MSTORE",
    "PUSH1 0x10",
    "JUMP",
];

fn first_word() -> AccessToken {
    MemAccess::new(SlotId(0), Offset::Const(0)).into()
}

#[test]
fn store_without_read_is_dead() {
    let cfg = jump_to(&STORE_AND_JUMP, &["JUMPDEST", "PUSH1 0x00", "DUP1", "RETURN"]);
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();

    assert_eq!(
        result.reports,
        vec![StoreReport {
            point: OpPos::new(block(0), 4),
            token: first_word(),
            class: StoreClass::Dead,
        }]
    );
    assert_eq!(result.dead_writes().count(), 1);
    assert_eq!(result.context.allocated_slots().len(), 1);

    let summary = result.summary.block(block(0)).unwrap();
    assert_eq!(
        summary.dead_writes,
        BTreeSet::from([OpPos::new(block(0), 4)])
    );
    assert!(
        summary
            .memory_nonequal
            .contains(&(OpPos::new(block(0), 1), OpPos::new(block(0), 4)))
    );
    assert_eq!(
        summary.constant_addresses,
        BTreeMap::from([(OpPos::new(block(0), 1), 64)])
    );
}

#[test]
fn store_with_read_is_live() {
    let cfg = jump_to(
        &STORE_AND_JUMP,
        &["JUMPDEST", "DUP1", "MLOAD", "PUSH1 0x00", "DUP1", "RETURN"],
    );
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();

    assert_eq!(
        result.reports,
        vec![StoreReport {
            point: OpPos::new(block(0), 4),
            token: first_word(),
            class: StoreClass::Live {
                read: OpPos::new(block(16), 2)
            },
        }]
    );
    assert_eq!(result.dead_writes().count(), 0);
    assert!(result.summary.block(block(0)).unwrap().dead_writes.is_empty());
}

#[test]
fn store_before_revert_is_never_live() {
    let cfg = single_block(&[
        "PUSH1 0x40",
        "MLOAD 64",
        "PUSH1 0x2a",
        "DUP2",
        "MSTORE",
        "DUP1",
        "MLOAD",
        "POP",
        "PUSH1 0x00",
        "DUP1",
        "REVERT",
    ]);
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();

    assert_eq!(result.reports.len(), 1);
    assert_eq!(result.reports[0].class, StoreClass::BeforeRevert);
    assert!(result.reports[0].is_dead());
}

#[test]
fn self_loop_terminates() {
    let cfg = Cfg::new(vec![
        BasicBlock::falls_to(block(0), instrs(&["CALLVALUE", "POP"]), block(8)),
        BasicBlock::conditional(
            block(8),
            instrs(&[
                "JUMPDEST",
                "PUSH1 0x40",
                "MLOAD 64",
                "PUSH1 0x2a",
                "SWAP1",
                "MSTORE",
                "CALLER",
                "PUSH1 0x08",
                "JUMPI",
            ]),
            JumpTarget::Block(block(8)),
            block(24),
        ),
        BasicBlock::terminal(block(24), instrs(&["STOP"])),
    ])
    .unwrap();
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();

    assert_eq!(result.context.allocated_slots().len(), 1);
    assert_eq!(
        result.reports,
        vec![StoreReport {
            point: OpPos::new(block(8), 5),
            token: first_word(),
            class: StoreClass::Dead,
        }]
    );
}

#[test]
fn lossy_arithmetic_suppresses_dead_stores() {
    let cfg = jump_to(
        &[
            "PUSH1 0x40",
            "MLOAD 64",
            "PUSH1 0x2a",
            "DUP2",
            "MSTORE",
            "PUSH1 0x20",
            "SWAP1",
            "SUB",
            "PUSH1 0x10",
            "JUMP",
        ],
        &["JUMPDEST", "STOP"],
    );
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();
    assert!(result.accesses.found_outofslot());
    assert_eq!(result.reports.len(), 1);
    assert_eq!(result.reports[0].class, StoreClass::Suppressed);
    assert_eq!(result.dead_writes().count(), 0);
}

#[test]
fn debug_runs_give_the_same_results() {
    let cfg = jump_to(&STORE_AND_JUMP, &["JUMPDEST", "PUSH1 0x00", "DUP1", "RETURN"]);
    let quiet = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();
    let verbose = perform_memory_analysis(
        &cfg,
        AnalysisConfig {
            debug: true,
            ..AnalysisConfig::default()
        },
    )
    .unwrap();
    assert!(verbose.context.debug());
    assert_eq!(quiet.reports, verbose.reports);
    assert_eq!(quiet.accesses, verbose.accesses);
}

#[test]
fn storage_accesses_are_related() {
    let cfg = single_block(&[
        "PUSH1 0x2a",
        "PUSH1 0x05",
        "SSTORE",
        "PUSH1 0x05",
        "SLOAD",
        "PUSH1 0x06",
        "SLOAD",
        "POP",
        "POP",
        "STOP",
    ]);
    let result = perform_storage_analysis(&cfg, AnalysisConfig::default()).unwrap();
    let at = |op_id| OpPos::new(block(0), op_id);

    assert_eq!(
        result.accesses.writes().get(&at(2)),
        Some(&BTreeSet::from([AccessToken::Storage(Offset::Const(5))]))
    );
    let summary = result.summary.block(block(0)).unwrap();
    assert_eq!(summary.storage_equal, BTreeSet::from([(at(2), at(4))]));
    assert_eq!(summary.storage_nonequal, BTreeSet::from([(at(2), at(6))]));
    assert!(summary.memory_equal.is_empty());
    assert_eq!(
        summary.constant_addresses,
        BTreeMap::from([(at(2), 5), (at(4), 5), (at(6), 6)])
    );

    let expected = "Block 0:
  storage equal: (0:2, 0:4)
  storage non-equal: (0:2, 0:6)
  constant addresses: 0:2=5 0:4=5 0:6=6
";
    assert_eq!(result.summary.to_string(), expected);
}

#[test]
fn configuration_errors_abort() {
    let cfg = single_block(&["STOP"]);
    let config = AnalysisConfig {
        entry: block(99),
        ..AnalysisConfig::default()
    };
    assert_eq!(
        perform_memory_analysis(&cfg, config).err(),
        Some(Error::Analysis(AnalysisError::MissingEntryBlock(block(99))))
    );
    assert_eq!(
        perform_storage_analysis(&cfg, config).err(),
        Some(Error::Analysis(AnalysisError::MissingEntryBlock(block(99))))
    );
}

#[test]
fn node_limit_stops_the_run() {
    let cfg = Cfg::new(vec![
        BasicBlock::falls_to(block(0), vec![], block(8)),
        BasicBlock::conditional(
            block(8),
            instrs(&["JUMPDEST", "PUSH1 0x40", "MLOAD 64", "PUSH1 0x08", "JUMPI"]),
            JumpTarget::Block(block(8)),
            block(24),
        ),
        BasicBlock::terminal(block(24), instrs(&["STOP"])),
    ])
    .unwrap();
    let config = AnalysisConfig {
        node_limit: 1,
        ..AnalysisConfig::default()
    };
    assert_eq!(
        perform_memory_analysis(&cfg, config).err(),
        Some(Error::Analysis(AnalysisError::NoConvergence { processed: 3 }))
    );
    assert!(perform_memory_analysis(&cfg, AnalysisConfig::default()).is_ok());
}

#[test]
fn returned_masked_pointer_keeps_stores_alive() {
    let cfg = single_block(&[
        "PUSH1 0x40",
        "MLOAD 64",
        "PUSH1 0x2a",
        "DUP2",
        "MSTORE",
        "PUSH8 0xffffffffffffffff",
        "AND",
        "PUSH1 0x20",
        "SWAP1",
        "RETURN",
    ]);
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();
    assert_eq!(
        result.accesses.reads().get(&OpPos::new(block(0), 9)),
        Some(&BTreeSet::from([AccessToken::Memory(MemAccess::whole(SlotId(0)))]))
    );
    assert_eq!(
        result.reports[0].class,
        StoreClass::Live {
            read: OpPos::new(block(0), 9)
        }
    );
    assert_eq!(result.dead_writes().count(), 0);
}

#[test]
fn returned_unknown_pointer_keeps_stores_alive() {
    let cfg = jump_to(&STORE_AND_JUMP, &["JUMPDEST", "PUSH1 0x20", "CALLER", "RETURN"]);
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();
    assert_eq!(
        result.reports,
        vec![StoreReport {
            point: OpPos::new(block(0), 4),
            token: first_word(),
            class: StoreClass::Live {
                read: OpPos::new(block(16), 3)
            },
        }]
    );
}

#[test]
fn single_byte_store_does_not_hide_a_word() {
    let cfg = Cfg::new(vec![
        BasicBlock::unconditional(block(0), instrs(&STORE_AND_JUMP), JumpTarget::Block(block(16))),
        BasicBlock::unconditional(
            block(16),
            instrs(&["JUMPDEST", "PUSH1 0x01", "DUP2", "MSTORE8", "PUSH1 0x20", "JUMP"]),
            JumpTarget::Block(block(32)),
        ),
        BasicBlock::terminal(
            block(32),
            instrs(&["JUMPDEST", "DUP1", "MLOAD", "PUSH1 0x00", "DUP1", "RETURN"]),
        ),
    ])
    .unwrap();
    let result = perform_memory_analysis(&cfg, AnalysisConfig::default()).unwrap();

    let store = result
        .reports
        .iter()
        .find(|report| report.point == OpPos::new(block(0), 4))
        .unwrap();
    assert_eq!(
        store.class,
        StoreClass::Live {
            read: OpPos::new(block(32), 2)
        }
    );
    assert_eq!(result.dead_writes().count(), 0);
}
