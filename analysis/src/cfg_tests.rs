use super::cfg::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TestOp {
    Inc,
    Reset,
    Nop,
}

#[derive(Default, Clone)]
pub(crate) struct TestBasicBlock {
    id: usize,
    ops: Vec<TestOp>,
    succs: Vec<usize>,
}

impl CfgBlock for TestBasicBlock {
    type Id = usize;
    type Operation = TestOp;

    fn id(&self) -> usize {
        self.id
    }

    fn operations(&self) -> &[Self::Operation] {
        &self.ops
    }

    fn successors(&self) -> &[usize] {
        &self.succs
    }
}

pub(crate) struct TestCfg {
    basic_blocks: Vec<TestBasicBlock>,
}

impl ControlFlowGraph for TestCfg {
    type Block = TestBasicBlock;

    fn blocks(&self) -> &[Self::Block] {
        &self.basic_blocks
    }

    fn index_of(&self, id: usize) -> Option<usize> {
        (id < self.basic_blocks.len()).then_some(id)
    }
}

impl TestCfg {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            basic_blocks: (0..size)
                .map(|id| TestBasicBlock {
                    id,
                    ..Default::default()
                })
                .collect(),
        }
    }

    /// The target does not need to exist, this is how dangling edges are
    /// built.
    pub(crate) fn add_edge(&mut self, from: usize, to: usize) -> &mut Self {
        self.basic_blocks[from].succs.push(to);
        self
    }

    pub(crate) fn add_ops(&mut self, block: usize, ops: &[TestOp]) -> &mut Self {
        self.basic_blocks[block].ops.extend_from_slice(ops);
        self
    }
}

#[test]
fn test_cfg_print() {
    //     0
    //    / \
    //   1   2
    //   |   |
    //   |   3
    //    \ /
    //     4
    let mut cfg = TestCfg::new(5);
    cfg.add_edge(0, 1)
        .add_edge(0, 2)
        .add_edge(1, 4)
        .add_edge(2, 3)
        .add_edge(3, 4)
        .add_ops(2, &[TestOp::Inc, TestOp::Reset]);

    let printed = print(&cfg, |op| format!("{op:?}"));
    let expected = r#"digraph CFG {
  Node_0[label=""]
  Node_1[label=""]
  Node_2[label="Inc\nReset"]
  Node_3[label=""]
  Node_4[label=""]

  Node_0 -> Node_1
  Node_0 -> Node_2
  Node_1 -> Node_4
  Node_2 -> Node_3
  Node_3 -> Node_4
}
"#;
    assert_eq!(printed, expected);
}

#[test]
fn test_reachable_from() {
    //   0 -> 1 -> 2
    //        ^    |
    //        +----+
    //   3 -> 4
    let mut cfg = TestCfg::new(5);
    cfg.add_edge(0, 1)
        .add_edge(1, 2)
        .add_edge(2, 1)
        .add_edge(3, 4);

    let reachable = reachable_from(&cfg, 0);
    assert_eq!(reachable.ones().collect::<Vec<_>>(), vec![0, 1, 2]);

    let reachable = reachable_from(&cfg, 3);
    assert_eq!(reachable.ones().collect::<Vec<_>>(), vec![3, 4]);

    // Dangling edges are ignored.
    cfg.add_edge(4, 42);
    let reachable = reachable_from(&cfg, 3);
    assert_eq!(reachable.count_ones(..), 2);
}

#[test]
fn test_op_pos_round_trip() {
    let pos = OpPos::new(12usize, 3);
    assert_eq!(pos.to_string(), "12:3");
    assert_eq!("12:3".parse::<OpPos<usize>>(), Ok(pos));

    assert!(OpPos::new(1usize, 7) < OpPos::new(2usize, 0));
    assert!(OpPos::new(1usize, 0) < OpPos::new(1usize, 1));
}

#[test]
fn test_op_pos_parse_errors() {
    assert_eq!(
        "12".parse::<OpPos<usize>>(),
        Err(OpPosParseError::MissingSeparator("12".to_owned()))
    );
    assert!(matches!(
        "x:3".parse::<OpPos<usize>>(),
        Err(OpPosParseError::Block(_))
    ));
    assert_eq!(
        "1:y".parse::<OpPos<usize>>(),
        Err(OpPosParseError::Index("1:y".to_owned()))
    );
}
