//! Expression-tree generators.
//!
//! An executor expression is mirrored by a tree of generators that is verified once,
//! when the call site is enrolled: any node without a generator fails the whole tree.
//! Each generator emits the IR for its node and returns the value and null flag it
//! computed, so parents compose their children's results without touching memory.

mod boolean;
mod constant;
mod op;
mod var;

use cranelift::prelude::*;

pub use boolean::BoolGenerator;
pub use constant::ConstGenerator;
pub use op::OpGenerator;
pub use var::VarGenerator;

use crate::errors::Refusal;
use crate::executor::{BoolOp, ExprNode, FieldLayouts};
use crate::primitives::PrimitiveLibrary;
use crate::utils::{CodegenUtils, FunctionId};

/// What verification learned about a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExprTreeGeneratorInfo {
    /// Highest scan-slot attribute the tree reads; 0 when it reads none.
    pub max_attr: i32,
    /// Attribute count of the scan slot, when the call site knows it.
    pub scan_natts: Option<usize>,
}

impl ExprTreeGeneratorInfo {
    pub fn new(scan_natts: Option<usize>) -> Self {
        Self {
            max_attr: 0,
            scan_natts,
        }
    }
}

/// Result of one generated node: an `i64` datum and an `i8` null flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedValue {
    pub value: Value,
    pub isnull: Value,
}

/// The deformed scan slot's arrays, loaded once by the enclosing function.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScanColumns {
    pub values: Value,
    pub isnull: Value,
}

/// Function-wide state shared by every node while a tree is emitted.
pub(crate) struct ExprCodegenContext<'a> {
    pub utils: &'a mut CodegenUtils,
    pub primitives: Option<&'a PrimitiveLibrary>,
    pub layouts: &'a FieldLayouts,
    pub econtext: Value,
    pub scan: Option<ScanColumns>,
    slot_getattr: Option<FunctionId>,
}

impl<'a> ExprCodegenContext<'a> {
    pub fn new(
        utils: &'a mut CodegenUtils,
        primitives: Option<&'a PrimitiveLibrary>,
        layouts: &'a FieldLayouts,
        econtext: Value,
    ) -> Self {
        Self {
            utils,
            primitives,
            layouts,
            econtext,
            scan: None,
            slot_getattr: None,
        }
    }

    /// The registered regular `slot_getattr`.
    pub fn slot_getattr(&mut self) -> FunctionId {
        match self.slot_getattr {
            Some(id) => id,
            None => {
                let id = self.utils.register_external_function(
                    crate::executor::slot_getattr as crate::types::SlotGetAttrFn,
                );
                self.slot_getattr = Some(id);
                id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprTreeGenerator {
    Const(ConstGenerator),
    Var(VarGenerator),
    Bool(BoolGenerator),
    Op(OpGenerator),
}

impl ExprTreeGenerator {
    /// Builds the generator tree for `node`, or `None` when some node cannot be
    /// generated.
    pub fn verify_and_create(node: &ExprNode, info: &mut ExprTreeGeneratorInfo) -> Option<Self> {
        match node {
            ExprNode::Const { value, isnull } => {
                Some(ExprTreeGenerator::Const(ConstGenerator::new(*value, *isnull)))
            }
            ExprNode::Var { source, attno } => {
                VarGenerator::verify_and_create(*source, *attno, info).map(ExprTreeGenerator::Var)
            }
            ExprNode::Bool {
                op: op @ (BoolOp::And | BoolOp::Or),
                args,
            } => BoolGenerator::verify_and_create(*op, args, info).map(ExprTreeGenerator::Bool),
            ExprNode::Op { op, args } => {
                OpGenerator::verify_and_create(*op, args, info).map(ExprTreeGenerator::Op)
            }
            ExprNode::Bool { .. } | ExprNode::NullTest { .. } => {
                tracing::debug!(node = node.kind_name(), "unsupported expression node");
                None
            }
        }
    }

    pub(crate) fn generate_code(
        &self,
        ctx: &mut ExprCodegenContext,
        b: &mut FunctionBuilder,
    ) -> Result<GeneratedValue, Refusal> {
        match self {
            ExprTreeGenerator::Const(g) => Ok(g.generate_code(ctx, b)),
            ExprTreeGenerator::Var(g) => g.generate_code(ctx, b),
            ExprTreeGenerator::Bool(g) => g.generate_code(ctx, b),
            ExprTreeGenerator::Op(g) => g.generate_code(ctx, b),
        }
    }

    /// Whether the tree needs the primitive library.
    pub fn uses_operators(&self) -> bool {
        match self {
            ExprTreeGenerator::Const(_) | ExprTreeGenerator::Var(_) => false,
            ExprTreeGenerator::Bool(g) => g.args().iter().any(ExprTreeGenerator::uses_operators),
            ExprTreeGenerator::Op(_) => true,
        }
    }

    /// Checks that every operator of the tree is available in `library`.
    pub(crate) fn check_primitives(&self, library: Option<&PrimitiveLibrary>) -> Result<(), Refusal> {
        match self {
            ExprTreeGenerator::Const(_) | ExprTreeGenerator::Var(_) => Ok(()),
            ExprTreeGenerator::Bool(g) => g
                .args()
                .iter()
                .try_for_each(|arg| arg.check_primitives(library)),
            ExprTreeGenerator::Op(g) => {
                let name = g.op().name();
                match library {
                    Some(library) if library.contains(&g.op()) => {}
                    _ => return Err(Refusal::MissingPrimitive(name)),
                }
                g.args()
                    .iter()
                    .try_for_each(|arg| arg.check_primitives(library))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CmpOp, OpKind, OperandType, SlotSource};

    fn var(source: SlotSource, attno: i32) -> ExprNode {
        ExprNode::Var { source, attno }
    }

    fn lt(a: ExprNode, b: ExprNode) -> ExprNode {
        ExprNode::Op {
            op: OpKind::new(CmpOp::Lt, OperandType::Int4),
            args: vec![a, b],
        }
    }

    #[test]
    fn test_verify_records_max_attr() {
        let node = ExprNode::Bool {
            op: BoolOp::And,
            args: vec![
                lt(var(SlotSource::Scan, 3), var(SlotSource::Scan, 1)),
                lt(var(SlotSource::Inner, 9), ExprNode::Const { value: 4, isnull: false }),
            ],
        };
        let mut info = ExprTreeGeneratorInfo::new(Some(5));
        let tree = ExprTreeGenerator::verify_and_create(&node, &mut info).unwrap();
        assert_eq!(info.max_attr, 3);
        assert!(tree.uses_operators());
    }

    #[test]
    fn test_unsupported_nodes_fail_the_tree() {
        let mut info = ExprTreeGeneratorInfo::new(Some(2));
        let null_test = ExprNode::NullTest {
            arg: Box::new(var(SlotSource::Scan, 1)),
            is_null: true,
        };
        let nested = ExprNode::Bool {
            op: BoolOp::Or,
            args: vec![var(SlotSource::Scan, 1), null_test.clone()],
        };
        assert!(ExprTreeGenerator::verify_and_create(&null_test, &mut info).is_none());
        assert!(ExprTreeGenerator::verify_and_create(&nested, &mut info).is_none());

        let not = ExprNode::Bool {
            op: BoolOp::Not,
            args: vec![var(SlotSource::Scan, 1)],
        };
        assert!(ExprTreeGenerator::verify_and_create(&not, &mut info).is_none());
    }

    #[test]
    fn test_scan_reference_needs_known_slot() {
        let node = var(SlotSource::Scan, 2);
        assert!(ExprTreeGenerator::verify_and_create(&node, &mut ExprTreeGeneratorInfo::new(None)).is_none());
        assert!(ExprTreeGenerator::verify_and_create(&node, &mut ExprTreeGeneratorInfo::new(Some(1))).is_none());
        assert!(ExprTreeGenerator::verify_and_create(&var(SlotSource::Scan, 0), &mut ExprTreeGeneratorInfo::new(Some(1))).is_none());

        let mut info = ExprTreeGeneratorInfo::new(None);
        assert!(ExprTreeGenerator::verify_and_create(&var(SlotSource::Outer, 2), &mut info).is_some());
        assert_eq!(info.max_attr, 0);
    }

    #[test]
    fn test_missing_primitive() {
        let node = lt(var(SlotSource::Inner, 1), var(SlotSource::Inner, 2));
        let tree = ExprTreeGenerator::verify_and_create(&node, &mut ExprTreeGeneratorInfo::default()).unwrap();
        assert_eq!(
            tree.check_primitives(None),
            Err(Refusal::MissingPrimitive("int4lt".to_string()))
        );
        let library = PrimitiveLibrary::build().unwrap();
        assert_eq!(tree.check_primitives(Some(&library)), Ok(()));

        let constant = ExprNode::Const { value: 1, isnull: false };
        let tree = ExprTreeGenerator::verify_and_create(&constant, &mut ExprTreeGeneratorInfo::default()).unwrap();
        assert!(!tree.uses_operators());
        assert_eq!(tree.check_primitives(None), Ok(()));
    }
}
