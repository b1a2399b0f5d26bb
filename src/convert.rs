//! Conversion of textual predicates into executor expression trees.
//!
//! Predicates are parsed with evalexpr and mapped onto [`ExprNode`]s: `&&` and `||` become
//! boolean expressions (nested chains of the same operator are flattened), `!` becomes
//! `NOT`, and the six comparison operators become typed comparison operators. Identifiers
//! are resolved through a column map. An empty constant converts to a null.
//!
//! ```rust
//! use std::collections::HashMap;
//! use deform_jit::convert::{build_expr, ColumnRef, ColumnType};
//! use deform_jit::executor::SlotSource;
//!
//! let mut columns = HashMap::new();
//! columns.insert("a".to_string(), ColumnRef::new(SlotSource::Scan, 1, ColumnType::Int4));
//! columns.insert("b".to_string(), ColumnRef::new(SlotSource::Scan, 2, ColumnType::Float8));
//!
//! let expr = build_expr("a < 10 && b >= 0.5", &columns).unwrap();
//! assert_eq!(expr.to_string(), "(int4lt(Scan.$1, 10) AND float8ge(Scan.$2, 4602678819172646912))");
//! ```

use std::collections::HashMap;

use evalexpr::{build_operator_tree, Node, Operator};

use crate::errors::ConvertError;
use crate::executor::{BoolOp, CmpOp, ExprNode, OpKind, OperandType, SlotSource};
use crate::types::{bool_datum, float8_datum, int4_datum, int8_datum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int4,
    Int8,
    Float8,
    Bool,
}

impl ColumnType {
    fn operand_type(self) -> Option<OperandType> {
        match self {
            ColumnType::Int4 => Some(OperandType::Int4),
            ColumnType::Int8 => Some(OperandType::Int8),
            ColumnType::Float8 => Some(OperandType::Float8),
            ColumnType::Bool => None,
        }
    }
}

/// Where a named column lives and how its datum is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub source: SlotSource,
    pub attno: i32,
    pub ty: ColumnType,
}

impl ColumnRef {
    pub fn new(source: SlotSource, attno: i32, ty: ColumnType) -> Self {
        Self { source, attno, ty }
    }
}

/// A comparison operand before its type is known.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand {
    Column(ColumnRef),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

/// Parses `text` and converts it into an expression tree over `columns`.
pub fn build_expr(text: &str, columns: &HashMap<String, ColumnRef>) -> Result<ExprNode, ConvertError> {
    let tree: Node = build_operator_tree(text)?;
    build_predicate(&tree, columns)
}

/// Converts a node in boolean position.
fn build_predicate(node: &Node, columns: &HashMap<String, ColumnRef>) -> Result<ExprNode, ConvertError> {
    match node.operator() {
        Operator::RootNode => build_predicate(single_child(node)?, columns),
        Operator::And => build_bool(BoolOp::And, node, columns),
        Operator::Or => build_bool(BoolOp::Or, node, columns),
        Operator::Not => Ok(ExprNode::Bool {
            op: BoolOp::Not,
            args: vec![build_predicate(single_child(node)?, columns)?],
        }),
        Operator::Eq => build_comparison(CmpOp::Eq, node, columns),
        Operator::Neq => build_comparison(CmpOp::Ne, node, columns),
        Operator::Lt => build_comparison(CmpOp::Lt, node, columns),
        Operator::Leq => build_comparison(CmpOp::Le, node, columns),
        Operator::Gt => build_comparison(CmpOp::Gt, node, columns),
        Operator::Geq => build_comparison(CmpOp::Ge, node, columns),
        _ => match build_operand(node, columns)? {
            Operand::Column(column) if column.ty == ColumnType::Bool => Ok(ExprNode::Var {
                source: column.source,
                attno: column.attno,
            }),
            Operand::Bool(b) => Ok(ExprNode::Const {
                value: bool_datum(b),
                isnull: false,
            }),
            Operand::Null => Ok(ExprNode::Const {
                value: 0,
                isnull: true,
            }),
            other => Err(ConvertError::TypeMismatch(format!(
                "expected a boolean, found {:?}",
                other
            ))),
        },
    }
}

fn build_bool(op: BoolOp, node: &Node, columns: &HashMap<String, ColumnRef>) -> Result<ExprNode, ConvertError> {
    let mut args = Vec::with_capacity(node.children().len());
    for child in node.children() {
        match build_predicate(child, columns)? {
            ExprNode::Bool { op: inner, args: nested } if inner == op => args.extend(nested),
            arg => args.push(arg),
        }
    }
    Ok(ExprNode::Bool { op, args })
}

fn build_comparison(
    cmp: CmpOp,
    node: &Node,
    columns: &HashMap<String, ColumnRef>,
) -> Result<ExprNode, ConvertError> {
    let children = node.children();
    if children.len() != 2 {
        return Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} operands",
            node.operator(),
            children.len()
        )));
    }
    let lhs = build_operand(&children[0], columns)?;
    let rhs = build_operand(&children[1], columns)?;
    let ty = comparison_type(&lhs, &rhs)?;
    Ok(ExprNode::Op {
        op: OpKind::new(cmp, ty),
        args: vec![datum_node(lhs, ty)?, datum_node(rhs, ty)?],
    })
}

fn build_operand(node: &Node, columns: &HashMap<String, ColumnRef>) -> Result<Operand, ConvertError> {
    match node.operator() {
        Operator::RootNode => build_operand(single_child(node)?, columns),
        Operator::VariableIdentifierRead { identifier } => columns
            .get(identifier.as_str())
            .copied()
            .map(Operand::Column)
            .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string())),
        Operator::Const { value } => match value {
            evalexpr::Value::Int(i) => Ok(Operand::Int(*i)),
            evalexpr::Value::Float(f) => Ok(Operand::Float(*f)),
            evalexpr::Value::Boolean(b) => Ok(Operand::Bool(*b)),
            evalexpr::Value::Empty => Ok(Operand::Null),
            _ => Err(ConvertError::ConstOperator(format!("{:?}", value))),
        },
        Operator::Neg => match build_operand(single_child(node)?, columns)? {
            Operand::Int(i) => i
                .checked_neg()
                .map(Operand::Int)
                .ok_or_else(|| ConvertError::ConstOperator(format!("-({})", i))),
            Operand::Float(f) => Ok(Operand::Float(-f)),
            other => Err(ConvertError::UnsupportedOperator(format!(
                "negation of {:?}",
                other
            ))),
        },
        other => Err(ConvertError::UnsupportedOperator(format!("{:?}", other))),
    }
}

/// Columns fix the operand type; constants adapt to it.
fn comparison_type(lhs: &Operand, rhs: &Operand) -> Result<OperandType, ConvertError> {
    let column_type = |operand: &Operand| match operand {
        Operand::Column(column) => Some(column.ty),
        _ => None,
    };
    let ty = match (column_type(lhs), column_type(rhs)) {
        (Some(a), Some(b)) if a != b => {
            return Err(ConvertError::TypeMismatch(format!("{:?} compared with {:?}", a, b)))
        }
        (Some(ty), _) | (_, Some(ty)) => ty,
        (None, None) if matches!(lhs, Operand::Float(_)) || matches!(rhs, Operand::Float(_)) => {
            ColumnType::Float8
        }
        (None, None) => ColumnType::Int8,
    };
    ty.operand_type()
        .ok_or_else(|| ConvertError::TypeMismatch(format!("{:?} values cannot be ordered", ty)))
}

fn datum_node(operand: Operand, ty: OperandType) -> Result<ExprNode, ConvertError> {
    let value = match (operand, ty) {
        (Operand::Column(column), _) => {
            return Ok(ExprNode::Var {
                source: column.source,
                attno: column.attno,
            })
        }
        (Operand::Null, _) => {
            return Ok(ExprNode::Const {
                value: 0,
                isnull: true,
            })
        }
        (Operand::Int(i), OperandType::Int4) => int4_datum(
            i32::try_from(i).map_err(|_| ConvertError::ConstOperator(format!("{} is out of range for int4", i)))?,
        ),
        (Operand::Int(i), OperandType::Int8) => int8_datum(i),
        (Operand::Int(i), OperandType::Float8) => float8_datum(i as f64),
        (Operand::Float(f), OperandType::Float8) => float8_datum(f),
        (other, ty) => {
            return Err(ConvertError::TypeMismatch(format!(
                "{:?} used as {}",
                other,
                ty.prefix()
            )))
        }
    };
    Ok(ExprNode::Const {
        value,
        isnull: false,
    })
}

fn single_child(node: &Node) -> Result<&Node, ConvertError> {
    match node.children() {
        [child] => Ok(child),
        children => Err(ConvertError::RootNode(format!(
            "{:?} has {} children",
            node.operator(),
            children.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> HashMap<String, ColumnRef> {
        [
            ("a", ColumnRef::new(SlotSource::Scan, 1, ColumnType::Int4)),
            ("b", ColumnRef::new(SlotSource::Scan, 2, ColumnType::Int8)),
            ("x", ColumnRef::new(SlotSource::Scan, 3, ColumnType::Float8)),
            ("flag", ColumnRef::new(SlotSource::Scan, 4, ColumnType::Bool)),
            ("k", ColumnRef::new(SlotSource::Inner, 1, ColumnType::Int4)),
        ]
        .into_iter()
        .map(|(name, column)| (name.to_string(), column))
        .collect()
    }

    fn var(source: SlotSource, attno: i32) -> ExprNode {
        ExprNode::Var { source, attno }
    }

    #[test]
    fn test_comparison() {
        let expr = build_expr("a < 5", &columns()).unwrap();
        assert_eq!(
            expr,
            ExprNode::Op {
                op: OpKind::new(CmpOp::Lt, OperandType::Int4),
                args: vec![
                    var(SlotSource::Scan, 1),
                    ExprNode::Const { value: int4_datum(5), isnull: false },
                ],
            }
        );
    }

    #[test]
    fn test_constant_adapts_to_column() {
        let expr = build_expr("x != 2", &columns()).unwrap();
        let ExprNode::Op { op, args } = expr else {
            panic!("expected an operator");
        };
        assert_eq!(op, OpKind::new(CmpOp::Ne, OperandType::Float8));
        assert_eq!(args[1], ExprNode::Const { value: float8_datum(2.0), isnull: false });

        let ExprNode::Op { args, .. } = build_expr("a >= -3", &columns()).unwrap() else {
            panic!("expected an operator");
        };
        assert_eq!(args[1], ExprNode::Const { value: int4_datum(-3), isnull: false });
    }

    #[test]
    fn test_flattened_boolean_chain() {
        let expr = build_expr("a < 1 && b > 2 && (k == a || flag)", &columns()).unwrap();
        let ExprNode::Bool { op: BoolOp::And, args } = expr else {
            panic!("expected AND");
        };
        assert_eq!(args.len(), 3);
        assert!(matches!(&args[2], ExprNode::Bool { op: BoolOp::Or, args } if args.len() == 2));
    }

    #[test]
    fn test_not() {
        let expr = build_expr("!(b == 7)", &columns()).unwrap();
        let ExprNode::Bool { op: BoolOp::Not, args } = expr else {
            panic!("expected NOT");
        };
        let ExprNode::Op { op, args } = &args[0] else {
            panic!("expected an operator");
        };
        assert_eq!(*op, OpKind::new(CmpOp::Eq, OperandType::Int8));
        assert_eq!(args[1], ExprNode::Const { value: int8_datum(7), isnull: false });
    }

    #[test]
    fn test_boolean_operands() {
        assert_eq!(build_expr("flag", &columns()).unwrap(), var(SlotSource::Scan, 4));
        let expr = build_expr("flag || false", &columns()).unwrap();
        assert_eq!(
            expr,
            ExprNode::Bool {
                op: BoolOp::Or,
                args: vec![
                    var(SlotSource::Scan, 4),
                    ExprNode::Const { value: bool_datum(false), isnull: false },
                ],
            }
        );
    }

    #[test]
    fn test_errors() {
        let columns = columns();
        assert!(matches!(build_expr("(a < 1", &columns), Err(ConvertError::Parse(_))));
        // evalexpr accepts a dangling operator as a node with one operand
        assert!(matches!(
            build_expr("a < ", &columns),
            Err(ConvertError::UnsupportedOperator(msg)) if msg == "Lt with 1 operands"
        ));
        assert!(matches!(build_expr("zz < 1", &columns), Err(ConvertError::VariableNotFound(_))));
        assert!(matches!(build_expr("a + 1 < 2", &columns), Err(ConvertError::UnsupportedOperator(_))));
        assert!(matches!(build_expr("a < b", &columns), Err(ConvertError::TypeMismatch(_))));
        assert!(matches!(build_expr("a < 1.5", &columns), Err(ConvertError::TypeMismatch(_))));
        assert!(matches!(build_expr("flag < true", &columns), Err(ConvertError::TypeMismatch(_))));
        assert!(matches!(build_expr("a < 10000000000", &columns), Err(ConvertError::ConstOperator(_))));
        assert!(matches!(build_expr("a", &columns), Err(ConvertError::TypeMismatch(_))));
    }
}
