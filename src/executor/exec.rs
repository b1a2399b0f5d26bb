//! Projection and expression evaluation: the regular, interpreted implementations that
//! generated code specializes and falls back to.

use std::fmt;

use itertools::Itertools;

use crate::executor::slot::{slot_getattr, slot_getsomeattrs, TupleTableSlot};
use crate::types::{datum_get_float8, datum_get_int4, datum_get_int8, Datum};

/// Per-row evaluation context: the slots an expression may reference.
#[repr(C)]
#[derive(Debug)]
pub struct ExprContext {
    pub scan_tuple: *mut TupleTableSlot,
    pub inner_tuple: *mut TupleTableSlot,
    pub outer_tuple: *mut TupleTableSlot,
}

impl ExprContext {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            scan_tuple: std::ptr::null_mut(),
            inner_tuple: std::ptr::null_mut(),
            outer_tuple: std::ptr::null_mut(),
        })
    }

    pub fn set_slot(&mut self, source: SlotSource, slot: *mut TupleTableSlot) {
        match source {
            SlotSource::Scan => self.scan_tuple = slot,
            SlotSource::Inner => self.inner_tuple = slot,
            SlotSource::Outer => self.outer_tuple = slot,
        }
    }

    pub fn slot(&self, source: SlotSource) -> *mut TupleTableSlot {
        match source {
            SlotSource::Scan => self.scan_tuple,
            SlotSource::Inner => self.inner_tuple,
            SlotSource::Outer => self.outer_tuple,
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut ExprContext {
        self as *mut ExprContext
    }
}

/// Which slot of the evaluation context a column reference reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotSource {
    Scan,
    Inner,
    Outer,
}

/// One plain column reference in a projection target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarTarget {
    pub source: SlotSource,
    /// 1-based attribute number; values `<= 0` denote system attributes.
    pub attno: i32,
}

/// A projection whose targets are all plain column references.
#[repr(C)]
#[derive(Debug)]
pub struct ProjectionInfo {
    pub(crate) expr_context: *mut ExprContext,
    targets: Vec<VarTarget>,
}

impl ProjectionInfo {
    pub fn new(expr_context: *mut ExprContext, targets: Vec<VarTarget>) -> Box<Self> {
        Box::new(Self {
            expr_context,
            targets,
        })
    }

    pub fn targets(&self) -> &[VarTarget] {
        &self.targets
    }

    pub fn expr_context(&self) -> *mut ExprContext {
        self.expr_context
    }

    /// The slot every target reads from, if there is exactly one.
    pub fn single_source(&self) -> Option<SlotSource> {
        self.targets.iter().map(|t| t.source).dedup().exactly_one().ok()
    }

    /// Highest attribute number referenced from `source`.
    pub fn max_attr(&self, source: SlotSource) -> i32 {
        self.targets
            .iter()
            .filter(|t| t.source == source)
            .map(|t| t.attno)
            .max()
            .unwrap_or(0)
    }

    pub fn as_mut_ptr(&mut self) -> *mut ProjectionInfo {
        self as *mut ProjectionInfo
    }
}

/// Regular projection of a plain-variable target list.
///
/// # Safety
/// `proj` and its expression context must be live; every slot the targets read must be
/// live; `values` and `isnull` must hold one element per target.
pub unsafe extern "C" fn exec_variable_list(
    proj: *mut ProjectionInfo,
    values: *mut Datum,
    isnull: *mut bool,
) {
    let proj = &*proj;
    let econtext = &*proj.expr_context;

    for source in [SlotSource::Scan, SlotSource::Inner, SlotSource::Outer] {
        let last = proj.max_attr(source);
        let slot = econtext.slot(source);
        if last > 0 && !slot.is_null() {
            slot_getsomeattrs(slot, last);
        }
    }

    for (i, target) in proj.targets.iter().enumerate() {
        let slot = econtext.slot(target.source);
        let mut null = false;
        *values.add(i) = slot_getattr(slot, target.attno, &mut null);
        *isnull.add(i) = null;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub const ALL: [CmpOp; 6] = [CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge];

    pub fn suffix(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }

    /// Applies the operator to a three-way comparison result.
    pub fn holds(self, ordering: i32) -> bool {
        match self {
            CmpOp::Eq => ordering == 0,
            CmpOp::Ne => ordering != 0,
            CmpOp::Lt => ordering < 0,
            CmpOp::Le => ordering <= 0,
            CmpOp::Gt => ordering > 0,
            CmpOp::Ge => ordering >= 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandType {
    Int4,
    Int8,
    Float8,
}

impl OperandType {
    pub const ALL: [OperandType; 3] = [OperandType::Int4, OperandType::Int8, OperandType::Float8];

    pub fn prefix(self) -> &'static str {
        match self {
            OperandType::Int4 => "int4",
            OperandType::Int8 => "int8",
            OperandType::Float8 => "float8",
        }
    }

    /// Name of the three-way comparison function for this type.
    pub fn cmp_name(self) -> String {
        format!("{}cmp", self.prefix())
    }

    /// Three-way comparison. Floats order NaN equal to itself and above every number.
    pub fn compare(self, a: Datum, b: Datum) -> i32 {
        match self {
            OperandType::Int4 => datum_get_int4(a).cmp(&datum_get_int4(b)) as i32,
            OperandType::Int8 => datum_get_int8(a).cmp(&datum_get_int8(b)) as i32,
            OperandType::Float8 => {
                let (a, b) = (datum_get_float8(a), datum_get_float8(b));
                match (a.is_nan(), b.is_nan()) {
                    (true, true) => 0,
                    (true, false) => 1,
                    (false, true) => -1,
                    _ if a > b => 1,
                    _ if a < b => -1,
                    _ => 0,
                }
            }
        }
    }
}

/// A comparison operator applied to two operands of one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpKind {
    pub cmp: CmpOp,
    pub ty: OperandType,
}

impl OpKind {
    pub fn new(cmp: CmpOp, ty: OperandType) -> Self {
        Self { cmp, ty }
    }

    /// Function name of the operator, e.g. `int4lt`.
    pub fn name(&self) -> String {
        format!("{}{}", self.ty.prefix(), self.cmp.suffix())
    }

    pub fn apply(&self, a: Datum, b: Datum) -> Datum {
        self.cmp.holds(self.ty.compare(a, b)) as Datum
    }
}

/// Expression tree evaluated per row.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    Var { source: SlotSource, attno: i32 },
    Const { value: Datum, isnull: bool },
    Bool { op: BoolOp, args: Vec<ExprNode> },
    /// Strict binary comparison: a null operand makes the result null.
    Op { op: OpKind, args: Vec<ExprNode> },
    NullTest { arg: Box<ExprNode>, is_null: bool },
}

impl ExprNode {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExprNode::Var { .. } => "Var",
            ExprNode::Const { .. } => "Const",
            ExprNode::Bool { op: BoolOp::And, .. } => "AND",
            ExprNode::Bool { op: BoolOp::Or, .. } => "OR",
            ExprNode::Bool { op: BoolOp::Not, .. } => "NOT",
            ExprNode::Op { .. } => "OpExpr",
            ExprNode::NullTest { .. } => "NullTest",
        }
    }
}

impl fmt::Display for ExprNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprNode::Var { source, attno } => write!(f, "{:?}.${}", source, attno),
            ExprNode::Const { isnull: true, .. } => write!(f, "NULL"),
            ExprNode::Const { value, .. } => write!(f, "{}", *value as i64),
            ExprNode::Bool { op: BoolOp::Not, args } => {
                write!(f, "NOT ({})", args.iter().join(", "))
            }
            ExprNode::Bool { op, args } => {
                let sep = if *op == BoolOp::And { " AND " } else { " OR " };
                write!(f, "({})", args.iter().join(sep))
            }
            ExprNode::Op { op, args } => write!(f, "{}({})", op.name(), args.iter().join(", ")),
            ExprNode::NullTest { arg, is_null } => {
                write!(f, "{} IS {}NULL", arg, if *is_null { "" } else { "NOT " })
            }
        }
    }
}

/// Executor-owned state of one expression; its address identifies the call site.
#[repr(C)]
#[derive(Debug)]
pub struct ExprState {
    node: ExprNode,
}

impl ExprState {
    pub fn new(node: ExprNode) -> Box<Self> {
        Box::new(Self { node })
    }

    pub fn node(&self) -> &ExprNode {
        &self.node
    }

    pub fn as_mut_ptr(&mut self) -> *mut ExprState {
        self as *mut ExprState
    }

    pub fn addr(&self) -> usize {
        self as *const ExprState as usize
    }
}

/// Regular interpreter for an expression tree.
///
/// # Safety
/// `state` and `econtext` must be live and every slot the tree references must be null
/// or live; `isnull` must be writable.
pub unsafe extern "C" fn exec_eval_expr(
    state: *mut ExprState,
    econtext: *mut ExprContext,
    isnull: *mut bool,
) -> Datum {
    let (value, null) = eval_node(&(*state).node, &*econtext);
    *isnull = null;
    value
}

unsafe fn eval_node(node: &ExprNode, econtext: &ExprContext) -> (Datum, bool) {
    match node {
        ExprNode::Var { source, attno } => {
            let mut null = false;
            let value = slot_getattr(econtext.slot(*source), *attno, &mut null);
            (value, null)
        }
        ExprNode::Const { value, isnull } => (*value, *isnull),
        ExprNode::Bool { op: BoolOp::Not, args } => {
            let (value, null) = eval_node(&args[0], econtext);
            if null {
                (0, true)
            } else {
                ((value == 0) as Datum, false)
            }
        }
        ExprNode::Bool { op, args } => {
            let decisive = *op == BoolOp::Or;
            let mut any_null = false;
            for arg in args {
                let (value, null) = eval_node(arg, econtext);
                if null {
                    any_null = true;
                } else if (value != 0) == decisive {
                    return (decisive as Datum, false);
                }
            }
            if any_null {
                (0, true)
            } else {
                (!decisive as Datum, false)
            }
        }
        ExprNode::Op { op, args } => {
            let (a, a_null) = eval_node(&args[0], econtext);
            let (b, b_null) = eval_node(&args[1], econtext);
            if a_null || b_null {
                (0, true)
            } else {
                (op.apply(a, b), false)
            }
        }
        ExprNode::NullTest { arg, is_null } => {
            let (_, null) = eval_node(arg, econtext);
            ((null == *is_null) as Datum, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::tuple::{Attribute, HeapTuple, TupleDesc, TupleValue};
    use crate::types::{float8_datum, int4_datum};

    fn scan_slot(values: &[TupleValue]) -> Box<TupleTableSlot> {
        let desc = Arc::new(TupleDesc::new(vec![
            Attribute::int4(),
            Attribute::int4(),
            Attribute::int8(),
        ]));
        let mut slot = TupleTableSlot::new(Arc::clone(&desc));
        slot.store_heap_tuple(Arc::new(HeapTuple::form(&desc, values)));
        slot
    }

    fn var(attno: i32) -> ExprNode {
        ExprNode::Var {
            source: SlotSource::Scan,
            attno,
        }
    }

    fn int4(v: i32) -> ExprNode {
        ExprNode::Const {
            value: int4_datum(v),
            isnull: false,
        }
    }

    fn null() -> ExprNode {
        ExprNode::Const {
            value: 0,
            isnull: true,
        }
    }

    fn eval(node: ExprNode, slot: &mut TupleTableSlot) -> (Datum, bool) {
        let mut econtext = ExprContext::new();
        econtext.set_slot(SlotSource::Scan, slot.as_mut_ptr());
        let mut state = ExprState::new(node);
        let mut isnull = false;
        let value = unsafe { exec_eval_expr(state.as_mut_ptr(), econtext.as_mut_ptr(), &mut isnull) };
        (value, isnull)
    }

    #[test]
    fn test_exec_variable_list() {
        let mut slot = scan_slot(&[TupleValue::Int(1), TupleValue::Null, TupleValue::Int(3)]);
        let mut econtext = ExprContext::new();
        econtext.set_slot(SlotSource::Scan, slot.as_mut_ptr());
        let mut proj = ProjectionInfo::new(
            econtext.as_mut_ptr(),
            vec![
                VarTarget { source: SlotSource::Scan, attno: 3 },
                VarTarget { source: SlotSource::Scan, attno: 2 },
            ],
        );
        let mut values = [0 as Datum; 2];
        let mut isnull = [false; 2];
        unsafe { exec_variable_list(proj.as_mut_ptr(), values.as_mut_ptr(), isnull.as_mut_ptr()) };
        assert_eq!(values[0], 3);
        assert_eq!(isnull, [false, true]);
        assert_eq!(slot.nvalid(), 3);
    }

    #[test]
    fn test_single_source() {
        let targets = vec![
            VarTarget { source: SlotSource::Scan, attno: 1 },
            VarTarget { source: SlotSource::Inner, attno: 1 },
        ];
        let proj = ProjectionInfo::new(std::ptr::null_mut(), targets);
        assert_eq!(proj.single_source(), None);
        assert_eq!(proj.max_attr(SlotSource::Inner), 1);

        let proj = ProjectionInfo::new(
            std::ptr::null_mut(),
            vec![VarTarget { source: SlotSource::Outer, attno: 4 }],
        );
        assert_eq!(proj.single_source(), Some(SlotSource::Outer));
    }

    #[test]
    fn test_comparison_operator() {
        let mut slot = scan_slot(&[TupleValue::Int(5), TupleValue::Int(-1), TupleValue::Int(0)]);
        let lt = OpKind::new(CmpOp::Lt, OperandType::Int4);
        let node = ExprNode::Op { op: lt, args: vec![var(2), var(1)] };
        assert_eq!(eval(node, &mut slot), (1, false));

        let node = ExprNode::Op { op: lt, args: vec![var(1), null()] };
        assert_eq!(eval(node, &mut slot), (0, true));
    }

    #[test]
    fn test_three_valued_and_or() {
        let mut slot = scan_slot(&[TupleValue::Int(1), TupleValue::Int(0), TupleValue::Int(0)]);
        let and = |args| ExprNode::Bool { op: BoolOp::And, args };
        let or = |args| ExprNode::Bool { op: BoolOp::Or, args };

        assert_eq!(eval(and(vec![null(), int4(0)]), &mut slot), (0, false));
        assert_eq!(eval(and(vec![null(), int4(1)]), &mut slot), (0, true));
        assert_eq!(eval(and(vec![var(1), int4(1)]), &mut slot), (1, false));
        assert_eq!(eval(or(vec![null(), int4(1)]), &mut slot), (1, false));
        assert_eq!(eval(or(vec![null(), var(2)]), &mut slot), (0, true));
        assert_eq!(eval(or(vec![var(2), int4(0)]), &mut slot), (0, false));
    }

    #[test]
    fn test_not_and_null_test() {
        let mut slot = scan_slot(&[TupleValue::Int(1), TupleValue::Null, TupleValue::Int(0)]);
        let not = ExprNode::Bool { op: BoolOp::Not, args: vec![var(1)] };
        assert_eq!(eval(not, &mut slot), (0, false));
        let test = ExprNode::NullTest { arg: Box::new(var(2)), is_null: true };
        assert_eq!(eval(test, &mut slot), (1, false));
    }

    #[test]
    fn test_float8_ordering() {
        let cmp = OperandType::Float8;
        let nan = float8_datum(f64::NAN);
        assert_eq!(cmp.compare(nan, nan), 0);
        assert_eq!(cmp.compare(nan, float8_datum(f64::INFINITY)), 1);
        assert_eq!(cmp.compare(float8_datum(-1.0), nan), -1);
        assert_eq!(cmp.compare(float8_datum(0.0), float8_datum(-0.0)), 0);
        assert_eq!(OpKind::new(CmpOp::Ge, cmp).name(), "float8ge");
    }
}
