//! The executor side of the call-site contract: slots, rows, projections, expression
//! state, and the regular implementations that generated functions specialize.

pub mod exec;
pub mod layout;
pub mod slot;
pub mod tuple;

pub use exec::{
    exec_eval_expr, exec_variable_list, BoolOp, CmpOp, ExprContext, ExprNode, ExprState,
    OpKind, OperandType, ProjectionInfo, SlotSource, VarTarget,
};
pub use layout::{FieldDesc, FieldLayouts, FieldType, LAYOUT_VERSION};
pub use slot::{slot_getattr, slot_getsomeattrs, TupleTableSlot, TTS_EMPTY, TTS_VIRTUAL};
pub use tuple::{
    AttAlign, Attribute, HeapTuple, MemTuple, TupleDesc, TupleValue, HEAP_HASNULL,
    HEAP_HASVARWIDTH, HEAP_NATTS_MASK,
};
