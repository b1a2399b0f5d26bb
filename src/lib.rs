//! Runtime specialization of tuple deformation and scalar expressions.
//!
//! Executor operators call the hot routines of a query (tuple deformation, projection of
//! plain columns, expression evaluation) through function-pointer variables, the
//! [`CallSite`]s. A [`CodegenManager`] collects those call sites while a plan is set up,
//! generates Cranelift IR specialized to the shapes it captured (slot identity, attribute
//! widths and alignments, expression trees), compiles the whole session in one step and
//! swaps each call site over to its compiled function. Every generated function guards the
//! assumptions it was built on and hands the call back to the regular implementation when
//! one of them does not hold.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use deform_jit::executor::{slot_getsomeattrs, Attribute, HeapTuple, TupleDesc, TupleTableSlot, TupleValue};
//! use deform_jit::{CallSite, CodegenManager, SlotGetSomeAttrsFn};
//!
//! let desc = Arc::new(TupleDesc::new(vec![Attribute::int4(), Attribute::int8()]));
//! let mut slot = TupleTableSlot::new(Arc::clone(&desc));
//!
//! // Enroll the call site, generate and publish
//! let site = CallSite::new(slot_getsomeattrs as SlotGetSomeAttrsFn);
//! let mut manager = CodegenManager::new("example");
//! manager.enroll_slot_deform(Arc::clone(&site), &slot, 2);
//! manager.generate_code();
//! assert_eq!(manager.prepare_generated_functions(), 1);
//!
//! // Deform a row through the compiled function
//! slot.store_heap_tuple(Arc::new(HeapTuple::form(&desc, &[TupleValue::Int(7), TupleValue::Int(-1)])));
//! unsafe { (site.get())(slot.as_mut_ptr(), 2) };
//! assert_eq!(slot.values()[0], 7);
//! ```

pub use errors::{BuilderError, ConvertError, Refusal};
pub use manager::{CodegenManager, GeneratorCache, SlotFingerprint};
pub use types::{
    CallSite, CodegenFn, Datum, ExecEvalExprFn, ExecVariableListFn, PrimitiveFn,
    SlotGetAttrFn, SlotGetSomeAttrsFn,
};
pub use utils::{CodegenOptions, CodegenUtils, OptimizationLevel, SizeLevel};

pub mod prelude {
    pub use crate::convert::{build_expr, ColumnRef, ColumnType};
    pub use crate::executor::{ExprContext, ExprNode, ExprState, ProjectionInfo, TupleTableSlot};
    pub use crate::manager::CodegenManager;
    pub use crate::types::CallSite;
}

/// Predicate text to executor expression trees
pub mod convert;
/// Tuple deformation generator
pub mod deform;
/// Host routines called from generated code
pub mod diagnostics;
/// Error types for the various failure modes
pub mod errors;
/// The executor structures and regular implementations generated code replaces
pub mod executor;
/// Expression-tree generators
pub mod expr;
/// Expression evaluation generator
pub mod expr_eval;
/// Generator state machine and the closed set of generator kinds
pub mod generator;
/// Per-session generator bookkeeping
pub mod manager;
/// Precompiled comparison primitives
pub mod primitives;
/// Native function-pointer types and call sites
pub mod types;
/// Cranelift backend wrapper
pub mod utils;
/// Projection generator
pub mod variable_list;
