//! Error types for the deform-jit crate.
//!
//! Three kinds of failure exist in the code generation pipeline:
//!
//! - `BuilderError`: the Cranelift backend could not build, declare, define or link code
//! - `Refusal`: a generator decided at generation time that it cannot specialize its
//!   call site; the call site simply keeps its regular implementation
//! - `ConvertError`: a textual expression could not be turned into an executor expression
//!
//! Builder errors and refusals are absorbed at the manager boundary and only reported
//! through `tracing`. Invariant violations (double compilation, duplicate function names,
//! reading function pointers before compilation) are not errors; they panic.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur while building and compiling the program module.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid codegen setting: {0}")]
    SettingError(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining a function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring a function or data symbol
    #[error("declaration error: {0}")]
    DeclarationError(String),
    /// The execution engine assigned a different id than the program module did
    #[error("symbol `{name}` was declared as #{got}, expected #{expected}")]
    SymbolMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    /// An imported symbol has no registered host address
    #[error("symbol `{0}` has no registered address")]
    UnresolvedSymbol(String),
}

/// Reasons a generator declines to specialize its call site.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Refusal {
    #[error("field layout version {found} is not supported (expected {expected})")]
    LayoutVersion { expected: u32, found: u32 },
    #[error("target list has no entries")]
    NoTargets,
    #[error("target list reads from multiple slots")]
    MultipleSlots,
    #[error("max attribute {0} is not a user attribute")]
    SystemAttribute(i32),
    #[error("max attribute {max_attr} exceeds the slot's {natts} attributes")]
    AttributeOutOfRange { max_attr: i32, natts: usize },
    #[error("attribute {attnum} (len {len}, by value: {by_val}) is not a fixed-width pass-by-value type")]
    UnsupportedAttribute { attnum: i32, len: i16, by_val: bool },
    #[error("expression uses an unsupported node: {0}")]
    UnsupportedExpression(String),
    #[error("primitive `{0}` is not available")]
    MissingPrimitive(String),
}

/// Errors that can occur when converting a textual predicate into an executor expression.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when parsing the expression string with evalexpr
    #[error("failed to parse expression")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when the root node does not have exactly one child
    #[error("expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant has a type that cannot be stored in a Datum
    #[error("unsupported constant: {0}")]
    ConstOperator(String),
    /// Error when a column name is not known
    #[error("column not found: {0}")]
    VariableNotFound(String),
    /// Error when the operands of a comparison disagree on their type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}
