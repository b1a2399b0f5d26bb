//! Precompiled comparison primitives.
//!
//! The library is a program module that is never compiled on its own. Expression
//! generators copy the operator they need into their session with
//! [`CodegenUtils::insert_alien_function`], which drags the shared three-way comparison
//! helper along.

use cranelift::prelude::*;

use crate::executor::{CmpOp, OpKind, OperandType};
use crate::types::{CmpHelperFn, PrimitiveFn};
use crate::utils::{CodegenUtils, FunctionId, ProgramModule};

const LIBRARY_NAME: &str = "primitives";

pub struct PrimitiveLibrary {
    module: ProgramModule,
}

impl PrimitiveLibrary {
    /// Builds the helpers and every `{int4,int8,float8}{eq,ne,lt,le,gt,ge}` wrapper.
    pub fn build() -> Option<Self> {
        let mut utils = CodegenUtils::new(LIBRARY_NAME);
        for ty in OperandType::ALL {
            let helper = build_cmp_helper(&mut utils, ty);
            for cmp in CmpOp::ALL {
                build_operator(&mut utils, OpKind::new(cmp, ty), helper);
            }
        }
        let module = utils.into_module()?;
        tracing::debug!(functions = module.defined_functions().len(), "built primitive library");
        Some(Self { module })
    }

    pub fn module(&self) -> &ProgramModule {
        &self.module
    }

    pub fn contains(&self, op: &OpKind) -> bool {
        self.module.function_id(&op.name()).is_some()
    }
}

impl std::fmt::Debug for PrimitiveLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveLibrary")
            .field("functions", &self.module.defined_functions())
            .finish()
    }
}

/// `-1`, `0` or `1` as `a` sorts before, with or after `b`.
fn build_cmp_helper(utils: &mut CodegenUtils, ty: OperandType) -> FunctionId {
    let mut handle = utils.create_function::<CmpHelperFn>(&ty.cmp_name());
    let mut fb_ctx = FunctionBuilderContext::new();
    let mut b = handle.builder(&mut fb_ctx);
    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    let a = b.block_params(entry)[0];
    let c = b.block_params(entry)[1];

    let (gt, lt) = match ty {
        OperandType::Int4 => {
            let a = b.ins().ireduce(types::I32, a);
            let c = b.ins().ireduce(types::I32, c);
            (
                b.ins().icmp(IntCC::SignedGreaterThan, a, c),
                b.ins().icmp(IntCC::SignedLessThan, a, c),
            )
        }
        OperandType::Int8 => (
            b.ins().icmp(IntCC::SignedGreaterThan, a, c),
            b.ins().icmp(IntCC::SignedLessThan, a, c),
        ),
        OperandType::Float8 => {
            let a = b.ins().bitcast(types::F64, MemFlags::new(), a);
            let c = b.ins().bitcast(types::F64, MemFlags::new(), c);
            let a_nan = b.ins().fcmp(FloatCC::Unordered, a, a);
            let c_nan = b.ins().fcmp(FloatCC::Unordered, c, c);
            // NaN sorts above every number and equal to itself
            let gt = b.ins().fcmp(FloatCC::GreaterThan, a, c);
            let lt = b.ins().fcmp(FloatCC::LessThan, a, c);
            let nan_gt = b.ins().band_not(a_nan, c_nan);
            let nan_lt = b.ins().band_not(c_nan, a_nan);
            (b.ins().bor(gt, nan_gt), b.ins().bor(lt, nan_lt))
        }
    };
    let gt = b.ins().uextend(types::I32, gt);
    let lt = b.ins().uextend(types::I32, lt);
    let ordering = b.ins().isub(gt, lt);
    b.ins().return_(&[ordering]);
    b.seal_all_blocks();
    b.finalize();
    utils.commit_function(handle)
}

fn build_operator(utils: &mut CodegenUtils, op: OpKind, helper: FunctionId) -> FunctionId {
    let mut handle = utils.create_function::<PrimitiveFn>(&op.name());
    let mut fb_ctx = FunctionBuilderContext::new();
    let mut b = handle.builder(&mut fb_ctx);
    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    let args = b.block_params(entry).to_vec();
    let ordering = utils.call(&mut b, helper, &args)[0];
    let cc = match op.cmp {
        CmpOp::Eq => IntCC::Equal,
        CmpOp::Ne => IntCC::NotEqual,
        CmpOp::Lt => IntCC::SignedLessThan,
        CmpOp::Le => IntCC::SignedLessThanOrEqual,
        CmpOp::Gt => IntCC::SignedGreaterThan,
        CmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
    };
    let holds = b.ins().icmp_imm(cc, ordering, 0);
    let result = b.ins().uextend(types::I64, holds);
    b.ins().return_(&[result]);
    b.seal_all_blocks();
    b.finalize();
    utils.commit_function(handle)
}
