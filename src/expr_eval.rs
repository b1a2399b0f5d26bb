//! Expression evaluation specialized to one expression state.
//!
//! The generated function checks that it was called for the expression it was built
//! from (and, when the tree reads scan columns, with the captured scan slot), deforms
//! the scan slot once, and then evaluates the generator tree without branching.

use std::sync::Arc;

use cranelift::prelude::*;

use crate::deform::emit_slot_getsomeattrs;
use crate::diagnostics::{self, FallbackReason};
use crate::errors::Refusal;
use crate::executor::{exec_eval_expr, ExprState, LAYOUT_VERSION};
use crate::expr::{ExprCodegenContext, ExprTreeGenerator, ScanColumns};
use crate::generator::{BaseCodegen, GenerationContext};
use crate::manager::SlotFingerprint;
use crate::types::{CallSite, ExecEvalExprFn, ReportFallbackFn};
use crate::utils::FunctionId;

const EXPR_EVAL_PREFIX: &str = "exec_eval_expr";

/// Generator of an `exec_eval_expr` replacement for one expression state.
///
/// The expression tree was verified when the call site was enrolled, so generation only
/// fails on a layout version mismatch or a missing primitive. `scan_deform` names the
/// shared deformation the tree's scan column references need, if any.
pub struct ExprEvalCodegen {
    base: BaseCodegen<ExecEvalExprFn>,
    expr_state: usize,
    expr: String,
    tree: ExprTreeGenerator,
    scan_deform: Option<SlotFingerprint>,
}

impl ExprEvalCodegen {
    /// Creates a generator for `expr_state` evaluated through `tree`.
    ///
    /// # Arguments
    /// * `id` - Session-unique counter that names the generated function
    /// * `call_site` - Where the operator calls `exec_eval_expr` through
    /// * `expr_state` - The state the generated function is specialized to
    /// * `tree` - Verified generator tree for the state's expression
    /// * `scan_deform` - Slot and prefix to deform before evaluating scan references
    pub(crate) fn new(
        id: u32,
        call_site: Arc<CallSite<ExecEvalExprFn>>,
        expr_state: &ExprState,
        tree: ExprTreeGenerator,
        scan_deform: Option<SlotFingerprint>,
    ) -> Self {
        let mut base = BaseCodegen::new(EXPR_EVAL_PREFIX, id, exec_eval_expr as ExecEvalExprFn);
        base.add_call_site(call_site);
        Self {
            base,
            expr_state: expr_state.addr(),
            expr: expr_state.node().to_string(),
            tree,
            scan_deform,
        }
    }

    pub(crate) fn base(&self) -> &BaseCodegen<ExecEvalExprFn> {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut BaseCodegen<ExecEvalExprFn> {
        &mut self.base
    }

    pub fn tree(&self) -> &ExprTreeGenerator {
        &self.tree
    }

    pub(crate) fn uses_operators(&self) -> bool {
        self.tree.uses_operators()
    }

    /// Generates and commits the evaluation function.
    ///
    /// # Returns
    /// `true` when a function was committed. `false` when the tree could not be emitted;
    /// the partially built function is discarded in that case.
    pub(crate) fn generate_code(&mut self, ctx: &mut GenerationContext) -> bool {
        let generated = match self.generate_expr_eval(ctx) {
            Ok(_) => {
                tracing::info!(
                    function = self.base.unique_func_name(),
                    expr = %self.expr,
                    "generated expression evaluation"
                );
                true
            }
            Err(refusal) => {
                tracing::info!(
                    function = self.base.unique_func_name(),
                    expr = %self.expr,
                    reason = %refusal,
                    "expression evaluation not generated"
                );
                false
            }
        };
        self.base.record_generation(generated)
    }

    fn generate_expr_eval(&self, ctx: &mut GenerationContext) -> Result<FunctionId, Refusal> {
        if ctx.layouts.version != LAYOUT_VERSION {
            return Err(Refusal::LayoutVersion {
                expected: LAYOUT_VERSION,
                found: ctx.layouts.version,
            });
        }
        self.tree.check_primitives(ctx.primitives)?;

        let layouts = ctx.layouts;
        let cache = &*ctx.cache;
        let utils = &mut *ctx.utils;
        let regular = utils.register_external_function(self.base.regular_func_pointer());
        let report = utils.register_external_function(diagnostics::report_fallback as ReportFallbackFn);

        let mut handle = utils.create_function::<ExecEvalExprFn>(self.base.unique_func_name());
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut b = handle.builder(&mut fb_ctx);

        let entry = b.create_block();
        let body = b.create_block();
        let fallback = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.append_block_param(fallback, types::I32);

        b.switch_to_block(entry);
        let state = b.block_params(entry)[0];
        let econtext = b.block_params(entry)[1];
        let isnull_out = b.block_params(entry)[2];
        let captured = utils.get_constant_ptr(&mut b, self.expr_state);
        let same_state = b.ins().icmp(IntCC::Equal, state, captured);
        let why = utils.get_constant_i32(&mut b, FallbackReason::ExprStateMismatch.code());

        let scan = match self.scan_deform {
            Some(fingerprint) => {
                let check_scan = b.create_block();
                b.ins().brif(same_state, check_scan, &[], fallback, &[why.into()]);

                b.switch_to_block(check_scan);
                let slot = utils.load_member(&mut b, econtext, layouts.expr_context.scan_tuple);
                let captured = utils.get_constant_ptr(&mut b, fingerprint.slot);
                let same_slot = b.ins().icmp(IntCC::Equal, slot, captured);
                let why = utils.get_constant_i32(&mut b, FallbackReason::SlotMismatch.code());
                b.ins().brif(same_slot, body, &[], fallback, &[why.into()]);

                b.switch_to_block(body);
                emit_slot_getsomeattrs(utils, cache, &mut b, fingerprint, slot);
                Some(ScanColumns {
                    values: utils.load_member(&mut b, slot, layouts.slot.values),
                    isnull: utils.load_member(&mut b, slot, layouts.slot.isnull),
                })
            }
            None => {
                b.ins().brif(same_state, body, &[], fallback, &[why.into()]);
                b.switch_to_block(body);
                None
            }
        };

        let mut expr_ctx = ExprCodegenContext::new(&mut *utils, ctx.primitives, layouts, econtext);
        expr_ctx.scan = scan;
        let result = match self.tree.generate_code(&mut expr_ctx, &mut b) {
            Ok(result) => result,
            Err(refusal) => {
                drop(b);
                utils.discard_function(handle);
                return Err(refusal);
            }
        };
        b.ins().store(MemFlags::trusted(), result.isnull, isnull_out, 0);
        b.ins().return_(&[result.value]);

        b.switch_to_block(fallback);
        let why = b.block_params(fallback)[0];
        let id = utils.get_constant_i32(&mut b, self.base.id() as i32);
        utils.call(&mut b, report, &[id, why]);
        let value = utils.call(&mut b, regular, &[state, econtext, isnull_out])[0];
        b.ins().return_(&[value]);

        b.seal_all_blocks();
        b.finalize();
        Ok(utils.commit_function(handle))
    }
}

impl std::fmt::Debug for ExprEvalCodegen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprEvalCodegen")
            .field("base", &self.base)
            .field("expr", &self.expr)
            .field("scan_deform", &self.scan_deform)
            .finish()
    }
}
