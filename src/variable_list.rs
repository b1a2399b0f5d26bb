//! Projection of plain column references, specialized to one captured slot.
//!
//! The generated function deforms the slot through the shared deformation function of
//! the session and copies the requested attributes straight out of the slot's arrays.

use std::sync::Arc;

use cranelift::prelude::*;

use crate::deform::emit_slot_getsomeattrs;
use crate::diagnostics::{self, FallbackReason};
use crate::errors::Refusal;
use crate::executor::{
    exec_variable_list, FieldLayouts, ProjectionInfo, SlotSource, TupleTableSlot, VarTarget,
    LAYOUT_VERSION,
};
use crate::generator::{BaseCodegen, GenerationContext};
use crate::manager::SlotFingerprint;
use crate::types::{CallSite, Datum, ExecVariableListFn, ReportFallbackFn};
use crate::utils::FunctionId;

const VARIABLE_LIST_PREFIX: &str = "exec_variable_list";

/// Generator of an `exec_variable_list` replacement for one projection.
///
/// Every target must read the same source slot; the generated function deforms that
/// slot through the session's shared deformation function and copies the targets in
/// descending order. A call with a projection whose context holds a different slot is
/// handed to the regular `exec_variable_list`.
pub struct VariableListCodegen {
    base: BaseCodegen<ExecVariableListFn>,
    slot: usize,
    natts: usize,
    targets: Vec<VarTarget>,
}

impl VariableListCodegen {
    /// Creates a generator for `proj_info`, whose targets read `slot`.
    ///
    /// # Arguments
    /// * `id` - Session-unique counter that names the generated function
    /// * `call_site` - Where the projection operator calls `exec_variable_list` through
    /// * `proj_info` - The projection whose target list is captured
    /// * `slot` - The source slot, identified by address at run time
    pub(crate) fn new(
        id: u32,
        call_site: Arc<CallSite<ExecVariableListFn>>,
        proj_info: &ProjectionInfo,
        slot: &TupleTableSlot,
    ) -> Self {
        let mut base = BaseCodegen::new(VARIABLE_LIST_PREFIX, id, exec_variable_list as ExecVariableListFn);
        base.add_call_site(call_site);
        Self {
            base,
            slot: slot.addr(),
            natts: slot.natts(),
            targets: proj_info.targets().to_vec(),
        }
    }

    pub(crate) fn base(&self) -> &BaseCodegen<ExecVariableListFn> {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut BaseCodegen<ExecVariableListFn> {
        &mut self.base
    }

    pub fn targets(&self) -> &[VarTarget] {
        &self.targets
    }

    /// Generates and commits the projection function.
    ///
    /// # Returns
    /// `true` when a function was committed. `false` when the target list was refused:
    /// no targets, targets over several slots, system attributes or attributes past the
    /// slot's descriptor.
    pub(crate) fn generate_code(&mut self, ctx: &mut GenerationContext) -> bool {
        let generated = match self.generate_variable_list(ctx) {
            Ok(_) => {
                tracing::info!(
                    function = self.base.unique_func_name(),
                    targets = self.targets.len(),
                    "generated variable list projection"
                );
                true
            }
            Err(refusal) => {
                tracing::info!(
                    function = self.base.unique_func_name(),
                    reason = %refusal,
                    "variable list projection not generated"
                );
                false
            }
        };
        self.base.record_generation(generated)
    }

    /// The slot every target reads and the deformation prefix covering all of them.
    fn plan(&self, layouts: &FieldLayouts) -> Result<(SlotSource, SlotFingerprint), Refusal> {
        if layouts.version != LAYOUT_VERSION {
            return Err(Refusal::LayoutVersion {
                expected: LAYOUT_VERSION,
                found: layouts.version,
            });
        }
        let source = match self.targets.first() {
            None => return Err(Refusal::NoTargets),
            Some(first) if self.targets.iter().all(|t| t.source == first.source) => first.source,
            Some(_) => return Err(Refusal::MultipleSlots),
        };
        if let Some(system) = self.targets.iter().find(|t| t.attno <= 0) {
            return Err(Refusal::SystemAttribute(system.attno));
        }
        let max_attr = self.targets.iter().map(|t| t.attno).max().unwrap_or(0);
        if max_attr as usize > self.natts {
            return Err(Refusal::AttributeOutOfRange {
                max_attr,
                natts: self.natts,
            });
        }
        Ok((
            source,
            SlotFingerprint {
                slot: self.slot,
                max_attr,
            },
        ))
    }

    fn generate_variable_list(&self, ctx: &mut GenerationContext) -> Result<FunctionId, Refusal> {
        let (source, fingerprint) = self.plan(ctx.layouts)?;
        let layouts = ctx.layouts;
        let cache = &*ctx.cache;
        let utils = &mut *ctx.utils;

        let regular = utils.register_external_function(self.base.regular_func_pointer());
        let report = utils.register_external_function(diagnostics::report_fallback as ReportFallbackFn);

        let mut handle = utils.create_function::<ExecVariableListFn>(self.base.unique_func_name());
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut b = handle.builder(&mut fb_ctx);

        let entry = b.create_block();
        let main = b.create_block();
        let fallback = b.create_block();
        b.append_block_params_for_function_params(entry);

        b.switch_to_block(entry);
        let proj = b.block_params(entry)[0];
        let values_out = b.block_params(entry)[1];
        let isnull_out = b.block_params(entry)[2];
        let econtext = utils.load_member(&mut b, proj, layouts.projection.expr_context);
        let slot = utils.load_member(&mut b, econtext, layouts.expr_context.for_source(source));
        let captured = utils.get_constant_ptr(&mut b, self.slot);
        let same_slot = b.ins().icmp(IntCC::Equal, slot, captured);
        b.ins().brif(same_slot, main, &[], fallback, &[]);

        b.switch_to_block(main);
        emit_slot_getsomeattrs(utils, cache, &mut b, fingerprint, slot);
        let values = utils.load_member(&mut b, slot, layouts.slot.values);
        let isnull = utils.load_member(&mut b, slot, layouts.slot.isnull);
        let datum_size = std::mem::size_of::<Datum>() as i32;
        let mem = MemFlags::trusted();
        for (i, target) in self.targets.iter().enumerate().rev() {
            let column = target.attno - 1;
            let value = b.ins().load(types::I64, mem, values, column * datum_size);
            b.ins().store(mem, value, values_out, i as i32 * datum_size);
            let null = b.ins().load(types::I8, mem, isnull, column);
            b.ins().store(mem, null, isnull_out, i as i32);
        }
        b.ins().return_(&[]);

        b.switch_to_block(fallback);
        let id = utils.get_constant_i32(&mut b, self.base.id() as i32);
        let why = utils.get_constant_i32(&mut b, FallbackReason::SlotMismatch.code());
        utils.call(&mut b, report, &[id, why]);
        utils.call(&mut b, regular, &[proj, values_out, isnull_out]);
        b.ins().return_(&[]);

        b.seal_all_blocks();
        b.finalize();
        Ok(utils.commit_function(handle))
    }
}

impl std::fmt::Debug for VariableListCodegen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableListCodegen")
            .field("base", &self.base)
            .field("slot", &self.slot)
            .field("targets", &self.targets)
            .finish()
    }
}
