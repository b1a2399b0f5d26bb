//! Tuple deformation specialized to one slot and one attribute prefix.
//!
//! The generated function replaces `slot_getsomeattrs` for a captured slot. Everything
//! that was known when the function was generated (attribute widths, alignments and
//! therefore byte offsets) is baked into straight-line code. Everything that can change
//! per row is checked first, and any failed check hands the call to the regular
//! implementation:
//!
//! ```text
//! entry          slot == captured && 0 < attnum <= max_attr
//! representation not virtual, no in-memory tuple
//! materialized   heap row present
//! null bitmap    row has no nulls
//! main           count = min(row natts, max_attr); switch(count)
//!   land_k       record offset after k attributes, enter extract_{k-1}
//!   extract_i    load attribute i, store value and not-null, fall to extract_{i-1}
//! tail           zero/null-fill count..max_attr, nvalid = max_attr, mark virtual
//! fallback       report reason, call the regular implementation
//! ```

use std::sync::Arc;

use cranelift::frontend::Switch;
use cranelift::prelude::*;

use crate::diagnostics::{self, FallbackReason};
use crate::errors::Refusal;
use crate::executor::tuple::align_offset;
use crate::executor::{
    slot_getsomeattrs, FieldLayouts, TupleDesc, TupleTableSlot, HEAP_HASNULL, HEAP_NATTS_MASK,
    LAYOUT_VERSION, TTS_VIRTUAL,
};
use crate::generator::{BaseCodegen, GenerationContext};
use crate::manager::{GeneratorCache, SlotFingerprint};
use crate::types::{CallSite, Datum, FillBytesFn, ReportFallbackFn, SlotGetSomeAttrsFn};
use crate::utils::{CodegenUtils, FunctionId, POINTER_TYPE};

const SLOT_DEFORM_PREFIX: &str = "slot_deform_tuple";

/// Where attribute `i` lives in a row without nulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttrExtract {
    offset: i32,
    len: i16,
}

impl AttrExtract {
    fn end(&self) -> i64 {
        self.offset as i64 + self.len as i64
    }
}

/// Generator of a deformation function for one slot and one attribute prefix.
///
/// Call sites requesting the same [`SlotFingerprint`] share one instance through the
/// manager's cache, so the function is generated once per session. Dependent generators
/// reach it through [`emit_slot_getsomeattrs`].
pub struct SlotDeformCodegen {
    base: BaseCodegen<SlotGetSomeAttrsFn>,
    fingerprint: SlotFingerprint,
    desc: Arc<TupleDesc>,
}

impl SlotDeformCodegen {
    /// Creates a generator for `slot` deforming attributes `1..=max_attr`.
    ///
    /// # Arguments
    /// * `id` - Session-unique counter that names the generated function
    /// * `slot` - The slot whose address and descriptor are captured
    /// * `max_attr` - Number of leading attributes the function makes valid
    pub(crate) fn new(id: u32, slot: &TupleTableSlot, max_attr: i32) -> Self {
        Self {
            base: BaseCodegen::new(SLOT_DEFORM_PREFIX, id, slot_getsomeattrs as SlotGetSomeAttrsFn),
            fingerprint: SlotFingerprint {
                slot: slot.addr(),
                max_attr,
            },
            desc: slot.shared_desc(),
        }
    }

    /// The captured slot address and attribute prefix.
    pub fn fingerprint(&self) -> SlotFingerprint {
        self.fingerprint
    }

    pub fn max_attr(&self) -> i32 {
        self.fingerprint.max_attr
    }

    pub(crate) fn base(&self) -> &BaseCodegen<SlotGetSomeAttrsFn> {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut BaseCodegen<SlotGetSomeAttrsFn> {
        &mut self.base
    }

    pub(crate) fn add_call_site(&mut self, call_site: Arc<CallSite<SlotGetSomeAttrsFn>>) {
        self.base.add_call_site(call_site);
    }

    /// Generates and commits the deformation function.
    ///
    /// On success the committed function is recorded in the cache so dependent generators
    /// call it directly.
    ///
    /// # Returns
    /// `true` when a function was committed. `false` when the captured shape was refused
    /// (layout version, attribute range or an attribute that is not a fixed-width
    /// by-value type); nothing is left in the module in that case.
    pub(crate) fn generate_code(&mut self, ctx: &mut GenerationContext) -> bool {
        let generated = match self.generate_slot_deform(ctx) {
            Ok(function) => {
                ctx.cache.mark_generated(self.fingerprint, function);
                tracing::info!(
                    function = self.base.unique_func_name(),
                    max_attr = self.fingerprint.max_attr,
                    "generated slot deformation"
                );
                true
            }
            Err(refusal) => {
                tracing::info!(
                    function = self.base.unique_func_name(),
                    reason = %refusal,
                    "slot deformation not generated"
                );
                false
            }
        };
        self.base.record_generation(generated)
    }

    /// Checks that the captured shape can be specialized and computes attribute offsets.
    fn plan(&self, layouts: &FieldLayouts) -> Result<Vec<AttrExtract>, Refusal> {
        if layouts.version != LAYOUT_VERSION {
            return Err(Refusal::LayoutVersion {
                expected: LAYOUT_VERSION,
                found: layouts.version,
            });
        }
        let max_attr = self.fingerprint.max_attr;
        if max_attr <= 0 {
            return Err(Refusal::SystemAttribute(max_attr));
        }
        if max_attr as usize > self.desc.natts() {
            return Err(Refusal::AttributeOutOfRange {
                max_attr,
                natts: self.desc.natts(),
            });
        }

        let mut off = 0usize;
        let mut plan = Vec::with_capacity(max_attr as usize);
        for (i, attr) in self.desc.attrs()[..max_attr as usize].iter().enumerate() {
            if !attr.is_fixed_by_val() {
                return Err(Refusal::UnsupportedAttribute {
                    attnum: i as i32 + 1,
                    len: attr.len,
                    by_val: attr.by_val,
                });
            }
            off = align_offset(off, attr.align);
            plan.push(AttrExtract {
                offset: off as i32,
                len: attr.len,
            });
            off += attr.len as usize;
        }
        Ok(plan)
    }

    fn generate_slot_deform(&self, ctx: &mut GenerationContext) -> Result<FunctionId, Refusal> {
        let plan = self.plan(ctx.layouts)?;
        let layouts = ctx.layouts;
        let utils = &mut *ctx.utils;

        let hooks = Hooks {
            regular: utils.register_external_function(self.base.regular_func_pointer()),
            report: utils.register_external_function(diagnostics::report_fallback as ReportFallbackFn),
            fill: utils.register_external_function(diagnostics::fill_bytes as FillBytesFn),
        };

        let mut handle = utils.create_function::<SlotGetSomeAttrsFn>(self.base.unique_func_name());
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut builder = handle.builder(&mut fb_ctx);
        self.emit_body(utils, layouts, &mut builder, &plan, &hooks);
        builder.seal_all_blocks();
        builder.finalize();
        Ok(utils.commit_function(handle))
    }

    fn emit_body(
        &self,
        utils: &CodegenUtils,
        layouts: &FieldLayouts,
        b: &mut FunctionBuilder,
        plan: &[AttrExtract],
        hooks: &Hooks,
    ) {
        let max_attr = self.fingerprint.max_attr;
        let slot_fields = layouts.slot;
        let header = layouts.tuple_header;

        let entry = b.create_block();
        let representation = b.create_block();
        let materialized = b.create_block();
        let null_bitmap = b.create_block();
        let main = b.create_block();
        let tail = b.create_block();
        let fallback = b.create_block();
        let landings: Vec<Block> = (0..=plan.len()).map(|_| b.create_block()).collect();
        let extracts: Vec<Block> = (0..plan.len()).map(|_| b.create_block()).collect();

        b.append_block_params_for_function_params(entry);
        b.append_block_param(fallback, types::I32);

        // entry: identity and request range
        b.switch_to_block(entry);
        let slot = b.block_params(entry)[0];
        let attnum = b.block_params(entry)[1];
        let captured = utils.get_constant_ptr(b, self.fingerprint.slot);
        let same_slot = b.ins().icmp(IntCC::Equal, slot, captured);
        let below_max = b
            .ins()
            .icmp_imm(IntCC::SignedLessThanOrEqual, attnum, max_attr as i64);
        let positive = b.ins().icmp_imm(IntCC::SignedGreaterThan, attnum, 0);
        let in_range = b.ins().band(below_max, positive);
        let out_of_range = reason(utils, b, FallbackReason::AttnumOutOfRange);
        let mismatch = reason(utils, b, FallbackReason::SlotMismatch);
        let why = b.ins().select(same_slot, out_of_range, mismatch);
        let ok = b.ins().band(same_slot, in_range);
        b.ins().brif(ok, representation, &[], fallback, &[why.into()]);

        // representation: neither virtual nor an in-memory tuple
        b.switch_to_block(representation);
        let flags = utils.load_member(b, slot, slot_fields.flags);
        let virtual_bit = b.ins().band_imm(flags, TTS_VIRTUAL as i64);
        let is_virtual = b.ins().icmp_imm(IntCC::NotEqual, virtual_bit, 0);
        let mem_tuple = utils.load_member(b, slot, slot_fields.mem_tuple);
        let has_mem = b.ins().icmp_imm(IntCC::NotEqual, mem_tuple, 0);
        let unusable = b.ins().bor(is_virtual, has_mem);
        let why = reason(utils, b, FallbackReason::VirtualOrMemTuple);
        b.ins()
            .brif(unusable, fallback, &[why.into()], materialized, &[]);

        // materialized: a heap row is attached
        b.switch_to_block(materialized);
        let row = utils.load_member(b, slot, slot_fields.heap_tuple);
        let why = reason(utils, b, FallbackReason::NotMaterialized);
        b.ins().brif(row, null_bitmap, &[], fallback, &[why.into()]);

        // null bitmap: only rows without nulls have fixed offsets
        b.switch_to_block(null_bitmap);
        let infomask = utils.load_member(b, row, header.infomask);
        let has_nulls = b.ins().band_imm(infomask, HEAP_HASNULL as i64);
        let why = reason(utils, b, FallbackReason::HasNulls);
        b.ins().brif(has_nulls, fallback, &[why.into()], main, &[]);

        // main: clamp to the attributes stored in the row and dispatch
        b.switch_to_block(main);
        let raw_natts = utils.load_member(b, row, header.natts);
        let natts = b.ins().band_imm(raw_natts, HEAP_NATTS_MASK as i64);
        let natts = b.ins().uextend(types::I32, natts);
        let max = utils.get_constant_i32(b, max_attr);
        let count = b.ins().umin(natts, max);
        let hoff = utils.load_member(b, row, header.hoff);
        let hoff = b.ins().uextend(POINTER_TYPE, hoff);
        let data = b.ins().iadd(row, hoff);
        let values = utils.load_member(b, slot, slot_fields.values);
        let isnull = utils.load_member(b, slot, slot_fields.isnull);

        let mut switch = Switch::new();
        for (k, landing) in landings.iter().enumerate().skip(1) {
            switch.set_entry(k as u128, *landing);
        }
        switch.emit(b, count, landings[0]);

        for (k, landing) in landings.iter().enumerate() {
            b.switch_to_block(*landing);
            let off = if k == 0 { 0 } else { plan[k - 1].end() };
            let off = utils.get_constant_i64(b, off);
            utils.store_member(b, slot, slot_fields.off, off);
            let next = if k == 0 { tail } else { extracts[k - 1] };
            b.ins().jump(next, &[]);
        }

        let datum_size = std::mem::size_of::<Datum>() as i32;
        for (i, attr) in plan.iter().enumerate() {
            b.switch_to_block(extracts[i]);
            let mem = MemFlags::trusted();
            let value = match attr.len {
                1 => b.ins().sload8(types::I64, mem, data, attr.offset),
                2 => b.ins().sload16(types::I64, mem, data, attr.offset),
                4 => b.ins().sload32(mem, data, attr.offset),
                _ => b.ins().load(types::I64, mem, data, attr.offset),
            };
            b.ins().store(mem, value, values, i as i32 * datum_size);
            let not_null = utils.get_constant_bool(b, false);
            b.ins().store(mem, not_null, isnull, i as i32);
            let next = if i == 0 { tail } else { extracts[i - 1] };
            b.ins().jump(next, &[]);
        }

        // tail: attributes missing from the row read as null
        b.switch_to_block(tail);
        let remaining = b.ins().isub(max, count);
        let remaining = b.ins().uextend(types::I64, remaining);
        let count = b.ins().uextend(POINTER_TYPE, count);
        let value_offset = b.ins().ishl_imm(count, datum_size.trailing_zeros() as i64);
        let values_tail = b.ins().iadd(values, value_offset);
        let value_bytes = b.ins().ishl_imm(remaining, datum_size.trailing_zeros() as i64);
        let zero = utils.get_constant_i32(b, 0);
        utils.call(b, hooks.fill, &[values_tail, zero, value_bytes]);
        let isnull_tail = b.ins().iadd(isnull, count);
        let one = utils.get_constant_i32(b, 1);
        utils.call(b, hooks.fill, &[isnull_tail, one, remaining]);
        utils.store_member(b, slot, slot_fields.nvalid, max);
        let flags = b.ins().bor_imm(flags, TTS_VIRTUAL as i64);
        utils.store_member(b, slot, slot_fields.flags, flags);
        b.ins().return_(&[]);

        b.switch_to_block(fallback);
        let why = b.block_params(fallback)[0];
        let id = utils.get_constant_i32(b, self.base.id() as i32);
        utils.call(b, hooks.report, &[id, why]);
        utils.call(b, hooks.regular, &[slot, attnum]);
        b.ins().return_(&[]);
    }
}

struct Hooks {
    regular: FunctionId,
    report: FunctionId,
    fill: FunctionId,
}

fn reason(utils: &CodegenUtils, b: &mut FunctionBuilder, reason: FallbackReason) -> Value {
    utils.get_constant_i32(b, reason.code())
}

/// Emits a call making `fingerprint.max_attr` attributes of `slot` valid.
///
/// The call goes to the shared deformation function when the cache holds a committed
/// one for `fingerprint`, else to the registered regular `slot_getsomeattrs`.
///
/// # Arguments
/// * `utils` - Backend wrapper of the function being built
/// * `cache` - The session cache, consulted after the shared generator ran
/// * `b` - Builder positioned where the call belongs
/// * `fingerprint` - Slot and prefix to deform
/// * `slot` - IR value holding the slot pointer at run time
pub(crate) fn emit_slot_getsomeattrs(
    utils: &mut CodegenUtils,
    cache: &GeneratorCache,
    b: &mut FunctionBuilder,
    fingerprint: SlotFingerprint,
    slot: Value,
) {
    let callee = match cache.generated_function(&fingerprint) {
        Some(function) => function,
        None => utils.register_external_function(slot_getsomeattrs as SlotGetSomeAttrsFn),
    };
    let attnum = utils.get_constant_i32(b, fingerprint.max_attr);
    utils.call(b, callee, &[slot, attnum]);
}

impl std::fmt::Debug for SlotDeformCodegen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotDeformCodegen")
            .field("base", &self.base)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}
