use cranelift::codegen::ir::{StackSlotData, StackSlotKind};
use cranelift::prelude::*;

use super::{ExprCodegenContext, ExprTreeGeneratorInfo, GeneratedValue};
use crate::errors::Refusal;
use crate::executor::SlotSource;
use crate::types::Datum;
use crate::utils::POINTER_TYPE;

/// A column reference.
///
/// Scan columns are read from the slot arrays the enclosing function has already
/// deformed. Inner and outer columns go through the regular `slot_getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarGenerator {
    source: SlotSource,
    attno: i32,
}

impl VarGenerator {
    pub fn verify_and_create(source: SlotSource, attno: i32, info: &mut ExprTreeGeneratorInfo) -> Option<Self> {
        if attno <= 0 {
            tracing::debug!(attno, "system attribute references are not generated");
            return None;
        }
        if source == SlotSource::Scan {
            match info.scan_natts {
                Some(natts) if attno as usize <= natts => info.max_attr = info.max_attr.max(attno),
                _ => {
                    tracing::debug!(attno, natts = ?info.scan_natts, "scan attribute outside the known slot");
                    return None;
                }
            }
        }
        Some(Self { source, attno })
    }

    pub fn source(&self) -> SlotSource {
        self.source
    }

    pub fn attno(&self) -> i32 {
        self.attno
    }

    pub(crate) fn generate_code(
        &self,
        ctx: &mut ExprCodegenContext,
        b: &mut FunctionBuilder,
    ) -> Result<GeneratedValue, Refusal> {
        let column = self.attno - 1;
        if self.source == SlotSource::Scan {
            let Some(scan) = ctx.scan else {
                return Err(Refusal::UnsupportedExpression(format!(
                    "scan attribute {} without a deformed scan slot",
                    self.attno
                )));
            };
            let mem = MemFlags::trusted();
            let value = b.ins().load(
                types::I64,
                mem,
                scan.values,
                column * std::mem::size_of::<Datum>() as i32,
            );
            let isnull = b.ins().load(types::I8, mem, scan.isnull, column);
            return Ok(GeneratedValue { value, isnull });
        }

        let getattr = ctx.slot_getattr();
        let field = ctx.layouts.expr_context.for_source(self.source);
        let slot = ctx.utils.load_member(b, ctx.econtext, field);
        let null_flag = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 1, 0));
        let null_addr = b.ins().stack_addr(POINTER_TYPE, null_flag, 0);
        let attno = ctx.utils.get_constant_i32(b, self.attno);
        let value = ctx.utils.call(b, getattr, &[slot, attno, null_addr])[0];
        let isnull = b.ins().stack_load(types::I8, null_flag, 0);
        Ok(GeneratedValue { value, isnull })
    }
}
