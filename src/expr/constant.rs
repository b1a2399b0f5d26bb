use cranelift::prelude::*;

use super::{ExprCodegenContext, GeneratedValue};
use crate::types::Datum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstGenerator {
    value: Datum,
    isnull: bool,
}

impl ConstGenerator {
    pub fn new(value: Datum, isnull: bool) -> Self {
        Self { value, isnull }
    }

    pub(crate) fn generate_code(&self, ctx: &mut ExprCodegenContext, b: &mut FunctionBuilder) -> GeneratedValue {
        // a null constant carries a zero datum
        let value = if self.isnull { 0 } else { self.value as i64 };
        GeneratedValue {
            value: ctx.utils.get_constant_i64(b, value),
            isnull: ctx.utils.get_constant_bool(b, self.isnull),
        }
    }
}
