use cranelift::prelude::*;

use super::{ExprCodegenContext, ExprTreeGenerator, ExprTreeGeneratorInfo, GeneratedValue};
use crate::errors::Refusal;
use crate::executor::{BoolOp, ExprNode};

/// `AND` / `OR` over any number of arguments, with SQL null semantics.
///
/// Every argument is evaluated; there is no short circuit. With `t` the truth of a
/// non-null argument and `n` its null flag:
///
/// ```text
/// AND  acc = all(t | n)    isnull = any(n) & acc     value = acc & !any(n)
/// OR   acc = any(t & !n)   isnull = any(n) & !acc    value = acc
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BoolGenerator {
    op: BoolOp,
    args: Vec<ExprTreeGenerator>,
}

impl BoolGenerator {
    pub fn verify_and_create(op: BoolOp, args: &[ExprNode], info: &mut ExprTreeGeneratorInfo) -> Option<Self> {
        if args.is_empty() {
            tracing::debug!(op = ?op, "boolean expression without arguments");
            return None;
        }
        let args = args
            .iter()
            .map(|arg| ExprTreeGenerator::verify_and_create(arg, info))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { op, args })
    }

    pub fn op(&self) -> BoolOp {
        self.op
    }

    pub fn args(&self) -> &[ExprTreeGenerator] {
        &self.args
    }

    pub(crate) fn generate_code(
        &self,
        ctx: &mut ExprCodegenContext,
        b: &mut FunctionBuilder,
    ) -> Result<GeneratedValue, Refusal> {
        let is_and = self.op == BoolOp::And;
        let mut acc = ctx.utils.get_constant_bool(b, is_and);
        let mut any_null = ctx.utils.get_constant_bool(b, false);

        for arg in &self.args {
            let arg = arg.generate_code(ctx, b)?;
            let truth = b.ins().icmp_imm(IntCC::NotEqual, arg.value, 0);
            acc = if is_and {
                let passes = b.ins().bor(truth, arg.isnull);
                b.ins().band(acc, passes)
            } else {
                let decides = b.ins().band_not(truth, arg.isnull);
                b.ins().bor(acc, decides)
            };
            any_null = b.ins().bor(any_null, arg.isnull);
        }

        let (value, isnull) = if is_and {
            (b.ins().band_not(acc, any_null), b.ins().band(any_null, acc))
        } else {
            (acc, b.ins().band_not(any_null, acc))
        };
        Ok(GeneratedValue {
            value: b.ins().uextend(types::I64, value),
            isnull,
        })
    }
}
