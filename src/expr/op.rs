use cranelift::prelude::*;

use super::{ExprCodegenContext, ExprTreeGenerator, ExprTreeGeneratorInfo, GeneratedValue};
use crate::errors::Refusal;
use crate::executor::{ExprNode, OpKind};

/// Strict binary comparison: the primitive is copied into the session and called on
/// both arguments, and a null argument makes the result null.
#[derive(Debug, Clone, PartialEq)]
pub struct OpGenerator {
    op: OpKind,
    args: Vec<ExprTreeGenerator>,
}

impl OpGenerator {
    pub fn verify_and_create(op: OpKind, args: &[ExprNode], info: &mut ExprTreeGeneratorInfo) -> Option<Self> {
        if args.len() != 2 {
            tracing::debug!(op = %op.name(), args = args.len(), "operator is not binary");
            return None;
        }
        let args = args
            .iter()
            .map(|arg| ExprTreeGenerator::verify_and_create(arg, info))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { op, args })
    }

    pub fn op(&self) -> OpKind {
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
        let lhs = self.args[0].generate_code(ctx, b)?;
        let rhs = self.args[1].generate_code(ctx, b)?;

        let name = self.op.name();
        let primitive = ctx
            .primitives
            .and_then(|library| ctx.utils.insert_alien_function(library.module(), &name, true))
            .ok_or(Refusal::MissingPrimitive(name))?;
        let result = ctx.utils.call(b, primitive, &[lhs.value, rhs.value])[0];

        let isnull = b.ins().bor(lhs.isnull, rhs.isnull);
        let zero = ctx.utils.get_constant_i64(b, 0);
        Ok(GeneratedValue {
            value: b.ins().select(isnull, zero, result),
            isnull,
        })
    }
}
