//! The generator abstraction: one specializable call site, its regular fallback, and the
//! state machine taking it from "not generated" to "published".

use std::fmt;
use std::sync::Arc;

use colored::Colorize;

use crate::deform::SlotDeformCodegen;
use crate::executor::FieldLayouts;
use crate::expr_eval::ExprEvalCodegen;
use crate::manager::GeneratorCache;
use crate::primitives::PrimitiveLibrary;
use crate::types::{CallSite, CodegenFn};
use crate::utils::CodegenUtils;
use crate::variable_list::VariableListCodegen;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GenerationState {
    #[default]
    NotGenerated,
    /// The function body is committed to the module.
    Generated,
    /// The compiled function is installed in every call site.
    Published,
}

/// Everything a generator may touch while it produces its function.
pub struct GenerationContext<'a> {
    pub(crate) utils: &'a mut CodegenUtils,
    pub(crate) cache: &'a mut GeneratorCache,
    pub(crate) primitives: Option<&'a PrimitiveLibrary>,
    pub(crate) layouts: &'a FieldLayouts,
}

/// State shared by every concrete generator.
pub struct BaseCodegen<F: CodegenFn> {
    id: u32,
    func_name: String,
    regular_func: F,
    call_sites: Vec<Arc<CallSite<F>>>,
    state: GenerationState,
    attempted: bool,
}

impl<F: CodegenFn> BaseCodegen<F> {
    pub(crate) fn new(prefix: &str, id: u32, regular_func: F) -> Self {
        Self {
            id,
            func_name: format!("{prefix}_{id}"),
            regular_func,
            call_sites: Vec::new(),
            state: GenerationState::NotGenerated,
            attempted: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn unique_func_name(&self) -> &str {
        &self.func_name
    }

    pub fn regular_func_pointer(&self) -> F {
        self.regular_func
    }

    pub fn call_sites(&self) -> &[Arc<CallSite<F>>] {
        &self.call_sites
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn is_generated(&self) -> bool {
        self.state != GenerationState::NotGenerated
    }

    pub(crate) fn add_call_site(&mut self, call_site: Arc<CallSite<F>>) {
        assert_eq!(
            self.state,
            GenerationState::NotGenerated,
            "call site attached to `{}` after generation",
            self.func_name
        );
        self.call_sites.push(call_site);
    }

    /// Marks the start of the single generation attempt, before any IR is built.
    pub(crate) fn begin_generation(&mut self) {
        assert!(!self.attempted, "`{}` may be generated at most once", self.func_name);
        self.attempted = true;
    }

    /// Records the outcome of the generation attempt.
    pub(crate) fn record_generation(&mut self, generated: bool) -> bool {
        debug_assert!(self.attempted, "`{}` finished generation without starting it", self.func_name);
        if generated {
            self.state = GenerationState::Generated;
        }
        generated
    }

    /// Looks up the compiled function and installs it in every call site.
    pub(crate) fn set_to_generated(&mut self, utils: &CodegenUtils) -> bool {
        if self.state != GenerationState::Generated {
            return false;
        }
        let Some(compiled) = utils.get_function_pointer::<F>(&self.func_name) else {
            tracing::warn!(function = %self.func_name, "compiled function not found");
            return false;
        };
        for call_site in &self.call_sites {
            call_site.set(compiled);
        }
        self.state = GenerationState::Published;
        true
    }

    /// Points every call site back at the regular implementation.
    pub(crate) fn restore_call_sites(&mut self) {
        if self.state == GenerationState::Published {
            for call_site in &self.call_sites {
                call_site.set(self.regular_func);
            }
            self.state = GenerationState::Generated;
        }
    }
}

impl<F: CodegenFn> fmt::Debug for BaseCodegen<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseCodegen")
            .field("func_name", &self.func_name)
            .field("call_sites", &self.call_sites.len())
            .field("state", &self.state)
            .finish()
    }
}

/// The closed set of generator kinds a manager can hold.
#[derive(Debug)]
pub enum Generator {
    SlotDeform(SlotDeformCodegen),
    VariableList(VariableListCodegen),
    ExprEval(ExprEvalCodegen),
}

impl Generator {
    /// Produces and commits the specialized function. `false` means nothing was
    /// committed and the call sites keep their regular implementation.
    ///
    /// # Panics
    ///
    /// Panics when the generator was already asked to generate.
    pub fn generate_code(&mut self, ctx: &mut GenerationContext) -> bool {
        match self {
            Generator::SlotDeform(g) => {
                g.base_mut().begin_generation();
                g.generate_code(ctx)
            }
            Generator::VariableList(g) => {
                g.base_mut().begin_generation();
                g.generate_code(ctx)
            }
            Generator::ExprEval(g) => {
                g.base_mut().begin_generation();
                g.generate_code(ctx)
            }
        }
    }

    pub fn set_to_generated(&mut self, utils: &CodegenUtils) -> bool {
        match self {
            Generator::SlotDeform(g) => g.base_mut().set_to_generated(utils),
            Generator::VariableList(g) => g.base_mut().set_to_generated(utils),
            Generator::ExprEval(g) => g.base_mut().set_to_generated(utils),
        }
    }

    pub(crate) fn restore_call_sites(&mut self) {
        match self {
            Generator::SlotDeform(g) => g.base_mut().restore_call_sites(),
            Generator::VariableList(g) => g.base_mut().restore_call_sites(),
            Generator::ExprEval(g) => g.base_mut().restore_call_sites(),
        }
    }

    pub fn is_generated(&self) -> bool {
        self.state() != GenerationState::NotGenerated
    }

    pub fn state(&self) -> GenerationState {
        match self {
            Generator::SlotDeform(g) => g.base().state(),
            Generator::VariableList(g) => g.base().state(),
            Generator::ExprEval(g) => g.base().state(),
        }
    }

    pub fn unique_func_name(&self) -> &str {
        match self {
            Generator::SlotDeform(g) => g.base().unique_func_name(),
            Generator::VariableList(g) => g.base().unique_func_name(),
            Generator::ExprEval(g) => g.base().unique_func_name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Generator::SlotDeform(_) => "slot_deform",
            Generator::VariableList(_) => "variable_list",
            Generator::ExprEval(_) => "expr_eval",
        }
    }

    pub(crate) fn needs_primitives(&self) -> bool {
        matches!(self, Generator::ExprEval(g) if g.uses_operators())
    }
}

impl fmt::Display for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state() {
            GenerationState::NotGenerated => "not generated".red(),
            GenerationState::Generated => "generated".yellow(),
            GenerationState::Published => "published".green(),
        };
        write!(f, "{} {} [{}]", self.kind().bold(), self.unique_func_name(), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{slot_getsomeattrs, TupleTableSlot};
    use crate::types::SlotGetSomeAttrsFn;

    unsafe extern "C" fn noop(_: *mut TupleTableSlot, _: i32) {}

    #[test]
    fn test_unique_name() {
        let base = BaseCodegen::new("slot_deform_tuple", 3, slot_getsomeattrs as SlotGetSomeAttrsFn);
        assert_eq!(base.unique_func_name(), "slot_deform_tuple_3");
        assert_eq!(base.state(), GenerationState::NotGenerated);
        assert!(!base.is_generated());
    }

    #[test]
    fn test_record_generation() {
        let mut base = BaseCodegen::new("f", 0, noop as SlotGetSomeAttrsFn);
        base.begin_generation();
        assert!(!base.record_generation(false));
        assert_eq!(base.state(), GenerationState::NotGenerated);

        let mut base = BaseCodegen::new("f", 1, noop as SlotGetSomeAttrsFn);
        base.begin_generation();
        assert!(base.record_generation(true));
        assert!(base.is_generated());
    }

    #[test]
    #[should_panic(expected = "at most once")]
    fn test_generate_twice() {
        let mut base = BaseCodegen::new("f", 0, noop as SlotGetSomeAttrsFn);
        base.begin_generation();
        base.record_generation(false);
        base.begin_generation();
    }

    #[test]
    fn test_set_to_generated_requires_generation() {
        let mut base = BaseCodegen::new("f", 0, noop as SlotGetSomeAttrsFn);
        let site = CallSite::new(noop as SlotGetSomeAttrsFn);
        base.add_call_site(Arc::clone(&site));
        let utils = CodegenUtils::new("test");
        assert!(!base.set_to_generated(&utils));
        assert!(site.points_to(noop));
    }
}
