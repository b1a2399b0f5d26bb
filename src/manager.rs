//! The generator manager: one per code generation session.
//!
//! Operators enroll their call sites while the plan is being set up. The manager then
//! runs every generator once ([`CodegenManager::generate_code`]), compiles the whole
//! module in a single step and installs the compiled functions
//! ([`CodegenManager::prepare_generated_functions`]). Tuple deformation requests are
//! shared through a cache keyed by slot and attribute prefix, so each distinct shape is
//! generated once no matter how many call sites ask for it.

use std::fmt;
use std::sync::Arc;

use colored::Colorize;
use itertools::Itertools;
use rustc_hash::FxHashMap;

use crate::deform::SlotDeformCodegen;
use crate::executor::{ExprState, FieldLayouts, ProjectionInfo, TupleTableSlot};
use crate::expr::{ExprTreeGenerator, ExprTreeGeneratorInfo};
use crate::expr_eval::ExprEvalCodegen;
use crate::generator::{GenerationContext, GenerationState, Generator};
use crate::primitives::PrimitiveLibrary;
use crate::types::{CallSite, ExecEvalExprFn, ExecVariableListFn, SlotGetSomeAttrsFn};
use crate::utils::{CodegenOptions, CodegenUtils, FunctionId};
use crate::variable_list::VariableListCodegen;

/// Identifies a deformation shape: the captured slot and the attribute prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotFingerprint {
    /// Address of the slot.
    pub slot: usize,
    pub max_attr: i32,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    generator: usize,
    function: Option<FunctionId>,
}

/// Deformation generators by fingerprint. Entries live as long as the session.
#[derive(Debug, Default)]
pub struct GeneratorCache {
    entries: FxHashMap<SlotFingerprint, CacheEntry>,
}

impl GeneratorCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the manager's generator for this fingerprint.
    pub fn generator_index(&self, fingerprint: &SlotFingerprint) -> Option<usize> {
        self.entries.get(fingerprint).map(|e| e.generator)
    }

    /// The committed deformation function for this fingerprint, once generated.
    pub fn generated_function(&self, fingerprint: &SlotFingerprint) -> Option<FunctionId> {
        self.entries.get(fingerprint).and_then(|e| e.function)
    }

    fn insert(&mut self, fingerprint: SlotFingerprint, generator: usize) {
        self.entries.insert(
            fingerprint,
            CacheEntry {
                generator,
                function: None,
            },
        );
    }

    pub(crate) fn mark_generated(&mut self, fingerprint: SlotFingerprint, function: FunctionId) {
        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            entry.function = Some(function);
        }
    }
}

pub struct CodegenManager {
    name: String,
    utils: CodegenUtils,
    generators: Vec<Generator>,
    cache: GeneratorCache,
    layouts: FieldLayouts,
    options: CodegenOptions,
    primitives: Option<PrimitiveLibrary>,
    next_id: u32,
    explain: String,
}

impl CodegenManager {
    pub fn new(module_name: &str) -> Self {
        Self::with_options(module_name, CodegenOptions::default())
    }

    pub fn with_options(module_name: &str, options: CodegenOptions) -> Self {
        Self {
            name: module_name.to_string(),
            utils: CodegenUtils::new(module_name),
            generators: Vec::new(),
            cache: GeneratorCache::default(),
            layouts: FieldLayouts::current(),
            options,
            primitives: None,
            next_id: 0,
            explain: String::new(),
        }
    }

    /// Replaces the field tables generators compile against.
    pub fn with_field_layouts(mut self, layouts: FieldLayouts) -> Self {
        self.layouts = layouts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    pub fn utils(&self) -> &CodegenUtils {
        &self.utils
    }

    pub fn cache(&self) -> &GeneratorCache {
        &self.cache
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    fn next_generator_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Adds a generator to the session and returns its index.
    pub fn enroll(&mut self, generator: Generator) -> usize {
        assert!(
            !self.utils.is_compiled(),
            "generator enrolled in `{}` after compilation",
            self.name
        );
        let index = self.generators.len();
        tracing::debug!(
            module = %self.name,
            function = generator.unique_func_name(),
            kind = generator.kind(),
            "enrolled generator"
        );
        self.generators.push(generator);
        index
    }

    /// Requests a deformation function for `slot` covering attributes `1..=max_attr`.
    ///
    /// Requests for an already enrolled fingerprint attach `call_site` to the existing
    /// generator.
    pub fn enroll_slot_deform(
        &mut self,
        call_site: Arc<CallSite<SlotGetSomeAttrsFn>>,
        slot: &TupleTableSlot,
        max_attr: i32,
    ) -> usize {
        let index = self.shared_slot_deform(slot, max_attr);
        if let Generator::SlotDeform(generator) = &mut self.generators[index] {
            generator.add_call_site(call_site);
        }
        index
    }

    fn shared_slot_deform(&mut self, slot: &TupleTableSlot, max_attr: i32) -> usize {
        let fingerprint = SlotFingerprint {
            slot: slot.addr(),
            max_attr,
        };
        if let Some(index) = self.cache.generator_index(&fingerprint) {
            tracing::debug!(slot = fingerprint.slot, max_attr, "reusing slot deformation");
            return index;
        }
        let id = self.next_generator_id();
        let index = self.enroll(Generator::SlotDeform(SlotDeformCodegen::new(id, slot, max_attr)));
        self.cache.insert(fingerprint, index);
        index
    }

    /// Requests a specialized projection for a plain-variable target list reading `slot`.
    pub fn enroll_variable_list(
        &mut self,
        call_site: Arc<CallSite<ExecVariableListFn>>,
        proj_info: &ProjectionInfo,
        slot: &TupleTableSlot,
    ) -> usize {
        if let Some(source) = proj_info.single_source() {
            let max_attr = proj_info.max_attr(source);
            if max_attr > 0 {
                self.shared_slot_deform(slot, max_attr);
            }
        }
        let id = self.next_generator_id();
        let generator = VariableListCodegen::new(id, call_site, proj_info, slot);
        self.enroll(Generator::VariableList(generator))
    }

    /// Requests a specialized evaluator for `expr_state`.
    ///
    /// Returns `false`, leaving the call site untouched, when the expression contains a
    /// node that cannot be generated. `scan_slot` is the slot scan-level column references
    /// read at run time.
    pub fn enroll_expr(
        &mut self,
        call_site: Arc<CallSite<ExecEvalExprFn>>,
        expr_state: &ExprState,
        scan_slot: Option<&TupleTableSlot>,
    ) -> bool {
        let mut info = ExprTreeGeneratorInfo::new(scan_slot.map(TupleTableSlot::natts));
        let Some(tree) = ExprTreeGenerator::verify_and_create(expr_state.node(), &mut info) else {
            tracing::debug!(expr = %expr_state.node(), "expression not supported by code generation");
            return false;
        };
        let scan_deform = match scan_slot {
            Some(slot) if info.max_attr > 0 => {
                self.shared_slot_deform(slot, info.max_attr);
                Some(SlotFingerprint {
                    slot: slot.addr(),
                    max_attr: info.max_attr,
                })
            }
            _ => None,
        };
        let id = self.next_generator_id();
        let generator = ExprEvalCodegen::new(id, call_site, expr_state, tree, scan_deform);
        self.enroll(Generator::ExprEval(generator));
        true
    }

    /// Runs every enrolled generator once. Returns how many committed a function.
    #[tracing::instrument(skip(self), fields(module = %self.name, generators = self.generators.len()))]
    pub fn generate_code(&mut self) -> u32 {
        if self.primitives.is_none() && self.generators.iter().any(Generator::needs_primitives) {
            self.primitives = PrimitiveLibrary::build();
        }
        let mut ctx = GenerationContext {
            utils: &mut self.utils,
            cache: &mut self.cache,
            primitives: self.primitives.as_ref(),
            layouts: &self.layouts,
        };
        let mut generated = 0;
        for generator in self.generators.iter_mut() {
            if generator.generate_code(&mut ctx) {
                generated += 1;
            }
        }
        tracing::info!(generated, "code generation finished");
        generated
    }

    /// Compiles the module and installs every generated function in its call sites.
    ///
    /// Returns the number of generators published. A session with nothing generated
    /// returns 0 without touching the backend.
    #[tracing::instrument(skip(self), fields(module = %self.name))]
    pub fn prepare_generated_functions(&mut self) -> u32 {
        if !self.generators.iter().any(Generator::is_generated) {
            tracing::debug!("nothing to compile");
            return 0;
        }
        let options = self.options;
        if options.optimize_ir
            && !self
                .utils
                .optimize(options.opt_level, options.size_level, options.tune_for_host_cpu)
        {
            tracing::debug!("IR optimization skipped");
        }
        if !self
            .utils
            .prepare_for_execution(options.opt_level, options.tune_for_host_cpu)
        {
            return 0;
        }

        let mut published = 0;
        for generator in self.generators.iter_mut() {
            if generator.set_to_generated(&self.utils) {
                published += 1;
            }
        }
        tracing::info!(published, "published generated functions");
        published
    }

    /// Appends a summary of the session's generated functions to the explain output.
    pub fn accumulate_explain_string(&mut self) {
        let published = self
            .generators
            .iter()
            .filter(|g| g.state() == GenerationState::Published)
            .count();
        self.explain.push_str(&format!(
            "Generated functions: {} of {} in {}\n",
            published,
            self.generators.len(),
            self.name
        ));
        for generator in &self.generators {
            let state = match generator.state() {
                GenerationState::NotGenerated => "not generated",
                GenerationState::Generated => "generated",
                GenerationState::Published => "published",
            };
            self.explain.push_str(&format!(
                "  {} {}: {}\n",
                generator.kind(),
                generator.unique_func_name(),
                state
            ));
        }
    }

    pub fn explain_string(&self) -> &str {
        &self.explain
    }

    /// Generated code depends on values that are fixed for the whole session.
    pub fn notify_parameter_change(&mut self) {
        panic!("parameter changes are not supported for generated functions");
    }

    pub fn invalidate_generated_functions(&mut self) -> bool {
        panic!("generated functions cannot be invalidated");
    }
}

impl Drop for CodegenManager {
    fn drop(&mut self) {
        for generator in self.generators.iter_mut() {
            generator.restore_call_sites();
        }
    }
}

impl fmt::Display for CodegenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", "CodegenManager".bold(), self.name.cyan())?;
        writeln!(f, "  cached shapes: {}", self.cache.len())?;
        write!(
            f,
            "{}",
            self.generators
                .iter()
                .map(|g| format!("  {}", g))
                .join("\n")
        )
    }
}
