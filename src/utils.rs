//! Backend utilities: a thin, stateful wrapper around Cranelift for one code generation
//! session.
//!
//! Generators build function bodies into a [`ProgramModule`], an ordered table of
//! imported and locally defined functions plus imported data symbols. Nothing is handed
//! to the JIT until [`CodegenUtils::prepare_for_execution`], which builds the target ISA,
//! maps every registered host symbol to its address, and declares, defines and finalizes
//! the whole module in one go. After that the module is gone and only compiled function
//! pointers can be looked up.
//!
//! Bodies reference other functions through `UserExternalName { namespace, index }`
//! where `index` is the position in the declaration table: namespace 0 for functions,
//! namespace 1 for data symbols. The JIT module is populated in the same order, so those
//! indices line up with its `FuncId`s and `DataId`s.

use std::fmt::Write as _;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::{
    self, ExtFuncData, ExternalName, FuncRef, GlobalValueData, UserExternalName, UserFuncName,
};
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use isa::{CallConv, TargetIsa};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::BuilderError;
use crate::executor::{FieldDesc, FieldType};
use crate::types::{AbiType, CodegenFn};

const EXTERNAL_FUNCTION_PREFIX: &str = "extfunc_";
const EXTERNAL_VARIABLE_PREFIX: &str = "extvar_";
const FUNCTION_NAMESPACE: u32 = 0;
const DATA_NAMESPACE: u32 = 1;

/// Machine type of pointers and Datums.
pub const POINTER_TYPE: Type = types::I64;

/// Code generation optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OptimizationLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

/// How hard the optimizer should trade speed for code size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SizeLevel {
    #[default]
    None,
    Small,
    VerySmall,
}

impl OptimizationLevel {
    fn cranelift_flag(self, size: SizeLevel) -> &'static str {
        match (self, size) {
            (OptimizationLevel::None, _) => "none",
            (_, SizeLevel::None) => "speed",
            _ => "speed_and_size",
        }
    }
}

/// Session-wide code generation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodegenOptions {
    pub opt_level: OptimizationLevel,
    pub size_level: SizeLevel,
    pub tune_for_host_cpu: bool,
    /// Run the IR optimizer over the module before compiling it.
    pub optimize_ir: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            opt_level: OptimizationLevel::Default,
            size_level: SizeLevel::None,
            tune_for_host_cpu: true,
            optimize_ir: true,
        }
    }
}

/// Index of a function in a [`ProgramModule`]'s declaration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(u32);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an imported data symbol in a [`ProgramModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalVariable(u32);

#[derive(Debug, Clone)]
enum FunctionBody {
    /// Resolved at prepare time; `None` means no host address has been registered.
    Import { address: Option<usize> },
    Defined(Box<ir::Function>),
}

#[derive(Debug, Clone)]
struct FunctionDecl {
    name: String,
    signature: Signature,
    body: FunctionBody,
    always_inline: bool,
}

#[derive(Debug, Clone)]
struct DataDecl {
    name: String,
    address: usize,
}

/// Declarations and IR bodies of everything generated in one session.
#[derive(Debug, Clone)]
pub struct ProgramModule {
    name: String,
    functions: Vec<FunctionDecl>,
    function_names: FxHashMap<String, FunctionId>,
    data: Vec<DataDecl>,
}

impl ProgramModule {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: Vec::new(),
            function_names: FxHashMap::default(),
            data: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.function_names.get(name).copied()
    }

    /// Names of locally defined functions, in declaration order.
    pub fn defined_functions(&self) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|decl| matches!(decl.body, FunctionBody::Defined(_)))
            .map(|decl| decl.name.as_str())
            .collect()
    }

    pub fn import_count(&self) -> usize {
        self.functions
            .iter()
            .filter(|decl| matches!(decl.body, FunctionBody::Import { .. }))
            .count()
    }

    pub fn data_count(&self) -> usize {
        self.data.len()
    }

    /// The IR body of a defined function.
    pub fn function_ir(&self, name: &str) -> Option<&ir::Function> {
        let id = self.function_id(name)?;
        match &self.functions[id.index()].body {
            FunctionBody::Defined(func) => Some(func),
            FunctionBody::Import { .. } => None,
        }
    }

    pub fn is_always_inline(&self, name: &str) -> bool {
        self.function_id(name)
            .is_some_and(|id| self.functions[id.index()].always_inline)
    }

    fn declare(&mut self, decl: FunctionDecl) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.function_names.insert(decl.name.clone(), id);
        self.functions.push(decl);
        id
    }

    /// Textual dump of declarations and IR.
    pub fn display(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; module {}", self.name);
        for data in &self.data {
            let _ = writeln!(out, "; data {} = {:#x}", data.name, data.address);
        }
        for decl in &self.functions {
            match &decl.body {
                FunctionBody::Import { address: Some(addr) } => {
                    let _ = writeln!(out, "; import {} {} = {:#x}", decl.name, decl.signature, addr);
                }
                FunctionBody::Import { address: None } => {
                    let _ = writeln!(out, "; import {} {} (unresolved)", decl.name, decl.signature);
                }
                FunctionBody::Defined(func) => {
                    if decl.always_inline {
                        let _ = writeln!(out, "; always_inline");
                    }
                    let _ = writeln!(out, "{}", func.display());
                }
            }
        }
        out
    }
}

/// A function body under construction; attached to the module by
/// [`CodegenUtils::commit_function`].
pub struct FunctionHandle {
    name: String,
    func: ir::Function,
}

impl FunctionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn builder<'a>(&'a mut self, ctx: &'a mut FunctionBuilderContext) -> FunctionBuilder<'a> {
        FunctionBuilder::new(&mut self.func, ctx)
    }
}

struct ExecutionEngine {
    module: JITModule,
    functions: FxHashMap<String, (FuncId, Signature)>,
}

/// Per-session Cranelift wrapper: owns the program module until it is compiled, then
/// the JIT memory holding the compiled code.
pub struct CodegenUtils {
    name: String,
    module: Option<ProgramModule>,
    engine: Option<ExecutionEngine>,
    external_functions: FxHashMap<usize, FunctionId>,
    external_variables: FxHashMap<usize, ExternalVariable>,
    pending_names: FxHashSet<String>,
    external_function_counter: u32,
    external_variable_counter: u32,
    module_text: String,
}

impl CodegenUtils {
    pub fn new(module_name: &str) -> Self {
        Self {
            name: module_name.to_string(),
            module: Some(ProgramModule::new(module_name)),
            engine: None,
            external_functions: FxHashMap::default(),
            external_variables: FxHashMap::default(),
            pending_names: FxHashSet::default(),
            external_function_counter: 0,
            external_variable_counter: 0,
            module_text: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The program module, while it has not been compiled yet.
    pub fn module(&self) -> Option<&ProgramModule> {
        self.module.as_ref()
    }

    pub(crate) fn into_module(self) -> Option<ProgramModule> {
        let mut this = self;
        this.module.take()
    }

    pub fn is_compiled(&self) -> bool {
        self.engine.is_some()
    }

    fn module_mut(&mut self) -> &mut ProgramModule {
        match self.module.as_mut() {
            Some(module) => module,
            None => panic!(
                "program module `{}` was modified after it was handed to the execution engine",
                self.name
            ),
        }
    }

    fn module_ref(&self) -> &ProgramModule {
        match self.module.as_ref() {
            Some(module) => module,
            None => panic!(
                "program module `{}` was read after it was handed to the execution engine",
                self.name
            ),
        }
    }

    pub fn pointer_type(&self) -> Type {
        POINTER_TYPE
    }

    pub fn make_signature(params: &[AbiType], ret: Option<AbiType>) -> Signature {
        let mut sig = Signature::new(CallConv::triple_default(&target_lexicon::Triple::host()));
        sig.params
            .extend(params.iter().map(|ty| AbiParam::new(abi_type(*ty))));
        sig.returns.extend(ret.map(|ty| AbiParam::new(abi_type(ty))));
        sig
    }

    pub fn signature_of<F: CodegenFn>() -> Signature {
        Self::make_signature(F::PARAMS, F::RETURNS)
    }

    /// Starts a new function named `name` with the signature of `F`.
    ///
    /// # Panics
    /// If a function with this name already exists or is being built, or the module has
    /// already been compiled.
    pub fn create_function<F: CodegenFn>(&mut self, name: &str) -> FunctionHandle {
        let taken = self.module_ref().function_id(name).is_some();
        assert!(
            !taken && !self.pending_names.contains(name),
            "function name `{}` is already in use",
            name
        );
        self.pending_names.insert(name.to_string());
        FunctionHandle {
            name: name.to_string(),
            func: ir::Function::with_name_signature(
                UserFuncName::testcase(name),
                Self::signature_of::<F>(),
            ),
        }
    }

    /// Attaches a finished body to the module.
    pub fn commit_function(&mut self, handle: FunctionHandle) -> FunctionId {
        self.pending_names.remove(&handle.name);
        let signature = handle.func.signature.clone();
        self.module_mut().declare(FunctionDecl {
            name: handle.name,
            signature,
            body: FunctionBody::Defined(Box::new(handle.func)),
            always_inline: false,
        })
    }

    /// Throws away a body that will not be committed, releasing its name.
    pub fn discard_function(&mut self, handle: FunctionHandle) {
        self.pending_names.remove(&handle.name);
    }

    /// Makes a host function callable from generated code.
    ///
    /// Registering the same address twice returns the symbol from the first registration.
    pub fn register_external_function<F: CodegenFn>(&mut self, f: F) -> FunctionId {
        let address = f.addr();
        if let Some(id) = self.external_functions.get(&address) {
            return *id;
        }
        self.external_function_counter += 1;
        let name = format!("{EXTERNAL_FUNCTION_PREFIX}{:x}", self.external_function_counter);
        let id = self.module_mut().declare(FunctionDecl {
            name,
            signature: Self::signature_of::<F>(),
            body: FunctionBody::Import {
                address: Some(address),
            },
            always_inline: false,
        });
        self.external_functions.insert(address, id);
        id
    }

    /// Makes a host global visible to generated code as a data symbol.
    pub fn register_external_variable(&mut self, address: usize) -> ExternalVariable {
        if let Some(var) = self.external_variables.get(&address) {
            return *var;
        }
        self.external_variable_counter += 1;
        let name = format!("{EXTERNAL_VARIABLE_PREFIX}{:x}", self.external_variable_counter);
        let module = self.module_mut();
        let var = ExternalVariable(module.data.len() as u32);
        module.data.push(DataDecl { name, address });
        self.external_variables.insert(address, var);
        var
    }

    /// Imports `id` into the function being built.
    pub fn import_function(&self, builder: &mut FunctionBuilder, id: FunctionId) -> FuncRef {
        let decl = &self.module_ref().functions[id.index()];
        let signature = builder.import_signature(decl.signature.clone());
        let name_ref = builder
            .func
            .declare_imported_user_function(UserExternalName::new(FUNCTION_NAMESPACE, id.0));
        builder.import_function(ExtFuncData {
            name: ExternalName::user(name_ref),
            signature,
            colocated: false,
        })
    }

    /// Emits a call to `id` and returns its results.
    pub fn call(&self, builder: &mut FunctionBuilder, id: FunctionId, args: &[Value]) -> Vec<Value> {
        let callee = self.import_function(builder, id);
        let call = builder.ins().call(callee, args);
        builder.inst_results(call).to_vec()
    }

    /// Address of a registered external variable.
    pub fn variable_address(&self, builder: &mut FunctionBuilder, var: ExternalVariable) -> Value {
        let name_ref = builder
            .func
            .declare_imported_user_function(UserExternalName::new(DATA_NAMESPACE, var.0));
        let gv = builder.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::user(name_ref),
            offset: ir::immediates::Imm64::new(0),
            colocated: false,
            tls: false,
        });
        builder.ins().symbol_value(POINTER_TYPE, gv)
    }

    pub fn get_pointer_to_member(
        &self,
        builder: &mut FunctionBuilder,
        base: Value,
        field: FieldDesc,
    ) -> Value {
        if field.offset == 0 {
            base
        } else {
            builder.ins().iadd_imm(base, field.offset as i64)
        }
    }

    pub fn load_member(&self, builder: &mut FunctionBuilder, base: Value, field: FieldDesc) -> Value {
        builder
            .ins()
            .load(field_type(field.ty), MemFlags::trusted(), base, field.offset)
    }

    pub fn store_member(
        &self,
        builder: &mut FunctionBuilder,
        base: Value,
        field: FieldDesc,
        value: Value,
    ) {
        builder
            .ins()
            .store(MemFlags::trusted(), value, base, field.offset);
    }

    pub fn get_constant_ptr(&self, builder: &mut FunctionBuilder, address: usize) -> Value {
        builder.ins().iconst(POINTER_TYPE, address as i64)
    }

    pub fn get_constant_i32(&self, builder: &mut FunctionBuilder, value: i32) -> Value {
        builder.ins().iconst(types::I32, value as i64)
    }

    pub fn get_constant_i64(&self, builder: &mut FunctionBuilder, value: i64) -> Value {
        builder.ins().iconst(types::I64, value)
    }

    pub fn get_constant_bool(&self, builder: &mut FunctionBuilder, value: bool) -> Value {
        builder.ins().iconst(types::I8, value as i64)
    }

    /// Runs the IR optimizer over every committed body.
    ///
    /// Returns `false` when the module was already compiled or the optimizer failed; the
    /// module is still valid in that case.
    pub fn optimize(&mut self, level: OptimizationLevel, size: SizeLevel, tune_for_host_cpu: bool) -> bool {
        let Some(module) = self.module.as_mut() else {
            return false;
        };
        let isa = match create_isa(level, size, tune_for_host_cpu) {
            Ok(isa) => isa,
            Err(e) => {
                tracing::warn!(module = %module.name, error = %e, "cannot create ISA for optimization");
                return false;
            }
        };
        for decl in module.functions.iter_mut() {
            let FunctionBody::Defined(func) = &mut decl.body else {
                continue;
            };
            let mut ctx = Context::for_function(std::mem::replace(func.as_mut(), ir::Function::new()));
            let result = ctx.optimize(isa.as_ref(), &mut ControlPlane::default());
            **func = ctx.func;
            if let Err(e) = result {
                tracing::warn!(function = %decl.name, error = ?e, "IR optimization failed");
                return false;
            }
        }
        true
    }

    /// Compiles the whole module and makes its functions callable.
    ///
    /// Consumes the module: this succeeds at most once per session. Returns `false` on a
    /// second call or on any backend failure.
    pub fn prepare_for_execution(&mut self, level: OptimizationLevel, tune_for_host_cpu: bool) -> bool {
        if self.engine.is_some() {
            tracing::warn!(module = %self.name, "module was already prepared for execution");
            return false;
        }
        let Some(module) = self.module.take() else {
            tracing::warn!(module = %self.name, "no module to prepare for execution");
            return false;
        };
        self.module_text = module.display();
        match build_engine(&module, level, tune_for_host_cpu) {
            Ok(engine) => {
                tracing::debug!(
                    module = %self.name,
                    functions = engine.functions.len(),
                    "module prepared for execution"
                );
                self.engine = Some(engine);
                true
            }
            Err(e) => {
                tracing::warn!(module = %self.name, error = %e, "module compilation failed");
                false
            }
        }
    }

    /// Looks up a compiled function.
    ///
    /// # Panics
    /// If the module has not been prepared for execution, or `F` does not match the
    /// function's signature.
    pub fn get_function_pointer<F: CodegenFn>(&self, name: &str) -> Option<F> {
        let Some(engine) = self.engine.as_ref() else {
            panic!(
                "function `{}` requested before module `{}` was prepared for execution",
                name, self.name
            );
        };
        let (id, signature) = engine.functions.get(name)?;
        assert_eq!(
            *signature,
            Self::signature_of::<F>(),
            "function `{}` requested with a mismatching signature",
            name
        );
        let code = engine.module.get_finalized_function(*id);
        // SAFETY: the function was compiled from a body whose signature matches `F`.
        Some(unsafe { F::from_addr(code as usize) })
    }

    /// Copies function `name` from another module into this one.
    ///
    /// Callees imported by the foreign module are re-declared here with their host
    /// addresses. Callees defined there are copied too when `recursive` is set; otherwise
    /// they are declared by name and must be resolved by a later insertion. Copies are
    /// marked always-inline. A function already present under the same name is reused.
    pub fn insert_alien_function(
        &mut self,
        foreign: &ProgramModule,
        name: &str,
        recursive: bool,
    ) -> Option<FunctionId> {
        let Some(foreign_id) = foreign.function_id(name) else {
            tracing::warn!(function = name, module = %foreign.name, "alien function not found");
            return None;
        };
        Some(self.insert_alien(foreign, foreign_id, recursive))
    }

    fn insert_alien(&mut self, foreign: &ProgramModule, foreign_id: FunctionId, recursive: bool) -> FunctionId {
        let decl = &foreign.functions[foreign_id.index()];
        let existing = self.module_ref().function_id(&decl.name);

        let func = match &decl.body {
            FunctionBody::Import { address } => {
                if let Some(id) = existing {
                    return id;
                }
                if let Some(id) = address.and_then(|a| self.external_functions.get(&a).copied()) {
                    return id;
                }
                let id = self.module_mut().declare(FunctionDecl {
                    name: decl.name.clone(),
                    signature: decl.signature.clone(),
                    body: FunctionBody::Import { address: *address },
                    always_inline: false,
                });
                if let Some(address) = address {
                    self.external_functions.insert(*address, id);
                }
                return id;
            }
            FunctionBody::Defined(func) => func,
        };

        let id = match existing {
            Some(id) if self.awaits_definition(id) => id,
            Some(id) => return id,
            None => self.module_mut().declare(FunctionDecl {
                name: decl.name.clone(),
                signature: decl.signature.clone(),
                body: FunctionBody::Import { address: None },
                always_inline: true,
            }),
        };

        let mut copy = (**func).clone();
        let callees: Vec<_> = copy
            .params
            .user_named_funcs()
            .iter()
            .map(|(name_ref, name)| (name_ref, name.clone()))
            .collect();
        for (name_ref, name) in callees {
            let remapped = match name.namespace {
                FUNCTION_NAMESPACE => {
                    let callee_id = FunctionId(name.index);
                    let callee = &foreign.functions[callee_id.index()];
                    let local = if recursive || matches!(callee.body, FunctionBody::Import { .. }) {
                        self.insert_alien(foreign, callee_id, recursive)
                    } else {
                        match self.module_ref().function_id(&callee.name) {
                            Some(local) => local,
                            None => self.module_mut().declare(FunctionDecl {
                                name: callee.name.clone(),
                                signature: callee.signature.clone(),
                                body: FunctionBody::Import { address: None },
                                always_inline: false,
                            }),
                        }
                    };
                    UserExternalName::new(FUNCTION_NAMESPACE, local.0)
                }
                DATA_NAMESPACE => {
                    let data = &foreign.data[name.index as usize];
                    let local = self.register_external_variable(data.address);
                    UserExternalName::new(DATA_NAMESPACE, local.0)
                }
                _ => continue,
            };
            copy.params.reset_user_func_name(name_ref, remapped);
        }

        let slot = &mut self.module_mut().functions[id.index()];
        slot.body = FunctionBody::Defined(Box::new(copy));
        slot.always_inline = true;
        id
    }

    /// A by-name declaration left behind by a non-recursive insertion. Placeholders of
    /// insertions still in progress are already flagged always-inline.
    fn awaits_definition(&self, id: FunctionId) -> bool {
        let decl = &self.module_ref().functions[id.index()];
        !decl.always_inline && matches!(decl.body, FunctionBody::Import { address: None })
    }

    /// Textual dump of the session's module, framed for log output.
    pub fn print_underlying_modules(&self) -> String {
        let mut out = String::from("==== MAIN MODULE ====\n");
        match &self.module {
            Some(module) => out.push_str(&module.display()),
            None => out.push_str(&self.module_text),
        }
        out.push_str("==== END MODULES ====\n");
        out
    }
}

impl Drop for CodegenUtils {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            // SAFETY: call sites pointing into this memory are restored by the owner
            // before the utilities are dropped.
            unsafe { engine.module.free_memory() };
        }
    }
}

fn abi_type(ty: AbiType) -> Type {
    match ty {
        AbiType::Ptr => POINTER_TYPE,
        AbiType::I8 => types::I8,
        AbiType::I32 => types::I32,
        AbiType::I64 => types::I64,
    }
}

fn field_type(ty: FieldType) -> Type {
    match ty {
        FieldType::U8 => types::I8,
        FieldType::U16 => types::I16,
        FieldType::I32 | FieldType::U32 => types::I32,
        FieldType::U64 | FieldType::Ptr => types::I64,
    }
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// # Arguments
/// * `level` - Optimization level mapped onto Cranelift's `opt_level`
/// * `size` - Whether to also optimize for size
/// * `tune_for_host_cpu` - Detect host CPU features instead of using the baseline ISA
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - A setting is rejected or code generation configuration fails
pub(crate) fn create_isa(
    level: OptimizationLevel,
    size: SizeLevel,
    tune_for_host_cpu: bool,
) -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();
    let set = |b: &mut settings::Builder, name: &str, value: &str| {
        b.set(name, value)
            .map_err(|e| BuilderError::SettingError(format!("{name}={value}: {e}")))
    };

    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );

    set(
        &mut flag_builder,
        "use_colocated_libcalls",
        if is_x86 { "true" } else { "false" },
    )?;
    // cranelift-jit rejects position-independent code on every target
    set(&mut flag_builder, "is_pic", "false")?;
    set(&mut flag_builder, "opt_level", level.cranelift_flag(size))?;

    #[cfg(debug_assertions)]
    set(&mut flag_builder, "enable_verifier", "true")?;
    #[cfg(not(debug_assertions))]
    set(&mut flag_builder, "enable_verifier", "false")?;

    let isa_builder = if tune_for_host_cpu {
        cranelift_native::builder()
            .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?
    } else {
        isa::lookup(target_triple)
            .map_err(|e| BuilderError::HostMachineNotSupported(e.to_string()))?
    };

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Declares, defines and finalizes `module` in a fresh JIT module.
fn build_engine(
    module: &ProgramModule,
    level: OptimizationLevel,
    tune_for_host_cpu: bool,
) -> Result<ExecutionEngine, BuilderError> {
    let isa = create_isa(level, SizeLevel::None, tune_for_host_cpu)?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

    for decl in &module.functions {
        match decl.body {
            FunctionBody::Import { address: Some(address) } => {
                builder.symbol(&decl.name, address as *const u8);
            }
            FunctionBody::Import { address: None } => {
                return Err(BuilderError::UnresolvedSymbol(decl.name.clone()));
            }
            FunctionBody::Defined(_) => {}
        }
    }
    for data in &module.data {
        builder.symbol(&data.name, data.address as *const u8);
    }

    let mut jit = JITModule::new(builder);
    let mut functions = FxHashMap::default();

    for (index, decl) in module.functions.iter().enumerate() {
        let linkage = match decl.body {
            FunctionBody::Import { .. } => Linkage::Import,
            FunctionBody::Defined(_) => Linkage::Export,
        };
        let id = jit
            .declare_function(&decl.name, linkage, &decl.signature)
            .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;
        if id.as_u32() as usize != index {
            return Err(BuilderError::SymbolMismatch {
                name: decl.name.clone(),
                expected: index,
                got: id.as_u32() as usize,
            });
        }
        if let FunctionBody::Defined(_) = decl.body {
            functions.insert(decl.name.clone(), (id, decl.signature.clone()));
        }
    }
    for (index, data) in module.data.iter().enumerate() {
        let id = jit
            .declare_data(&data.name, Linkage::Import, false, false)
            .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;
        if id.as_u32() as usize != index {
            return Err(BuilderError::SymbolMismatch {
                name: data.name.clone(),
                expected: index,
                got: id.as_u32() as usize,
            });
        }
    }

    let mut ctx = jit.make_context();
    for decl in &module.functions {
        let FunctionBody::Defined(func) = &decl.body else {
            continue;
        };
        let id = functions[&decl.name].0;
        ctx.func = (**func).clone();
        jit.define_function(id, &mut ctx)
            .map_err(|e| BuilderError::FunctionError(format!("{}: {:?}", decl.name, e)))?;
        jit.clear_context(&mut ctx);
    }
    jit.finalize_definitions().map_err(BuilderError::ModuleError)?;

    Ok(ExecutionEngine {
        module: jit,
        functions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CmpHelperFn, PrimitiveFn};

    extern "C" fn host_add(a: u32, b: i32) {
        let _ = (a, b);
    }

    type HostAddFn = crate::types::ReportFallbackFn;

    fn build_add_one(utils: &mut CodegenUtils, name: &str) -> FunctionId {
        let mut handle = utils.create_function::<PrimitiveFn>(name);
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut b = handle.builder(&mut fb_ctx);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let x = b.block_params(entry)[0];
        let r = b.ins().iadd_imm(x, 1);
        b.ins().return_(&[r]);
        b.seal_all_blocks();
        b.finalize();
        utils.commit_function(handle)
    }

    fn build_caller(utils: &mut CodegenUtils, name: &str, callee: FunctionId) -> FunctionId {
        let mut handle = utils.create_function::<PrimitiveFn>(name);
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut b = handle.builder(&mut fb_ctx);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let (x, y) = (b.block_params(entry)[0], b.block_params(entry)[1]);
        let r = utils.call(&mut b, callee, &[x, y])[0];
        let r = b.ins().imul_imm(r, 10);
        b.ins().return_(&[r]);
        b.seal_all_blocks();
        b.finalize();
        utils.commit_function(handle)
    }

    #[test]
    fn test_compile_and_call() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "add_one");
        assert!(utils.prepare_for_execution(OptimizationLevel::Default, true));
        let f = utils.get_function_pointer::<PrimitiveFn>("add_one").unwrap();
        assert_eq!(unsafe { f(41, 0) }, 42);
        assert!(utils.get_function_pointer::<PrimitiveFn>("missing").is_none());
    }

    #[test]
    fn test_isa_is_not_pic() {
        for tune in [true, false] {
            let isa = create_isa(OptimizationLevel::Default, SizeLevel::None, tune).unwrap();
            assert!(!isa.flags().is_pic());
        }
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "add_one");
        assert!(utils.prepare_for_execution(OptimizationLevel::None, false));
    }

    #[test]
    fn test_register_external_function_idempotent() {
        let mut utils = CodegenUtils::new("test");
        let a = utils.register_external_function(host_add as HostAddFn);
        let b = utils.register_external_function(host_add as HostAddFn);
        assert_eq!(a, b);
        assert_eq!(utils.module().unwrap().import_count(), 1);
    }

    #[test]
    fn test_register_external_variable_idempotent() {
        static COUNTER: u64 = 0;
        let mut utils = CodegenUtils::new("test");
        let addr = &COUNTER as *const u64 as usize;
        let a = utils.register_external_variable(addr);
        let b = utils.register_external_variable(addr);
        assert_eq!(a, b);
        assert_eq!(utils.module().unwrap().data_count(), 1);
    }

    #[test]
    fn test_external_variable_address() {
        static VALUE: u64 = 1234;
        let mut utils = CodegenUtils::new("test");
        let var = utils.register_external_variable(&VALUE as *const u64 as usize);
        let mut handle = utils.create_function::<PrimitiveFn>("read_value");
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut b = handle.builder(&mut fb_ctx);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let addr = utils.variable_address(&mut b, var);
        let v = b.ins().load(types::I64, MemFlags::trusted(), addr, 0);
        b.ins().return_(&[v]);
        b.seal_all_blocks();
        b.finalize();
        utils.commit_function(handle);

        assert!(utils.prepare_for_execution(OptimizationLevel::None, false));
        let f = utils.get_function_pointer::<PrimitiveFn>("read_value").unwrap();
        assert_eq!(unsafe { f(0, 0) }, 1234);
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_duplicate_function_name() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "f");
        let _ = utils.create_function::<PrimitiveFn>("f");
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_duplicate_pending_function_name() {
        let mut utils = CodegenUtils::new("test");
        let _a = utils.create_function::<PrimitiveFn>("f");
        let _b = utils.create_function::<PrimitiveFn>("f");
    }

    #[test]
    fn test_discard_releases_name() {
        let mut utils = CodegenUtils::new("test");
        let handle = utils.create_function::<PrimitiveFn>("f");
        utils.discard_function(handle);
        build_add_one(&mut utils, "f");
        assert_eq!(utils.module().unwrap().defined_functions(), vec!["f"]);
    }

    #[test]
    #[should_panic(expected = "before module")]
    fn test_function_pointer_before_prepare() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "f");
        let _ = utils.get_function_pointer::<PrimitiveFn>("f");
    }

    #[test]
    #[should_panic(expected = "mismatching signature")]
    fn test_function_pointer_signature_mismatch() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "f");
        assert!(utils.prepare_for_execution(OptimizationLevel::None, true));
        let _ = utils.get_function_pointer::<CmpHelperFn>("f");
    }

    #[test]
    fn test_prepare_twice() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "f");
        assert!(utils.prepare_for_execution(OptimizationLevel::Default, true));
        assert!(!utils.prepare_for_execution(OptimizationLevel::Default, true));
        assert!(utils.is_compiled());
    }

    #[test]
    #[should_panic(expected = "modified after")]
    fn test_mutation_after_prepare() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "f");
        assert!(utils.prepare_for_execution(OptimizationLevel::Default, true));
        utils.register_external_function(host_add as HostAddFn);
    }

    #[test]
    fn test_optimize_before_and_after_compile() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "f");
        assert!(utils.optimize(OptimizationLevel::Aggressive, SizeLevel::Small, true));
        assert!(utils.prepare_for_execution(OptimizationLevel::Aggressive, true));
        assert!(!utils.optimize(OptimizationLevel::Default, SizeLevel::None, true));
        let f = utils.get_function_pointer::<PrimitiveFn>("f").unwrap();
        assert_eq!(unsafe { f(1, 0) }, 2);
    }

    #[test]
    fn test_calls_between_functions() {
        let mut utils = CodegenUtils::new("test");
        let callee = build_add_one(&mut utils, "add_one");
        build_caller(&mut utils, "caller", callee);
        assert!(utils.prepare_for_execution(OptimizationLevel::Default, false));
        let f = utils.get_function_pointer::<PrimitiveFn>("caller").unwrap();
        assert_eq!(unsafe { f(4, 0) }, 50);
    }

    #[test]
    fn test_insert_alien_recursive() {
        let mut library = CodegenUtils::new("library");
        let callee = build_add_one(&mut library, "add_one");
        build_caller(&mut library, "caller", callee);
        let foreign = library.into_module().unwrap();

        let mut utils = CodegenUtils::new("session");
        let id = utils.insert_alien_function(&foreign, "caller", true).unwrap();
        let module = utils.module().unwrap();
        assert_eq!(module.function_id("caller"), Some(id));
        assert!(module.is_always_inline("caller"));
        assert!(module.is_always_inline("add_one"));
        assert_eq!(module.defined_functions().len(), 2);

        // already present: reused, nothing new declared
        let again = utils.insert_alien_function(&foreign, "caller", true).unwrap();
        assert_eq!(again, id);
        assert_eq!(utils.module().unwrap().defined_functions().len(), 2);

        assert!(utils.prepare_for_execution(OptimizationLevel::Default, true));
        let f = utils.get_function_pointer::<PrimitiveFn>("caller").unwrap();
        assert_eq!(unsafe { f(1, 0) }, 20);
    }

    #[test]
    fn test_insert_alien_non_recursive() {
        let mut library = CodegenUtils::new("library");
        let callee = build_add_one(&mut library, "add_one");
        build_caller(&mut library, "caller", callee);
        let foreign = library.into_module().unwrap();

        let mut utils = CodegenUtils::new("session");
        utils.insert_alien_function(&foreign, "caller", false).unwrap();
        assert_eq!(utils.module().unwrap().defined_functions(), vec!["caller"]);
        assert_eq!(utils.module().unwrap().import_count(), 1);

        // the callee is unresolved until it is inserted itself
        utils.insert_alien_function(&foreign, "add_one", false).unwrap();
        assert_eq!(utils.module().unwrap().import_count(), 0);
        assert!(utils.prepare_for_execution(OptimizationLevel::Default, true));
        let f = utils.get_function_pointer::<PrimitiveFn>("caller").unwrap();
        assert_eq!(unsafe { f(2, 0) }, 30);
    }

    #[test]
    fn test_unresolved_import_fails_prepare() {
        let mut library = CodegenUtils::new("library");
        let callee = build_add_one(&mut library, "add_one");
        build_caller(&mut library, "caller", callee);
        let foreign = library.into_module().unwrap();

        let mut utils = CodegenUtils::new("session");
        utils.insert_alien_function(&foreign, "caller", false).unwrap();
        assert!(!utils.prepare_for_execution(OptimizationLevel::Default, true));
        assert!(!utils.is_compiled());
    }

    #[test]
    fn test_insert_alien_missing() {
        let foreign = CodegenUtils::new("library").into_module().unwrap();
        let mut utils = CodegenUtils::new("session");
        assert!(utils.insert_alien_function(&foreign, "nope", true).is_none());
    }

    #[test]
    fn test_print_underlying_modules() {
        let mut utils = CodegenUtils::new("test");
        build_add_one(&mut utils, "add_one");
        let before = utils.print_underlying_modules();
        assert!(before.starts_with("==== MAIN MODULE ===="));
        assert!(before.trim_end().ends_with("==== END MODULES ===="));
        assert!(before.contains("add_one"));

        assert!(utils.prepare_for_execution(OptimizationLevel::Default, true));
        let after = utils.print_underlying_modules();
        assert!(after.contains("add_one"));
    }
}
