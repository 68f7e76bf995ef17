//! This module implements the isolated loader. A `Runtime` owns the
//! process-wide execution engine; `LoaderContext` values are the disposable
//! namespaces artifacts are loaded into. Code loaded into one context cannot
//! observe or mutate code in another context, and two submissions never
//! share a context.
//!
//! Every invocation of loaded code runs in a fresh store with a wall-clock
//! budget enforced through epoch interruption and a bound on linear memory.
//!

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wasmtime::{
    Config, Engine, ExternType, Func, Linker, Module, Store, StoreLimits, StoreLimitsBuilder,
    Trap, Val,
};

use crate::check_api::{self, CheckState, CheckVerdict};
use crate::policy::{self, PolicyBroker, Trust};
use crate::terminal::{self, Terminal};
use crate::{ErrorKind, InvocationError, Result, RuntimeConfig, SandboxViolation};

/// Identifier of a loader context. The identifier is the key under which the
/// terminal interceptor and the policy broker track per-context state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn new(raw: u64) -> ContextId {
        ContextId(raw)
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An import declared by a loaded module.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleImport {
    /// The import's module name.
    pub module: String,

    /// The import's field name.
    pub name: String,
}

impl ModuleImport {
    /// Render the import as `module::name`.
    pub fn path(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }
}

/// Names accepted as main entry points, in preference order.
const ENTRY_POINT_NAMES: &[&str] = &["main", "_start"];

/// A compiled artifact loaded into a context.
#[derive(Clone)]
pub struct LoadedModule {
    pub(crate) qualified_name: String,
    pub(crate) module: Module,
    pub(crate) context: ContextId,
    entry: Option<String>,
    imports: Vec<ModuleImport>,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("qualified_name", &self.qualified_name)
            .field("context", &self.context)
            .field("entry", &self.entry)
            .field("imports", &self.imports)
            .finish()
    }
}

impl LoadedModule {
    /// Get the qualified name of this artifact.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Get the loader context holding this artifact.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Test whether the artifact exposes a main entry point.
    pub fn has_entry_point(&self) -> bool {
        self.entry.is_some()
    }

    /// Get the imports the artifact declares.
    pub fn imports(&self) -> &[ModuleImport] {
        &self.imports
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) engine: Engine,
    pub(crate) config: RuntimeConfig,
    pub(crate) terminal: Terminal,
    pub(crate) broker: PolicyBroker,
    next_context: AtomicU64,
}

/// The process-wide execution runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a new runtime and engage the sandbox policy. The runtime
    /// spawns a daemon thread advancing the engine epoch at the configured
    /// tick so that wall-clock budgets fire even inside tight loops.
    pub fn new(config: RuntimeConfig) -> Result<Runtime> {
        let mut engine_config = Config::new();
        engine_config.epoch_interruption(true);
        let engine = Engine::new(&engine_config)
            .map_err(|e| ErrorKind::Engine(e.to_string()))?;

        let broker = PolicyBroker::new();
        broker.engage();

        let inner = Arc::new(RuntimeInner {
            engine: engine.clone(),
            terminal: Terminal::new(config.max_output),
            broker,
            config,
            next_context: AtomicU64::new(1),
        });
        start_epoch_ticker(engine, config.epoch_tick);

        Ok(Runtime { inner })
    }

    /// Get the sandbox policy broker.
    pub fn policy(&self) -> &PolicyBroker {
        &self.inner.broker
    }

    /// Get the terminal interceptor.
    pub fn terminal(&self) -> &Terminal {
        &self.inner.terminal
    }

    /// Create a fresh loader context with the given trust level.
    pub fn create_context(&self, trust: Trust) -> LoaderContext {
        let id = ContextId::new(self.inner.next_context.fetch_add(1, Ordering::SeqCst));
        self.inner.broker.register(id, trust);
        self.inner.terminal.attach(id);
        log::debug!("created loader context {} ({:?})", id, trust);
        LoaderContext {
            runtime: self.inner.clone(),
            id,
            trust,
        }
    }

    /// Validate a compiled artifact against the engine without loading it.
    pub fn validate(&self, wasm: &[u8]) -> std::result::Result<(), String> {
        Module::validate(&self.inner.engine, wasm).map_err(|e| e.to_string())
    }
}

fn start_epoch_ticker(engine: Engine, tick: Duration) {
    std::thread::spawn(move || loop {
        std::thread::sleep(tick);
        engine.increment_epoch();
    });
}

/// A fresh, disposable namespace for loaded artifacts.
///
/// Dropping the context releases everything loaded into it and unregisters
/// it from the policy broker and the terminal interceptor.
pub struct LoaderContext {
    runtime: Arc<RuntimeInner>,
    id: ContextId,
    trust: Trust,
}

impl fmt::Debug for LoaderContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderContext")
            .field("id", &self.id)
            .field("trust", &self.trust)
            .finish()
    }
}

impl LoaderContext {
    /// Get the identifier of this context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Get the trust level of this context.
    pub fn trust(&self) -> Trust {
        self.trust
    }

    /// Load a compiled artifact into this context.
    pub fn load(&self, qualified_name: &str, wasm: &[u8]) -> Result<LoadedModule> {
        if !self.runtime.broker.is_engaged() {
            bail!(ErrorKind::PolicyNotEngaged);
        }
        let module = Module::from_binary(&self.runtime.engine, wasm).map_err(|e| {
            ErrorKind::InvalidModule(qualified_name.to_owned(), e.to_string())
        })?;

        let imports = module
            .imports()
            .map(|import| ModuleImport {
                module: import.module().to_owned(),
                name: import.name().to_owned(),
            })
            .collect();
        let entry = find_entry_point(&module);

        log::debug!(
            "loaded \"{}\" into context {} (entry point: {:?})",
            qualified_name,
            self.id,
            entry
        );
        Ok(LoadedModule {
            qualified_name: qualified_name.to_owned(),
            module,
            context: self.id,
            entry,
            imports,
        })
    }

    /// Install the scripted input for the next invocation in this context.
    pub fn set_input(&self, lines: &[String]) {
        self.runtime.terminal.set_input(self.id, lines);
    }

    /// Discard the scripted input and the captured output of this context.
    pub fn reset_terminal(&self) {
        self.runtime.terminal.reset(self.id);
    }

    /// Get the output captured in this context since the last reset.
    pub fn output(&self) -> String {
        self.runtime.terminal.output(self.id)
    }

    /// Get the error output captured in this context since the last reset.
    pub fn error_output(&self) -> String {
        self.runtime.terminal.error_output(self.id)
    }

    /// Invoke the main entry point of the given artifact under the given
    /// wall-clock budget.
    pub fn invoke_entry(
        &self,
        module: &LoadedModule,
        budget: Duration,
    ) -> std::result::Result<(), InvocationError> {
        invoke_module(&self.runtime, module, budget)
    }

    /// Run a dynamically compiled check loaded into this context against the
    /// given target artifact.
    pub fn run_check(
        &self,
        check: &LoadedModule,
        target: &LoadedModule,
        budget: Duration,
    ) -> std::result::Result<CheckVerdict, InvocationError> {
        check_api::run_compiled_check(&self.runtime, check, target, budget)
    }
}

impl Drop for LoaderContext {
    fn drop(&mut self) {
        self.runtime.broker.release(self.id);
        self.runtime.terminal.detach(self.id);
        log::debug!("released loader context {}", self.id);
    }
}

/// Host-side state attached to every store.
pub(crate) struct HostState {
    pub(crate) context: ContextId,
    pub(crate) terminal: Terminal,
    pub(crate) broker: PolicyBroker,
    pub(crate) runtime: Arc<RuntimeInner>,
    pub(crate) limits: StoreLimits,
    pub(crate) check: Option<CheckState>,
}

pub(crate) fn new_store(
    runtime: &Arc<RuntimeInner>,
    context: ContextId,
    check: Option<CheckState>,
) -> Store<HostState> {
    let limits = StoreLimitsBuilder::new()
        .memory_size(runtime.config.max_memory.bytes())
        .memories(4)
        .tables(4)
        .instances(8)
        .build();
    let state = HostState {
        context,
        terminal: runtime.terminal.clone(),
        broker: runtime.broker.clone(),
        runtime: runtime.clone(),
        limits,
        check,
    };
    let mut store = Store::new(&runtime.engine, state);
    store.limiter(|state| &mut state.limits);
    store
}

/// Number of epoch ticks corresponding to the given wall-clock budget.
pub(crate) fn deadline_ticks(config: &RuntimeConfig, budget: Duration) -> u64 {
    let tick = config.epoch_tick.as_millis().max(1);
    (budget.as_millis() / tick).max(1) as u64 + 1
}

/// Instantiate the given artifact in a fresh store and invoke its main
/// entry point.
pub(crate) fn invoke_module(
    runtime: &Arc<RuntimeInner>,
    module: &LoadedModule,
    budget: Duration,
) -> std::result::Result<(), InvocationError> {
    let entry = module
        .entry
        .as_deref()
        .ok_or(InvocationError::NoEntryPoint)?;

    let mut store = new_store(runtime, module.context, None);
    let mut linker: Linker<HostState> = Linker::new(&runtime.engine);
    terminal::register(&mut linker)
        .map_err(|e| InvocationError::Faulted(e.to_string()))?;
    policy::link_deny_shims(&mut linker, &module.module, terminal::SURFACE)
        .map_err(|e| InvocationError::Faulted(e.to_string()))?;

    // The deadline covers instantiation as well: a start section can loop
    // just as well as an entry point.
    store.set_epoch_deadline(deadline_ticks(&runtime.config, budget));
    let instance = linker
        .instantiate(&mut store, &module.module)
        .map_err(map_call_error)?;
    let func = instance
        .get_func(&mut store, entry)
        .ok_or(InvocationError::NoEntryPoint)?;

    call_nullary(&mut store, &func)
}

/// Call a nullary function, discarding its results.
pub(crate) fn call_nullary(
    store: &mut Store<HostState>,
    func: &Func,
) -> std::result::Result<(), InvocationError> {
    let result_count = func.ty(&mut *store).results().len();
    let mut results = vec![Val::I32(0); result_count];
    func.call(&mut *store, &[], &mut results)
        .map_err(map_call_error)?;
    Ok(())
}

/// Map an engine-level call error to the invocation error taxonomy.
pub(crate) fn map_call_error(error: wasmtime::Error) -> InvocationError {
    if let Some(violation) = error.downcast_ref::<SandboxViolation>() {
        return InvocationError::Violation(violation.clone());
    }
    if let Some(invocation) = error.downcast_ref::<InvocationError>() {
        return invocation.clone();
    }
    if let Some(trap) = error.downcast_ref::<Trap>() {
        if matches!(trap, Trap::Interrupt) {
            return InvocationError::Timeout;
        }
        return InvocationError::Faulted(trap.to_string());
    }
    InvocationError::Faulted(format!("{:#}", error))
}

fn find_entry_point(module: &Module) -> Option<String> {
    for name in ENTRY_POINT_NAMES {
        if let Some(ExternType::Func(func_ty)) = module.get_export(name) {
            if func_ty.params().len() == 0 && func_ty.results().len() <= 1 {
                return Some((*name).to_owned());
            }
        }
    }
    None
}
