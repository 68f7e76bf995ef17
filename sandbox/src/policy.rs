//! This module implements the sandbox policy of the slave: a process-wide,
//! deny-by-default permission broker that classifies privileged operations
//! attempted by loaded code and decides them based on the trust level of the
//! attempting loader context.
//!
//! Loaded code can only reach the host through imported functions, so the
//! policy is enforced at link time: every import outside the explicitly
//! allowed surface is bound to a deny shim that classifies the operation,
//! consults the broker and aborts the invocation with a `SandboxViolation`.
//!

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wasmtime::{Caller, ExternType, Linker, Module, Val, ValType};

use crate::context::{ContextId, HostState};

/// Trust level of a loader context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trust {
    /// Judge-owned code; all operations are allowed.
    Trusted,

    /// Submitted code and compiled checks; privileged operations are denied.
    Untrusted,
}

/// Classification of a privileged operation attempted by loaded code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Reading or writing the filesystem.
    FileSystem,

    /// Creating or signalling processes.
    ProcessCreation,

    /// Loading native code.
    NativeCode,

    /// Opening network sockets.
    Network,

    /// Reaching into judge internals through an unrecognized host surface.
    Reflection,

    /// Reading or mutating the ambient environment.
    Environment,

    /// Spawning threads.
    ThreadCreation,

    /// Terminating the hosting process.
    SystemExit,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::FileSystem => "filesystem access",
            Operation::ProcessCreation => "process creation",
            Operation::NativeCode => "native code loading",
            Operation::Network => "network access",
            Operation::Reflection => "reflective access",
            Operation::Environment => "environment access",
            Operation::ThreadCreation => "thread creation",
            Operation::SystemExit => "system exit",
        };
        f.write_str(name)
    }
}

/// A privileged operation denied by the sandbox policy.
///
/// Violations surface to the check runner and convert into `ERRORED` check
/// results carrying the denied operation's name; they never affect the
/// hosting process.
#[derive(Clone, Debug)]
pub struct SandboxViolation {
    /// Classification of the denied operation.
    pub operation: Operation,

    /// The import through which the operation was attempted.
    pub import: String,
}

impl Display for SandboxViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "denied {} ({})", self.operation, self.import)
    }
}

impl std::error::Error for SandboxViolation {}

/// The process-wide permission broker.
///
/// The broker must be engaged before the first submission byte is loaded and
/// stays engaged for the life of the slave. Loader contexts register their
/// trust level with the broker on creation; unregistered contexts are
/// treated as untrusted.
#[derive(Clone)]
pub struct PolicyBroker {
    contexts: Arc<Mutex<HashMap<ContextId, Trust>>>,
    engaged: Arc<AtomicBool>,
}

impl PolicyBroker {
    /// Create a new, not yet engaged broker.
    pub(crate) fn new() -> PolicyBroker {
        PolicyBroker {
            contexts: Arc::new(Mutex::new(HashMap::new())),
            engaged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Engage the policy. Idempotent.
    pub fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
        log::info!("sandbox policy engaged");
    }

    /// Test whether the policy has been engaged.
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Record the trust level of a loader context.
    pub(crate) fn register(&self, context: ContextId, trust: Trust) {
        self.contexts
            .lock()
            .expect("failed to lock broker state: poisoned")
            .insert(context, trust);
    }

    /// Forget a loader context.
    pub(crate) fn release(&self, context: ContextId) {
        self.contexts
            .lock()
            .expect("failed to lock broker state: poisoned")
            .remove(&context);
    }

    /// Get the trust level of the given context. Unregistered contexts are
    /// untrusted.
    pub fn trust_of(&self, context: ContextId) -> Trust {
        self.contexts
            .lock()
            .expect("failed to lock broker state: poisoned")
            .get(&context)
            .copied()
            .unwrap_or(Trust::Untrusted)
    }

    /// Decide an operation attempted by the given context. Returns `true` if
    /// the operation is allowed.
    pub fn consult(&self, context: ContextId, operation: Operation, import: &str) -> bool {
        if self.is_engaged() && self.trust_of(context) == Trust::Trusted {
            return true;
        }
        log::warn!(
            "context {} denied: {} ({})",
            context,
            operation,
            import
        );
        false
    }
}

/// Classify an import by the capability it would grant.
pub fn classify(module: &str, name: &str) -> Operation {
    match module {
        "wasi_snapshot_preview1" | "wasi_unstable" => classify_wasi(name),
        "wasi" | "wasi_threads" => {
            if name == "thread-spawn" {
                Operation::ThreadCreation
            } else {
                Operation::Environment
            }
        }
        "env" => Operation::NativeCode,
        _ => Operation::Reflection,
    }
}

fn classify_wasi(name: &str) -> Operation {
    if name == "proc_exit" {
        Operation::SystemExit
    } else if name == "proc_raise" {
        Operation::ProcessCreation
    } else if name.starts_with("path_") || name.starts_with("fd_") {
        Operation::FileSystem
    } else if name.starts_with("sock_") {
        Operation::Network
    } else if name.starts_with("environ_") {
        Operation::Environment
    } else {
        // clock_*, random_*, sched_yield, poll_oneoff and friends all leak
        // ambient process state.
        Operation::Environment
    }
}

/// Bind every function import of `module` outside the allowed surface to a
/// deny shim consulting the broker. Non-function imports are left undefined
/// and surface as instantiation faults.
pub(crate) fn link_deny_shims(
    linker: &mut Linker<HostState>,
    module: &Module,
    allowed: &[(&str, &str)],
) -> wasmtime::Result<()> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for import in module.imports() {
        let (module_name, import_name) = (import.module(), import.name());
        if allowed
            .iter()
            .any(|(m, n)| *m == module_name && *n == import_name)
        {
            continue;
        }
        if !seen.insert((module_name.to_owned(), import_name.to_owned())) {
            continue;
        }
        let func_ty = match import.ty() {
            ExternType::Func(func_ty) => func_ty,
            _ => continue,
        };

        let operation = classify(module_name, import_name);
        let import_path = format!("{}::{}", module_name, import_name);
        let result_types: Vec<ValType> = func_ty.results().collect();
        linker.func_new(
            module_name,
            import_name,
            func_ty.clone(),
            move |caller: Caller<'_, HostState>, _params: &[Val], results: &mut [Val]| {
                let state = caller.data();
                if state.broker.consult(state.context, operation, &import_path) {
                    for (slot, ty) in results.iter_mut().zip(result_types.iter()) {
                        *slot = zero_val(ty)?;
                    }
                    return Ok(());
                }
                Err(wasmtime::Error::new(SandboxViolation {
                    operation,
                    import: import_path.clone(),
                }))
            },
        )?;
    }
    Ok(())
}

fn zero_val(ty: &ValType) -> wasmtime::Result<Val> {
    Ok(match ty {
        ValType::I32 => Val::I32(0),
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        ValType::V128 => Val::V128(0u128.into()),
        ValType::Ref(_) => {
            return Err(wasmtime::Error::msg(
                "reference-typed host imports are not supported",
            ))
        }
    })
}
