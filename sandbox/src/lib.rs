//! This crate implements the isolation layer of the codetester slave. The
//! slave executes code it must assume to be hostile, so every submitted
//! artifact is confined to a disposable loader context backed by a
//! WebAssembly store.
//!
//! The crate implements:
//!
//! * Loader contexts: fresh, disposable namespaces for compiled artifacts;
//! two submissions never share a context;
//!
//! * Terminal interception: scripted standard input and captured standard
//! output for the duration of a single invocation, keyed by loader context;
//!
//! * The sandbox policy: a deny-by-default permission broker consulted on
//! every privileged operation the loaded code attempts;
//!
//! * Wall-clock budgets: runaway invocations are aborted through epoch
//! interruption.
//!

#[macro_use]
extern crate error_chain;

mod check_api;
mod context;
mod policy;
mod terminal;

pub use check_api::CheckVerdict;
pub use context::{ContextId, LoadedModule, LoaderContext, ModuleImport, Runtime};
pub use policy::{Operation, PolicyBroker, SandboxViolation, Trust};
pub use terminal::Terminal;

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        Engine(message: String) {
            description("execution engine error")
            display("execution engine error: {}", message)
        }

        PolicyNotEngaged {
            description("the sandbox policy has not been engaged")
        }

        InvalidModule(name: String, message: String) {
            description("invalid module")
            display("invalid module \"{}\": {}", name, message)
        }
    }
}

/// Measurement of the size of a block of memory.
#[derive(Clone, Copy, Debug, Eq)]
pub enum MemorySize {
    /// Measurement in bytes.
    Bytes(usize),

    /// Measurement in kilobytes.
    KiloBytes(usize),

    /// Measurement in megabytes.
    MegaBytes(usize),

    /// Measurement in gigabytes.
    GigaBytes(usize),
}

impl MemorySize {
    /// Convert the current measurement to memory size in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            MemorySize::Bytes(s) => *s,
            MemorySize::KiloBytes(s) => s * 1024,
            MemorySize::MegaBytes(s) => s * 1024 * 1024,
            MemorySize::GigaBytes(s) => s * 1024 * 1024 * 1024,
        }
    }
}

impl PartialEq for MemorySize {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl From<usize> for MemorySize {
    fn from(value: usize) -> MemorySize {
        MemorySize::Bytes(value)
    }
}

impl Display for MemorySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MemorySize::Bytes(s) => write!(f, "{} B", s),
            MemorySize::KiloBytes(s) => write!(f, "{} KB", s),
            MemorySize::MegaBytes(s) => write!(f, "{} MB", s),
            MemorySize::GigaBytes(s) => write!(f, "{} GB", s),
        }
    }
}

/// Configuration of the isolation runtime.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// Upper bound on the linear memory available to one invocation.
    pub max_memory: MemorySize,

    /// Granularity of the wall-clock budget enforcement.
    pub epoch_tick: Duration,

    /// Upper bound on the captured output of one invocation, in bytes.
    pub max_output: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_memory: MemorySize::MegaBytes(256),
            epoch_tick: Duration::from_millis(10),
            max_output: 1024 * 1024,
        }
    }
}

/// Represent the reason a single invocation of loaded code did not run to
/// completion.
///
/// Invocation errors are scoped to one invocation and never poison the
/// hosting process; the caller converts them into per-check results.
#[derive(Clone, Debug)]
pub enum InvocationError {
    /// The wall-clock budget expired before the invocation returned.
    Timeout,

    /// The code attempted an operation the sandbox policy denies.
    Violation(SandboxViolation),

    /// The code faulted: it trapped, failed to instantiate, or exhausted a
    /// resource limit.
    Faulted(String),

    /// The module exposes no main entry point.
    NoEntryPoint,
}

impl Display for InvocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            InvocationError::Timeout => write!(f, "timeout"),
            InvocationError::Violation(violation) => write!(f, "{}", violation),
            InvocationError::Faulted(message) => write!(f, "execution fault: {}", message),
            InvocationError::NoEntryPoint => write!(f, "no main entry point"),
        }
    }
}

impl std::error::Error for InvocationError {}
