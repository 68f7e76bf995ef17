//! This module implements the host surface offered to dynamically compiled
//! checks. A compiled check is untrusted code like any submission, but it
//! drives the file under test itself: it installs input, runs the target's
//! entry point and inspects the captured output, all through the `check`
//! import module:
//!
//! * `set_input(ptr, len)` — install the scripted input (text, one line per
//! line feed) for the next target run;
//!
//! * `run_target() -> 0` — run the target's entry point under the
//! interceptor; faults of the target abort the check;
//!
//! * `output_len() -> len` and `read_output(ptr, cap) -> len` — the output
//! captured during the last target run;
//!
//! * `file_name(ptr, cap) -> len` — the qualified name of the file under
//! test;
//!
//! * `fail(ptr, len)` — record a failure message and abort the check.
//!

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use wasmtime::{Caller, Linker};

use crate::context::{self, HostState, LoadedModule, RuntimeInner};
use crate::policy;
use crate::terminal::{read_guest, write_guest};
use crate::InvocationError;

/// Name of the import module offered to compiled checks.
pub(crate) const IMPORT_MODULE: &str = "check";

/// The import surface offered to compiled checks.
pub(crate) const SURFACE: &[(&str, &str)] = &[
    (IMPORT_MODULE, "set_input"),
    (IMPORT_MODULE, "run_target"),
    (IMPORT_MODULE, "output_len"),
    (IMPORT_MODULE, "read_output"),
    (IMPORT_MODULE, "file_name"),
    (IMPORT_MODULE, "fail"),
];

/// Name of the entry point a compiled check must export.
const CHECK_ENTRY: &str = "run_check";

/// Verdict of a completed compiled-check invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CheckVerdict {
    /// The check ran to completion without recording a failure.
    Passed,

    /// The check recorded a failure through `fail`.
    Failed(String),
}

/// Marker error used to unwind a check invocation after `fail`.
#[derive(Debug)]
struct CheckFailure(String);

impl Display for CheckFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "check failed: {}", self.0)
    }
}

impl std::error::Error for CheckFailure {}

/// Host-side state of one compiled-check invocation.
pub(crate) struct CheckState {
    target: LoadedModule,
    budget: Duration,
    pending_input: Vec<String>,
    last_output: String,
    failure: Option<String>,
}

/// Run a compiled check against a target artifact.
pub(crate) fn run_compiled_check(
    runtime: &Arc<RuntimeInner>,
    check: &LoadedModule,
    target: &LoadedModule,
    budget: Duration,
) -> std::result::Result<CheckVerdict, InvocationError> {
    let state = CheckState {
        target: target.clone(),
        budget,
        pending_input: Vec::new(),
        last_output: String::new(),
        failure: None,
    };
    let mut store = context::new_store(runtime, check.context, Some(state));
    let mut linker: Linker<HostState> = Linker::new(&runtime.engine);
    register(&mut linker).map_err(|e| InvocationError::Faulted(e.to_string()))?;
    policy::link_deny_shims(&mut linker, &check.module, SURFACE)
        .map_err(|e| InvocationError::Faulted(e.to_string()))?;

    store.set_epoch_deadline(context::deadline_ticks(&runtime.config, budget));
    let instance = linker
        .instantiate(&mut store, &check.module)
        .map_err(context::map_call_error)?;
    let func = instance.get_func(&mut store, CHECK_ENTRY).ok_or_else(|| {
        InvocationError::Faulted(format!(
            "check module exports no `{}` function",
            CHECK_ENTRY
        ))
    })?;

    let call = context::call_nullary(&mut store, &func);

    // A recorded failure takes precedence over the unwinding trap it rides
    // out on.
    if let Some(message) = store
        .data()
        .check
        .as_ref()
        .and_then(|check| check.failure.clone())
    {
        return Ok(CheckVerdict::Failed(message));
    }
    call.map(|_| CheckVerdict::Passed)
}

fn register(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "set_input",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let data = read_guest(&mut caller, ptr, len)?;
            let text = String::from_utf8_lossy(&data).into_owned();
            let lines = split_lines(&text);
            if let Some(check) = caller.data_mut().check.as_mut() {
                check.pending_input = lines;
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "run_target",
        |mut caller: Caller<'_, HostState>| -> wasmtime::Result<i32> {
            let (runtime, target, budget, input) = {
                let state = caller.data();
                let check = state
                    .check
                    .as_ref()
                    .ok_or_else(|| wasmtime::Error::msg("no check state"))?;
                (
                    state.runtime.clone(),
                    check.target.clone(),
                    check.budget,
                    check.pending_input.clone(),
                )
            };

            let terminal = runtime.terminal.clone();
            terminal.reset(target.context());
            terminal.set_input(target.context(), &input);
            let run = context::invoke_module(&runtime, &target, budget);
            let output = terminal.output(target.context());
            if let Some(check) = caller.data_mut().check.as_mut() {
                check.last_output = output;
            }

            match run {
                Ok(()) => Ok(0),
                Err(error) => Err(wasmtime::Error::new(error)),
            }
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "output_len",
        |caller: Caller<'_, HostState>| -> i32 {
            caller
                .data()
                .check
                .as_ref()
                .map(|check| check.last_output.len() as i32)
                .unwrap_or(0)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "read_output",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let output = caller
                .data()
                .check
                .as_ref()
                .map(|check| check.last_output.clone())
                .unwrap_or_default();
            let bytes = output.as_bytes();
            let copied = bytes.len().min(cap.max(0) as usize);
            write_guest(&mut caller, ptr, &bytes[..copied])?;
            Ok(copied as i32)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "file_name",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let name = caller
                .data()
                .check
                .as_ref()
                .map(|check| check.target.qualified_name().to_owned())
                .unwrap_or_default();
            let bytes = name.as_bytes();
            let copied = bytes.len().min(cap.max(0) as usize);
            write_guest(&mut caller, ptr, &bytes[..copied])?;
            Ok(copied as i32)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "fail",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let data = read_guest(&mut caller, ptr, len)?;
            let message = String::from_utf8_lossy(&data).into_owned();
            if let Some(check) = caller.data_mut().check.as_mut() {
                check.failure = Some(message.clone());
            }
            Err(wasmtime::Error::new(CheckFailure(message)))
        },
    )?;

    Ok(())
}

/// Split scripted input text into lines, dropping the trailing terminator.
fn split_lines(text: &str) -> Vec<String> {
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('\n').map(|line| line.to_owned()).collect()
}
