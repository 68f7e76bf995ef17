//! This module implements the terminal interceptor. For the duration of a
//! single invocation the interceptor is the only standard I/O the executing
//! code can see: reads return the scripted input lines one per call and
//! signal a deterministic end-of-input after exhaustion, writes append to a
//! capture buffer owned by the judge.
//!
//! Buffers are keyed by loader context, so concurrent invocations in
//! different contexts cannot observe each other's I/O. Within one context
//! the check runner serializes invocations.
//!
//! The guest-facing surface is the `terminal` import module:
//!
//! * `read_line(ptr, cap) -> len` — copy the next input line (without its
//! terminator) into guest memory; returns the number of bytes copied, or
//! `-1` once the input is exhausted;
//!
//! * `write(ptr, len)` — append to the captured output;
//!
//! * `write_error(ptr, len)` — append to the captured error output.
//!

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use wasmtime::{Caller, Extern, Linker, Memory};

use crate::context::{ContextId, HostState};

/// Name of the guest-facing import module.
pub(crate) const IMPORT_MODULE: &str = "terminal";

/// The import surface the interceptor provides to executing code.
pub(crate) const SURFACE: &[(&str, &str)] = &[
    (IMPORT_MODULE, "read_line"),
    (IMPORT_MODULE, "write"),
    (IMPORT_MODULE, "write_error"),
];

/// Per-context terminal state.
struct TermBuf {
    /// Remaining scripted input lines.
    input: VecDeque<String>,

    /// Captured output of the current invocation.
    output: String,

    /// Captured error output of the current invocation.
    error: String,
}

impl TermBuf {
    fn new() -> TermBuf {
        TermBuf {
            input: VecDeque::new(),
            output: String::new(),
            error: String::new(),
        }
    }
}

/// The terminal interceptor. Cheap to clone; all clones share the buffers.
#[derive(Clone)]
pub struct Terminal {
    buffers: Arc<Mutex<HashMap<ContextId, TermBuf>>>,
    max_output: usize,
}

impl Terminal {
    pub(crate) fn new(max_output: usize) -> Terminal {
        Terminal {
            buffers: Arc::new(Mutex::new(HashMap::new())),
            max_output,
        }
    }

    pub(crate) fn attach(&self, context: ContextId) {
        self.lock().insert(context, TermBuf::new());
    }

    pub(crate) fn detach(&self, context: ContextId) {
        self.lock().remove(&context);
    }

    /// Install the scripted input for the next invocation in the given
    /// context.
    pub fn set_input(&self, context: ContextId, lines: &[String]) {
        if let Some(buf) = self.lock().get_mut(&context) {
            buf.input = lines.iter().cloned().collect();
        }
    }

    /// Discard all input and captured output of the given context.
    pub fn reset(&self, context: ContextId) {
        if let Some(buf) = self.lock().get_mut(&context) {
            buf.input.clear();
            buf.output.clear();
            buf.error.clear();
        }
    }

    /// Get the output captured in the given context since the last reset.
    pub fn output(&self, context: ContextId) -> String {
        self.lock()
            .get(&context)
            .map(|buf| buf.output.clone())
            .unwrap_or_default()
    }

    /// Get the error output captured in the given context since the last
    /// reset.
    pub fn error_output(&self, context: ContextId) -> String {
        self.lock()
            .get(&context)
            .map(|buf| buf.error.clone())
            .unwrap_or_default()
    }

    pub(crate) fn read_line(&self, context: ContextId) -> Option<String> {
        self.lock().get_mut(&context).and_then(|buf| buf.input.pop_front())
    }

    pub(crate) fn push_output(&self, context: ContextId, text: &str) {
        let max_output = self.max_output;
        if let Some(buf) = self.lock().get_mut(&context) {
            append_capped(&mut buf.output, text, max_output);
        }
    }

    pub(crate) fn push_error(&self, context: ContextId, text: &str) {
        let max_output = self.max_output;
        if let Some(buf) = self.lock().get_mut(&context) {
            append_capped(&mut buf.error, text, max_output);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ContextId, TermBuf>> {
        self.buffers
            .lock()
            .expect("failed to lock terminal buffers: poisoned")
    }
}

/// Append `text` to `buffer`, normalizing end-of-line terminators to line
/// feeds and truncating once the buffer reaches `max` bytes.
fn append_capped(buffer: &mut String, text: &str, max: usize) {
    let normalized = text.replace("\r\n", "\n");
    let remaining = max.saturating_sub(buffer.len());
    if normalized.len() <= remaining {
        buffer.push_str(&normalized);
    } else {
        let mut cut = remaining;
        while cut > 0 && !normalized.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.push_str(&normalized[..cut]);
    }
}

/// Register the guest-facing terminal surface into the given linker.
pub(crate) fn register(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "read_line",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let line = {
                let state = caller.data();
                state.terminal.read_line(state.context)
            };
            let line = match line {
                Some(line) => line,
                None => return Ok(-1),
            };
            let bytes = line.as_bytes();
            let copied = bytes.len().min(cap.max(0) as usize);
            write_guest(&mut caller, ptr, &bytes[..copied])?;
            Ok(copied as i32)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "write",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let data = read_guest(&mut caller, ptr, len)?;
            let text = String::from_utf8_lossy(&data).into_owned();
            let state = caller.data();
            state.terminal.push_output(state.context, &text);
            Ok(())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "write_error",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let data = read_guest(&mut caller, ptr, len)?;
            let text = String::from_utf8_lossy(&data).into_owned();
            let state = caller.data();
            state.terminal.push_error(state.context, &text);
            Ok(())
        },
    )?;

    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(wasmtime::Error::msg(
            "module exports no linear memory named `memory`",
        )),
    }
}

/// Read `len` bytes at `ptr` from the calling module's linear memory.
pub(crate) fn read_guest(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Vec<u8>> {
    if ptr < 0 || len < 0 {
        return Err(wasmtime::Error::msg("negative pointer or length"));
    }
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| wasmtime::Error::msg("pointer overflow"))?;
    if end > data.len() {
        return Err(wasmtime::Error::msg("memory read out of bounds"));
    }
    Ok(data[start..end].to_vec())
}

/// Copy `bytes` into the calling module's linear memory at `ptr`.
pub(crate) fn write_guest(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    bytes: &[u8],
) -> wasmtime::Result<()> {
    if ptr < 0 {
        return Err(wasmtime::Error::msg("negative pointer"));
    }
    let memory = guest_memory(caller)?;
    let start = ptr as usize;
    let end = start
        .checked_add(bytes.len())
        .ok_or_else(|| wasmtime::Error::msg("pointer overflow"))?;
    let data = memory.data_mut(&mut *caller);
    if end > data.len() {
        return Err(wasmtime::Error::msg("memory write out of bounds"));
    }
    data[start..end].copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn reads_return_lines_then_eof() {
        let terminal = Terminal::new(1024);
        let id = ContextId::new(1);
        terminal.attach(id);
        terminal.set_input(id, &lines(&["first", "second"]));

        assert_eq!(terminal.read_line(id), Some("first".to_owned()));
        assert_eq!(terminal.read_line(id), Some("second".to_owned()));
        assert_eq!(terminal.read_line(id), None);
        assert_eq!(terminal.read_line(id), None);
    }

    #[test]
    fn writes_are_normalized_to_line_feeds() {
        let terminal = Terminal::new(1024);
        let id = ContextId::new(2);
        terminal.attach(id);
        terminal.push_output(id, "one\r\ntwo\r\n");
        assert_eq!(terminal.output(id), "one\ntwo\n");
    }

    #[test]
    fn reset_discards_input_and_output() {
        let terminal = Terminal::new(1024);
        let id = ContextId::new(3);
        terminal.attach(id);
        terminal.set_input(id, &lines(&["stale"]));
        terminal.push_output(id, "stale output");
        terminal.push_error(id, "stale error");

        terminal.reset(id);

        assert_eq!(terminal.read_line(id), None);
        assert_eq!(terminal.output(id), "");
        assert_eq!(terminal.error_output(id), "");
    }

    #[test]
    fn contexts_do_not_interfere() {
        let terminal = Terminal::new(1024);
        let (a, b) = (ContextId::new(4), ContextId::new(5));
        terminal.attach(a);
        terminal.attach(b);

        terminal.set_input(a, &lines(&["for a"]));
        terminal.push_output(a, "a says hi\n");
        terminal.push_output(b, "b says hi\n");

        assert_eq!(terminal.output(a), "a says hi\n");
        assert_eq!(terminal.output(b), "b says hi\n");
        assert_eq!(terminal.read_line(b), None);
        assert_eq!(terminal.read_line(a), Some("for a".to_owned()));
    }

    #[test]
    fn output_is_capped() {
        let terminal = Terminal::new(8);
        let id = ContextId::new(6);
        terminal.attach(id);
        terminal.push_output(id, "0123456789");
        assert_eq!(terminal.output(id), "01234567");
    }

    #[test]
    fn detached_contexts_are_inert() {
        let terminal = Terminal::new(1024);
        let id = ContextId::new(7);
        terminal.push_output(id, "dropped");
        assert_eq!(terminal.output(id), "");
        assert_eq!(terminal.read_line(id), None);
    }
}
