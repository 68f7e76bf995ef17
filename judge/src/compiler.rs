//! This module implements the in-memory compiler. Source files are
//! WebAssembly text; the compiler assembles them to binary artifacts and
//! validates the artifacts against the execution engine without ever
//! touching the filesystem. User submissions and source-code checks go
//! through the same path, into distinct loader contexts.
//!

use std::collections::BTreeMap;

use sandbox::{Runtime, Trust};

use crate::{
    CompilationOutput, CompiledFile, CompiledSubmission, Diagnostic, ErrorKind, Result, Severity,
    Submission,
};

/// Compile an ordered list of `(qualified name, source text)` pairs.
///
/// Duplicate qualified names and empty input are compile errors; individual
/// file failures are collected as diagnostics rather than aborting the
/// batch.
pub fn compile(runtime: &Runtime, files: &[(String, String)]) -> CompilationOutput {
    let mut diagnostics = Vec::new();
    let mut artifacts = BTreeMap::new();

    if files.is_empty() {
        diagnostics.push(Diagnostic::error("", 0, 0, "no sources"));
        return CompilationOutput::new(diagnostics, artifacts);
    }

    for (qualified_name, source) in files {
        if artifacts.contains_key(qualified_name) {
            diagnostics.push(Diagnostic::error(
                qualified_name,
                0,
                0,
                &format!("duplicate qualified name \"{}\"", qualified_name),
            ));
            continue;
        }

        let wasm = match wat::parse_str(source) {
            Ok(wasm) => wasm,
            Err(error) => {
                diagnostics.push(syntax_diagnostic(qualified_name, &error));
                continue;
            }
        };

        if let Err(message) = runtime.validate(&wasm) {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                file: qualified_name.clone(),
                line: 0,
                column: 0,
                message,
            });
            continue;
        }

        artifacts.insert(qualified_name.clone(), wasm);
    }

    let output = CompilationOutput::new(diagnostics, artifacts);
    log::info!(
        "compiled {} file(s): successful = {}, {} diagnostic(s)",
        files.len(),
        output.successful,
        output.diagnostics.len()
    );
    output
}

/// Compile a submission and load the artifacts into a fresh untrusted
/// context. A failed compilation is returned as
/// `ErrorKind::Compilation(output)`.
pub fn compile_and_load(runtime: &Runtime, submission: &Submission) -> Result<CompiledSubmission> {
    let files: Vec<(String, String)> = submission
        .files
        .iter()
        .map(|(name, source)| (name.clone(), source.clone()))
        .collect();

    let output = compile(runtime, &files);
    if !output.successful {
        bail!(ErrorKind::Compilation(output));
    }

    let context = runtime.create_context(Trust::Untrusted);
    let mut compiled = Vec::new();
    for (qualified_name, artifact) in &output.artifacts {
        let module = context.load(qualified_name, artifact)?;
        compiled.push(CompiledFile {
            qualified_name: qualified_name.clone(),
            module,
        });
    }

    Ok(CompiledSubmission {
        output,
        context,
        files: compiled,
        entry_hint: submission.entry_hint.clone(),
    })
}

/// Normalize a wat assembler error into the diagnostic shape. The assembler
/// renders the offending location as `--> <path>:line:column`; when the
/// rendering carries no location the diagnostic points at line 0.
fn syntax_diagnostic(qualified_name: &str, error: &wat::Error) -> Diagnostic {
    let rendered = error.to_string();
    let (line, column) = locate(&rendered).unwrap_or((0, 0));
    let message = rendered
        .lines()
        .next()
        .unwrap_or("syntax error")
        .to_owned();
    Diagnostic {
        severity: Severity::Error,
        file: qualified_name.to_owned(),
        line,
        column,
        message,
    }
}

fn locate(rendered: &str) -> Option<(u32, u32)> {
    for line in rendered.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("--> ") {
            let mut parts = rest.rsplitn(3, ':');
            let column = parts.next()?.trim().parse().ok()?;
            let line_number = parts.next()?.trim().parse().ok()?;
            return Some((line_number, column));
        }
    }
    None
}
