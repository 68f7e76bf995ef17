//! This crate implements the check engine hosted by the codetester slave.
//! The engine receives a submission and a list of check specifications from
//! the trusted master, compiles the submission entirely in memory, loads it
//! into a disposable context of the `sandbox` crate and runs every check
//! against every compiled main entry point.
//!

#[macro_use]
extern crate error_chain;

pub mod checks;
pub mod compiler;
pub mod protocol;
pub mod runner;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
    }

    links {
        Sandbox(::sandbox::Error, ::sandbox::ErrorKind);
    }

    errors {
        Compilation(output: CompilationOutput) {
            description("compilation failed")
            display("compilation failed with {} diagnostic(s)", output.diagnostics.len())
        }

        MalformedCheck(message: String) {
            description("malformed check payload")
            display("malformed check payload: {}", message)
        }

        FrameTooLarge(length: usize) {
            description("frame exceeds the maximum length")
            display("frame of {} bytes exceeds the maximum length", length)
        }
    }
}

/// Reserved qualified name under which submission-wide check results are
/// recorded. Qualified names of compiled files never contain `<`.
pub const SUBMISSION_WIDE: &str = "<submission>";

/// An immutable bundle of source files submitted for checking.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Source text keyed by qualified name.
    pub files: BTreeMap<String, String>,

    /// Optional qualified name of the file whose entry point should be
    /// driven. When absent, every file with an entry point is driven.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_hint: Option<String>,
}

/// Severity of a compilation diagnostic.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// A single diagnostic produced by the in-memory compiler.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl Diagnostic {
    /// Create a new error-severity diagnostic.
    pub fn error(file: &str, line: u32, column: u32, message: &str) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            file: file.to_owned(),
            line,
            column,
            message: message.to_owned(),
        }
    }
}

/// Result of compiling a set of source files in memory.
///
/// The compiled artifacts are opaque blobs meaningful only to the isolated
/// loader; they never travel back to the master.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationOutput {
    /// Whether compilation succeeded: no error diagnostic and at least one
    /// artifact.
    pub successful: bool,

    /// Diagnostics in the order the compiler reported them.
    pub diagnostics: Vec<Diagnostic>,

    /// Compiled artifacts keyed by qualified name.
    #[serde(skip)]
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

impl CompilationOutput {
    /// Create a new `CompilationOutput`, deriving the `successful` flag.
    pub fn new(diagnostics: Vec<Diagnostic>, artifacts: BTreeMap<String, Vec<u8>>) -> Self {
        let successful = !artifacts.is_empty()
            && !diagnostics
                .iter()
                .any(|diagnostic| diagnostic.severity == Severity::Error);
        CompilationOutput {
            successful,
            diagnostics,
            artifacts,
        }
    }
}

/// Outcome of a single check invocation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Passed,
    Failed,
    Errored,
    Skipped,
}

/// Result of running one check against one compiled file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub check_name: String,
    pub file_qualified_name: String,
    pub outcome: Outcome,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_output: Option<String>,
}

impl CheckResult {
    pub fn passed(check: &str, file: &str, message: String) -> CheckResult {
        CheckResult::new(check, file, Outcome::Passed, message)
    }

    pub fn failed(check: &str, file: &str, message: String) -> CheckResult {
        CheckResult::new(check, file, Outcome::Failed, message)
    }

    pub fn errored(check: &str, file: &str, message: String) -> CheckResult {
        CheckResult::new(check, file, Outcome::Errored, message)
    }

    pub fn skipped(check: &str, file: &str, message: String) -> CheckResult {
        CheckResult::new(check, file, Outcome::Skipped, message)
    }

    fn new(check: &str, file: &str, outcome: Outcome, message: String) -> CheckResult {
        CheckResult {
            check_name: check.to_owned(),
            file_qualified_name: file.to_owned(),
            outcome,
            message,
            captured_output: None,
            error_output: None,
        }
    }

    /// Attach the captured output streams of the invocation. Empty streams
    /// are elided.
    pub fn with_output(mut self, output: String, error_output: String) -> CheckResult {
        if !output.is_empty() {
            self.captured_output = Some(output);
        }
        if !error_output.is_empty() {
            self.error_output = Some(error_output);
        }
        self
    }
}

/// Aggregated results of one submission: check results keyed by file
/// qualified name, files in lexicographic order, results per file in check
/// declaration order.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionCheckResult {
    pub file_results: BTreeMap<String, Vec<CheckResult>>,
}

impl SubmissionCheckResult {
    /// Record a check result under its file's qualified name.
    pub fn add(&mut self, result: CheckResult) {
        self.file_results
            .entry(result.file_qualified_name.clone())
            .or_insert_with(Vec::new)
            .push(result);
    }

    /// Total number of recorded check results.
    pub fn len(&self) -> usize {
        self.file_results.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single compiled artifact within a submission.
#[derive(Debug)]
pub struct CompiledFile {
    /// Qualified name of the source file the artifact was compiled from.
    pub qualified_name: String,

    /// The artifact, loaded into the submission's context.
    pub module: sandbox::LoadedModule,
}

/// A submission compiled in memory and loaded into its own disposable
/// context. Dropping the value releases the context.
#[derive(Debug)]
pub struct CompiledSubmission {
    pub output: CompilationOutput,
    pub context: sandbox::LoaderContext,
    pub files: Vec<CompiledFile>,
    pub entry_hint: Option<String>,
}

impl CompiledSubmission {
    /// The files a user-code check should drive: files with a main entry
    /// point, sorted by qualified name. A matching entry hint narrows the
    /// selection to the hinted file.
    pub fn files_with_entry_point(&self) -> Vec<&CompiledFile> {
        let mut files: Vec<&CompiledFile> = self
            .files
            .iter()
            .filter(|file| file.module.has_entry_point())
            .collect();
        if let Some(hint) = &self.entry_hint {
            if files.iter().any(|file| &file.qualified_name == hint) {
                files.retain(|file| &file.qualified_name == hint);
            }
        }
        files
    }
}
