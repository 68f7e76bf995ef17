//! This module implements the check runner: the loop that applies every
//! check to every compiled main entry point, converts per-invocation faults
//! into check results and aggregates everything into a
//! `SubmissionCheckResult`.
//!
//! Check execution is strictly sequential; the terminal interceptor and the
//! sandbox policy keep per-context state, so concurrent invocations within
//! one context are not allowed.
//!

use std::time::Duration;

use sandbox::{CheckVerdict, InvocationError, LoaderContext};

use crate::checks::{Check, CheckSet, CompiledCheck, IoCheck};
use crate::{CheckResult, CompiledFile, CompiledSubmission, SubmissionCheckResult, SUBMISSION_WIDE};

/// Runs checks against a compiled submission under a per-invocation
/// wall-clock budget.
pub struct CheckRunner {
    budget: Duration,
}

impl CheckRunner {
    /// Create a new runner with the given per-invocation wall-clock budget.
    pub fn new(budget: Duration) -> CheckRunner {
        CheckRunner { budget }
    }

    /// Run every check of the set against the submission.
    ///
    /// Checks run in declaration order; files are visited in lexicographic
    /// order of their qualified names. Every fault of a single invocation is
    /// converted into one `ERRORED` result and never aborts the submission.
    pub fn check_submission(
        &self,
        submission: &CompiledSubmission,
        set: &CheckSet,
    ) -> SubmissionCheckResult {
        let files = submission.files_with_entry_point();
        if files.is_empty() {
            log::warn!("submission contains no main entry point");
        }

        let mut result = SubmissionCheckResult::default();
        for check in &set.checks {
            match check {
                Check::Import(import_check) => {
                    result.add(import_check.run(submission));
                }
                Check::Io(io_check) => {
                    if files.is_empty() {
                        result.add(no_entry_point(io_check.name.as_str()));
                        continue;
                    }
                    for file in &files {
                        result.add(self.run_io_check(io_check, submission, file));
                    }
                }
                Check::Compiled(compiled_check) => {
                    if files.is_empty() {
                        result.add(no_entry_point(compiled_check.name.as_str()));
                        continue;
                    }
                    let context = set
                        .context
                        .as_ref()
                        .expect("compiled check without a check context");
                    for file in &files {
                        result.add(self.run_compiled_check(
                            compiled_check,
                            context,
                            submission,
                            file,
                        ));
                    }
                }
            }
        }
        result
    }

    /// Run one IO check against one file: reset the interceptor, install the
    /// input, invoke the entry point under the budget and compare outputs.
    fn run_io_check(
        &self,
        check: &IoCheck,
        submission: &CompiledSubmission,
        file: &CompiledFile,
    ) -> CheckResult {
        log::debug!("running io check \"{}\" on {}", check.name, file.qualified_name);
        let context = &submission.context;
        context.reset_terminal();
        context.set_input(&check.input);

        let run = context.invoke_entry(&file.module, self.budget);
        let output = context.output();
        let error_output = context.error_output();

        let result = match run {
            Ok(()) => {
                let actual = normalize_eol(&output);
                let expected = normalize_eol(&check.expected_output);
                if actual == expected {
                    CheckResult::passed(&check.name, &file.qualified_name, "ok".to_owned())
                } else {
                    CheckResult::failed(
                        &check.name,
                        &file.qualified_name,
                        format!(
                            "the output of {} was\n'{}'\nexpected\n'{}'",
                            file.qualified_name, actual, expected
                        ),
                    )
                }
            }
            Err(error) => self.fault_result(&check.name, file, error),
        };
        result.with_output(output, error_output)
    }

    /// Run one compiled check against one file. The check drives the file
    /// itself through the check host surface.
    fn run_compiled_check(
        &self,
        check: &CompiledCheck,
        check_context: &LoaderContext,
        submission: &CompiledSubmission,
        file: &CompiledFile,
    ) -> CheckResult {
        log::debug!(
            "running compiled check \"{}\" on {}",
            check.name,
            file.qualified_name
        );
        submission.context.reset_terminal();

        let verdict = check_context.run_check(&check.module, &file.module, self.budget);
        let output = submission.context.output();
        let error_output = submission.context.error_output();

        let result = match verdict {
            Ok(CheckVerdict::Passed) => {
                CheckResult::passed(&check.name, &file.qualified_name, "ok".to_owned())
            }
            Ok(CheckVerdict::Failed(message)) => {
                CheckResult::failed(&check.name, &file.qualified_name, message)
            }
            Err(error) => self.fault_result(&check.name, file, error),
        };
        result.with_output(output, error_output)
    }

    /// Convert an invocation fault into an `ERRORED` result.
    fn fault_result(
        &self,
        check_name: &str,
        file: &CompiledFile,
        error: InvocationError,
    ) -> CheckResult {
        let message = match &error {
            InvocationError::Timeout => {
                format!("timeout after {} ms", self.budget.as_millis())
            }
            other => other.to_string(),
        };
        log::debug!(
            "check \"{}\" on {} errored: {}",
            check_name,
            file.qualified_name,
            message
        );
        CheckResult::errored(check_name, &file.qualified_name, message)
    }
}

/// The non-fatal result recorded when a user-code check finds no main entry
/// point to drive.
fn no_entry_point(check_name: &str) -> CheckResult {
    CheckResult::skipped(
        check_name,
        SUBMISSION_WIDE,
        "no main entry point in submission".to_owned(),
    )
}

fn normalize_eol(text: &str) -> String {
    text.replace("\r\n", "\n")
}
