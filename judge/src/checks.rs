//! This module implements the check model: the typed representation of IO
//! checks, import checks and dynamically compiled checks, plus the
//! deserialization of check payloads received from the master.
//!
//! Payloads are decoded leniently with respect to unknown fields (persisted
//! checks accumulate cruft over the years) but strictly with respect to the
//! two competing IO encodings: a payload carrying both forms is rejected
//! outright instead of guessing.
//!

use serde_json::Value;

use sandbox::{LoadedModule, LoaderContext, Runtime, Trust};

use crate::compiler;
use crate::protocol::{CheckEnvelope, CheckType};
use crate::{
    CheckResult, CompiledSubmission, ErrorKind, Result, SUBMISSION_WIDE,
};

/// How a check is applied to a submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckScope {
    /// Run once per compiled file with a main entry point.
    UserCodeMain,

    /// Run once against the whole submission, without executing user code.
    StaticTest,
}

/// A check ready to run, as a tagged variant with a common capability set:
/// every variant has a name, a scope and a way to produce check results.
#[derive(Debug)]
pub enum Check {
    Io(IoCheck),
    Import(ImportCheck),
    Compiled(CompiledCheck),
}

impl Check {
    /// Get the check's display name.
    pub fn name(&self) -> &str {
        match self {
            Check::Io(check) => &check.name,
            Check::Import(check) => &check.name,
            Check::Compiled(check) => &check.name,
        }
    }

    /// Get the check's scope.
    pub fn scope(&self) -> CheckScope {
        match self {
            Check::Io(..) | Check::Compiled(..) => CheckScope::UserCodeMain,
            Check::Import(..) => CheckScope::StaticTest,
        }
    }
}

/// A static input/output check: run each main entry point with fixed input
/// and compare the captured output against the expected output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoCheck {
    pub name: String,
    pub input: Vec<String>,
    pub expected_output: String,
}

impl IoCheck {
    /// Decode an IO check payload. Two encodings are accepted: the classic
    /// `{input: [...], expectedOutput, name}` form and the interleaved
    /// `{text, name}` form where lines starting with `"> "` are input and
    /// all other lines are expected output. A payload carrying both forms
    /// is malformed.
    pub fn from_payload(payload: &str) -> Result<IoCheck> {
        let value: Value = serde_json::from_str(payload)?;
        let object = value
            .as_object()
            .ok_or_else(|| ErrorKind::MalformedCheck("io check is not an object".to_owned()))?;

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorKind::MalformedCheck("io check has no name".to_owned()))?
            .to_owned();

        let classic = object.contains_key("input")
            || object.contains_key("expectedOutput")
            || object.contains_key("output");
        let interleaved = object.contains_key("text");

        if classic && interleaved {
            bail!(ErrorKind::MalformedCheck(format!(
                "io check \"{}\" carries both the classic and the interleaved encoding",
                name
            )));
        }

        if interleaved {
            let text = object
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ErrorKind::MalformedCheck("interleaved io text is not a string".to_owned())
                })?;
            return Ok(IoCheck::from_interleaved(name, text));
        }

        let input = match object.get("input") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_owned).ok_or_else(|| {
                        ErrorKind::MalformedCheck("io input line is not a string".to_owned())
                            .into()
                    })
                })
                .collect::<Result<Vec<String>>>()?,
            Some(..) => {
                bail!(ErrorKind::MalformedCheck(
                    "io input is not an array".to_owned()
                ));
            }
            None => Vec::new(),
        };

        // `output` is the field name used by checks persisted before the
        // rename to `expectedOutput`.
        let expected_output = object
            .get("expectedOutput")
            .or_else(|| object.get("output"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ErrorKind::MalformedCheck("io check has no expected output".to_owned())
            })?
            .to_owned();

        Ok(IoCheck {
            name,
            input,
            expected_output,
        })
    }

    fn from_interleaved(name: String, text: &str) -> IoCheck {
        let mut input = Vec::new();
        let mut output_lines = Vec::new();
        for line in text.lines() {
            match line.strip_prefix("> ") {
                Some(rest) => input.push(rest.to_owned()),
                None => output_lines.push(line),
            }
        }
        let expected_output = if output_lines.is_empty() {
            String::new()
        } else {
            format!("{}\n", output_lines.join("\n"))
        };
        IoCheck {
            name,
            input,
            expected_output,
        }
    }
}

/// A static inspection of the imports the compiled artifacts declare; never
/// executes user code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImportCheck {
    pub name: String,
    pub forbidden: Vec<String>,
    pub required: Vec<String>,
}

impl ImportCheck {
    /// Decode an import check payload.
    pub fn from_payload(payload: &str) -> Result<ImportCheck> {
        #[derive(serde::Deserialize)]
        struct Payload {
            name: String,
            #[serde(default)]
            forbidden: Vec<String>,
            #[serde(default)]
            required: Vec<String>,
        }

        let payload: Payload = serde_json::from_str(payload)
            .map_err(|e| ErrorKind::MalformedCheck(format!("import check: {}", e)))?;
        Ok(ImportCheck {
            name: payload.name,
            forbidden: payload.forbidden,
            required: payload.required,
        })
    }

    /// Inspect the whole submission once.
    pub fn run(&self, submission: &CompiledSubmission) -> CheckResult {
        let mut offending: Vec<String> = Vec::new();
        let mut satisfied = vec![false; self.required.len()];

        for file in &submission.files {
            for import in file.module.imports() {
                let path = import.path();
                if self
                    .forbidden
                    .iter()
                    .any(|prefix| path.starts_with(prefix.as_str()))
                {
                    offending.push(format!("{} in {}", path, file.qualified_name));
                }
                for (index, prefix) in self.required.iter().enumerate() {
                    if path.starts_with(prefix.as_str()) {
                        satisfied[index] = true;
                    }
                }
            }
        }

        let missing: Vec<&String> = self
            .required
            .iter()
            .zip(&satisfied)
            .filter(|(_, satisfied)| !**satisfied)
            .map(|(prefix, _)| prefix)
            .collect();

        if offending.is_empty() && missing.is_empty() {
            return CheckResult::passed(&self.name, SUBMISSION_WIDE, "imports ok".to_owned());
        }

        let mut message = String::new();
        if !offending.is_empty() {
            message.push_str(&format!("forbidden imports: {}", offending.join(", ")));
        }
        if !missing.is_empty() {
            if !message.is_empty() {
                message.push_str("; ");
            }
            message.push_str(&format!(
                "missing required imports: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<&str>>()
                    .join(", ")
            ));
        }
        CheckResult::failed(&self.name, SUBMISSION_WIDE, message)
    }
}

/// A dynamically compiled check: submitted source code that, once compiled
/// and instantiated, drives the file under test itself.
#[derive(Debug)]
pub struct CompiledCheck {
    pub name: String,
    pub module: LoadedModule,
}

/// The checks of one submission, in declaration order, plus the loader
/// context holding any compiled check batch.
#[derive(Debug)]
pub struct CheckSet {
    pub checks: Vec<Check>,
    pub context: Option<LoaderContext>,
}

/// Instantiate the checks received from the master, preserving declaration
/// order. All source-code payloads compile as a single batch into one
/// untrusted context; a batch that fails to compile is a compilation error.
pub fn build_checks(runtime: &Runtime, envelopes: &[CheckEnvelope]) -> Result<CheckSet> {
    let mut slots: Vec<Option<Check>> = Vec::with_capacity(envelopes.len());
    let mut source_positions = Vec::new();
    let mut sources = Vec::new();

    for (index, envelope) in envelopes.iter().enumerate() {
        match envelope.check_type {
            CheckType::Io => {
                slots.push(Some(Check::Io(IoCheck::from_payload(&envelope.payload)?)));
            }
            CheckType::Import => {
                slots.push(Some(Check::Import(ImportCheck::from_payload(
                    &envelope.payload,
                )?)));
            }
            CheckType::SourceCode => {
                slots.push(None);
                source_positions.push(index);
                sources.push(extract_source(&envelope.payload)?);
            }
        }
    }

    let context = if sources.is_empty() {
        None
    } else {
        let (context, modules) = compile_check_batch(runtime, &sources)?;
        for (position, module) in source_positions.into_iter().zip(modules) {
            slots[position] = Some(Check::Compiled(CompiledCheck {
                name: module.qualified_name().to_owned(),
                module,
            }));
        }
        Some(context)
    };

    let checks = slots
        .into_iter()
        .map(|slot| slot.expect("check slot left unfilled"))
        .collect();
    Ok(CheckSet { checks, context })
}

/// Decode a source-code check payload: either a bare JSON string or an
/// object carrying a `source` field.
fn extract_source(payload: &str) -> Result<String> {
    let value: Value = serde_json::from_str(payload)?;
    if let Some(source) = value.as_str() {
        return Ok(source.to_owned());
    }
    value
        .as_object()
        .and_then(|object| object.get("source"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            ErrorKind::MalformedCheck("source-code check carries no source".to_owned()).into()
        })
}

fn compile_check_batch(
    runtime: &Runtime,
    sources: &[String],
) -> Result<(LoaderContext, Vec<LoadedModule>)> {
    let files: Vec<(String, String)> = sources
        .iter()
        .enumerate()
        .map(|(index, source)| (format!("check-{}", index + 1), source.clone()))
        .collect();

    let output = compiler::compile(runtime, &files);
    if !output.successful {
        bail!(ErrorKind::Compilation(output));
    }

    let context = runtime.create_context(Trust::Untrusted);
    let mut modules = Vec::new();
    for (qualified_name, _) in &files {
        let artifact = &output.artifacts[qualified_name];
        modules.push(context.load(qualified_name, artifact)?);
    }
    Ok((context, modules))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_io_payload_decodes() {
        let check = IoCheck::from_payload(
            r#"{"name":"hello","input":["a","b"],"expectedOutput":"c\n"}"#,
        )
        .unwrap();
        assert_eq!(check.name, "hello");
        assert_eq!(check.input, vec!["a", "b"]);
        assert_eq!(check.expected_output, "c\n");
    }

    #[test]
    fn classic_io_payload_accepts_the_legacy_output_field() {
        let check =
            IoCheck::from_payload(r#"{"name":"old","output":"x\n"}"#).unwrap();
        assert_eq!(check.expected_output, "x\n");
        assert!(check.input.is_empty());
    }

    #[test]
    fn interleaved_io_payload_decodes() {
        let check = IoCheck::from_payload(
            "{\"name\":\"i\",\"text\":\"> first\\nhello\\n> second\\nworld\"}",
        )
        .unwrap();
        assert_eq!(check.input, vec!["first", "second"]);
        assert_eq!(check.expected_output, "hello\nworld\n");
    }

    #[test]
    fn payload_with_both_encodings_is_malformed() {
        let error = IoCheck::from_payload(
            r#"{"name":"x","text":"a","input":[],"expectedOutput":"b"}"#,
        )
        .unwrap_err();
        match error.kind() {
            ErrorKind::MalformedCheck(message) => {
                assert!(message.contains("both"));
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn io_payload_without_name_is_malformed() {
        assert!(IoCheck::from_payload(r#"{"expectedOutput":"x"}"#).is_err());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let check = IoCheck::from_payload(
            r#"{"name":"n","expectedOutput":"x","creator":"admin","id":17}"#,
        )
        .unwrap();
        assert_eq!(check.name, "n");
    }

    #[test]
    fn import_check_payload_decodes() {
        let check = ImportCheck::from_payload(
            r#"{"name":"no-files","forbidden":["wasi_snapshot_preview1::path_"]}"#,
        )
        .unwrap();
        assert_eq!(check.name, "no-files");
        assert_eq!(check.forbidden.len(), 1);
        assert!(check.required.is_empty());
    }

    #[test]
    fn source_payload_accepts_both_shapes() {
        assert_eq!(extract_source(r#""(module)""#).unwrap(), "(module)");
        assert_eq!(
            extract_source(r#"{"source":"(module)"}"#).unwrap(),
            "(module)"
        );
        assert!(extract_source(r#"{"code":"(module)"}"#).is_err());
    }

    #[test]
    fn scopes_follow_the_variant() {
        let io = Check::Io(IoCheck {
            name: "io".to_owned(),
            input: Vec::new(),
            expected_output: String::new(),
        });
        let import = Check::Import(ImportCheck {
            name: "imports".to_owned(),
            forbidden: Vec::new(),
            required: Vec::new(),
        });
        assert_eq!(io.scope(), CheckScope::UserCodeMain);
        assert_eq!(import.scope(), CheckScope::StaticTest);
    }
}
