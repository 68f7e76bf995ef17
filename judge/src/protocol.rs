//! This module implements the wire protocol between the trusted master and
//! the slave. Frames are a 4-byte big-endian length prefix followed by that
//! many bytes of UTF-8 JSON; the JSON envelope carries a `kind` tag and the
//! message payload. Field names are camelCase on the wire because the master
//! side of the protocol predates this implementation.
//!
//! Malformed frames are not recoverable: the slave reports
//! `SlaveDiedWithUnknownError` and exits.
//!

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::{CompilationOutput, ErrorKind, Result, Submission, SubmissionCheckResult};

/// Maximum accepted frame payload length.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Kind of an inbound check specification.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    Import,
    Io,
    SourceCode,
}

/// A check specification as received from the master: a kind tag plus the
/// check's JSON payload, kept as text for backward compatibility with
/// persisted checks.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckEnvelope {
    pub check_type: CheckType,
    pub payload: String,
}

/// A message exchanged between master and slave. Every message carries the
/// slave `uid` so the master can demultiplex concurrent slaves.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Message {
    /// First message of a slave's life; `pid` lets the master hard-kill.
    SlaveStarted { uid: String, pid: u32 },

    /// The slave received no submission within the idle window.
    SlaveTimedOut { uid: String },

    /// The submission (or a source-code check batch) did not compile.
    CompilationFailed { uid: String, output: CompilationOutput },

    /// Aggregated results of the submission.
    SubmissionResult {
        uid: String,
        result: SubmissionCheckResult,
    },

    /// The slave failed outside any single check invocation.
    SlaveDiedWithUnknownError { uid: String, stacktrace: String },

    /// Sentinel following the terminal message; the slave exits after
    /// flushing it.
    DyingMessage { uid: String },

    /// The single unit of work a slave performs.
    CompileAndCheckSubmission {
        uid: String,
        submission: Submission,
        checks: Vec<CheckEnvelope>,
    },
}

impl Message {
    /// Get the slave uid carried by the message.
    pub fn uid(&self) -> &str {
        match self {
            Message::SlaveStarted { uid, .. }
            | Message::SlaveTimedOut { uid }
            | Message::CompilationFailed { uid, .. }
            | Message::SubmissionResult { uid, .. }
            | Message::SlaveDiedWithUnknownError { uid, .. }
            | Message::DyingMessage { uid }
            | Message::CompileAndCheckSubmission { uid, .. } => uid,
        }
    }
}

/// Serialize and frame a message onto the given writer.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LENGTH {
        bail!(ErrorKind::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read and decode one framed message from the given reader.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_LENGTH {
        bail!(ErrorKind::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}
