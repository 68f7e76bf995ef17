//! This module implements the slave's lifecycle state machine:
//!
//! ```text
//! STARTING -> IDLE -> EXECUTING -> TERMINATING -> DEAD
//! ```
//!
//! The slave announces itself, waits for exactly one
//! `CompileAndCheckSubmission` (or the idle killer), executes it, emits
//! exactly one terminal message followed by `DyingMessage` and exits. A
//! panic anywhere in the executor is contained and reported as
//! `SlaveDiedWithUnknownError`.
//!

use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;

use error_chain::ChainedError;

use judge::checks;
use judge::compiler;
use judge::protocol::{CheckEnvelope, Message};
use judge::runner::CheckRunner;
use judge::{Submission, SubmissionCheckResult};
use sandbox::Runtime;

use crate::client::{ClientEvent, MessageClient};
use crate::config::SlaveConfig;

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        ClientError(crate::client::Error, crate::client::ErrorKind);
        JudgeError(::judge::Error, ::judge::ErrorKind);
    }
}

/// The lifecycle states of a slave.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlaveState {
    Starting,
    Idle,
    Executing,
    Terminating,
    Dead,
}

/// An event the main loop reacts to.
enum SlaveEvent {
    Client(ClientEvent),
    IdleExpired,
}

/// Message and backtrace of the last executor panic, captured by the hook
/// installed through `install_panic_capture`.
static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

/// Install a panic hook that records the panic message and a backtrace for
/// the `SlaveDiedWithUnknownError` report.
pub fn install_panic_capture() {
    panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let report = format!("{}\n{}", info, backtrace);
        log::error!("panic: {}", info);
        *LAST_PANIC.lock().expect("failed to lock panic buffer: poisoned") = Some(report);
    }));
}

fn take_last_panic() -> Option<String> {
    LAST_PANIC
        .lock()
        .expect("failed to lock panic buffer: poisoned")
        .take()
}

/// A running slave.
pub struct Slave {
    uid: String,
    config: SlaveConfig,
    runtime: Runtime,
    client: MessageClient,
    events: Receiver<SlaveEvent>,
    event_tx: Sender<SlaveEvent>,
    idle_cancel: Option<Sender<()>>,
    state: SlaveState,
}

impl Slave {
    /// Create a slave over an established connection to the master.
    pub fn new(
        uid: String,
        config: SlaveConfig,
        runtime: Runtime,
        stream: TcpStream,
    ) -> Result<Slave> {
        let (event_tx, events) = mpsc::channel();
        let handler_tx = event_tx.clone();
        let client = MessageClient::start(stream, move |event| {
            handler_tx.send(SlaveEvent::Client(event)).ok();
        })?;

        Ok(Slave {
            uid,
            config,
            runtime,
            client,
            events,
            event_tx,
            idle_cancel: None,
            state: SlaveState::Starting,
        })
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> SlaveState {
        self.state
    }

    /// Run the slave to completion: announce, wait, execute, die.
    pub fn run(&mut self) -> Result<()> {
        self.client.queue_message(Message::SlaveStarted {
            uid: self.uid.clone(),
            pid: std::process::id(),
        });
        self.arm_idle_killer();
        self.state = SlaveState::Idle;
        log::info!("slave {} idle, waiting for a submission", self.uid);

        loop {
            let event = match self.events.recv() {
                Ok(event) => event,
                Err(..) => break,
            };
            match event {
                SlaveEvent::IdleExpired => {
                    if self.state != SlaveState::Idle {
                        continue;
                    }
                    log::warn!(
                        "no submission within {} ms, giving up",
                        self.config.idle_timeout_ms
                    );
                    self.client.queue_message(Message::SlaveTimedOut {
                        uid: self.uid.clone(),
                    });
                    break;
                }
                SlaveEvent::Client(ClientEvent::Message(Message::CompileAndCheckSubmission {
                    submission,
                    checks,
                    ..
                })) => {
                    if self.state != SlaveState::Idle {
                        log::warn!(
                            "rejecting CompileAndCheckSubmission received in state {:?}",
                            self.state
                        );
                        continue;
                    }
                    self.cancel_idle_killer();
                    self.state = SlaveState::Executing;
                    log::info!("slave {} executing a submission", self.uid);
                    let reply = self.execute(submission, checks);
                    self.client.queue_message(reply);
                    break;
                }
                SlaveEvent::Client(ClientEvent::Message(other)) => {
                    log::warn!("ignoring unexpected message: {:?}", other);
                }
                SlaveEvent::Client(ClientEvent::Malformed(description)) => {
                    log::error!("malformed frame from the master: {}", description);
                    self.client.queue_message(Message::SlaveDiedWithUnknownError {
                        uid: self.uid.clone(),
                        stacktrace: format!("malformed message: {}", description),
                    });
                    break;
                }
                SlaveEvent::Client(ClientEvent::Disconnected) => {
                    log::warn!("master closed the connection");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Execute the submission, containing every failure mode into exactly
    /// one terminal message.
    fn execute(&mut self, submission: Submission, checks: Vec<CheckEnvelope>) -> Message {
        let uid = self.uid.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_submission(submission, checks)
        }));

        match outcome {
            Ok(Ok(result)) => Message::SubmissionResult { uid, result },
            Ok(Err(error)) => {
                if let judge::ErrorKind::Compilation(output) = error.kind() {
                    log::info!("submission did not compile");
                    return Message::CompilationFailed {
                        uid,
                        output: output.clone(),
                    };
                }
                log::error!("submission execution failed: {}", error.display_chain());
                Message::SlaveDiedWithUnknownError {
                    uid,
                    stacktrace: error.display_chain().to_string(),
                }
            }
            Err(payload) => {
                let stacktrace = take_last_panic().unwrap_or_else(|| describe_panic(&payload));
                Message::SlaveDiedWithUnknownError { uid, stacktrace }
            }
        }
    }

    fn run_submission(
        &self,
        submission: Submission,
        envelopes: Vec<CheckEnvelope>,
    ) -> judge::Result<SubmissionCheckResult> {
        log::info!(
            "compiling submission with {} file(s) and {} check(s)",
            submission.files.len(),
            envelopes.len()
        );
        let compiled = compiler::compile_and_load(&self.runtime, &submission)?;
        let set = checks::build_checks(&self.runtime, &envelopes)?;
        let runner = CheckRunner::new(self.config.check_timeout());
        let result = runner.check_submission(&compiled, &set);
        log::info!("submission produced {} check result(s)", result.len());
        Ok(result)
    }

    /// Queue the dying sentinel, flush with a bounded deadline and close.
    fn shutdown(&mut self) {
        self.state = SlaveState::Terminating;
        self.reject_pending();
        self.client.queue_message(Message::DyingMessage {
            uid: self.uid.clone(),
        });
        let flushed = self.client.stop(self.config.flush_timeout());
        if !flushed {
            log::warn!("the dying message may not have reached the master");
        }
        self.state = SlaveState::Dead;
        log::info!("slave {} dead", self.uid);
    }

    /// Drain events that arrived during execution; late submissions are
    /// rejected.
    fn reject_pending(&self) {
        while let Ok(event) = self.events.try_recv() {
            if let SlaveEvent::Client(ClientEvent::Message(
                Message::CompileAndCheckSubmission { .. },
            )) = event
            {
                log::warn!(
                    "rejecting CompileAndCheckSubmission received in state {:?}",
                    self.state
                );
            }
        }
    }

    /// Arm the timer that kills the slave if no submission arrives within
    /// the idle window.
    fn arm_idle_killer(&mut self) {
        let (cancel_tx, cancel_rx) = mpsc::channel();
        let timeout = self.config.idle_timeout();
        let events = self.event_tx.clone();
        std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                events.send(SlaveEvent::IdleExpired).ok();
            }
        });
        self.idle_cancel = Some(cancel_tx);
    }

    fn cancel_idle_killer(&mut self) {
        if let Some(cancel) = self.idle_cancel.take() {
            cancel.send(()).ok();
        }
    }
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "executor panicked".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panics_are_described() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(describe_panic(boxed.as_ref()), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom".to_owned());
        assert_eq!(describe_panic(boxed.as_ref()), "boom");
    }
}
