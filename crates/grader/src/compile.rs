//! Compilation of a submission's source set.
//!
//! The compiler is launched once per submission. Its stdout is discarded;
//! its stderr is collected in full, and any diagnostic text counts as a
//! failure even when the exit code is 0.

use grader_core::{CompileOutcome, Config};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::group;
use crate::pump::{PumpOptions, StreamPump};
use crate::watchdog::Watchdog;

#[derive(Debug, Clone)]
pub struct Compiler {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    grace: Duration,
}

impl Compiler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
            grace: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.compiler.clone(),
            args: config.compiler_args.clone(),
            timeout: config.compile_timeout(),
            grace: config.capture_grace(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Compile `sources` (paths relative to `working_dir`).
    pub async fn compile(&self, sources: &[String], working_dir: &Path) -> CompileOutcome {
        if sources.is_empty() {
            debug!(dir = %working_dir.display(), "nothing to compile");
            return CompileOutcome::Succeeded { invoked: false };
        }

        debug!(
            compiler = %self.program,
            args = ?self.args,
            sources = ?sources,
            "launching compiler"
        );
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(sources)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = match group::isolate(&mut command).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(compiler = %self.program, error = %err, "failed to launch compiler");
                return CompileOutcome::Failed {
                    detail: format!("Failed to launch compiler {}: {err}", self.program),
                };
            }
        };

        let pgid = child.id();
        let diagnostics = child.stderr.take().map(|stderr| {
            StreamPump::spawn("compiler stderr", stderr, Vec::new(), PumpOptions::strict())
        });

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let watchdog = self.timeout.map(|timeout| {
            Watchdog::arm(timeout, move || {
                let _ = kill_tx.send(());
            })
        });

        let waited = tokio::select! {
            biased;
            result = child.wait() => Some(result),
            Ok(()) = &mut kill_rx => None,
        };
        if let Some(watchdog) = &watchdog {
            watchdog.cancel();
        }

        let status = match waited {
            Some(Ok(status)) => status,
            Some(Err(err)) => {
                return CompileOutcome::Failed {
                    detail: format!("Failed waiting for compiler: {err}"),
                };
            }
            None => {
                let secs = self.timeout.map_or(0, |t| t.as_secs());
                warn!(compiler = %self.program, timeout_sec = secs, "compiler timed out; killing");
                group::kill_and_reap(&mut child, pgid, &self.program).await;
                return CompileOutcome::Failed {
                    detail: format!("Compiler timed out after {secs} seconds"),
                };
            }
        };

        let text = match diagnostics {
            Some(pump) => match pump.join_within(self.grace).await {
                Ok(outcome) => outcome
                    .dest
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default(),
                Err(err) => {
                    return CompileOutcome::Failed {
                        detail: format!("Failed to read compiler diagnostics: {err}"),
                    };
                }
            },
            None => String::new(),
        };

        let outcome = if !text.is_empty() {
            CompileOutcome::Failed { detail: text }
        } else if status.success() {
            CompileOutcome::Succeeded { invoked: true }
        } else {
            let detail = match status.code() {
                Some(code) => format!("Compiler exit code: {code}"),
                None => "Compiler terminated by a signal".to_string(),
            };
            CompileOutcome::Failed { detail }
        };

        info!(
            dir = %working_dir.display(),
            sources = sources.len(),
            success = outcome.is_success(),
            "compile finished"
        );
        outcome
    }
}
