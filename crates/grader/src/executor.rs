//! Execution of one run configuration against one compiled submission.
//!
//! A run owns its child process, up to three stream pumps and a watchdog.
//! Ordering per run: exit observed, watchdog cancelled, pumps joined,
//! output assembled. Every failure becomes part of the returned
//! `RunResult`; `execute` never errors.

use grader_core::{
    CapturedOutput, Config, ExitState, RunResult, RunSpec, RunStatus, StdoutCapture,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::group;
use crate::pump::{PumpOptions, PumpOutcome, StreamPump};
use crate::sink::BoundedSink;
use crate::watchdog::Watchdog;

/// Executes runs with shared engine settings.
#[derive(Debug, Clone)]
pub struct Executor {
    config: Config,
    interrupt: CancellationToken,
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Interrupted,
}

enum StdoutPump {
    Memory(StreamPump<ChildStdout, BoundedSink>),
    File(PathBuf, StreamPump<ChildStdout, File>),
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Self::with_interrupt(config, CancellationToken::new())
    }

    /// Runs in progress when `interrupt` is cancelled are killed and
    /// reported as `InterruptedFailure`.
    pub fn with_interrupt(config: Config, interrupt: CancellationToken) -> Self {
        Self { config, interrupt }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Full command vector for `spec` run from `working_dir`.
    pub fn build_command(&self, spec: &RunSpec, working_dir: &Path) -> Vec<String> {
        let mut argv = vec![self.config.runtime.clone()];

        if let Some(classpath) = &spec.classpath {
            argv.push("-classpath".to_string());
            argv.push(classpath.clone());
        }

        if let Some(policy) = &spec.security_policy {
            argv.push(format!(
                "-D{}={}",
                self.config.sandbox_base_property,
                base_dir(working_dir).display()
            ));
            argv.push("-Djava.security.manager".to_string());
            argv.push(format!("-Djava.security.policy={}", policy_uri(policy)));
        }

        argv.extend(spec.properties.iter().map(|property| format!("-D{property}")));
        argv.push(spec.program.clone());
        argv.extend(spec.arguments.iter().cloned());
        argv
    }

    /// Run `spec` in `working_dir` and collect its output.
    pub async fn execute(&self, spec: &RunSpec, working_dir: &Path) -> RunResult {
        let key = spec.key();
        let started = Instant::now();

        let input = match &spec.input {
            Some(source) => {
                let path = source.resolve(working_dir);
                match File::open(&path).await {
                    Ok(file) => Some(file),
                    Err(err) => {
                        warn!(run = %key, path = %path.display(), error = %err, "cannot open input file");
                        return RunResult::failed(
                            key,
                            RunStatus::IoFailure,
                            format!("cannot open input file {}: {err}", path.display()),
                        );
                    }
                }
            }
            None => None,
        };

        let output = match &spec.output {
            Some(relative) => {
                let path = working_dir.join(relative);
                match File::create(&path).await {
                    Ok(file) => Some((path, file)),
                    Err(err) => {
                        warn!(run = %key, path = %path.display(), error = %err, "cannot create output file");
                        return RunResult::failed(
                            key,
                            RunStatus::IoFailure,
                            format!("cannot create output file {}: {err}", path.display()),
                        );
                    }
                }
            }
            None => None,
        };

        let argv = self.build_command(spec, working_dir);
        debug!(run = %key, command = ?argv, dir = %working_dir.display(), "launching run");
        let Some((program, args)) = argv.split_first() else {
            return RunResult::failed(key, RunStatus::IoFailure, "empty command");
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = match group::isolate(&mut command).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(run = %key, program = %program, error = %err, "failed to start process");
                return RunResult::failed(
                    key,
                    RunStatus::IoFailure,
                    format!("failed to start {program}: {err}"),
                );
            }
        };
        let pgid = child.id();
        let label = key.to_string();
        info!(run = %key, pid = ?pgid, "process started");

        let stdin_pump = match (input, child.stdin.take()) {
            (Some(file), Some(stdin)) => Some(StreamPump::spawn(
                format!("{key} stdin"),
                file,
                stdin,
                PumpOptions::feed(),
            )),
            _ => None,
        };
        let stdout_pump = child.stdout.take().map(|stdout| match output {
            Some((path, file)) => StdoutPump::File(
                path,
                StreamPump::spawn(format!("{key} stdout"), stdout, file, PumpOptions::feed()),
            ),
            None => StdoutPump::Memory(StreamPump::spawn(
                format!("{key} stdout"),
                stdout,
                BoundedSink::new(self.config.stdout_cap_bytes),
                PumpOptions::capture(),
            )),
        });
        let stderr_pump = child.stderr.take().map(|stderr| {
            StreamPump::spawn(
                format!("{key} stderr"),
                stderr,
                BoundedSink::new(self.config.stderr_cap_bytes),
                PumpOptions::capture(),
            )
        });

        let timeout = self.config.run_timeout();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let watchdog = Watchdog::arm(timeout, move || {
            let _ = kill_tx.send(());
        });

        let ended = first_ending(child.wait(), &mut kill_rx, &self.interrupt).await;

        let mut notices = Vec::new();
        let (status, exit) = match ended {
            Ended::Exited(Ok(exit_status)) => {
                watchdog.cancel();
                // Background processes it left behind would hold the pipes open.
                group::kill_group(pgid, &label);
                (RunStatus::Completed, Some(exit_state(exit_status)))
            }
            Ended::Exited(Err(err)) => {
                watchdog.cancel();
                warn!(run = %key, error = %err, "failed waiting for process");
                group::kill_and_reap(&mut child, pgid, &label).await;
                notices.push(format!("failed waiting for process: {err}"));
                (RunStatus::InterruptedFailure, None)
            }
            Ended::TimedOut => {
                warn!(run = %key, timeout_sec = timeout.as_secs(), "run timed out; killing");
                group::kill_and_reap(&mut child, pgid, &label).await;
                notices.push(format!(
                    "timed out after {} seconds; process killed",
                    timeout.as_secs()
                ));
                (RunStatus::TimedOut, Some(ExitState::KilledByTimeout))
            }
            Ended::Interrupted => {
                watchdog.cancel();
                info!(run = %key, "interrupted; killing process");
                let reaped = group::kill_and_reap(&mut child, pgid, &label).await;
                notices.push("interrupted before the process finished".to_string());
                (RunStatus::InterruptedFailure, reaped.map(exit_state))
            }
        };

        let grace = self.config.capture_grace();
        if let Some(pump) = stdin_pump {
            join_pump(pump, grace, &mut notices).await;
        }
        let stdout = match stdout_pump {
            Some(StdoutPump::Memory(pump)) => join_pump(pump, grace, &mut notices)
                .await
                .and_then(|outcome| outcome.dest)
                .map_or(StdoutCapture::Empty, |sink| {
                    let (bytes, truncated) = sink.into_parts();
                    if bytes.is_empty() && !truncated {
                        StdoutCapture::Empty
                    } else {
                        StdoutCapture::Captured { bytes, truncated }
                    }
                }),
            Some(StdoutPump::File(path, pump)) => {
                if let Some(err) = join_pump(pump, grace, &mut notices)
                    .await
                    .and_then(|outcome| outcome.error)
                {
                    notices.push(format!("error writing {}: {err}", path.display()));
                }
                StdoutCapture::RedirectedToFile(path)
            }
            None => StdoutCapture::Empty,
        };
        let (stderr, stderr_truncated) = match stderr_pump {
            Some(pump) => join_pump(pump, grace, &mut notices)
                .await
                .and_then(|outcome| outcome.dest)
                .map_or_else(|| (Vec::new(), false), BoundedSink::into_parts),
            None => (Vec::new(), false),
        };

        if let Some(code) = exit.and_then(|exit| exit.code()).filter(|code| *code != 0) {
            notices.push(format!("exit code {code}"));
        }
        if exit == Some(ExitState::Signaled) && status == RunStatus::Completed {
            notices.push("terminated by a signal".to_string());
        }
        if stdout.is_truncated() {
            notices.push(format!(
                "output truncated at {} bytes",
                self.config.stdout_cap_bytes
            ));
        }
        if stderr_truncated {
            notices.push(format!(
                "error output truncated at {} bytes",
                self.config.stderr_cap_bytes
            ));
        }

        let result = RunResult {
            key,
            status,
            output: CapturedOutput {
                stdout,
                stderr,
                stderr_truncated,
                exit,
            },
            elapsed: started.elapsed(),
            notices,
        };
        info!(
            run = %result.key,
            status = ?result.status,
            exit_code = ?result.exit_code(),
            elapsed_ms = result.elapsed_ms(),
            "run finished"
        );
        result
    }
}

/// Wait for whichever ends the run first. An exit that is already
/// observable wins over a timer or interrupt that became ready in the
/// same poll.
async fn first_ending<W>(
    wait: W,
    kill_rx: &mut oneshot::Receiver<()>,
    interrupt: &CancellationToken,
) -> Ended
where
    W: Future<Output = std::io::Result<ExitStatus>>,
{
    tokio::select! {
        biased;
        result = wait => Ended::Exited(result),
        Ok(()) = kill_rx => Ended::TimedOut,
        () = interrupt.cancelled() => Ended::Interrupted,
    }
}

fn exit_state(status: ExitStatus) -> ExitState {
    status.code().map_or(ExitState::Signaled, ExitState::Code)
}

async fn join_pump<R, W>(
    pump: StreamPump<R, W>,
    grace: Duration,
    notices: &mut Vec<String>,
) -> Option<PumpOutcome<R, W>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let name = pump.name().to_string();
    match pump.join_within(grace).await {
        Ok(outcome) => {
            if outcome.stopped {
                notices.push(format!("{name} still open after exit; capture cut short"));
            }
            Some(outcome)
        }
        Err(err) => {
            warn!(pump = %name, error = %err, "stream capture failed");
            notices.push(format!("{name} capture failed"));
            None
        }
    }
}

/// Directory handed to the sandbox as the submissions' base: the
/// grandparent of the working directory, or the nearest ancestor that
/// exists.
fn base_dir(working_dir: &Path) -> PathBuf {
    let absolute = std::path::absolute(working_dir).unwrap_or_else(|_| working_dir.to_path_buf());
    absolute
        .parent()
        .and_then(Path::parent)
        .or_else(|| absolute.parent())
        .unwrap_or(&absolute)
        .to_path_buf()
}

/// Plain paths become `file:` URIs; references that already carry a
/// scheme are passed through.
fn policy_uri(policy: &str) -> String {
    if policy.contains("://") || policy.starts_with("file:") {
        return policy.to_string();
    }
    let path = Path::new(policy);
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file:{}", absolute.display())
}
