//! Core types for the grading engine.
//!
//! Run descriptions flow in (`RunSpec`), run outcomes flow out
//! (`RunResult`, `SubmissionResult`). Nothing here performs I/O.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::assignment::{ProgramSpec, RunConfiguration};

/// Identifies one run: `<program>.<run configuration name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub program: String,
    pub run: String,
}

impl RunKey {
    pub fn new(program: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            run: run.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.program, self.run)
    }
}

/// How an input file path is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Used as given.
    #[default]
    Fixed,
    /// Relative to the submission working directory.
    Submitted,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Submitted => "submitted",
        }
    }
}

/// File connected to a child's standard input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSource {
    pub path: PathBuf,
    pub kind: InputKind,
}

impl InputSource {
    /// Resolve the path for a submission working directory.
    pub fn resolve(&self, working_dir: &std::path::Path) -> PathBuf {
        match self.kind {
            InputKind::Fixed => self.path.clone(),
            InputKind::Submitted => working_dir.join(&self.path),
        }
    }
}

/// Immutable description of one way to invoke a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// Program identifier (entry point passed to the runtime).
    pub program: String,
    /// Run configuration name.
    pub name: String,
    pub classpath: Option<String>,
    /// Opaque sandbox policy reference (path or URI).
    pub security_policy: Option<String>,
    pub arguments: Vec<String>,
    /// System properties as `key=value`, passed as `-D` flags.
    pub properties: Vec<String>,
    pub input: Option<InputSource>,
    /// Stdout destination, relative to the working directory.
    pub output: Option<PathBuf>,
}

impl RunSpec {
    /// Build the run description for one run configuration of a program.
    pub fn from_program(program: &ProgramSpec, run: &RunConfiguration) -> Self {
        Self {
            program: program.name.clone(),
            name: run.name.clone(),
            classpath: program.classpath.clone(),
            security_policy: program
                .security_policy_file
                .as_ref()
                .map(|p| p.display().to_string()),
            arguments: run.arguments.clone(),
            properties: run.properties.clone(),
            input: run.input_file.as_ref().map(|input| InputSource {
                path: input.path.clone(),
                kind: input.kind,
            }),
            output: run.output_file.clone(),
        }
    }

    pub fn key(&self) -> RunKey {
        RunKey::new(&self.program, &self.name)
    }
}

/// Terminal status of an executed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    TimedOut,
    IoFailure,
    InterruptedFailure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
            Self::IoFailure => "IO_FAILURE",
            Self::InterruptedFailure => "INTERRUPTED_FAILURE",
        }
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitState {
    Code(i32),
    /// Terminated by a signal that the watchdog did not send.
    Signaled,
    KilledByTimeout,
}

impl ExitState {
    /// Exit code, if the process exited on its own.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            Self::Signaled | Self::KilledByTimeout => None,
        }
    }
}

/// Captured standard output of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutCapture {
    /// The child wrote nothing.
    Empty,
    Captured { bytes: Vec<u8>, truncated: bool },
    /// Stdout was streamed to a file instead of memory.
    RedirectedToFile(PathBuf),
}

impl StdoutCapture {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Captured { bytes, .. } => bytes,
            Self::Empty | Self::RedirectedToFile(_) => &[],
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Captured { truncated: true, .. })
    }
}

/// Output and exit state of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: StdoutCapture,
    pub stderr: Vec<u8>,
    pub stderr_truncated: bool,
    /// `None` when the process never started.
    pub exit: Option<ExitState>,
}

impl CapturedOutput {
    /// Output of a run whose process never started.
    pub fn empty() -> Self {
        Self {
            stdout: StdoutCapture::Empty,
            stderr: Vec::new(),
            stderr_truncated: false,
            exit: None,
        }
    }
}

/// Result of executing one `RunSpec`.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub key: RunKey,
    pub status: RunStatus,
    pub output: CapturedOutput,
    pub elapsed: Duration,
    /// Human-readable annotations in the order they were recorded.
    pub notices: Vec<String>,
}

impl RunResult {
    /// A run that failed before or while starting its process.
    pub fn failed(key: RunKey, status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            key,
            status,
            output: CapturedOutput::empty(),
            elapsed: Duration::ZERO,
            notices: vec![message.into()],
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.output.exit.and_then(|exit| exit.code())
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Outcome of compiling a program set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// `invoked` is false when there was nothing to compile.
    Succeeded { invoked: bool },
    Failed { detail: String },
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Per-run entry of a submission.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Executed(RunResult),
    /// Gated out before execution (missing sources or failed compile).
    NotAttempted { reason: String },
}

/// Submitted source text included in the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShownSource {
    pub file: String,
    /// `Err` holds the reason the file could not be read.
    pub contents: Result<String, String>,
}

/// Everything recorded while grading one submission directory.
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    pub name: String,
    pub dir: PathBuf,
    /// Required source files that were not found.
    pub missing_files: Vec<String>,
    /// Sources requested for display, in declaration order.
    pub shown_sources: Vec<ShownSource>,
    /// `None` when compilation was not attempted.
    pub compile: Option<CompileOutcome>,
    pub runs: BTreeMap<RunKey, RunOutcome>,
}

impl SubmissionResult {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            missing_files: Vec::new(),
            shown_sources: Vec::new(),
            compile: None,
            runs: BTreeMap::new(),
        }
    }

    /// Number of runs that executed and completed.
    pub fn completed_runs(&self) -> usize {
        self.runs
            .values()
            .filter(|outcome| {
                matches!(outcome, RunOutcome::Executed(result) if result.status == RunStatus::Completed)
            })
            .count()
    }
}
