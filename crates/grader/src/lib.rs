//! grader - batch compile-and-run engine for programming assignments.
//!
//! Each submission directory is compiled once and every run configuration
//! of the assignment is executed against it in a child process with
//! bounded output capture and a hard timeout.

pub mod batch;
pub mod compile;
pub mod executor;
mod group;
pub mod pump;
pub mod sink;
pub mod watchdog;

use std::path::{Path, PathBuf};

use grader_core::assignment::DefinitionError;
use grader_core::config::{ConfigError, DEFAULT_CONFIG_PATH};
use grader_core::report::{self, ReportWriter};
use grader_core::{Assignment, Config, SubmissionResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use batch::{discover_submissions, grade_submission};
pub use compile::Compiler;
pub use executor::Executor;
pub use pump::{PumpError, PumpOptions, PumpOutcome, StreamPump};
pub use sink::BoundedSink;
pub use watchdog::Watchdog;

#[derive(Debug, Error)]
pub enum GraderError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("failed to list submissions in {path}: {source}")]
    Discover {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, GraderError>;

/// Engine settings for an assignment root.
///
/// `<root>/.grader/config` is applied first, then `explicit` on top of it.
/// Relative file paths are resolved against `root`.
pub fn load_config(root: &Path, explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();
    let default_path = root.join(DEFAULT_CONFIG_PATH);
    if default_path.is_file() {
        config.load_file(&default_path)?;
    }
    if let Some(path) = explicit {
        config.load_file(path)?;
    }
    config.resolve_paths(root);
    Ok(config)
}

/// What a finished batch produced.
#[derive(Debug)]
pub struct BatchReport {
    pub report_path: PathBuf,
    pub summary_path: Option<PathBuf>,
    pub submissions: Vec<SubmissionResult>,
    /// Submissions not graded because of an interruption.
    pub skipped: usize,
}

/// Grades every submission under an assignment root.
#[derive(Debug)]
pub struct Grader {
    root: PathBuf,
    config: Config,
    assignment: Assignment,
    executor: Executor,
    compiler: Compiler,
    interrupt: CancellationToken,
}

impl Grader {
    /// Load the assignment definition named by `config`.
    ///
    /// An invalid definition is fatal: nothing is compiled or run.
    pub fn load(root: &Path, config: Config, interrupt: CancellationToken) -> Result<Self> {
        let assignment = Assignment::load(&config.definition_file)?;
        Ok(Self::new(root, config, assignment, interrupt))
    }

    pub fn new(
        root: &Path,
        config: Config,
        assignment: Assignment,
        interrupt: CancellationToken,
    ) -> Self {
        let executor = Executor::with_interrupt(config.clone(), interrupt.clone());
        let compiler = Compiler::from_config(&config);
        Self {
            root: root.to_path_buf(),
            config,
            assignment,
            executor,
            compiler,
            interrupt,
        }
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// Stop after the current run; the running child is killed.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.interrupt.cancel();
    }

    /// Grade submissions in name order, then write the report and summary.
    pub async fn run(&self) -> Result<BatchReport> {
        let dirs = discover_submissions(&self.root).map_err(|source| GraderError::Discover {
            path: self.root.clone(),
            source,
        })?;
        info!(
            assignment = %self.assignment.name,
            submissions = dirs.len(),
            runs_per_submission = self.assignment.run_specs().len(),
            "grading started"
        );

        let report_path = self.config.report_file.clone();
        let mut writer = ReportWriter::create(&report_path, &self.assignment.name)
            .map_err(|source| output_error(&report_path, source))?;

        let mut submissions = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            if self.interrupt.is_cancelled() {
                break;
            }
            let result =
                grade_submission(&self.executor, &self.compiler, &self.assignment, dir).await;
            writer
                .write_submission(&result)
                .map_err(|source| output_error(&report_path, source))?;
            submissions.push(result);
        }
        writer
            .flush()
            .map_err(|source| output_error(&report_path, source))?;

        let skipped = dirs.len() - submissions.len();
        if skipped > 0 {
            warn!(skipped, "grading interrupted; remaining submissions skipped");
        }

        let summary_path = if self.config.summary_json {
            let path = report_path.with_file_name("summary.json");
            report::write_summary(&path, &submissions)
                .map_err(|source| output_error(&path, source))?;
            Some(path)
        } else {
            None
        };

        for (status, count) in report::status_counts(&submissions) {
            info!(status = status.as_str(), count, "run totals");
        }

        Ok(BatchReport {
            report_path,
            summary_path,
            submissions,
            skipped,
        })
    }
}

fn output_error(path: &Path, source: std::io::Error) -> GraderError {
    GraderError::Output {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_config_layers_explicit_over_default_file() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join(".grader")).unwrap();
        std::fs::write(
            root.path().join(DEFAULT_CONFIG_PATH),
            "run_timeout_sec=3\nruntime=sh\n",
        )
        .unwrap();
        let explicit = root.path().join("override.conf");
        std::fs::write(&explicit, "run_timeout_sec=9\n").unwrap();

        let config = load_config(root.path(), Some(&explicit)).unwrap();
        assert_eq!(config.run_timeout_sec, 9);
        assert_eq!(config.runtime, "sh");
        assert_eq!(config.report_file, root.path().join("GradingReport.txt"));
    }

    #[test]
    fn load_config_without_files_uses_defaults() {
        let root = TempDir::new().unwrap();
        let config = load_config(root.path(), None).unwrap();
        assert_eq!(config.runtime, "java");
        assert_eq!(config.definition_file, root.path().join("grading.yaml"));
    }

    #[test]
    fn invalid_definition_is_fatal() {
        let root = TempDir::new().unwrap();
        std::fs::write(
            root.path().join("grading.yaml"),
            "name: hw\nprograms:\n  - name: P\n    securityPolicyFile: nope.policy\n",
        )
        .unwrap();
        let config = load_config(root.path(), None).unwrap();

        let err = Grader::load(root.path(), config, CancellationToken::new()).unwrap_err();
        assert!(matches!(
            err,
            GraderError::Definition(DefinitionError::MissingPolicyFile(_))
        ));
    }

    #[tokio::test]
    async fn interrupted_batch_skips_remaining_submissions() {
        let root = TempDir::new().unwrap();
        for name in ["alice", "bob"] {
            std::fs::create_dir(root.path().join(name)).unwrap();
        }
        let config = Config {
            runtime: "sh".to_string(),
            ..load_config(root.path(), None).unwrap()
        };
        let interrupt = CancellationToken::new();
        let grader = Grader::new(root.path(), config, Assignment::default(), interrupt);
        grader.shutdown();

        let batch = grader.run().await.unwrap();
        assert!(batch.submissions.is_empty());
        assert_eq!(batch.skipped, 2);
        assert!(batch.report_path.is_file());
    }
}
