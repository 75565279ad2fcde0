//! Grading of one submission directory.
//!
//! A submission goes through discovery, then compilation, then every run
//! of every program. Instructor files are copied in before the source check.
//! A missing source file, a failed copy or a failed compile marks every run
//! as not attempted; nothing is retried.

use grader_core::{
    Assignment, CompileOutcome, RunOutcome, RunSpec, ShownSource, SubmissionResult,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::compile::Compiler;
use crate::executor::Executor;

/// Grade the submission in `dir`.
pub async fn grade_submission(
    executor: &Executor,
    compiler: &Compiler,
    assignment: &Assignment,
    dir: &Path,
) -> SubmissionResult {
    let name = dir
        .file_name()
        .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned());
    let mut submission = SubmissionResult::new(name, dir);
    let specs = assignment.run_specs();
    let sources = assignment.source_files();

    if let Err(detail) = copy_instructor_files(assignment, dir).await {
        warn!(submission = %submission.name, error = %detail, "failed to copy instructor files");
        let reason = format!("compilation failed: {detail}");
        submission.compile = Some(CompileOutcome::Failed { detail });
        mark_not_attempted(&mut submission, &specs, &reason);
        return submission;
    }

    for file in assignment.shown_files() {
        let contents = tokio::fs::read_to_string(dir.join(&file))
            .await
            .map_err(|err| err.to_string());
        submission.shown_sources.push(ShownSource { file, contents });
    }

    submission.missing_files = sources
        .iter()
        .filter(|file| !dir.join(file).is_file())
        .cloned()
        .collect();
    if !submission.missing_files.is_empty() {
        warn!(
            submission = %submission.name,
            missing = ?submission.missing_files,
            "required source files missing; skipping compilation"
        );
        let reason = format!(
            "missing source files: {}",
            submission.missing_files.join(", ")
        );
        mark_not_attempted(&mut submission, &specs, &reason);
        return submission;
    }

    let compiled = compiler.compile(&sources, dir).await;
    let gate = match &compiled {
        CompileOutcome::Succeeded { .. } => None,
        CompileOutcome::Failed { detail } => Some(format!(
            "compilation failed: {}",
            detail.lines().next().unwrap_or_default()
        )),
    };
    submission.compile = Some(compiled);

    for spec in &specs {
        let outcome = if let Some(reason) = &gate {
            RunOutcome::NotAttempted {
                reason: reason.clone(),
            }
        } else if executor.is_interrupted() {
            RunOutcome::NotAttempted {
                reason: "grading interrupted".to_string(),
            }
        } else {
            RunOutcome::Executed(executor.execute(spec, dir).await)
        };
        submission.runs.insert(spec.key(), outcome);
    }

    info!(
        submission = %submission.name,
        runs = submission.runs.len(),
        completed = submission.completed_runs(),
        "submission graded"
    );
    submission
}

fn mark_not_attempted(submission: &mut SubmissionResult, specs: &[RunSpec], reason: &str) {
    for spec in specs {
        submission.runs.insert(
            spec.key(),
            RunOutcome::NotAttempted {
                reason: reason.to_string(),
            },
        );
    }
}

/// Copy every instructor file into `dir`, creating parent directories.
/// An existing file at the destination is overwritten.
async fn copy_instructor_files(assignment: &Assignment, dir: &Path) -> Result<(), String> {
    for copy in assignment.copy_files() {
        let dest = dir.join(&copy.dest_base);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
        }
        tokio::fs::copy(&copy.src_path, &dest).await.map_err(|err| {
            format!(
                "failed to copy {} to {}: {err}",
                copy.src_path.display(),
                dest.display()
            )
        })?;
        debug!(src = %copy.src_path.display(), dest = %dest.display(), "copied instructor file");
    }
    Ok(())
}

/// Immediate subdirectories of `root`, sorted by name. Hidden directories
/// are skipped.
pub fn discover_submissions(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();
    Ok(dirs)
}
