//! Report generation.
//!
//! Every run renders to a text block with the same four parts, whatever
//! its outcome: a start marker, the stdout (or a notice standing in for
//! it), the stderr when non-empty, and trailing notices. Submissions are
//! written one after another, separated by a form feed.
//!
//! A JSON summary with one row per run is written alongside for tooling.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::types::{
    CompileOutcome, RunKey, RunOutcome, RunResult, RunStatus, ShownSource, StdoutCapture,
    SubmissionResult,
};

const SEPARATOR: &str =
    "--------------------------------------------------------------------------------\n";

/// Render the block for one run.
pub fn format_run(assignment: &str, key: &RunKey, outcome: &RunOutcome) -> String {
    let label = format!("{assignment} {} run {}", key.program, key.run);
    let mut block = format!("===== {label} =====\n");

    match outcome {
        RunOutcome::NotAttempted { reason } => {
            block.push_str(&format!("*** {label} not attempted: {reason}\n"));
        }
        RunOutcome::Executed(result) => push_executed(&mut block, &label, result),
    }

    block
}

fn push_executed(block: &mut String, label: &str, result: &RunResult) {
    match &result.output.stdout {
        StdoutCapture::Empty => {
            block.push_str(&format!("----- No output from {label} -----\n"));
        }
        StdoutCapture::RedirectedToFile(path) => {
            block.push_str(&format!(
                "----- Output from {label} written to {} -----\n",
                path.display()
            ));
        }
        StdoutCapture::Captured { bytes, .. } => {
            block.push_str(&format!("----- Start of output from {label} -----\n"));
            push_text(block, bytes);
            block.push_str(&format!("----- End of output from {label} -----\n"));
        }
    }

    if !result.output.stderr.is_empty() {
        block.push_str(&format!("----- Start of error output from {label} -----\n"));
        push_text(block, &result.output.stderr);
        block.push_str(&format!("----- End of error output from {label} -----\n"));
    }

    for notice in &result.notices {
        block.push_str(&format!("*** {label}: {notice}\n"));
    }
}

/// Append captured bytes as text, normalising line endings and making
/// sure the text ends with a newline.
fn push_text(block: &mut String, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    for line in text.lines() {
        block.push_str(line);
        block.push('\n');
    }
}

fn push_shown_source(section: &mut String, shown: &ShownSource) {
    match &shown.contents {
        Ok(text) => {
            section.push_str(&format!("---- Java file {} ----\n", shown.file));
            section.push_str(text);
            if !text.is_empty() && !text.ends_with('\n') {
                section.push('\n');
            }
        }
        Err(reason) => {
            section.push_str(&format!("---- Java file {} NOT FOUND! ----\n", shown.file));
            section.push_str(&format!("{reason}\n"));
        }
    }
}

/// Render the full report section for one submission.
pub fn format_submission(assignment: &str, submission: &SubmissionResult) -> String {
    let mut section = format!("Name: {}\n", submission.name);
    section.push_str(SEPARATOR);

    if !submission.missing_files.is_empty() {
        section.push_str("Missing files:\n");
        for file in &submission.missing_files {
            section.push_str(&format!("\t{file}\n"));
        }
    }

    for shown in &submission.shown_sources {
        push_shown_source(&mut section, shown);
    }

    match &submission.compile {
        None => section.push_str("*** Did not attempt to compile code. ***\n"),
        Some(CompileOutcome::Succeeded { .. }) => {
            section.push_str("Compilation Output:\n-----\nOK\n-----\n");
        }
        Some(CompileOutcome::Failed { detail }) => {
            section.push_str(&format!("Compilation Output:\n-----\n{detail}\n-----\n"));
        }
    }

    for (key, outcome) in &submission.runs {
        section.push_str(&format_run(assignment, key, outcome));
    }

    section
}

/// One row of the JSON summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub submission: String,
    pub run: String,
    /// Run status, or `NOT_ATTEMPTED`.
    pub status: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: Option<u64>,
    pub stdout_bytes: usize,
    pub stdout_truncated: bool,
    pub stderr_bytes: usize,
    pub stderr_truncated: bool,
}

impl RunSummary {
    pub fn new(submission: &str, key: &RunKey, outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::NotAttempted { .. } => Self {
                submission: submission.to_string(),
                run: key.to_string(),
                status: "NOT_ATTEMPTED".to_string(),
                exit_code: None,
                elapsed_ms: None,
                stdout_bytes: 0,
                stdout_truncated: false,
                stderr_bytes: 0,
                stderr_truncated: false,
            },
            RunOutcome::Executed(result) => Self {
                submission: submission.to_string(),
                run: key.to_string(),
                status: result.status.as_str().to_string(),
                exit_code: result.exit_code(),
                elapsed_ms: Some(result.elapsed_ms()),
                stdout_bytes: result.output.stdout.bytes().len(),
                stdout_truncated: result.output.stdout.is_truncated(),
                stderr_bytes: result.output.stderr.len(),
                stderr_truncated: result.output.stderr_truncated,
            },
        }
    }
}

/// Summary rows for a batch of submissions, in report order.
pub fn summarize(submissions: &[SubmissionResult]) -> Vec<RunSummary> {
    submissions
        .iter()
        .flat_map(|submission| {
            submission
                .runs
                .iter()
                .map(|(key, outcome)| RunSummary::new(&submission.name, key, outcome))
        })
        .collect()
}

/// Write the JSON summary for a batch.
pub fn write_summary(path: &Path, submissions: &[SubmissionResult]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &summarize(submissions))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Count runs per terminal status, for log lines.
pub fn status_counts(submissions: &[SubmissionResult]) -> Vec<(RunStatus, usize)> {
    let statuses = [
        RunStatus::Completed,
        RunStatus::TimedOut,
        RunStatus::IoFailure,
        RunStatus::InterruptedFailure,
    ];
    statuses
        .into_iter()
        .map(|status| {
            let count = submissions
                .iter()
                .flat_map(|submission| submission.runs.values())
                .filter(|outcome| matches!(outcome, RunOutcome::Executed(r) if r.status == status))
                .count();
            (status, count)
        })
        .collect()
}

/// Writer for the grading report file.
pub struct ReportWriter {
    assignment: String,
    writer: BufWriter<File>,
    sections: usize,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("assignment", &self.assignment)
            .field("writer", &"BufWriter<File>")
            .field("sections", &self.sections)
            .finish()
    }
}

impl ReportWriter {
    /// Create (or truncate) the report file and write its header.
    pub fn create(path: &Path, assignment: impl Into<String>) -> std::io::Result<Self> {
        let assignment = assignment.into();
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "Assignment: {assignment}")?;
        writeln!(
            writer,
            "Generated: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        Ok(Self {
            assignment,
            writer,
            sections: 0,
        })
    }

    /// Append one submission's section.
    pub fn write_submission(&mut self, submission: &SubmissionResult) -> std::io::Result<()> {
        write!(self.writer, "\u{c}")?;
        writeln!(self.writer)?;
        self.writer
            .write_all(format_submission(&self.assignment, submission).as_bytes())?;
        self.sections += 1;
        Ok(())
    }

    /// Number of submissions written so far.
    pub fn sections(&self) -> usize {
        self.sections
    }

    /// Flush pending writes.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapturedOutput, ExitState};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn executed(
        stdout: StdoutCapture,
        stderr: &[u8],
        exit: ExitState,
        notices: &[&str],
    ) -> RunOutcome {
        RunOutcome::Executed(RunResult {
            key: RunKey::new("Add", "basicAdd"),
            status: RunStatus::Completed,
            output: CapturedOutput {
                stdout,
                stderr: stderr.to_vec(),
                stderr_truncated: false,
                exit: Some(exit),
            },
            elapsed: Duration::from_millis(42),
            notices: notices.iter().map(ToString::to_string).collect(),
        })
    }

    #[test]
    fn run_block_with_output_has_start_and_end_markers() {
        let outcome = executed(
            StdoutCapture::Captured {
                bytes: b"8\n".to_vec(),
                truncated: false,
            },
            b"",
            ExitState::Code(0),
            &[],
        );
        let block = format_run("HW3", &RunKey::new("Add", "basicAdd"), &outcome);
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines[0], "===== HW3 Add run basicAdd =====");
        assert_eq!(lines[1], "----- Start of output from HW3 Add run basicAdd -----");
        assert_eq!(lines[2], "8");
        assert_eq!(lines[3], "----- End of output from HW3 Add run basicAdd -----");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn run_block_without_output_says_so() {
        let outcome = executed(StdoutCapture::Empty, b"", ExitState::Code(0), &[]);
        let block = format_run("HW3", &RunKey::new("Add", "basicAdd"), &outcome);
        assert!(block.contains("No output from HW3 Add run basicAdd"));
    }

    #[test]
    fn run_block_includes_stderr_and_notices_in_order() {
        let outcome = executed(
            StdoutCapture::Captured {
                bytes: b"partial".to_vec(),
                truncated: false,
            },
            b"Exception in thread \"main\"\r\n",
            ExitState::Code(1),
            &["exit code 1"],
        );
        let block = format_run("HW3", &RunKey::new("Add", "basicAdd"), &outcome);
        let stdout_at = block.find("partial\n").unwrap();
        let stderr_at = block.find("Exception in thread \"main\"\n").unwrap();
        let notice_at = block.find("*** HW3 Add run basicAdd: exit code 1").unwrap();
        assert!(stdout_at < stderr_at);
        assert!(stderr_at < notice_at);
        assert!(!block.contains('\r'));
    }

    #[test]
    fn redirected_output_names_the_file() {
        let outcome = executed(
            StdoutCapture::RedirectedToFile(PathBuf::from("/subs/alice/out.txt")),
            b"",
            ExitState::Code(0),
            &[],
        );
        let block = format_run("HW3", &RunKey::new("Add", "basicAdd"), &outcome);
        assert!(block.contains("written to /subs/alice/out.txt"));
    }

    #[test]
    fn not_attempted_occupies_same_position() {
        let outcome = RunOutcome::NotAttempted {
            reason: "compilation failed".to_string(),
        };
        let block = format_run("HW3", &RunKey::new("Add", "basicAdd"), &outcome);
        assert!(block.starts_with("===== HW3 Add run basicAdd =====\n"));
        assert!(block.contains("not attempted: compilation failed"));
    }

    #[test]
    fn submission_without_compile_says_not_attempted() {
        let mut submission = SubmissionResult::new("bob", "/subs/bob");
        submission.missing_files.push("Add.java".to_string());
        let section = format_submission("HW3", &submission);
        assert!(section.starts_with("Name: bob\n"));
        assert!(section.contains("\tAdd.java\n"));
        assert!(section.contains("Did not attempt to compile code"));
    }

    #[test]
    fn shown_sources_precede_compilation_output() {
        let mut submission = SubmissionResult::new("alice", "/subs/alice");
        submission.shown_sources = vec![
            ShownSource {
                file: "Add.java".to_string(),
                contents: Ok("class Add {}".to_string()),
            },
            ShownSource {
                file: "MathUtil.java".to_string(),
                contents: Err("No such file or directory".to_string()),
            },
        ];
        submission.compile = Some(CompileOutcome::Succeeded { invoked: true });

        let section = format_submission("HW3", &submission);
        let shown_at = section.find("---- Java file Add.java ----\nclass Add {}\n").unwrap();
        let missing_at = section
            .find("---- Java file MathUtil.java NOT FOUND! ----\n")
            .unwrap();
        let compile_at = section.find("Compilation Output:").unwrap();
        assert!(shown_at < missing_at);
        assert!(missing_at < compile_at);
    }

    #[test]
    fn summary_rows_cover_executed_and_skipped_runs() {
        let mut submission = SubmissionResult::new("alice", "/subs/alice");
        submission.compile = Some(CompileOutcome::Succeeded { invoked: true });
        submission.runs.insert(
            RunKey::new("Add", "basicAdd"),
            executed(
                StdoutCapture::Captured {
                    bytes: b"8\n".to_vec(),
                    truncated: false,
                },
                b"",
                ExitState::Code(0),
                &[],
            ),
        );
        submission.runs.insert(
            RunKey::new("Add", "later"),
            RunOutcome::NotAttempted {
                reason: "skipped".to_string(),
            },
        );

        let rows = summarize(std::slice::from_ref(&submission));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].run, "Add.basicAdd");
        assert_eq!(rows[0].status, "COMPLETED");
        assert_eq!(rows[0].exit_code, Some(0));
        assert_eq!(rows[0].stdout_bytes, 2);
        assert_eq!(rows[1].status, "NOT_ATTEMPTED");

        let counts = status_counts(&[submission]);
        assert_eq!(counts[0], (RunStatus::Completed, 1));
    }

    #[test]
    fn report_writer_separates_submissions_with_form_feed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("GradingReport.txt");

        let mut writer = ReportWriter::create(&path, "HW3").unwrap();
        writer
            .write_submission(&SubmissionResult::new("alice", "/subs/alice"))
            .unwrap();
        writer
            .write_submission(&SubmissionResult::new("bob", "/subs/bob"))
            .unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.sections(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Assignment: HW3\n"));
        assert_eq!(content.matches('\u{c}').count(), 2);
        assert!(content.find("Name: alice").unwrap() < content.find("Name: bob").unwrap());
    }

    #[test]
    fn write_summary_produces_json_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.json");
        let mut submission = SubmissionResult::new("alice", "/subs/alice");
        submission.runs.insert(
            RunKey::new("Add", "basicAdd"),
            RunOutcome::NotAttempted {
                reason: "missing".to_string(),
            },
        );

        write_summary(&path, &[submission]).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["submission"], "alice");
        assert_eq!(value[0]["run"], "Add.basicAdd");
        assert_eq!(value[0]["status"], "NOT_ATTEMPTED");
    }
}
