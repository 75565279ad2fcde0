pub mod assignment;
pub mod config;
pub mod report;
pub mod types;

pub use assignment::{Assignment, ClassSpec, CopyFile, ProgramSpec, RunConfiguration};
pub use config::Config;
pub use report::{ReportWriter, RunSummary};
pub use types::*;
