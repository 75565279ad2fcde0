//! Engine configuration.
//!
//! Key=value format, read from `.grader/config` in the assignment root.
//! Precedence: CLI flags > `--config` file > `.grader/config` > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default relative location of the config file inside an assignment root.
pub const DEFAULT_CONFIG_PATH: &str = ".grader/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("{key} must not be empty")]
    EmptyValue { key: String },
    #[error("{key} must be greater than 0")]
    ZeroValue { key: String },
}

/// Engine settings shared by every run of a batch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Tools
    pub runtime: String,
    pub compiler: String,
    pub compiler_args: Vec<String>,

    // Limits
    pub run_timeout_sec: u32,
    /// 0 disables the compile timeout.
    pub compile_timeout_sec: u32,
    pub stdout_cap_bytes: usize,
    pub stderr_cap_bytes: usize,
    /// How long to wait for output pumps after the process is gone.
    pub capture_grace_ms: u64,

    // Sandbox
    /// System property that carries the submissions' base directory.
    pub sandbox_base_property: String,

    // Files
    pub definition_file: PathBuf,
    pub report_file: PathBuf,
    /// Write a JSON summary next to the report.
    pub summary_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: "java".to_string(),
            compiler: "javac".to_string(),
            compiler_args: Vec::new(),
            run_timeout_sec: 15,
            compile_timeout_sec: 120,
            stdout_cap_bytes: 1024 * 1024,
            stderr_cap_bytes: 1024 * 1024,
            capture_grace_ms: 5000,
            sandbox_base_property: "grading.base".to_string(),
            definition_file: PathBuf::from("grading.yaml"),
            report_file: PathBuf::from("GradingReport.txt"),
            summary_json: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Per-run wall-clock limit.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.run_timeout_sec))
    }

    /// Compiler wall-clock limit, if any.
    pub fn compile_timeout(&self) -> Option<Duration> {
        (self.compile_timeout_sec > 0).then(|| Duration::from_secs(u64::from(self.compile_timeout_sec)))
    }

    pub fn capture_grace(&self) -> Duration {
        Duration::from_millis(self.capture_grace_ms)
    }

    /// Resolve relative file paths against the assignment root.
    pub fn resolve_paths(&mut self, root: &Path) {
        if self.definition_file.is_relative() {
            self.definition_file = root.join(&self.definition_file);
        }
        if self.report_file.is_relative() {
            self.report_file = root.join(&self.report_file);
        }
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "runtime" => self.runtime = Self::non_empty(key, value)?,
            "compiler" => self.compiler = Self::non_empty(key, value)?,
            "compiler_args" => {
                self.compiler_args = value.split_whitespace().map(str::to_string).collect();
            }
            "run_timeout_sec" => self.run_timeout_sec = Self::positive(key, value)?,
            "compile_timeout_sec" => self.compile_timeout_sec = Self::parse_int(key, value)?,
            "stdout_cap_bytes" => self.stdout_cap_bytes = Self::parse_int(key, value)?,
            "stderr_cap_bytes" => self.stderr_cap_bytes = Self::parse_int(key, value)?,
            "capture_grace_ms" => self.capture_grace_ms = Self::parse_int(key, value)?,
            "sandbox_base_property" => {
                self.sandbox_base_property = Self::non_empty(key, value)?;
            }
            "definition_file" => self.definition_file = PathBuf::from(Self::non_empty(key, value)?),
            "report_file" => self.report_file = PathBuf::from(Self::non_empty(key, value)?),
            "summary_json" => self.summary_json = Self::parse_bool(key, value)?,
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn non_empty(key: &str, value: &str) -> Result<String, ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::EmptyValue {
                key: key.to_string(),
            });
        }
        Ok(value.to_string())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn positive(key: &str, value: &str) -> Result<u32, ConfigError> {
        match Self::parse_int(key, value)? {
            0 => Err(ConfigError::ZeroValue {
                key: key.to_string(),
            }),
            n => Ok(n),
        }
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}
