//! Assignment definitions: the programs a submission must contain and the
//! run configurations each program is executed with.
//!
//! Loaded from YAML. Problems that make a run impossible to define (a
//! missing security policy file, duplicate run names) are reported here,
//! before anything is compiled or executed.

use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{InputKind, RunSpec};

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read assignment definition {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid assignment definition: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("security policy file {0} does not exist")]
    MissingPolicyFile(PathBuf),
    #[error("copy file source {0} does not exist")]
    MissingCopySource(PathBuf),
    #[error("copy file destination {0} must be a relative path inside the submission")]
    InvalidCopyDestination(PathBuf),
    #[error("program at position {0} has an empty name")]
    EmptyProgramName(usize),
    #[error("program {program} has a run configuration with an empty name")]
    EmptyRunName { program: String },
    #[error("program {program} defines run configuration {run} more than once")]
    DuplicateRun { program: String, run: String },
}

pub type Result<T> = std::result::Result<T, DefinitionError>;

/// One homework assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub name: String,
    #[serde(default)]
    pub programs: Vec<ProgramSpec>,
}

/// A program, its source classes, and how to run it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSpec {
    pub name: String,
    #[serde(default)]
    pub classpath: Option<String>,
    #[serde(default)]
    pub security_policy_file: Option<PathBuf>,
    /// Classes; each must be submitted as `<name>.java`.
    #[serde(default)]
    pub classes: Vec<ClassSpec>,
    /// Instructor files copied into every submission before compiling.
    #[serde(default)]
    pub copy_files: Vec<CopyFile>,
    #[serde(default)]
    pub run_configurations: Vec<RunConfiguration>,
}

/// A required class. Written either as a bare name or as
/// `{ name, show }`; `show` puts the submitted source in the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawClass")]
pub struct ClassSpec {
    pub name: String,
    pub show: bool,
}

impl ClassSpec {
    pub fn file_name(&self) -> String {
        format!("{}.java", self.name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawClass {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        show: bool,
    },
}

impl From<RawClass> for ClassSpec {
    fn from(raw: RawClass) -> Self {
        match raw {
            RawClass::Name(name) => Self { name, show: false },
            RawClass::Detailed { name, show } => Self { name, show },
        }
    }
}

/// An instructor-supplied file placed into each submission directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyFile {
    pub src_path: PathBuf,
    /// Destination relative to the submission directory.
    pub dest_base: PathBuf,
}

/// One named way to run a program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfiguration {
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub input_file: Option<InputFile>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputFile {
    pub path: PathBuf,
    #[serde(default, deserialize_with = "deserialize_input_kind")]
    pub kind: InputKind,
}

/// `submitted` (any case) selects the submission directory; anything else
/// is a fixed path.
fn deserialize_input_kind<'de, D>(deserializer: D) -> std::result::Result<InputKind, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(if raw.trim().eq_ignore_ascii_case("submitted") {
        InputKind::Submitted
    } else {
        InputKind::Fixed
    })
}

impl Assignment {
    /// Load and validate a definition file.
    ///
    /// Relative policy and copy source paths are resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut assignment = Self::parse(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        assignment.resolve_paths(base);
        assignment.validate()?;
        Ok(assignment)
    }

    /// Parse without touching the filesystem.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for program in &mut self.programs {
            if let Some(policy) = &program.security_policy_file {
                if policy.is_relative() {
                    program.security_policy_file = Some(base.join(policy));
                }
            }
            for copy in &mut program.copy_files {
                if copy.src_path.is_relative() {
                    copy.src_path = base.join(&copy.src_path);
                }
            }
        }
    }

    /// Check structural validity.
    pub fn validate(&self) -> Result<()> {
        for (index, program) in self.programs.iter().enumerate() {
            if program.name.trim().is_empty() {
                return Err(DefinitionError::EmptyProgramName(index));
            }
            if let Some(policy) = &program.security_policy_file {
                if !policy.exists() {
                    return Err(DefinitionError::MissingPolicyFile(policy.clone()));
                }
            }
            for copy in &program.copy_files {
                if !copy.src_path.exists() {
                    return Err(DefinitionError::MissingCopySource(copy.src_path.clone()));
                }
                let escapes = copy.dest_base.components().any(|c| {
                    !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
                });
                if copy.dest_base.as_os_str().is_empty() || escapes {
                    return Err(DefinitionError::InvalidCopyDestination(
                        copy.dest_base.clone(),
                    ));
                }
            }
            let mut seen = HashSet::new();
            for run in &program.run_configurations {
                if run.name.trim().is_empty() {
                    return Err(DefinitionError::EmptyRunName {
                        program: program.name.clone(),
                    });
                }
                if !seen.insert(run.name.as_str()) {
                    return Err(DefinitionError::DuplicateRun {
                        program: program.name.clone(),
                        run: run.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Source files every submission must provide, deduplicated in
    /// declaration order.
    pub fn source_files(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.programs
            .iter()
            .flat_map(|program| program.classes.iter())
            .map(ClassSpec::file_name)
            .filter(|file| seen.insert(file.clone()))
            .collect()
    }

    /// Source files whose submitted text goes into the report.
    pub fn shown_files(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.programs
            .iter()
            .flat_map(|program| program.classes.iter())
            .filter(|class| class.show)
            .map(ClassSpec::file_name)
            .filter(|file| seen.insert(file.clone()))
            .collect()
    }

    /// Instructor files of every program, in declaration order.
    pub fn copy_files(&self) -> impl Iterator<Item = &CopyFile> {
        self.programs
            .iter()
            .flat_map(|program| program.copy_files.iter())
    }

    /// Every run of every program, in declaration order.
    pub fn run_specs(&self) -> Vec<RunSpec> {
        self.programs
            .iter()
            .flat_map(|program| {
                program
                    .run_configurations
                    .iter()
                    .map(move |run| RunSpec::from_program(program, run))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEFINITION: &str = r#"
name: Homework 3
programs:
  - name: Add
    classpath: "."
    classes: [Add, MathUtil]
    runConfigurations:
      - name: basicAdd
        arguments: ["5", "3"]
      - name: fromFile
        inputFile:
          path: numbers.txt
          kind: Submitted
        outputFile: sum.txt
  - name: Echo
    classes: [Echo, MathUtil]
    runConfigurations:
      - name: fixedInput
        properties: ["mode=fast"]
        inputFile:
          path: /srv/inputs/echo.txt
"#;

    #[test]
    fn parse_full_definition() {
        let assignment = Assignment::parse(DEFINITION).unwrap();
        assert_eq!(assignment.name, "Homework 3");
        assert_eq!(assignment.programs.len(), 2);

        let add = &assignment.programs[0];
        assert_eq!(add.classpath.as_deref(), Some("."));
        assert_eq!(add.run_configurations[0].arguments, vec!["5", "3"]);

        let from_file = &add.run_configurations[1];
        let input = from_file.input_file.as_ref().unwrap();
        assert_eq!(input.kind, InputKind::Submitted);
        assert_eq!(from_file.output_file, Some(PathBuf::from("sum.txt")));

        let echo = &assignment.programs[1].run_configurations[0];
        assert_eq!(echo.properties, vec!["mode=fast"]);
        assert_eq!(echo.input_file.as_ref().unwrap().kind, InputKind::Fixed);
    }

    #[test]
    fn unrecognised_input_kind_is_fixed() {
        let assignment = Assignment::parse(
            r#"
name: hw
programs:
  - name: P
    runConfigurations:
      - name: r
        inputFile: { path: in.txt, kind: shared }
"#,
        )
        .unwrap();
        let input = assignment.programs[0].run_configurations[0]
            .input_file
            .as_ref()
            .unwrap();
        assert_eq!(input.kind, InputKind::Fixed);
    }

    #[test]
    fn source_files_are_deduplicated_in_order() {
        let assignment = Assignment::parse(DEFINITION).unwrap();
        assert_eq!(
            assignment.source_files(),
            vec!["Add.java", "MathUtil.java", "Echo.java"]
        );
    }

    #[test]
    fn run_specs_cover_every_run_configuration() {
        let assignment = Assignment::parse(DEFINITION).unwrap();
        let keys: Vec<String> = assignment
            .run_specs()
            .iter()
            .map(|spec| spec.key().to_string())
            .collect();
        assert_eq!(keys, vec!["Add.basicAdd", "Add.fromFile", "Echo.fixedInput"]);
    }

    #[test]
    fn duplicate_run_names_are_rejected() {
        let assignment = Assignment::parse(
            r#"
name: hw
programs:
  - name: P
    runConfigurations:
      - name: r
      - name: r
"#,
        )
        .unwrap();
        let err = assignment.validate().unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateRun { ref run, .. } if run == "r"));
    }

    #[test]
    fn empty_program_name_is_rejected() {
        let assignment = Assignment::parse("name: hw\nprograms:\n  - name: \"\"\n").unwrap();
        assert!(matches!(
            assignment.validate(),
            Err(DefinitionError::EmptyProgramName(0))
        ));
    }

    #[test]
    fn load_rejects_missing_policy_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grading.yaml");
        std::fs::write(
            &path,
            "name: hw\nprograms:\n  - name: P\n    securityPolicyFile: missing.policy\n",
        )
        .unwrap();

        let err = Assignment::load(&path).unwrap_err();
        match err {
            DefinitionError::MissingPolicyFile(policy) => {
                assert_eq!(policy, dir.path().join("missing.policy"));
            }
            other => panic!("expected MissingPolicyFile, got {other:?}"),
        }
    }

    #[test]
    fn load_resolves_policy_relative_to_definition() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("java.policy"), "grant {};\n").unwrap();
        let path = dir.path().join("grading.yaml");
        std::fs::write(
            &path,
            "name: hw\nprograms:\n  - name: P\n    securityPolicyFile: java.policy\n",
        )
        .unwrap();

        let assignment = Assignment::load(&path).unwrap();
        assert_eq!(
            assignment.programs[0].security_policy_file,
            Some(dir.path().join("java.policy"))
        );
        let spec = &assignment.run_specs();
        assert!(spec.is_empty());
    }

    #[test]
    fn classes_accept_names_or_show_entries() {
        let assignment = Assignment::parse(
            r#"
name: hw
programs:
  - name: Add
    classes:
      - Add
      - { name: MathUtil, show: true }
"#,
        )
        .unwrap();
        let classes = &assignment.programs[0].classes;
        assert_eq!(classes[0], ClassSpec { name: "Add".to_string(), show: false });
        assert!(classes[1].show);
        assert_eq!(assignment.shown_files(), vec!["MathUtil.java"]);
        assert_eq!(assignment.source_files(), vec!["Add.java", "MathUtil.java"]);
    }

    #[test]
    fn load_resolves_copy_sources_relative_to_definition() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Harness.java"), "class Harness {}\n").unwrap();
        let path = dir.path().join("grading.yaml");
        std::fs::write(
            &path,
            "name: hw\nprograms:\n  - name: P\n    copyFiles:\n      - { srcPath: Harness.java, destBase: Harness.java }\n",
        )
        .unwrap();

        let assignment = Assignment::load(&path).unwrap();
        let copies: Vec<&CopyFile> = assignment.copy_files().collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].src_path, dir.path().join("Harness.java"));
        assert_eq!(copies[0].dest_base, PathBuf::from("Harness.java"));
    }

    #[test]
    fn load_rejects_missing_copy_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grading.yaml");
        std::fs::write(
            &path,
            "name: hw\nprograms:\n  - name: P\n    copyFiles:\n      - { srcPath: gone.java, destBase: gone.java }\n",
        )
        .unwrap();

        let err = Assignment::load(&path).unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::MissingCopySource(ref src) if *src == dir.path().join("gone.java")
        ));
    }

    #[test]
    fn copy_destination_must_stay_inside_submission() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Harness.java"), "").unwrap();
        let src = dir.path().join("Harness.java");
        for dest in ["../Harness.java", "/tmp/Harness.java"] {
            let assignment = Assignment {
                name: "hw".to_string(),
                programs: vec![ProgramSpec {
                    name: "P".to_string(),
                    copy_files: vec![CopyFile {
                        src_path: src.clone(),
                        dest_base: PathBuf::from(dest),
                    }],
                    ..ProgramSpec::default()
                }],
            };
            assert!(matches!(
                assignment.validate(),
                Err(DefinitionError::InvalidCopyDestination(_))
            ));
        }
    }

    #[test]
    fn load_reports_unreadable_file() {
        let dir = TempDir::new().unwrap();
        let err = Assignment::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, DefinitionError::Read { .. }));
    }
}
