use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::task::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("generator exited with {status}, log: {output}")]
    Exited { status: String, output: String },

    #[error("generator reported success but {0} is not readable")]
    MissingArtifact(PathBuf),
}

/// Turns a prompt into an artifact.
///
/// Returns the artifact reference the browser uses to fetch the result.
/// Called by the worker with exactly one job in flight at a time.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, task_id: TaskId) -> Result<String, GenerateError>;
}

/// Where and how to launch the external generation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub program: String,
    pub working_dir: PathBuf,
    pub script: String,
    pub output_dir: PathBuf,
}

/// Runs `<program> <script> --prompt <prompt> --output <path>` as a child
/// process and treats exit status zero plus a readable file as success.
pub struct ScriptGenerator {
    config: GeneratorConfig,
}

impl ScriptGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn artifact_name(task_id: TaskId, unix_secs: i64) -> String {
        format!("task_{}_{}.png", task_id, unix_secs)
    }

    async fn output_dir(&self) -> Result<PathBuf, GenerateError> {
        let dir = &self.config.output_dir;
        let map_err = |source| GenerateError::OutputDir {
            path: dir.clone(),
            source,
        };
        tokio::fs::create_dir_all(dir).await.map_err(map_err)?;
        std::path::absolute(dir).map_err(map_err)
    }
}

#[async_trait]
impl Generator for ScriptGenerator {
    async fn generate(&self, prompt: &str, task_id: TaskId) -> Result<String, GenerateError> {
        let file_name = Self::artifact_name(task_id, chrono::Utc::now().timestamp());
        let output_path = self.output_dir().await?.join(&file_name);

        let mut cmd = Command::new(&self.config.program);
        cmd.arg(&self.config.script)
            .arg("--prompt")
            .arg(prompt)
            .arg("--output")
            .arg(&output_path)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must not leave the child running.
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|source| GenerateError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
            log.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(GenerateError::Exited {
                status: output.status.to_string(),
                output: log.trim().to_string(),
            });
        }

        if !is_readable(&output_path).await {
            return Err(GenerateError::MissingArtifact(output_path));
        }

        Ok(file_name)
    }
}

async fn is_readable(path: &Path) -> bool {
    tokio::fs::File::open(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WRITES_OUTPUT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf 'png' > "$out"
"#;

    fn script_generator(dir: &TempDir, script_body: &str) -> ScriptGenerator {
        let script = dir.path().join("gen.sh");
        std::fs::write(&script, script_body).unwrap();
        ScriptGenerator::new(GeneratorConfig {
            program: "sh".into(),
            working_dir: dir.path().to_path_buf(),
            script: script.to_string_lossy().into_owned(),
            output_dir: dir.path().join("images"),
        })
    }

    #[test]
    fn artifact_name_matches_browser_convention() {
        assert_eq!(ScriptGenerator::artifact_name(1, 171234), "task_1_171234.png");
    }

    #[tokio::test]
    async fn successful_run_returns_file_name() {
        let dir = TempDir::new().unwrap();
        let generator = script_generator(&dir, WRITES_OUTPUT);

        let name = generator.generate("a cat", 4).await.unwrap();
        assert!(name.starts_with("task_4_"));
        assert!(name.ends_with(".png"));
        assert!(dir.path().join("images").join(&name).exists());
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let dir = TempDir::new().unwrap();
        let generator = script_generator(&dir, "echo 'CUDA out of memory' >&2\nexit 3\n");

        let err = generator.generate("a cat", 5).await.unwrap_err();
        match err {
            GenerateError::Exited { output, .. } => assert!(output.contains("CUDA out of memory")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_exit_without_artifact_is_failure() {
        let dir = TempDir::new().unwrap();
        let generator = script_generator(&dir, "exit 0\n");

        let err = generator.generate("a cat", 6).await.unwrap_err();
        assert!(matches!(err, GenerateError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let generator = ScriptGenerator::new(GeneratorConfig {
            program: "definitely-not-a-real-interpreter".into(),
            working_dir: dir.path().to_path_buf(),
            script: "x.py".into(),
            output_dir: dir.path().join("images"),
        });

        let err = generator.generate("a cat", 7).await.unwrap_err();
        assert!(matches!(err, GenerateError::Spawn { .. }));
    }
}
