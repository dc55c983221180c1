//! Runs the external story generation script for one session.

use crate::session::Session;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Interpreter used to launch the script.
    pub program: String,
    pub script: PathBuf,
    /// Working directory for the child process; inherits ours when unset.
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub no_cache: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            script: PathBuf::from("main.py"),
            working_dir: None,
            timeout: Duration::from_secs(600),
            no_cache: true,
        }
    }
}

/// Knobs the upload form passes through to the script.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub style: String,
    pub length: u32,
    pub temperature: f32,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            style: "adventure".to_string(),
            length: 300,
            temperature: 0.3,
        }
    }
}

#[derive(Debug)]
pub struct GenerationOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum GenerateError {
    ScriptMissing(PathBuf),
    Spawn(std::io::Error),
    Timeout(Duration),
    Failed { code: Option<i32>, stderr: String },
}

impl fmt::Display for GenerateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerateError::ScriptMissing(path) => {
                write!(f, "generation script not found at {}", path.display())
            }
            GenerateError::Spawn(err) => write!(f, "failed to run generation script: {err}"),
            GenerateError::Timeout(limit) => {
                write!(f, "generation script timed out after {}s", limit.as_secs())
            }
            GenerateError::Failed { code, stderr } => match code {
                Some(code) => write!(f, "generation script exited with status {code}: {stderr}"),
                None => write!(f, "generation script was terminated: {stderr}"),
            },
        }
    }
}

impl std::error::Error for GenerateError {}

#[derive(Debug, Clone)]
pub struct Generator {
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn script_path(&self) -> PathBuf {
        match &self.config.working_dir {
            Some(dir) if self.config.script.is_relative() => dir.join(&self.config.script),
            _ => self.config.script.clone(),
        }
    }

    fn arguments(&self, session: &Session, request: &GenerationRequest) -> Vec<String> {
        let mut args = vec![
            self.script_path().display().to_string(),
            "--input".to_string(),
            session.input_dir().display().to_string(),
            "--output".to_string(),
            session.output_dir().display().to_string(),
            "--style".to_string(),
            request.style.clone(),
            "--length".to_string(),
            request.length.to_string(),
            "--temperature".to_string(),
            request.temperature.to_string(),
        ];
        if self.config.no_cache {
            args.push("--no-cache".to_string());
        }
        args
    }

    /// Runs the script against the session's directories and waits for it,
    /// killing the child if the timeout elapses.
    pub async fn run(
        &self,
        session: &Session,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, GenerateError> {
        let script = self.script_path();
        if !script.is_file() {
            error!(script = %script.display(), "generation script not found");
            return Err(GenerateError::ScriptMissing(script));
        }

        let mut command = Command::new(&self.config.program);
        command
            .args(self.arguments(session, request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        info!(
            session = %session.id(),
            program = %self.config.program,
            script = %script.display(),
            style = %request.style,
            length = request.length,
            temperature = request.temperature,
            "running generation script"
        );
        let child = command.spawn().map_err(GenerateError::Spawn)?;
        let output = match timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(GenerateError::Spawn)?,
            Err(_) => {
                error!(session = %session.id(), limit = ?self.config.timeout, "generation script timed out");
                return Err(GenerateError::Timeout(self.config.timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            error!(session = %session.id(), status = ?output.status.code(), %stderr, "generation script failed");
            return Err(GenerateError::Failed {
                code: output.status.code(),
                stderr,
            });
        }
        if !stderr.trim().is_empty() {
            warn!(session = %session.id(), %stderr, "generation script wrote to stderr");
        }
        Ok(GenerationOutput { stdout, stderr })
    }
}
