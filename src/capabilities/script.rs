//! Script-backed capabilities
//!
//! Runs an external script with the call arguments as a JSON array in
//! `argv[1]`. Stdout is parsed as JSON when possible, otherwise returned as
//! trimmed text; a non-zero exit is an error carrying stderr.
//!
//! Calls arrive on the sandbox's blocking thread, so the child is driven on
//! the ambient tokio runtime and killed when its deadline passes.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::Capability;

/// Deadline for one script run; below the engine's execution timeout.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLanguage {
    Python,
    Node,
    Shell,
}

impl ScriptLanguage {
    pub fn parse(language: &str) -> Option<Self> {
        match language {
            "python" => Some(Self::Python),
            "node" | "javascript" => Some(Self::Node),
            "shell" | "sh" => Some(Self::Shell),
            _ => None,
        }
    }

    fn interpreter(&self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::Node => "node",
            Self::Shell => "sh",
        }
    }
}

pub struct ScriptCapability {
    name: String,
    description: String,
    language: ScriptLanguage,
    script_path: PathBuf,
    timeout: Duration,
}

impl ScriptCapability {
    pub fn new(name: String, description: String, language: ScriptLanguage, script_path: PathBuf) -> Self {
        Self {
            name,
            description,
            language,
            script_path,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_script(&self, args_json: String) -> Result<std::process::Output> {
        let cmd = self.language.interpreter();
        debug!("Executing capability {} using {}", self.name, cmd);

        let child = Command::new(cmd)
            .arg(&self.script_path)
            .arg(args_json)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match timeout(self.timeout, child).await {
            Ok(output) => output.with_context(|| format!("Failed to run capability {}", self.name)),
            Err(_) => {
                warn!("Capability {} killed after {}ms", self.name, self.timeout.as_millis());
                Err(anyhow!(
                    "capability {} timed out after {}ms",
                    self.name,
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

impl Capability for ScriptCapability {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn call(&self, args: &[Value]) -> Result<Value> {
        if !self.script_path.exists() {
            return Err(anyhow!("Script not found: {:?}", self.script_path));
        }

        let args_json = serde_json::to_string(args)?;
        let runtime = Handle::try_current().context("Script capabilities need a tokio runtime")?;
        let output = runtime.block_on(self.run_script(args_json))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "capability {} exited with code {}: {}",
                self.name,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::tempdir;

    /// Calls from a blocking thread, the way the sandbox does.
    async fn call_blocking(capability: ScriptCapability, args: Vec<Value>) -> Result<Value> {
        let capability = Arc::new(capability);
        tokio::task::spawn_blocking(move || capability.call(&args)).await.unwrap()
    }

    #[test]
    fn test_missing_script_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let capability = ScriptCapability::new(
            "ghost".to_string(),
            String::new(),
            ScriptLanguage::Shell,
            temp_dir.path().join("ghost.sh"),
        );
        let err = capability.call(&[json!(1)]).unwrap_err();
        assert!(err.to_string().contains("Script not found"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_shell_script_output() {
        let temp_dir = tempdir().unwrap();
        let script = temp_dir.path().join("echo.sh");
        std::fs::write(&script, "printf '%s' \"$1\"\n").unwrap();

        let capability = ScriptCapability::new("echo".to_string(), String::new(), ScriptLanguage::Shell, script);
        let result = call_blocking(capability, vec![json!("hi"), json!(2)]).await.unwrap();
        assert_eq!(result, json!(["hi", 2]));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_hung_script_is_killed_at_deadline() {
        let temp_dir = tempdir().unwrap();
        let script = temp_dir.path().join("hang.sh");
        std::fs::write(&script, "exec sleep 30\n").unwrap();

        let capability = ScriptCapability::new("hang".to_string(), String::new(), ScriptLanguage::Shell, script)
            .with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = call_blocking(capability, vec![]).await.unwrap_err();

        assert!(err.to_string().contains("timed out after 200ms"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_call_outside_runtime_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let script = temp_dir.path().join("noop.sh");
        std::fs::write(&script, "true\n").unwrap();

        let capability = ScriptCapability::new("noop".to_string(), String::new(), ScriptLanguage::Shell, script);
        assert!(capability.call(&[]).is_err());
    }

    #[test]
    fn test_language_names() {
        assert_eq!(ScriptLanguage::parse("javascript"), Some(ScriptLanguage::Node));
        assert_eq!(ScriptLanguage::parse("cobol"), None);
    }
}
