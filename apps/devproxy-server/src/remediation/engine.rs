use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::EngineSettings;

/// Upper bound for a single validate or reload command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{step} failed: {detail}")]
pub(crate) struct EngineError {
    pub step: &'static str,
    pub detail: String,
}

/// The external proxy engine, reduced to the two operations remediation needs.
#[async_trait]
pub(crate) trait ProxyEngine: Send + Sync {
    async fn validate(&self, bundle: &Path) -> Result<(), EngineError>;
    async fn reload(&self) -> Result<(), EngineError>;
}

/// Runs configured commands; an empty command turns its step into a no-op.
pub(crate) struct CommandEngine {
    validate: Vec<String>,
    reload: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            validate: settings.validate_command.clone(),
            reload: settings.reload_command.clone(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    async fn run(&self, step: &'static str, argv: &[String]) -> Result<(), EngineError> {
        let Some((program, args)) = argv.split_first() else {
            warn!(step, "engine command not configured; skipping");
            return Ok(());
        };
        let fail = |detail: String| EngineError { step, detail };
        debug!(step, ?argv, "running engine command");
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("{program}: {e}")))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| fail(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| fail(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(fail(format!("{}: {detail}", output.status)))
    }
}

#[async_trait]
impl ProxyEngine for CommandEngine {
    async fn validate(&self, bundle: &Path) -> Result<(), EngineError> {
        let bundle = bundle.display().to_string();
        let argv: Vec<String> = self
            .validate
            .iter()
            .map(|arg| arg.replace("{bundle}", &bundle))
            .collect();
        self.run("validate", &argv).await
    }

    async fn reload(&self) -> Result<(), EngineError> {
        self.run("reload", &self.reload).await
    }
}
