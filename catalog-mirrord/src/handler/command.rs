use std::process::Stdio;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use crate::catalog_manager::Catalog;
use super::UpdateHandler;

/// Environment variable carrying the catalog fingerprint to the program
pub const FINGERPRINT_ENV: &str = "CATALOG_FINGERPRINT";

/// Runs a program on every update cycle
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(command: Vec<String>) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts.next().context("command must not be empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl UpdateHandler for CommandHandler {
    fn name(&self) -> &str {
        &self.program
    }

    async fn handle(&self, catalog: &Catalog) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Ok(fingerprint) = catalog.fingerprint().await {
            command.env(FINGERPRINT_ENV, fingerprint);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!("{} stdout: {}", self.program, stdout.trim_end());
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} exited with {}: {}", self.program, output.status, stderr.trim_end());
        }
        Ok(())
    }
}
