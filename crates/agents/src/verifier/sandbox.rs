//! Docker sandbox runner.
//!
//! Untrusted project code only ever executes inside a container with no
//! network, bounded memory/CPU/processes, all capabilities dropped, no
//! privilege escalation and a non-root user. The container is uniquely
//! named per run and force-removed afterwards whatever the outcome.

use neverdown_common::{AgentFailure, ErrorCode};
use neverdown_config::Settings;
use neverdown_models::SandboxInfo;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

/// Env var name substrings that must never reach the sandbox.
const BLOCKED_ENV_SUBSTRINGS: &[&str] = &["secret", "key", "password", "token"];

/// Result of one sandboxed command.
#[derive(Debug)]
pub struct SandboxResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Sandbox configuration, frozen at construction.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub timeout: Duration,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub work_dir: String,
    pub user: String,
}

impl SandboxConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            image: settings.sandbox_image.clone(),
            timeout: Duration::from_secs(settings.sandbox_timeout_secs),
            memory_limit: settings.sandbox_memory_limit.clone(),
            cpu_limit: settings.sandbox_cpu_limit,
            work_dir: "/app".to_string(),
            user: "1000:1000".to_string(),
        }
    }
}

/// Runs commands in isolated containers.
pub struct SandboxRunner {
    config: SandboxConfig,
}

impl SandboxRunner {
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Whether a docker daemon is reachable.
    pub async fn docker_available() -> bool {
        Command::new("docker")
            .arg("version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run one command against a mounted copy of `repo_path`.
    pub async fn run(
        &self,
        repo_path: &Path,
        command: &[&str],
        env: &[(String, String)],
    ) -> Result<SandboxResult, AgentFailure> {
        let container_name = format!("neverdown-sandbox-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let args = self.docker_args(&container_name, repo_path, command, env);

        info!(container = %container_name, "Starting sandbox container");
        let started = Instant::now();

        let child = Command::new("docker")
            .args(&args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                AgentFailure::new(ErrorCode::DockerError, format!("docker spawn failed: {e}"))
            })?;

        let result = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => SandboxResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration: started.elapsed(),
                timed_out: false,
            },
            Ok(Err(e)) => {
                self.remove_container(&container_name).await;
                return Err(AgentFailure::new(
                    ErrorCode::DockerError,
                    format!("docker execution failed: {e}"),
                ));
            }
            Err(_) => {
                // Wall clock exceeded: force-kill, report the timeout
                self.kill_container(&container_name).await;
                SandboxResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: "Sandbox execution timed out".to_string(),
                    duration: started.elapsed(),
                    timed_out: true,
                }
            }
        };

        self.remove_container(&container_name).await;
        Ok(result)
    }

    /// Assemble the `docker run` argument list with every isolation flag.
    fn docker_args(
        &self,
        container_name: &str,
        repo_path: &Path,
        command: &[&str],
        env: &[(String, String)],
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--rm".to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            self.config.memory_limit.clone(),
            format!("--cpus={}", self.config.cpu_limit),
            "--pids-limit".to_string(),
            "100".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--user".to_string(),
            self.config.user.clone(),
            "-v".to_string(),
            format!("{}:{}:rw", repo_path.display(), self.config.work_dir),
            "-w".to_string(),
            self.config.work_dir.clone(),
        ];

        for (key, value) in env {
            let lowered = key.to_lowercase();
            if BLOCKED_ENV_SUBSTRINGS.iter().any(|s| lowered.contains(s)) {
                continue;
            }
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(self.config.image.clone());
        args.extend(command.iter().map(ToString::to_string));
        args
    }

    async fn kill_container(&self, name: &str) {
        let result = Command::new("docker")
            .args(["kill", name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = name, "Failed to kill container: {e}");
        }
    }

    async fn remove_container(&self, name: &str) {
        // Best effort; --rm usually got there first
        let _ = Command::new("docker")
            .args(["rm", "-f", name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
    }

    /// Sandbox metadata for verification results.
    #[must_use]
    pub fn info(&self) -> SandboxInfo {
        SandboxInfo {
            image: self.config.image.clone(),
            memory_limit: self.config.memory_limit.clone(),
            timeout_secs: self.config.timeout.as_secs(),
        }
    }
}
