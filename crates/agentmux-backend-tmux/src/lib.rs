//! Terminal session backend over the `tmux` binary.
//!
//! Every operation is one external-process invocation wrapped in a bounded
//! timeout; a hung server surfaces as `BackendError::Timeout` instead of
//! stalling the reconciliation cycle.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::timeout;

use agentmux_protocol::backend::{BackendSession, SessionBackend, SessionProbe};
use agentmux_protocol::error::{BackendError, BackendResult};

pub const DEFAULT_TMUX_BINARY: &str = "tmux";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const LIST_SESSIONS_FORMAT: &str = "#{session_name}\t#{session_activity}";
const PROBE_PANE_FORMAT: &str = "#{pane_dead}\t#{pane_dead_status}";

#[derive(Debug, Clone)]
pub struct TmuxBackendConfig {
    pub binary: PathBuf,
    pub call_timeout: Duration,
}

impl Default for TmuxBackendConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_TMUX_BINARY),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TmuxSessionBackend {
    config: TmuxBackendConfig,
}

impl TmuxSessionBackend {
    pub fn new(config: TmuxBackendConfig) -> Self {
        Self { config }
    }

    async fn run_tmux(&self, args: &[&str]) -> BackendResult<std::process::Output> {
        let invocation = format!("tmux {}", args.join(" "));
        let result = timeout(
            self.config.call_timeout,
            Command::new(&self.config.binary)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| BackendError::Timeout(invocation.clone()))?;

        result.map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                BackendError::BinaryNotFound(self.config.binary.display().to_string())
            } else {
                BackendError::Process(format!("{invocation}: {error}"))
            }
        })
    }

    async fn run_tmux_expecting_success(&self, args: &[&str]) -> BackendResult<String> {
        let output = self.run_tmux(args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if !output.status.success() {
            if stderr_indicates_missing_session(&stderr) {
                return Err(BackendError::SessionNotFound(stderr));
            }
            let detail = if stderr.is_empty() {
                format!("tmux {} exited with {}", args.join(" "), output.status)
            } else {
                stderr
            };
            return Err(BackendError::Process(detail));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SessionBackend for TmuxSessionBackend {
    async fn spawn_session(
        &self,
        name: &str,
        workdir: &Path,
        command: Option<&str>,
    ) -> BackendResult<()> {
        let workdir = workdir.display().to_string();
        let mut args = vec!["new-session", "-d", "-s", name, "-c", workdir.as_str()];
        if let Some(command) = command {
            args.push(command);
        }
        self.run_tmux_expecting_success(&args).await?;
        tracing::debug!(session = name, "spawned backend session");
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> BackendResult<()> {
        let target = exact_target(name);
        self.run_tmux_expecting_success(&["kill-session", "-t", target.as_str()])
            .await?;
        tracing::debug!(session = name, "killed backend session");
        Ok(())
    }

    async fn detach_session(&self, name: &str) -> BackendResult<()> {
        self.run_tmux_expecting_success(&["detach-client", "-s", name])
            .await?;
        Ok(())
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        vec![
            self.config.binary.display().to_string(),
            "attach-session".to_owned(),
            "-t".to_owned(),
            exact_target(name),
        ]
    }

    async fn list_sessions(&self, prefix: &str) -> BackendResult<Vec<BackendSession>> {
        let output = self
            .run_tmux(&["list-sessions", "-F", LIST_SESSIONS_FORMAT])
            .await?;
        if !output.status.success() {
            // No server running means no sessions, not a failure.
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(parse_session_listing(&stdout, prefix))
    }

    async fn probe_session(&self, name: &str) -> BackendResult<SessionProbe> {
        let target = exact_target(name);
        let output = self
            .run_tmux(&["has-session", "-t", target.as_str()])
            .await?;
        if !output.status.success() {
            return Ok(SessionProbe {
                alive: false,
                exit_code: None,
            });
        }

        // The session exists; a dead pane (remain-on-exit) means the hosted
        // process is gone and may carry an exit status.
        let display = self
            .run_tmux_expecting_success(&[
                "display-message",
                "-p",
                "-t",
                target.as_str(),
                PROBE_PANE_FORMAT,
            ])
            .await;
        match display {
            Ok(stdout) => Ok(parse_probe_output(&stdout)),
            Err(BackendError::SessionNotFound(_)) => Ok(SessionProbe {
                alive: false,
                exit_code: None,
            }),
            Err(error) => Err(error),
        }
    }

    async fn health_check(&self) -> BackendResult<()> {
        let output = self.run_tmux(&["-V"]).await?;
        if !output.status.success() {
            return Err(BackendError::Process(format!(
                "tmux -V exited with {}",
                output.status
            )));
        }
        Ok(())
    }
}

/// `=name` pins tmux target matching to the exact session name instead of
/// prefix matching.
fn exact_target(name: &str) -> String {
    format!("={name}")
}

fn stderr_indicates_missing_session(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("can't find session")
        || lowered.contains("session not found")
        || lowered.contains("no such session")
}

fn parse_session_listing(stdout: &str, prefix: &str) -> Vec<BackendSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, activity) = match line.split_once('\t') {
                Some((name, activity)) => (name.trim(), activity.trim()),
                None => (line.trim(), ""),
            };
            if name.is_empty() || !name.starts_with(prefix) {
                return None;
            }
            Some(BackendSession {
                name: name.to_owned(),
                last_activity: parse_activity_timestamp(activity),
            })
        })
        .collect()
}

fn parse_activity_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let seconds: i64 = raw.parse().ok()?;
    DateTime::from_timestamp(seconds, 0)
}

fn parse_probe_output(stdout: &str) -> SessionProbe {
    let mut fields = stdout.trim().split('\t');
    let pane_dead = fields.next().unwrap_or("");
    let dead_status = fields.next().unwrap_or("");
    if pane_dead == "1" {
        SessionProbe {
            alive: false,
            exit_code: dead_status.parse().ok(),
        }
    } else {
        SessionProbe {
            alive: true,
            exit_code: None,
        }
    }
}
