//! Data structures describing a supervised executable.
//!
//! This module defines the specification for an executable (`ExecSpec`) and the
//! lifecycle states (`State`) its task moves through across restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::{ExecConfig, StdErrPolicy};

/// Debounce applied to watch events when none is configured.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Specification for an executable to be run.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Identity of the executable.
    pub id: String,
    pub shortcut: Option<String>,
    pub description: Option<String>,
    /// The command executable.
    pub cmd: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Environment overrides on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Delay before the first launch.
    pub delay: Option<Duration>,
    /// Paths to watch for changes.
    pub watch_paths: Vec<String>,
    /// Patterns to ignore when watching.
    pub watch_ignore: Vec<String>,
    /// Whether gitignore rules exclude paths from watching.
    pub watch_gitignore: bool,
    /// Quiet period for folding watch events.
    pub debounce: Duration,
    pub stderr: StdErrPolicy,
    /// Whether to emit memory samples.
    pub monitor_memory: bool,
}

impl ExecSpec {
    pub fn from_config(config: ExecConfig) -> Result<Self> {
        let mut parts = shell_words::split(&config.cmd)
            .with_context(|| format!("failed to parse cmd for {}", config.id))?;
        if parts.is_empty() {
            return Err(anyhow!("empty cmd for {}", config.id));
        }
        let cmd = parts.remove(0);
        Ok(Self {
            id: config.id,
            shortcut: config.shortcut,
            description: config.description,
            cmd,
            args: parts,
            cwd: config.cwd.map(PathBuf::from),
            env: config.env.unwrap_or_default(),
            delay: config.delay_ms.map(Duration::from_millis),
            watch_paths: config.watch.unwrap_or_default(),
            watch_ignore: config.watch_ignore.unwrap_or_default(),
            watch_gitignore: config.watch_gitignore.unwrap_or(true),
            debounce: config
                .debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DEBOUNCE),
            stderr: config.stderr.unwrap_or_default(),
            monitor_memory: config.monitor_memory.unwrap_or(false),
        })
    }

    /// The command line, re-quoted for display.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.cmd.clone());
        parts.extend(self.args.clone());
        shell_words::join(parts)
    }
}

/// Lifecycle of an executable task.
///
/// `Idle → Starting → Running → Restarting → Starting …`, and from `Running` or
/// `Restarting` to `Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not launched yet.
    Idle,
    /// Spawning the process.
    Starting,
    /// The current process generation is live (or exited and awaiting a change).
    Running,
    /// Killing the current generation before relaunching.
    Restarting,
    /// Terminating.
    Stopping,
    /// Resources released; the task will not relaunch.
    Stopped,
}

impl State {
    pub fn is_final(self) -> bool {
        matches!(self, State::Stopping | State::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_config(raw: &str) -> ExecConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn splits_command_line() {
        let spec = ExecSpec::from_config(exec_config(
            r#"
id = "api"
cmd = "sh -c 'echo hi && sleep 1'"
"#,
        ))
        .unwrap();
        assert_eq!(spec.cmd, "sh");
        assert_eq!(spec.args, vec!["-c", "echo hi && sleep 1"]);
        assert_eq!(spec.command_line(), "sh -c 'echo hi && sleep 1'");
        assert_eq!(spec.debounce, DEFAULT_DEBOUNCE);
    }

    #[test]
    fn rejects_unbalanced_quotes() {
        let err = ExecSpec::from_config(exec_config(
            r#"
id = "api"
cmd = "echo 'oops"
"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("failed to parse cmd for api"));
    }

    #[test]
    fn final_states() {
        assert!(State::Stopping.is_final());
        assert!(State::Stopped.is_final());
        assert!(!State::Restarting.is_final());
        assert!(!State::Idle.is_final());
    }
}
