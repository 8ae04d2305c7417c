//! Configuration management for Convoy.
//!
//! This module defines the structure of the `convoy.toml` configuration file and turns
//! it into a validated [`Catalog`] of executables, pods and flows.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::pod::PodSpec;
use crate::process::ExecSpec;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG: &str = "convoy.toml";

/// Top-level configuration structure corresponding to `convoy.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Local executables.
    #[serde(default, rename = "exec")]
    pub executables: Vec<ExecConfig>,
    /// Kubernetes pod forwards.
    #[serde(default, rename = "pod")]
    pub pods: Vec<PodConfig>,
    /// Named groups of executables and pods.
    #[serde(default, rename = "flow")]
    pub flows: Vec<FlowConfig>,
}

/// What to do with an executable's standard error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdErrPolicy {
    /// Drop it.
    Ignore,
    /// Treat it like standard output.
    Log,
    /// Tag each line as an error.
    #[default]
    Error,
}

/// Configuration for a single executable.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Identity of the executable.
    pub id: String,
    /// Alternative short name.
    pub shortcut: Option<String>,
    pub description: Option<String>,
    /// Command line, split with shell-word rules.
    pub cmd: String,
    /// Working directory.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub env: Option<HashMap<String, String>>,
    /// Delay before the first launch, in milliseconds.
    pub delay_ms: Option<u64>,
    /// Paths whose writes trigger a restart.
    pub watch: Option<Vec<String>>,
    /// Glob patterns excluded from watching.
    pub watch_ignore: Option<Vec<String>>,
    /// Whether `.gitignore` rules exclude paths from watching (default: true).
    pub watch_gitignore: Option<bool>,
    /// Quiet period folding a burst of writes into one restart.
    pub debounce_ms: Option<u64>,
    /// Standard error handling (default: error).
    pub stderr: Option<StdErrPolicy>,
    /// Whether to sample the process's memory.
    pub monitor_memory: Option<bool>,
}

/// Configuration for a single pod forward.
#[derive(Debug, Clone, Deserialize)]
pub struct PodConfig {
    /// Identity of the pod forward.
    pub id: String,
    /// Alternative short name.
    pub shortcut: Option<String>,
    pub description: Option<String>,
    pub namespace: String,
    /// Name prefix of the pod; live pods carry a generated suffix.
    pub name: String,
    /// Container whose logs are tailed.
    pub container: Option<String>,
    pub local_port: u16,
    pub pod_port: u16,
}

/// Configuration for a flow.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    pub id: String,
    pub shortcut: Option<String>,
    pub description: Option<String>,
    /// Executable identities.
    #[serde(default)]
    pub exec: Vec<String>,
    /// Pod identities.
    #[serde(default)]
    pub pod: Vec<String>,
}

/// A named group expanding to executables and pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub id: String,
    pub shortcut: Option<String>,
    pub description: Option<String>,
    pub executables: Vec<String>,
    pub pods: Vec<String>,
}

impl From<FlowConfig> for FlowSpec {
    fn from(config: FlowConfig) -> Self {
        Self {
            id: config.id,
            shortcut: config.shortcut,
            description: config.description,
            executables: config.exec,
            pods: config.pod,
        }
    }
}

/// Validated, in-memory configuration consumed by the supervisor.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    executables: Vec<ExecSpec>,
    pods: Vec<PodSpec>,
    flows: Vec<FlowSpec>,
}

impl Catalog {
    pub fn from_config(config: Config) -> Result<Self> {
        let executables = config
            .executables
            .into_iter()
            .map(ExecSpec::from_config)
            .collect::<Result<Vec<_>>>()?;
        let pods = config
            .pods
            .into_iter()
            .map(PodSpec::from_config)
            .collect::<Result<Vec<_>>>()?;
        let flows: Vec<FlowSpec> = config.flows.into_iter().map(FlowSpec::from).collect();

        ensure_unique(
            "executable",
            executables.iter().map(|e| (e.id.as_str(), e.shortcut.as_deref())),
        )?;
        ensure_unique(
            "pod",
            pods.iter().map(|p| (p.id.as_str(), p.shortcut.as_deref())),
        )?;
        ensure_unique(
            "flow",
            flows.iter().map(|f| (f.id.as_str(), f.shortcut.as_deref())),
        )?;

        Ok(Self {
            executables,
            pods,
            flows,
        })
    }

    /// Looks up an executable by id, then by shortcut.
    pub fn exec(&self, key: &str) -> Option<&ExecSpec> {
        self.executables
            .iter()
            .find(|e| e.id == key)
            .or_else(|| self.executables.iter().find(|e| e.shortcut.as_deref() == Some(key)))
    }

    /// Looks up a pod by id, then by shortcut.
    pub fn pod(&self, key: &str) -> Option<&PodSpec> {
        self.pods
            .iter()
            .find(|p| p.id == key)
            .or_else(|| self.pods.iter().find(|p| p.shortcut.as_deref() == Some(key)))
    }

    /// Looks up a flow by id, then by shortcut.
    pub fn flow(&self, key: &str) -> Option<&FlowSpec> {
        self.flows
            .iter()
            .find(|f| f.id == key)
            .or_else(|| self.flows.iter().find(|f| f.shortcut.as_deref() == Some(key)))
    }

    pub fn executables(&self) -> &[ExecSpec] {
        &self.executables
    }

    pub fn pods(&self) -> &[PodSpec] {
        &self.pods
    }

    pub fn flows(&self) -> &[FlowSpec] {
        &self.flows
    }
}

fn ensure_unique<'a>(
    kind: &str,
    entries: impl Iterator<Item = (&'a str, Option<&'a str>)>,
) -> Result<()> {
    let mut ids = HashSet::new();
    let mut shortcuts = HashSet::new();
    for (id, shortcut) in entries {
        if id.trim().is_empty() {
            bail!("{} with an empty id", kind);
        }
        if !ids.insert(id) {
            bail!("duplicate {} id: {}", kind, id);
        }
        if let Some(shortcut) = shortcut {
            if !shortcuts.insert(shortcut) {
                bail!("shortcut {} duplicated in {}s", shortcut, kind);
            }
        }
    }
    Ok(())
}

/// Loads and validates the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Catalog> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Catalog::from_config(config)
        .with_context(|| format!("invalid config file {}", path.display()))
}
