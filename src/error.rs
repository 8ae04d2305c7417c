//! Error types shared by tasks, the Kubernetes collaborator and the supervisor.

use std::process::ExitStatus;

use thiserror::Error;

/// Failures reported by the Kubernetes collaborator.
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("failed to load kubernetes config: {0}")]
    Config(#[from] kube::config::KubeconfigError),
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
    #[error("failed to run kubectl {action}: {source}")]
    Command {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("kubectl {action} exited with {status}")]
    Exited {
        action: &'static str,
        status: ExitStatus,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal per-task errors. Each one ends the task that raised it.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("watcher failed: {0}")]
    Watch(String),
    #[error("no pod found in namespace {0}")]
    NoPods(String),
    #[error("no pod matching {pattern} found in namespace {namespace}")]
    NoMatch { pattern: String, namespace: String },
    #[error("port-forward failed: {0}")]
    Forward(#[source] KubeError),
    #[error(transparent)]
    Cluster(#[from] KubeError),
    #[error("failed to kill process group {pgid}: {source}")]
    Signal {
        pgid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by [`crate::supervisor::Supervisor`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("invalid pod pattern for {id}: {source}")]
    Pattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to load kubernetes client: {0}")]
    Cluster(#[source] KubeError),
    #[error("supervisor already started")]
    AlreadyStarted,
    #[error("{id} received an unrecoverable error: {source}")]
    Task {
        id: String,
        #[source]
        source: TaskError,
    },
    #[error("{0} panicked")]
    Panicked(String),
    #[error("can't stop properly: {}", .0.join(", "))]
    Shutdown(Vec<String>),
}
