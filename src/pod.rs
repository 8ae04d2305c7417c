//! Pod task: tails a pod's logs and forwards a local port to it.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cluster::{Cluster, Session};
use crate::config::PodConfig;
use crate::error::{KubeError, TaskError};
use crate::frame::frame;
use crate::message::{Kind, Message, Sink};
use crate::runnable::Runnable;

/// Specification for a pod forward.
#[derive(Debug, Clone)]
pub struct PodSpec {
    pub id: String,
    pub shortcut: Option<String>,
    pub description: Option<String>,
    pub namespace: String,
    /// Name prefix of the target pod.
    pub pattern: String,
    pub container: Option<String>,
    pub local_port: u16,
    pub pod_port: u16,
}

impl PodSpec {
    pub fn from_config(config: PodConfig) -> Result<Self> {
        if config.namespace.trim().is_empty() {
            bail!("empty namespace for pod {}", config.id);
        }
        if config.name.trim().is_empty() {
            bail!("empty name for pod {}", config.id);
        }
        Ok(Self {
            id: config.id,
            shortcut: config.shortcut,
            description: config.description,
            namespace: config.namespace,
            pattern: config.name,
            container: config.container,
            local_port: config.local_port,
            pod_port: config.pod_port,
        })
    }
}

/// Matches the names a Deployment gives its pods: `<pattern>-<7..10 word chars>-<5..7 word chars>`.
#[derive(Debug, Clone)]
pub struct PodMatcher(Regex);

impl PodMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!(r"^{}-\w{{7,10}}-\w{{5,7}}$", regex::escape(pattern))).map(Self)
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.0.is_match(name)
    }
}

/// A pod forward task.
pub struct Pod {
    spec: PodSpec,
    matcher: PodMatcher,
    cluster: Arc<dyn Cluster>,
    session: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    terminated: bool,
    token: Option<CancellationToken>,
}

impl Pod {
    pub fn new(spec: PodSpec, matcher: PodMatcher, cluster: Arc<dyn Cluster>) -> Self {
        Self {
            spec,
            matcher,
            cluster,
            session: Mutex::new(SessionState::default()),
        }
    }

    async fn find_pod(&self) -> Result<String, TaskError> {
        let namespace = &self.spec.namespace;
        let pods = self.cluster.list_pods(namespace).await?;
        if pods.is_empty() {
            return Err(TaskError::NoPods(namespace.clone()));
        }
        pods.into_iter()
            .find(|name| self.matcher.is_match(name))
            .ok_or_else(|| TaskError::NoMatch {
                pattern: self.spec.pattern.clone(),
                namespace: namespace.clone(),
            })
    }

    // Registers the session token; `None` if the task was terminated first.
    fn open_session(&self, cancel: &CancellationToken) -> Option<CancellationToken> {
        let mut state = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if state.terminated {
            return None;
        }
        let token = cancel.child_token();
        state.token = Some(token.clone());
        Some(token)
    }
}

#[async_trait]
impl Runnable for Pod {
    fn identity(&self) -> &str {
        &self.spec.id
    }

    async fn launch(&self, cancel: CancellationToken, sink: Sink) -> Result<(), TaskError> {
        let id = self.spec.id.as_str();
        let Some(found) = cancel.run_until_cancelled(self.find_pod()).await else {
            debug!(task = %id, "cancelled while looking up pod");
            return Ok(());
        };
        let pod = found.map_err(|err| {
            error!(task = %id, error = %err, "can't find pod");
            err
        })?;
        debug!(task = %id, pod = %pod, "pod found");

        let Some(stop) = self.open_session(&cancel) else {
            return Ok(());
        };

        let namespace = self.spec.namespace.as_str();
        let sessions = async {
            let logs = self
                .cluster
                .tail_logs(namespace, &pod, self.spec.container.as_deref())
                .await
                .map_err(|err| {
                    error!(task = %id, error = %err, "can't tail logs");
                    TaskError::Cluster(err)
                })?;
            let tunnel = self
                .cluster
                .port_forward(namespace, &pod, self.spec.local_port, self.spec.pod_port)
                .await
                .map_err(|err| {
                    error!(task = %id, error = %err, "can't forward port");
                    TaskError::Forward(err)
                })?;
            Ok::<_, TaskError>((logs, tunnel))
        };
        let Some(sessions) = stop.run_until_cancelled(sessions).await else {
            debug!(task = %id, "stopped while opening sessions");
            return Ok(());
        };
        let (logs, tunnel) = sessions?;
        debug!(
            task = %id,
            local = self.spec.local_port,
            remote = self.spec.pod_port,
            "port forward ready"
        );

        let logs = pump(logs, id, &sink, stop.clone());
        let tunnel = pump(tunnel, id, &sink, stop.clone());
        tokio::pin!(logs);
        tokio::pin!(tunnel);

        let mut logs_done = false;
        let mut tunnel_done = false;
        while !(logs_done && tunnel_done) {
            tokio::select! {
                res = &mut logs, if !logs_done => {
                    logs_done = true;
                    if let Err(err) = res {
                        warn!(task = %id, error = %err, "log stream ended");
                    }
                }
                res = &mut tunnel, if !tunnel_done => {
                    tunnel_done = true;
                    if let Err(err) = res {
                        error!(task = %id, error = %err, "port forward failed");
                        stop.cancel();
                        return Err(TaskError::Forward(err));
                    }
                }
            }
        }
        Ok(())
    }

    async fn terminate(&self, sink: &Sink) -> Result<(), TaskError> {
        debug!(task = %self.spec.id, "stopping");
        let _ = sink.send(Message::stopped(self.spec.id.as_str())).await;
        let mut state = self.session.lock().unwrap_or_else(|e| e.into_inner());
        state.terminated = true;
        if let Some(token) = state.token.take() {
            token.cancel();
        }
        Ok(())
    }
}

// Frames a session's output under `source` until it ends or `stop` fires.
async fn pump(
    session: Session,
    source: &str,
    sink: &Sink,
    stop: CancellationToken,
) -> Result<(), KubeError> {
    let Session {
        stdout,
        stderr,
        handle,
    } = session;
    let out = async {
        if let Some(reader) = stdout {
            frame(reader, source, Kind::Log, sink).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let err = async {
        if let Some(reader) = stderr {
            frame(reader, source, Kind::Error, sink).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let streams = async {
        let (out, err) = tokio::join!(out, err);
        out.and(err)
    };

    let (ended, streams) = tokio::join!(handle.wait(stop.clone()), async {
        tokio::select! {
            res = streams => res,
            _ = stop.cancelled() => Ok(()),
        }
    });
    if let Err(err) = streams {
        debug!(task = %source, error = %err, "stream read failed");
    }
    ended
}
