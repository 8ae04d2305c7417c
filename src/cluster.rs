//! Kubernetes collaborator.
//!
//! Pod tasks talk to the cluster through the [`Cluster`] trait: listing pods, tailing
//! container logs and opening port-forward tunnels. The default implementation lists
//! pods and follows logs through the Kubernetes API, and forwards ports with
//! `kubectl port-forward` under the same kubeconfig and context.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::KubeError;

/// A byte stream produced by a cluster session.
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// A long-running cluster stream: followed logs or a port-forward tunnel.
pub struct Session {
    pub stdout: Option<Reader>,
    pub stderr: Option<Reader>,
    pub handle: Box<dyn SessionHandle>,
}

/// Lifetime of a [`Session`].
#[async_trait]
pub trait SessionHandle: Send {
    /// Waits for the session to end on its own, or closes it once `stop` fires.
    async fn wait(self: Box<Self>, stop: CancellationToken) -> Result<(), KubeError>;
}

/// Operations pod tasks need from a cluster.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Names of the pods in `namespace`.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<String>, KubeError>;

    /// Follows the logs of `pod`, optionally restricted to one container.
    async fn tail_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> Result<Session, KubeError>;

    /// Forwards `local` on the loopback interface to `remote` on `pod`.
    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local: u16,
        remote: u16,
    ) -> Result<Session, KubeError>;
}

/// Where the cluster configuration comes from. Without an explicit kubeconfig,
/// `KUBECONFIG` and then `~/.kube/config` are used.
#[derive(Debug, Clone, Default)]
pub struct KubeSettings {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

/// [`Cluster`] backed by a Kubernetes API client.
pub struct KubeCluster {
    client: Client,
    settings: KubeSettings,
}

impl KubeCluster {
    /// Loads the kubeconfig, builds a client and checks that the API server answers.
    pub async fn connect(settings: &KubeSettings) -> Result<Self, KubeError> {
        let options = KubeConfigOptions {
            context: settings.context.clone(),
            ..KubeConfigOptions::default()
        };
        let config = match &settings.kubeconfig {
            Some(path) => {
                Config::from_custom_kubeconfig(Kubeconfig::read_from(path)?, &options).await?
            }
            None => Config::from_kubeconfig(&options).await?,
        };
        let client = Client::try_from(config)?;
        let version = client.apiserver_version().await?;
        debug!(
            server = %version.git_version,
            context = ?settings.context,
            "kubernetes client ready"
        );
        Ok(Self {
            client,
            settings: settings.clone(),
        })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<String>, KubeError> {
        let pods = self.pods(namespace).list(&ListParams::default()).await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn tail_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> Result<Session, KubeError> {
        let params = LogParams {
            follow: true,
            container: container.map(str::to_string),
            ..LogParams::default()
        };
        let stream = self.pods(namespace).log_stream(pod, &params).await?;
        Ok(Session {
            stdout: Some(Box::new(Box::pin(stream.compat()))),
            stderr: None,
            handle: Box::new(LogHandle),
        })
    }

    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local: u16,
        remote: u16,
    ) -> Result<Session, KubeError> {
        let action = "port-forward";
        let mut child = port_forward_command(&self.settings, namespace, pod, local, remote)
            .spawn()
            .map_err(|source| KubeError::Command { action, source })?;
        let stdout = child.stdout.take().map(|r| Box::new(r) as Reader);
        let stderr = child.stderr.take().map(|r| Box::new(r) as Reader);
        Ok(Session {
            stdout,
            stderr,
            handle: Box::new(ChildHandle { child, action }),
        })
    }
}

fn port_forward_command(
    settings: &KubeSettings,
    namespace: &str,
    pod: &str,
    local: u16,
    remote: u16,
) -> Command {
    let mut command = Command::new("kubectl");
    if let Some(kubeconfig) = &settings.kubeconfig {
        command.arg("--kubeconfig").arg(kubeconfig);
    }
    if let Some(context) = &settings.context {
        command.arg("--context").arg(context);
    }
    command
        .args(["port-forward", "-n", namespace])
        .arg(format!("pod/{}", pod))
        .arg(format!("{}:{}", local, remote))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

// The log stream has nothing to reap; it closes when its reader is dropped.
struct LogHandle;

#[async_trait]
impl SessionHandle for LogHandle {
    async fn wait(self: Box<Self>, stop: CancellationToken) -> Result<(), KubeError> {
        stop.cancelled().await;
        Ok(())
    }
}

struct ChildHandle {
    child: Child,
    action: &'static str,
}

#[async_trait]
impl SessionHandle for ChildHandle {
    async fn wait(self: Box<Self>, stop: CancellationToken) -> Result<(), KubeError> {
        let ChildHandle { mut child, action } = *self;
        let exited = tokio::select! {
            status = child.wait() => Some(status?),
            _ = stop.cancelled() => None,
        };
        match exited {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(KubeError::Exited { action, status }),
            None => {
                debug!(action, "closing kubectl session");
                child.kill().await?;
                Ok(())
            }
        }
    }
}

/// Lazily initialised cluster client, shared by every pod task of a run.
pub struct Kube {
    settings: KubeSettings,
    cell: OnceCell<Arc<dyn Cluster>>,
}

impl Kube {
    pub fn new(settings: KubeSettings) -> Self {
        Self {
            settings,
            cell: OnceCell::new(),
        }
    }

    /// Uses `cluster` instead of connecting.
    #[cfg(test)]
    pub fn with_cluster(cluster: Arc<dyn Cluster>) -> Self {
        Self {
            settings: KubeSettings::default(),
            cell: OnceCell::new_with(Some(cluster)),
        }
    }

    /// Returns the client, connecting on first use. A failed connection is retried
    /// on the next call.
    pub async fn client(&self) -> Result<Arc<dyn Cluster>, KubeError> {
        self.cell
            .get_or_try_init(|| async {
                let cluster = KubeCluster::connect(&self.settings).await?;
                Ok::<_, KubeError>(Arc::new(cluster) as Arc<dyn Cluster>)
            })
            .await
            .cloned()
    }
}
