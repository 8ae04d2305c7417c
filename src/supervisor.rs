//! Supervision of one run.
//!
//! The [`Supervisor`] resolves a [`Selection`] into tasks, launches each of them on its
//! own tokio task and fans their messages into a single consumer that renders them to
//! the output and republishes them on a broadcast tap. [`Supervisor::stop`] terminates
//! every task, best effort, and reports every failure at once.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cluster::Kube;
use crate::config::Catalog;
use crate::error::{RunError, TaskError};
use crate::merge::merge;
use crate::message::{bus, Message, Sink};
use crate::output::{Formatter, Output};
use crate::pod::{Pod, PodMatcher};
use crate::runner::Executable;
use crate::runnable::TaskRef;
use crate::style::Styles;

/// Messages buffered for each tap subscriber before it starts lagging.
const TAP_CAPACITY: usize = 256;

/// How long `stop` waits for launches and the consumer to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Executable and pod identities chosen for a run, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    executables: Vec<String>,
    pods: Vec<String>,
}

impl Selection {
    pub fn add_exec(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.executables.contains(&key) {
            self.executables.push(key);
        }
    }

    pub fn add_pod(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.pods.contains(&key) {
            self.pods.push(key);
        }
    }

    /// Adds every executable and pod of the flow `key`.
    pub fn add_flow(&mut self, catalog: &Catalog, key: &str) -> Result<(), RunError> {
        let flow = catalog
            .flow(key)
            .ok_or_else(|| RunError::UnknownIdentity(key.to_string()))?;
        for exec in &flow.executables {
            self.add_exec(exec.as_str());
        }
        for pod in &flow.pods {
            self.add_pod(pod.as_str());
        }
        Ok(())
    }

    pub fn executables(&self) -> &[String] {
        &self.executables
    }

    pub fn pods(&self) -> &[String] {
        &self.pods
    }

    pub fn is_empty(&self) -> bool {
        self.executables.is_empty() && self.pods.is_empty()
    }
}

/// Owns the tasks of one run.
pub struct Supervisor {
    catalog: Arc<Catalog>,
    kube: Arc<Kube>,
    writer: Option<Box<dyn Write + Send>>,
    color: bool,
    tap: broadcast::Sender<Message>,
    tasks: Vec<(TaskRef, Sink)>,
    launches: JoinSet<(String, Result<(), TaskError>)>,
    names: HashMap<tokio::task::Id, String>,
    consumer: Option<JoinHandle<()>>,
    run_token: CancellationToken,
}

impl Supervisor {
    pub fn new(
        catalog: Arc<Catalog>,
        kube: Arc<Kube>,
        writer: Box<dyn Write + Send>,
        color: bool,
    ) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            catalog,
            kube,
            writer: Some(writer),
            color,
            tap,
            tasks: Vec::new(),
            launches: JoinSet::new(),
            names: HashMap::new(),
            consumer: None,
            run_token: CancellationToken::new(),
        }
    }

    /// Observes every message the run produces, after it has been written out.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tap.subscribe()
    }

    /// Resolves `selection` and runs its tasks until `cancel` fires, every task
    /// finishes, or one of them fails.
    ///
    /// Nothing is started when an identity can't be resolved. On a task failure the
    /// remaining tasks keep running; call [`Supervisor::stop`] to end them.
    pub async fn run(
        &mut self,
        selection: &Selection,
        cancel: CancellationToken,
    ) -> Result<(), RunError> {
        let tasks = self.resolve(selection).await?;
        self.run_tasks(tasks, cancel).await
    }

    async fn resolve(&self, selection: &Selection) -> Result<Vec<TaskRef>, RunError> {
        let mut executables = Vec::new();
        for key in selection.executables() {
            let spec = self
                .catalog
                .exec(key)
                .ok_or_else(|| RunError::UnknownIdentity(key.clone()))?;
            executables.push(spec.clone());
        }
        let mut pods = Vec::new();
        for key in selection.pods() {
            let spec = self
                .catalog
                .pod(key)
                .ok_or_else(|| RunError::UnknownIdentity(key.clone()))?;
            let matcher = PodMatcher::new(&spec.pattern).map_err(|source| RunError::Pattern {
                id: spec.id.clone(),
                source,
            })?;
            pods.push((spec.clone(), matcher));
        }

        let mut seen = HashSet::new();
        let mut tasks: Vec<TaskRef> = Vec::new();
        for spec in executables {
            if seen.insert(spec.id.clone()) {
                tasks.push(Arc::new(Executable::new(spec)));
            }
        }
        if !pods.is_empty() {
            let cluster = self.kube.client().await.map_err(RunError::Cluster)?;
            for (spec, matcher) in pods {
                if seen.insert(spec.id.clone()) {
                    tasks.push(Arc::new(Pod::new(spec, matcher, cluster.clone())));
                }
            }
        }
        Ok(tasks)
    }

    pub(crate) async fn run_tasks(
        &mut self,
        tasks: Vec<TaskRef>,
        cancel: CancellationToken,
    ) -> Result<(), RunError> {
        let writer = self.writer.take().ok_or(RunError::AlreadyStarted)?;
        let styles = Styles::assign(tasks.iter().map(|task| task.identity()));
        let mut output = Output::new(writer, Formatter::new(styles, self.color));

        let mut inputs = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (sink, rx) = bus();
            inputs.push(rx);
            self.tasks.push((task, sink));
        }
        let mut merged = merge(inputs);
        let tap = self.tap.clone();
        self.consumer = Some(tokio::spawn(async move {
            while let Some(message) = merged.recv().await {
                if let Err(err) = output.write_message(&message) {
                    warn!(error = %err, "failed to write output");
                }
                let _ = tap.send(message);
            }
            debug!("output closed");
        }));

        self.run_token = cancel.child_token();
        for (task, sink) in &self.tasks {
            let id = task.identity().to_string();
            let task = task.clone();
            let sink = sink.clone();
            let token = self.run_token.clone();
            debug!(task = %id, "launching");
            let launch_id = id.clone();
            let handle = self.launches.spawn(async move {
                let result = task.launch(token, sink).await;
                (launch_id, result)
            });
            self.names.insert(handle.id(), id);
        }

        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                joined = self.launches.join_next() => joined,
            };
            match joined {
                None => return Ok(()),
                Some(Ok((id, Ok(())))) => debug!(task = %id, "task finished"),
                Some(Ok((id, Err(source)))) => return Err(RunError::Task { id, source }),
                Some(Err(err)) => {
                    let id = self
                        .names
                        .get(&err.id())
                        .cloned()
                        .unwrap_or_else(|| "task".to_string());
                    if err.is_panic() {
                        return Err(RunError::Panicked(id));
                    }
                    debug!(task = %id, "task cancelled");
                }
            }
        }
    }

    /// Terminates every task and waits for the output to drain.
    ///
    /// Termination continues past individual failures; all of them are reported in one
    /// [`RunError::Shutdown`].
    pub async fn stop(&mut self) -> Result<(), RunError> {
        let mut failed = Vec::new();
        for (task, sink) in &self.tasks {
            if let Err(err) = task.terminate(sink).await {
                error!(task = %task.identity(), error = %err, "can't stop");
                failed.push(format!("{}: {}", task.identity(), err));
            }
        }

        self.run_token.cancel();
        let launches = &mut self.launches;
        let drained = tokio::time::timeout(STOP_TIMEOUT, async {
            while launches.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("tasks did not finish in time");
            self.launches.shutdown().await;
        }

        // Dropping the sinks lets the merged bus close once the last producer is gone.
        self.tasks.clear();
        if let Some(mut consumer) = self.consumer.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut consumer).await.is_err() {
                warn!("output did not drain in time");
                consumer.abort();
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RunError::Shutdown(failed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::KubeSettings;
    use crate::message::Kind;
    use crate::output::tests::Shared;
    use crate::runnable::Runnable;
    use async_trait::async_trait;

    /// Emits its lines, then idles until cancelled.
    struct Chatty {
        id: String,
        lines: Vec<String>,
        fail_launch: bool,
        fail_terminate: bool,
    }

    impl Chatty {
        fn new(id: &str, lines: &[&str]) -> Self {
            Self {
                id: id.to_string(),
                lines: lines.iter().map(|l| l.to_string()).collect(),
                fail_launch: false,
                fail_terminate: false,
            }
        }
    }

    #[async_trait]
    impl Runnable for Chatty {
        fn identity(&self) -> &str {
            &self.id
        }

        async fn launch(&self, cancel: CancellationToken, sink: Sink) -> Result<(), TaskError> {
            for line in &self.lines {
                let _ = sink.send(Message::new(self.id.as_str(), Kind::Log, line.as_str())).await;
            }
            if self.fail_launch {
                return Err(TaskError::NoPods("dev".into()));
            }
            cancel.cancelled().await;
            Ok(())
        }

        async fn terminate(&self, sink: &Sink) -> Result<(), TaskError> {
            let _ = sink.send(Message::stopped(self.id.as_str())).await;
            if self.fail_terminate {
                return Err(TaskError::Watch("stuck".into()));
            }
            Ok(())
        }
    }

    fn catalog(raw: &str) -> Arc<Catalog> {
        let config: Config = toml::from_str(raw).unwrap();
        Arc::new(Catalog::from_config(config).unwrap())
    }

    fn supervisor(catalog: Arc<Catalog>, kube: Kube) -> (Supervisor, Shared) {
        let buffer = Shared::default();
        let supervisor = Supervisor::new(catalog, Arc::new(kube), Box::new(buffer.clone()), false);
        (supervisor, buffer)
    }

    fn no_cluster() -> Kube {
        Kube::new(KubeSettings {
            kubeconfig: Some("/definitely/not/here/kubeconfig".into()),
            context: None,
        })
    }

    const CATALOG: &str = r#"
[[exec]]
id = "api"
shortcut = "a"
cmd = "echo api-ready"

[[exec]]
id = "worker"
cmd = "echo worker-ready"

[[pod]]
id = "db"
namespace = "dev"
name = "postgres"
local_port = 15432
pod_port = 5432

[[flow]]
id = "all"
exec = ["api", "worker", "api"]
pod = ["db"]
"#;

    #[test]
    fn flows_expand_without_duplicates() {
        let catalog = catalog(CATALOG);
        let mut selection = Selection::default();
        selection.add_exec("api");
        selection.add_flow(&catalog, "all").unwrap();
        assert_eq!(selection.executables(), ["api", "worker"]);
        assert_eq!(selection.pods(), ["db"]);

        let err = selection.add_flow(&catalog, "nope").unwrap_err();
        assert!(matches!(err, RunError::UnknownIdentity(id) if id == "nope"));
    }

    #[tokio::test]
    async fn unknown_identity_fails_before_anything_starts() {
        let (mut supervisor, buffer) = supervisor(catalog(CATALOG), no_cluster());
        let mut selection = Selection::default();
        selection.add_exec("api");
        selection.add_exec("ghost");

        let err = supervisor
            .run(&selection, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownIdentity(id) if id == "ghost"));
        supervisor.stop().await.unwrap();
        assert!(buffer.lines().is_empty());
    }

    #[tokio::test]
    async fn unknown_pod_skips_cluster_connection() {
        let (mut supervisor, _) = supervisor(catalog(CATALOG), no_cluster());
        let mut selection = Selection::default();
        selection.add_pod("ghost");
        let err = supervisor
            .run(&selection, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownIdentity(_)));
    }

    #[tokio::test]
    async fn cluster_failure_is_reported() {
        let (mut supervisor, _) = supervisor(catalog(CATALOG), no_cluster());
        let mut selection = Selection::default();
        selection.add_pod("db");
        let err = supervisor
            .run(&selection, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Cluster(_)));
    }

    #[tokio::test]
    async fn renders_every_task_and_stops_all() {
        let (mut supervisor, buffer) = supervisor(catalog(""), no_cluster());
        let mut tap = supervisor.subscribe();
        let tasks: Vec<TaskRef> = vec![
            Arc::new(Chatty::new("api", &["one", "two"])),
            Arc::new(Chatty::new("db-forward", &["ready"])),
        ];
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            async move {
                let result = supervisor.run_tasks(tasks, cancel).await;
                (supervisor, result)
            }
        };
        let canceller = async {
            let mut seen = 0;
            while seen < 3 {
                tap.recv().await.unwrap();
                seen += 1;
            }
            cancel.cancel();
        };
        let ((mut supervisor, result), ()) = tokio::join!(run, canceller);
        assert!(result.is_ok());
        supervisor.stop().await.unwrap();

        let mut lines = buffer.lines();
        lines.sort();
        assert_eq!(
            lines,
            vec![
                "api        > one",
                "api        > two",
                "api        ■ stopping",
                "db-forward > ready",
                "db-forward ■ stopping",
            ]
        );
    }

    #[tokio::test]
    async fn first_task_failure_ends_the_run() {
        let (mut supervisor, _) = supervisor(catalog(""), no_cluster());
        let mut broken = Chatty::new("broken", &[]);
        broken.fail_launch = true;
        let healthy = Arc::new(Chatty::new("healthy", &[]));
        let tasks: Vec<TaskRef> = vec![healthy, Arc::new(broken)];

        let err = supervisor
            .run_tasks(tasks, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, RunError::Task { id, .. } if id == "broken"));
        assert_eq!(
            err.to_string(),
            "broken received an unrecoverable error: no pod found in namespace dev"
        );
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_terminates_every_task_despite_failures() {
        let (mut supervisor, buffer) = supervisor(catalog(""), no_cluster());
        let mut first = Chatty::new("first", &[]);
        first.fail_terminate = true;
        let mut third = Chatty::new("third", &[]);
        third.fail_terminate = true;
        let tasks: Vec<TaskRef> = vec![
            Arc::new(first),
            Arc::new(Chatty::new("second", &[])),
            Arc::new(third),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();
        supervisor.run_tasks(tasks, cancel).await.unwrap();

        let err = supervisor.stop().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't stop properly: first: watcher failed: stuck, third: watcher failed: stuck"
        );
        assert!(matches!(&err, RunError::Shutdown(failures) if failures.len() == 2));
        let stopped = buffer
            .lines()
            .into_iter()
            .filter(|line| line.contains("■ stopping"))
            .count();
        assert_eq!(stopped, 3);
    }

    #[tokio::test]
    async fn runs_only_once() {
        let (mut supervisor, _) = supervisor(catalog(""), no_cluster());
        let cancel = CancellationToken::new();
        cancel.cancel();
        supervisor.run_tasks(Vec::new(), cancel.clone()).await.unwrap();
        let err = supervisor.run_tasks(Vec::new(), cancel).await.unwrap_err();
        assert!(matches!(err, RunError::AlreadyStarted));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_configured_executables_by_shortcut() {
        let (mut supervisor, buffer) = supervisor(catalog(CATALOG), no_cluster());
        let mut tap = supervisor.subscribe();
        let mut selection = Selection::default();
        selection.add_exec("a");
        selection.add_exec("api");
        selection.add_exec("worker");

        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            async move {
                let result = supervisor.run(&selection, cancel).await;
                (supervisor, result)
            }
        };
        let canceller = async {
            for _ in 0..2 {
                tap.recv().await.unwrap();
            }
            cancel.cancel();
        };
        let ((mut supervisor, result), ()) = tokio::join!(run, canceller);
        assert!(result.is_ok());
        supervisor.stop().await.unwrap();

        let lines = buffer.lines();
        assert!(lines.contains(&"api    > api-ready".to_string()));
        assert!(lines.contains(&"worker > worker-ready".to_string()));
        assert_eq!(lines.iter().filter(|l| l.starts_with("api ")).count(), 2);
    }

    #[tokio::test]
    async fn pods_use_the_shared_cluster() {
        let cluster = Arc::new(FakeCluster {
            pods: vec!["postgres-7d9c6b5f4-abcde".into()],
            logs: "database system is ready\n".into(),
            ..Default::default()
        });
        let (mut supervisor, buffer) =
            supervisor(catalog(CATALOG), Kube::with_cluster(cluster.clone()));
        let mut tap = supervisor.subscribe();
        let mut selection = Selection::default();
        selection.add_pod("db");

        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            async move {
                let result = supervisor.run(&selection, cancel).await;
                (supervisor, result)
            }
        };
        let canceller = async {
            let message = tap.recv().await.unwrap();
            assert_eq!(message.source, "db");
            cancel.cancel();
        };
        let ((mut supervisor, result), ()) = tokio::join!(run, canceller);
        assert!(result.is_ok());
        supervisor.stop().await.unwrap();

        assert_eq!(cluster.closed(), 2);
        assert_eq!(
            buffer.lines(),
            vec!["db > database system is ready", "db ■ stopping"]
        );
    }
}
