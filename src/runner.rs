//! Executable task: a command run in its own process group and relaunched whenever
//! one of its watched paths is written.
//!
//! Each launch of the command is a *generation*. A generation owns the process group,
//! the stdout/stderr copy tasks and the exit waiter; restarting kills the whole group
//! and drains its output before the next generation is spawned, so output from two
//! generations never interleaves.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StdErrPolicy;
use crate::error::TaskError;
use crate::frame::frame;
use crate::memory;
use crate::message::{Kind, Message, Sink};
use crate::process::{ExecSpec, State};
use crate::runnable::Runnable;
use crate::watch::Watch;

/// How long a killed generation gets to flush its remaining output.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A watched executable.
pub struct Executable {
    spec: ExecSpec,
    life: Mutex<Lifecycle>,
    stopped: CancellationToken,
}

struct Lifecycle {
    state: State,
    current: Option<Generation>,
}

struct Generation {
    pid: Option<u32>,
    exit: JoinHandle<()>,
    io: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Executable {
    pub fn new(spec: ExecSpec) -> Self {
        Self {
            spec,
            life: Mutex::new(Lifecycle {
                state: State::Idle,
                current: None,
            }),
            stopped: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    async fn state(&self) -> State {
        self.life.lock().await.state
    }

    /// Process group id of the live generation.
    #[cfg(test)]
    async fn pid(&self) -> Option<u32> {
        self.life
            .lock()
            .await
            .current
            .as_ref()
            .and_then(|generation| generation.pid)
    }

    fn spawn(&self, life: &mut Lifecycle, sink: &Sink) -> Result<(), TaskError> {
        life.state = State::Starting;
        let id = self.spec.id.as_str();
        debug!(task = %id, cmd = %self.spec.command_line(), "starting");

        let mut command = Command::new(&self.spec.cmd);
        command.args(&self.spec.args);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }
        if !self.spec.env.is_empty() {
            command.envs(&self.spec.env);
        }
        let stderr = match self.spec.stderr {
            StdErrPolicy::Ignore => Stdio::null(),
            StdErrPolicy::Log | StdErrPolicy::Error => Stdio::piped(),
        };
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(stderr);

        // New process group, so every descendant can be killed together.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| {
            error!(task = %id, error = %source, "can't start");
            TaskError::Spawn {
                cmd: self.spec.command_line(),
                source,
            }
        })?;
        let pid = child.id();

        let mut io = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            io.push(spawn_copy(stdout, id, Kind::Log, sink));
        }
        if let Some(stderr) = child.stderr.take() {
            let kind = match self.spec.stderr {
                StdErrPolicy::Error => Kind::Error,
                _ => Kind::Log,
            };
            io.push(spawn_copy(stderr, id, kind, sink));
        }

        let waiter_id = id.to_string();
        let exit = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(task = %waiter_id, "process exited"),
                Ok(status) => warn!(task = %waiter_id, %status, "process exited"),
                Err(err) => warn!(task = %waiter_id, error = %err, "failed to wait on process"),
            }
        });

        let monitor = match pid {
            Some(pid) if self.spec.monitor_memory => {
                Some(tokio::spawn(memory::monitor(pid, id.to_string(), sink.clone())))
            }
            _ => None,
        };

        life.current = Some(Generation {
            pid,
            exit,
            io,
            monitor,
        });
        life.state = State::Running;
        Ok(())
    }

    // Kills the generation's process group, reaps it and drains its output.
    async fn kill(&self, generation: Generation) -> Result<(), TaskError> {
        let Generation {
            pid,
            mut exit,
            io,
            monitor,
        } = generation;
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(pgid) = pid {
            kill_group(pgid).map_err(|source| TaskError::Signal { pgid, source })?;
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut exit).await.is_err() {
            warn!(task = %self.spec.id, "process did not exit after kill");
            exit.abort();
        }
        for mut handle in io {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
                debug!(task = %self.spec.id, "output still open after kill");
                handle.abort();
            }
        }
        Ok(())
    }

    async fn restart(&self, sink: &Sink) -> Result<(), TaskError> {
        let mut life = self.life.lock().await;
        if life.state.is_final() {
            return Ok(());
        }
        life.state = State::Restarting;
        if let Some(generation) = life.current.take() {
            if let Err(err) = self.kill(generation).await {
                error!(task = %self.spec.id, error = %err, "can't kill");
            }
        }
        let _ = sink.send(Message::restarting(self.spec.id.as_str())).await;
        self.spawn(&mut life, sink)
    }

    // Releases the live generation when the run is cancelled.
    async fn release(&self) {
        let mut life = self.life.lock().await;
        if let Some(generation) = life.current.take() {
            if let Err(err) = self.kill(generation).await {
                error!(task = %self.spec.id, error = %err, "can't kill");
            }
        }
        life.state = State::Stopped;
    }
}

#[async_trait]
impl Runnable for Executable {
    fn identity(&self) -> &str {
        &self.spec.id
    }

    async fn launch(&self, cancel: CancellationToken, sink: Sink) -> Result<(), TaskError> {
        let id = self.spec.id.as_str();
        if let Some(delay) = self.spec.delay {
            debug!(task = %id, ?delay, "delaying start");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(()),
                _ = self.stopped.cancelled() => return Ok(()),
            }
        }

        debug!(task = %id, paths = ?self.spec.watch_paths, "creating watcher");
        let mut watch = Watch::start(&self.spec).map_err(|err| {
            error!(task = %id, error = %err, "watcher error");
            err
        })?;

        {
            let mut life = self.life.lock().await;
            if life.state.is_final() {
                return Ok(());
            }
            self.spawn(&mut life, &sink)?;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.release().await;
                    return Ok(());
                }
                _ = self.stopped.cancelled() => return Ok(()),
                Some(()) = watch.changes.recv() => {
                    debug!(task = %id, "watcher caused restart");
                    self.restart(&sink).await?;
                }
                Some(err) = watch.errors.recv() => {
                    error!(task = %id, error = %err, "watcher error");
                    return Err(err);
                }
            }
        }
    }

    async fn terminate(&self, sink: &Sink) -> Result<(), TaskError> {
        debug!(task = %self.spec.id, "stopping");
        let mut life = self.life.lock().await;
        life.state = State::Stopping;
        self.stopped.cancel();
        let _ = sink.send(Message::stopped(self.spec.id.as_str())).await;
        let result = match life.current.take() {
            Some(generation) => self.kill(generation).await,
            None => Ok(()),
        };
        life.state = State::Stopped;
        if let Err(err) = &result {
            error!(task = %self.spec.id, error = %err, "failed to kill process");
        }
        result
    }
}

fn spawn_copy<R>(reader: R, id: &str, kind: Kind, sink: &Sink) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let id = id.to_string();
    let sink = sink.clone();
    tokio::spawn(async move {
        if let Err(err) = frame(reader, &id, kind, &sink).await {
            debug!(task = %id, error = %err, "output stream failed");
        }
    })
}

/// Sends SIGKILL to the whole process group. A group that is already gone is not an error.
#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    let pgid = pgid as libc::pid_t;
    if pgid <= 0 {
        return Ok(());
    }
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    ))
}
