//! File watching for executable restarts.
//!
//! A [`Watch`] observes an executable's configured paths and folds write events into
//! change notifications. At most one notification is ever pending: further changes
//! arriving before the task consumes it are coalesced into it.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::event::ModifyKind;
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::error::TaskError;
use crate::process::ExecSpec;

/// Change notifications for one executable.
pub struct Watch {
    _watcher: Option<RecommendedWatcher>,
    /// One pending item per coalesced burst of writes.
    pub changes: mpsc::Receiver<()>,
    /// Errors from the watch subsystem; any error is fatal to the task.
    pub errors: mpsc::Receiver<TaskError>,
}

impl Watch {
    /// Starts watching `spec.watch_paths`. With no paths, both channels are closed.
    pub fn start(spec: &ExecSpec) -> Result<Self, TaskError> {
        let (changes_tx, changes) = mpsc::channel(1);
        let (errors_tx, errors) = mpsc::channel(1);
        if spec.watch_paths.is_empty() {
            return Ok(Self {
                _watcher: None,
                changes,
                errors,
            });
        }

        let base = match &spec.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()
                .map_err(|err| TaskError::Watch(format!("failed to resolve current dir: {}", err)))?,
        };
        let watch_paths = resolve_watch_paths(&base, &spec.watch_paths);
        let matcher = IgnoreMatcher::new(&base, &spec.watch_ignore, spec.watch_gitignore)?;

        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|err| TaskError::Watch(format!("failed to create watcher: {}", err)))?;

        for path in &watch_paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|err| TaskError::Watch(format!("failed to watch {}: {}", path.display(), err)))?;
        }

        let id = spec.id.clone();
        let debounce = spec.debounce;
        std::thread::spawn(move || {
            coalesce(&raw_rx, &matcher, debounce, &changes_tx, &errors_tx);
            debug!(task = %id, "watcher closed");
        });

        Ok(Self {
            _watcher: Some(watcher),
            changes,
            errors,
        })
    }
}

enum Relevance {
    Change,
    Ignored,
    Failed(notify::Error),
}

fn coalesce(
    raw_rx: &Receiver<notify::Result<NotifyEvent>>,
    matcher: &IgnoreMatcher,
    debounce: Duration,
    changes: &mpsc::Sender<()>,
    errors: &mpsc::Sender<TaskError>,
) {
    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => return,
        };
        match classify(event, matcher) {
            Relevance::Change => {}
            Relevance::Ignored => continue,
            Relevance::Failed(err) => {
                let _ = errors.try_send(TaskError::Watch(err.to_string()));
                return;
            }
        }

        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= debounce {
                break;
            }
            match raw_rx.recv_timeout(debounce - elapsed) {
                Ok(res) => match classify(res, matcher) {
                    Relevance::Change => last = Instant::now(),
                    Relevance::Ignored => {}
                    Relevance::Failed(err) => {
                        let _ = errors.try_send(TaskError::Watch(err.to_string()));
                        return;
                    }
                },
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        match changes.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => return,
        }
    }
}

fn classify(event: notify::Result<NotifyEvent>, matcher: &IgnoreMatcher) -> Relevance {
    let event = match event {
        Ok(event) => event,
        Err(err) => return Relevance::Failed(err),
    };
    if !is_write(&event.kind) {
        return Relevance::Ignored;
    }
    if event.paths.is_empty() || event.paths.iter().any(|path| !matcher.is_ignored(path)) {
        Relevance::Change
    } else {
        Relevance::Ignored
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Other)
    )
}

fn resolve_watch_paths(base: &Path, paths: &[String]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|path| {
            let path_buf = PathBuf::from(path);
            if path_buf.is_absolute() {
                path_buf
            } else {
                base.join(path_buf)
            }
        })
        .collect()
}

struct IgnoreMatcher {
    // Combines explicit ignore globs with optional gitignore rules.
    base: PathBuf,
    globset: Option<GlobSet>,
    gitignore: Option<Gitignore>,
}

impl IgnoreMatcher {
    fn new(base: &Path, patterns: &[String], use_gitignore: bool) -> Result<Self, TaskError> {
        let globset = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                for expanded in expand_pattern(pattern) {
                    builder.add(Glob::new(&expanded).map_err(|err| invalid_rule(err))?);
                }
            }
            Some(builder.build().map_err(|err| invalid_rule(err))?)
        };

        let gitignore = if use_gitignore {
            Some(build_gitignore(base).map_err(|err| invalid_rule(err))?)
        } else {
            None
        };

        Ok(Self {
            base: base.to_path_buf(),
            globset,
            gitignore,
        })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if let Some(globset) = &self.globset {
            if globset.is_match(path) {
                return true;
            }
            if let Ok(relative) = path.strip_prefix(&self.base) {
                if globset.is_match(relative) {
                    return true;
                }
            }
        }
        if let Some(gitignore) = &self.gitignore {
            if path.starts_with(&self.base) {
                let is_dir = path.is_dir();
                if gitignore.matched(path, is_dir).is_ignore() {
                    return true;
                }
            }
        }
        false
    }
}

fn invalid_rule(err: impl std::fmt::Display) -> TaskError {
    TaskError::Watch(format!("invalid ignore rule: {}", err))
}

fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim_end_matches('/');
    let has_glob = pattern.contains('*') || pattern.contains('?') || pattern.contains('[');
    if has_glob {
        vec![pattern.to_string()]
    } else {
        vec![trimmed.to_string(), format!("{}/**", trimmed)]
    }
}

fn build_gitignore(base: &Path) -> Result<Gitignore, ignore::Error> {
    let mut builder = GitignoreBuilder::new(base);
    for ancestor in base.ancestors() {
        let path = ancestor.join(".gitignore");
        if path.exists() {
            builder.add(path);
        }
        let exclude = ancestor.join(".git").join("info").join("exclude");
        if exclude.exists() {
            builder.add(exclude);
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, AccessMode, CreateKind, DataChange, MetadataKind};
    use std::io::Write;

    fn exec_spec(raw: &str) -> ExecSpec {
        ExecSpec::from_config(toml::from_str(raw).unwrap()).unwrap()
    }

    #[test]
    fn resolve_watch_paths_handles_absolute_and_relative() {
        let base = Path::new("/tmp/convoy-tests");
        let paths = vec!["src".to_string(), "/var/log".to_string()];
        let resolved = resolve_watch_paths(base, &paths);
        assert_eq!(resolved[0], base.join("src"));
        assert_eq!(resolved[1], PathBuf::from("/var/log"));
    }

    #[test]
    fn expand_pattern_adds_recursive_glob_for_dirs() {
        assert_eq!(expand_pattern("src/"), vec!["src".to_string(), "src/**".to_string()]);
        assert_eq!(expand_pattern("*.rs"), vec!["*.rs".to_string()]);
    }

    #[test]
    fn only_writes_count() {
        assert!(is_write(&EventKind::Modify(ModifyKind::Data(DataChange::Any))));
        assert!(is_write(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_write(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))));
        assert!(!is_write(&EventKind::Create(CreateKind::File)));
        assert!(!is_write(&EventKind::Access(AccessKind::Close(AccessMode::Write))));
    }

    #[test]
    fn ignored_paths_are_not_changes() {
        let base = Path::new("/tmp/convoy-tests");
        let matcher = IgnoreMatcher::new(base, &["target".to_string()], false).unwrap();
        let write = |path: PathBuf| {
            Ok(NotifyEvent::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path))
        };
        assert!(matches!(classify(write(base.join("target/debug/app")), &matcher), Relevance::Ignored));
        assert!(matches!(classify(write(base.join("src/main.rs")), &matcher), Relevance::Change));
        assert!(matches!(
            classify(Err(notify::Error::generic("boom")), &matcher),
            Relevance::Failed(_)
        ));
    }

    #[test]
    fn missing_path_fails_to_start() {
        let spec = exec_spec(
            r#"
id = "api"
cmd = "true"
watch = ["/definitely/not/here/convoy"]
"#,
        );
        assert!(matches!(Watch::start(&spec), Err(TaskError::Watch(_))));
    }

    #[tokio::test]
    async fn no_paths_means_closed_channels() {
        let spec = exec_spec("id = \"api\"\ncmd = \"true\"\n");
        let mut watch = Watch::start(&spec).unwrap();
        assert_eq!(watch.changes.recv().await, None);
        assert!(watch.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn bursts_coalesce_into_one_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.txt");
        std::fs::write(&file, "seed").unwrap();
        let spec = exec_spec(&format!(
            "id = \"api\"\ncmd = \"true\"\nwatch = [{:?}]\nwatch_gitignore = false\n",
            file.display().to_string()
        ));
        let mut watch = Watch::start(&spec).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        for _ in 0..5 {
            let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            handle.write_all(b"more").unwrap();
        }

        let change = tokio::time::timeout(Duration::from_secs(5), watch.changes.recv()).await;
        assert_eq!(change.unwrap(), Some(()));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(watch.changes.try_recv().is_err());
    }
}
