//! Polls a pass directory and reports each pass once it gains a `.complete`
//! sentinel.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::passes::SENTINEL;
use crate::Result;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

pub struct PassWatcher {
    watch_dir: PathBuf,
    check_interval: Duration,
    known: HashSet<String>,
}

impl PassWatcher {
    pub fn new(watch_dir: impl Into<PathBuf>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            known: HashSet::new(),
        }
    }

    pub fn with_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Passes that completed since the last scan, by id.
    pub fn scan(&mut self) -> Result<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        if !self.watch_dir.is_dir() {
            return Ok(found);
        }
        for entry in fs::read_dir(&self.watch_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if self.known.contains(&id) || !path.join(SENTINEL).exists() {
                continue;
            }
            info!(pass_id = %id, "found completed pass");
            self.known.insert(id.clone());
            found.push((id, path));
        }
        found.sort();
        Ok(found)
    }

    /// Runs the poll loop on the current tokio runtime. Scan and callback
    /// errors are logged and the loop keeps going.
    pub fn spawn<F>(mut self, on_pass_complete: F) -> WatcherHandle
    where
        F: Fn(&str, &Path) -> Result<()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        info!(dir = %self.watch_dir.display(), "started watching");
        let task = tokio::spawn(async move {
            loop {
                match self.scan() {
                    Ok(passes) => {
                        for (id, dir) in passes {
                            if let Err(e) = on_pass_complete(&id, &dir) {
                                error!(pass_id = %id, error = %e, "error in on_pass_complete callback");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "error in watch loop"),
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(self.check_interval) => {}
                }
            }
            info!("stopped watching");
        });
        WatcherHandle { stop_tx, task }
    }
}

pub struct WatcherHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "watcher task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn reports_each_completed_pass_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a").join(SENTINEL), "{}").unwrap();

        let mut watcher = PassWatcher::new(dir.path());
        let first = watcher.scan().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, "a");
        assert!(watcher.scan().unwrap().is_empty());

        fs::write(dir.path().join("b").join(SENTINEL), "{}").unwrap();
        let second = watcher.scan().unwrap();
        assert_eq!(second.iter().map(|p| p.0.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn missing_directory_is_empty() {
        let mut watcher = PassWatcher::new("/nonexistent/passes/dir");
        assert!(watcher.scan().unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_watcher_calls_back_and_survives_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("p1")).unwrap();
        fs::write(dir.path().join("p1").join(SENTINEL), "{}").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = PassWatcher::new(dir.path())
            .with_interval(Duration::from_millis(10))
            .spawn(move |id, _| {
                sink.lock().unwrap().push(id.to_string());
                Err(crate::Error::NotFound("callback failure".to_string()))
            });

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::create_dir_all(dir.path().join("p2")).unwrap();
        fs::write(dir.path().join("p2").join(SENTINEL), "{}").unwrap();
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec!["p1".to_string(), "p2".to_string()]);
    }
}
