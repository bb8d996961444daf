//! Background shader directory watcher.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

/// Files that changed since the previous event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadEvent {
    pub paths: Vec<PathBuf>,
}

enum WatchControl {
    Shutdown,
}

type Snapshot = BTreeMap<PathBuf, SystemTime>;

/// Polls a directory tree for modified files on a worker thread.
///
/// At most one [`ReloadEvent`] is produced per poll interval, covering every
/// file added or modified during it. Deleted files are not reported.
pub struct ShaderWatcher {
    control_tx: Sender<WatchControl>,
    event_rx: Receiver<ReloadEvent>,
    thread: Option<JoinHandle<()>>,
}

impl ShaderWatcher {
    /// Start watching `dir`. Files present now are the baseline and are not
    /// reported.
    pub fn spawn(dir: impl Into<PathBuf>, poll_interval: Duration) -> io::Result<Self> {
        let dir = dir.into();
        let baseline = scan(&dir);
        let (control_tx, control_rx) = channel::bounded::<WatchControl>(1);
        let (event_tx, event_rx) = channel::bounded::<ReloadEvent>(16);

        tracing::info!(
            dir = %dir.display(),
            files = baseline.len(),
            interval = ?poll_interval,
            "Watching shader directory"
        );

        let thread = thread::Builder::new()
            .name("shader-watcher".to_string())
            .spawn(move || {
                Self::watch_loop(&dir, poll_interval, baseline, &control_rx, &event_tx);
            })?;

        Ok(Self {
            control_tx,
            event_rx,
            thread: Some(thread),
        })
    }

    fn watch_loop(
        dir: &Path,
        poll_interval: Duration,
        mut snapshot: Snapshot,
        control_rx: &Receiver<WatchControl>,
        event_tx: &Sender<ReloadEvent>,
    ) {
        loop {
            match control_rx.recv_timeout(poll_interval) {
                Ok(WatchControl::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let current = scan(dir);
            let paths: Vec<PathBuf> = current
                .iter()
                .filter(|(path, modified)| snapshot.get(*path) != Some(*modified))
                .map(|(path, _)| path.clone())
                .collect();
            snapshot = current;

            if !paths.is_empty() {
                tracing::debug!(count = paths.len(), "Shader files changed");
                if event_tx.send(ReloadEvent { paths }).is_err() {
                    return;
                }
            }
        }
    }

    /// Next pending event, if any. Call once per frame.
    pub fn try_recv(&self) -> Option<ReloadEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ReloadEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&mut self) {
        let _ = self.control_tx.try_send(WatchControl::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Shader watcher thread panicked");
            }
        }
    }
}

impl Drop for ShaderWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scan(dir: &Path) -> Snapshot {
    let mut snapshot = Snapshot::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::trace!(
                    dir = %current.display(),
                    error = %e,
                    "Skipping unreadable directory"
                );
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if let Ok(modified) = meta.modified() {
                snapshot.insert(entry.path(), modified);
            }
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn write_with_mtime(path: &Path, secs: u64) {
        fs::write(path, b"void main() {}").unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn scan_walks_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("include")).unwrap();
        write_with_mtime(&tmp.path().join("a.frag"), 10);
        write_with_mtime(&tmp.path().join("include/common.glsl"), 10);

        let snapshot = scan(tmp.path());
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key(&tmp.path().join("include/common.glsl")));
        assert!(scan(&tmp.path().join("missing")).is_empty());
    }

    /// Write outside the watched tree, then rename in, so the watcher never
    /// sees the file before its final modification time is set.
    fn install(root: &Path, dest: &Path, secs: u64) {
        let staged = root.join("staged");
        write_with_mtime(&staged, secs);
        fs::rename(&staged, dest).unwrap();
    }

    #[test]
    fn reports_modified_and_added_files() {
        let tmp = tempfile::tempdir().unwrap();
        let shaders = tmp.path().join("shaders");
        fs::create_dir(&shaders).unwrap();
        let shader = shaders.join("tri.vert");
        install(tmp.path(), &shader, 100);

        let watcher = ShaderWatcher::spawn(&shaders, Duration::from_millis(10)).unwrap();
        assert!(watcher.try_recv().is_none());

        install(tmp.path(), &shader, 200);
        let event = watcher.recv_timeout(WAIT).expect("modification reported");
        assert_eq!(event.paths, vec![shader]);

        let added = shaders.join("new.frag");
        install(tmp.path(), &added, 300);
        let event = watcher.recv_timeout(WAIT).expect("new file reported");
        assert_eq!(event.paths, vec![added]);
    }

    #[test]
    fn unchanged_files_produce_no_events() {
        let tmp = tempfile::tempdir().unwrap();
        write_with_mtime(&tmp.path().join("a.comp"), 100);

        let watcher = ShaderWatcher::spawn(tmp.path(), Duration::from_millis(5)).unwrap();
        assert!(watcher.recv_timeout(Duration::from_millis(100)).is_none());
    }

    #[test]
    fn shutdown_joins_the_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watcher = ShaderWatcher::spawn(tmp.path(), Duration::from_secs(60)).unwrap();
        assert!(watcher.is_running());

        // Returns promptly even though the poll interval is long.
        watcher.shutdown();
        assert!(!watcher.is_running());
        watcher.shutdown();
    }
}
