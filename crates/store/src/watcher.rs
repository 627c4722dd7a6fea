use std::path::Path;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::JoinHandle;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// Watches a store's directory tree for `.jwt` file creates/writes and
/// invokes `on_change` with the key derived from the filename (the
/// filename minus its `.jwt` suffix). Runs until `stop()` or drop.
///
/// This is a convenience for read-only replica nodes; the contract is
/// "eventual notification after disk change", not immediate consistency.
pub struct DirectoryWatcher {
    handle: Option<JoinHandle<()>>,
    watcher: Option<notify::RecommendedWatcher>,
}

impl DirectoryWatcher {
    pub fn spawn(root: &Path, on_change: Arc<dyn Fn(String) + Send + Sync>) -> notify::Result<Self> {
        let (tx, rx) = channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let handle = std::thread::spawn(move || {
            for res in rx {
                match res {
                    Ok(event) => dispatch(&event, &on_change),
                    Err(err) => warn!(%err, "directory watcher error"),
                }
            }
        });

        Ok(Self {
            handle: Some(handle),
            watcher: Some(watcher),
        })
    }

    /// Stops watching and joins the background thread.
    pub fn stop(&mut self) {
        // Dropping the watcher closes the channel, which ends the for-loop
        // in the spawned thread.
        self.watcher.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(event: &Event, on_change: &Arc<dyn Fn(String) + Send + Sync>) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in &event.paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(key) = name.strip_suffix(".jwt") else {
            debug!(path = %path.display(), "ignoring non-.jwt write");
            continue;
        };
        on_change(key.to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::channel as std_channel;
    use std::time::Duration;

    #[test]
    fn fires_on_change_for_jwt_writes_and_ignores_others() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = std_channel::<String>();
        let on_change = Arc::new(move |key: String| {
            let _ = tx.send(key);
        });

        let mut watcher = DirectoryWatcher::spawn(dir.path(), on_change).unwrap();

        std::fs::write(dir.path().join("ignored.txt"), b"not a claim").unwrap();
        std::fs::write(dir.path().join("ACCTKEY01.jwt"), b"encoded-claim").unwrap();

        let key = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a notification for the .jwt write");
        assert_eq!(key, "ACCTKEY01");

        watcher.stop();
    }
}
