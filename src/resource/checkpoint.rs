//! Append-only checkpoint journal. Spec §4.3 "Checkpoint journal", §6
//! "Checkpoint file format".

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex as SyncMutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

const CHANNEL_CAPACITY: usize = 64;

/// Handle used by the pipeline to enqueue terminal URLs. `enqueue` never
/// blocks: on a full channel the URL is dropped silently, which is
/// acceptable because resume filtering is set-based (spec §4.3).
#[derive(Clone)]
pub struct CheckpointHandle {
    tx: mpsc::Sender<String>,
}

impl CheckpointHandle {
    pub fn enqueue(&self, url: String) {
        if self.tx.try_send(url).is_err() {
            warn!("checkpoint queue full; dropping entry (resume filter is set-based)");
        }
    }

    pub fn queued_len(&self) -> usize {
        CHANNEL_CAPACITY - self.tx.capacity()
    }
}

/// Owns the writer's own sender and background task behind interior
/// mutability so `close` can run via `&self` — `ResourceManager` is shared
/// through an `Arc` with the pipeline, so a by-value close is never
/// reachable.
pub struct CheckpointWriter {
    keepalive: SyncMutex<Option<mpsc::Sender<String>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CheckpointWriter {
    /// Spawns the dedicated writer task if `path` is configured; otherwise
    /// returns a handle whose `enqueue` is a harmless no-op sink.
    pub fn spawn(path: Option<PathBuf>, flush_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let task = path.map(|path| {
            tokio::spawn(async move {
                let mut buffer: Vec<String> = Vec::with_capacity(CHANNEL_CAPACITY);
                let mut ticker = tokio::time::interval(flush_interval);
                loop {
                    tokio::select! {
                        maybe_url = rx.recv() => {
                            match maybe_url {
                                Some(url) => {
                                    buffer.push(url);
                                    if buffer.len() >= CHANNEL_CAPACITY {
                                        flush(&path, &mut buffer);
                                    }
                                }
                                None => {
                                    flush(&path, &mut buffer);
                                    return;
                                }
                            }
                        }
                        _ = ticker.tick() => {
                            flush(&path, &mut buffer);
                        }
                    }
                }
            })
        });
        Self {
            keepalive: SyncMutex::new(Some(tx)),
            task: Mutex::new(task),
        }
    }

    /// Borrow a sender-backed handle. Panics if called after `close` — the
    /// pipeline never enqueues once the resource manager has been closed.
    pub fn handle(&self) -> CheckpointHandle {
        let guard = self.keepalive.lock().unwrap();
        let tx = guard.as_ref().expect("checkpoint writer used after close").clone();
        CheckpointHandle { tx }
    }

    /// Drop the writer's own sender and drain the background task. Safe to
    /// call more than once.
    pub async fn close(&self) {
        self.keepalive.lock().unwrap().take();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

fn flush(path: &std::path::Path, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let result = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            for url in buffer.iter() {
                writeln!(file, "{url}")?;
            }
            Ok(())
        });
    if let Err(e) = result {
        warn!(error = %e, "checkpoint flush failed");
    }
    buffer.clear();
}

/// Load the set of URLs already present in the checkpoint file at startup
/// (spec §4.5 "Start"/ §6 "resume consumes the set of all lines present").
pub fn load_existing(path: &std::path::Path) -> HashSet<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(_) => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_loads_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        let writer = CheckpointWriter::spawn(Some(path.clone()), Duration::from_millis(10));
        let handle = writer.handle();
        handle.enqueue("https://example.com/a".into());
        handle.enqueue("https://example.com/b".into());
        writer.close().await;
        let loaded = load_existing(&path);
        assert!(loaded.contains("https://example.com/a"));
        assert!(loaded.contains("https://example.com/b"));
    }

    #[test]
    fn missing_file_yields_empty_set() {
        let loaded = load_existing(std::path::Path::new("/nonexistent/path.log"));
        assert!(loaded.is_empty());
    }
}
