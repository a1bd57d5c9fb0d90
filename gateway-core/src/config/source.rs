//! `ConfigSource`: the external collaborator that produces `MCPConfig`
//! snapshots and change notifications (spec.md §1). `FileConfigSource` is
//! the one concrete implementation the core ships — a directory of YAML
//! documents, watched with `notify` the way
//! `ratchet-registry::watcher::RegistryWatcher` watches task directories:
//! a debounced event stream feeding a bounded-concurrency reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::MCPConfig;
use crate::error::{GatewayError, GatewayResult};

#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// Loads every config document currently available.
    async fn load_all(&self) -> GatewayResult<Vec<MCPConfig>>;

    /// Starts watching for changes, returning a channel that receives a
    /// unit signal (debounced) each time the source should be reloaded.
    /// A source with no change notifications (e.g. a one-shot loader) can
    /// return a channel that never fires.
    fn watch(&self) -> mpsc::Receiver<()>;
}

pub struct FileConfigSource {
    dir: PathBuf,
    debounce: Duration,
}

impl FileConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            debounce: Duration::from_millis(250),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    fn doc_paths(&self) -> GatewayResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            GatewayError::Internal(format!("reading config dir {:?}: {e}", self.dir))
        })?;
        for entry in entries {
            let entry =
                entry.map_err(|e| GatewayError::Internal(format!("config dir entry: {e}")))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if is_yaml {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

fn load_doc(path: &Path) -> GatewayResult<Vec<MCPConfig>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Validation(format!("reading {:?}: {e}", path)))?;
    // A document may contain a single MCPConfig or a YAML sequence of them.
    if let Ok(one) = serde_yaml::from_str::<MCPConfig>(&content) {
        return Ok(vec![one]);
    }
    serde_yaml::from_str::<Vec<MCPConfig>>(&content)
        .map_err(|e| GatewayError::Validation(format!("parsing {:?}: {e}", path)))
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load_all(&self) -> GatewayResult<Vec<MCPConfig>> {
        let paths = self.doc_paths()?;
        let mut out = Vec::new();
        for path in paths {
            out.extend(load_doc(&path)?);
        }
        Ok(out)
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<NotifyEvent>(256);
        let (debounced_tx, debounced_rx) = mpsc::channel::<()>(1);
        let dir = self.dir.clone();
        let debounce = self.debounce;

        // notify's callback runs on its own thread; bridge into async with
        // a bounded channel, same shape as RegistryWatcher::start.
        std::thread::spawn(move || {
            let (sync_tx, sync_rx) = std::sync::mpsc::channel::<notify::Result<NotifyEvent>>();
            let mut watcher = match RecommendedWatcher::new(
                move |res| {
                    let _ = sync_tx.send(res);
                },
                notify::Config::default(),
            ) {
                Ok(w) => w,
                Err(e) => {
                    tracing::error!(target = "config_source", "failed to start watcher: {e}");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                tracing::error!(target = "config_source", "failed to watch {:?}: {e}", dir);
                return;
            }
            for res in sync_rx {
                if let Ok(event) = res {
                    if raw_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(debounce);
            let mut pending = false;
            loop {
                tokio::select! {
                    maybe_event = raw_rx.recv() => {
                        match maybe_event {
                            Some(_) => pending = true,
                            None => break,
                        }
                    }
                    _ = interval.tick() => {
                        if pending {
                            pending = false;
                            if debounced_tx.send(()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        debounced_rx
    }
}

/// A static, in-memory source for tests and programmatic configuration —
/// no filesystem, no watcher.
pub struct StaticConfigSource {
    configs: Arc<parking_lot::Mutex<Vec<MCPConfig>>>,
}

impl StaticConfigSource {
    pub fn new(configs: Vec<MCPConfig>) -> Self {
        Self {
            configs: Arc::new(parking_lot::Mutex::new(configs)),
        }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load_all(&self) -> GatewayResult<Vec<MCPConfig>> {
        Ok(self.configs.lock().clone())
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_returns_seeded_configs() {
        let cfg = MCPConfig {
            tenant: "t".into(),
            name: "n".into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: 0,
            routers: vec![],
            servers: vec![],
            tools: vec![],
            prompts: vec![],
            mcp_servers: vec![],
        };
        let src = StaticConfigSource::new(vec![cfg.clone()]);
        let loaded = src.load_all().await.unwrap();
        assert_eq!(loaded, vec![cfg]);
    }
}
