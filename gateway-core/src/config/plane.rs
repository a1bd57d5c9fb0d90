//! `ConfigPlane`: wires a `ConfigSource` to a `ConfigStore`, validating
//! every load before install and keeping the prior snapshot active on
//! failure. This is the component other subsystems (router, aggregator)
//! depend on directly.

use std::sync::Arc;

use tokio::sync::watch;

use super::source::ConfigSource;
use super::store::{ConfigStore, Snapshot};
use super::{detect_tool_name_collisions, validate_all};
use crate::clock::Clock;
use crate::error::GatewayResult;

fn warn_tool_collisions(configs: &[super::MCPConfig]) {
    for name in detect_tool_name_collisions(configs) {
        tracing::warn!(target = "config_plane", tool = %name, "duplicate tool name across configs, first wins");
    }
}

pub struct ConfigPlane {
    store: Arc<ConfigStore>,
    source: Arc<dyn ConfigSource>,
}

impl ConfigPlane {
    /// Performs the initial load synchronously (a bad initial config should
    /// fail startup loudly) then returns a plane whose `run` task keeps it
    /// current.
    pub async fn bootstrap(source: Arc<dyn ConfigSource>, clock: Arc<dyn Clock>) -> GatewayResult<Self> {
        let initial = source.load_all().await?;
        validate_all(&initial)?;
        warn_tool_collisions(&initial);
        let store = Arc::new(ConfigStore::new(clock, initial));
        Ok(Self { store, source })
    }

    pub fn current(&self) -> Snapshot {
        self.store.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.store.subscribe()
    }

    pub fn rollback_to(&self, id: u64) -> Option<Snapshot> {
        self.store.rollback_to(id)
    }

    pub fn list_versions(&self) -> Vec<(u64, String, i64)> {
        self.store.list_versions()
    }

    pub async fn reload_now(&self) -> GatewayResult<Snapshot> {
        let loaded = self.source.load_all().await?;
        validate_all(&loaded)?;
        warn_tool_collisions(&loaded);
        Ok(self.store.install(loaded))
    }

    /// Drives the watch→reload loop until the source's change channel
    /// closes. Spawn this once at startup; a validation failure logs and
    /// keeps the previous snapshot active rather than tearing anything
    /// down.
    pub async fn run(self: Arc<Self>) {
        let mut changes = self.source.watch();
        while changes.recv().await.is_some() {
            match self.reload_now().await {
                Ok(snap) => {
                    tracing::info!(
                        target = "config_plane",
                        snapshot_id = snap.id,
                        hash = %snap.hash,
                        "installed new config snapshot"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target = "config_plane",
                        error = %e,
                        "reload failed validation, keeping prior snapshot"
                    );
                }
            }
        }
    }
}

impl crate::aggregator::ConfigView for ConfigPlane {
    fn configs(&self) -> Arc<Vec<crate::config::MCPConfig>> {
        self.current().configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::config::source::StaticConfigSource;
    use crate::config::MCPConfig;

    fn cfg(tenant: &str, name: &str) -> MCPConfig {
        MCPConfig {
            tenant: tenant.into(),
            name: name.into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: 0,
            routers: vec![],
            servers: vec![],
            tools: vec![],
            prompts: vec![],
            mcp_servers: vec![],
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_initial_config() {
        let mut bad = cfg("t", "n");
        bad.name = "x".repeat(51);
        let src = Arc::new(StaticConfigSource::new(vec![bad]));
        let clock = Arc::new(FakeClock::new(0));
        assert!(ConfigPlane::bootstrap(src, clock).await.is_err());
    }

    #[tokio::test]
    async fn reload_now_installs_valid_snapshot() {
        let src = Arc::new(StaticConfigSource::new(vec![cfg("t", "a")]));
        let clock = Arc::new(FakeClock::new(0));
        let plane = ConfigPlane::bootstrap(src, clock).await.unwrap();
        assert_eq!(plane.current().configs.len(), 1);
        let snap = plane.reload_now().await.unwrap();
        assert_eq!(snap.configs.len(), 1);
    }
}
