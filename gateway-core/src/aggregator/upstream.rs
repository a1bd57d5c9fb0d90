//! Upstream supervisor (spec §4.4): owns the lifecycle of one `McpServer`
//! connector — spawning/dialing it, tracking readiness, and reconnecting
//! with bounded exponential backoff. Built directly on `rmcp`'s client
//! transports the way `client.rs::ensure_rmcp_client` does, minus the
//! Tauri-specific OAuth-credential restoration (the gateway's own OAuth2
//! server handles inbound auth; outbound auth to upstreams is out of scope
//! here — see DESIGN.md).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use rmcp::ServiceExt;
use rmcp::service::RoleClient;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};

use crate::config::{McpServerConfig, StartPolicy, TransportKind};
use crate::error::{GatewayError, GatewayResult};
use crate::session::UpstreamHandle;

pub type ClientService = rmcp::service::RunningService<RoleClient, ()>;

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Unknown,
    Starting,
    Ready,
    Error,
    Disconnected,
}

pub struct UpstreamSupervisor {
    pub id: u64,
    pub cfg: McpServerConfig,
    state: parking_lot::RwLock<UpstreamState>,
    generation: AtomicU32,
    client: parking_lot::RwLock<Option<Arc<ClientService>>>,
    last_error: parking_lot::RwLock<Option<String>>,
}

impl UpstreamSupervisor {
    pub fn new(id: u64, cfg: McpServerConfig) -> Self {
        Self {
            id,
            cfg,
            state: parking_lot::RwLock::new(UpstreamState::Unknown),
            generation: AtomicU32::new(0),
            client: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
        }
    }

    pub fn state(&self) -> UpstreamState {
        *self.state.read()
    }

    pub fn handle(&self) -> UpstreamHandle {
        UpstreamHandle {
            id: self.id,
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    pub fn client(&self) -> Option<Arc<ClientService>> {
        self.client.read().clone()
    }

    pub fn is_stale(&self, handle: UpstreamHandle) -> bool {
        handle.id != self.id || handle.generation != self.generation.load(Ordering::SeqCst)
    }

    /// Starts the connect/reconnect loop in the background. `onStart`
    /// policy callers invoke this at snapshot install; `onDemand` callers
    /// invoke it lazily on first use (see `ensure_started`).
    pub fn spawn_supervise_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                *self.state.write() = UpstreamState::Starting;
                match self.connect_once().await {
                    Ok(client) => {
                        *self.client.write() = Some(Arc::new(client));
                        self.generation.fetch_add(1, Ordering::SeqCst);
                        *self.state.write() = UpstreamState::Ready;
                        *self.last_error.write() = None;
                        attempt = 0;
                        self.wait_for_disconnect().await;
                        *self.state.write() = UpstreamState::Disconnected;
                        *self.client.write() = None;
                    }
                    Err(e) => {
                        *self.state.write() = UpstreamState::Error;
                        *self.last_error.write() = Some(e.to_string());
                        tracing::warn!(
                            target = "upstream_supervisor",
                            server = %self.cfg.name,
                            error = %e,
                            "connect failed"
                        );
                    }
                }
                let backoff = backoff_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(backoff).await;
            }
        });
    }

    async fn wait_for_disconnect(&self) {
        if let Some(client) = self.client() {
            client.waiting().await.ok();
        }
    }

    pub async fn ensure_ready(self: &Arc<Self>, timeout: Duration) -> GatewayResult<()> {
        if self.state() == UpstreamState::Ready {
            return Ok(());
        }
        if self.cfg.policy == StartPolicy::OnDemand && self.state() == UpstreamState::Unknown {
            self.clone().spawn_supervise_loop();
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state() == UpstreamState::Ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::UpstreamUnavailable(format!(
                    "upstream {} not ready within {:?}",
                    self.cfg.name, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn connect_once(&self) -> GatewayResult<ClientService> {
        match &self.cfg.transport {
            TransportKind::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }
                let transport = TokioChildProcess::new(cmd).map_err(|e| {
                    GatewayError::UpstreamUnavailable(format!("spawning {command}: {e}"))
                })?;
                ().serve(transport)
                    .await
                    .map_err(|e| GatewayError::UpstreamProtocol(format!("handshake: {e}")))
            }
            TransportKind::Sse { url } => {
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| GatewayError::Internal(format!("building http client: {e}")))?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| GatewayError::UpstreamUnavailable(format!("sse connect: {e}")))?;
                ().serve(transport)
                    .await
                    .map_err(|e| GatewayError::UpstreamProtocol(format!("handshake: {e}")))
            }
            TransportKind::StreamableHttp { url } => {
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| GatewayError::Internal(format!("building http client: {e}")))?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.clone()),
                );
                ().serve(transport)
                    .await
                    .map_err(|e| GatewayError::UpstreamProtocol(format!("handshake: {e}")))
            }
        }
    }
}

/// `100ms -> 30s`, doubling, capped, with +/-20% jitter so many upstreams
/// failing together don't reconnect in lockstep.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let base = MIN_BACKOFF.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(MAX_BACKOFF);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered_millis = (capped.as_millis() as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered_millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_and_grows() {
        let first = backoff_for_attempt(0);
        let later = backoff_for_attempt(20);
        assert!(first <= Duration::from_millis(120));
        assert!(later <= MAX_BACKOFF + Duration::from_secs(6));
    }

    #[test]
    fn fresh_supervisor_starts_unknown() {
        let cfg = McpServerConfig {
            name: "s".into(),
            transport: TransportKind::Stdio {
                command: "echo-mcp".into(),
                args: vec![],
                env: Default::default(),
            },
            policy: StartPolicy::OnDemand,
            preinstalled: false,
        };
        let sup = UpstreamSupervisor::new(1, cfg);
        assert_eq!(sup.state(), UpstreamState::Unknown);
        assert_eq!(sup.handle(), UpstreamHandle { id: 1, generation: 0 });
    }
}
