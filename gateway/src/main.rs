mod admin;
mod router;
mod service;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gateway_core::aggregator::CapabilityAggregator;
use gateway_core::clock::SystemClock;
use gateway_core::config::plane::ConfigPlane;
use gateway_core::config::source::FileConfigSource;
use gateway_core::jwt::{DenyAllVerifier, JwtVerifier};
use gateway_core::oauth::store::redis_store::RedisStore;
use gateway_core::oauth::store::{InMemoryStore, Store as OAuthStore};
use gateway_core::session::SessionManager;
use gateway_logging::SqliteSink;

use admin::{AdminState, SharedSecretVerifier, admin_router};
use router::{AppState, build_router};

/// Multi-tenant MCP gateway: REST-to-MCP tool translation, upstream MCP
/// aggregation, and session management behind one HTTP listener.
#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", version, about)]
struct Cli {
    /// Directory of YAML config documents (spec §3), hot-reloaded on change.
    #[arg(long, env = "MCP_GATEWAY_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Address the HTTP listener binds to.
    #[arg(long, env = "MCP_GATEWAY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Path to the sqlite audit log database.
    #[arg(long, env = "MCP_GATEWAY_LOG_DB", default_value = "gateway-logs.sqlite")]
    log_db: PathBuf,

    /// Shared secret for the admin surface (`/admin/*`). Admin endpoints
    /// reject every request when unset.
    #[arg(long, env = "MCP_GATEWAY_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Redis URL for the OAuth2 store (clients/codes/tokens). When unset,
    /// OAuth state is kept in-memory and does not survive a restart or
    /// scale beyond a single instance.
    #[arg(long, env = "MCP_GATEWAY_OAUTH_REDIS_URL")]
    oauth_redis_url: Option<String>,
}

/// The built, immutable runtime handle: every long-lived collaborator the
/// process needs, assembled once at startup rather than reached for through
/// process-wide mutable singletons (Design Notes §9).
struct Runtime {
    plane: Arc<ConfigPlane>,
    aggregator: Arc<CapabilityAggregator>,
    sessions: Arc<SessionManager>,
    audit: SqliteSink,
}

impl Runtime {
    async fn build(cli: &Cli) -> anyhow::Result<Self> {
        let clock = Arc::new(SystemClock);
        let source = Arc::new(FileConfigSource::new(cli.config_dir.clone()));
        let plane = Arc::new(ConfigPlane::bootstrap(source, clock.clone()).await?);

        let config_view: Arc<dyn gateway_core::aggregator::ConfigView> = plane.clone();
        let aggregator = Arc::new(CapabilityAggregator::new(config_view));
        for cfg in plane.current().configs.iter() {
            if cfg.is_tombstone() {
                continue;
            }
            for mcp_server in &cfg.mcp_servers {
                aggregator.upstream_for(mcp_server);
            }
        }

        let sessions = Arc::new(SessionManager::new(clock));
        let audit = SqliteSink::open(cli.log_db.clone()).await?;

        Ok(Self {
            plane,
            aggregator,
            sessions,
            audit,
        })
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,mcp_gateway=debug"))
        .unwrap();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let runtime = Runtime::build(&cli).await?;

    let tenant_routers: Vec<(String, gateway_core::config::RouterConfig)> = runtime
        .plane
        .current()
        .configs
        .iter()
        .filter(|c| !c.is_tombstone())
        .flat_map(|c| c.routers.iter().map(move |r| (c.tenant.clone(), r.clone())))
        .collect();

    let oauth_store: Arc<dyn OAuthStore> = match &cli.oauth_redis_url {
        Some(url) => {
            tracing::info!(target = "mcp_gateway", "using redis-backed oauth store");
            Arc::new(RedisStore::connect(url, Arc::new(SystemClock)).await?)
        }
        None => Arc::new(InMemoryStore::new(Arc::new(SystemClock))),
    };

    let app_state = Arc::new(AppState {
        aggregator: runtime.aggregator.clone(),
        sessions: runtime.sessions.clone(),
        oauth_store,
        audit: runtime.audit.clone(),
    });
    let mcp_router = build_router(app_state, &tenant_routers);

    let verifier: Arc<dyn JwtVerifier> = match &cli.admin_token {
        Some(token) => Arc::new(SharedSecretVerifier(token.clone())),
        None => Arc::new(DenyAllVerifier),
    };
    let admin_state = Arc::new(AdminState {
        plane: runtime.plane.clone(),
        verifier,
        log_db: cli.log_db.clone(),
    });
    let admin_routes = admin_router(admin_state);

    let app = mcp_router.merge(admin_routes);

    let plane_for_reload = runtime.plane.clone();
    tokio::spawn(async move { plane_for_reload.run().await });

    let sessions_for_reaper = runtime.sessions.clone();
    tokio::spawn(async move {
        sessions_for_reaper
            .run_idle_reaper(std::time::Duration::from_secs(60))
            .await
    });

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    tracing::info!(target = "mcp_gateway", addr = %cli.listen, "listening");

    let audit_for_shutdown = runtime.audit.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target = "mcp_gateway", "shutdown signal received, flushing audit log");
        audit_for_shutdown.flush().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
