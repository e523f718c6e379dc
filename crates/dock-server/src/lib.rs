pub mod codec;
pub mod coordinator;
pub mod http;
pub mod ws;

pub use codec::{CodecError, MessageCodec};
pub use coordinator::{CoordinatorError, ExecutionCoordinator};

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info};

use dock_agents::{AgentCatalog, AgentSupervisor};
use dock_core::{
    AuditLog, BridgeConfig, EventBus, PairingRegistry, PlanRegistry, SessionStore,
};
use dock_crypto::{BridgeIdentity, TokenSigner};
use dock_workspace::GitWorkspace;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub identity: Arc<BridgeIdentity>,
    pub pairing: PairingRegistry,
    pub sessions: SessionStore,
    pub coordinator: ExecutionCoordinator,
    pub bus: EventBus,
    pub audit: AuditLog,
    pub codec: MessageCodec,
    pub started_at: Instant,
}

/// Wires every store and the coordinator together from a loaded config and
/// state directory.
pub async fn build_state(config: BridgeConfig, state_dir: &Path) -> anyhow::Result<AppState> {
    let identity =
        Arc::new(BridgeIdentity::load_or_generate(state_dir).context("bridge identity")?);
    let audit = AuditLog::open(state_dir).await.context("audit log")?;
    let bus = EventBus::new();
    let sessions = SessionStore::new(Arc::new(TokenSigner::new()), audit.clone(), &config.security);
    let pairing = PairingRegistry::new();
    let plans = PlanRegistry::new();

    let catalog = AgentCatalog::new(config.agents.paths.clone());
    let supervisor = AgentSupervisor::new(
        catalog,
        config.agents.max_buffer_bytes,
        config.agents.timeout,
    );
    let auto_commit = config
        .git
        .get("autoCommit")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let workspace = Arc::new(GitWorkspace::new(config.git.clone()));
    let coordinator = ExecutionCoordinator::new(
        supervisor,
        workspace,
        plans,
        bus.clone(),
        audit.clone(),
        auto_commit,
    );

    let codec = MessageCodec::new(
        config.security.command_timeout,
        config.security.clock_skew_tolerance,
    );

    Ok(AppState {
        config: Arc::new(config),
        identity,
        pairing,
        sessions,
        coordinator,
        bus,
        audit,
        codec,
        started_at: Instant::now(),
    })
}

/// Binds the HTTP control surface and the message channel, runs the minute
/// sweeper, and serves until ctrl-c.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let http_addr: SocketAddr = ([127, 0, 0, 1], state.config.port).into();
    let ws_addr: SocketAddr = ([127, 0, 0, 1], state.config.ws_port()).into();

    let sweeper_state = state.clone();
    let sweeper = tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            let expired_sessions = sweeper_state.sessions.sweep().await;
            for session_id in &expired_sessions {
                sweeper_state.coordinator.cancel_session(session_id).await;
            }
            let expired_plans = sweeper_state.coordinator.plans().sweep().await;
            if !expired_sessions.is_empty() || !expired_plans.is_empty() {
                debug!(
                    sessions = expired_sessions.len(),
                    plans = expired_plans.len(),
                    "sweeper expired state"
                );
            }
        }
    });

    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("bind {http_addr}"))?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("bind {ws_addr}"))?;
    info!(%http_addr, %ws_addr, "prompt-dock bridge listening");

    let http = axum::serve(http_listener, http::router(state.clone()));
    let channel = axum::serve(ws_listener, ws::router(state));

    let result = tokio::select! {
        result = http.with_graceful_shutdown(shutdown_signal()) => result,
        result = channel.with_graceful_shutdown(shutdown_signal()) => result,
    };
    sweeper.abort();
    result?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        futures::future::pending::<()>().await;
    }
}
