//! HTTP, push and kube layers of the dandelion control plane.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, info};

// Modules
pub mod api;
pub mod error;
pub mod events;
pub mod handlers;
pub mod kube;
pub mod push;
pub mod registry;
pub mod webhook;

use dandelion_common::config::AppConfig;
use dandelion_core::bus::{EventBus, NoopBus, RedisBus};
use dandelion_core::notify::NotifyMessage;
pub use dandelion_core::ModelManager;
pub use error::ServerError;
use kube::KubeContext;
use push::PushHub;

// --- Application State
#[derive(Clone)]
pub struct AppState {
    pub mm: ModelManager,
    pub hub: Arc<PushHub>,
    pub bus: Arc<dyn EventBus>,
    pub kube: Option<Arc<KubeContext>>,
    pub metrics_handle: PrometheusHandle,
    pub start_time: Instant,
}

impl AppState {
    /// Deliver a notification on both paths: direct push to every local
    /// connection sharing the app id, and a fire-and-forget bus publish for
    /// the other replicas. Both are best-effort.
    pub async fn notify(&self, msg: NotifyMessage) {
        self.hub.broadcast(&msg).await;
        if let Err(e) = self.bus.publish(&msg).await {
            error!(app_id = %msg.app_id, error = %e, "bus publish failed");
        }
    }
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[allow(clippy::expect_used)] // metrics setup is infallible; panic acceptable during initialization
fn setup_metrics() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// Metrics handle for integration tests that assemble an [`AppState`] by
/// hand.
pub fn test_metrics_handle() -> PrometheusHandle {
    setup_metrics()
}

/// Assemble the application state from configuration.
pub async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let metrics_handle = setup_metrics();
    let mm = ModelManager::new(Arc::clone(&config)).await?;

    let bus: Arc<dyn EventBus> = if config.bus.enabled {
        Arc::new(RedisBus::connect(&config.bus.url, &config.bus.topic).await?)
    } else {
        Arc::new(NoopBus)
    };

    let kube = if config.kubernetes.enabled {
        Some(Arc::new(KubeContext::init(&config).await?))
    } else {
        None
    };

    Ok(AppState {
        mm,
        hub: Arc::new(PushHub::new()),
        bus,
        kube,
        metrics_handle,
        start_time: Instant::now(),
    })
}

pub async fn run(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(Arc::clone(&config)).await?;

    // replicate bus notifications onto this replica's push connections
    let hub = Arc::clone(&state.hub);
    let mut bus_rx = state.bus.subscribe().await?;
    tokio::spawn(async move {
        while let Some(msg) = bus_rx.recv().await {
            hub.broadcast(&msg).await;
        }
    });

    let app = api::routes(state);

    let addr: SocketAddr = format!("{}:{}", config.core.address, config.core.port).parse()?;
    info!(addr = %addr, "dandelion server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[allow(clippy::expect_used)] // signal handler setup is infallible in practice
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, starting graceful shutdown");
}
