pub mod backend;
pub mod engine;
pub mod error;
pub mod gitlab;
pub mod kv_store;
pub mod lifecycle;
pub mod plugin_data;
pub mod ticket;
pub mod watcher;
pub mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use accessbridge_config::Config;
use accessbridge_contracts::WatchFilter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{Backend, HttpBackend};
use crate::engine::{Engine, EngineSettings};
use crate::error::{BackendError, ClientError, EngineError, StoreError};
use crate::gitlab::GitlabClient;
use crate::kv_store::KvStore;
use crate::lifecycle::{JobError, Supervisor};
use crate::ticket::TicketClient;
use crate::watcher::{Watcher, WatcherOptions};
use crate::webhook::{router, WebhookSettings};

pub const JOB_WATCHER: &str = "watcher";
pub const JOB_WEBHOOK_SERVER: &str = "webhook-server";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("ticket system health check failed: {0}")]
    TicketSystemUnavailable(ClientError),
    #[error("access plane health check failed: {0}")]
    BackendUnavailable(BackendError),
    #[error("open local store failed: {0}")]
    Store(#[from] StoreError),
    #[error("setup failed: {0}")]
    Setup(#[from] EngineError),
    #[error("bind {addr} failed: {message}")]
    Bind { addr: String, message: String },
    #[error("build client failed: {0}")]
    Client(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<(), AppError> {
    let backend =
        Arc::new(HttpBackend::new(&cfg.backend).map_err(|e| AppError::Client(e.to_string()))?);
    let client =
        Arc::new(GitlabClient::new(&cfg.gitlab).map_err(|e| AppError::Client(e.to_string()))?);
    run_with(cfg, backend, client, cancel).await
}

pub async fn run_with<B, C>(
    cfg: Config,
    backend: Arc<B>,
    client: Arc<C>,
    cancel: CancellationToken,
) -> Result<(), AppError>
where
    B: Backend,
    C: TicketClient<Ticket = accessbridge_contracts::IssueTicket>,
{
    client
        .health_check()
        .await
        .map_err(AppError::TicketSystemUnavailable)?;
    backend.ping().await.map_err(AppError::BackendUnavailable)?;
    info!("ticket system and access plane are reachable");

    let store = Arc::new(KvStore::open(&cfg.db.path)?);
    let engine = Arc::new(Engine::new(
        Arc::clone(&backend),
        client,
        store,
        EngineSettings::from_config(&cfg),
    ));
    engine.setup().await?;

    let addr: SocketAddr = cfg.http.listen_addr.parse().map_err(|e| AppError::Bind {
        addr: cfg.http.listen_addr.clone(),
        message: format!("{e}"),
    })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Bind {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
    let app = router(WebhookSettings::from_config(&cfg), engine.clone());
    let grace = Duration::from_millis(cfg.http.shutdown_grace_ms);

    let watcher = Watcher::new(
        backend,
        Arc::clone(&engine),
        WatchFilter::pending_requests(),
        WatcherOptions::from(&cfg.watcher),
    );

    let mut supervisor = Supervisor::new(&cancel);
    supervisor.spawn(JOB_WATCHER, |ctx| async move {
        watcher
            .run(&ctx)
            .await
            .map_err(|e| JobError::failed(ctx.name(), e))
    });
    supervisor.spawn(JOB_WEBHOOK_SERVER, |ctx| async move {
        webhook::serve(listener, app, &ctx, grace).await
    });

    let ready_timeout = Duration::from_millis(cfg.watcher.ready_timeout_ms) * 2;
    if let Err(err) = supervisor.wait_ready(ready_timeout).await {
        supervisor.cancel();
        let outcome = supervisor.wait().await;
        return Err(match outcome {
            Err(job_err) => AppError::Job(job_err),
            Ok(()) => AppError::Job(err),
        });
    }
    info!("accessbridge is running");
    supervisor.wait().await?;
    info!("accessbridge stopped");
    Ok(())
}
