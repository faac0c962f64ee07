use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use accessbridge_config::Watcher as WatcherConfig;
use accessbridge_contracts::{WatchEvent, WatchFilter};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::{EngineError, WatchError};
use crate::lifecycle::JobContext;

const QUEUE_CAPACITY: usize = 64;

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: WatchEvent) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub ready_timeout: Duration,
    pub handler_timeout: Duration,
    pub workers: usize,
    pub reconnect_delay: Duration,
}

impl From<&WatcherConfig> for WatcherOptions {
    fn from(cfg: &WatcherConfig) -> Self {
        Self {
            ready_timeout: Duration::from_millis(cfg.ready_timeout_ms),
            handler_timeout: Duration::from_millis(cfg.handler_timeout_ms),
            workers: cfg.workers.max(1),
            reconnect_delay: Duration::from_millis(cfg.reconnect_delay_ms),
        }
    }
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self::from(&WatcherConfig::default())
    }
}

pub struct Watcher<B, H> {
    backend: Arc<B>,
    handler: Arc<H>,
    filter: WatchFilter,
    opts: WatcherOptions,
}

impl<B: Backend, H: EventHandler> Watcher<B, H> {
    pub fn new(backend: Arc<B>, handler: Arc<H>, filter: WatchFilter, opts: WatcherOptions) -> Self {
        Self {
            backend,
            handler,
            filter,
            opts,
        }
    }

    pub async fn run(&self, ctx: &JobContext) -> Result<(), WatchError> {
        let cancel = ctx.cancel_token();
        let mut dispatcher = Dispatcher::start(
            Arc::clone(&self.handler),
            &self.opts,
            cancel.child_token(),
        );
        let outcome = loop {
            let err = self.watch_once(ctx, &cancel, &dispatcher).await;
            match err {
                WatchError::Cancelled => break Ok(()),
                err if err.is_transient() => {
                    warn!(error = %err, delay = ?self.opts.reconnect_delay, "event feed interrupted, resubscribing");
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.opts.reconnect_delay) => {}
                    }
                }
                err => break Err(err),
            }
        };
        dispatcher.shutdown().await;
        outcome
    }

    async fn watch_once(
        &self,
        ctx: &JobContext,
        cancel: &CancellationToken,
        dispatcher: &Dispatcher,
    ) -> WatchError {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return WatchError::Cancelled,
            opened = self.backend.watch_requests(&self.filter) => match opened {
                Ok(stream) => stream,
                Err(err) => return err,
            },
        };

        let first = tokio::select! {
            _ = cancel.cancelled() => return WatchError::Cancelled,
            first = tokio::time::timeout(self.opts.ready_timeout, stream.next()) => first,
        };
        match first {
            Err(_) => return WatchError::NotReady(self.opts.ready_timeout),
            Ok(None) => return WatchError::Eof,
            Ok(Some(Err(err))) => return err,
            Ok(Some(Ok(WatchEvent::Init))) => {}
            Ok(Some(Ok(other))) => {
                return WatchError::Other(format!(
                    "expected init as the first event, got {other:?}"
                ))
            }
        }
        ctx.mark_ready();
        info!(kind = %self.filter.kind, "event feed initialised");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return WatchError::Cancelled,
                next = stream.next() => next,
            };
            match next {
                None => return WatchError::Eof,
                Some(Err(err)) => return err,
                Some(Ok(WatchEvent::Init)) => debug!("ignoring repeated init event"),
                Some(Ok(event)) => {
                    if let Err(err) = dispatcher.dispatch(event, cancel).await {
                        return err;
                    }
                }
            }
        }
    }
}

struct Dispatcher {
    queues: Vec<mpsc::Sender<WatchEvent>>,
    workers: JoinSet<()>,
}

impl Dispatcher {
    fn start<H: EventHandler>(
        handler: Arc<H>,
        opts: &WatcherOptions,
        cancel: CancellationToken,
    ) -> Self {
        let mut queues = Vec::with_capacity(opts.workers);
        let mut workers = JoinSet::new();
        for shard in 0..opts.workers.max(1) {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            queues.push(tx);
            workers.spawn(run_worker(
                shard,
                rx,
                Arc::clone(&handler),
                opts.handler_timeout,
                cancel.clone(),
            ));
        }
        Self { queues, workers }
    }

    async fn dispatch(
        &self,
        event: WatchEvent,
        cancel: &CancellationToken,
    ) -> Result<(), WatchError> {
        let shard = shard_for(event.request_id().unwrap_or_default(), self.queues.len());
        tokio::select! {
            _ = cancel.cancelled() => Err(WatchError::Cancelled),
            sent = self.queues[shard].send(event) => {
                sent.map_err(|_| WatchError::Other(format!("event worker {shard} stopped")))
            }
        }
    }

    async fn shutdown(&mut self) {
        self.queues.clear();
        while self.workers.join_next().await.is_some() {}
    }
}

fn shard_for(request_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    request_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

async fn run_worker<H: EventHandler>(
    shard: usize,
    mut rx: mpsc::Receiver<WatchEvent>,
    handler: Arc<H>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let request_id = event.request_id().unwrap_or_default().to_string();
        match tokio::time::timeout(timeout, handler.handle_event(event)).await {
            Ok(Ok(())) => debug!(shard, %request_id, "event handled"),
            Ok(Err(err)) => error!(shard, %request_id, error = %err, "failed to handle event"),
            Err(_) => error!(shard, %request_id, ?timeout, "event handler timed out"),
        }
    }
}
