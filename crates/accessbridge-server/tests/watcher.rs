mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use accessbridge_contracts::{RequestState, WatchEvent, WatchFilter};
use accessbridge_server::error::{EngineError, WatchError};
use accessbridge_server::lifecycle::{JobError, Supervisor};
use accessbridge_server::watcher::{EventHandler, Watcher, WatcherOptions};
use async_trait::async_trait;
use support::{access_request, FakeBackend, Subscription};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle_event(&self, event: WatchEvent) -> Result<(), EngineError> {
        let id = event.request_id().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push(id);
        Err(EngineError::Rejected("handler errors are only logged".to_string()))
    }
}

fn options() -> WatcherOptions {
    WatcherOptions {
        ready_timeout: Duration::from_millis(200),
        handler_timeout: Duration::from_millis(200),
        workers: 2,
        reconnect_delay: Duration::from_millis(5),
    }
}

// Hangs on the first event of req-1 and records everything else.
#[derive(Default)]
struct StuckOnFirst {
    hung: AtomicBool,
    seen: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl EventHandler for StuckOnFirst {
    async fn handle_event(&self, event: WatchEvent) -> Result<(), EngineError> {
        let WatchEvent::Put { resource } = event else {
            return Ok(());
        };
        if resource.id == "req-1" && !self.hung.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.seen
            .lock()
            .unwrap()
            .push((resource.id, resource.request_reason));
        Ok(())
    }
}

fn put_marked(id: &str, marker: &str) -> Result<WatchEvent, WatchError> {
    let mut resource = access_request(id, "alice", RequestState::Pending, vec![]);
    resource.request_reason = marker.to_string();
    Ok(WatchEvent::Put { resource })
}

fn put(id: &str) -> Result<WatchEvent, WatchError> {
    Ok(WatchEvent::Put {
        resource: access_request(id, "alice", RequestState::Pending, vec![]),
    })
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn resubscribes_after_transient_errors_and_stops_cleanly() {
    let backend = Arc::new(FakeBackend::default());
    backend.script(Subscription::Refused);
    backend.script(Subscription::Events {
        items: vec![Ok(WatchEvent::Init), put("req-1")],
        hang: false,
    });
    backend.script(Subscription::Events {
        items: vec![
            Ok(WatchEvent::Init),
            put("req-2"),
            Err(WatchError::ConnectionReset("reset by peer".to_string())),
        ],
        hang: false,
    });
    backend.script(Subscription::Events {
        items: vec![Ok(WatchEvent::Init), put("req-3")],
        hang: true,
    });

    let recorder = Arc::new(Recorder::default());
    let watcher = Watcher::new(
        Arc::clone(&backend),
        Arc::clone(&recorder),
        WatchFilter::pending_requests(),
        options(),
    );

    let root = CancellationToken::new();
    let mut supervisor = Supervisor::new(&root);
    supervisor.spawn("watcher", |ctx| async move {
        watcher
            .run(&ctx)
            .await
            .map_err(|e| JobError::failed(ctx.name(), e))
    });
    supervisor
        .wait_ready(Duration::from_secs(2))
        .await
        .expect("watcher ready");

    wait_until(|| recorder.seen.lock().unwrap().len() == 3).await;
    assert_eq!(backend.subscribe_calls.load(Ordering::SeqCst), 4);

    root.cancel();
    supervisor.wait().await.expect("cancellation is not an error");

    let mut seen = recorder.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["req-1", "req-2", "req-3"]);
}

#[tokio::test]
async fn missing_init_is_not_ready() {
    let backend = Arc::new(FakeBackend::default());
    backend.script(Subscription::Events {
        items: vec![],
        hang: true,
    });
    let watcher = Watcher::new(
        backend,
        Arc::new(Recorder::default()),
        WatchFilter::pending_requests(),
        options(),
    );

    let root = CancellationToken::new();
    let mut supervisor = Supervisor::new(&root);
    supervisor.spawn("watcher", |ctx| async move {
        watcher.run(&ctx).await.map_err(|e| JobError::failed(ctx.name(), e))
    });

    let err = supervisor.wait().await.expect_err("not ready is fatal");
    assert!(err.to_string().contains("not ready"), "{err}");
}

#[tokio::test]
async fn unknown_stream_errors_are_fatal() {
    let backend = Arc::new(FakeBackend::default());
    backend.script(Subscription::Events {
        items: vec![
            Ok(WatchEvent::Init),
            Err(WatchError::Other("permission denied".to_string())),
        ],
        hang: false,
    });
    let watcher = Watcher::new(
        Arc::clone(&backend),
        Arc::new(Recorder::default()),
        WatchFilter::pending_requests(),
        options(),
    );

    let ctx_token = CancellationToken::new();
    let mut supervisor = Supervisor::new(&ctx_token);
    supervisor.spawn("watcher", |ctx| async move {
        watcher.run(&ctx).await.map_err(|e| JobError::failed(ctx.name(), e))
    });
    let err = supervisor.wait().await.expect_err("fatal error");
    assert!(err.to_string().contains("permission denied"));
    assert_eq!(backend.subscribe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stuck_handler_times_out_and_the_queue_keeps_moving() {
    let backend = Arc::new(FakeBackend::default());
    backend.script(Subscription::Events {
        items: vec![
            Ok(WatchEvent::Init),
            put_marked("req-1", "first"),
            put_marked("req-1", "second"),
            put_marked("req-2", "only"),
        ],
        hang: true,
    });
    let handler = Arc::new(StuckOnFirst::default());
    let opts = WatcherOptions {
        handler_timeout: Duration::from_millis(100),
        // One shard puts every request behind the stuck one.
        workers: 1,
        ..options()
    };
    let watcher = Watcher::new(
        backend,
        Arc::clone(&handler),
        WatchFilter::pending_requests(),
        opts,
    );

    let root = CancellationToken::new();
    let mut supervisor = Supervisor::new(&root);
    let started = Instant::now();
    supervisor.spawn("watcher", |ctx| async move {
        watcher.run(&ctx).await.map_err(|e| JobError::failed(ctx.name(), e))
    });

    wait_until(|| handler.seen.lock().unwrap().len() == 2).await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(
        *handler.seen.lock().unwrap(),
        vec![
            ("req-1".to_string(), "second".to_string()),
            ("req-2".to_string(), "only".to_string()),
        ]
    );

    root.cancel();
    supervisor.wait().await.expect("clean shutdown");
}

#[tokio::test]
async fn events_of_one_request_are_handled_in_order() {
    let mut items = vec![Ok(WatchEvent::Init)];
    for n in 0..10 {
        items.push(put_marked("req-a", &n.to_string()));
        items.push(put_marked("req-b", &n.to_string()));
    }
    let backend = Arc::new(FakeBackend::default());
    backend.script(Subscription::Events { items, hang: true });
    let handler = Arc::new(StuckOnFirst::default());
    let watcher = Watcher::new(
        backend,
        Arc::clone(&handler),
        WatchFilter::pending_requests(),
        WatcherOptions {
            workers: 4,
            ..options()
        },
    );

    let root = CancellationToken::new();
    let mut supervisor = Supervisor::new(&root);
    supervisor.spawn("watcher", |ctx| async move {
        watcher.run(&ctx).await.map_err(|e| JobError::failed(ctx.name(), e))
    });
    wait_until(|| handler.seen.lock().unwrap().len() == 20).await;
    root.cancel();
    supervisor.wait().await.expect("clean shutdown");

    let seen = handler.seen.lock().unwrap();
    let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
    for id in ["req-a", "req-b"] {
        let markers: Vec<String> = seen
            .iter()
            .filter(|(seen_id, _)| seen_id == id)
            .map(|(_, marker)| marker.clone())
            .collect();
        assert_eq!(markers, expected, "{id}");
    }
}
