#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use accessbridge_contracts::{
    AccessRequest, IssueTicket, PluginDataMap, RequestState, Resolution, ResolutionTag, Review,
    WatchEvent, WatchFilter,
};
use accessbridge_server::backend::{Backend, WatchStream};
use accessbridge_server::engine::{Engine, EngineSettings};
use accessbridge_server::error::{BackendError, ClientError, WatchError};
use accessbridge_server::kv_store::KvStore;
use accessbridge_server::ticket::{Label, Labels, Page, TicketClient, Webhook};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;

pub const PROJECT: &str = "42";
pub const PREFIX: &str = "AccessBridge";
pub const HOOK_URL: &str = "https://bridge.example.com/webhook";
pub const HOOK_SECRET: &str = "s3cret";

pub fn unique_suffix() -> u128 {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    nanos + SEQ.fetch_add(1, Ordering::Relaxed) as u128
}

pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("accessbridge-it-{}.db", unique_suffix()))
}

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).expect("valid timestamp")
}

pub fn review(author: &str, state: RequestState) -> Review {
    Review {
        author: author.to_string(),
        proposed_state: state,
        reason: String::new(),
        created: at(1_700_000_100),
    }
}

pub fn access_request(id: &str, user: &str, state: RequestState, reviews: Vec<Review>) -> AccessRequest {
    AccessRequest {
        id: id.to_string(),
        user: user.to_string(),
        roles: vec!["admin".to_string()],
        created: at(1_700_000_000),
        state,
        request_reason: String::new(),
        resolve_reason: String::new(),
        reviews,
    }
}

/// One scripted answer to `watch_requests`.
pub enum Subscription {
    Refused,
    Events {
        items: Vec<Result<WatchEvent, WatchError>>,
        hang: bool,
    },
}

/// In-memory access plane with a conflict-checked plugin-data map.
#[derive(Default)]
pub struct FakeBackend {
    pub data: Mutex<HashMap<String, PluginDataMap>>,
    pub state_changes: Mutex<Vec<(String, RequestState, String, String)>>,
    pub subscriptions: Mutex<VecDeque<Subscription>>,
    pub subscribe_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    /// Writes this map behind the caller's back before the next update.
    pub interfere: Mutex<Vec<(String, PluginDataMap)>>,
    pub ping_fails: AtomicBool,
}

impl FakeBackend {
    pub fn plugin_map(&self, request_id: &str) -> PluginDataMap {
        self.data
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn script(&self, subscription: Subscription) {
        self.subscriptions.lock().unwrap().push_back(subscription);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn watch_requests(&self, _filter: &WatchFilter) -> Result<WatchStream, WatchError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.subscriptions.lock().unwrap().pop_front();
        match next {
            Some(Subscription::Refused) => {
                Err(WatchError::ConnectionRefused("connection refused".to_string()))
            }
            Some(Subscription::Events { items, hang }) => {
                let head = stream::iter(items);
                if hang {
                    Ok(Box::pin(futures_util::StreamExt::chain(head, stream::pending())))
                } else {
                    Ok(Box::pin(head))
                }
            }
            None => Ok(Box::pin(stream::pending::<Result<WatchEvent, WatchError>>())),
        }
    }

    async fn get_plugin_data(&self, request_id: &str) -> Result<PluginDataMap, BackendError> {
        tokio::task::yield_now().await;
        Ok(self.plugin_map(request_id))
    }

    async fn update_plugin_data(
        &self,
        request_id: &str,
        expect: &PluginDataMap,
        set: &PluginDataMap,
    ) -> Result<bool, BackendError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        for (id, map) in self.interfere.lock().unwrap().drain(..) {
            data.insert(id, map);
        }
        let current = data.get(request_id).cloned().unwrap_or_default();
        if &current != expect {
            return Ok(false);
        }
        if set.is_empty() {
            data.remove(request_id);
        } else {
            data.insert(request_id.to_string(), set.clone());
        }
        Ok(true)
    }

    async fn set_request_state(
        &self,
        request_id: &str,
        state: RequestState,
        reason: &str,
        delegator: &str,
    ) -> Result<(), BackendError> {
        self.state_changes.lock().unwrap().push((
            request_id.to_string(),
            state,
            reason.to_string(),
            delegator.to_string(),
        ));
        Ok(())
    }
}

/// Issue tracker double that records every call.
pub struct FakeTickets {
    pub next_issue_id: AtomicU64,
    pub created: Mutex<Vec<(String, IssueTicket, Option<String>)>>,
    pub comments: Mutex<Vec<(u64, String)>>,
    pub closed: Mutex<Vec<(u64, ResolutionTag, Option<String>)>>,
    pub hooks: Mutex<Vec<Webhook>>,
    pub hooks_created: AtomicUsize,
    pub hooks_updated: AtomicUsize,
    pub labels: Mutex<Vec<String>>,
    pub labels_created: AtomicUsize,
    /// Label names a concurrent writer creates just before we do.
    pub racing_labels: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_comments: AtomicBool,
    pub page_size: usize,
    /// Latency of every webhook listing call.
    pub list_delay: Duration,
}

impl Default for FakeTickets {
    fn default() -> Self {
        Self {
            next_issue_id: AtomicU64::new(100),
            created: Mutex::default(),
            comments: Mutex::default(),
            closed: Mutex::default(),
            hooks: Mutex::default(),
            hooks_created: AtomicUsize::new(0),
            hooks_updated: AtomicUsize::new(0),
            labels: Mutex::default(),
            labels_created: AtomicUsize::new(0),
            racing_labels: Mutex::default(),
            fail_create: AtomicBool::new(false),
            fail_comments: AtomicBool::new(false),
            page_size: 2,
            list_delay: Duration::ZERO,
        }
    }
}

impl FakeTickets {
    pub fn comments_on(&self, issue_id: u64) -> Vec<String> {
        self.comments
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == issue_id)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn page<T: Clone>(&self, items: &[T], cursor: Option<&str>) -> Page<T> {
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(items.len());
        let next = (end < items.len()).then(|| end.to_string());
        Page {
            items: items[start.min(end)..end].to_vec(),
            next,
        }
    }
}

#[async_trait]
impl TicketClient for FakeTickets {
    type Ticket = IssueTicket;

    fn scope_id(&self) -> String {
        PROJECT.to_string()
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn create_ticket(
        &self,
        request: &AccessRequest,
        labels: &Labels,
    ) -> Result<IssueTicket, ClientError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ClientError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        let issue_id = self.next_issue_id.fetch_add(1, Ordering::SeqCst);
        let ticket = IssueTicket {
            issue_id,
            issue_iid: issue_id - 99,
            project_id: 42,
        };
        self.created.lock().unwrap().push((
            request.id.clone(),
            ticket,
            labels.get(&accessbridge_kernel::LabelKey::Pending).cloned(),
        ));
        Ok(ticket)
    }

    async fn post_comment(&self, ticket: &IssueTicket, body: &str) -> Result<(), ClientError> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("comment rejected".to_string()));
        }
        self.comments
            .lock()
            .unwrap()
            .push((ticket.issue_id, body.to_string()));
        Ok(())
    }

    async fn close_ticket(
        &self,
        ticket: &IssueTicket,
        resolution: &Resolution,
        labels: &Labels,
    ) -> Result<(), ClientError> {
        let label = accessbridge_kernel::LabelKey::for_resolution(resolution.tag)
            .and_then(|key| labels.get(&key).cloned());
        self.closed
            .lock()
            .unwrap()
            .push((ticket.issue_id, resolution.tag, label));
        Ok(())
    }

    async fn list_webhooks_page(&self, cursor: Option<&str>) -> Result<Page<Webhook>, ClientError> {
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        let hooks = self.hooks.lock().unwrap().clone();
        Ok(self.page(&hooks, cursor))
    }

    async fn create_webhook(&self, url: &str, _secret: &str) -> Result<Webhook, ClientError> {
        self.hooks_created.fetch_add(1, Ordering::SeqCst);
        let mut hooks = self.hooks.lock().unwrap();
        let hook = Webhook {
            id: (hooks.len() + 1).to_string(),
            url: url.to_string(),
        };
        hooks.push(hook.clone());
        Ok(hook)
    }

    async fn update_webhook(
        &self,
        id: &str,
        url: &str,
        _secret: &str,
    ) -> Result<Webhook, ClientError> {
        let mut hooks = self.hooks.lock().unwrap();
        let Some(hook) = hooks.iter_mut().find(|hook| hook.id == id) else {
            return Err(ClientError::NotFound(format!("hook {id}")));
        };
        self.hooks_updated.fetch_add(1, Ordering::SeqCst);
        hook.url = url.to_string();
        Ok(hook.clone())
    }

    async fn list_labels_page(&self, cursor: Option<&str>) -> Result<Page<Label>, ClientError> {
        let labels: Vec<Label> = self
            .labels
            .lock()
            .unwrap()
            .iter()
            .map(|name| Label { name: name.clone() })
            .collect();
        Ok(self.page(&labels, cursor))
    }

    async fn create_label(&self, name: &str) -> Result<Label, ClientError> {
        let mut racing = self.racing_labels.lock().unwrap();
        if let Some(pos) = racing.iter().position(|n| n == name) {
            racing.remove(pos);
            self.labels.lock().unwrap().push(name.to_string());
            return Err(ClientError::AlreadyExists(format!("label {name}")));
        }
        self.labels_created.fetch_add(1, Ordering::SeqCst);
        self.labels.lock().unwrap().push(name.to_string());
        Ok(Label {
            name: name.to_string(),
        })
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub tickets: Arc<FakeTickets>,
    pub store: Arc<KvStore>,
    pub engine: Arc<Engine<FakeBackend, FakeTickets>>,
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        label_prefix: PREFIX.to_string(),
        webhook_url: HOOK_URL.to_string(),
        webhook_secret: HOOK_SECRET.to_string(),
    }
}

pub fn harness() -> Harness {
    harness_with(FakeTickets::default(), KvStore::open(temp_db_path()).expect("open store"))
}

pub fn harness_with(tickets: FakeTickets, store: KvStore) -> Harness {
    harness_sharing(Arc::new(tickets), store)
}

/// Harness whose tracker may be shared with other harnesses.
pub fn harness_sharing(tickets: Arc<FakeTickets>, store: KvStore) -> Harness {
    let backend = Arc::new(FakeBackend::default());
    let store = Arc::new(store);
    let engine = Arc::new(Engine::new(
        Arc::clone(&backend),
        Arc::clone(&tickets),
        Arc::clone(&store),
        settings(),
    ));
    Harness {
        backend,
        tickets,
        store,
        engine,
    }
}

pub fn labels_for(prefix: &str) -> Labels {
    accessbridge_kernel::LabelKey::ALL
        .into_iter()
        .map(|key| (key, accessbridge_kernel::label_name(prefix, key)))
        .collect()
}
