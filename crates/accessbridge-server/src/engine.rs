use std::sync::Arc;

use accessbridge_config::Config;
use accessbridge_contracts::{
    AccessRequest, InboundAction, InboundActionKind, IssueTicket, PluginData, RequestData,
    RequestState, Resolution, ResolutionTag, Review, TicketIdentity, WatchEvent,
};
use accessbridge_kernel::{
    action_reason, label_name, reduce_label_name, resolution_comment, resolution_for_action,
    resolution_for_state, review_comment, reviews_to_post, state_for_resolution, LabelKey,
};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{ClientError, EngineError, MultiError, StoreError};
use crate::kv_store::KvStore;
use crate::plugin_data::PluginDataStore;
use crate::ticket::{collect_pages, Labels, TicketClient};
use crate::watcher::EventHandler;
use crate::webhook::ActionSink;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub label_prefix: String,
    pub webhook_url: String,
    pub webhook_secret: String,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            label_prefix: cfg.gitlab.label_prefix.clone(),
            webhook_url: cfg.http.webhook_url(),
            webhook_secret: cfg.gitlab.webhook_secret.clone(),
        }
    }
}

pub struct Engine<B: Backend, C: TicketClient> {
    backend: Arc<B>,
    client: Arc<C>,
    plugin_data: PluginDataStore<B>,
    store: Arc<KvStore>,
    scope: String,
    settings: EngineSettings,
    labels: RwLock<Labels>,
    setup_lock: Mutex<()>,
}

impl<B: Backend, C: TicketClient> Engine<B, C> {
    pub fn new(backend: Arc<B>, client: Arc<C>, store: Arc<KvStore>, settings: EngineSettings) -> Self {
        Self {
            plugin_data: PluginDataStore::new(Arc::clone(&backend)),
            scope: client.scope_id(),
            backend,
            client,
            store,
            settings,
            labels: RwLock::new(Labels::new()),
            setup_lock: Mutex::new(()),
        }
    }

    pub fn plugin_data(&self) -> &PluginDataStore<B> {
        &self.plugin_data
    }

    pub async fn labels(&self) -> Labels {
        self.labels.read().await.clone()
    }

    // Runs inside the settings transaction so concurrent starts register one webhook.
    pub async fn setup(&self) -> Result<(), EngineError> {
        let _guard = self.setup_lock.lock().await;
        let txn = self.store.begin_settings(&self.scope).await?;

        let stored_hook = txn.settings().hook_id()?;
        let hook_id = self.ensure_webhook(stored_hook).await?;
        let labels = self.ensure_labels().await?;

        {
            let settings = txn.settings();
            settings.set_hook_id(&hook_id)?;
            settings.set_labels(&labels)?;
        }
        txn.commit()?;
        info!(scope = %self.scope, %hook_id, labels = labels.len(), "setup complete");
        *self.labels.write().await = labels;
        Ok(())
    }

    async fn ensure_webhook(&self, stored: Option<String>) -> Result<String, EngineError> {
        let url = &self.settings.webhook_url;
        let secret = &self.settings.webhook_secret;

        if let Some(id) = stored {
            match self.client.update_webhook(&id, url, secret).await {
                Ok(hook) => return Ok(hook.id),
                Err(ClientError::NotFound(_)) => {
                    info!(hook_id = %id, "stored webhook no longer exists")
                }
                Err(err) => return Err(err.into()),
            }
        }

        let client = &self.client;
        let hooks = collect_pages(|cursor| async move {
            client.list_webhooks_page(cursor.as_deref()).await
        })
        .await?;
        if let Some(hook) = hooks.into_iter().find(|hook| &hook.url == url) {
            debug!(hook_id = %hook.id, "reusing webhook registered for our url");
            return Ok(hook.id);
        }

        let hook = self.client.create_webhook(url, secret).await?;
        info!(hook_id = %hook.id, %url, "registered webhook");
        Ok(hook.id)
    }

    async fn ensure_labels(&self) -> Result<Labels, EngineError> {
        let prefix = &self.settings.label_prefix;
        let client = &self.client;
        let existing = collect_pages(|cursor| async move {
            client.list_labels_page(cursor.as_deref()).await
        })
        .await?;

        let mut labels = Labels::new();
        for label in existing {
            if let Some(key) = reduce_label_name(prefix, &label.name) {
                labels.entry(key).or_insert(label.name);
            }
        }

        for key in LabelKey::ALL {
            if labels.contains_key(&key) {
                continue;
            }
            let name = label_name(prefix, key);
            match self.client.create_label(&name).await {
                Ok(label) => {
                    info!(label = %label.name, "created label");
                    labels.insert(key, label.name);
                }
                Err(ClientError::AlreadyExists(_)) => {
                    debug!(label = %name, "label was created concurrently");
                    labels.insert(key, name);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(labels)
    }

    pub async fn on_watch_event(&self, event: WatchEvent) -> Result<(), EngineError> {
        match event {
            WatchEvent::Init => Ok(()),
            WatchEvent::Put { resource } => match resource.state {
                RequestState::Pending => self.on_pending_request(&resource).await,
                RequestState::Approved | RequestState::Denied => {
                    self.on_resolved_request(&resource).await
                }
            },
            WatchEvent::Delete { request_id } => self.on_deleted_request(&request_id).await,
        }
    }

    pub async fn on_pending_request(&self, req: &AccessRequest) -> Result<(), EngineError> {
        let request_id = req.id.as_str();
        let fresh = RequestData::from_request(req);
        let created = self
            .plugin_data
            .modify_plugin_data::<C::Ticket, _>(request_id, |existing| match existing {
                Some(_) => None,
                None => Some(PluginData {
                    request: fresh.clone(),
                    ticket: C::Ticket::default(),
                }),
            })
            .await?;

        if created {
            let labels = self.labels().await;
            match self.client.create_ticket(req, &labels).await {
                Ok(ticket) => self.record_ticket(request_id, ticket).await?,
                Err(err) => {
                    self.forget_unticketed(request_id).await;
                    return Err(err.into());
                }
            }
        } else {
            debug!(request_id, "request data already exists, not opening another ticket");
        }

        if !req.reviews.is_empty() {
            self.post_review_comments(request_id, &req.reviews).await?;
        }
        Ok(())
    }

    async fn record_ticket(&self, request_id: &str, ticket: C::Ticket) -> Result<(), EngineError> {
        let stored = self
            .plugin_data
            .modify_plugin_data::<C::Ticket, _>(request_id, |existing| {
                let mut data = existing.cloned().unwrap_or_default();
                if data.ticket.is_set() {
                    return None;
                }
                data.ticket = ticket.clone();
                Some(data)
            })
            .await?;
        if !stored {
            warn!(request_id, ?ticket, "request already carries another ticket");
            return Ok(());
        }

        let index_key = ticket.index_key();
        self.store
            .update_issues(&self.scope, |issues| {
                issues.set_request_id(&index_key, request_id)
            })
            .await?;
        info!(request_id, ticket = %index_key, "opened ticket");
        Ok(())
    }

    async fn forget_unticketed(&self, request_id: &str) {
        let removed = self
            .plugin_data
            .modify_plugin_data::<C::Ticket, _>(request_id, |existing| match existing {
                Some(data) if !data.ticket.is_set() && !data.request.resolution.is_resolved() => {
                    Some(PluginData::default())
                }
                _ => None,
            })
            .await;
        if let Err(err) = removed {
            warn!(request_id, error = %err, "failed to clear request data after ticket creation failure");
        }
    }

    // The counter moves before posting; failed posts are not retried.
    pub async fn post_review_comments(
        &self,
        request_id: &str,
        reviews: &[Review],
    ) -> Result<(), EngineError> {
        let mut old_count = 0;
        let mut ticket = None;
        let advanced = self
            .plugin_data
            .modify_plugin_data::<C::Ticket, _>(request_id, |existing| {
                ticket = None;
                let existing = existing?;
                if !existing.ticket.is_set() || existing.request.reviews_count >= reviews.len() {
                    return None;
                }
                old_count = existing.request.reviews_count;
                ticket = Some(existing.ticket.clone());
                let mut data = existing.clone();
                data.request.reviews_count = reviews.len();
                Some(data)
            })
            .await?;

        let (true, Some(ticket)) = (advanced, ticket) else {
            debug!(request_id, "no review comments to post");
            return Ok(());
        };

        let mut results = Vec::new();
        for review in reviews_to_post(reviews, old_count) {
            let posted = self
                .client
                .post_comment(&ticket, &review_comment(review))
                .await
                .map_err(EngineError::from);
            if let Err(err) = &posted {
                warn!(request_id, author = %review.author, error = %err, "failed to post review comment");
            }
            results.push(posted);
        }
        MultiError::collect(results)
    }

    pub async fn on_resolved_request(&self, req: &AccessRequest) -> Result<(), EngineError> {
        let reviews = self.post_review_comments(&req.id, &req.reviews).await;
        let resolved = match resolution_for_state(req.state, &req.resolve_reason) {
            Some(resolution) => self.resolve_issue(&req.id, resolution).await,
            None => Ok(()),
        };
        MultiError::collect([reviews, resolved])
    }

    pub async fn on_deleted_request(&self, request_id: &str) -> Result<(), EngineError> {
        self.resolve_issue(request_id, Resolution::new(ResolutionTag::Expired, ""))
            .await
    }

    pub async fn resolve_issue(
        &self,
        request_id: &str,
        resolution: Resolution,
    ) -> Result<(), EngineError> {
        let mut ticket = None;
        let applied = self
            .plugin_data
            .modify_plugin_data::<C::Ticket, _>(request_id, |existing| {
                ticket = None;
                let existing = existing?;
                if !existing.ticket.is_set() || existing.request.resolution.is_resolved() {
                    return None;
                }
                ticket = Some(existing.ticket.clone());
                let mut data = existing.clone();
                data.request.resolution = resolution.clone();
                Some(data)
            })
            .await?;

        let (true, Some(ticket)) = (applied, ticket) else {
            debug!(request_id, "request already resolved by us or has no ticket");
            return Ok(());
        };

        let labels = self.labels().await;
        let commented = self
            .client
            .post_comment(&ticket, &resolution_comment(&resolution))
            .await
            .map_err(EngineError::from);
        let closed = self
            .client
            .close_ticket(&ticket, &resolution, &labels)
            .await
            .map_err(EngineError::from);
        MultiError::collect([commented, closed])?;
        info!(request_id, resolution = resolution.tag.as_str(), "resolved ticket");
        Ok(())
    }

    pub async fn on_webhook_action(
        &self,
        action: InboundAction<C::Ticket>,
    ) -> Result<(), EngineError> {
        let Some(resolution) = resolution_for_action(&action.kind, &action.reason) else {
            let name = match &action.kind {
                InboundActionKind::ResolveCustom(name) => name.as_str(),
                _ => "",
            };
            return Err(EngineError::Rejected(format!("unknown action {name:?}")));
        };
        let Some(state) = state_for_resolution(resolution.tag) else {
            return Err(EngineError::Rejected(format!(
                "action cannot resolve to {}",
                resolution.tag.as_str()
            )));
        };
        if !action.ticket.is_set() {
            return Err(EngineError::Rejected("callback carries no ticket".to_string()));
        }

        let index_key = action.ticket.index_key();
        let request_id = match self
            .store
            .view_issues(&self.scope, |issues| issues.request_id(&index_key))
            .await
        {
            Ok(Some(request_id)) => request_id,
            Ok(None) | Err(StoreError::NoBucket(_)) => {
                return Err(EngineError::Rejected(format!(
                    "ticket {index_key} is not linked to an access request"
                )))
            }
            Err(err) => return Err(err.into()),
        };

        let Some(data) = self
            .plugin_data
            .get_plugin_data::<C::Ticket>(&request_id)
            .await?
        else {
            return Err(EngineError::Rejected(format!(
                "request {request_id} has no stored data"
            )));
        };
        if data.request.user.trim().is_empty() {
            return Err(EngineError::Rejected(format!(
                "request {request_id} has no stored user"
            )));
        }
        if data.ticket != action.ticket {
            warn!(%request_id, stored = ?data.ticket, received = ?action.ticket, "ticket mismatch");
            return Err(EngineError::Rejected(format!(
                "ticket {index_key} does not match the ticket stored for request {request_id}"
            )));
        }
        if data.request.resolution.is_resolved() {
            debug!(%request_id, "request already resolved, ignoring callback");
            return Ok(());
        }

        let reason = action_reason(resolution.tag, &action.actor, &action.reason);
        self.backend
            .set_request_state(&request_id, state, &reason, action.actor.display())
            .await?;
        info!(%request_id, state = %state, actor = %action.actor.display(), "request resolved from the tracker");
        self.resolve_issue(&request_id, Resolution::new(resolution.tag, reason))
            .await
    }
}

#[async_trait]
impl<B: Backend, C: TicketClient> EventHandler for Engine<B, C> {
    async fn handle_event(&self, event: WatchEvent) -> Result<(), EngineError> {
        self.on_watch_event(event).await
    }
}

#[async_trait]
impl<B, C> ActionSink for Engine<B, C>
where
    B: Backend,
    C: TicketClient<Ticket = IssueTicket>,
{
    async fn apply(&self, action: InboundAction<IssueTicket>) -> Result<(), EngineError> {
        self.on_webhook_action(action).await
    }
}
