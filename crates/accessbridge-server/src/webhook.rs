use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use accessbridge_config::{BasicAuth, Config};
use accessbridge_contracts::{ActorIdentity, InboundAction, InboundActionKind, IssueTicket};
use accessbridge_kernel::{reduce_label_name, LabelKey};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::lifecycle::{JobContext, JobError};

pub const GITLAB_EVENT_HEADER: &str = "x-gitlab-event";
pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";

#[async_trait]
pub trait ActionSink: Send + Sync + 'static {
    async fn apply(&self, action: InboundAction<IssueTicket>) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: String,
    pub basic_auth: Option<BasicAuth>,
    pub handler_timeout: Duration,
    pub label_prefix: String,
}

impl WebhookSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            secret: cfg.gitlab.webhook_secret.clone(),
            basic_auth: cfg.http.basic_auth.clone(),
            handler_timeout: Duration::from_millis(cfg.http.handler_timeout_ms),
            label_prefix: cfg.gitlab.label_prefix.clone(),
        }
    }
}

#[derive(Clone)]
struct WebhookState {
    settings: Arc<WebhookSettings>,
    sink: Arc<dyn ActionSink>,
}

#[derive(Debug, Deserialize)]
pub struct GitlabUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct IssueAttributes {
    pub id: u64,
    pub iid: u64,
    pub project_id: u64,
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LabelRef {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LabelChanges {
    #[serde(default)]
    pub previous: Vec<LabelRef>,
    #[serde(default)]
    pub current: Vec<LabelRef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueChanges {
    #[serde(default)]
    pub labels: Option<LabelChanges>,
}

#[derive(Debug, Deserialize)]
pub struct IssueEvent {
    #[serde(default)]
    pub object_kind: String,
    pub user: GitlabUser,
    pub object_attributes: IssueAttributes,
    #[serde(default)]
    pub changes: IssueChanges,
}

#[derive(Debug)]
pub enum WebhookEvent {
    Issue(IssueEvent),
    Other(String),
}

impl WebhookEvent {
    pub fn parse(event_header: &str, body: &[u8]) -> Result<Self, serde_json::Error> {
        match event_header {
            "Issue Hook" | "Confidential Issue Hook" => {
                serde_json::from_slice(body).map(WebhookEvent::Issue)
            }
            other => Ok(WebhookEvent::Other(other.to_string())),
        }
    }

    pub fn into_action(self, label_prefix: &str) -> Option<InboundAction<IssueTicket>> {
        let WebhookEvent::Issue(event) = self else {
            return None;
        };
        let changes = event.changes.labels?;
        let previous: BTreeSet<&str> = changes.previous.iter().map(|l| l.title.as_str()).collect();
        let kind = changes
            .current
            .iter()
            .filter(|label| !previous.contains(label.title.as_str()))
            .find_map(|label| match reduce_label_name(label_prefix, &label.title) {
                Some(LabelKey::Approved) => Some(InboundActionKind::Approve),
                Some(LabelKey::Denied) => Some(InboundActionKind::Deny),
                _ => None,
            })?;
        let name = if event.user.name.is_empty() {
            event.user.username
        } else {
            event.user.name
        };
        Some(InboundAction {
            kind,
            ticket: IssueTicket {
                issue_id: event.object_attributes.id,
                issue_iid: event.object_attributes.iid,
                project_id: event.object_attributes.project_id,
            },
            actor: ActorIdentity {
                name,
                email: event.user.email,
            },
            reason: String::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CustomActionPayload {
    ticket: IssueTicket,
    #[serde(default)]
    actor: ActorIdentity,
    #[serde(default)]
    reason: String,
}

pub fn router(settings: WebhookSettings, sink: Arc<dyn ActionSink>) -> Router {
    let state = WebhookState {
        settings: Arc::new(settings),
        sink,
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(gitlab_webhook))
        .route("/webhook/actions/{name}", post(custom_action))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    router: Router,
    ctx: &JobContext,
    grace: Duration,
) -> Result<(), JobError> {
    let addr = listener
        .local_addr()
        .map_err(|e| JobError::failed(ctx.name(), e))?;
    let shutdown = ctx.cancel_token();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });
    ctx.mark_ready();
    info!(%addr, "webhook server listening");

    tokio::select! {
        finished = &mut server => return flatten_server_result(ctx, finished),
        _ = ctx.cancelled() => {}
    }
    match tokio::time::timeout(grace, &mut server).await {
        Ok(finished) => flatten_server_result(ctx, finished),
        Err(_) => {
            warn!(?grace, "webhook server did not drain in time, closing connections");
            server.abort();
            Ok(())
        }
    }
}

fn flatten_server_result(
    ctx: &JobContext,
    finished: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), JobError> {
    match finished {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(JobError::failed(ctx.name(), err)),
        Err(err) => Err(JobError::Panicked {
            job: ctx.name().to_string(),
            message: err.to_string(),
        }),
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn gitlab_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Err(status) = check_request(&state.settings, &headers) {
        return status;
    }
    let event_header = headers
        .get(GITLAB_EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let event = match WebhookEvent::parse(event_header, &body) {
        Ok(event) => event,
        Err(err) => {
            warn!(event = event_header, error = %err, "malformed webhook payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    if let WebhookEvent::Issue(issue) = &event {
        debug!(
            kind = %issue.object_kind,
            action = %issue.object_attributes.action,
            issue_id = issue.object_attributes.id,
            "issue event received"
        );
    }
    match event.into_action(&state.settings.label_prefix) {
        Some(action) => apply_action(&state, action).await,
        None => StatusCode::NO_CONTENT,
    }
}

async fn custom_action(
    State(state): State<WebhookState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Err(status) = check_request(&state.settings, &headers) {
        return status;
    }
    let payload: CustomActionPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(action = %name, error = %err, "malformed custom action payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    let action = InboundAction {
        kind: InboundActionKind::ResolveCustom(name),
        ticket: payload.ticket,
        actor: payload.actor,
        reason: payload.reason,
    };
    apply_action(&state, action).await
}

async fn apply_action(state: &WebhookState, action: InboundAction<IssueTicket>) -> StatusCode {
    let timeout = state.settings.handler_timeout;
    let issue_id = action.ticket.issue_id;
    let result = match tokio::time::timeout(timeout, state.sink.apply(action)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(timeout)),
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => {
            let status = status_for(&err);
            if status.is_server_error() {
                error!(issue_id, error = %err, "failed to apply tracker action");
            } else {
                warn!(issue_id, error = %err, "rejected tracker action");
            }
            status
        }
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Timeout(_) | EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Rejected(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn check_request(settings: &WebhookSettings, headers: &HeaderMap) -> Result<(), StatusCode> {
    let token = headers
        .get(GITLAB_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(token, &settings.secret) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if let Some(expected) = &settings.basic_auth {
        if !basic_auth_matches(headers, expected) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    if !mime.eq_ignore_ascii_case("application/json") {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(())
}

fn constant_time_eq(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn basic_auth_matches(headers: &HeaderMap, expected: &BasicAuth) -> bool {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return false;
    };
    let user_ok = constant_time_eq(user, &expected.user);
    let password_ok = constant_time_eq(password, &expected.password);
    user_ok & password_ok
}
