use std::time::Duration;

use accessbridge_config::Gitlab as GitlabConfig;
use accessbridge_contracts::{AccessRequest, IssueTicket, Resolution};
use accessbridge_kernel::{ticket_description, ticket_title, LabelKey};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::ClientError;
use crate::ticket::{Label, Labels, Page, TicketClient, Webhook};

const PER_PAGE: &str = "100";

pub struct GitlabClient {
    api: String,
    scope: String,
    project_id: String,
    token: String,
    http: Client,
    permits: Semaphore,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    id: u64,
    iid: u64,
    project_id: u64,
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

fn label_color(key: LabelKey) -> &'static str {
    match key {
        LabelKey::Pending => "#FFA500",
        LabelKey::Approved => "#428BCA",
        LabelKey::Denied => "#D9534F",
        LabelKey::Expired => "#7F8C8D",
    }
}

impl GitlabClient {
    pub fn new(cfg: &GitlabConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms.max(1)))
            .pool_max_idle_per_host(cfg.max_connections)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            api: format!("{}/api/v4", cfg.url.trim_end_matches('/')),
            scope: cfg.project_id.clone(),
            // Namespaced paths such as `group/project` must be escaped.
            project_id: cfg.project_id.replace('/', "%2F"),
            token: cfg.token.clone(),
            http,
            permits: Semaphore::new(cfg.max_connections.max(1)),
        })
    }

    fn project_url(&self, tail: &str) -> String {
        format!("{}/projects/{}{tail}", self.api, self.project_id)
    }

    fn issue_url(&self, ticket: &IssueTicket, tail: &str) -> String {
        format!(
            "{}/projects/{}/issues/{}{tail}",
            self.api, ticket.project_id, ticket.issue_iid
        )
    }

    async fn execute(&self, builder: RequestBuilder, what: &str) -> Result<Response, ClientError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = builder
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(ClientError::AlreadyExists(what.to_string())),
            status => Err(ClientError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<T, ClientError> {
        self.execute(builder, what)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn list_page<T: DeserializeOwned>(
        &self,
        tail: &str,
        cursor: Option<&str>,
        what: &str,
    ) -> Result<Page<T>, ClientError> {
        let page = cursor.unwrap_or("1");
        let response = self
            .execute(
                self.http
                    .get(self.project_url(tail))
                    .query(&[("page", page), ("per_page", PER_PAGE)]),
                what,
            )
            .await?;
        let next = response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let items = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(Page { items, next })
    }
}

#[async_trait]
impl TicketClient for GitlabClient {
    type Ticket = IssueTicket;

    fn scope_id(&self) -> String {
        self.scope.clone()
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        self.execute(self.http.get(self.project_url("")), "project")
            .await
            .map(|_| ())
    }

    async fn create_ticket(
        &self,
        request: &AccessRequest,
        labels: &Labels,
    ) -> Result<IssueTicket, ClientError> {
        let mut body = json!({
            "title": ticket_title(request),
            "description": ticket_description(request),
        });
        if let Some(pending) = labels.get(&LabelKey::Pending) {
            body["labels"] = json!(pending);
        }
        let issue: IssueResponse = self
            .execute_json(self.http.post(self.project_url("/issues")).json(&body), "issue")
            .await?;
        debug!(request_id = %request.id, issue_id = issue.id, "created gitlab issue");
        Ok(IssueTicket {
            issue_id: issue.id,
            issue_iid: issue.iid,
            project_id: issue.project_id,
        })
    }

    async fn post_comment(&self, ticket: &IssueTicket, body: &str) -> Result<(), ClientError> {
        self.execute(
            self.http
                .post(self.issue_url(ticket, "/notes"))
                .json(&json!({ "body": body })),
            "issue",
        )
        .await
        .map(|_| ())
    }

    async fn close_ticket(
        &self,
        ticket: &IssueTicket,
        resolution: &Resolution,
        labels: &Labels,
    ) -> Result<(), ClientError> {
        let mut body = json!({ "state_event": "close" });
        if let Some(name) = LabelKey::for_resolution(resolution.tag).and_then(|k| labels.get(&k)) {
            body["add_labels"] = json!(name);
        }
        if let Some(pending) = labels.get(&LabelKey::Pending) {
            body["remove_labels"] = json!(pending);
        }
        self.execute(self.http.put(self.issue_url(ticket, "")).json(&body), "issue")
            .await
            .map(|_| ())
    }

    async fn list_webhooks_page(&self, cursor: Option<&str>) -> Result<Page<Webhook>, ClientError> {
        let page: Page<HookResponse> = self.list_page("/hooks", cursor, "hooks").await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|hook| Webhook {
                    id: hook.id.to_string(),
                    url: hook.url,
                })
                .collect(),
            next: page.next,
        })
    }

    async fn create_webhook(&self, url: &str, secret: &str) -> Result<Webhook, ClientError> {
        let hook: HookResponse = self
            .execute_json(
                self.http.post(self.project_url("/hooks")).json(&json!({
                    "url": url,
                    "token": secret,
                    "issues_events": true,
                    "push_events": false,
                    "enable_ssl_verification": url.starts_with("https://"),
                })),
                "hook",
            )
            .await?;
        Ok(Webhook {
            id: hook.id.to_string(),
            url: hook.url,
        })
    }

    async fn update_webhook(
        &self,
        id: &str,
        url: &str,
        secret: &str,
    ) -> Result<Webhook, ClientError> {
        let hook: HookResponse = self
            .execute_json(
                self.http
                    .put(self.project_url(&format!("/hooks/{id}")))
                    .json(&json!({
                        "url": url,
                        "token": secret,
                        "issues_events": true,
                        "push_events": false,
                        "enable_ssl_verification": url.starts_with("https://"),
                    })),
                &format!("hook {id}"),
            )
            .await?;
        Ok(Webhook {
            id: hook.id.to_string(),
            url: hook.url,
        })
    }

    async fn list_labels_page(&self, cursor: Option<&str>) -> Result<Page<Label>, ClientError> {
        let page: Page<LabelResponse> = self.list_page("/labels", cursor, "labels").await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|label| Label { name: label.name })
                .collect(),
            next: page.next,
        })
    }

    async fn create_label(&self, name: &str) -> Result<Label, ClientError> {
        let color = LabelKey::ALL
            .into_iter()
            .find(|key| name.to_lowercase().ends_with(key.as_str()))
            .map(label_color)
            .unwrap_or("#428BCA");
        let label: LabelResponse = self
            .execute_json(
                self.http
                    .post(self.project_url("/labels"))
                    .json(&json!({ "name": name, "color": color })),
                &format!("label {name}"),
            )
            .await?;
        Ok(Label { name: label.name })
    }
}
