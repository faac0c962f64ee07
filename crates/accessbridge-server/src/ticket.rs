use std::collections::BTreeMap;
use std::future::Future;

use accessbridge_contracts::{AccessRequest, Resolution, TicketIdentity};
use accessbridge_kernel::LabelKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub type Labels = BTreeMap<LabelKey, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

#[async_trait]
pub trait TicketClient: Send + Sync + 'static {
    type Ticket: TicketIdentity;

    fn scope_id(&self) -> String;

    async fn health_check(&self) -> Result<(), ClientError>;

    async fn create_ticket(
        &self,
        request: &AccessRequest,
        labels: &Labels,
    ) -> Result<Self::Ticket, ClientError>;

    async fn post_comment(&self, ticket: &Self::Ticket, body: &str) -> Result<(), ClientError>;

    async fn close_ticket(
        &self,
        ticket: &Self::Ticket,
        resolution: &Resolution,
        labels: &Labels,
    ) -> Result<(), ClientError>;

    async fn list_webhooks_page(&self, cursor: Option<&str>) -> Result<Page<Webhook>, ClientError>;

    async fn create_webhook(&self, url: &str, secret: &str) -> Result<Webhook, ClientError>;

    // ClientError::NotFound when the hook is gone.
    async fn update_webhook(&self, id: &str, url: &str, secret: &str)
        -> Result<Webhook, ClientError>;

    async fn list_labels_page(&self, cursor: Option<&str>) -> Result<Page<Label>, ClientError>;

    // ClientError::AlreadyExists on a lost race.
    async fn create_label(&self, name: &str) -> Result<Label, ClientError>;
}

pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, ClientError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, ClientError>>,
{
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = fetch(cursor.take()).await?;
        out.extend(page.items);
        match page.next {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_pages_follows_cursors_in_order() {
        let pages = vec![
            Page {
                items: vec![1, 2],
                next: Some("2".to_string()),
            },
            Page {
                items: vec![3],
                next: Some("3".to_string()),
            },
            Page::last(vec![4, 5]),
        ];
        let mut seen = Vec::new();
        let all = collect_pages(|cursor| {
            seen.push(cursor.clone());
            let idx = cursor.map(|c| c.parse::<usize>().unwrap() - 1).unwrap_or(0);
            let page = pages[idx].clone();
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(all, vec![1, 2, 3, 4, 5]);
        assert_eq!(seen, vec![None, Some("2".to_string()), Some("3".to_string())]);
    }

    #[tokio::test]
    async fn collect_pages_stops_on_error() {
        let result: Result<Vec<u8>, _> =
            collect_pages(|_| async { Err(ClientError::Transport("down".to_string())) }).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
