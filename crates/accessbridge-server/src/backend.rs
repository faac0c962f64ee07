use std::pin::Pin;
use std::time::Duration;

use accessbridge_config::Backend as BackendConfig;
use accessbridge_contracts::{PluginDataMap, RequestState, WatchEvent, WatchFilter};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackendError, WatchError};

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, WatchError>> + Send>>;

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), BackendError>;

    async fn watch_requests(&self, filter: &WatchFilter) -> Result<WatchStream, WatchError>;

    async fn get_plugin_data(&self, request_id: &str) -> Result<PluginDataMap, BackendError>;

    // Ok(false) when the stored map no longer equals expect.
    async fn update_plugin_data(
        &self,
        request_id: &str,
        expect: &PluginDataMap,
        set: &PluginDataMap,
    ) -> Result<bool, BackendError>;

    async fn set_request_state(
        &self,
        request_id: &str,
        state: RequestState,
        reason: &str,
        delegator: &str,
    ) -> Result<(), BackendError>;
}

pub struct HttpBackend {
    addr: String,
    plugin_name: String,
    http: Client,
    stream_http: Client,
}

#[derive(Debug, Deserialize)]
struct PluginDataResponse {
    #[serde(default)]
    data: PluginDataMap,
}

#[derive(Debug, Serialize)]
struct PluginDataUpdate<'a> {
    expect: &'a PluginDataMap,
    set: &'a PluginDataMap,
}

#[derive(Debug, Serialize)]
struct SetStateRequest<'a> {
    state: RequestState,
    reason: &'a str,
    delegator: &'a str,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms.max(1)))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        // The event feed is long-lived; only connecting is bounded.
        let stream_http = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.request_timeout_ms.max(1)))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            addr: cfg.addr.trim_end_matches('/').to_string(),
            plugin_name: cfg.plugin_name.clone(),
            http,
            stream_http,
        })
    }

    fn plugin_data_url(&self, request_id: &str) -> String {
        format!(
            "{}/v1/plugins/{}/data/{request_id}",
            self.addr, self.plugin_name
        )
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        let response = self
            .http
            .get(format!("{}/v1/ping", self.addr))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        ensure_success(response).await.map(|_| ())
    }

    async fn watch_requests(&self, filter: &WatchFilter) -> Result<WatchStream, WatchError> {
        let mut query = vec![("kind", filter.kind.clone())];
        if let Some(state) = filter.state {
            query.push(("state", state.as_str().to_string()));
        }
        let response = self
            .stream_http
            .get(format!("{}/v1/watch", self.addr))
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .query(&query)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WatchError::Other(format!(
                "watch request returned {status}: {body}"
            )));
        }
        debug!(kind = %filter.kind, "subscribed to event feed");
        Ok(ndjson_events(
            response.bytes_stream(),
            classify_transport_error,
        ))
    }

    async fn get_plugin_data(&self, request_id: &str) -> Result<PluginDataMap, BackendError> {
        let response = self
            .http
            .get(self.plugin_data_url(request_id))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(request_id.to_string()));
        }
        let body: PluginDataResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(body.data)
    }

    async fn update_plugin_data(
        &self,
        request_id: &str,
        expect: &PluginDataMap,
        set: &PluginDataMap,
    ) -> Result<bool, BackendError> {
        let response = self
            .http
            .put(self.plugin_data_url(request_id))
            .json(&PluginDataUpdate { expect, set })
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        match response.status() {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Ok(false),
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(request_id.to_string())),
            _ => ensure_success(response).await.map(|_| true),
        }
    }

    async fn set_request_state(
        &self,
        request_id: &str,
        state: RequestState,
        reason: &str,
        delegator: &str,
    ) -> Result<(), BackendError> {
        let response = self
            .http
            .put(format!("{}/v1/access-requests/{request_id}/state", self.addr))
            .json(&SetStateRequest {
                state,
                reason,
                delegator,
            })
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(request_id.to_string()));
        }
        ensure_success(response).await.map(|_| ())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status { status, body })
}

fn classify_transport_error(err: &reqwest::Error) -> WatchError {
    if err.is_connect() {
        WatchError::ConnectionRefused(err.to_string())
    } else if err.is_body() || err.is_request() || err.is_timeout() {
        WatchError::ConnectionReset(err.to_string())
    } else {
        WatchError::Other(err.to_string())
    }
}

struct NdjsonState<S> {
    body: Pin<Box<S>>,
    buf: Vec<u8>,
    done: bool,
}

pub(crate) fn ndjson_events<S, B, E>(body: S, classify: fn(&E) -> WatchError) -> WatchStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: 'static,
{
    let state = NdjsonState {
        body: Box::pin(body),
        buf: Vec::new(),
        done: false,
    };
    let events = futures_util::stream::unfold(state, move |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = serde_json::from_slice::<WatchEvent>(line)
                    .map_err(|e| WatchError::Other(format!("decode watch event: {e}")));
                return Some((item, st));
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(classify(&err)), st));
                }
                None => {
                    st.done = true;
                    return Some((Err(WatchError::Eof), st));
                }
            }
        }
    });
    Box::pin(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_io(err: &std::io::Error) -> WatchError {
        WatchError::ConnectionReset(err.to_string())
    }

    #[tokio::test]
    async fn splits_events_across_chunk_boundaries() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"{\"type\":\"init\"}\n{\"type\":\"del".to_vec()),
            Ok(b"ete\",\"request_id\":\"req-1\"}\n\n".to_vec()),
        ];
        let mut events = ndjson_events(futures_util::stream::iter(chunks), classify_io);

        assert_eq!(events.next().await.unwrap().unwrap(), WatchEvent::Init);
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            WatchEvent::Delete {
                request_id: "req-1".to_string()
            }
        );
        assert!(matches!(events.next().await, Some(Err(WatchError::Eof))));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn body_errors_are_classified_and_end_the_stream() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ))];
        let mut events = ndjson_events(futures_util::stream::iter(chunks), classify_io);
        assert!(matches!(
            events.next().await,
            Some(Err(WatchError::ConnectionReset(_)))
        ));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn garbage_lines_are_fatal_errors() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(b"not json\n".to_vec())];
        let mut events = ndjson_events(futures_util::stream::iter(chunks), classify_io);
        assert!(matches!(events.next().await, Some(Err(WatchError::Other(_)))));
    }
}
