use std::sync::Arc;
use std::time::{Duration, Instant};

use accessbridge_contracts::{PluginData, TicketIdentity};
use accessbridge_kernel::decorrelated_backoff;
use tracing::debug;

use crate::backend::Backend;
use crate::error::EngineError;

const CAS_BASE_DELAY: Duration = Duration::from_millis(1);
const CAS_MAX_DELAY: Duration = Duration::from_secs(1);
const CAS_MAX_ATTEMPTS: usize = 10;
const CAS_BUDGET: Duration = Duration::from_secs(5);

pub struct PluginDataStore<B> {
    backend: Arc<B>,
}

impl<B> Clone for PluginDataStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> PluginDataStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub async fn get_plugin_data<T: TicketIdentity>(
        &self,
        request_id: &str,
    ) -> Result<Option<PluginData<T>>, EngineError> {
        let map = self.backend.get_plugin_data(request_id).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(PluginData::decode(&map)))
    }

    // modify may run several times; returns whether our write landed.
    pub async fn modify_plugin_data<T, F>(
        &self,
        request_id: &str,
        mut modify: F,
    ) -> Result<bool, EngineError>
    where
        T: TicketIdentity,
        F: FnMut(Option<&PluginData<T>>) -> Option<PluginData<T>> + Send,
    {
        let started = Instant::now();
        let mut delay = CAS_BASE_DELAY;
        let mut attempts = 0;
        for attempt in 1..=CAS_MAX_ATTEMPTS {
            attempts = attempt;
            let expect = self.backend.get_plugin_data(request_id).await?;
            let current = if expect.is_empty() {
                None
            } else {
                Some(PluginData::<T>::decode(&expect))
            };
            let Some(next) = modify(current.as_ref()) else {
                return Ok(false);
            };
            let set = next.encode();
            if self
                .backend
                .update_plugin_data(request_id, &expect, &set)
                .await?
            {
                return Ok(true);
            }

            debug!(request_id, attempt, "plugin data changed concurrently, retrying");
            if attempt == CAS_MAX_ATTEMPTS || started.elapsed() + delay > CAS_BUDGET {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = decorrelated_backoff(delay, CAS_BASE_DELAY, CAS_MAX_DELAY);
        }
        Err(EngineError::ConflictRetriesExhausted {
            request_id: request_id.to_string(),
            attempts,
        })
    }
}
