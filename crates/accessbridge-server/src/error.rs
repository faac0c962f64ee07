use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode backend response failed: {0}")]
    Decode(String),
    #[error("access request {0} not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher is not ready: no init event within {0:?}")]
    NotReady(Duration),
    #[error("event stream connection refused: {0}")]
    ConnectionRefused(String),
    #[error("event stream connection reset: {0}")]
    ConnectionReset(String),
    #[error("event stream ended")]
    Eof,
    #[error("watch cancelled")]
    Cancelled,
    #[error("event stream failed: {0}")]
    Other(String),
}

impl WatchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WatchError::ConnectionRefused(_) | WatchError::ConnectionReset(_) | WatchError::Eof
        )
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("ticket system returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("ticket system request failed: {0}")]
    Transport(String),
    #[error("decode ticket system response failed: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket {0} does not exist")]
    NoBucket(String),
    #[error("local store failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("local store value for {key} is invalid: {value}")]
    Encoding { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("plugin data of {request_id} kept changing after {attempts} update attempts")]
    ConflictRetriesExhausted { request_id: String, attempts: usize },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Multiple(#[from] MultiError),
}

impl EngineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub struct MultiError(pub Vec<EngineError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.0.len())?;
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl MultiError {
    pub fn collect<I>(results: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Result<(), EngineError>>,
    {
        let mut errors: Vec<EngineError> =
            results.into_iter().filter_map(Result::err).collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(EngineError::Multiple(MultiError(errors))),
        }
    }
}
