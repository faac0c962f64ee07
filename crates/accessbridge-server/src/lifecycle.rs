use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {job} failed: {message}")]
    Failed { job: String, message: String },
    #[error("job {job} panicked: {message}")]
    Panicked { job: String, message: String },
    #[error("job {job} did not become ready within {timeout:?}")]
    NotReady { job: String, timeout: Duration },
    #[error("job {0} exited before becoming ready")]
    ExitedEarly(String),
    #[error("{}", JobErrors(.0))]
    Aggregate(Vec<JobError>),
}

impl JobError {
    pub fn failed(job: &str, err: impl fmt::Display) -> Self {
        JobError::Failed {
            job: job.to_string(),
            message: err.to_string(),
        }
    }
}

struct JobErrors<'a>(&'a [JobError]);

impl fmt::Display for JobErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

pub struct JobContext {
    name: String,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
}

impl JobContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mark_ready(&self) {
        if !self.ready.send_replace(true) {
            info!(job = %self.name, "job is ready");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub struct Supervisor {
    cancel: CancellationToken,
    jobs: JoinSet<(String, Result<(), JobError>)>,
    names: HashMap<Id, String>,
    ready: Vec<(String, watch::Receiver<bool>)>,
}

impl Supervisor {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            jobs: JoinSet::new(),
            names: HashMap::new(),
            ready: Vec::new(),
        }
    }

    pub fn spawn<F, Fut>(&mut self, name: &str, job: F)
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let (ready_tx, ready_rx) = watch::channel(false);
        let ctx = JobContext {
            name: name.to_string(),
            cancel: self.cancel.clone(),
            ready: ready_tx,
        };
        let fut = job(ctx);
        let job_name = name.to_string();
        let handle = self.jobs.spawn(async move { (job_name, fut.await) });
        self.names.insert(handle.id(), name.to_string());
        self.ready.push((name.to_string(), ready_rx));
    }

    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), JobError> {
        let deadline = tokio::time::Instant::now() + timeout;
        for (name, rx) in &mut self.ready {
            match tokio::time::timeout_at(deadline, rx.wait_for(|ready| *ready)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(JobError::ExitedEarly(name.clone())),
                Err(_) => {
                    return Err(JobError::NotReady {
                        job: name.clone(),
                        timeout,
                    })
                }
            }
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(mut self) -> Result<(), JobError> {
        let mut errors = Vec::new();
        while let Some(joined) = self.jobs.join_next().await {
            let result = match joined {
                Ok((name, Ok(()))) => {
                    info!(job = %name, "job finished");
                    Ok(())
                }
                Ok((name, Err(err))) => {
                    error!(job = %name, error = %err, "job failed");
                    Err(err)
                }
                Err(join_err) => {
                    let job = self
                        .names
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_default();
                    error!(%job, error = %join_err, "job panicked");
                    Err(JobError::Panicked {
                        job,
                        message: join_err.to_string(),
                    })
                }
            };
            if let Err(err) = result {
                errors.push(err);
            }
            self.cancel.cancel();
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(JobError::Aggregate(errors)),
        }
    }
}
