//! Job queue contract and in-process queue
//!
//! The worker pulls [`Job`]s from a [`JobQueue`] and answers each one exactly
//! once, with `respond` or `fail`. [`MemoryQueue`] is a bounded tokio channel
//! with a oneshot reply per job; [`QueueClient`] is its producer side.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use modeld_core::{ModeldError, ModeldResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Job function names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFunc {
    /// Run one input through an entity's model
    Run,
    /// Snapshot one entity
    SaveModel,
    /// Snapshot every dirty resident entity
    SaveModels,
    /// Write back evicted entities
    SaveEvicted,
    /// Drop an entity's state, optionally replacing its parameters
    ResetModel,
    /// Change an entity's auto-save delay
    SetSaveDelay,
    /// Fetch an entity's snapshot bytes
    GetModel,
    /// Install snapshot bytes for an entity
    PutModel,
}

impl JobFunc {
    pub const ALL: [JobFunc; 8] = [
        JobFunc::Run,
        JobFunc::SaveModel,
        JobFunc::SaveModels,
        JobFunc::SaveEvicted,
        JobFunc::ResetModel,
        JobFunc::SetSaveDelay,
        JobFunc::GetModel,
        JobFunc::PutModel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobFunc::Run => "run",
            JobFunc::SaveModel => "save_model",
            JobFunc::SaveModels => "save_models",
            JobFunc::SaveEvicted => "save_evicted",
            JobFunc::ResetModel => "reset_model",
            JobFunc::SetSaveDelay => "set_save_delay",
            JobFunc::GetModel => "get_model",
            JobFunc::PutModel => "put_model",
        }
    }

    /// Whether the job targets a single entity name
    pub fn is_entity_scoped(&self) -> bool {
        !matches!(self, JobFunc::SaveModels | JobFunc::SaveEvicted)
    }
}

impl fmt::Display for JobFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobFunc {
    type Err = ModeldError;

    fn from_str(s: &str) -> ModeldResult<Self> {
        JobFunc::ALL
            .into_iter()
            .find(|func| func.as_str() == s)
            .ok_or_else(|| ModeldError::InvalidRequest(format!("unknown job function '{}'", s)))
    }
}

/// Why a job failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    /// `ModeldError::kind` tag, or `timeout` / `unavailable` from the client
    pub kind: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

impl From<&ModeldError> for JobFailure {
    fn from(err: &ModeldError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Reply sent back to the submitter
pub type JobReply = Result<Vec<u8>, JobFailure>;

/// A unit of work pulled from a queue
pub struct Job {
    id: Uuid,
    func: JobFunc,
    name: String,
    payload: Vec<u8>,
    reply: oneshot::Sender<JobReply>,
}

impl Job {
    /// Create a job and the receiver its reply arrives on
    pub fn new(
        func: JobFunc,
        name: impl Into<String>,
        payload: Vec<u8>,
    ) -> (Self, oneshot::Receiver<JobReply>) {
        let (reply, rx) = oneshot::channel();
        let job = Self {
            id: Uuid::new_v4(),
            func,
            name: name.into(),
            payload,
            reply,
        };
        (job, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn func(&self) -> JobFunc {
        self.func
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Complete the job with `output`
    pub fn respond(self, output: Vec<u8>) {
        self.send(Ok(output));
    }

    /// Fail the job with `error`
    pub fn fail(self, error: &ModeldError) {
        self.send(Err(JobFailure::from(error)));
    }

    fn send(self, reply: JobReply) {
        if self.reply.send(reply).is_err() {
            debug!(job_id = %self.id, func = %self.func, "Submitter went away before the reply");
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("func", &self.func)
            .field("name", &self.name)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Source of jobs for the worker loop
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Next job, or `None` once the queue is closed and drained
    async fn receive(&self) -> Option<Job>;
}

/// Bounded in-process queue
pub struct MemoryQueue {
    rx: Mutex<mpsc::Receiver<Job>>,
}

impl MemoryQueue {
    /// Create a queue holding up to `depth` jobs, with a client whose
    /// submissions wait at most `timeout` for a reply
    pub fn new(depth: usize, timeout: Duration) -> (Self, QueueClient) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (
            Self { rx: Mutex::new(rx) },
            QueueClient { tx, timeout },
        )
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn receive(&self) -> Option<Job> {
        self.rx.lock().await.recv().await
    }
}

/// Producer side of a [`MemoryQueue`]
#[derive(Clone)]
pub struct QueueClient {
    tx: mpsc::Sender<Job>,
    timeout: Duration,
}

impl QueueClient {
    /// Submit a job and wait for its reply
    pub async fn submit(
        &self,
        func: JobFunc,
        name: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, JobFailure> {
        let (job, rx) = Job::new(func, name, payload);
        let id = job.id();
        debug!(job_id = %id, func = %func, name = name, "Submitting job");

        self.tx
            .send(job)
            .await
            .map_err(|_| JobFailure::new("unavailable", "job queue is closed"))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(JobFailure::new(
                "internal",
                format!("job {} was dropped without a reply", id),
            )),
            Err(_) => {
                warn!(job_id = %id, func = %func, name = name, "Job timed out");
                Err(JobFailure::new(
                    "timeout",
                    format!("no reply within {}s", self.timeout.as_secs()),
                ))
            }
        }
    }

    /// Whether the worker side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_func_names() {
        for func in JobFunc::ALL {
            assert_eq!(func.as_str().parse::<JobFunc>().unwrap(), func);
        }
        assert!("run-hotgym".parse::<JobFunc>().is_err());
        assert_eq!(
            serde_json::to_string(&JobFunc::SaveEvicted).unwrap(),
            "\"save_evicted\""
        );
        assert!(!JobFunc::SaveModels.is_entity_scoped());
        assert!(JobFunc::Run.is_entity_scoped());
    }

    #[tokio::test]
    async fn test_submit_and_respond() {
        let (queue, client) = MemoryQueue::new(4, Duration::from_secs(5));

        let worker = tokio::spawn(async move {
            let job = queue.receive().await.unwrap();
            assert_eq!(job.func(), JobFunc::Run);
            assert_eq!(job.name(), "cpu");
            let echo = job.payload().to_vec();
            job.respond(echo);
        });

        let reply = client.submit(JobFunc::Run, "cpu", b"42".to_vec()).await;
        assert_eq!(reply.unwrap(), b"42");
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_carries_error_kind() {
        let (queue, client) = MemoryQueue::new(4, Duration::from_secs(5));

        tokio::spawn(async move {
            let job = queue.receive().await.unwrap();
            job.fail(&ModeldError::NotFound("cpu".to_string()));
        });

        let failure = client
            .submit(JobFunc::GetModel, "cpu", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, "not_found");
        assert!(failure.message.contains("cpu"));
    }

    #[tokio::test]
    async fn test_timeout_and_closed() {
        let (queue, client) = MemoryQueue::new(4, Duration::from_millis(20));
        let failure = client
            .submit(JobFunc::SaveModels, "", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, "timeout");

        drop(queue);
        assert!(client.is_closed());
        let failure = client
            .submit(JobFunc::SaveModels, "", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, "unavailable");
    }

    #[tokio::test]
    async fn test_dropped_job() {
        let (queue, client) = MemoryQueue::new(4, Duration::from_secs(5));
        tokio::spawn(async move {
            let job = queue.receive().await.unwrap();
            drop(job);
        });
        let failure = client
            .submit(JobFunc::Run, "cpu", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, "internal");
    }
}
