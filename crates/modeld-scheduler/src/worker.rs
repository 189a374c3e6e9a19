//! Job worker loop

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use modeld_core::{ModeldError, ModeldResult};
use modeld_network::{Job, JobFunc, JobQueue};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, RunRequest};

/// Pull jobs from `queue` until it closes or `shutdown` resolves, running at
/// most `max_inflight` at a time. Returns once in-flight jobs have finished.
pub async fn serve<Q, S>(queue: Arc<Q>, dispatcher: Dispatcher, max_inflight: usize, shutdown: S)
where
    Q: JobQueue + ?Sized,
    S: Future<Output = ()>,
{
    let max_inflight = max_inflight.max(1);
    let permits = Arc::new(Semaphore::new(max_inflight));
    tokio::pin!(shutdown);

    info!(max_inflight = max_inflight, "Job worker started");

    loop {
        let permit = tokio::select! {
            _ = &mut shutdown => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = tokio::select! {
            _ = &mut shutdown => break,
            job = queue.receive() => job,
        };
        let Some(job) = job else {
            info!("Job queue closed");
            break;
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process(&dispatcher, job).await;
        });
    }

    // Wait for in-flight jobs.
    if permits.acquire_many(max_inflight as u32).await.is_err() {
        warn!("Worker semaphore closed while draining");
    }
    info!("Job worker stopped");
}

/// Execute one job and send its reply
pub async fn process(dispatcher: &Dispatcher, job: Job) {
    let started = Instant::now();
    let (id, func) = (job.id(), job.func());
    let name = job.name().to_string();

    match execute(dispatcher, func, &name, job.payload()).await {
        Ok(output) => {
            debug!(
                job_id = %id,
                func = %func,
                name = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job done"
            );
            job.respond(output);
        }
        Err(e) => {
            warn!(
                job_id = %id,
                func = %func,
                name = %name,
                error = %e,
                "Job failed"
            );
            job.fail(&e);
        }
    }
}

/// Map a job function and payload onto a dispatcher operation
pub async fn execute(
    dispatcher: &Dispatcher,
    func: JobFunc,
    name: &str,
    payload: &[u8],
) -> ModeldResult<Vec<u8>> {
    match func {
        JobFunc::Run => {
            let request: RunRequest = parse_json(payload)?;
            let output = dispatcher.handle(name, request).await?;
            Ok(serde_json::to_vec(&output)?)
        }
        JobFunc::SaveModel => {
            let meta = dispatcher.save(name).await?;
            Ok(serde_json::to_vec(&meta)?)
        }
        JobFunc::SaveModels => {
            let report = dispatcher.flush_all().await?;
            Ok(serde_json::to_vec(&report)?)
        }
        JobFunc::SaveEvicted => {
            let report = dispatcher.flush_evicted().await?;
            Ok(serde_json::to_vec(&report)?)
        }
        JobFunc::ResetModel => {
            let params = if payload.iter().all(|b| b.is_ascii_whitespace()) {
                None
            } else {
                match parse_json::<Value>(payload)? {
                    Value::Null => None,
                    Value::Object(mut map) if map.contains_key("parameters") => {
                        map.remove("parameters").filter(|p| !p.is_null())
                    }
                    params => Some(params),
                }
            };
            dispatcher.reset_entity(name, params).await?;
            Ok(serde_json::to_vec(&json!({ "reset": name }))?)
        }
        JobFunc::SetSaveDelay => {
            let value: Value = parse_json(payload)?;
            let secs = value
                .get("save_delay")
                .unwrap_or(&value)
                .as_u64()
                .ok_or_else(|| {
                    ModeldError::InvalidRequest(format!(
                        "save delay must be a non-negative integer, got {}",
                        value
                    ))
                })?;
            dispatcher.set_save_delay(name, secs).await?;
            Ok(serde_json::to_vec(&json!({ "name": name, "save_delay": secs }))?)
        }
        JobFunc::GetModel => dispatcher.get_snapshot(name).await,
        JobFunc::PutModel => {
            let meta = dispatcher.put_snapshot(name, payload.to_vec()).await?;
            Ok(serde_json::to_vec(&meta)?)
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> ModeldResult<T> {
    serde_json::from_slice(payload)
        .map_err(|e| ModeldError::InvalidRequest(format!("malformed payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use modeld_core::{FlushMode, WorkerConfig};
    use modeld_network::{MemoryQueue, QueueClient};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    async fn start(
        tmp: &TempDir,
    ) -> (QueueClient, Dispatcher, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let mut config = WorkerConfig::default();
        config.storage.checkpoint_root = tmp.path().join("models");
        config.cache.capacity = 2;
        config.cache.flush_mode = FlushMode::Inline;
        config.dispatcher.default_model = "counter".to_string();

        let dispatcher = Dispatcher::from_config(&config).unwrap();
        dispatcher.store().init().await.unwrap();

        let (queue, client) = MemoryQueue::new(16, Duration::from_secs(5));
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve(
            Arc::new(queue),
            dispatcher.clone(),
            4,
            async move {
                let _ = stopped.await;
            },
        ));
        (client, dispatcher, stop, handle)
    }

    fn json_reply(bytes: Vec<u8>) -> Value {
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_run_jobs() {
        let tmp = TempDir::new().unwrap();
        let (client, _dispatcher, stop, handle) = start(&tmp).await;

        let payload = br#"{"input": 2}"#.to_vec();
        let out = client.submit(JobFunc::Run, "x", payload.clone()).await;
        assert_eq!(json_reply(out.unwrap())["sum"], 2.0);
        let out = client.submit(JobFunc::Run, "x", payload).await;
        assert_eq!(json_reply(out.unwrap())["count"], 2);

        let failure = client
            .submit(JobFunc::Run, "x", b"{oops".to_vec())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, "invalid_request");

        stop.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_jobs() {
        let tmp = TempDir::new().unwrap();
        let (client, dispatcher, stop, handle) = start(&tmp).await;

        let failure = client
            .submit(JobFunc::GetModel, "x", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, "not_found");

        client.submit(JobFunc::Run, "x", b"{}".to_vec()).await.unwrap();
        let reply = client
            .submit(JobFunc::SetSaveDelay, "x", br#"{"save_delay": 15}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(json_reply(reply)["save_delay"], 15);

        let meta = client
            .submit(JobFunc::SaveModel, "x", Vec::new())
            .await
            .unwrap();
        assert_eq!(json_reply(meta)["entity"], "x");

        let snapshot = client
            .submit(JobFunc::GetModel, "x", Vec::new())
            .await
            .unwrap();
        client
            .submit(JobFunc::PutModel, "y", snapshot)
            .await
            .unwrap();
        let out = client.submit(JobFunc::Run, "y", b"{}".to_vec()).await;
        assert_eq!(json_reply(out.unwrap())["count"], 2);

        let report = client
            .submit(JobFunc::SaveModels, "", Vec::new())
            .await
            .unwrap();
        assert_eq!(json_reply(report)["flushed"], json!(["y"]));

        client
            .submit(JobFunc::ResetModel, "x", br#"{"parameters": {"start": 5}}"#.to_vec())
            .await
            .unwrap();
        let out = client.submit(JobFunc::Run, "x", b"{}".to_vec()).await;
        assert_eq!(json_reply(out.unwrap())["count"], 6);

        client
            .submit(JobFunc::SaveEvicted, "", Vec::new())
            .await
            .unwrap();
        assert!(dispatcher.status().await.unwrap().pending.is_empty());

        stop.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_queue_closes() {
        let tmp = TempDir::new().unwrap();
        let (client, _dispatcher, _stop, handle) = start(&tmp).await;
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
