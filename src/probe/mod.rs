//! Probe module: worker pools executing stream checks.
//!
//! Supports plain HTTP checks (HTTP, HDS, Widevine) and HLS playlist checks.

mod hls;
mod http;

use crate::config::{Group, GroupParams};
use crate::model::{CheckResult, ErrType, ResultTree, Stream, StreamType, Task};

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("task queue of group {0} is closed")]
    QueueClosed(String),
}

/// Executes checks for one group.
pub struct Prober {
    client: reqwest::Client,
    params: Arc<GroupParams>,
    user_agents: Arc<Vec<String>>,
}

impl Prober {
    pub fn new(params: Arc<GroupParams>, user_agents: Arc<Vec<String>>) -> Result<Self, ProbeError> {
        Ok(Self {
            client: http::build_client(&params)?,
            params,
            user_agents,
        })
    }

    /// Run the check matching the stream type.
    pub async fn check(&self, stream: &Stream, read_body: bool) -> ResultTree {
        match stream.stream_type {
            StreamType::Hls => self.exec_hls(&stream.uri).await,
            _ => ResultTree::new(self.exec_http(&stream.uri, read_body).await),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requested: AtomicU64,
    executed: AtomicU64,
    expired: AtomicU64,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub group: String,
    pub probers: usize,
    pub requested: u64,
    pub executed: u64,
    pub expired: u64,
}

/// Submitting side of a pool, cloned into every stream box of the group.
#[derive(Clone)]
pub struct TaskQueue {
    group: Arc<str>,
    tx: flume::Sender<Task>,
    counters: Arc<Counters>,
}

impl TaskQueue {
    pub fn submit(&self, task: Task) -> Result<(), ProbeError> {
        self.tx
            .send(task)
            .map_err(|_| ProbeError::QueueClosed(self.group.to_string()))?;
        self.counters.requested.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
impl TaskQueue {
    /// Queue with no workers; tasks land in the returned receiver.
    pub(crate) fn detached(group: &str) -> (Self, flume::Receiver<Task>) {
        let (tx, rx) = flume::unbounded();
        let queue = Self {
            group: Arc::from(group),
            tx,
            counters: Arc::new(Counters::default()),
        };
        (queue, rx)
    }
}

/// Fixed set of workers sharing one task queue.
pub struct ProberPool {
    probers: usize,
    queue: TaskQueue,
}

impl ProberPool {
    /// Spawn `group.params.probers` workers.
    pub fn spawn(group: &Group, user_agents: Arc<Vec<String>>) -> Result<Self, ProbeError> {
        let prober = Arc::new(Prober::new(group.params.clone(), user_agents)?);
        let (tx, rx) = flume::unbounded();
        let counters = Arc::new(Counters::default());
        let probers = group.params.probers.max(1);

        for worker in 0..probers {
            tokio::spawn(run_worker(worker, group.name.clone(), prober.clone(), rx.clone(), counters.clone()));
        }
        tracing::info!("ProberPool: started {} probers for group {}", probers, group.name);

        Ok(Self {
            probers,
            queue: TaskQueue {
                group: Arc::from(group.name.as_str()),
                tx,
                counters,
            },
        })
    }

    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.queue.counters;
        PoolStats {
            group: self.queue.group.to_string(),
            probers: self.probers,
            requested: c.requested.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    worker: usize,
    group: String,
    prober: Arc<Prober>,
    rx: flume::Receiver<Task>,
    counters: Arc<Counters>,
) {
    while let Ok(task) = rx.recv_async().await {
        let tree = if task.is_expired(Utc::now()) {
            counters.expired.fetch_add(1, Ordering::Relaxed);
            ResultTree::new(CheckResult::expired(&task.stream.uri))
        } else {
            let prober = prober.clone();
            let stream = task.stream.clone();
            let read_body = task.read_body;
            let tree = contained(&task.stream.uri, async move { prober.check(&stream, read_body).await }).await;
            counters.executed.fetch_add(1, Ordering::Relaxed);
            tree
        };

        if task.reply_to.send(tree).is_err() {
            tracing::debug!("Prober {}/{}: reply for task {} dropped", group, worker, task.tid);
        }
    }
    tracing::debug!("Prober {}/{}: queue closed", group, worker);
}

/// Run a check in its own task so that a panic becomes a `BadRequest` result.
async fn contained<F>(uri: &str, check: F) -> ResultTree
where
    F: Future<Output = ResultTree> + Send + 'static,
{
    match tokio::spawn(check).await {
        Ok(tree) => tree,
        Err(e) => {
            tracing::error!("Probe: check of {} aborted: {}", uri, e);
            ResultTree::new(CheckResult::failed(uri, ErrType::BadRequest))
        }
    }
}
