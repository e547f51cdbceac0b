//! Probe tasks and their results.

use super::{ErrType, Key, Stream};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// One scheduled check of a stream. Consumed by exactly one prober.
#[derive(Debug)]
pub struct Task {
    pub stream: Arc<Stream>,
    /// Task id, unique and increasing for each stream box.
    pub tid: i64,
    pub read_body: bool,
    /// The task must not be executed after this moment.
    pub ttl: DateTime<Utc>,
    pub reply_to: oneshot::Sender<ResultTree>,
}

impl Task {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.ttl
    }
}

/// Index of a result inside a [`ResultTree`].
pub type ResultId = usize;

/// Outcome of a single HTTP check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub uri: String,
    pub err_type: ErrType,
    pub http_code: u16,
    pub http_status: String,
    /// Declared Content-Length, -1 when absent.
    pub content_length: i64,
    pub real_content_length: i64,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
    pub parent: Option<ResultId>,
    pub children: Vec<ResultId>,
}

impl CheckResult {
    pub fn new(uri: &str, started: DateTime<Utc>) -> Self {
        Self {
            uri: uri.to_string(),
            err_type: ErrType::Success,
            http_code: 0,
            http_status: String::new(),
            content_length: -1,
            real_content_length: 0,
            headers: Vec::new(),
            body: Vec::new(),
            started,
            elapsed: Duration::ZERO,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Result that never touched the network.
    pub fn failed(uri: &str, err_type: ErrType) -> Self {
        let mut result = Self::new(uri, Utc::now());
        result.err_type = err_type;
        result
    }

    /// Synthetic result for a task whose deadline has passed.
    pub fn expired(uri: &str) -> Self {
        Self::failed(uri, ErrType::TtlExpired)
    }
}

/// Arena holding a master result and its sub-results.
///
/// Index 0 is always the master; children refer to parents by index.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTree {
    nodes: Vec<CheckResult>,
}

impl ResultTree {
    pub const ROOT: ResultId = 0;

    pub fn new(mut master: CheckResult) -> Self {
        master.parent = None;
        master.children.clear();
        Self { nodes: vec![master] }
    }

    pub fn root(&self) -> &CheckResult {
        &self.nodes[Self::ROOT]
    }

    pub fn root_mut(&mut self) -> &mut CheckResult {
        &mut self.nodes[Self::ROOT]
    }

    /// Attach `child` below `parent` and return its id.
    pub fn push_child(&mut self, parent: ResultId, mut child: CheckResult) -> ResultId {
        let id = self.nodes.len();
        child.parent = Some(parent);
        child.children.clear();
        self.nodes.push(child);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    pub fn get(&self, id: ResultId) -> Option<&CheckResult> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResultId, &CheckResult)> {
        self.nodes.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ResultId, &mut CheckResult)> {
        self.nodes.iter_mut().enumerate()
    }
}

/// Durable projection of a [`CheckResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeptResult {
    /// All results of one task share the task id.
    pub tid: i64,
    #[serde(skip)]
    pub stream_key: Key,
    pub uri: String,
    pub group: String,
    pub name: String,
    pub master: bool,
    pub err_type: ErrType,
    pub http_code: u16,
    pub http_status: String,
    pub content_length: i64,
    pub real_content_length: i64,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
}

impl KeptResult {
    pub fn from_check(stream: &Stream, tid: i64, result: &CheckResult) -> Self {
        Self {
            tid,
            stream_key: stream.key,
            uri: result.uri.clone(),
            group: stream.group.clone(),
            name: stream.name.clone(),
            master: result.parent.is_none(),
            err_type: result.err_type,
            http_code: result.http_code,
            http_status: result.http_status.clone(),
            content_length: result.content_length,
            real_content_length: result.real_content_length,
            headers: result.headers.clone(),
            body: result.body.clone(),
            started: result.started,
            elapsed: result.elapsed,
        }
    }

    /// Raw text of the captured request and response.
    pub fn raw_text(&self) -> String {
        let mut out = format!("GET {}\n\n", self.uri);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }
}
