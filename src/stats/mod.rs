//! Stats keeper: owner of the latest per-stream stats and sole user of the store.
//!
//! Every caller talks to the keeper through a [`StatsHandle`]. Requests are
//! served one at a time in arrival order, so a load issued after a save sees
//! the saved data.

use crate::db::{DbError, Store};
use crate::model::{CheckPoint, CheckResult, ErrType, Key, KeptResult, Report, Stats, Stream};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Stats keeper error types.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StatsError {
    #[error("no data found")]
    NotFound,
    #[error("stats keeper is not running")]
    Closed,
}

pub(crate) enum Request {
    SaveStats {
        key: Key,
        stats: Stats,
    },
    LoadStats {
        key: Key,
        reply: oneshot::Sender<Stats>,
    },
    SaveResult {
        result: KeptResult,
    },
    LoadLastResult {
        key: Key,
        reply: oneshot::Sender<Result<Vec<KeptResult>, StatsError>>,
    },
    LoadResults {
        key: Key,
        from: DateTime<Utc>,
        reply: oneshot::Sender<Result<Vec<KeptResult>, StatsError>>,
    },
    LoadErrors {
        key: Key,
        lookback: Duration,
        reply: oneshot::Sender<Result<BTreeMap<DateTime<Utc>, ErrType>, StatsError>>,
    },
    SaveCheckpoint {
        key: Key,
        checkpoint: CheckPoint,
    },
    LoadCheckpoint {
        key: Key,
        reply: oneshot::Sender<Option<CheckPoint>>,
    },
    SaveReport {
        report: Report,
        reply: oneshot::Sender<bool>,
    },
    LoadReports {
        reply: oneshot::Sender<Vec<Report>>,
    },
}

/// Cloneable client of the stats keeper.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl StatsHandle {
    fn send(&self, req: Request) -> Result<(), StatsError> {
        self.tx.send(req).map_err(|_| StatsError::Closed)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, StatsError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| StatsError::Closed)
    }

    pub fn save_stats(&self, key: Key, stats: Stats) {
        if self.send(Request::SaveStats { key, stats }).is_err() {
            tracing::debug!("StatKeeper: dropped stats for {:?}", key);
        }
    }

    /// Last saved stats of a stream, or zeroed stats.
    pub async fn load_stats(&self, key: Key) -> Stats {
        self.ask(|reply| Request::LoadStats { key, reply })
            .await
            .unwrap_or_default()
    }

    pub fn save_result(&self, stream: &Stream, tid: i64, result: &CheckResult) {
        let result = KeptResult::from_check(stream, tid, result);
        if self.send(Request::SaveResult { result }).is_err() {
            tracing::debug!("StatKeeper: dropped result for {}", stream.uri);
        }
    }

    /// All results of the latest task of a stream.
    pub async fn load_last_result(&self, key: Key) -> Result<Vec<KeptResult>, StatsError> {
        self.ask(|reply| Request::LoadLastResult { key, reply }).await?
    }

    /// Whole retained history of a stream, oldest first.
    pub async fn load_history_results(&self, key: Key) -> Result<Vec<KeptResult>, StatsError> {
        self.load_results_since(key, DateTime::<Utc>::UNIX_EPOCH).await
    }

    pub async fn load_results_since(&self, key: Key, from: DateTime<Utc>) -> Result<Vec<KeptResult>, StatsError> {
        self.ask(|reply| Request::LoadResults { key, from, reply }).await?
    }

    /// Error entries of the last `lookback`.
    pub async fn load_history_errors(
        &self,
        key: Key,
        lookback: Duration,
    ) -> Result<BTreeMap<DateTime<Utc>, ErrType>, StatsError> {
        self.ask(|reply| Request::LoadErrors { key, lookback, reply }).await?
    }

    pub fn save_checkpoint(&self, key: Key, checkpoint: CheckPoint) {
        if self.send(Request::SaveCheckpoint { key, checkpoint }).is_err() {
            tracing::debug!("StatKeeper: dropped checkpoint for {:?}", key);
        }
    }

    pub async fn load_checkpoint(&self, key: Key) -> Result<Option<CheckPoint>, StatsError> {
        self.ask(|reply| Request::LoadCheckpoint { key, reply }).await
    }

    /// Returns true when the report was not stored before.
    pub async fn save_report(&self, report: Report) -> Result<bool, StatsError> {
        self.ask(|reply| Request::SaveReport { report, reply }).await
    }

    pub async fn load_reports(&self) -> Result<Vec<Report>, StatsError> {
        self.ask(|reply| Request::LoadReports { reply }).await
    }
}

/// The actor behind [`StatsHandle`].
pub struct StatKeeper {
    store: Store,
    retention: Duration,
    stats: HashMap<Key, Stats>,
    rx: mpsc::UnboundedReceiver<Request>,
}

impl StatKeeper {
    /// Spawn the keeper task. It stops when every handle is dropped.
    pub fn spawn(store: Store, retention: Duration) -> StatsHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let keeper = Self {
            store,
            retention,
            stats: HashMap::new(),
            rx,
        };
        tokio::spawn(keeper.run());
        StatsHandle { tx }
    }

    async fn run(mut self) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = self.rx.recv() => match req {
                    Some(req) => self.handle(req),
                    None => break,
                },
                _ = housekeeping.tick() => self.remove_expired(),
            }
        }
        tracing::info!("StatKeeper: stopped");
    }

    fn handle(&mut self, req: Request) {
        match req {
            Request::SaveStats { key, stats } => {
                self.stats.insert(key, stats);
            }
            Request::LoadStats { key, reply } => {
                let _ = reply.send(self.stats.get(&key).cloned().unwrap_or_default());
            }
            Request::SaveResult { result } => self.keep(&result),
            Request::LoadLastResult { key, reply } => {
                let last = self.results(&key, DateTime::<Utc>::UNIX_EPOCH).map(|mut results| {
                    let tid = results.iter().map(|r| r.tid).max().unwrap_or_default();
                    results.retain(|r| r.tid == tid);
                    results
                });
                let _ = reply.send(last);
            }
            Request::LoadResults { key, from, reply } => {
                let _ = reply.send(self.results(&key, from));
            }
            Request::LoadErrors { key, lookback, reply } => {
                let to = Utc::now();
                let from = chrono::Duration::from_std(lookback)
                    .ok()
                    .and_then(|d| to.checked_sub_signed(d))
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                let _ = reply.send(self.store.load_errors(&key, from, to).map_err(not_found("errors")));
            }
            Request::SaveCheckpoint { key, checkpoint } => {
                if let Err(e) = self.store.save_checkpoint(&key, &checkpoint) {
                    tracing::error!("StatKeeper: failed to save checkpoint for {:?}: {}", key, e);
                }
            }
            Request::LoadCheckpoint { key, reply } => {
                let checkpoint = self.store.load_checkpoint(&key).unwrap_or_else(|e| {
                    tracing::error!("StatKeeper: failed to load checkpoint for {:?}: {}", key, e);
                    None
                });
                let _ = reply.send(checkpoint);
            }
            Request::SaveReport { report, reply } => {
                let stored = self.store.save_report(&report).unwrap_or_else(|e| {
                    tracing::error!("StatKeeper: failed to save report for {}: {}", report.stream_name, e);
                    false
                });
                let _ = reply.send(stored);
            }
            Request::LoadReports { reply } => {
                let reports = self.store.load_reports().unwrap_or_else(|e| {
                    tracing::error!("StatKeeper: failed to load reports: {}", e);
                    Vec::new()
                });
                let _ = reply.send(reports);
            }
        }
    }

    fn keep(&self, result: &KeptResult) {
        let key = result.stream_key;
        if let Err(e) = self.store.keep_result(&key, result.started, result) {
            tracing::error!("StatKeeper: failed to keep result of {}: {}", result.uri, e);
        }
        if result.err_type.is_warning() {
            if let Err(e) = self.store.keep_error(&key, result.started, result.err_type) {
                tracing::error!("StatKeeper: failed to keep error of {}: {}", result.uri, e);
            }
        }
    }

    fn results(&self, key: &Key, from: DateTime<Utc>) -> Result<Vec<KeptResult>, StatsError> {
        self.store
            .load_results(key, from, Utc::now())
            .map_err(not_found("results"))
    }

    fn remove_expired(&self) {
        match self.store.remove_expired_results(self.retention) {
            Ok(0) => {}
            Ok(n) => tracing::info!("StatKeeper: removed {} expired results", n),
            Err(e) => tracing::error!("StatKeeper: failed to remove expired results: {}", e),
        }
        match self.store.remove_expired_errors(self.retention) {
            Ok(0) => {}
            Ok(n) => tracing::info!("StatKeeper: removed {} expired errors", n),
            Err(e) => tracing::error!("StatKeeper: failed to remove expired errors: {}", e),
        }
    }
}

fn not_found(what: &'static str) -> impl Fn(DbError) -> StatsError {
    move |e| {
        if !matches!(e, DbError::NotFound) {
            tracing::error!("StatKeeper: failed to load {}: {}", what, e);
        }
        StatsError::NotFound
    }
}

#[cfg(test)]
impl StatsHandle {
    /// Handle whose requests land in the returned receiver.
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[cfg(test)]
impl Request {
    /// Kept result carried by a save request.
    pub(crate) fn saved_result(&self) -> Option<&KeptResult> {
        match self {
            Request::SaveResult { result } => Some(result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrRange, Severity, StreamType};
    use crate::test_support::stream;
    use tempfile::NamedTempFile;

    fn keeper() -> (NamedTempFile, StatsHandle) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, StatKeeper::spawn(store, Duration::from_secs(24 * 3600)))
    }

    fn check(uri: &str, err: ErrType) -> CheckResult {
        let mut r = CheckResult::new(uri, Utc::now());
        r.err_type = err;
        r
    }

    #[tokio::test]
    async fn test_unknown_key_not_found() {
        let (_tmp, stats) = keeper();
        let key = Key::of("http://unknown/");
        assert_eq!(stats.load_history_results(key).await, Err(StatsError::NotFound));
        assert_eq!(stats.load_last_result(key).await, Err(StatsError::NotFound));
        assert_eq!(
            stats.load_history_errors(key, Duration::from_secs(3600)).await,
            Err(StatsError::NotFound)
        );
        assert_eq!(stats.load_stats(key).await, Stats::default());
    }

    #[tokio::test]
    async fn test_stats_upsert() {
        let (_tmp, stats) = keeper();
        let key = Key::of("http://a/");
        stats.save_stats(key, Stats { checks: 1, ..Default::default() });
        stats.save_stats(key, Stats { checks: 2, errors: 1, ..Default::default() });
        let loaded = stats.load_stats(key).await;
        assert_eq!(loaded.checks, 2);
        assert_eq!(loaded.errors, 1);
    }

    #[tokio::test]
    async fn test_error_entries_only_above_warning() {
        let (_tmp, stats) = keeper();
        let s = stream("http://a/index.m3u8", StreamType::Hls);

        stats.save_result(&s, 1, &check(&s.uri, ErrType::Success));
        stats.save_result(&s, 2, &check(&s.uri, ErrType::BadRequest));
        assert_eq!(
            stats.load_history_errors(s.key, Duration::from_secs(3600)).await,
            Err(StatsError::NotFound)
        );

        stats.save_result(&s, 3, &check(&s.uri, ErrType::Slow));
        stats.save_result(&s, 4, &check("http://a/low.m3u8", ErrType::BadStatus));
        let errors = stats.load_history_errors(s.key, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(errors.values().copied().collect::<Vec<_>>(), vec![ErrType::Slow, ErrType::BadStatus]);

        let history = stats.load_history_results(s.key).await.unwrap();
        assert_eq!(history.len(), 4);
        let last = stats.load_last_result(s.key).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].tid, 4);
    }

    #[tokio::test]
    async fn test_checkpoints_and_reports() {
        let (_tmp, stats) = keeper();
        let key = Key::of("http://a/");
        assert_eq!(stats.load_checkpoint(key).await, Ok(None));

        let checkpoint = CheckPoint::starting_at(Utc::now());
        stats.save_checkpoint(key, checkpoint.clone());
        assert_eq!(stats.load_checkpoint(key).await, Ok(Some(checkpoint)));

        let now = Utc::now();
        let report = Report {
            stream_key: key,
            group: "g".into(),
            stream_name: "a".into(),
            title: "a".into(),
            body: "down".into(),
            error: ErrType::Refused,
            severity: Severity::Critical,
            range: ErrRange {
                from_tid: 1,
                to_tid: 3,
                occured: now,
                discontinued: now,
                err: ErrType::Refused,
            },
            ongoing: false,
            generated: now,
        };
        assert_eq!(stats.save_report(report.clone()).await, Ok(true));
        assert_eq!(stats.save_report(report).await, Ok(false));
        assert_eq!(stats.load_reports().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_keeper() {
        let (handle, rx) = StatsHandle::detached();
        drop(rx);
        assert_eq!(handle.load_reports().await, Err(StatsError::Closed));
        assert_eq!(handle.load_stats(Key::of("x")).await, Stats::default());
    }
}
