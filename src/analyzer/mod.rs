//! Problem analyzer: turns check history into error ranges and reports.

mod hls;

use crate::config::MonitorConfig;
use crate::model::{CheckPoint, ErrRange, Key, KeptResult, Report, Stream, StreamType};
use crate::stats::{StatsError, StatsHandle};

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const ANALYZE_INTERVAL: Duration = Duration::from_secs(10);

/// Ranges longer than this are reported as permanent errors.
fn permanent_error_duration() -> ChronoDuration {
    ChronoDuration::minutes(10)
}

/// How far back a stream without a checkpoint is analyzed.
fn initial_lookback() -> ChronoDuration {
    ChronoDuration::hours(2)
}

/// Output of a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Found ranges with their ongoing flag.
    pub ranges: Vec<(ErrRange, bool)>,
    pub checkpoint: CheckPoint,
}

/// Run the detector for `stream_type`.
pub fn detect(stream_type: StreamType, history: &[KeptResult], checkpoint: &CheckPoint) -> Detection {
    match stream_type {
        StreamType::Hls => hls::detect(history, checkpoint),
        _ => Detection {
            ranges: Vec::new(),
            checkpoint: checkpoint.clone(),
        },
    }
}

pub fn is_permanent(range: &ErrRange) -> bool {
    range.duration() > permanent_error_duration()
}

fn report(stream: &Stream, range: ErrRange, ongoing: bool) -> Report {
    let minutes = range.duration().num_minutes();
    let body = format!(
        "{} for {} min, from {} to {}{} (tasks {}..{})",
        range.err.describe(),
        minutes,
        range.occured.format("%Y-%m-%d %H:%M:%S"),
        range.discontinued.format("%Y-%m-%d %H:%M:%S"),
        if ongoing { " and ongoing" } else { "" },
        range.from_tid,
        range.to_tid,
    );
    Report {
        stream_key: stream.key,
        group: stream.group.clone(),
        stream_name: stream.name.clone(),
        title: stream.title.clone(),
        body,
        error: range.err,
        severity: range.err.severity(),
        range,
        ongoing,
        generated: Utc::now(),
    }
}

/// Periodic analysis of every configured stream.
pub struct ProblemAnalyzer {
    config: Arc<MonitorConfig>,
    stats: StatsHandle,
    checkpoints: HashMap<Key, CheckPoint>,
}

impl ProblemAnalyzer {
    pub fn new(config: Arc<MonitorConfig>, stats: StatsHandle) -> Self {
        Self {
            config,
            stats,
            checkpoints: HashMap::new(),
        }
    }

    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(ANALYZE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.analyze_all().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("ProblemAnalyzer: {} new reports", n),
                Err(e) => {
                    tracing::error!("ProblemAnalyzer: {}", e);
                    break;
                }
            }
        }
    }

    /// One analysis cycle. Returns the number of newly stored reports.
    pub async fn analyze_all(&mut self) -> Result<usize, StatsError> {
        let config = self.config.clone();
        let mut stored = 0;
        for group in &config.groups {
            for stream in &group.streams {
                stored += self.analyze(stream).await?;
            }
        }
        Ok(stored)
    }

    async fn analyze(&mut self, stream: &Stream) -> Result<usize, StatsError> {
        let checkpoint = self.checkpoint(stream.key).await?;
        let history = match self.stats.load_results_since(stream.key, checkpoint.occured).await {
            Ok(history) => history,
            Err(StatsError::NotFound) => return Ok(0),
            Err(e) => return Err(e),
        };

        let detection = detect(stream.stream_type, &history, &checkpoint);
        if detection.checkpoint != checkpoint {
            self.stats.save_checkpoint(stream.key, detection.checkpoint.clone());
            self.checkpoints.insert(stream.key, detection.checkpoint);
        }

        let mut stored = 0;
        for (range, ongoing) in detection.ranges {
            if !is_permanent(&range) {
                continue;
            }
            let report = report(stream, range, ongoing);
            if self.stats.save_report(report.clone()).await? {
                tracing::warn!(
                    group = %report.group,
                    stream = %report.stream_name,
                    err = %report.error,
                    ongoing = report.ongoing,
                    "permanent error: {}",
                    report.body
                );
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn checkpoint(&mut self, key: Key) -> Result<CheckPoint, StatsError> {
        if let Some(cp) = self.checkpoints.get(&key) {
            return Ok(cp.clone());
        }
        let cp = match self.stats.load_checkpoint(key).await? {
            Some(cp) => cp,
            None => CheckPoint::starting_at(Utc::now() - initial_lookback()),
        };
        self.checkpoints.insert(key, cp.clone());
        Ok(cp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Group, GroupParams};
    use crate::db::Store;
    use crate::model::{CheckResult, ErrType};
    use crate::stats::StatKeeper;
    use crate::test_support::{base_time, stream};
    use tempfile::NamedTempFile;

    fn range(minutes: i64, seconds: i64) -> ErrRange {
        ErrRange {
            from_tid: 1,
            to_tid: 2,
            occured: base_time(),
            discontinued: base_time() + ChronoDuration::minutes(minutes) + ChronoDuration::seconds(seconds),
            err: ErrType::Refused,
        }
    }

    #[test]
    fn test_permanent_boundary() {
        assert!(!is_permanent(&range(10, 0)));
        assert!(is_permanent(&range(10, 1)));
        assert!(!is_permanent(&range(0, 0)));
    }

    #[test]
    fn test_only_hls_is_analyzed() {
        let s = stream("http://a/", StreamType::Http);
        let history = vec![crate::test_support::kept(&s, 1, 0, ErrType::Refused)];
        let cp = CheckPoint::starting_at(base_time() - ChronoDuration::hours(1));
        for t in [StreamType::Http, StreamType::Hds, StreamType::Wv] {
            let d = detect(t, &history, &cp);
            assert!(d.ranges.is_empty());
            assert_eq!(d.checkpoint, cp);
        }
        assert_eq!(detect(StreamType::Hls, &history, &cp).ranges.len(), 1);
    }

    fn analyzer(streams: Vec<Arc<Stream>>) -> (NamedTempFile, StatsHandle, ProblemAnalyzer) {
        let tmp = NamedTempFile::new().unwrap();
        let stats = StatKeeper::spawn(Store::new(tmp.path()).unwrap(), Duration::from_secs(24 * 3600));
        let config = Arc::new(MonitorConfig {
            samples: Vec::new(),
            user_agents: Vec::new(),
            expire_duration: Duration::from_secs(24 * 3600),
            heartbeat_interval: Duration::from_secs(4),
            groups: vec![Group {
                key: Key::of("news"),
                name: "news".into(),
                params: Arc::new(GroupParams {
                    stream_type: StreamType::Hls,
                    ..Default::default()
                }),
                streams,
            }],
        });
        (tmp, stats.clone(), ProblemAnalyzer::new(config, stats))
    }

    fn save(stats: &StatsHandle, s: &Stream, tid: i64, minutes_ago: i64, err: ErrType) {
        let mut check = CheckResult::new(&s.uri, Utc::now() - ChronoDuration::minutes(minutes_ago));
        check.err_type = err;
        check.elapsed = Duration::from_secs(1);
        stats.save_result(s, tid, &check);
    }

    #[tokio::test]
    async fn test_long_outage_reported_once() {
        let s = Arc::new(stream("http://a/index.m3u8", StreamType::Hls));
        let (_tmp, stats, mut analyzer) = analyzer(vec![s.clone()]);

        save(&stats, &s, 99, 30, ErrType::Success);
        for (i, tid) in (100..=104).enumerate() {
            save(&stats, &s, tid, 27 - 3 * i as i64, ErrType::Refused);
        }
        save(&stats, &s, 105, 10, ErrType::Success);

        assert_eq!(analyzer.analyze_all().await.unwrap(), 1);
        assert_eq!(analyzer.analyze_all().await.unwrap(), 0);

        let reports = stats.load_reports().await.unwrap();
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert!(!r.ongoing);
        assert_eq!((r.range.from_tid, r.range.to_tid), (100, 104));
        assert_eq!(r.error, ErrType::Refused);
        assert_eq!(r.severity, crate::model::Severity::Critical);
        assert_eq!(r.group, "group");

        let cp = stats.load_checkpoint(s.key).await.unwrap().unwrap();
        assert_eq!(cp.tid, 104);
    }

    #[tokio::test]
    async fn test_short_failure_not_reported() {
        let s = Arc::new(stream("http://a/index.m3u8", StreamType::Hls));
        let (_tmp, stats, mut analyzer) = analyzer(vec![s.clone()]);

        save(&stats, &s, 50, 5, ErrType::BadStatus);
        save(&stats, &s, 50, 5, ErrType::Success);
        save(&stats, &s, 51, 4, ErrType::Success);

        assert_eq!(analyzer.analyze_all().await.unwrap(), 0);
        assert!(stats.load_reports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ongoing_then_closed() {
        let s = Arc::new(stream("http://a/index.m3u8", StreamType::Hls));
        let (_tmp, stats, mut analyzer) = analyzer(vec![s.clone()]);

        for (i, tid) in (1..=5).enumerate() {
            save(&stats, &s, tid, 40 - 5 * i as i64, ErrType::ListEmpty);
        }
        assert_eq!(analyzer.analyze_all().await.unwrap(), 1);
        save(&stats, &s, 6, 15, ErrType::ListEmpty);
        assert_eq!(analyzer.analyze_all().await.unwrap(), 0);

        save(&stats, &s, 7, 10, ErrType::Success);
        save(&stats, &s, 8, 5, ErrType::Success);
        assert_eq!(analyzer.analyze_all().await.unwrap(), 1);

        let reports = stats.load_reports().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.ongoing));
        let closed = reports.iter().find(|r| !r.ongoing).unwrap();
        assert_eq!((closed.range.from_tid, closed.range.to_tid), (1, 6));
    }

    #[tokio::test]
    async fn test_no_history() {
        let s = Arc::new(stream("http://a/index.m3u8", StreamType::Hls));
        let (_tmp, _stats, mut analyzer) = analyzer(vec![s]);
        assert_eq!(analyzer.analyze_all().await.unwrap(), 0);
    }
}
