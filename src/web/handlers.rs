//! HTTP request handlers.

use super::AppState;
use crate::config::Group;
use crate::model::{ErrType, Key, KeptResult, Severity, Stats, Stream};
use crate::stats::StatsError;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 3600);
const HOUR: Duration = Duration::from_secs(3600);

// ============================================================================
// Helpers
// ============================================================================

fn parse_key(s: &str) -> Result<Key, Response> {
    Key::from_hex(s).map_err(|_| (StatusCode::BAD_REQUEST, format!("malformed key {:?}", s)).into_response())
}

fn find_group<'a>(state: &'a AppState, group: &str) -> Result<&'a Group, Response> {
    let key = parse_key(group)?;
    state
        .scheduler
        .config()
        .group(&key)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "group not found").into_response())
}

fn find_stream(state: &AppState, group: &str, stream: &str) -> Result<Arc<Stream>, Response> {
    let group = find_group(state, group)?;
    let key = parse_key(stream)?;
    group
        .streams
        .iter()
        .find(|s| s.key == key)
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, "stream not found").into_response())
}

fn stats_error(e: StatsError) -> Response {
    match e {
        StatsError::NotFound => (StatusCode::NOT_FOUND, "no data").into_response(),
        StatsError::Closed => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Problems found in the last 3, 15 and 60 minutes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProblemCounts {
    pub last3: usize,
    pub last15: usize,
    pub last60: usize,
    /// Worst problem of the last 15 minutes.
    pub severity: Option<Severity>,
}

pub fn count_problems(errors: &BTreeMap<DateTime<Utc>, ErrType>, now: DateTime<Utc>) -> ProblemCounts {
    let mut counts = ProblemCounts::default();
    for (at, err) in errors.range(now - ChronoDuration::minutes(60)..) {
        let age = now - *at;
        counts.last60 += 1;
        if age <= ChronoDuration::minutes(15) {
            counts.last15 += 1;
            counts.severity = counts.severity.max(Some(err.severity()));
        }
        if age <= ChronoDuration::minutes(3) {
            counts.last3 += 1;
        }
    }
    counts
}

/// Problems of the last day by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyProblems {
    pub slow: usize,
    pub timeout: usize,
    pub http: usize,
    pub format: usize,
}

pub fn classify_problems<'a>(errors: impl IntoIterator<Item = &'a ErrType>) -> DailyProblems {
    let mut daily = DailyProblems::default();
    for err in errors {
        match err {
            ErrType::Slow | ErrType::VerySlow => daily.slow += 1,
            ErrType::CTimeout | ErrType::RTimeout => daily.timeout += 1,
            ErrType::BadStatus | ErrType::Refused | ErrType::BadUri | ErrType::BadLength | ErrType::BodyRead => {
                daily.http += 1
            }
            ErrType::ListEmpty | ErrType::BadFormat | ErrType::UnkErr => daily.format += 1,
            _ => {}
        }
    }
    daily
}

// ============================================================================
// API: Status
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.status())
}

// ============================================================================
// API: Streams
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamsQuery {
    pub group: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamRow {
    pub group_key: Key,
    #[serde(flatten)]
    pub stream: Arc<Stream>,
    pub stats: Stats,
    pub problems: ProblemCounts,
}

pub async fn handle_get_streams(State(state): State<AppState>, Query(query): Query<StreamsQuery>) -> Response {
    let groups: Vec<&Group> = match &query.group {
        Some(group) => match find_group(&state, group) {
            Ok(g) => vec![g],
            Err(resp) => return resp,
        },
        None => state.scheduler.config().groups.iter().collect(),
    };

    let now = Utc::now();
    let mut rows = Vec::new();
    for group in groups {
        for stream in &group.streams {
            let stats = state.stats.load_stats(stream.key).await;
            let problems = match state.stats.load_history_errors(stream.key, HOUR).await {
                Ok(errors) => count_problems(&errors, now),
                Err(StatsError::NotFound) => ProblemCounts::default(),
                Err(e) => return stats_error(e),
            };
            rows.push(StreamRow {
                group_key: group.key,
                stream: stream.clone(),
                stats,
                problems,
            });
        }
    }
    Json(rows).into_response()
}

#[derive(Debug, Serialize)]
pub struct StreamInfo {
    pub stream: Arc<Stream>,
    pub stats: Stats,
    /// URI requested by the latest check.
    pub last_uri: Option<String>,
    pub last_tid: Option<i64>,
    pub problems: DailyProblems,
}

pub async fn handle_get_stream(
    State(state): State<AppState>,
    Path((group, stream)): Path<(String, String)>,
) -> Response {
    let stream = match find_stream(&state, &group, &stream) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let stats = state.stats.load_stats(stream.key).await;
    let last = match state.stats.load_last_result(stream.key).await {
        Ok(results) => results.into_iter().find(|r| r.master),
        Err(StatsError::NotFound) => None,
        Err(e) => return stats_error(e),
    };
    let problems = match state.stats.load_history_errors(stream.key, DAY).await {
        Ok(errors) => classify_problems(errors.values()),
        Err(StatsError::NotFound) => DailyProblems::default(),
        Err(e) => return stats_error(e),
    };

    Json(StreamInfo {
        last_uri: last.as_ref().map(|r| r.uri.clone()),
        last_tid: last.map(|r| r.tid),
        stream,
        stats,
        problems,
    })
    .into_response()
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorEntry {
    pub started: DateTime<Utc>,
    pub err: ErrType,
    pub severity: Severity,
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Path((group, stream)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let stream = match find_stream(&state, &group, &stream) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    if query.mode.as_deref() == Some("errors") {
        return match state.stats.load_history_errors(stream.key, DAY).await {
            Ok(errors) => {
                let entries: Vec<ErrorEntry> = errors
                    .into_iter()
                    .rev()
                    .map(|(started, err)| ErrorEntry {
                        started,
                        err,
                        severity: err.severity(),
                    })
                    .collect();
                Json(entries).into_response()
            }
            Err(e) => stats_error(e),
        };
    }

    match state.stats.load_history_results(stream.key).await {
        Ok(mut results) => {
            results.reverse();
            Json(results).into_response()
        }
        Err(e) => stats_error(e),
    }
}

pub async fn handle_get_raw(
    State(state): State<AppState>,
    Path((group, stream, stamp)): Path<(String, String, String)>,
) -> Response {
    let stream = match find_stream(&state, &group, &stream) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let Ok(stamp) = stamp.parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "malformed timestamp").into_response();
    };

    let results = match state.stats.load_history_results(stream.key).await {
        Ok(results) => results,
        Err(e) => return stats_error(e),
    };
    match results
        .iter()
        .find(|r: &&KeptResult| r.started.timestamp_nanos_opt() == Some(stamp))
    {
        Some(result) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], result.raw_text()).into_response(),
        None => (StatusCode::NOT_FOUND, "record not found").into_response(),
    }
}

// ============================================================================
// API: Reports
// ============================================================================

pub async fn handle_get_reports(State(state): State<AppState>) -> Response {
    match state.stats.load_reports().await {
        Ok(reports) => Json(reports).into_response(),
        Err(e) => stats_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::base_time;

    #[test]
    fn test_count_problems() {
        let now = base_time();
        let mut errors = BTreeMap::new();
        errors.insert(now - ChronoDuration::minutes(1), ErrType::Slow);
        errors.insert(now - ChronoDuration::minutes(10), ErrType::BadStatus);
        errors.insert(now - ChronoDuration::minutes(40), ErrType::CTimeout);
        errors.insert(now - ChronoDuration::minutes(90), ErrType::Refused);

        let counts = count_problems(&errors, now);
        assert_eq!((counts.last3, counts.last15, counts.last60), (1, 2, 3));
        assert_eq!(counts.severity, Some(Severity::Critical));

        assert_eq!(count_problems(&BTreeMap::new(), now), ProblemCounts::default());
    }

    #[test]
    fn test_classify_problems() {
        let errors = [
            ErrType::Slow,
            ErrType::VerySlow,
            ErrType::RTimeout,
            ErrType::BadStatus,
            ErrType::Refused,
            ErrType::BadFormat,
            ErrType::ListEmpty,
        ];
        let daily = classify_problems(errors.iter());
        assert_eq!(
            daily,
            DailyProblems {
                slow: 2,
                timeout: 1,
                http: 2,
                format: 2,
            }
        );
    }
}
