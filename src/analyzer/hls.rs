//! Error range detection over HLS check history.

use super::Detection;
use crate::model::{CheckPoint, ErrRange, ErrType, KeptResult};

use chrono::Duration as ChronoDuration;

/// Task currently being walked.
struct TaskState {
    tid: i64,
    first_started: chrono::DateTime<chrono::Utc>,
    failed: bool,
}

/// Find error ranges in `history` after `checkpoint`.
///
/// A task fails when any of its checks is above the error threshold.
/// Consecutive failing tasks form one range. Only completed tasks are
/// committed to the returned checkpoint: the newest task may still be
/// receiving results and is read again next time.
pub fn detect(history: &[KeptResult], checkpoint: &CheckPoint) -> Detection {
    let mut checks: Vec<&KeptResult> = history
        .iter()
        .filter(|r| r.tid > checkpoint.tid && r.started >= checkpoint.occured)
        .collect();
    checks.sort_by_key(|r| (r.tid, r.started));

    let mut ranges = Vec::new();
    let mut committed = checkpoint.clone();
    let mut open = checkpoint.opened_range.clone();
    let mut task: Option<TaskState> = None;

    for check in checks {
        if task.as_ref().is_some_and(|t| t.tid != check.tid) {
            if let Some(done) = task.take() {
                if !done.failed {
                    if let Some(range) = open.take() {
                        ranges.push((range, false));
                    }
                }
                committed = CheckPoint {
                    tid: done.tid,
                    occured: done.first_started,
                    opened_range: open.clone(),
                };
            }
        }

        let current = task.get_or_insert_with(|| TaskState {
            tid: check.tid,
            first_started: check.started,
            failed: false,
        });

        if check.err_type <= ErrType::ErrorLevel {
            continue;
        }
        current.failed = true;
        match open.as_mut() {
            None => {
                open = Some(ErrRange {
                    from_tid: check.tid,
                    to_tid: check.tid,
                    occured: check.started,
                    discontinued: check.started,
                    err: check.err_type,
                });
            }
            Some(range) => {
                range.to_tid = check.tid;
                range.discontinued = check.started + ChronoDuration::from_std(check.elapsed).unwrap_or_default();
                range.err = range.err.max(check.err_type);
            }
        }
    }

    if let Some(range) = open {
        let closed = task.is_some_and(|t| !t.failed);
        ranges.push((range, !closed));
    }

    Detection {
        ranges,
        checkpoint: committed,
    }
}
