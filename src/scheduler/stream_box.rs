//! Per-stream scheduling loop.

use super::bus::Command;
use crate::config::GroupParams;
use crate::logging::EventLog;
use crate::model::{CheckResult, ErrType, ResultTree, Severity, Stats, Stream, Task};
use crate::probe::TaskQueue;
use crate::stats::StatsHandle;

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

const STATS_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
/// Consecutive completions after which each completion is reported.
const COMPLETION_DIAGNOSTIC: u64 = 144;

struct Pending {
    tid: i64,
    reply: oneshot::Receiver<ResultTree>,
}

/// Schedules checks of one stream and forwards their results.
pub struct StreamBox {
    stream: Arc<Stream>,
    params: Arc<GroupParams>,
    queue: TaskQueue,
    stats: StatsHandle,
    events: EventLog,
    commands: mpsc::UnboundedReceiver<Command>,
    online: bool,
    next_tid: i64,
    counters: Stats,
    completed: u64,
    backoff: Duration,
    pending: Option<Pending>,
}

impl StreamBox {
    pub fn new(
        stream: Arc<Stream>,
        params: Arc<GroupParams>,
        queue: TaskQueue,
        stats: StatsHandle,
        events: EventLog,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            stream,
            params,
            queue,
            stats,
            events,
            commands,
            online: false,
            next_tid: Utc::now().timestamp_millis(),
            counters: Stats::default(),
            completed: 0,
            backoff: Duration::ZERO,
            pending: None,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let sleep = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(sleep);
        let mut flush = tokio::time::interval(STATS_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(delay) = self.handle_command(cmd) {
                            sleep.as_mut().reset(Instant::now() + delay);
                        }
                    }
                    None => break,
                },
                () = &mut sleep, if self.online && self.pending.is_none() => {
                    if let Some(delay) = self.submit_next() {
                        sleep.as_mut().reset(Instant::now() + delay);
                    }
                }
                reply = recv_reply(&mut self.pending), if self.pending.is_some() => {
                    let (tid, reply) = reply;
                    self.pending = None;
                    let delay = match reply {
                        Ok(tree) => self.handle_reply(tid, tree),
                        Err(_) => {
                            tracing::warn!("StreamBox {}: task {} lost its reply", self.stream.name, tid);
                            self.fail_task()
                        }
                    };
                    sleep.as_mut().reset(Instant::now() + delay);
                }
                _ = flush.tick() => self.stats.save_stats(self.stream.key, self.counters.clone()),
            }
        }
        tracing::debug!("StreamBox {}: control bus closed", self.stream.name);
    }

    /// Apply a bus command. Returns the delay before the first task when
    /// the box goes online.
    fn handle_command(&mut self, cmd: Command) -> Option<Duration> {
        match (cmd, self.online) {
            (Command::Start, false) => {
                self.online = true;
                let delay = self.next_delay();
                tracing::debug!("StreamBox {}: online, first task in {:?}", self.stream.name, delay);
                Some(delay)
            }
            (Command::Stop, true) => {
                self.online = false;
                self.counters.next_check = None;
                tracing::debug!("StreamBox {}: offline", self.stream.name);
                None
            }
            _ => None,
        }
    }

    /// Submit the next task. Returns a retry delay when the queue is gone.
    fn submit_next(&mut self) -> Option<Duration> {
        let tid = self.next_tid;
        self.next_tid += 1;

        let (reply_to, reply) = oneshot::channel();
        let task = Task {
            stream: self.stream.clone(),
            tid,
            read_body: self.stream.stream_type.reads_body(),
            ttl: deadline(self.params.task_ttl),
            reply_to,
        };

        match self.queue.submit(task) {
            Ok(()) => {
                self.pending = Some(Pending { tid, reply });
                None
            }
            Err(e) => {
                tracing::error!("StreamBox {}: {}", self.stream.name, e);
                Some(self.fail_task())
            }
        }
    }

    /// Account a task that produced no usable result.
    fn fail_task(&mut self) -> Duration {
        self.completed = 0;
        self.backoff = jitter(self.params.check_broken_time);
        self.next_delay()
    }

    /// Process a result tree. Returns the delay before the next task.
    fn handle_reply(&mut self, tid: i64, mut tree: ResultTree) -> Duration {
        if tree.root().err_type == ErrType::TtlExpired {
            tracing::debug!("StreamBox {}: task {} expired in queue", self.stream.name, tid);
            return self.fail_task();
        }

        for (_, node) in tree.iter_mut() {
            if escalate(node, &self.params) {
                self.events.log(Severity::Warning, &self.stream, node);
            } else if node.err_type > ErrType::WarningLevel {
                self.events.log(node.err_type.severity(), &self.stream, node);
            }
        }

        let master = tree.root();
        self.counters.checks += 1;
        if master.err_type.is_warning() {
            self.counters.errors += 1;
        }
        self.counters.last_check = Some(master.started);

        self.completed += 1;
        if self.completed > COMPLETION_DIAGNOSTIC {
            tracing::debug!("StreamBox {}: {} tasks completed in a row", self.stream.name, self.completed);
        }

        for (_, node) in tree.iter() {
            self.stats.save_result(&self.stream, tid, node);
        }

        self.backoff = if master.err_type >= ErrType::CriticalLevel {
            jitter(self.params.check_broken_time)
        } else {
            Duration::ZERO
        };
        self.next_delay()
    }

    fn next_delay(&mut self) -> Duration {
        let delay = jitter(self.params.time_between_tasks) + self.backoff;
        self.counters.next_check = Some(deadline(delay));
        delay
    }
}

async fn recv_reply(pending: &mut Option<Pending>) -> (i64, Result<ResultTree, oneshot::error::RecvError>) {
    match pending {
        Some(p) => (p.tid, (&mut p.reply).await),
        None => std::future::pending().await,
    }
}

/// Mark a check done without errors as slow when it took too long.
fn escalate(result: &mut CheckResult, params: &GroupParams) -> bool {
    if result.err_type >= ErrType::WarningLevel {
        return false;
    }
    if result.elapsed >= params.very_slow_warning_timeout {
        result.err_type = ErrType::VerySlow;
    } else if result.elapsed >= params.slow_warning_timeout {
        result.err_type = ErrType::Slow;
    } else {
        return false;
    }
    true
}

/// Uniform random duration in [75%, 100%] of `base`.
fn jitter(base: Duration) -> Duration {
    let ms = base.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(ms * 3 / 4..=ms))
}

fn deadline(after: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamType;
    use crate::scheduler::bus::ControlBus;
    use crate::stats::Request;
    use crate::test_support::stream;
    use crate::logging::Event;

    struct Fixture {
        sbox: StreamBox,
        tasks: flume::Receiver<Task>,
        saved: mpsc::UnboundedReceiver<Request>,
        events: mpsc::Receiver<Event>,
        bus: ControlBus,
    }

    fn params() -> GroupParams {
        GroupParams {
            time_between_tasks: Duration::from_millis(40),
            check_broken_time: Duration::from_millis(100),
            task_ttl: Duration::from_secs(5),
            slow_warning_timeout: Duration::from_secs(5),
            very_slow_warning_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let (queue, tasks) = TaskQueue::detached("group");
        let (stats, saved) = StatsHandle::detached();
        let (log, events) = EventLog::channel(16);
        let mut bus = ControlBus::new();
        let sbox = StreamBox::new(
            Arc::new(stream("http://a/index.m3u8", StreamType::Hls)),
            Arc::new(params()),
            queue,
            stats,
            log,
            bus.subscribe(),
        );
        Fixture { sbox, tasks, saved, events, bus }
    }

    fn tree(err: ErrType, elapsed: Duration) -> ResultTree {
        let mut r = CheckResult::new("http://a/index.m3u8", Utc::now());
        r.err_type = err;
        r.elapsed = elapsed;
        ResultTree::new(r)
    }

    fn saved_results(rx: &mut mpsc::UnboundedReceiver<Request>) -> Vec<crate::model::KeptResult> {
        let mut out = Vec::new();
        while let Ok(req) = rx.try_recv() {
            if let Some(r) = req.saved_result() {
                out.push(r.clone());
            }
        }
        out
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(60);
        for _ in 0..100 {
            let d = jitter(base);
            assert!(d >= Duration::from_secs(45) && d <= base);
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_expired_reply_changes_nothing() {
        let mut f = fixture();
        f.sbox.completed = 5;
        let delay = f.sbox.handle_reply(1, tree(ErrType::TtlExpired, Duration::ZERO));

        assert_eq!(f.sbox.counters.checks, 0);
        assert_eq!(f.sbox.completed, 0);
        assert!(f.sbox.backoff >= Duration::from_millis(75));
        assert!(delay >= f.sbox.backoff);
        assert!(saved_results(&mut f.saved).is_empty());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_success_is_forwarded() {
        let mut f = fixture();
        let mut t = tree(ErrType::Success, Duration::from_millis(10));
        t.push_child(ResultTree::ROOT, CheckResult::new("http://a/low.m3u8", Utc::now()));
        f.sbox.handle_reply(7, t);

        assert_eq!(f.sbox.counters.checks, 1);
        assert_eq!(f.sbox.counters.errors, 0);
        assert!(f.sbox.counters.last_check.is_some());
        assert!(f.sbox.counters.next_check.is_some());
        assert_eq!(f.sbox.backoff, Duration::ZERO);

        let saved = saved_results(&mut f.saved);
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|r| r.tid == 7));
        assert!(saved[0].master && !saved[1].master);
    }

    #[tokio::test]
    async fn test_slow_check_escalated() {
        let mut f = fixture();
        f.sbox.handle_reply(1, tree(ErrType::Success, Duration::from_secs(6)));
        f.sbox.handle_reply(2, tree(ErrType::Success, Duration::from_secs(11)));
        f.sbox.handle_reply(3, tree(ErrType::BadStatus, Duration::from_secs(11)));

        let saved: Vec<_> = saved_results(&mut f.saved).into_iter().map(|r| r.err_type).collect();
        assert_eq!(saved, vec![ErrType::Slow, ErrType::VerySlow, ErrType::BadStatus]);
        assert_eq!(f.sbox.counters.errors, 3);
        assert_eq!(f.events.try_recv().unwrap().severity, Severity::Warning);
        assert_eq!(f.events.try_recv().unwrap().severity, Severity::Warning);
        assert_eq!(f.events.try_recv().unwrap().severity, Severity::Critical);
    }

    #[test]
    fn test_escalation_thresholds_inclusive() {
        let p = params();
        let check = |elapsed: Duration| {
            let mut r = CheckResult::new("http://a/index.m3u8", Utc::now());
            r.elapsed = elapsed;
            escalate(&mut r, &p);
            r.err_type
        };
        assert_eq!(check(Duration::from_millis(4999)), ErrType::Success);
        assert_eq!(check(Duration::from_secs(5)), ErrType::Slow);
        assert_eq!(check(Duration::from_secs(10)), ErrType::VerySlow);
    }

    #[tokio::test]
    async fn test_task_ids_outpace_restarts() {
        let before = Utc::now().timestamp_millis();
        let mut f = fixture();
        f.sbox.online = true;
        assert_eq!(f.sbox.submit_next(), None);
        let first = f.tasks.try_recv().unwrap();
        assert!(first.tid >= before);

        // a restart within the same second still allocates larger ids
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut restarted = fixture();
        restarted.sbox.submit_next();
        assert!(restarted.tasks.try_recv().unwrap().tid > first.tid);
    }

    #[tokio::test]
    async fn test_critical_error_backs_off() {
        let mut f = fixture();
        let delay = f.sbox.handle_reply(1, tree(ErrType::Refused, Duration::from_millis(1)));
        assert!(f.sbox.backoff >= Duration::from_millis(75) && f.sbox.backoff <= Duration::from_millis(100));
        assert!(delay >= f.sbox.backoff + Duration::from_millis(30));

        f.sbox.handle_reply(2, tree(ErrType::CTimeout, Duration::from_millis(1)));
        assert_eq!(f.sbox.backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_commands_toggle_state() {
        let mut f = fixture();
        assert_eq!(f.sbox.handle_command(Command::Stop), None);
        assert!(f.sbox.handle_command(Command::Start).is_some());
        assert_eq!(f.sbox.handle_command(Command::Start), None);
        assert_eq!(f.sbox.handle_command(Command::Stop), None);
        assert!(!f.sbox.online);
        assert!(f.sbox.counters.next_check.is_none());
    }

    #[tokio::test]
    async fn test_stop_halts_tasks_until_start() {
        let Fixture { sbox, tasks, mut bus, .. } = fixture();
        sbox.spawn();
        let wait = Duration::from_secs(2);

        // Offline boxes emit nothing.
        assert!(tokio::time::timeout(Duration::from_millis(150), tasks.recv_async()).await.is_err());

        bus.broadcast(Command::Start);
        let first = tokio::time::timeout(wait, tasks.recv_async()).await.unwrap().unwrap();
        assert!(first.ttl > Utc::now());
        let _ = first.reply_to.send(tree(ErrType::Success, Duration::ZERO));

        let second = tokio::time::timeout(wait, tasks.recv_async()).await.unwrap().unwrap();
        assert!(second.tid > first.tid);

        // An in-flight task is still answered after STOP.
        bus.broadcast(Command::Stop);
        let _ = second.reply_to.send(tree(ErrType::Success, Duration::ZERO));
        assert!(tokio::time::timeout(Duration::from_millis(200), tasks.recv_async()).await.is_err());

        bus.broadcast(Command::Start);
        let third = tokio::time::timeout(wait, tasks.recv_async()).await.unwrap().unwrap();
        assert!(third.tid > second.tid);
    }
}
