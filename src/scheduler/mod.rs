//! Scheduler module: stream boxes, prober pools and the heartbeat.

mod bus;
mod heartbeat;
mod stream_box;

pub use bus::*;
pub use heartbeat::*;
pub use stream_box::*;

use crate::config::MonitorConfig;
use crate::logging::EventLog;
use crate::probe::{PoolStats, ProbeError, ProberPool};
use crate::stats::StatsHandle;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Running monitor: pools, stream boxes and heartbeat.
pub struct Scheduler {
    config: Arc<MonitorConfig>,
    pools: Vec<ProberPool>,
    enabled: watch::Receiver<bool>,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub monitoring: bool,
    pub streams: BTreeMap<&'static str, usize>,
    pub pools: Vec<PoolStats>,
}

impl Scheduler {
    /// Start one pool per group, one stream box per stream and the heartbeat.
    pub fn start(config: Arc<MonitorConfig>, stats: StatsHandle, events: EventLog) -> Result<Self, ProbeError> {
        let user_agents = Arc::new(config.user_agents.clone());
        let mut bus = ControlBus::new();
        let mut pools = Vec::with_capacity(config.groups.len());

        for group in &config.groups {
            let pool = ProberPool::spawn(group, user_agents.clone())?;
            for stream in &group.streams {
                StreamBox::new(
                    stream.clone(),
                    group.params.clone(),
                    pool.queue(),
                    stats.clone(),
                    events.clone(),
                    bus.subscribe(),
                )
                .spawn();
            }
            pools.push(pool);
        }
        tracing::info!("Scheduler: started {} stream boxes in {} groups", bus.len(), pools.len());

        let heartbeat = Heartbeat::new(config.samples.clone(), config.heartbeat_interval, bus)
            .map_err(ProbeError::Client)?;
        let enabled = heartbeat.spawn();

        Ok(Self { config, pools, enabled })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn status(&self) -> Status {
        let mut streams: BTreeMap<&'static str, usize> = BTreeMap::new();
        for group in &self.config.groups {
            *streams.entry(group.params.stream_type.as_str()).or_default() += group.streams.len();
        }
        Status {
            monitoring: self.is_enabled(),
            streams,
            pools: self.pools.iter().map(ProberPool::stats).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Group, GroupParams};
    use crate::model::{Key, StreamType};
    use crate::test_support::stream;
    use std::time::Duration;

    #[tokio::test]
    async fn test_status_totals() {
        let hls = Group {
            key: Key::of("news"),
            name: "news".into(),
            params: Arc::new(GroupParams {
                stream_type: StreamType::Hls,
                probers: 3,
                ..Default::default()
            }),
            streams: vec![
                Arc::new(stream("http://a/1.m3u8", StreamType::Hls)),
                Arc::new(stream("http://a/2.m3u8", StreamType::Hls)),
            ],
        };
        let config = Arc::new(MonitorConfig {
            samples: Vec::new(),
            user_agents: Vec::new(),
            expire_duration: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(4),
            groups: vec![hls],
        });
        let (stats, _rx) = StatsHandle::detached();
        let (events, _events_rx) = EventLog::channel(8);

        let scheduler = Scheduler::start(config, stats, events).unwrap();
        let status = scheduler.status();
        assert!(!status.monitoring);
        assert_eq!(status.streams.get("hls"), Some(&2));
        assert_eq!(status.pools.len(), 1);
        assert_eq!(status.pools[0].probers, 3);
        assert_eq!(status.streams.get("http"), None);
    }
}
