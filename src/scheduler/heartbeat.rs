//! Internet reachability heartbeat.
//!
//! Monitoring is only meaningful while the monitor itself is online, so sample
//! resources are probed periodically and stream boxes are started or stopped
//! when their reachability changes.

use super::bus::{Command, ControlBus};

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const FIRST_CYCLE_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Heartbeat {
    samples: Vec<String>,
    interval: Duration,
    client: reqwest::Client,
    bus: ControlBus,
    enabled: bool,
    state: watch::Sender<bool>,
}

impl Heartbeat {
    pub fn new(samples: Vec<String>, interval: Duration, bus: ControlBus) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let (state, _) = watch::channel(false);
        Ok(Self {
            samples,
            interval,
            client,
            bus,
            enabled: false,
            state,
        })
    }

    /// Receiver of the monitoring-enabled flag.
    pub fn state(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn spawn(self) -> watch::Receiver<bool> {
        let state = self.state();
        tokio::spawn(self.run());
        state
    }

    async fn run(mut self) {
        tracing::info!("Heartbeat: checking {} samples every {:?}", self.samples.len(), self.interval);
        let mut ticker = interval_at(Instant::now() + FIRST_CYCLE_DELAY, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let online = self.probe_samples().await;
            if let Some(cmd) = self.update(online) {
                let reached = self.bus.broadcast(cmd);
                tracing::info!("Heartbeat: broadcast {:?} to {} stream boxes", cmd, reached);
            }
        }
    }

    /// Apply a cycle outcome and return the command to broadcast, if any.
    fn update(&mut self, online: bool) -> Option<Command> {
        if online == self.enabled {
            return None;
        }
        self.enabled = online;
        self.state.send_replace(online);
        if online {
            tracing::info!("Heartbeat: samples reachable, monitoring enabled");
            Some(Command::Start)
        } else {
            tracing::warn!("Heartbeat: samples unreachable, monitoring disabled");
            Some(Command::Stop)
        }
    }

    /// True when every sample answers a HEAD request with any status.
    async fn probe_samples(&self) -> bool {
        for sample in &self.samples {
            match self.client.head(sample).send().await {
                Ok(resp) => tracing::debug!("Heartbeat: sample {} answered {}", sample, resp.status()),
                Err(e) => {
                    tracing::warn!("Heartbeat: sample {} failed: {}", sample, e);
                    return false;
                }
            }
        }
        true
    }
}
