//! Retrieval scheduler
//!
//! A single cooperative task that pulls messages on a jittered, adaptive
//! interval. Timing is randomized from the CSPRNG and a configurable share
//! of ticks is cover traffic - retrievals whose results are discarded - so a
//! storage node watching the wire cannot tell when the user is actually
//! reading messages, nor infer activity from retrieval cadence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::client::{ReceivedMessage, RetrieveSource};
use crate::crypto::random;

/// Scheduler tuning knobs
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Base pull interval
    pub base_interval: Duration,
    /// Jitter half-range as a percentage of the interval
    pub jitter_percent: u8,
    pub cover_traffic_enabled: bool,
    /// Probability that a tick is cover traffic
    pub cover_traffic_ratio: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(300),
            jitter_percent: 50,
            cover_traffic_enabled: true,
            cover_traffic_ratio: 0.3,
        }
    }
}

/// Scheduler lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

struct SchedulerInner {
    state: SchedulerState,
    consecutive_empty: u32,
}

/// Backs off while nothing arrives: after two consecutive empty pulls the
/// interval stretches linearly, capped at four times the base.
fn adaptive_multiplier(consecutive_empty: u32) -> u32 {
    consecutive_empty.saturating_sub(2).max(1).min(4)
}

/// Jittered adaptive pull loop over any [`RetrieveSource`]
pub struct RetrievalScheduler<S: RetrieveSource> {
    source: S,
    config: SchedulerConfig,
    delivery: mpsc::UnboundedSender<ReceivedMessage>,
    inner: parking_lot::Mutex<SchedulerInner>,
    stop_signal: Notify,
}

impl<S: RetrieveSource + 'static> RetrievalScheduler<S> {
    pub fn new(
        source: S,
        config: SchedulerConfig,
        delivery: mpsc::UnboundedSender<ReceivedMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            config,
            delivery,
            inner: parking_lot::Mutex::new(SchedulerInner {
                state: SchedulerState::Idle,
                consecutive_empty: 0,
            }),
            stop_signal: Notify::new(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn consecutive_empty(&self) -> u32 {
        self.inner.lock().consecutive_empty
    }

    /// Start the loop. Returns `None` when it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SchedulerState::Idle {
                return None;
            }
            inner.state = SchedulerState::Running;
        }

        let scheduler = self.clone();
        Some(tokio::spawn(async move {
            log::info!("retrieval scheduler started");
            loop {
                let delay = scheduler.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = scheduler.stop_signal.notified() => break,
                }
                if scheduler.state() == SchedulerState::Stopping {
                    break;
                }
                scheduler.tick_once().await;
            }
            scheduler.inner.lock().state = SchedulerState::Idle;
            log::info!("retrieval scheduler stopped");
        }))
    }

    /// Signal the loop to stop. Idempotent; an in-flight retrieval finishes
    /// but no further tick is scheduled.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SchedulerState::Running {
            inner.state = SchedulerState::Stopping;
        }
        drop(inner);
        self.stop_signal.notify_one();
    }

    fn next_delay(&self) -> Duration {
        let base_ms = self.config.base_interval.as_millis() as i64;
        let multiplier = adaptive_multiplier(self.consecutive_empty()) as i64;
        let jitter_range = base_ms * self.config.jitter_percent as i64 / 100;
        let jitter = random::random_jitter_ms(jitter_range);
        let delay_ms = (base_ms * multiplier + jitter).max(0) as u64;
        Duration::from_millis(delay_ms)
    }

    /// One scheduling decision plus retrieval. Cover-traffic ticks perform a
    /// real retrieve but discard the results and leave the backoff counter
    /// untouched, so they are indistinguishable on the wire and invisible in
    /// scheduling behavior.
    pub async fn tick_once(&self) {
        let cover = self.config.cover_traffic_enabled
            && random::random_unit_f64() < self.config.cover_traffic_ratio;

        let result = self.source.retrieve().await;

        if cover {
            match result {
                Ok(messages) => {
                    tracing::debug!(discarded = messages.len(), "cover traffic tick")
                }
                Err(e) => tracing::debug!(error = %e, "cover traffic tick failed"),
            }
            return;
        }

        match result {
            Ok(messages) if !messages.is_empty() => {
                self.inner.lock().consecutive_empty = 0;
                for message in messages {
                    if self.delivery.send(message).is_err() {
                        log::warn!("message consumer gone, dropping retrieved message");
                    }
                }
            }
            Ok(_) => {
                self.inner.lock().consecutive_empty += 1;
            }
            Err(e) => {
                log::debug!("retrieve failed: {}", e);
                self.inner.lock().consecutive_empty += 1;
            }
        }
    }
}
