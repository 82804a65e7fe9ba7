//! Bounded per-topic memory of recently published events.
//!
//! Each topic keeps at most `max_per_topic` entries, none older than the retention
//! window. The buffer is only used to replay missed events to (re)connecting
//! clients and is lost on restart.

use crate::config::MAX_TIMER_PERIOD;
use crate::message::{Frame, Topic};
use dashmap::DashMap;
use log::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Source of the current time for retention decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub kind: String,
    pub payload: Arc<str>,
    pub stored_at: Instant,
}

impl From<&HistoryEntry> for Frame {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            id: Some(entry.id.clone()),
            kind: entry.kind.clone(),
            data: Arc::clone(&entry.payload),
        }
    }
}

pub struct HistoryBuffer {
    topics: DashMap<Topic, VecDeque<HistoryEntry>>,
    max_per_topic: usize,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl HistoryBuffer {
    pub fn with_clock(max_per_topic: usize, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            topics: DashMap::new(),
            max_per_topic,
            retention,
            clock,
        }
    }

    /// Appends an entry, evicting the oldest ones once the topic is over capacity.
    pub fn store(
        &self,
        topic: &Topic,
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: Arc<str>,
    ) {
        if self.max_per_topic == 0 {
            return;
        }

        let entry = HistoryEntry {
            id: id.into(),
            kind: kind.into(),
            payload,
            stored_at: self.clock.now(),
        };

        let mut entries = self.topics.entry(topic.clone()).or_default();
        entries.push_back(entry);
        while entries.len() > self.max_per_topic {
            entries.pop_front();
        }
    }

    /// Entries stored strictly after `since`, oldest first.
    pub fn recent(&self, topic: &Topic, since: Instant) -> Vec<HistoryEntry> {
        self.topics
            .get(topic)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.stored_at > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries still inside the retention window, oldest first.
    pub fn retained(&self, topic: &Topic) -> Vec<HistoryEntry> {
        match self.cutoff() {
            Some(cutoff) => self.recent(topic, cutoff),
            None => self
                .topics
                .get(topic)
                .map(|entries| entries.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Replay set for a connecting client. When `last_event_id` names a retained
    /// entry only the entries published after it are returned, otherwise the
    /// whole retained window is.
    pub fn replay_from(&self, topic: &Topic, last_event_id: Option<&str>) -> Vec<HistoryEntry> {
        let mut entries = self.retained(topic);

        if let Some(last_event_id) = last_event_id {
            if let Some(position) = entries.iter().rposition(|entry| entry.id == last_event_id) {
                entries.drain(..=position);
            }
        }

        entries
    }

    /// Drops expired entries and forgets topics left empty. Returns the number of
    /// entries removed.
    pub fn sweep(&self) -> usize {
        let Some(cutoff) = self.cutoff() else {
            return 0;
        };

        let mut removed = 0;
        self.topics.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.stored_at > cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });

        debug!(
            "Swept {removed} expired history entries, now tracking {} topics",
            self.topics.len()
        );
        removed
    }

    /// Sweeps on a fixed interval until `shutdown` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        if interval.is_zero() {
            warn!("History sweep interval is zero, periodic sweeping disabled");
            return;
        }

        let interval = interval.min(MAX_TIMER_PERIOD);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    pub fn len(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    fn cutoff(&self) -> Option<Instant> {
        self.clock.now().checked_sub(self.retention)
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: std::sync::Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset: std::sync::Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}
