// Sliding-window event counters keyed by guild, channel and event kind.
//
// Every event keeps its own timestamp, so a count is exact: an event is
// counted once, and never after it has left the window.

use crate::core::policy::MessageRateSettings;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Events kept when nobody has asked for a longer window yet.
const DEFAULT_HORIZON: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKind {
    Message,
    Join,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub guild_id: u64,
    pub channel_id: Option<u64>,
    pub kind: RateKind,
}

impl RateKey {
    pub fn messages(guild_id: u64, channel_id: u64) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            kind: RateKind::Message,
        }
    }

    pub fn joins(guild_id: u64) -> Self {
        Self {
            guild_id,
            channel_id: None,
            kind: RateKind::Join,
        }
    }
}

struct EventWindow {
    // Sorted oldest first.
    events: VecDeque<DateTime<Utc>>,
    horizon: ChronoDuration,
}

impl EventWindow {
    fn new(horizon: ChronoDuration) -> Self {
        Self {
            events: VecDeque::new(),
            horizon,
        }
    }

    fn insert(&mut self, ts: DateTime<Utc>) {
        // Events almost always arrive in order; this is a push_back then.
        let idx = self.events.partition_point(|t| *t <= ts);
        self.events.insert(idx, ts);
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn count(&self, window: ChronoDuration, now: DateTime<Utc>) -> u64 {
        let start = now - window;
        let lo = self.events.partition_point(|t| *t <= start);
        let hi = self.events.partition_point(|t| *t <= now);
        hi.saturating_sub(lo) as u64
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(365))
}

/// Concurrent sliding-window tracker.
///
/// Each key is behind its own DashMap shard lock, so writers for different
/// keys never contend and writers for the same key are serialized.
pub struct RateWindowTracker {
    windows: DashMap<RateKey, EventWindow>,
    default_horizon: ChronoDuration,
}

impl Default for RateWindowTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateWindowTracker {
    pub fn new() -> Self {
        Self::with_horizon(DEFAULT_HORIZON)
    }

    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            default_horizon: to_chrono(horizon),
        }
    }

    pub fn record(&self, key: RateKey, timestamp: DateTime<Utc>) {
        let mut window = self
            .windows
            .entry(key)
            .or_insert_with(|| EventWindow::new(self.default_horizon));
        window.insert(timestamp);
        let cutoff = timestamp - window.horizon;
        window.evict_before(cutoff);
    }

    /// Events in `(now - window, now]`.
    pub fn rate_at(&self, key: RateKey, window: Duration, now: DateTime<Utc>) -> u64 {
        let window = to_chrono(window);
        match self.windows.get_mut(&key) {
            Some(mut entry) => {
                if window > entry.horizon {
                    entry.horizon = window;
                }
                let cutoff = now - entry.horizon;
                entry.evict_before(cutoff);
                entry.count(window, now)
            }
            None => 0,
        }
    }

    pub fn rate(&self, key: RateKey, window: Duration) -> u64 {
        self.rate_at(key, window, Utc::now())
    }

    /// Drop events past each key's horizon, and keys left empty.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.windows.retain(|_, window| {
            let cutoff = now - window.horizon;
            window.evict_before(cutoff);
            !window.events.is_empty()
        });
    }

    pub fn tracked_keys(&self, kind: RateKind) -> Vec<RateKey> {
        self.windows
            .iter()
            .filter(|e| e.key().kind == kind)
            .map(|e| *e.key())
            .collect()
    }
}

// ============================================================================
// SLOWMODE HYSTERESIS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityLevel {
    High,
    Medium,
    Low,
}

impl ActivityLevel {
    pub fn classify(rate: u64, settings: &MessageRateSettings) -> Self {
        if rate >= settings.high_rate_threshold {
            ActivityLevel::High
        } else if rate <= settings.low_rate_threshold {
            ActivityLevel::Low
        } else {
            ActivityLevel::Medium
        }
    }
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityLevel::High => f.write_str("High"),
            ActivityLevel::Medium => f.write_str("Medium"),
            ActivityLevel::Low => f.write_str("Low"),
        }
    }
}

/// Two-threshold slowmode decision. `None` between the thresholds.
pub fn slowmode_request(rate: u64, settings: &MessageRateSettings) -> Option<u64> {
    match ActivityLevel::classify(rate, settings) {
        ActivityLevel::High => Some(settings.high_rate_slowmode_seconds),
        ActivityLevel::Low => Some(settings.low_rate_slowmode_seconds),
        ActivityLevel::Medium => None,
    }
}
