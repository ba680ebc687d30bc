// Raid detection on top of the join-rate window.
//
// A guild is either normal or raiding. Crossing the join threshold while
// normal emits exactly one RaidStart; the guild only returns to normal after
// the join rate has stayed under the threshold for a full timeframe.

use crate::core::moderation::JoinSignal;
use crate::core::policy::{RaidAutoAction, RaidDefenseSettings};
use crate::core::rate_limit::{RateKey, RateWindowTracker};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RECENT_JOINS: usize = 500;

/// Account-age score: higher is more suspicious.
pub fn suspicion_score(account_age: ChronoDuration) -> u8 {
    if account_age < ChronoDuration::days(1) {
        3
    } else if account_age < ChronoDuration::weeks(1) {
        2
    } else if account_age < ChronoDuration::days(30) {
        1
    } else {
        0
    }
}

pub fn is_suspicious(signal: &JoinSignal) -> bool {
    suspicion_score(signal.joined_at - signal.account_created_at) >= 2
}

/// Emitted once per raid window.
#[derive(Debug, Clone, PartialEq)]
pub struct RaidStart {
    pub guild_id: u64,
    pub join_count: u64,
    pub auto_action: RaidAutoAction,
    pub started_at: DateTime<Utc>,
    /// Young accounts that joined inside the raid window.
    pub suspicious_users: Vec<u64>,
}

impl RaidStart {
    pub fn source_event_id(&self) -> String {
        format!(
            "raid:{}:{}",
            self.guild_id,
            self.started_at.timestamp_millis()
        )
    }
}

#[derive(Debug, Clone)]
struct RaidState {
    started_at: DateTime<Utc>,
    last_above: DateTime<Utc>,
    below_since: Option<DateTime<Utc>>,
}

pub struct RaidDetector {
    tracker: Arc<RateWindowTracker>,
    // Present only while the guild is raiding.
    raids: DashMap<u64, RaidState>,
    recent_joins: DashMap<u64, VecDeque<JoinSignal>>,
}

impl RaidDetector {
    pub fn new(tracker: Arc<RateWindowTracker>) -> Self {
        Self {
            tracker,
            raids: DashMap::new(),
            recent_joins: DashMap::new(),
        }
    }

    pub fn is_raiding(&self, guild_id: u64) -> bool {
        self.raids.contains_key(&guild_id)
    }

    /// Record a join and decide whether it starts a raid.
    pub fn observe_join(
        &self,
        signal: &JoinSignal,
        settings: &RaidDefenseSettings,
    ) -> Option<RaidStart> {
        let key = RateKey::joins(signal.guild_id);
        self.tracker.record(key, signal.joined_at);
        self.remember_join(signal, settings);

        if !settings.enabled {
            return None;
        }

        let rate = self.tracker.rate_at(key, timeframe(settings), signal.joined_at);
        self.evaluate(signal.guild_id, rate, signal.joined_at, settings)
    }

    /// Periodic re-evaluation so a raid can end while no one is joining.
    pub fn tick(&self, guild_id: u64, settings: &RaidDefenseSettings, now: DateTime<Utc>) {
        if !self.is_raiding(guild_id) {
            return;
        }
        let rate = self
            .tracker
            .rate_at(RateKey::joins(guild_id), timeframe(settings), now);
        // Rate only rises on a join, so a tick can never start a raid.
        let _ = self.evaluate(guild_id, rate, now, settings);
    }

    fn evaluate(
        &self,
        guild_id: u64,
        rate: u64,
        now: DateTime<Utc>,
        settings: &RaidDefenseSettings,
    ) -> Option<RaidStart> {
        let tf = ChronoDuration::seconds(settings.join_timeframe_seconds as i64);

        if rate >= settings.join_threshold {
            let mut started = false;
            self.raids
                .entry(guild_id)
                .and_modify(|state| {
                    state.last_above = now;
                    state.below_since = None;
                })
                .or_insert_with(|| {
                    started = true;
                    RaidState {
                        started_at: now,
                        last_above: now,
                        below_since: None,
                    }
                });

            if !started {
                return None;
            }

            let suspicious_users = self.suspicious_since(guild_id, now - tf);
            warn!(
                guild_id,
                join_count = rate,
                suspicious = suspicious_users.len(),
                "Raid detected"
            );
            return Some(RaidStart {
                guild_id,
                join_count: rate,
                auto_action: settings.auto_action,
                started_at: now,
                suspicious_users,
            });
        }

        let ended = match self.raids.get_mut(&guild_id) {
            Some(mut state) => {
                // The rate cannot have stayed above threshold past last_above + tf.
                let fell = state
                    .below_since
                    .unwrap_or(now)
                    .min(state.last_above + tf);
                state.below_since = Some(fell);
                now - fell >= tf
            }
            None => false,
        };

        if ended {
            if let Some((_, state)) = self.raids.remove(&guild_id) {
                info!(
                    guild_id,
                    lasted_secs = (now - state.started_at).num_seconds(),
                    "Raid ended"
                );
            }
        }
        None
    }

    fn remember_join(&self, signal: &JoinSignal, settings: &RaidDefenseSettings) {
        let horizon = signal.joined_at
            - ChronoDuration::seconds(settings.join_timeframe_seconds.max(1) as i64);
        let mut joins = self.recent_joins.entry(signal.guild_id).or_default();
        joins.push_back(signal.clone());
        while joins
            .front()
            .is_some_and(|j| j.joined_at <= horizon || joins.len() > MAX_RECENT_JOINS)
        {
            joins.pop_front();
        }
    }

    fn suspicious_since(&self, guild_id: u64, since: DateTime<Utc>) -> Vec<u64> {
        let Some(joins) = self.recent_joins.get(&guild_id) else {
            return Vec::new();
        };
        let mut users: Vec<u64> = joins
            .iter()
            .filter(|j| j.joined_at > since && is_suspicious(j))
            .map(|j| j.user_id)
            .collect();
        users.dedup();
        users
    }

    /// Guilds with recent join activity or an active raid.
    pub fn active_guilds(&self) -> Vec<u64> {
        let mut guilds: Vec<u64> = self.recent_joins.iter().map(|e| *e.key()).collect();
        guilds.extend(self.raids.iter().map(|e| *e.key()));
        guilds.sort_unstable();
        guilds.dedup();
        guilds
    }

    /// Forget join history older than `horizon`.
    pub fn sweep(&self, horizon: DateTime<Utc>) {
        self.recent_joins.retain(|guild_id, joins| {
            while joins.front().is_some_and(|j| j.joined_at <= horizon) {
                joins.pop_front();
            }
            !joins.is_empty() || self.raids.contains_key(guild_id)
        });
    }
}

fn timeframe(settings: &RaidDefenseSettings) -> Duration {
    Duration::from_secs(settings.join_timeframe_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn settings() -> RaidDefenseSettings {
        RaidDefenseSettings {
            enabled: true,
            join_threshold: 10,
            join_timeframe_seconds: 60,
            auto_action: RaidAutoAction::Lockdown,
            alert_channel: None,
        }
    }

    fn join(user_id: u64, secs: i64) -> JoinSignal {
        JoinSignal {
            guild_id: 1,
            user_id,
            account_created_at: at(secs) - ChronoDuration::days(365),
            joined_at: at(secs),
        }
    }

    #[test]
    fn ten_joins_in_a_minute_start_exactly_one_raid() {
        let detector = RaidDetector::new(Arc::new(RateWindowTracker::new()));
        let settings = settings();

        let starts: Vec<RaidStart> = (0..15)
            .filter_map(|i| detector.observe_join(&join(i, i as i64 * 3), &settings))
            .collect();

        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].join_count, 10);
        assert_eq!(starts[0].auto_action, RaidAutoAction::Lockdown);
        assert_eq!(starts[0].started_at, at(27));
        assert!(detector.is_raiding(1));
    }

    #[test]
    fn nine_joins_do_not_trigger() {
        let detector = RaidDetector::new(Arc::new(RateWindowTracker::new()));
        let settings = settings();
        for i in 0..9 {
            assert!(detector.observe_join(&join(i, i as i64), &settings).is_none());
        }
        assert!(!detector.is_raiding(1));
    }

    #[test]
    fn no_second_raid_until_rate_stays_low_for_a_full_timeframe() {
        let detector = RaidDetector::new(Arc::new(RateWindowTracker::new()));
        let settings = settings();

        // Burst at t=0..9: raid starts on the tenth join.
        let first: Vec<_> = (0..10)
            .filter_map(|i| detector.observe_join(&join(i, i as i64), &settings))
            .collect();
        assert_eq!(first.len(), 1);

        // Rate is under the threshold from t=60 at the latest; the raid needs
        // a full quiet minute after that before it ends.
        detector.tick(1, &settings, at(90));
        assert!(detector.is_raiding(1));
        detector.tick(1, &settings, at(110));
        assert!(detector.is_raiding(1));

        // A new burst while still raiding is suppressed.
        for i in 0..10 {
            assert!(detector
                .observe_join(&join(100 + i, 111 + i as i64), &settings)
                .is_none());
        }

        // That burst keeps the raid alive; it must calm down again first.
        detector.tick(1, &settings, at(200));
        assert!(detector.is_raiding(1));
        detector.tick(1, &settings, at(240));
        assert!(!detector.is_raiding(1));

        let again: Vec<_> = (0..10)
            .filter_map(|i| detector.observe_join(&join(200 + i, 300 + i as i64), &settings))
            .collect();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn disabled_raid_defense_never_triggers() {
        let detector = RaidDetector::new(Arc::new(RateWindowTracker::new()));
        let mut settings = settings();
        settings.enabled = false;

        for i in 0..20 {
            assert!(detector.observe_join(&join(i, 0), &settings).is_none());
        }
    }

    #[test]
    fn raid_start_lists_young_accounts_only() {
        let detector = RaidDetector::new(Arc::new(RateWindowTracker::new()));
        let settings = settings();

        let mut start = None;
        for i in 0..10 {
            let mut signal = join(i, i as i64);
            if i % 2 == 0 {
                signal.account_created_at = signal.joined_at - ChronoDuration::hours(3);
            }
            start = start.or(detector.observe_join(&signal, &settings));
        }

        let start = start.unwrap();
        assert_eq!(start.suspicious_users, vec![0, 2, 4, 6, 8]);
        assert_eq!(start.source_event_id(), format!("raid:1:{}", at(9).timestamp_millis()));
    }

    #[test]
    fn suspicion_scores_follow_account_age() {
        assert_eq!(suspicion_score(ChronoDuration::hours(2)), 3);
        assert_eq!(suspicion_score(ChronoDuration::days(3)), 2);
        assert_eq!(suspicion_score(ChronoDuration::days(20)), 1);
        assert_eq!(suspicion_score(ChronoDuration::days(400)), 0);
    }
}
