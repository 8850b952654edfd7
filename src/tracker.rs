use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::error::LimiterError;

pub const DEFAULT_TTL_SECONDS: i64 = 180;
pub const DEFAULT_GRACE_SECONDS: i64 = 5;

/// Tie-break rule for choosing among stable sessions once the cap is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitPolicy {
    #[default]
    NewWins,
    OldWins,
}

impl LimitPolicy {
    /// Parse the policy column. `None` means the default; an unknown string
    /// is a configuration error rather than a silent default, since the two
    /// policies evict opposite sessions.
    pub fn from_column(value: Option<&str>) -> Result<Self, LimiterError> {
        match value {
            None | Some("new_wins") => Ok(Self::NewWins),
            Some("old_wins") => Ok(Self::OldWins),
            Some(other) => Err(LimiterError::InvalidPolicy(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewWins => "new_wins",
            Self::OldWins => "old_wins",
        }
    }
}

/// Per-peer limit configuration, one row per peer per interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLimitSettings {
    /// Concurrent session cap. `None` means unlimited.
    pub max_concurrent: Option<u32>,
    pub policy: LimitPolicy,
    pub ttl_seconds: i64,
    pub grace_seconds: i64,
}

impl Default for PeerLimitSettings {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            policy: LimitPolicy::NewWins,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            grace_seconds: DEFAULT_GRACE_SECONDS,
        }
    }
}

impl PeerLimitSettings {
    /// Build settings from raw column values, applying every coercion rule
    /// in one place: a non-positive cap means unlimited, the TTL floor is
    /// one second, and negative grace clamps to zero.
    pub fn from_columns(
        max_concurrent: Option<i64>,
        connection_policy: Option<&str>,
        session_ttl: Option<i64>,
        grace_seconds: Option<i64>,
    ) -> Result<Self, LimiterError> {
        Ok(Self {
            max_concurrent: max_concurrent.filter(|max| *max > 0).map(|max| max as u32),
            policy: LimitPolicy::from_column(connection_policy)?,
            ttl_seconds: session_ttl.unwrap_or(DEFAULT_TTL_SECONDS).max(1),
            grace_seconds: grace_seconds.unwrap_or(DEFAULT_GRACE_SECONDS).max(0),
        })
    }
}

/// One observed endpoint for one peer on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub endpoint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_delta: u64,
    pub tx_delta: u64,
}

type SessionKey = (String, String);

/// In-memory session state machine keyed by (interface, peer).
///
/// State is process-local and lost on restart; the SQL snapshot exists for
/// observability, not correctness.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<SessionKey, Vec<PeerSession>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire(&mut self, key: &SessionKey, ttl_seconds: i64, now: DateTime<Utc>) {
        if let Some(sessions) = self.sessions.get_mut(key) {
            let expiry = now - Duration::seconds(ttl_seconds.max(1));
            sessions.retain(|session| session.last_seen >= expiry);
            if sessions.is_empty() {
                self.sessions.remove(key);
            }
        }
    }

    /// Record one observation of a peer's current endpoint and return a
    /// snapshot of every session still tracked for the peer.
    ///
    /// Counters are cumulative, so deltas clamp to zero across resets. An
    /// observation with no traffic does not refresh `last_seen`: the kernel
    /// keeps reporting the last endpoint long after the client roamed away,
    /// and a silent endpoint must age out on schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &mut self,
        interface: &str,
        peer_id: &str,
        endpoint: Option<&str>,
        latest_handshake: u64,
        rx_bytes: u64,
        tx_bytes: u64,
        settings: &PeerLimitSettings,
        now: DateTime<Utc>,
    ) -> Vec<PeerSession> {
        let key = (interface.to_string(), peer_id.to_string());
        self.expire(&key, settings.ttl_seconds, now);

        let endpoint = endpoint.unwrap_or("").trim();
        if endpoint.is_empty() || endpoint.eq_ignore_ascii_case("(none)") {
            return self.sessions.get(&key).cloned().unwrap_or_default();
        }

        let handshake = if latest_handshake > 0 {
            DateTime::from_timestamp(latest_handshake as i64, 0)
        } else {
            None
        };

        let sessions = self.sessions.entry(key).or_default();
        if let Some(existing) = sessions.iter_mut().find(|s| s.endpoint == endpoint) {
            let rx_delta = rx_bytes.saturating_sub(existing.rx_bytes);
            let tx_delta = tx_bytes.saturating_sub(existing.tx_bytes);
            if rx_delta > 0 || tx_delta > 0 {
                existing.last_seen = now;
            }
            existing.rx_bytes = rx_bytes;
            existing.tx_bytes = tx_bytes;
            existing.rx_delta = rx_delta;
            existing.tx_delta = tx_delta;
            if let Some(handshake) = handshake {
                // Handshakes are monotonic within a session.
                if existing.last_handshake.map_or(true, |stored| handshake > stored) {
                    existing.last_handshake = Some(handshake);
                }
            }
        } else {
            sessions.push(PeerSession {
                endpoint: endpoint.to_string(),
                first_seen: now,
                last_seen: now,
                last_handshake: handshake,
                rx_bytes,
                tx_bytes,
                rx_delta: 0,
                tx_delta: 0,
            });
        }

        sessions.clone()
    }

    /// Sessions still inside the TTL window, most recently seen first.
    pub fn active_sessions(
        &self,
        interface: &str,
        peer_id: &str,
        settings: &PeerLimitSettings,
        now: DateTime<Utc>,
    ) -> Vec<PeerSession> {
        let key = (interface.to_string(), peer_id.to_string());
        let ttl_window = now - Duration::seconds(settings.ttl_seconds.max(1));
        let mut active: Vec<PeerSession> = self
            .sessions
            .get(&key)
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|session| session.last_seen >= ttl_window)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        active.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        active
    }

    /// The subset of active sessions the firewall should accept.
    ///
    /// Sessions still inside the grace window are always admitted, over the
    /// cap if need be: surviving the grace period is how a fresh endpoint
    /// proves the client genuinely moved there, and how it earns the right
    /// to displace a stable one under `new_wins`. The remaining slots go to
    /// stable sessions in policy order.
    pub fn allowed_sessions(
        &self,
        interface: &str,
        peer_id: &str,
        settings: &PeerLimitSettings,
        now: DateTime<Utc>,
    ) -> Vec<PeerSession> {
        let active = self.active_sessions(interface, peer_id, settings, now);
        let max_concurrent = match settings.max_concurrent {
            Some(max) => max as usize,
            None => return active,
        };

        let grace_window = now - Duration::seconds(settings.grace_seconds.max(0));
        let (grace, stable): (Vec<PeerSession>, Vec<PeerSession>) = active
            .into_iter()
            .partition(|session| session.first_seen >= grace_window);

        let mut allowed = Vec::new();
        let mut seen = HashSet::new();
        for session in grace {
            if seen.insert(session.endpoint.clone()) {
                allowed.push(session);
            }
        }

        let ordered = match settings.policy {
            // Most recently seen first, as active_sessions returns them.
            LimitPolicy::NewWins => stable,
            LimitPolicy::OldWins => {
                let mut stable = stable;
                stable.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
                stable
            },
        };
        let mut remaining = max_concurrent;
        for session in ordered {
            if remaining == 0 {
                break;
            }
            if seen.insert(session.endpoint.clone()) {
                allowed.push(session);
                remaining -= 1;
            }
        }

        allowed
    }

    /// Forget all state for a key. Used when a peer is deleted from the
    /// surrounding configuration; TTL expiry covers the same ground
    /// eventually.
    pub fn prune_peer(&mut self, interface: &str, peer_id: &str) {
        self.sessions
            .remove(&(interface.to_string(), peer_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EP1: &str = "10.0.0.1:50000";
    const EP2: &str = "10.0.0.2:50001";

    fn at(unix: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(unix, 0).unwrap()
    }

    fn limited(max: u32, policy: LimitPolicy, grace: i64) -> PeerLimitSettings {
        PeerLimitSettings {
            max_concurrent: Some(max),
            policy,
            grace_seconds: grace,
            ..PeerLimitSettings::default()
        }
    }

    fn endpoints(sessions: &[PeerSession]) -> Vec<&str> {
        sessions.iter().map(|s| s.endpoint.as_str()).collect()
    }

    #[test]
    fn settings_defaults_and_coercion() {
        let settings = PeerLimitSettings::from_columns(None, None, None, None).unwrap();
        assert_eq!(settings, PeerLimitSettings::default());
        assert_eq!(settings.max_concurrent, None);
        assert_eq!(settings.policy, LimitPolicy::NewWins);
        assert_eq!(settings.ttl_seconds, 180);
        assert_eq!(settings.grace_seconds, 5);

        let settings =
            PeerLimitSettings::from_columns(Some(0), Some("old_wins"), Some(60), Some(10)).unwrap();
        assert_eq!(settings.max_concurrent, None);
        assert_eq!(settings.policy, LimitPolicy::OldWins);
        assert_eq!(settings.ttl_seconds, 60);
        assert_eq!(settings.grace_seconds, 10);

        let settings =
            PeerLimitSettings::from_columns(Some(-3), None, Some(0), Some(-1)).unwrap();
        assert_eq!(settings.max_concurrent, None);
        assert_eq!(settings.ttl_seconds, 1);
        assert_eq!(settings.grace_seconds, 0);
    }

    #[test]
    fn settings_reject_unknown_policy() {
        let err = PeerLimitSettings::from_columns(Some(1), Some("coin_flip"), None, None)
            .unwrap_err();
        assert!(matches!(err, LimiterError::InvalidPolicy(p) if p == "coin_flip"));
    }

    #[test]
    fn new_wins_evicts_the_older_session() {
        let mut tracker = SessionTracker::new();
        let settings = limited(1, LimitPolicy::NewWins, 0);
        let now = at(1_700_000_000);

        tracker.observe("wg0", "peer", Some(EP1), 0, 100, 0, &settings, now - Duration::seconds(5));
        tracker.observe("wg0", "peer", Some(EP2), 0, 200, 0, &settings, now);

        // On the grace boundary both endpoints are still admitted.
        let sessions = tracker.allowed_sessions("wg0", "peer", &settings, now);
        let allowed: HashSet<_> = endpoints(&sessions).into_iter().collect();
        assert_eq!(allowed, HashSet::from([EP1, EP2]));

        let later = now + Duration::seconds(1);
        let allowed = tracker.allowed_sessions("wg0", "peer", &settings, later);
        assert_eq!(endpoints(&allowed), vec![EP2]);
    }

    #[test]
    fn old_wins_keeps_the_original_session() {
        let mut tracker = SessionTracker::new();
        let settings = limited(1, LimitPolicy::OldWins, 0);
        let now = at(1_700_000_000);

        tracker.observe("wg0", "peer", Some(EP1), 0, 100, 0, &settings, now - Duration::seconds(10));
        tracker.observe("wg0", "peer", Some(EP2), 0, 200, 0, &settings, now);

        let later = now + Duration::seconds(1);
        let allowed = tracker.allowed_sessions("wg0", "peer", &settings, later);
        assert_eq!(endpoints(&allowed), vec![EP1]);
    }

    #[test]
    fn grace_window_admits_both_then_new_displaces_old() {
        let mut tracker = SessionTracker::new();
        let settings = limited(1, LimitPolicy::NewWins, 10);
        let now = at(1_700_000_000);

        tracker.observe("wg0", "peer", Some(EP1), 0, 100, 0, &settings, now - Duration::seconds(20));
        tracker.observe("wg0", "peer", Some(EP2), 0, 200, 0, &settings, now);

        let midway = now + Duration::seconds(5);
        let sessions = tracker.allowed_sessions("wg0", "peer", &settings, midway);
        let allowed: HashSet<_> = endpoints(&sessions).into_iter().collect();
        assert_eq!(allowed, HashSet::from([EP1, EP2]));

        let after_grace = now + Duration::seconds(11);
        let allowed = tracker.allowed_sessions("wg0", "peer", &settings, after_grace);
        assert_eq!(endpoints(&allowed), vec![EP2]);
    }

    #[test]
    fn sessions_expire_after_ttl() {
        let mut tracker = SessionTracker::new();
        let settings = PeerLimitSettings {
            max_concurrent: Some(1),
            ttl_seconds: 5,
            ..PeerLimitSettings::default()
        };
        let now = at(1_700_000_000);

        tracker.observe("wg0", "peer", Some(EP1), 0, 100, 0, &settings, now - Duration::seconds(10));
        assert!(tracker.active_sessions("wg0", "peer", &settings, now).is_empty());

        // The next observation also garbage-collects the expired entry.
        let snapshot = tracker.observe("wg0", "peer", Some(EP2), 0, 0, 0, &settings, now);
        assert_eq!(endpoints(&snapshot), vec![EP2]);
    }

    #[test]
    fn unlimited_settings_allow_everything() {
        let mut tracker = SessionTracker::new();
        let settings = PeerLimitSettings::default();
        let now = at(1_700_000_000);

        for (i, endpoint) in ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"].iter().enumerate() {
            tracker.observe("wg0", "peer", Some(endpoint), 0, i as u64, 0, &settings, now);
        }
        assert_eq!(tracker.allowed_sessions("wg0", "peer", &settings, now).len(), 3);
    }

    #[test]
    fn cap_holds_once_grace_has_passed() {
        let mut tracker = SessionTracker::new();
        let settings = limited(2, LimitPolicy::NewWins, 0);
        let now = at(1_700_000_000);

        for (i, endpoint) in ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3", "10.0.0.4:4"]
            .iter()
            .enumerate()
        {
            tracker.observe(
                "wg0",
                "peer",
                Some(endpoint),
                0,
                100,
                0,
                &settings,
                now - Duration::seconds(10 - i as i64),
            );
        }

        let allowed = tracker.allowed_sessions("wg0", "peer", &settings, now);
        assert_eq!(endpoints(&allowed), vec!["10.0.0.4:4", "10.0.0.3:3"]);
    }

    #[test]
    fn idle_observation_preserves_last_seen() {
        let mut tracker = SessionTracker::new();
        let settings = PeerLimitSettings::default();
        let first = at(1_700_000_000);
        let second = first + Duration::seconds(30);

        tracker.observe("wg0", "peer", Some(EP1), 0, 1000, 500, &settings, first);
        let snapshot = tracker.observe("wg0", "peer", Some(EP1), 0, 1000, 500, &settings, second);
        assert_eq!(snapshot[0].last_seen, first);
        assert_eq!(snapshot[0].rx_delta, 0);
        assert_eq!(snapshot[0].tx_delta, 0);

        // Any traffic refreshes it again.
        let third = second + Duration::seconds(30);
        let snapshot = tracker.observe("wg0", "peer", Some(EP1), 0, 1001, 500, &settings, third);
        assert_eq!(snapshot[0].last_seen, third);
        assert_eq!(snapshot[0].rx_delta, 1);
    }

    #[test]
    fn counter_reset_clamps_deltas_to_zero() {
        let mut tracker = SessionTracker::new();
        let settings = PeerLimitSettings::default();
        let now = at(1_700_000_000);

        tracker.observe("wg0", "peer", Some(EP1), 0, 1000, 800, &settings, now);
        let snapshot = tracker.observe(
            "wg0",
            "peer",
            Some(EP1),
            0,
            10,
            8,
            &settings,
            now + Duration::seconds(1),
        );
        assert_eq!(snapshot[0].rx_delta, 0);
        assert_eq!(snapshot[0].tx_delta, 0);
        assert_eq!(snapshot[0].rx_bytes, 10);
        assert_eq!(snapshot[0].tx_bytes, 8);
    }

    #[test]
    fn handshakes_never_move_backwards() {
        let mut tracker = SessionTracker::new();
        let settings = PeerLimitSettings::default();
        let now = at(1_700_000_000);

        tracker.observe("wg0", "peer", Some(EP1), 1_700_000_000, 1, 0, &settings, now);
        let snapshot = tracker.observe(
            "wg0",
            "peer",
            Some(EP1),
            1_699_999_000,
            2,
            0,
            &settings,
            now + Duration::seconds(1),
        );
        assert_eq!(snapshot[0].last_handshake, Some(at(1_700_000_000)));

        // A zero handshake report never clears the stored value.
        let snapshot = tracker.observe(
            "wg0",
            "peer",
            Some(EP1),
            0,
            3,
            0,
            &settings,
            now + Duration::seconds(2),
        );
        assert_eq!(snapshot[0].last_handshake, Some(at(1_700_000_000)));

        let snapshot = tracker.observe(
            "wg0",
            "peer",
            Some(EP1),
            1_700_000_060,
            4,
            0,
            &settings,
            now + Duration::seconds(3),
        );
        assert_eq!(snapshot[0].last_handshake, Some(at(1_700_000_060)));
    }

    #[test]
    fn rejected_endpoints_leave_state_untouched() {
        let mut tracker = SessionTracker::new();
        let settings = PeerLimitSettings::default();
        let now = at(1_700_000_000);

        tracker.observe("wg0", "peer", Some(EP1), 0, 1, 0, &settings, now);
        for rejected in [None, Some(""), Some("  "), Some("(none)"), Some("(None)")] {
            let snapshot = tracker.observe("wg0", "peer", rejected, 0, 2, 0, &settings, now);
            assert_eq!(endpoints(&snapshot), vec![EP1]);
            assert_eq!(snapshot[0].rx_bytes, 1);
        }
    }

    #[test]
    fn prune_peer_forgets_only_that_key() {
        let mut tracker = SessionTracker::new();
        let settings = PeerLimitSettings::default();
        let now = at(1_700_000_000);

        tracker.observe("wg0", "alice", Some(EP1), 0, 1, 0, &settings, now);
        tracker.observe("wg0", "bob", Some(EP2), 0, 1, 0, &settings, now);
        tracker.prune_peer("wg0", "alice");

        assert!(tracker.active_sessions("wg0", "alice", &settings, now).is_empty());
        assert_eq!(tracker.active_sessions("wg0", "bob", &settings, now).len(), 1);
    }
}
