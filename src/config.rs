use std::str::FromStr;
use std::time::Duration;

use ulid::Ulid;

use crate::model::{Appointment, Ms, MINUTE_MS};

/// Who may move a confirmed appointment to cancelled, and until when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationPolicy {
    pub client_may_cancel: bool,
    pub owner_may_cancel: bool,
    /// Clients must cancel at least this long before the start. `None` = any time.
    pub client_cutoff_ms: Option<Ms>,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            client_may_cancel: true,
            owner_may_cancel: true,
            client_cutoff_ms: None,
        }
    }
}

impl CancellationPolicy {
    pub fn permits(&self, actor_id: Ulid, owner_id: Ulid, appointment: &Appointment, now: Ms) -> bool {
        if self.owner_may_cancel && actor_id == owner_id {
            return true;
        }
        self.client_may_cancel
            && actor_id == appointment.client_id
            && self
                .client_cutoff_ms
                .is_none_or(|cutoff| now <= appointment.span.start.saturating_sub(cutoff))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How far in the past a reservation start may lie (clock skew, slow clients).
    pub booking_grace_ms: Ms,
    /// Upper bound on one commit, lock wait included.
    pub commit_timeout: Duration,
    /// Attempts for a reservation whose WAL write failed.
    pub commit_attempts: u32,
    pub cancellation: CancellationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            booking_grace_ms: 5 * MINUTE_MS,
            commit_timeout: Duration::from_secs(5),
            commit_attempts: 3,
            cancellation: CancellationPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Read `SLOTD_*` overrides; unset or unparsable values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn get<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        let defaults = Self::default();
        let cancellation = CancellationPolicy {
            client_may_cancel: get(&lookup, "SLOTD_CLIENT_CANCEL")
                .unwrap_or(defaults.cancellation.client_may_cancel),
            owner_may_cancel: get(&lookup, "SLOTD_OWNER_CANCEL")
                .unwrap_or(defaults.cancellation.owner_may_cancel),
            client_cutoff_ms: get::<u32>(&lookup, "SLOTD_CLIENT_CANCEL_CUTOFF_MINS")
                .and_then(|mins| Ms::from(mins).checked_mul(MINUTE_MS))
                .or(defaults.cancellation.client_cutoff_ms),
        };
        Self {
            booking_grace_ms: get::<u32>(&lookup, "SLOTD_BOOKING_GRACE_SECS")
                .and_then(|secs| Ms::from(secs).checked_mul(1000))
                .unwrap_or(defaults.booking_grace_ms),
            commit_timeout: get(&lookup, "SLOTD_COMMIT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.commit_timeout),
            commit_attempts: get::<u32>(&lookup, "SLOTD_COMMIT_ATTEMPTS")
                .unwrap_or(defaults.commit_attempts)
                .max(1),
            cancellation,
        }
    }
}
