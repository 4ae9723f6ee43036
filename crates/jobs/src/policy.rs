//! Admission and simulated-work policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use hasty_core::{DomainError, DomainResult};

use crate::job::Job;

/// Default cooldown between admissions of the same object.
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;

/// Default simulated work bounds, `[min, max)` seconds.
pub const DEFAULT_MIN_SLEEP_SECS: u32 = 15;
pub const DEFAULT_MAX_SLEEP_SECS: u32 = 45;

/// How a re-admission after the cooldown is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadmissionMode {
    /// Insert a new record per attempt (previous attempts stay queryable).
    #[default]
    Append,
    /// Overwrite the object's latest record in place.
    Rearm,
}

/// What admission should do for an object, given its latest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// No previous job: create one.
    Create,
    /// Cooldown elapsed: admit a new attempt.
    Readmit,
    /// Still cooling down.
    Reject { retry_after_secs: u64 },
}

/// Minimum time between successive admissions of one object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    window: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::from_secs(DEFAULT_COOLDOWN_SECS)
    }
}

impl CooldownPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide admission against the object's most recent job.
    pub fn evaluate(&self, latest: Option<&Job>, now: DateTime<Utc>) -> AdmissionDecision {
        let Some(latest) = latest else {
            return AdmissionDecision::Create;
        };

        let window = i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX);
        let age = latest.age_secs(now);
        if age < window {
            let remaining = window.saturating_sub(age).max(1);
            AdmissionDecision::Reject {
                retry_after_secs: remaining as u64,
            }
        } else {
            AdmissionDecision::Readmit
        }
    }
}

/// Bounds of the simulated work and the ceiling raced against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPolicy {
    min_secs: u32,
    max_secs: u32,
    ceiling: Duration,
}

impl Default for SleepPolicy {
    fn default() -> Self {
        Self {
            min_secs: DEFAULT_MIN_SLEEP_SECS,
            max_secs: DEFAULT_MAX_SLEEP_SECS,
            ceiling: Duration::from_secs(u64::from(DEFAULT_MAX_SLEEP_SECS) + 1),
        }
    }
}

impl SleepPolicy {
    /// Validate bounds: `min < max` and the ceiling strictly above `max`.
    pub fn new(min_secs: u32, max_secs: u32, ceiling: Duration) -> DomainResult<Self> {
        if min_secs >= max_secs {
            return Err(DomainError::validation(format!(
                "min sleep ({min_secs}s) must be below max sleep ({max_secs}s)"
            )));
        }
        if ceiling <= Duration::from_secs(u64::from(max_secs)) {
            return Err(DomainError::validation(format!(
                "ceiling ({}s) must exceed max sleep ({max_secs}s)",
                ceiling.as_secs_f64()
            )));
        }
        Ok(Self {
            min_secs,
            max_secs,
            ceiling,
        })
    }

    pub fn min_secs(&self) -> u32 {
        self.min_secs
    }

    pub fn max_secs(&self) -> u32 {
        self.max_secs
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Uniform pick from `[min, max)`.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        rng.gen_range(self.min_secs..self.max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hasty_core::ObjectId;
    use proptest::prelude::*;

    fn job_at(secs: i64) -> Job {
        Job::admit(
            ObjectId::parse("X").unwrap(),
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn first_admission_creates() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.evaluate(None, at(0)), AdmissionDecision::Create);
    }

    #[test]
    fn immediate_retry_is_rejected() {
        let policy = CooldownPolicy::default();
        let latest = job_at(1_000);
        assert_eq!(
            policy.evaluate(Some(&latest), at(1_000)),
            AdmissionDecision::Reject {
                retry_after_secs: 300
            }
        );
    }

    #[test]
    fn boundary_is_inclusive_of_window() {
        let policy = CooldownPolicy::default();
        let latest = job_at(1_000);
        assert!(matches!(
            policy.evaluate(Some(&latest), at(1_299)),
            AdmissionDecision::Reject {
                retry_after_secs: 1
            }
        ));
        assert_eq!(
            policy.evaluate(Some(&latest), at(1_300)),
            AdmissionDecision::Readmit
        );
    }

    #[test]
    fn sleep_policy_validates_bounds() {
        assert!(SleepPolicy::new(45, 15, Duration::from_secs(46)).is_err());
        assert!(SleepPolicy::new(15, 45, Duration::from_secs(45)).is_err());
        let p = SleepPolicy::new(15, 45, Duration::from_secs(46)).unwrap();
        assert_eq!(p.ceiling(), Duration::from_secs(46));
        assert_eq!(SleepPolicy::default(), p);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: any attempt inside the window is rejected.
        #[test]
        fn attempts_inside_window_are_rejected(
            admitted in 0i64..4_000_000_000i64,
            delta in 0i64..300i64
        ) {
            let policy = CooldownPolicy::default();
            let latest = job_at(admitted);
            let decision = policy.evaluate(Some(&latest), at(admitted + delta));
            prop_assert!(
                matches!(decision, AdmissionDecision::Reject { .. }),
                "expected rejection, got {:?}",
                decision
            );
        }

        /// Property: any attempt at or after the window is readmitted.
        #[test]
        fn attempts_after_window_are_readmitted(
            admitted in 0i64..4_000_000_000i64,
            delta in 300i64..10_000_000i64
        ) {
            let policy = CooldownPolicy::default();
            let latest = job_at(admitted);
            prop_assert_eq!(
                policy.evaluate(Some(&latest), at(admitted + delta)),
                AdmissionDecision::Readmit
            );
        }

        /// Property: picked sleep times stay within `[min, max)`.
        #[test]
        fn picked_sleep_stays_in_bounds(seed in any::<u64>()) {
            use rand::SeedableRng;
            let policy = SleepPolicy::default();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let picked = policy.pick(&mut rng);
            prop_assert!((15..45).contains(&picked));
        }
    }
}
