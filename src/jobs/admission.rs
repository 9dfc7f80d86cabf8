//! Admission control and rate limiting.
//!
//! Four checks run, in order, before any job row exists: the in-flight
//! concurrency cap, the period quota (job count and charged cost), the
//! tier's feature set against what the request asks for, and the API key's
//! rate-limit suspension state. Each failure surfaces its own error kind.
//!
//! Successful admission increments the caller's in-flight counter and hands
//! back a ticket; [`AdmissionController::finish`] releases the slot and
//! posts the final charged cost, and is idempotent so a terminal transition
//! can never double-decrement.

use crate::error::{ExtractError, ExtractResult};
use crate::logging::{log_debug, log_info};
use crate::tier::{Tier, UserContext};
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// What the request needs from the tier's feature set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestedFeatures {
    /// Explicit `fetch_mode=dynamic`.
    pub dynamic_fetch: bool,
    /// The request targets a premium model class.
    pub premium_model: bool,
    /// The request carries its own provider credential.
    pub byok: bool,
}

/// Proof of admission. Dropped unreleased tickets are a bug; release is
/// guarded so it runs at most once.
#[derive(Debug)]
pub struct AdmissionTicket {
    user_id: String,
    period: String,
    released: AtomicBool,
}

#[derive(Debug, Default, Clone, Copy)]
struct PeriodUsage {
    jobs: u32,
    charged_cost: f64,
}

/// Process-wide admission state.
///
/// Counters are per-user atomic map entries; suspension writes are
/// serialized per key by the map shard lock. The durable mirror of the
/// quota ledger lives with the storage collaborator.
#[derive(Debug, Default)]
pub struct AdmissionController {
    in_flight: DashMap<String, u32>,
    ledger: DashMap<(String, String), PeriodUsage>,
    suspensions: DashMap<String, DateTime<Utc>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the admission checks and reserve a concurrency slot.
    pub fn admit(
        &self,
        user: &UserContext,
        requested: RequestedFeatures,
    ) -> ExtractResult<AdmissionTicket> {
        let period = period_key(Utc::now());

        // (a) In-flight cap.
        let current = self
            .in_flight
            .get(&user.user_id)
            .map(|c| *c)
            .unwrap_or(0);
        if current >= user.limits.max_concurrent_jobs {
            return Err(if user.tier == Tier::Free {
                ExtractError::free_tier_rate_limited(format!(
                    "free tier allows {} concurrent job(s)",
                    user.limits.max_concurrent_jobs
                ))
            } else {
                ExtractError::rate_limit(format!(
                    "concurrent job limit of {} reached",
                    user.limits.max_concurrent_jobs
                ))
            });
        }

        // (b) Period quota: job count and charged cost.
        let usage = self
            .ledger
            .get(&(user.user_id.clone(), period.clone()))
            .map(|u| *u)
            .unwrap_or_default();
        if usage.jobs >= user.limits.jobs_per_period {
            return Err(if user.tier == Tier::Free {
                ExtractError::free_tier_quota_exhausted(format!(
                    "free tier allowance of {} jobs is used up",
                    user.limits.jobs_per_period
                ))
            } else {
                ExtractError::tier_quota_exceeded(format!(
                    "period quota of {} jobs reached",
                    user.limits.jobs_per_period
                ))
            });
        }
        if user.limits.cost_per_period > 0.0 && usage.charged_cost >= user.limits.cost_per_period {
            return Err(ExtractError::tier_quota_exceeded(format!(
                "period spend limit of ${:.2} reached",
                user.limits.cost_per_period
            )));
        }

        // (c) Feature flags.
        let features = user.features();
        if requested.dynamic_fetch && !features.content_dynamic {
            return Err(ExtractError::tier_feature_disabled(
                "dynamic fetching is not available on this tier",
            ));
        }
        if requested.premium_model && !features.models_premium {
            return Err(ExtractError::tier_feature_disabled(
                "premium models are not available on this tier",
            ));
        }
        if requested.byok && !features.provider_byok {
            return Err(ExtractError::tier_feature_disabled(
                "bring-your-own-key is not available on this tier",
            ));
        }

        // (d) API-key suspension.
        if let Some(key_id) = &user.api_key_id {
            if self.is_suspended(key_id, Utc::now()) {
                return Err(ExtractError::rate_limit(
                    "this API key is temporarily suspended",
                ));
            }
        }

        // Reserve the slot and count the job against the period.
        *self.in_flight.entry(user.user_id.clone()).or_insert(0) += 1;
        self.ledger
            .entry((user.user_id.clone(), period.clone()))
            .or_default()
            .jobs += 1;

        log_debug!(
            user_id = %user.user_id,
            in_flight = current + 1,
            period_jobs = usage.jobs + 1,
            "Job admitted"
        );

        Ok(AdmissionTicket {
            user_id: user.user_id.clone(),
            period,
            released: AtomicBool::new(false),
        })
    }

    /// Release the slot and post the job's final charged cost. Paired with
    /// exactly one terminal transition; safe to call twice.
    pub fn finish(&self, ticket: &AdmissionTicket, charged_cost: f64) {
        if ticket.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut count) = self.in_flight.get_mut(&ticket.user_id) {
            *count = count.saturating_sub(1);
        }
        if charged_cost > 0.0 {
            self.ledger
                .entry((ticket.user_id.clone(), ticket.period.clone()))
                .or_default()
                .charged_cost += charged_cost;
        }
    }

    pub fn in_flight(&self, user_id: &str) -> u32 {
        self.in_flight.get(user_id).map(|c| *c).unwrap_or(0)
    }

    /// Suspend an API key until the given time.
    pub fn suspend_key(&self, key_id: &str, until: DateTime<Utc>) {
        log_info!(key_id = %key_id, until = %until, "API key suspended");
        self.suspensions.insert(key_id.to_string(), until);
    }

    pub fn lift_suspension(&self, key_id: &str) {
        self.suspensions.remove(key_id);
    }

    pub fn is_suspended(&self, key_id: &str, now: DateTime<Utc>) -> bool {
        let expired = match self.suspensions.get(key_id) {
            Some(until) if *until > now => return true,
            Some(_) => true,
            None => false,
        };
        if expired {
            self.suspensions.remove(key_id);
        }
        false
    }

    /// Charged cost posted for a user in the current period.
    pub fn period_spend(&self, user_id: &str) -> f64 {
        self.ledger
            .get(&(user_id.to_string(), period_key(Utc::now())))
            .map(|u| u.charged_cost)
            .unwrap_or(0.0)
    }
}

/// Billing period bucket, one per calendar month.
fn period_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}
