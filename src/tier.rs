//! Subscription tiers, feature flags, and the limits snapshot taken at
//! admission.
//!
//! A [`Tier`] supplies default [`TierLimits`]; deployments override the
//! defaults through configuration. The limits travel with the job as a
//! snapshot so a mid-flight plan change never alters a running job's budget.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Built-in limits, used when configuration supplies no override.
    pub fn default_limits(self) -> TierLimits {
        match self {
            Self::Free => TierLimits {
                jobs_per_period: 25,
                cost_per_period: 0.0,
                max_concurrent_jobs: 1,
                crawl: CrawlClamps {
                    max_pages: 10,
                    max_urls: 50,
                    max_depth: 1,
                    min_delay_ms: 1_000,
                    max_concurrency: 1,
                },
                static_fetch_timeout: Duration::from_secs(30),
                dynamic_fetch_timeout: Duration::from_secs(60),
                features: FeatureSet {
                    content_dynamic: false,
                    models_premium: false,
                    provider_byok: false,
                    models_custom: false,
                },
            },
            Self::Starter => TierLimits {
                jobs_per_period: 500,
                cost_per_period: 20.0,
                max_concurrent_jobs: 2,
                crawl: CrawlClamps {
                    max_pages: 50,
                    max_urls: 200,
                    max_depth: 2,
                    min_delay_ms: 500,
                    max_concurrency: 2,
                },
                static_fetch_timeout: Duration::from_secs(30),
                dynamic_fetch_timeout: Duration::from_secs(60),
                features: FeatureSet {
                    content_dynamic: false,
                    models_premium: false,
                    provider_byok: true,
                    models_custom: false,
                },
            },
            Self::Pro => TierLimits {
                jobs_per_period: 5_000,
                cost_per_period: 200.0,
                max_concurrent_jobs: 5,
                crawl: CrawlClamps {
                    max_pages: 500,
                    max_urls: 2_000,
                    max_depth: 5,
                    min_delay_ms: 200,
                    max_concurrency: 5,
                },
                static_fetch_timeout: Duration::from_secs(30),
                dynamic_fetch_timeout: Duration::from_secs(60),
                features: FeatureSet {
                    content_dynamic: true,
                    models_premium: true,
                    provider_byok: true,
                    models_custom: true,
                },
            },
            Self::Enterprise => TierLimits {
                jobs_per_period: 100_000,
                cost_per_period: 5_000.0,
                max_concurrent_jobs: 25,
                crawl: CrawlClamps {
                    max_pages: 5_000,
                    max_urls: 20_000,
                    max_depth: 10,
                    min_delay_ms: 0,
                    max_concurrency: 10,
                },
                static_fetch_timeout: Duration::from_secs(30),
                dynamic_fetch_timeout: Duration::from_secs(60),
                features: FeatureSet {
                    content_dynamic: true,
                    models_premium: true,
                    provider_byok: true,
                    models_custom: true,
                },
            },
        }
    }
}

/// Feature flags gating request options at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeatureSet {
    /// Headless-browser fetching (`fetch_mode=dynamic` and auto escalation).
    pub content_dynamic: bool,
    /// Premium model classes.
    pub models_premium: bool,
    /// Bring-your-own provider credentials.
    pub provider_byok: bool,
    /// User-managed fallback chains.
    pub models_custom: bool,
}

/// Clamps applied to crawl options at admission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrawlClamps {
    pub max_pages: u32,
    pub max_urls: u32,
    pub max_depth: u32,
    /// Floor for the pacing delay; requests may only slow down.
    pub min_delay_ms: u64,
    pub max_concurrency: u32,
}

/// The full limit set for one tier, snapshotted onto jobs at admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Jobs admitted per billing period.
    pub jobs_per_period: u32,
    /// Charged cost admitted per billing period, USD.
    pub cost_per_period: f64,
    /// In-flight job cap per user.
    pub max_concurrent_jobs: u32,
    pub crawl: CrawlClamps,
    #[serde(with = "duration_secs")]
    pub static_fetch_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub dynamic_fetch_timeout: Duration,
    pub features: FeatureSet,
}

/// The authenticated caller as handed to the core by the identity layer.
///
/// Identity issuance itself is a collaborator concern; the core only
/// consumes the resolved user, tier, and optional API-key identity.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub tier: Tier,
    pub limits: TierLimits,
    /// Set when the caller authenticated with an API key; used for
    /// rate-limit suspension checks.
    pub api_key_id: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
            limits: tier.default_limits(),
            api_key_id: None,
        }
    }

    pub fn with_api_key(mut self, key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(key_id.into());
        self
    }

    pub fn features(&self) -> FeatureSet {
        self.limits.features
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_tier_has_no_premium_features() {
        let limits = Tier::Free.default_limits();
        assert!(!limits.features.content_dynamic);
        assert!(!limits.features.models_premium);
        assert!(!limits.features.provider_byok);
        assert!(!limits.features.models_custom);
    }

    #[test]
    fn limits_grow_monotonically_with_tier() {
        let tiers = [Tier::Free, Tier::Starter, Tier::Pro, Tier::Enterprise];
        for pair in tiers.windows(2) {
            let (lo, hi) = (pair[0].default_limits(), pair[1].default_limits());
            assert!(hi.jobs_per_period > lo.jobs_per_period);
            assert!(hi.max_concurrent_jobs >= lo.max_concurrent_jobs);
            assert!(hi.crawl.max_pages > lo.crawl.max_pages);
            assert!(hi.crawl.min_delay_ms <= lo.crawl.min_delay_ms);
        }
    }

    #[test]
    fn limits_snapshot_round_trips_through_json() {
        let limits = Tier::Pro.default_limits();
        let json = serde_json::to_string(&limits).unwrap();
        let back: TierLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, limits);
    }
}
