//! Windowed admission decisions over five rate-limit scopes: tenant/min,
//! tenant/day, domain/min, recipient-domain/min, ip/min.

use chrono::Duration;
use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::models::{Error, Plan, RateLimitRepository, RateLimitScope, TenantId};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub scope: RateLimitScope,
    pub limit: i64,
    pub count: i64,
}

impl Decision {
    fn allow(scope: RateLimitScope, limit: i64, count: i64) -> Self {
        Decision { allowed: count <= limit, scope, limit, count }
    }
}

fn limits_for(config: &RateLimitConfig, plan: Plan) -> crate::config::PlanLimits {
    match plan {
        Plan::Free => config.free,
        Plan::Pro => config.pro,
        Plan::Business => config.business,
    }
}

/// Outcome of a full admission check across all applicable scopes. `first_violation`
/// is the scope that should be surfaced to the caller.
pub struct Admission {
    pub decisions: Vec<Decision>,
}

impl Admission {
    pub fn allowed(&self) -> bool {
        self.decisions.iter().all(|d| d.allowed)
    }

    pub fn first_violation(&self) -> Option<&Decision> {
        self.decisions.iter().find(|d| !d.allowed)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: RateLimitRepository,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(buckets: RateLimitRepository, config: RateLimitConfig) -> Self {
        RateLimiter { buckets, config }
    }

    /// Admits a single outbound send attempt, incrementing all five
    /// windows. Every window is incremented even once one has already
    /// failed, since a caller that retries after a 429 should not get a
    /// second free increment against the scopes that did pass.
    pub async fn admit_send(
        &self,
        tenant_id: TenantId,
        plan: Plan,
        sender_domain: &str,
        recipient_domain: &str,
        source_ip: &str,
    ) -> Result<Admission, Error> {
        let limits = limits_for(&self.config, plan);

        let tenant_minute = self.buckets.increment(tenant_id, RateLimitScope::PerTenant, "minute", Duration::minutes(1)).await?;
        let tenant_day = self.buckets.increment(tenant_id, RateLimitScope::PerTenant, "day", Duration::days(1)).await?;
        let domain_minute =
            self.buckets.increment(tenant_id, RateLimitScope::PerDomain, sender_domain, Duration::minutes(1)).await?;
        let recipient_minute = self
            .buckets
            .increment(tenant_id, RateLimitScope::PerRecipientDomain, recipient_domain, Duration::minutes(1))
            .await?;
        let ip_minute = self.buckets.increment(tenant_id, RateLimitScope::PerIp, source_ip, Duration::minutes(1)).await?;

        Ok(Admission {
            decisions: vec![
                Decision::allow(RateLimitScope::PerTenant, limits.tenant_per_minute, tenant_minute),
                Decision::allow(RateLimitScope::PerTenant, limits.tenant_per_day, tenant_day),
                Decision::allow(RateLimitScope::PerDomain, limits.domain_per_minute, domain_minute),
                Decision::allow(RateLimitScope::PerRecipientDomain, self.config.recipient_domain_per_minute, recipient_minute),
                Decision::allow(RateLimitScope::PerIp, self.config.ip_per_minute, ip_minute),
            ],
        })
    }

    pub async fn sweep_expired(&self) -> Result<u64, Error> {
        self.buckets.sweep_expired(Duration::days(2)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn memory_pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn admits_until_tenant_minute_limit_then_rejects() {
        let pool = memory_pool().await;
        let limiter = RateLimiter::new(RateLimitRepository::new(pool), RateLimitConfig::default());
        let tenant_id = TenantId::new();

        let mut last = None;
        for _ in 0..11 {
            last = Some(limiter.admit_send(tenant_id, Plan::Free, "a.com", "b.com", "10.0.0.1").await.unwrap());
        }

        let admission = last.unwrap();
        assert!(!admission.allowed());
        let violation = admission.first_violation().unwrap();
        assert_eq!(violation.scope, RateLimitScope::PerTenant);
        assert_eq!(violation.limit, 10);
    }

    #[tokio::test]
    async fn independent_tenants_do_not_share_buckets() {
        let pool = memory_pool().await;
        let limiter = RateLimiter::new(RateLimitRepository::new(pool), RateLimitConfig::default());

        let a = limiter.admit_send(TenantId::new(), Plan::Free, "a.com", "b.com", "10.0.0.1").await.unwrap();
        let b = limiter.admit_send(TenantId::new(), Plan::Free, "a.com", "b.com", "10.0.0.1").await.unwrap();

        assert!(a.allowed());
        assert!(b.allowed());
    }
}
