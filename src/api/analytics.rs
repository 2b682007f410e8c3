//! `GET /analytics/overview`: tenant-scoped send/delivery
//! rollups for dashboard display.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::models::{Permission, RollupBucket, RollupCount};

use super::auth::authorize;
use super::error::ApiError;
use super::ApiState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Today,
    Week,
    Month,
}

#[derive(Debug, Deserialize)]
pub struct OverviewQuery {
    #[serde(default = "default_period")]
    period: Period,
}

fn default_period() -> Period {
    Period::Today
}

fn window_for(period: &Period) -> (RollupBucket, chrono::DateTime<Utc>) {
    let now = Utc::now();
    match period {
        Period::Today => (RollupBucket::Hour, now - chrono::Duration::hours(24)),
        Period::Week => (RollupBucket::Day, now - chrono::Duration::days(7)),
        Period::Month => (RollupBucket::Day, now - chrono::Duration::days(30)),
    }
}

pub async fn overview(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<OverviewQuery>,
) -> Result<Json<Vec<RollupCount>>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ReadAnalytics).await?;
    let (bucket, since) = window_for(&query.period);
    let rollup = state.analytics.rollup(caller.tenant.id, bucket, since).await?;
    Ok(Json(rollup))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn today_uses_hourly_buckets_over_a_day() {
        let (bucket, since) = window_for(&Period::Today);
        assert_eq!(bucket, RollupBucket::Hour);
        let elapsed = Utc::now() - since;
        assert!(elapsed >= chrono::Duration::hours(24) && elapsed < chrono::Duration::hours(25));
    }

    #[test]
    fn week_and_month_use_daily_buckets() {
        let (bucket, since) = window_for(&Period::Week);
        assert_eq!(bucket, RollupBucket::Day);
        assert!(Utc::now() - since >= chrono::Duration::days(7));

        let (bucket, since) = window_for(&Period::Month);
        assert_eq!(bucket, RollupBucket::Day);
        assert!(Utc::now() - since >= chrono::Duration::days(30));
    }
}
