//! Nightly deletion sweeper.
//!
//! Soft deletes tombstone rows with `deleted_at`; once the 30-day grace
//! expires the sweeper permanently removes them.

use crate::state::AppState;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Hour of day (UTC) the sweep runs.
const SWEEP_HOUR_UTC: u32 = 3;
const GRACE_DAYS: i64 = 30;

pub async fn run_once(state: &Arc<AppState>) -> Result<u64> {
    let cutoff = Utc::now() - ChronoDuration::days(GRACE_DAYS);
    let purged = state.row_store.purge_expired(cutoff).await?;
    if purged > 0 {
        info!(purged, cutoff = %cutoff, "expired tombstones purged");
    }
    Ok(purged)
}

pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let mut next = now
                .date_naive()
                .and_hms_opt(SWEEP_HOUR_UTC, 0, 0)
                .unwrap()
                .and_utc();
            if next <= now {
                next += ChronoDuration::days(1);
            }
            let wait = (next - now)
                .to_std()
                .unwrap_or_else(|_| std::time::Duration::from_secs(60));
            tokio::time::sleep(wait).await;

            if let Err(e) = run_once(&state).await {
                warn!(error = %e, "deletion sweep failed");
            }
            tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Business;
    use crate::testutil::test_state;

    #[tokio::test]
    async fn test_sweep_only_removes_expired_tombstones() {
        let (state, _tmp) = test_state().await;
        for id in ["biz_expired", "biz_recent", "biz_live"] {
            state
                .row_store
                .insert_business(&Business {
                    business_id: id.into(),
                    business_name: "Acme".into(),
                    email: "ops@acme.test".into(),
                    stripe_customer_id: None,
                    subscription_status: None,
                    plan_type: None,
                    created_at: Utc::now(),
                    deleted_at: None,
                })
                .await
                .unwrap();
        }
        state
            .row_store
            .soft_delete_business("biz_expired", Utc::now() - ChronoDuration::days(31))
            .await
            .unwrap();
        state
            .row_store
            .soft_delete_business("biz_recent", Utc::now() - ChronoDuration::days(2))
            .await
            .unwrap();

        let purged = run_once(&state).await.unwrap();
        assert_eq!(purged, 1);
        assert!(state.row_store.get_business("biz_expired").await.unwrap().is_none());
        assert!(state.row_store.get_business("biz_recent").await.unwrap().is_some());
        assert!(state.row_store.get_business("biz_live").await.unwrap().is_some());
    }
}
