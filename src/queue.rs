//! Provisioning queue workers.
//!
//! A small pool polls the durable `provisioning_queue` table. Claiming a
//! task is a status transition in the row store, so exactly one worker
//! ever processes a given task. Failures retry with exponential backoff
//! until `max_attempts`, then park in the dead-letter state. Idempotency
//! is enforced at insertion time by the task's idempotency key.

use crate::models::{KeyType, ProvisioningTask, TaskStatus};
use crate::state::AppState;
use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Queue a provisioning action. Returns false when the idempotency key
/// was already enqueued.
pub async fn enqueue(
    state: &Arc<AppState>,
    business_id: &str,
    customer_id: &str,
    action: &str,
    provider: &str,
    payload: serde_json::Value,
    idempotency_key: &str,
) -> Result<bool> {
    let task = ProvisioningTask {
        id: Uuid::new_v4().to_string(),
        business_id: business_id.to_string(),
        customer_id: customer_id.to_string(),
        action: action.to_string(),
        provider: provider.to_string(),
        payload,
        status: TaskStatus::Pending,
        attempt_count: 0,
        max_attempts: DEFAULT_MAX_ATTEMPTS,
        next_retry_at: Utc::now(),
        idempotency_key: idempotency_key.to_string(),
    };
    let inserted = state.row_store.enqueue_task(&task).await?;
    if inserted {
        info!(
            business_id,
            customer_id, action, provider, "provisioning task queued"
        );
    }
    Ok(inserted)
}

/// Exponential backoff in seconds, capped at about half an hour.
fn backoff(attempt_count: u32) -> ChronoDuration {
    ChronoDuration::seconds(2i64.saturating_pow(attempt_count.min(11)))
}

pub fn spawn_workers(state: Arc<AppState>, workers: usize) {
    for worker_id in 0..workers {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                // Drain everything due before going back to sleep.
                loop {
                    match state.row_store.claim_due_task(Utc::now()).await {
                        Ok(Some(task)) => process_task(&state, worker_id, task).await,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(worker_id, error = %e, "task claim failed");
                            break;
                        }
                    }
                }
            }
        });
    }
}

async fn process_task(state: &Arc<AppState>, worker_id: usize, task: ProvisioningTask) {
    match run_task(state, &task).await {
        Ok(()) => {
            if let Err(e) = state
                .row_store
                .finish_task(&task.id, TaskStatus::Done, task.attempt_count, None)
                .await
            {
                warn!(task_id = %task.id, error = %e, "failed to mark task done");
            }
            info!(
                worker_id,
                task_id = %task.id,
                action = %task.action,
                "provisioning task completed"
            );
        }
        Err(e) => {
            let attempts = task.attempt_count + 1;
            if attempts >= task.max_attempts {
                warn!(
                    worker_id,
                    task_id = %task.id,
                    attempts,
                    error = %e,
                    "provisioning task dead-lettered"
                );
                let _ = state
                    .row_store
                    .finish_task(&task.id, TaskStatus::DeadLetter, attempts, None)
                    .await;
            } else {
                let next_retry = Utc::now() + backoff(attempts);
                warn!(
                    worker_id,
                    task_id = %task.id,
                    attempts,
                    retry_at = %next_retry,
                    error = %e,
                    "provisioning task failed; retrying"
                );
                let _ = state
                    .row_store
                    .finish_task(&task.id, TaskStatus::Pending, attempts, Some(next_retry))
                    .await;
            }
        }
    }
}

async fn run_task(state: &Arc<AppState>, task: &ProvisioningTask) -> Result<()> {
    match (task.provider.as_str(), task.action.as_str()) {
        ("fly", "create_machine") => {
            let machine_id = create_fly_machine(state, task).await?;
            state
                .row_store
                .upsert_customer_machine(
                    &task.business_id,
                    &task.customer_id,
                    &machine_id,
                    "fly",
                    "running",
                )
                .await?;
            Ok(())
        }
        ("fly", "delete_machine") => {
            let machine_id = task.payload["machine_id"]
                .as_str()
                .ok_or_else(|| anyhow!("delete_machine payload missing machine_id"))?;
            delete_fly_machine(state, task, machine_id).await?;
            state
                .row_store
                .delete_customer_machine(&task.business_id, &task.customer_id, machine_id)
                .await?;
            Ok(())
        }
        (provider, action) => Err(anyhow!("unsupported task: {provider}/{action}")),
    }
}

async fn fly_credentials(state: &Arc<AppState>, business_id: &str) -> Result<String> {
    let key = state
        .row_store
        .get_integration_key(business_id, KeyType::Fly, "api_token")
        .await?
        .filter(|k| k.is_active)
        .ok_or_else(|| anyhow!("no fly credentials for business {business_id}"))?;
    state.cipher.decrypt(&key.encrypted_key)
}

async fn create_fly_machine(state: &Arc<AppState>, task: &ProvisioningTask) -> Result<String> {
    if state.config.mock_mode {
        let machine_id = format!("mock-{}", &task.id[..8]);
        info!(task_id = %task.id, machine_id = %machine_id, "mock machine created");
        return Ok(machine_id);
    }

    let token = fly_credentials(state, &task.business_id).await?;
    let app_name = task.payload["app_name"]
        .as_str()
        .ok_or_else(|| anyhow!("create_machine payload missing app_name"))?;
    let resp = state
        .http
        .post(format!(
            "https://api.machines.dev/v1/apps/{app_name}/machines"
        ))
        .bearer_auth(token)
        .json(&task.payload)
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        return Err(anyhow!("machine create rejected: {status}"));
    }
    let body: serde_json::Value = resp.json().await?;
    body["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("machine create response missing id"))
}

async fn delete_fly_machine(
    state: &Arc<AppState>,
    task: &ProvisioningTask,
    machine_id: &str,
) -> Result<()> {
    if state.config.mock_mode {
        info!(task_id = %task.id, machine_id, "mock machine deleted");
        return Ok(());
    }

    let token = fly_credentials(state, &task.business_id).await?;
    let app_name = task.payload["app_name"]
        .as_str()
        .ok_or_else(|| anyhow!("delete_machine payload missing app_name"))?;
    let resp = state
        .http
        .delete(format!(
            "https://api.machines.dev/v1/apps/{app_name}/machines/{machine_id}?force=true"
        ))
        .bearer_auth(token)
        .send()
        .await?;
    if !resp.status().is_success() && resp.status().as_u16() != 404 {
        let status = resp.status();
        return Err(anyhow!("machine delete rejected: {status}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        assert_eq!(backoff(1).num_seconds(), 2);
        assert_eq!(backoff(3).num_seconds(), 8);
        assert_eq!(backoff(5).num_seconds(), 32);
        // Cap keeps retries within a sane window.
        assert_eq!(backoff(30).num_seconds(), 2048);
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_by_idempotency_key() {
        let (state, _tmp) = test_state().await;
        let payload = serde_json::json!({"region": "iad"});

        assert!(enqueue(
            &state,
            "biz_1",
            "cust_1",
            "create_machine",
            "fly",
            payload.clone(),
            "prov:biz_1:cust_1:create"
        )
        .await
        .unwrap());
        assert!(!enqueue(
            &state,
            "biz_1",
            "cust_1",
            "create_machine",
            "fly",
            payload,
            "prov:biz_1:cust_1:create"
        )
        .await
        .unwrap());
    }

    #[tokio::test]
    async fn test_mock_create_machine_records_row() {
        let (state, _tmp) = test_state().await;
        enqueue(
            &state,
            "biz_1",
            "cust_1",
            "create_machine",
            "fly",
            serde_json::json!({"region": "iad"}),
            "prov:create",
        )
        .await
        .unwrap();

        let task = state.row_store.claim_due_task(Utc::now()).await.unwrap().unwrap();
        process_task(&state, 0, task.clone()).await;

        // Task completed; nothing left to claim.
        assert!(state.row_store.claim_due_task(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_task_dead_letters_after_max_attempts() {
        let (state, _tmp) = test_state().await;
        enqueue(
            &state,
            "biz_1",
            "cust_1",
            "summon",
            "carrier_pigeon",
            serde_json::json!({}),
            "prov:pigeon",
        )
        .await
        .unwrap();

        // Walk the task through every failed attempt manually.
        for attempt in 1..=DEFAULT_MAX_ATTEMPTS {
            let due = Utc::now() + ChronoDuration::hours(1);
            let task = state.row_store.claim_due_task(due).await.unwrap().unwrap();
            assert_eq!(task.attempt_count, attempt - 1);
            process_task(&state, 0, task).await;
        }

        let far_future = Utc::now() + ChronoDuration::days(1);
        assert!(state.row_store.claim_due_task(far_future).await.unwrap().is_none());
    }
}
