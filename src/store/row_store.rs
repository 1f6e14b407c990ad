//! Durable row store over SQLite.
//!
//! All tables are created at startup with `CREATE TABLE IF NOT EXISTS`.
//! The connection is shared behind a mutex and every call dispatches
//! through `spawn_blocking` so the async runtime never blocks on disk.
//! The `RowStore` trait is the seam the rest of the system depends on;
//! tests substitute counting doubles to assert hot-path behavior.

use crate::models::{
    AccountId, BillingEvent, BreachAction, BreachOperator, Business, Customer, EventStatus,
    IntegrationKey, KeyType, MetricAdapters, MetricDefinition, MetricMode, MetricOp, MetricSample,
    MetricType,
    Plan, PlanLimit, ProvisioningTask, ReconciliationRecord, TaskStatus,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::info;

/// Contract between the core and durable storage.
#[async_trait]
pub trait RowStore: Send + Sync {
    // businesses
    async fn insert_business(&self, business: &Business) -> Result<()>;
    async fn get_business(&self, business_id: &str) -> Result<Option<Business>>;
    async fn list_businesses(&self) -> Result<Vec<Business>>;
    async fn update_business_billing(
        &self,
        business_id: &str,
        stripe_customer_id: Option<&str>,
        subscription_status: Option<&str>,
    ) -> Result<()>;
    async fn soft_delete_business(&self, business_id: &str, at: DateTime<Utc>) -> Result<()>;

    // customers
    async fn insert_customer(&self, customer: &Customer) -> Result<()>;
    async fn get_customer(&self, business_id: &str, customer_id: &str)
        -> Result<Option<Customer>>;
    async fn list_customers(&self, business_id: &str) -> Result<Vec<Customer>>;
    async fn find_customer_by_stripe(
        &self,
        business_id: &str,
        stripe_customer_id: &str,
    ) -> Result<Option<Customer>>;
    async fn update_customer_plan(
        &self,
        business_id: &str,
        customer_id: &str,
        plan_id: Option<&str>,
        stripe_price_id: Option<&str>,
        stripe_subscription_id: Option<&str>,
        subscription_ends_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn soft_delete_customer(
        &self,
        business_id: &str,
        customer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    // plans
    async fn insert_plan(&self, plan: &Plan) -> Result<()>;
    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>>;
    async fn find_plan_by_price(
        &self,
        business_id: &str,
        stripe_price_id: &str,
    ) -> Result<Option<Plan>>;
    async fn get_free_plan(&self, business_id: &str) -> Result<Option<Plan>>;

    // plan limits
    async fn insert_plan_limit(&self, limit: &PlanLimit) -> Result<()>;
    /// Every limit row visible to `(business, plan?, customer?)`: the
    /// business defaults, the plan's rows and the customer's overrides.
    async fn list_plan_limits(
        &self,
        business_id: &str,
        plan_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> Result<Vec<PlanLimit>>;

    // metric definitions
    async fn upsert_metric_definition(&self, def: &MetricDefinition) -> Result<()>;
    async fn get_metric_definition(
        &self,
        account: &AccountId,
        metric_name: &str,
    ) -> Result<Option<MetricDefinition>>;
    async fn list_metric_definitions(&self, account: &AccountId) -> Result<Vec<MetricDefinition>>;
    async fn delete_metric_definition(&self, account: &AccountId, metric_name: &str) -> Result<()>;

    // metric samples
    async fn insert_metric_samples(&self, samples: &[MetricSample]) -> Result<usize>;
    async fn latest_metric_value(
        &self,
        account: &AccountId,
        metric_name: &str,
    ) -> Result<Option<f64>>;
    /// Atomic upsert-and-increment for checkpoint metrics; returns the
    /// post-increment value.
    async fn checkpoint_increment(
        &self,
        account: &AccountId,
        metric_name: &str,
        delta: f64,
    ) -> Result<f64>;
    async fn get_checkpoint(&self, account: &AccountId, metric_name: &str) -> Result<Option<f64>>;

    // integration keys
    async fn insert_integration_key(&self, key: &IntegrationKey) -> Result<()>;
    async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<IntegrationKey>>;
    async fn get_integration_key(
        &self,
        business_id: &str,
        key_type: KeyType,
        key_name: &str,
    ) -> Result<Option<IntegrationKey>>;
    async fn list_integration_keys(&self, business_id: &str) -> Result<Vec<IntegrationKey>>;
    /// Returns true when a row was deactivated.
    async fn set_key_active(
        &self,
        business_id: &str,
        key_name: &str,
        active: bool,
    ) -> Result<Option<IntegrationKey>>;

    // provisioning queue
    /// Returns false when the idempotency key already exists.
    async fn enqueue_task(&self, task: &ProvisioningTask) -> Result<bool>;
    async fn claim_due_task(&self, now: DateTime<Utc>) -> Result<Option<ProvisioningTask>>;
    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        attempt_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // billing events
    /// Persist the envelope if unseen. Returns the stored status: for a
    /// replay this is the existing row's status, otherwise `Pending`.
    async fn insert_billing_event(&self, event: &BillingEvent) -> Result<(bool, EventStatus)>;
    async fn set_event_status(
        &self,
        event_id: &str,
        status: EventStatus,
        retry_count: u32,
        error_message: Option<&str>,
    ) -> Result<()>;
    async fn get_billing_event(&self, event_id: &str) -> Result<Option<BillingEvent>>;
    async fn list_billing_events(&self, status: Option<EventStatus>) -> Result<Vec<BillingEvent>>;

    // customer machines
    async fn upsert_customer_machine(
        &self,
        business_id: &str,
        customer_id: &str,
        machine_id: &str,
        provider: &str,
        state: &str,
    ) -> Result<()>;
    async fn delete_customer_machine(
        &self,
        business_id: &str,
        customer_id: &str,
        machine_id: &str,
    ) -> Result<()>;

    // audit + reconciliation
    async fn insert_audit_log(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        detail: Option<&str>,
    ) -> Result<()>;
    async fn insert_reconciliation_record(&self, record: &ReconciliationRecord) -> Result<()>;

    /// Permanently remove soft-deleted rows whose tombstone is older than
    /// the cutoff. Returns the number of purged rows.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// SQLite-backed implementation.
pub struct SqliteRowStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRowStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database at {db_path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!(path = db_path, "row store ready");
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS businesses (
                business_id TEXT PRIMARY KEY,
                business_name TEXT NOT NULL,
                email TEXT NOT NULL,
                stripe_customer_id TEXT,
                subscription_status TEXT,
                plan_type TEXT,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE TABLE IF NOT EXISTS customers (
                business_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                customer_name TEXT NOT NULL,
                email TEXT,
                plan_id TEXT,
                stripe_price_id TEXT,
                stripe_customer_id TEXT,
                stripe_subscription_id TEXT,
                subscription_ends_at TEXT,
                user_id TEXT,
                created_at TEXT NOT NULL,
                deleted_at TEXT,
                PRIMARY KEY (business_id, customer_id)
            );
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                plan_name TEXT NOT NULL,
                stripe_price_id TEXT,
                plan_status TEXT NOT NULL,
                UNIQUE (business_id, plan_name)
            );
            CREATE TABLE IF NOT EXISTS plan_limits (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                plan_id TEXT,
                customer_id TEXT,
                metric_name TEXT NOT NULL,
                limit_value REAL NOT NULL,
                limit_period TEXT,
                breach_operator TEXT NOT NULL,
                breach_action TEXT NOT NULL,
                webhook_urls TEXT,
                metric_type TEXT NOT NULL DEFAULT 'reset'
            );
            CREATE TABLE IF NOT EXISTS metric_definitions (
                business_id TEXT NOT NULL,
                customer_id TEXT NOT NULL DEFAULT '',
                metric_name TEXT NOT NULL,
                operation TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                flush_interval TEXT NOT NULL,
                initial_value REAL NOT NULL,
                limit_value REAL,
                limit_operator TEXT,
                breach_action TEXT,
                webhook_urls TEXT,
                adapters TEXT,
                PRIMARY KEY (business_id, customer_id, metric_name)
            );
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                business_id TEXT NOT NULL,
                customer_id TEXT,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                metric_type TEXT NOT NULL,
                scope TEXT NOT NULL,
                adapters TEXT,
                flushed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_lookup
                ON metrics (business_id, customer_id, metric_name, flushed_at);
            CREATE TABLE IF NOT EXISTS metric_checkpoints (
                account_id TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (account_id, metric_name)
            );
            CREATE TABLE IF NOT EXISTS integration_keys (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                customer_id TEXT,
                key_type TEXT NOT NULL,
                key_name TEXT NOT NULL,
                encrypted_key TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                metadata TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (business_id, key_type, key_name)
            );
            CREATE INDEX IF NOT EXISTS idx_integration_keys_hash
                ON integration_keys (key_hash);
            CREATE TABLE IF NOT EXISTS provisioning_queue (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                action TEXT NOT NULL,
                provider TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                next_retry_at TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS billing_events (
                event_id TEXT PRIMARY KEY,
                business_id TEXT,
                event_type TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                received_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS customer_machines (
                business_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                machine_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (business_id, customer_id, machine_id)
            );
            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                target TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS reconciliation (
                id TEXT PRIMARY KEY,
                record_type TEXT NOT NULL,
                totals INTEGER NOT NULL,
                mismatches_found INTEGER NOT NULL,
                mismatches_fixed INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                ran_at TEXT NOT NULL
            );",
        )
        .context("failed to initialize schema")?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .context("row store task panicked")?
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp: {s}"))?
        .with_timezone(&Utc))
}

fn opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

fn map_customer(row: &Row<'_>) -> Result<Customer> {
    let created: String = row.get(10).context("customer created_at")?;
    let ends: Option<String> = row.get(8).context("customer subscription_ends_at")?;
    let deleted: Option<String> = row.get(11).context("customer deleted_at")?;
    Ok(Customer {
        business_id: row.get(0).context("customer business_id")?,
        customer_id: row.get(1).context("customer customer_id")?,
        customer_name: row.get(2).context("customer name")?,
        email: row.get(3).context("customer email")?,
        plan_id: row.get(4).context("customer plan_id")?,
        stripe_price_id: row.get(5).context("customer stripe_price_id")?,
        stripe_customer_id: row.get(6).context("customer stripe_customer_id")?,
        stripe_subscription_id: row.get(7).context("customer stripe_subscription_id")?,
        subscription_ends_at: opt_ts(ends)?,
        user_id: row.get(9).context("customer user_id")?,
        created_at: parse_ts(&created)?,
        deleted_at: opt_ts(deleted)?,
    })
}

fn map_plan(row: &Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        id: row.get(0)?,
        business_id: row.get(1)?,
        plan_name: row.get(2)?,
        stripe_price_id: row.get(3)?,
        plan_status: row.get(4)?,
    })
}

fn map_plan_limit(row: &Row<'_>) -> Result<PlanLimit> {
    let operator: String = row.get(7).context("limit operator")?;
    let action: String = row.get(8).context("limit action")?;
    let urls: Option<String> = row.get(9).context("limit webhook_urls")?;
    let metric_type: String = row.get(10).context("limit metric_type")?;
    Ok(PlanLimit {
        id: row.get(0).context("limit id")?,
        business_id: row.get(1).context("limit business_id")?,
        plan_id: row.get(2).context("limit plan_id")?,
        customer_id: row.get(3).context("limit customer_id")?,
        metric_name: row.get(4).context("limit metric_name")?,
        limit_value: row.get(5).context("limit value")?,
        limit_period: row.get(6).context("limit period")?,
        breach_operator: BreachOperator::from_str(&operator)
            .with_context(|| format!("bad breach_operator: {operator}"))?,
        breach_action: BreachAction::from_str(&action)
            .with_context(|| format!("bad breach_action: {action}"))?,
        webhook_urls: urls
            .map(|u| serde_json::from_str(&u).context("bad webhook_urls json"))
            .transpose()?,
        metric_type: MetricType::from_str(&metric_type)
            .with_context(|| format!("bad metric_type: {metric_type}"))?,
    })
}

fn map_metric_definition(row: &Row<'_>) -> Result<MetricDefinition> {
    let business_id: String = row.get(0).context("definition business_id")?;
    let customer_id: String = row.get(1).context("definition customer_id")?;
    let operation: String = row.get(3).context("definition operation")?;
    let metric_type: String = row.get(4).context("definition metric_type")?;
    let limit_operator: Option<String> = row.get(8).context("definition limit_operator")?;
    let breach_action: Option<String> = row.get(9).context("definition breach_action")?;
    let webhook_urls: Option<String> = row.get(10).context("definition webhook_urls")?;
    let adapters: Option<String> = row.get(11).context("definition adapters")?;
    let account_id = if customer_id.is_empty() {
        AccountId::business(business_id)
    } else {
        AccountId::customer(business_id, customer_id)
    };
    Ok(MetricDefinition {
        account_id,
        metric_name: row.get(2).context("definition metric_name")?,
        mode: MetricMode::Simple,
        operation: MetricOp::from_str(&operation)
            .with_context(|| format!("bad operation: {operation}"))?,
        metric_type: MetricType::from_str(&metric_type)
            .with_context(|| format!("bad metric_type: {metric_type}"))?,
        flush_interval: row.get(5).context("definition flush_interval")?,
        initial_value: row.get(6).context("definition initial_value")?,
        limit_value: row.get(7).context("definition limit_value")?,
        limit_operator: limit_operator.as_deref().and_then(BreachOperator::from_str),
        breach_action: breach_action.as_deref().and_then(BreachAction::from_str),
        webhook_urls: webhook_urls
            .map(|u| serde_json::from_str(&u).context("bad webhook_urls json"))
            .transpose()?,
        adapters: adapters
            .map(|a| serde_json::from_str(&a).context("bad adapters json"))
            .transpose()?
            .unwrap_or_default(),
    })
}

fn map_integration_key(row: &Row<'_>) -> Result<IntegrationKey> {
    let key_type: String = row.get(3).context("key type")?;
    let metadata: Option<String> = row.get(8).context("key metadata")?;
    let created: String = row.get(9).context("key created_at")?;
    Ok(IntegrationKey {
        id: row.get(0).context("key id")?,
        business_id: row.get(1).context("key business_id")?,
        customer_id: row.get(2).context("key customer_id")?,
        key_type: KeyType::from_str(&key_type)
            .with_context(|| format!("bad key_type: {key_type}"))?,
        key_name: row.get(4).context("key name")?,
        encrypted_key: row.get(5).context("key ciphertext")?,
        key_hash: row.get(6).context("key hash")?,
        is_active: row.get::<_, i64>(7).context("key is_active")? != 0,
        metadata: metadata
            .map(|m| serde_json::from_str(&m).context("bad key metadata json"))
            .transpose()?,
        created_at: parse_ts(&created)?,
    })
}

fn map_task(row: &Row<'_>) -> Result<ProvisioningTask> {
    let payload: String = row.get(5).context("task payload")?;
    let status: String = row.get(6).context("task status")?;
    let next_retry: String = row.get(9).context("task next_retry_at")?;
    Ok(ProvisioningTask {
        id: row.get(0).context("task id")?,
        business_id: row.get(1).context("task business_id")?,
        customer_id: row.get(2).context("task customer_id")?,
        action: row.get(3).context("task action")?,
        provider: row.get(4).context("task provider")?,
        payload: serde_json::from_str(&payload).context("bad task payload json")?,
        status: TaskStatus::from_str(&status)
            .with_context(|| format!("bad task status: {status}"))?,
        attempt_count: row.get(7).context("task attempt_count")?,
        max_attempts: row.get(8).context("task max_attempts")?,
        next_retry_at: parse_ts(&next_retry)?,
        idempotency_key: row.get(10).context("task idempotency_key")?,
    })
}

fn map_billing_event(row: &Row<'_>) -> Result<BillingEvent> {
    let status: String = row.get(4).context("event status")?;
    let received: String = row.get(7).context("event received_at")?;
    Ok(BillingEvent {
        event_id: row.get(0).context("event id")?,
        business_id: row.get(1).context("event business_id")?,
        event_type: row.get(2).context("event type")?,
        raw_payload: row.get(3).context("event payload")?,
        status: EventStatus::from_str(&status)
            .with_context(|| format!("bad event status: {status}"))?,
        retry_count: row.get(5).context("event retry_count")?,
        error_message: row.get(6).context("event error")?,
        received_at: parse_ts(&received)?,
    })
}

const CUSTOMER_COLS: &str = "business_id, customer_id, customer_name, email, plan_id, \
     stripe_price_id, stripe_customer_id, stripe_subscription_id, subscription_ends_at, \
     user_id, created_at, deleted_at";

const KEY_COLS: &str = "id, business_id, customer_id, key_type, key_name, encrypted_key, \
     key_hash, is_active, metadata, created_at";

const TASK_COLS: &str = "id, business_id, customer_id, action, provider, payload, status, \
     attempt_count, max_attempts, next_retry_at, idempotency_key";

#[async_trait]
impl RowStore for SqliteRowStore {
    async fn insert_business(&self, business: &Business) -> Result<()> {
        let b = business.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO businesses (business_id, business_name, email, stripe_customer_id,
                     subscription_status, plan_type, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
                params![
                    b.business_id,
                    b.business_name,
                    b.email,
                    b.stripe_customer_id,
                    b.subscription_status,
                    b.plan_type,
                    b.created_at.to_rfc3339(),
                ],
            )
            .context("failed to insert business")?;
            Ok(())
        })
        .await
    }

    async fn get_business(&self, business_id: &str) -> Result<Option<Business>> {
        let id = business_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT business_id, business_name, email, stripe_customer_id,
                            subscription_status, plan_type, created_at, deleted_at
                     FROM businesses WHERE business_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, Option<String>>(7)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(business_id, business_name, email, stripe, status, plan, created, deleted)| {
                Ok(Business {
                    business_id,
                    business_name,
                    email,
                    stripe_customer_id: stripe,
                    subscription_status: status,
                    plan_type: plan,
                    created_at: parse_ts(&created)?,
                    deleted_at: opt_ts(deleted)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn list_businesses(&self) -> Result<Vec<Business>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT business_id, business_name, email, stripe_customer_id,
                        subscription_status, plan_type, created_at, deleted_at
                 FROM businesses WHERE deleted_at IS NULL",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(business_id, business_name, email, stripe, status, plan, created, deleted)| {
                    Ok(Business {
                        business_id,
                        business_name,
                        email,
                        stripe_customer_id: stripe,
                        subscription_status: status,
                        plan_type: plan,
                        created_at: parse_ts(&created)?,
                        deleted_at: opt_ts(deleted)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn update_business_billing(
        &self,
        business_id: &str,
        stripe_customer_id: Option<&str>,
        subscription_status: Option<&str>,
    ) -> Result<()> {
        let id = business_id.to_string();
        let stripe = stripe_customer_id.map(str::to_string);
        let status = subscription_status.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE businesses
                 SET stripe_customer_id = COALESCE(?2, stripe_customer_id),
                     subscription_status = COALESCE(?3, subscription_status)
                 WHERE business_id = ?1",
                params![id, stripe, status],
            )?;
            Ok(())
        })
        .await
    }

    async fn soft_delete_business(&self, business_id: &str, at: DateTime<Utc>) -> Result<()> {
        let id = business_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE businesses SET deleted_at = ?2 WHERE business_id = ?1",
                params![id, at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_customer(&self, customer: &Customer) -> Result<()> {
        let c = customer.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO customers ({CUSTOMER_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)"
                ),
                params![
                    c.business_id,
                    c.customer_id,
                    c.customer_name,
                    c.email,
                    c.plan_id,
                    c.stripe_price_id,
                    c.stripe_customer_id,
                    c.stripe_subscription_id,
                    c.subscription_ends_at.map(|t| t.to_rfc3339()),
                    c.user_id,
                    c.created_at.to_rfc3339(),
                ],
            )
            .context("failed to insert customer")?;
            Ok(())
        })
        .await
    }

    async fn get_customer(
        &self,
        business_id: &str,
        customer_id: &str,
    ) -> Result<Option<Customer>> {
        let biz = business_id.to_string();
        let cust = customer_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CUSTOMER_COLS} FROM customers
                 WHERE business_id = ?1 AND customer_id = ?2"
            ))?;
            let mut rows = stmt.query(params![biz, cust])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_customer(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_customers(&self, business_id: &str) -> Result<Vec<Customer>> {
        let biz = business_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CUSTOMER_COLS} FROM customers
                 WHERE business_id = ?1 AND deleted_at IS NULL"
            ))?;
            let mut rows = stmt.query(params![biz])?;
            let mut customers = Vec::new();
            while let Some(row) = rows.next()? {
                customers.push(map_customer(row)?);
            }
            Ok(customers)
        })
        .await
    }

    async fn find_customer_by_stripe(
        &self,
        business_id: &str,
        stripe_customer_id: &str,
    ) -> Result<Option<Customer>> {
        let biz = business_id.to_string();
        let stripe = stripe_customer_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CUSTOMER_COLS} FROM customers
                 WHERE business_id = ?1 AND stripe_customer_id = ?2 AND deleted_at IS NULL"
            ))?;
            let mut rows = stmt.query(params![biz, stripe])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_customer(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn update_customer_plan(
        &self,
        business_id: &str,
        customer_id: &str,
        plan_id: Option<&str>,
        stripe_price_id: Option<&str>,
        stripe_subscription_id: Option<&str>,
        subscription_ends_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let biz = business_id.to_string();
        let cust = customer_id.to_string();
        let plan = plan_id.map(str::to_string);
        let price = stripe_price_id.map(str::to_string);
        let sub = stripe_subscription_id.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE customers
                 SET plan_id = ?3, stripe_price_id = ?4, stripe_subscription_id = ?5,
                     subscription_ends_at = ?6
                 WHERE business_id = ?1 AND customer_id = ?2",
                params![
                    biz,
                    cust,
                    plan,
                    price,
                    sub,
                    subscription_ends_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn soft_delete_customer(
        &self,
        business_id: &str,
        customer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let biz = business_id.to_string();
        let cust = customer_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE customers SET deleted_at = ?3
                 WHERE business_id = ?1 AND customer_id = ?2",
                params![biz, cust, at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        let p = plan.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO plans (id, business_id, plan_name, stripe_price_id, plan_status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![p.id, p.business_id, p.plan_name, p.stripe_price_id, p.plan_status],
            )
            .context("failed to insert plan")?;
            Ok(())
        })
        .await
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        let id = plan_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, business_id, plan_name, stripe_price_id, plan_status
                     FROM plans WHERE id = ?1",
                    params![id],
                    map_plan,
                )
                .optional()?)
        })
        .await
    }

    async fn find_plan_by_price(
        &self,
        business_id: &str,
        stripe_price_id: &str,
    ) -> Result<Option<Plan>> {
        let biz = business_id.to_string();
        let price = stripe_price_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, business_id, plan_name, stripe_price_id, plan_status
                     FROM plans WHERE business_id = ?1 AND stripe_price_id = ?2",
                    params![biz, price],
                    map_plan,
                )
                .optional()?)
        })
        .await
    }

    async fn get_free_plan(&self, business_id: &str) -> Result<Option<Plan>> {
        let biz = business_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, business_id, plan_name, stripe_price_id, plan_status
                     FROM plans WHERE business_id = ?1 AND plan_name = 'free_plan'",
                    params![biz],
                    map_plan,
                )
                .optional()?)
        })
        .await
    }

    async fn insert_plan_limit(&self, limit: &PlanLimit) -> Result<()> {
        let l = limit.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO plan_limits (id, business_id, plan_id, customer_id, metric_name,
                     limit_value, limit_period, breach_operator, breach_action, webhook_urls,
                     metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    l.id,
                    l.business_id,
                    l.plan_id,
                    l.customer_id,
                    l.metric_name,
                    l.limit_value,
                    l.limit_period,
                    l.breach_operator.as_str(),
                    l.breach_action.as_str(),
                    l.webhook_urls
                        .as_ref()
                        .map(|u| serde_json::to_string(u).unwrap_or_default()),
                    l.metric_type.as_str(),
                ],
            )
            .context("failed to insert plan limit")?;
            Ok(())
        })
        .await
    }

    async fn list_plan_limits(
        &self,
        business_id: &str,
        plan_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> Result<Vec<PlanLimit>> {
        let biz = business_id.to_string();
        let plan = plan_id.map(str::to_string);
        let cust = customer_id.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, business_id, plan_id, customer_id, metric_name, limit_value,
                        limit_period, breach_operator, breach_action, webhook_urls, metric_type
                 FROM plan_limits
                 WHERE business_id = ?1
                   AND ((plan_id IS NULL AND customer_id IS NULL)
                        OR plan_id = ?2
                        OR customer_id = ?3)",
            )?;
            let mut rows = stmt.query(params![biz, plan, cust])?;
            let mut limits = Vec::new();
            while let Some(row) = rows.next()? {
                limits.push(map_plan_limit(row)?);
            }
            Ok(limits)
        })
        .await
    }

    async fn upsert_metric_definition(&self, def: &MetricDefinition) -> Result<()> {
        let d = def.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO metric_definitions (business_id, customer_id, metric_name,
                     operation, metric_type, flush_interval, initial_value, limit_value,
                     limit_operator, breach_action, webhook_urls, adapters)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (business_id, customer_id, metric_name) DO UPDATE SET
                     operation = excluded.operation,
                     metric_type = excluded.metric_type,
                     flush_interval = excluded.flush_interval,
                     initial_value = excluded.initial_value,
                     limit_value = excluded.limit_value,
                     limit_operator = excluded.limit_operator,
                     breach_action = excluded.breach_action,
                     webhook_urls = excluded.webhook_urls,
                     adapters = excluded.adapters",
                params![
                    d.account_id.business_id,
                    d.account_id.customer_id.clone().unwrap_or_default(),
                    d.metric_name,
                    d.operation.as_str(),
                    d.metric_type.as_str(),
                    d.flush_interval,
                    d.initial_value,
                    d.limit_value,
                    d.limit_operator.map(|o| o.as_str()),
                    d.breach_action.map(|a| a.as_str()),
                    d.webhook_urls
                        .as_ref()
                        .map(|u| serde_json::to_string(u).unwrap_or_default()),
                    if d.adapters.is_empty() {
                        None
                    } else {
                        Some(serde_json::to_string(&d.adapters).unwrap_or_default())
                    },
                ],
            )
            .context("failed to upsert metric definition")?;
            Ok(())
        })
        .await
    }

    async fn get_metric_definition(
        &self,
        account: &AccountId,
        metric_name: &str,
    ) -> Result<Option<MetricDefinition>> {
        let biz = account.business_id.clone();
        let cust = account.customer_id.clone().unwrap_or_default();
        let name = metric_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT business_id, customer_id, metric_name, operation, metric_type,
                        flush_interval, initial_value, limit_value, limit_operator,
                        breach_action, webhook_urls, adapters
                 FROM metric_definitions
                 WHERE business_id = ?1 AND customer_id = ?2 AND metric_name = ?3",
            )?;
            let mut rows = stmt.query(params![biz, cust, name])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_metric_definition(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_metric_definitions(&self, account: &AccountId) -> Result<Vec<MetricDefinition>> {
        let biz = account.business_id.clone();
        let cust = account.customer_id.clone().unwrap_or_default();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT business_id, customer_id, metric_name, operation, metric_type,
                        flush_interval, initial_value, limit_value, limit_operator,
                        breach_action, webhook_urls, adapters
                 FROM metric_definitions
                 WHERE business_id = ?1 AND customer_id = ?2",
            )?;
            let mut rows = stmt.query(params![biz, cust])?;
            let mut defs = Vec::new();
            while let Some(row) = rows.next()? {
                defs.push(map_metric_definition(row)?);
            }
            Ok(defs)
        })
        .await
    }

    async fn delete_metric_definition(&self, account: &AccountId, metric_name: &str) -> Result<()> {
        let biz = account.business_id.clone();
        let cust = account.customer_id.clone().unwrap_or_default();
        let name = metric_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM metric_definitions
                 WHERE business_id = ?1 AND customer_id = ?2 AND metric_name = ?3",
                params![biz, cust, name],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_metric_samples(&self, samples: &[MetricSample]) -> Result<usize> {
        let samples = samples.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO metrics (business_id, customer_id, metric_name, value,
                         metric_type, scope, adapters, flushed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for s in &samples {
                    stmt.execute(params![
                        s.business_id,
                        s.customer_id,
                        s.metric_name,
                        s.value,
                        s.metric_type.as_str(),
                        s.scope,
                        s.adapters
                            .as_ref()
                            .map(|a| serde_json::to_string(a).unwrap_or_default()),
                        s.flushed_at.to_rfc3339(),
                    ])?;
                    inserted += 1;
                }
            }
            tx.commit().context("failed to commit metric batch")?;
            Ok(inserted)
        })
        .await
    }

    async fn latest_metric_value(
        &self,
        account: &AccountId,
        metric_name: &str,
    ) -> Result<Option<f64>> {
        let biz = account.business_id.clone();
        let cust = account.customer_id.clone();
        let name = metric_name.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM metrics
                     WHERE business_id = ?1 AND customer_id IS ?2 AND metric_name = ?3
                     ORDER BY flushed_at DESC, id DESC LIMIT 1",
                    params![biz, cust, name],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn checkpoint_increment(
        &self,
        account: &AccountId,
        metric_name: &str,
        delta: f64,
    ) -> Result<f64> {
        let account = account.to_string();
        let name = metric_name.to_string();
        self.with_conn(move |conn| {
            let value = conn.query_row(
                "INSERT INTO metric_checkpoints (account_id, metric_name, value)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (account_id, metric_name)
                 DO UPDATE SET value = value + excluded.value
                 RETURNING value",
                params![account, name, delta],
                |row| row.get(0),
            )?;
            Ok(value)
        })
        .await
    }

    async fn get_checkpoint(&self, account: &AccountId, metric_name: &str) -> Result<Option<f64>> {
        let account = account.to_string();
        let name = metric_name.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM metric_checkpoints
                     WHERE account_id = ?1 AND metric_name = ?2",
                    params![account, name],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn insert_integration_key(&self, key: &IntegrationKey) -> Result<()> {
        let k = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO integration_keys ({KEY_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    k.id,
                    k.business_id,
                    k.customer_id,
                    k.key_type.as_str(),
                    k.key_name,
                    k.encrypted_key,
                    k.key_hash,
                    k.is_active as i64,
                    k.metadata
                        .as_ref()
                        .map(|m| serde_json::to_string(m).unwrap_or_default()),
                    k.created_at.to_rfc3339(),
                ],
            )
            .context("failed to insert integration key")?;
            Ok(())
        })
        .await
    }

    async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<IntegrationKey>> {
        let hash = key_hash.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {KEY_COLS} FROM integration_keys WHERE key_hash = ?1"
            ))?;
            let mut rows = stmt.query(params![hash])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_integration_key(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_integration_key(
        &self,
        business_id: &str,
        key_type: KeyType,
        key_name: &str,
    ) -> Result<Option<IntegrationKey>> {
        let biz = business_id.to_string();
        let name = key_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {KEY_COLS} FROM integration_keys
                 WHERE business_id = ?1 AND key_type = ?2 AND key_name = ?3"
            ))?;
            let mut rows = stmt.query(params![biz, key_type.as_str(), name])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_integration_key(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_integration_keys(&self, business_id: &str) -> Result<Vec<IntegrationKey>> {
        let biz = business_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {KEY_COLS} FROM integration_keys WHERE business_id = ?1"
            ))?;
            let mut rows = stmt.query(params![biz])?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next()? {
                keys.push(map_integration_key(row)?);
            }
            Ok(keys)
        })
        .await
    }

    async fn set_key_active(
        &self,
        business_id: &str,
        key_name: &str,
        active: bool,
    ) -> Result<Option<IntegrationKey>> {
        let biz = business_id.to_string();
        let name = key_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE integration_keys SET is_active = ?3
                 WHERE business_id = ?1 AND key_name = ?2",
                params![biz, name, active as i64],
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {KEY_COLS} FROM integration_keys
                 WHERE business_id = ?1 AND key_name = ?2"
            ))?;
            let mut rows = stmt.query(params![biz, name])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_integration_key(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn enqueue_task(&self, task: &ProvisioningTask) -> Result<bool> {
        let t = task.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO provisioning_queue ({TASK_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    t.id,
                    t.business_id,
                    t.customer_id,
                    t.action,
                    t.provider,
                    serde_json::to_string(&t.payload).unwrap_or_default(),
                    t.status.as_str(),
                    t.attempt_count,
                    t.max_attempts,
                    t.next_retry_at.to_rfc3339(),
                    t.idempotency_key,
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn claim_due_task(&self, now: DateTime<Utc>) -> Result<Option<ProvisioningTask>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE provisioning_queue SET status = 'in_progress'
                 WHERE id = (SELECT id FROM provisioning_queue
                             WHERE status = 'pending' AND next_retry_at <= ?1
                             ORDER BY next_retry_at LIMIT 1)
                 RETURNING {TASK_COLS}"
            ))?;
            let mut rows = stmt.query(params![now.to_rfc3339()])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_task(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        attempt_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE provisioning_queue
                 SET status = ?2, attempt_count = ?3,
                     next_retry_at = COALESCE(?4, next_retry_at)
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    attempt_count,
                    next_retry_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_billing_event(&self, event: &BillingEvent) -> Result<(bool, EventStatus)> {
        let e = event.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO billing_events (event_id, business_id, event_type,
                     raw_payload, status, retry_count, error_message, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
                params![
                    e.event_id,
                    e.business_id,
                    e.event_type,
                    e.raw_payload,
                    e.status.as_str(),
                    e.retry_count,
                    e.received_at.to_rfc3339(),
                ],
            )?;
            if inserted > 0 {
                return Ok((true, e.status));
            }
            let status: String = conn.query_row(
                "SELECT status FROM billing_events WHERE event_id = ?1",
                params![e.event_id],
                |row| row.get(0),
            )?;
            Ok((
                false,
                EventStatus::from_str(&status)
                    .with_context(|| format!("bad event status: {status}"))?,
            ))
        })
        .await
    }

    async fn set_event_status(
        &self,
        event_id: &str,
        status: EventStatus,
        retry_count: u32,
        error_message: Option<&str>,
    ) -> Result<()> {
        let id = event_id.to_string();
        let error = error_message.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE billing_events
                 SET status = ?2, retry_count = ?3, error_message = ?4
                 WHERE event_id = ?1",
                params![id, status.as_str(), retry_count, error],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_billing_event(&self, event_id: &str) -> Result<Option<BillingEvent>> {
        let id = event_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, business_id, event_type, raw_payload, status,
                        retry_count, error_message, received_at
                 FROM billing_events WHERE event_id = ?1",
            )?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(map_billing_event(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_billing_events(&self, status: Option<EventStatus>) -> Result<Vec<BillingEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, business_id, event_type, raw_payload, status,
                        retry_count, error_message, received_at
                 FROM billing_events
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY received_at DESC",
            )?;
            let mut rows = stmt.query(params![status.map(|s| s.as_str())])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(map_billing_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    async fn upsert_customer_machine(
        &self,
        business_id: &str,
        customer_id: &str,
        machine_id: &str,
        provider: &str,
        state: &str,
    ) -> Result<()> {
        let biz = business_id.to_string();
        let cust = customer_id.to_string();
        let machine = machine_id.to_string();
        let provider = provider.to_string();
        let state = state.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO customer_machines (business_id, customer_id, machine_id,
                     provider, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (business_id, customer_id, machine_id)
                 DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                params![biz, cust, machine, provider, state, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_customer_machine(
        &self,
        business_id: &str,
        customer_id: &str,
        machine_id: &str,
    ) -> Result<()> {
        let biz = business_id.to_string();
        let cust = customer_id.to_string();
        let machine = machine_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM customer_machines
                 WHERE business_id = ?1 AND customer_id = ?2 AND machine_id = ?3",
                params![biz, cust, machine],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_audit_log(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        let actor = actor.to_string();
        let action = action.to_string();
        let target = target.to_string();
        let detail = detail.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_logs (actor, action, target, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![actor, action, target, detail, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_reconciliation_record(&self, record: &ReconciliationRecord) -> Result<()> {
        let r = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO reconciliation (id, record_type, totals, mismatches_found,
                     mismatches_fixed, errors, ran_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    r.id,
                    r.record_type,
                    r.totals,
                    r.mismatches_found,
                    r.mismatches_fixed,
                    r.errors,
                    r.ran_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(move |conn| {
            let cutoff = cutoff.to_rfc3339();
            let customers = conn.execute(
                "DELETE FROM customers WHERE deleted_at IS NOT NULL AND deleted_at <= ?1",
                params![cutoff],
            )?;
            let businesses = conn.execute(
                "DELETE FROM businesses WHERE deleted_at IS NOT NULL AND deleted_at <= ?1",
                params![cutoff],
            )?;
            Ok((customers + businesses) as u64)
        })
        .await
    }
}
