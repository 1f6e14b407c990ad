//! Core domain types shared across actors, stores and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregation operation applied by a metric on each increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricOp {
    Sum,
    Min,
    Max,
    Count,
    Average,
    Last,
}

impl MetricOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricOp::Sum => "SUM",
            MetricOp::Min => "MIN",
            MetricOp::Max => "MAX",
            MetricOp::Count => "COUNT",
            MetricOp::Average => "AVERAGE",
            MetricOp::Last => "LAST",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUM" => Some(MetricOp::Sum),
            "MIN" => Some(MetricOp::Min),
            "MAX" => Some(MetricOp::Max),
            "COUNT" => Some(MetricOp::Count),
            "AVERAGE" => Some(MetricOp::Average),
            "LAST" => Some(MetricOp::Last),
            _ => None,
        }
    }
}

/// Flush behavior of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Counter that returns to its initial value on every flush.
    Reset,
    /// Counter that accumulates across flushes; increments go through the
    /// row store's atomic upsert so concurrent writers never lose updates.
    Checkpoint,
    /// Accumulator that resets on billing-cycle events, not on ticks.
    StripeBilling,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Reset => "reset",
            MetricType::Checkpoint => "checkpoint",
            MetricType::StripeBilling => "stripe_billing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "reset" => Some(MetricType::Reset),
            "checkpoint" => Some(MetricType::Checkpoint),
            "stripe_billing" => Some(MetricType::StripeBilling),
            _ => None,
        }
    }
}

/// Comparison applied between a metric's current value and its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachOperator {
    Gte,
    Gt,
    Lte,
    Lt,
    Eq,
}

impl BreachOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachOperator::Gte => "gte",
            BreachOperator::Gt => "gt",
            BreachOperator::Lte => "lte",
            BreachOperator::Lt => "lt",
            BreachOperator::Eq => "eq",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gte" => Some(BreachOperator::Gte),
            "gt" => Some(BreachOperator::Gt),
            "lte" => Some(BreachOperator::Lte),
            "lt" => Some(BreachOperator::Lt),
            "eq" => Some(BreachOperator::Eq),
            _ => None,
        }
    }

    /// Evaluate the breach condition. `eq` is exact f64 equality; callers
    /// with real-valued metrics should prefer `gte`/`lte`.
    pub fn evaluate(&self, current: f64, limit: f64) -> bool {
        match self {
            BreachOperator::Gte => current >= limit,
            BreachOperator::Gt => current > limit,
            BreachOperator::Lte => current <= limit,
            BreachOperator::Lt => current < limit,
            BreachOperator::Eq => current == limit,
        }
    }
}

/// Side effect fired when a limit is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachAction {
    Deny,
    AllowOverage,
    Webhook,
    Log,
}

impl BreachAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachAction::Deny => "deny",
            BreachAction::AllowOverage => "allow_overage",
            BreachAction::Webhook => "webhook",
            BreachAction::Log => "log",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "deny" => Some(BreachAction::Deny),
            "allow_overage" => Some(BreachAction::AllowOverage),
            "webhook" => Some(BreachAction::Webhook),
            "log" => Some(BreachAction::Log),
            _ => None,
        }
    }
}

/// Aggregation mode. Precision mode is recognized on the wire but not
/// supported; referencing it fails with `NotImplemented`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMode {
    #[default]
    Simple,
    Precision,
}

/// Scope a plan limit was resolved from. Ordering is precedence:
/// customer override beats plan, plan beats business default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    BusinessDefault,
    Plan,
    CustomerOverride,
}

/// Kind of credential stored in `integration_keys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Business,
    CustomerApi,
    Stripe,
    Fly,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Business => "business",
            KeyType::CustomerApi => "customer_api",
            KeyType::Stripe => "stripe",
            KeyType::Fly => "fly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "business" => Some(KeyType::Business),
            "customer_api" => Some(KeyType::CustomerApi),
            "stripe" => Some(KeyType::Stripe),
            "fly" => Some(KeyType::Fly),
            _ => None,
        }
    }
}

/// Composite partition key `business_id[/customer_id]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId {
    pub business_id: String,
    pub customer_id: Option<String>,
}

impl AccountId {
    pub fn business(business_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            customer_id: None,
        }
    }

    pub fn customer(business_id: impl Into<String>, customer_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            customer_id: Some(customer_id.into()),
        }
    }

    pub fn scope(&self) -> &'static str {
        if self.customer_id.is_some() {
            "customer"
        } else {
            "business"
        }
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.customer_id {
            Some(c) => write!(f, "{}/{}", self.business_id, c),
            None => write!(f, "{}", self.business_id),
        }
    }
}

/// Authenticated subject derived from an API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Admin,
    Business {
        business_id: String,
    },
    Customer {
        business_id: String,
        customer_id: String,
    },
}

impl Principal {
    pub fn business_id(&self) -> Option<&str> {
        match self {
            Principal::Admin => None,
            Principal::Business { business_id } => Some(business_id),
            Principal::Customer { business_id, .. } => Some(business_id),
        }
    }
}

/// Tenant root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub business_id: String,
    pub business_name: String,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub subscription_status: Option<String>,
    pub plan_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// End-user of a Business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub business_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub email: Option<String>,
    pub plan_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub subscription_ends_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Named plan bundle within a Business. Each business carries a
/// distinguished free plan used as the downgrade fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub business_id: String,
    pub plan_name: String,
    pub stripe_price_id: Option<String>,
    pub plan_status: String,
}

impl Plan {
    pub fn is_free_plan(&self) -> bool {
        self.plan_name == "free_plan"
    }
}

/// Cap for one metric, attached to exactly one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimit {
    pub id: String,
    pub business_id: String,
    pub plan_id: Option<String>,
    pub customer_id: Option<String>,
    pub metric_name: String,
    pub limit_value: f64,
    /// Tick name the limit is enforced over; doubles as the flush
    /// interval when a metric is materialized from this limit alone.
    pub limit_period: Option<String>,
    pub breach_operator: BreachOperator,
    pub breach_action: BreachAction,
    pub webhook_urls: Option<Vec<String>>,
    pub metric_type: MetricType,
}

impl PlanLimit {
    pub fn scope(&self) -> LimitScope {
        if self.customer_id.is_some() {
            LimitScope::CustomerOverride
        } else if self.plan_id.is_some() {
            LimitScope::Plan
        } else {
            LimitScope::BusinessDefault
        }
    }
}

/// Provider integration knobs carried by a metric definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricAdapters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_price_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_batch_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overage_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overage_product_id: Option<String>,
}

impl MetricAdapters {
    pub fn is_empty(&self) -> bool {
        *self == MetricAdapters::default()
    }
}

/// Runtime definition of one `(account, metric)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub account_id: AccountId,
    pub metric_name: String,
    #[serde(default)]
    pub mode: MetricMode,
    pub operation: MetricOp,
    pub metric_type: MetricType,
    /// Tick name, e.g. `tick_1m`.
    pub flush_interval: String,
    pub initial_value: f64,
    pub limit_value: Option<f64>,
    pub limit_operator: Option<BreachOperator>,
    pub breach_action: Option<BreachAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_urls: Option<Vec<String>>,
    #[serde(default)]
    pub adapters: MetricAdapters,
}

/// One persisted row per flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub business_id: String,
    pub customer_id: Option<String>,
    pub metric_name: String,
    pub value: f64,
    pub metric_type: MetricType,
    pub scope: String,
    pub adapters: Option<MetricAdapters>,
    pub flushed_at: DateTime<Utc>,
}

/// Per-business credential. Plaintext never persists; only the AES-GCM
/// ciphertext and the SHA-256 hash used for cache lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationKey {
    pub id: String,
    pub business_id: String,
    pub customer_id: Option<String>,
    pub key_type: KeyType,
    pub key_name: String,
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub is_active: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Status of a durable provisioning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    DeadLetter,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "done" => Some(TaskStatus::Done),
            "dead_letter" => Some(TaskStatus::DeadLetter),
            _ => None,
        }
    }
}

/// Durable provisioning job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningTask {
    pub id: String,
    pub business_id: String,
    pub customer_id: String,
    pub action: String,
    pub provider: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Processing state of an inbound billing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

/// Inbound webhook envelope as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub event_id: String,
    pub business_id: Option<String>,
    pub event_type: String,
    pub raw_payload: String,
    pub status: EventStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Result row emitted by a reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: String,
    pub record_type: String,
    pub totals: u64,
    pub mismatches_found: u64,
    pub mismatches_fixed: u64,
    pub errors: u64,
    pub ran_at: DateTime<Utc>,
}

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: String,
    pub port: u16,
    pub admin_secret: String,
    /// Base64-encoded 32-byte AES-256-GCM key.
    pub encryption_key: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_api_base: String,
    pub mock_mode: bool,
    /// Delay between a tick firing and its drainer reading the batch store.
    pub tick_settle_ms: u64,
    pub outbound_timeout_secs: u64,
    pub provisioning_workers: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("TRACKTAGS_DB_PATH").unwrap_or_else(|_| "./tracktags.db".to_string());

        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let admin_secret = std::env::var("ADMIN_SECRET")
            .map_err(|_| anyhow::anyhow!("ADMIN_SECRET must be set"))?;

        let encryption_key = std::env::var("TRACKTAGS_ENCRYPTION_KEY")
            .map_err(|_| anyhow::anyhow!("TRACKTAGS_ENCRYPTION_KEY must be set"))?;

        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY").ok();

        let stripe_api_base = std::env::var("STRIPE_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());

        let mock_mode = std::env::var("MOCK_MODE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let tick_settle_ms = std::env::var("TICK_SETTLE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(250);

        let outbound_timeout_secs = std::env::var("OUTBOUND_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let provisioning_workers = std::env::var("PROVISIONING_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(2);

        Ok(Self {
            database_path,
            bind_addr,
            port,
            admin_secret,
            encryption_key,
            stripe_secret_key,
            stripe_api_base,
            mock_mode,
            tick_settle_ms,
            outbound_timeout_secs,
            provisioning_workers,
        })
    }
}
