//! Actor hierarchy: Application → Business → Customer → Metric.
//!
//! Each actor is a tokio task owning an mpsc command channel; commands
//! carry oneshot reply channels. Messages for one actor run strictly in
//! FIFO order; different actors run concurrently on the runtime. Actors
//! are started lazily on first reference under the registry's per-key
//! start lock and discovered through [`crate::registry::ProcessRegistry`].

pub mod application;
pub mod business;
pub mod customer;
pub mod metric;

use crate::store::StoreError;

/// Heterogeneous handle stored in the process registry.
#[derive(Clone)]
pub enum ActorRef {
    Application(application::ApplicationHandle),
    Business(business::BusinessHandle),
    Customer(customer::CustomerHandle),
    Metric(metric::MetricHandle),
}

impl ActorRef {
    pub fn as_business(&self) -> Option<business::BusinessHandle> {
        match self {
            ActorRef::Business(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn as_customer(&self) -> Option<customer::CustomerHandle> {
        match self {
            ActorRef::Customer(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn as_metric(&self) -> Option<metric::MetricHandle> {
        match self {
            ActorRef::Metric(h) => Some(h.clone()),
            _ => None,
        }
    }
}

/// Failure modes surfaced by actor replies.
#[derive(Debug)]
pub enum ActorError {
    /// Entity the actor would act on does not exist.
    NotFound(String),
    /// Precision mode and other unsupported knobs.
    NotImplemented(&'static str),
    /// Definition or argument rejected before any state changed.
    Invalid(String),
    /// Uniqueness or state-transition violation.
    Conflict(String),
    /// Hot-store failure.
    Store(StoreError),
    /// The actor's channel is gone (stopped or crashed).
    Stopped,
    /// Row store or provider failure.
    Internal(String),
}

impl std::fmt::Display for ActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorError::NotFound(what) => write!(f, "not found: {what}"),
            ActorError::NotImplemented(what) => write!(f, "not implemented: {what}"),
            ActorError::Invalid(why) => write!(f, "invalid: {why}"),
            ActorError::Conflict(why) => write!(f, "conflict: {why}"),
            ActorError::Store(e) => write!(f, "store error: {e}"),
            ActorError::Stopped => write!(f, "actor stopped"),
            ActorError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ActorError {}

impl From<StoreError> for ActorError {
    fn from(e: StoreError) -> Self {
        ActorError::Store(e)
    }
}

impl From<anyhow::Error> for ActorError {
    fn from(e: anyhow::Error) -> Self {
        ActorError::Internal(format!("{e:#}"))
    }
}

impl From<ActorError> for crate::error::ApiError {
    fn from(e: ActorError) -> Self {
        use crate::error::ApiError;
        match e {
            ActorError::NotFound(what) => ApiError::NotFound(what),
            ActorError::NotImplemented(what) => ApiError::NotImplemented(what.to_string()),
            ActorError::Invalid(why) => ApiError::Validation(why),
            ActorError::Conflict(why) => ApiError::Conflict(why),
            ActorError::Store(StoreError::EntryNotFound(key)) => ApiError::NotFound(key),
            ActorError::Store(e) => ApiError::Internal(anyhow::anyhow!(e.to_string())),
            ActorError::Stopped => ApiError::Internal(anyhow::anyhow!("actor stopped")),
            ActorError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

pub(crate) type Reply<T> = tokio::sync::oneshot::Sender<T>;

/// Await a reply, mapping a dropped channel to `Stopped`.
pub(crate) async fn recv_reply<T>(
    rx: tokio::sync::oneshot::Receiver<T>,
) -> Result<T, ActorError> {
    rx.await.map_err(|_| ActorError::Stopped)
}
