//! In-RAM stores (hot path) and the durable row store.

pub mod batch_store;
pub mod metric_store;
pub mod row_store;

pub use batch_store::{BatchStore, MetricBatch};
pub use metric_store::{MetricStore, StoreError};
pub use row_store::{RowStore, SqliteRowStore};
