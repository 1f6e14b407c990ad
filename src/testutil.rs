//! Shared fixtures for unit tests.

use crate::models::Config;
use crate::state::AppState;
use crate::store::SqliteRowStore;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use tempfile::NamedTempFile;

pub fn test_config() -> Config {
    Config {
        database_path: ":memory:".into(),
        bind_addr: "127.0.0.1".into(),
        port: 0,
        admin_secret: "admin-secret".into(),
        encryption_key: BASE64.encode([7u8; 32]),
        stripe_secret_key: None,
        stripe_api_base: "https://api.stripe.com".into(),
        mock_mode: true,
        tick_settle_ms: 10,
        outbound_timeout_secs: 5,
        provisioning_workers: 1,
    }
}

/// Full state backed by a throwaway SQLite file and a mock-mode Stripe
/// client. Keep the temp file alive for the duration of the test.
pub async fn test_state() -> (Arc<AppState>, NamedTempFile) {
    let tmp = NamedTempFile::new().unwrap();
    let row_store = Arc::new(SqliteRowStore::new(tmp.path().to_str().unwrap()).unwrap());
    let state = AppState::new(test_config(), row_store).unwrap();
    (Arc::new(state), tmp)
}
