//! API-key authentication: key material, hashing, encryption at rest,
//! and the axum middleware that resolves bearer keys to principals.

pub mod keys;
pub mod middleware;

pub use keys::{generate_api_key, hash_key, KeyCipher};
pub use middleware::{
    admin_auth_middleware, admin_or_bearer_middleware, auth_middleware, AuthState,
};
