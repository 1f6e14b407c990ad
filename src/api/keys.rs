//! Key issuance and lifecycle.
//!
//! The plaintext of a generated API key appears in exactly one response.
//! Deactivation goes through the business actor so the auth cache drop is
//! acknowledged before the 2xx goes out.

use crate::actors::business::CreateKeyRequest;
use crate::error::ApiError;
use crate::models::{KeyType, Principal};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub business_id: Option<String>,
    pub key_type: String,
    pub key_name: String,
    pub customer_id: Option<String>,
    #[serde(default)]
    pub credentials: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub key_name: String,
    pub key_type: String,
    pub warning: String,
}

fn target_business(principal: &Principal, requested: Option<String>) -> Result<String, ApiError> {
    match principal {
        Principal::Admin => requested
            .ok_or_else(|| ApiError::validation("admin key issuance requires business_id")),
        Principal::Business { business_id } => {
            if let Some(requested) = requested {
                if requested != *business_id {
                    return Err(ApiError::unauthorized(
                        "business keys cannot issue for other businesses",
                    ));
                }
            }
            Ok(business_id.clone())
        }
        Principal::Customer { .. } => {
            Err(ApiError::unauthorized("customer keys cannot issue keys"))
        }
    }
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Json<CreateKeyResponse>, ApiError> {
    let business_id = target_business(&principal, body.business_id.clone())?;
    let key_type = KeyType::from_str(&body.key_type)
        .ok_or_else(|| ApiError::validation(format!("unknown key_type: {}", body.key_type)))?;

    // Provider credentials arrive in the request; API keys are generated.
    let (credential, metadata) = match &body.credentials {
        Some(credentials) => {
            let secret = credentials
                .get("secret")
                .or_else(|| credentials.get("api_key"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if matches!(key_type, KeyType::Stripe | KeyType::Fly) && secret.is_none() {
                return Err(ApiError::validation(
                    "stored credentials require credentials.secret",
                ));
            }
            let mut metadata = credentials.clone();
            if let Some(obj) = metadata.as_object_mut() {
                obj.remove("secret");
                obj.remove("api_key");
            }
            (secret, Some(metadata).filter(|m| m.as_object().map(|o| !o.is_empty()).unwrap_or(false)))
        }
        None => {
            if matches!(key_type, KeyType::Stripe | KeyType::Fly) {
                return Err(ApiError::validation(
                    "stored credentials require credentials.secret",
                ));
            }
            (None, None)
        }
    };

    let app = state
        .application()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("application actor not started")))?;
    let business = app.ensure_business(&business_id).await.map_err(ApiError::from)?;
    let issued = business
        .create_key(CreateKeyRequest {
            key_type,
            key_name: body.key_name.clone(),
            customer_id: body.customer_id,
            credential,
            metadata,
        })
        .await
        .map_err(ApiError::from)?;

    Ok(Json(CreateKeyResponse {
        api_key: issued.plaintext,
        key_name: issued.key.key_name,
        key_type: issued.key.key_type.as_str().to_string(),
        warning: "Store this key now; the plaintext is never shown again.".into(),
    }))
}

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let business_id = principal
        .business_id()
        .ok_or_else(|| ApiError::unauthorized("key listing requires a business key"))?
        .to_string();
    if matches!(principal, Principal::Customer { .. }) {
        return Err(ApiError::unauthorized("customer keys cannot list keys"));
    }

    let app = state
        .application()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("application actor not started")))?;
    let keys = app
        .ensure_business(&business_id)
        .await
        .map_err(ApiError::from)?
        .list_keys()
        .await
        .map_err(ApiError::from)?;

    let count = keys.len();
    Ok(Json(serde_json::json!({
        "keys": keys,
        "count": count,
    })))
}

pub async fn deactivate_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(key_name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let business_id = match &principal {
        Principal::Business { business_id } => business_id.clone(),
        _ => {
            return Err(ApiError::unauthorized(
                "key deactivation requires a business key",
            ))
        }
    };

    let app = state
        .application()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("application actor not started")))?;
    app.ensure_business(&business_id)
        .await
        .map_err(ApiError::from)?
        .deactivate_key(&key_name)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(serde_json::json!({
        "key_name": key_name,
        "is_active": false,
    })))
}
