//! Gated proxy: the limit-enforcement entry point.
//!
//! Resolves the caller's metric, evaluates the effective limit, and only
//! then forwards the wrapped request upstream. Quota is consumed strictly
//! after upstream success; a denied request neither forwards nor
//! increments.

use crate::api::metrics::touch_metric;
use crate::clock;
use crate::error::ApiError;
use crate::limits::{evaluate_gate, BreachStatus, GateDecision};
use crate::models::{AccountId, Principal};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    pub metric_name: String,
    pub target_url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ForwardedResponse {
    pub status_code: u16,
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct ProxyResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach_status: Option<BreachStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_response: Option<ForwardedResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

fn seconds_to_next_flush(flush_interval: &str) -> Option<u64> {
    let period = clock::tick_period(flush_interval)?;
    let now = Utc::now();
    let next = clock::next_boundary(period, now);
    (next - now).num_seconds().try_into().ok()
}

pub async fn proxy_request(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<ProxyRequest>,
) -> Result<(StatusCode, Json<ProxyResponse>), ApiError> {
    let Principal::Customer {
        business_id,
        customer_id,
    } = &principal
    else {
        return Err(ApiError::unauthorized("proxy requires a customer key"));
    };
    let account = AccountId::customer(business_id.clone(), customer_id.clone());

    // Resolve the gate. A metric that exists neither as a definition nor
    // as a limit means nothing to enforce: forward without consuming.
    let handle = match touch_metric(&state, &account, &request.metric_name, None).await {
        Ok(handle) => Some(handle),
        Err(ApiError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let decision = match &handle {
        Some(handle) => {
            let snapshot = handle.snapshot().await.map_err(ApiError::from)?;
            let decision = evaluate_gate(snapshot.current, snapshot.limit.as_ref());
            if let GateDecision::Deny(status) = &decision {
                debug!(
                    account = %account,
                    metric = %request.metric_name,
                    current = status.current_usage,
                    "proxy denied"
                );
                return Ok((
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ProxyResponse {
                        status: "denied",
                        breach_status: Some(status.clone()),
                        forwarded_response: None,
                        error: None,
                        retry_after: seconds_to_next_flush(&snapshot.flush_interval),
                    }),
                ));
            }
            Some(decision)
        }
        None => None,
    };

    // Forward upstream.
    let method: reqwest::Method = request
        .method
        .to_uppercase()
        .parse()
        .map_err(|_| ApiError::validation(format!("unknown method: {}", request.method)))?;
    let mut outbound = state.http.request(method, &request.target_url);
    if let Some(headers) = &request.headers {
        for (name, value) in headers {
            // The tenant's auth header belongs to us, not upstream.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            outbound = outbound.header(name, value);
        }
    }
    if let Some(body) = &request.body {
        outbound = outbound.body(body.clone());
    }

    let upstream = match outbound.send().await {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => {
            return Err(ApiError::upstream_timeout(format!(
                "upstream timed out: {}",
                request.target_url
            )))
        }
        Err(e) => {
            warn!(target = %request.target_url, error = %e, "proxy forward failed");
            return Err(ApiError::upstream(format!("upstream unreachable: {e}")));
        }
    };

    let status_code = upstream.status().as_u16();
    let body = upstream.text().await.unwrap_or_default();
    let upstream_ok = (200..300).contains(&status_code);

    // Increment-after-success: failed upstream calls consume no quota.
    let breach_status = match handle {
        Some(handle) if upstream_ok => {
            handle.increment(1.0).await.map_err(ApiError::from)?;
            let snapshot = handle.snapshot().await.map_err(ApiError::from)?;
            evaluate_gate(snapshot.current, snapshot.limit.as_ref())
                .breach_status()
                .cloned()
        }
        Some(_) => decision.as_ref().and_then(|d| d.breach_status()).cloned(),
        None => None,
    };

    let our_status =
        StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((
        our_status,
        Json(ProxyResponse {
            status: "allowed",
            breach_status,
            forwarded_response: Some(ForwardedResponse { status_code, body }),
            error: None,
            retry_after: None,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_to_next_flush_is_bounded_by_period() {
        let secs = seconds_to_next_flush("tick_1m").unwrap();
        assert!(secs <= 60);
        let secs = seconds_to_next_flush("tick_1h").unwrap();
        assert!(secs <= 3600);
        assert!(seconds_to_next_flush("tick_2h").is_none());
    }
}
