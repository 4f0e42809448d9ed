//! # Authentication Module
//!
//! API key authentication for the topostore HTTP API.
//!
//! `TOPOSTORE_API_KEY`, when set and non-empty, is required on every request
//! except `/health`, either as `Authorization: Bearer <key>` or as the raw key.

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

// =============================================================================
// API KEY AUTHENTICATION
// =============================================================================

/// Returns `Some(key)` if `TOPOSTORE_API_KEY` is set and non-empty.
pub fn get_api_key_from_env() -> Option<String> {
    std::env::var("TOPOSTORE_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

/// Compare two keys in time independent of where they first differ.
///
/// Both sides are padded to the same length so `ct_eq` always walks the same
/// number of bytes.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    let max_len = provided.len().max(expected.len());
    let mut padded_provided = vec![0u8; max_len];
    let mut padded_expected = vec![0u8; max_len];
    padded_provided[..provided.len()].copy_from_slice(provided);
    padded_expected[..expected.len()].copy_from_slice(expected);

    let bytes_match: bool = padded_provided.ct_eq(&padded_expected).into();
    bytes_match && provided.len() == expected.len()
}

/// API key authentication middleware.
pub async fn api_key_auth_middleware(
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let Some(expected) = get_api_key_from_env() else {
        return Ok(next.run(request).await);
    };

    // Load balancers poll this without credentials.
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header_value) => {
            let provided = header_value.strip_prefix("Bearer ").unwrap_or(header_value);
            if keys_match(provided.as_bytes(), expected.as_bytes()) {
                Ok(next.run(request).await)
            } else {
                tracing::warn!(
                    event = "auth_failure",
                    reason = "invalid_api_key",
                    "Authentication failed: invalid API key"
                );
                Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
            }
        }
        None => {
            tracing::warn!(
                event = "auth_failure",
                reason = "missing_authorization_header",
                "Missing Authorization header"
            );
            Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
