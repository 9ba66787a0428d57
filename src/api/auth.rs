// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against the MIRROR_ADMIN_TOKEN
// environment variable. Comparison is constant time. When the variable is
// unset the control API is effectively locked: every authenticated request
// is rejected with the missing key named in the response.
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const ADMIN_TOKEN_ENV: &str = "MIRROR_ADMIN_TOKEN";

/// Constant-time byte comparison. Every byte is examined even after a
/// mismatch so timing does not reveal the mismatch position.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Extractor guarding the control endpoints. Yields the raw token for audit
/// logging; short-circuits with 403 when the header is absent or wrong.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read per-request so rotation does not need a restart.
        let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();

        if expected.is_empty() {
            warn!("{ADMIN_TOKEN_ENV} is not set — rejecting authenticated request");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "MIRROR_ADMIN_TOKEN is not configured on the server",
            });
        }

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "missing or malformed authorization header",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

/// Query-parameter variant for the WebSocket upgrade, where headers are not
/// practical.
pub fn validate_token(token: &str) -> bool {
    let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
    !expected.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn unequal_inputs_fail() {
        assert!(!constant_time_eq(b"secret-token", b"other-token1"));
        assert!(!constant_time_eq(b"short", b"much-longer-token"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
