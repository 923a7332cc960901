//! Gateway authentication middleware.
//!
//! Sessions and API keys are verified by the front-end gateway. The gateway
//! presents a shared secret as a bearer token and names the acting user in
//! `X-Stowage-User`.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use stowage_core::token::sha256_hex;
use tracing::Instrument;
use uuid::Uuid;

/// Header carrying the acting user's id.
pub const USER_HEADER: &str = "x-stowage-user";

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Sanitize a client-provided value: at most 128 characters, printable ASCII only.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user a gateway request acts for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
}

impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .copied()
            .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
    }
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Verify the gateway secret and record the acting user.
///
/// Requests without credentials pass through unauthenticated; handlers that
/// need a user reject them through the [`AuthenticatedUser`] extractor. A
/// wrong secret or a malformed user header is rejected here.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    if let Some(secret) = extract_bearer_token(&req) {
        let expected = state.config.server.gateway_token_hash.trim();
        if !sha256_hex(secret).eq_ignore_ascii_case(expected) {
            return Err(ApiError::Unauthorized("invalid gateway token".to_string()));
        }
        let user_id = user_header(&req)?;
        req.extensions_mut().insert(AuthenticatedUser { user_id });
    }

    let response = next
        .run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await;

    Ok(response)
}

fn user_header(req: &Request) -> ApiResult<Uuid> {
    let value = req
        .headers()
        .get(USER_HEADER)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_HEADER} header")))?;
    value
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("invalid {USER_HEADER} header")))
}
