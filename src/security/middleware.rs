use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::AppError;
use crate::state::AppState;

pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

/// Compare digests so the check takes the same time for any wrong token.
fn token_matches(presented: &str, secret: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(secret.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Guards the internal routes with the shared `SERVER_SECRET`.
pub async fn internal_auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    match presented {
        Some(token) if token_matches(token, &state.internal_secret) => next.run(req).await,
        _ => {
            warn!(path = %req.uri().path(), "rejected internal request without a valid token");
            AppError::Unauthorized.into_response()
        }
    }
}
