//! Ingest API key middleware.
//!
//! §6/§7: write endpoints require an `X-API-Key` header matching
//! `Config::ingest_api_key` when one is configured. Extract -> validate
//! -> reject with a typed error, no JWT claims machinery involved.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug)]
pub enum ApiKeyError {
    Missing,
    Invalid,
}

impl IntoResponse for ApiKeyError {
    fn into_response(self) -> Response {
        let message = match self {
            ApiKeyError::Missing => "missing X-API-Key header",
            ApiKeyError::Invalid => "invalid X-API-Key header",
        };
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({"success": false, "error": message})),
        )
            .into_response()
    }
}

/// When `expected_key` is `None`, ingest auth is disabled and every
/// request passes through untouched.
pub async fn require_api_key(
    State(expected_key): State<Arc<Option<String>>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiKeyError> {
    let Some(expected) = expected_key.as_ref() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiKeyError::Missing)?;

    if provided != expected {
        return Err(ApiKeyError::Invalid);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn app(expected_key: Option<String>) -> Router {
        Router::new()
            .route("/protected", get(ok_handler))
            .layer(axum::middleware::from_fn_with_state(
                Arc::new(expected_key),
                require_api_key,
            ))
    }

    #[tokio::test]
    async fn rejects_missing_key_when_configured() {
        let response = app(Some("secret".to_string()))
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_matching_key() {
        let response = app(Some("secret".to_string()))
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn passes_through_when_unconfigured() {
        let response = app(None)
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
