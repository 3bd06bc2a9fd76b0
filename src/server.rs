use crate::error::AdapterError;
use crate::service::AdapterService;
use crate::translate::openai_types::{ChatRequest, ErrorResponse, FilePurpose, HealthResponse};

use axum::body::Body;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Inline base64 images make chat bodies large.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AdapterService>,
    pub bearer_token: String,
    pub version: String,
    pub cors_allowed_origins: Vec<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/models", get(handle_models))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/files", post(handle_upload_file))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    let health = Router::new()
        .route("/health/liveness", get(handle_liveness))
        .route("/health/readiness", get(handle_readiness));

    let mut app = protected
        .merge(health)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&state.cors_allowed_origins) {
        app = app.layer(cors);
    }

    app.with_state(state)
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request()),
    )
}

async fn require_bearer(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim());

    if !bearer_matches(presented, &state.bearer_token) {
        let err = ErrorResponse::http_exception("Invalid or missing Bearer token");
        return (StatusCode::UNAUTHORIZED, Json(err)).into_response();
    }

    next.run(request).await
}

/// Digests are compared so neither the content nor the length of the
/// expected token leaks through timing.
fn bearer_matches(presented: Option<&str>, expected: &str) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented.as_slice().ct_eq(expected.as_slice()).into()
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: ChatRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .service
                .logger()
                .error("server", format!("Failed to parse request: {}", e));
            let err = ErrorResponse::bad_request(e.to_string());
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    tracing::debug!(
        model = %req.model,
        streaming = req.stream,
        messages = req.messages.len(),
        "chat/completions request"
    );

    if req.stream {
        handle_streaming(state, &req).await
    } else {
        match state.service.chat(&req).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => error_response(&state, e),
        }
    }
}

async fn handle_streaming(state: Arc<AppState>, req: &ChatRequest) -> Response {
    let sse_stream = match state.service.stream_chat_sse(req).await {
        Ok(s) => s,
        Err(e) => return error_response(&state, e),
    };

    let body = Body::from_stream(sse_stream.map(Ok::<_, Infallible>));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_upload_file(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(e) => return bad_request(e.body_text()),
    };

    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut purpose: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(e.body_text()),
        };

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = match field.bytes().await {
                    Ok(d) => d,
                    Err(e) => return bad_request(e.body_text()),
                };
                if let (Some(filename), Some(content_type)) = (filename, content_type) {
                    file = Some((filename, content_type, data.to_vec()));
                }
            }
            Some("purpose") => match field.text().await {
                Ok(text) => purpose = Some(text),
                Err(e) => return bad_request(e.body_text()),
            },
            _ => {}
        }
    }

    let Some((filename, content_type, data)) = file else {
        return bad_request("No file uploaded");
    };
    let Some(purpose_value) = purpose else {
        return bad_request("Field 'purpose' is required");
    };
    let Some(purpose) = FilePurpose::parse(purpose_value.trim()) else {
        return bad_request(format!("Unsupported purpose '{purpose_value}'"));
    };

    match state
        .service
        .upload_file(filename, content_type, purpose, data)
        .await
    {
        Ok(uploaded) => Json(uploaded).into_response(),
        Err(e) => error_response(&state, e),
    }
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Response {
    match state.service.list_models().await {
        Ok(models) => Json(models).into_response(),
        Err(e) => error_response(&state, e),
    }
}

async fn handle_liveness(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: state.version.clone(),
    })
}

async fn handle_readiness(State(state): State<Arc<AppState>>) -> Response {
    match state.service.list_models().await {
        Ok(_) => Json(HealthResponse {
            status: "ok".to_string(),
            version: state.version.clone(),
        })
        .into_response(),
        Err(e) => error_response(&state, e),
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::bad_request(message))).into_response()
}

fn error_response(state: &AppState, err: AdapterError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status == StatusCode::BAD_REQUEST {
        return bad_request(err.to_string());
    }

    state
        .service
        .logger()
        .error("server", format!("Request failed: {}", err));
    (status, Json(ErrorResponse::http_exception(err.to_string()))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_matches() {
        assert!(bearer_matches(Some("s3cret"), "s3cret"));
        assert!(!bearer_matches(Some("s3creT"), "s3cret"));
        assert!(!bearer_matches(Some("s3cret-but-longer"), "s3cret"));
        assert!(!bearer_matches(Some(""), "s3cret"));
        assert!(!bearer_matches(None, "s3cret"));
    }
}
