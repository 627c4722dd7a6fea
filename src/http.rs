//! Maps the resolver's HTTP surface onto store/validation operations, with
//! the caching headers and decoded-view rendering §4.7 specifies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::Bytes, Router};
use claimsrv_claims::{peek_envelope, Activation, Claims};
use claimsrv_notifier::Notifier;
use claimsrv_store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::decoded_view;
use crate::error::ResolverError;
use crate::validation::{AccountOutcome, ValidationPipeline};

const HELP_TEXT: &str = "\
claimsrv: resolver for signed operator/account/activation claims

  GET  /jwt/v1/help
  GET  /healthz
  GET  /jwt/v1/operator             [?text=true|?decode=true]
  GET  /jwt/v1/accounts
  GET  /jwt/v1/accounts/:pubkey     [?text=true|?decode=true|?check=true|?notify=true]
  POST /jwt/v1/accounts/:pubkey
  GET  /jwt/v1/activations/:hash    [?text=true|?decode=true|?notify=true]
  POST /jwt/v1/activations
  GET  /jwt/v1/pack                 [?max=<int>]
";

pub struct AppState {
    pub store: Arc<Store>,
    pub notifier: Arc<Notifier>,
    pub validation: Arc<ValidationPipeline>,
    pub operator_jwt: Option<String>,
    pub system_account: Option<(String, String)>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .expose_headers([header::AUTHORIZATION]);

    Router::new()
        .route("/jwt/v1/help", get(help))
        .route("/healthz", get(healthz))
        .route("/jwt/v1/operator", get(get_operator))
        .route("/jwt/v1/accounts", get(accounts_probe))
        .route("/jwt/v1/accounts/", get(accounts_probe))
        .route(
            "/jwt/v1/accounts/{pubkey}",
            get(get_account).post(post_account),
        )
        .route("/jwt/v1/activations/{hash}", get(get_activation))
        .route("/jwt/v1/activations", post(post_activation))
        .route("/jwt/v1/pack", get(get_pack))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn help() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        HELP_TEXT,
    )
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

fn no_cache_probe() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    (StatusCode::OK, headers, "").into_response()
}

async fn accounts_probe() -> impl IntoResponse {
    no_cache_probe()
}

fn truthy(params: &HashMap<String, String>, key: &str) -> bool {
    params
        .get(key)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

fn cache_control_for(expires: Option<u64>) -> String {
    let max_age = match expires {
        Some(0) | None => 3600,
        Some(exp) => exp.saturating_sub(now()),
    };
    format!("max-age={max_age}, stale-while-revalidate=3600, stale-if-error=3600")
}

/// Whether `render_claim` produced a full body or short-circuited with a
/// 304. Callers gate the `?notify=true` publish on `Full` — a conditional
/// GET that matched `If-None-Match` shouldn't also re-broadcast the claim.
enum ClaimRender {
    Full(Response),
    NotModified(Response),
}

impl ClaimRender {
    fn into_response(self) -> Response {
        match self {
            ClaimRender::Full(response) | ClaimRender::NotModified(response) => response,
        }
    }
}

/// Renders the claim according to `text`/`decode`/default content
/// negotiation, and sets the ETag/Cache-Control headers §4.7 specifies.
/// Returns 404 if `check` is set and the claim has already expired, and 304
/// if the request's `If-None-Match` already matches the claim's `jti`.
fn render_claim(
    encoded: &str,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<ClaimRender, ResolverError> {
    let envelope = peek_envelope(encoded).map_err(|err| ResolverError::Malformed(err.to_string()))?;

    if truthy(params, "check") {
        if let Some(expires) = envelope.expires {
            if expires > 0 && expires < now() {
                return Err(ResolverError::NotFound);
            }
        }
    }

    let etag = format!("\"{}\"", envelope.id);
    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if if_none_match.contains(&etag) {
            let mut response_headers = HeaderMap::new();
            response_headers.insert(header::ETAG, HeaderValue::from_str(&etag).unwrap());
            return Ok(ClaimRender::NotModified(
                (StatusCode::NOT_MODIFIED, response_headers).into_response(),
            ));
        }
    }

    let (content_type, body) = if truthy(params, "text") {
        ("text/plain", encoded.to_string())
    } else if truthy(params, "decode") {
        ("text/plain", decoded_view::render(encoded)?)
    } else {
        ("application/jwt", encoded.to_string())
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response_headers.insert(header::ETAG, HeaderValue::from_str(&etag).unwrap());
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&cache_control_for(envelope.expires)).unwrap(),
    );

    Ok(ClaimRender::Full(
        (StatusCode::OK, response_headers, body).into_response(),
    ))
}

impl IntoResponse for ResolverError {
    fn into_response(self) -> Response {
        let status = match &self {
            ResolverError::Malformed(_) => StatusCode::BAD_REQUEST,
            ResolverError::PolicyRejected(_) => StatusCode::BAD_REQUEST,
            ResolverError::NotFound => StatusCode::NOT_FOUND,
            ResolverError::Conflict => StatusCode::BAD_REQUEST,
            ResolverError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ResolverError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, [(header::CONTENT_TYPE, "text/plain")], self.to_string()).into_response()
    }
}

async fn get_operator(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(encoded) = state.operator_jwt.as_deref() else {
        return ResolverError::NotFound.into_response();
    };
    match render_claim(encoded, &headers, &params) {
        Ok(render) => render.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(pubkey): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if pubkey.is_empty() {
        return no_cache_probe();
    }

    let encoded = match state.store.load(&pubkey) {
        Ok(encoded) => encoded,
        Err(claimsrv_store::StoreError::NotFound) => match &state.system_account {
            Some((subject, encoded)) if subject == &pubkey => encoded.clone(),
            _ => return ResolverError::NotFound.into_response(),
        },
        Err(err) => return ResolverError::from(err).into_response(),
    };

    let response = match render_claim(&encoded, &headers, &params) {
        Ok(ClaimRender::Full(response)) => response,
        Ok(not_modified @ ClaimRender::NotModified(_)) => return not_modified.into_response(),
        Err(err) => return err.into_response(),
    };

    if truthy(&params, "notify") {
        if let Err(err) = state.notifier.publish_account(&pubkey, &encoded).await {
            return ResolverError::Transient(err.to_string()).into_response();
        }
    }

    response
}

async fn post_account(
    State(state): State<Arc<AppState>>,
    Path(pubkey): Path<String>,
    body: Bytes,
) -> Response {
    let encoded = String::from_utf8_lossy(&body).into_owned();
    match state.validation.update_account(&pubkey, &encoded).await {
        Ok(AccountOutcome::Accepted) => StatusCode::OK.into_response(),
        Ok(AccountOutcome::SigningPending(message)) => {
            (StatusCode::ACCEPTED, [(header::CONTENT_TYPE, "text/plain")], message).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_activation(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let encoded = match state.store.load(&hash) {
        Ok(encoded) => encoded,
        Err(err) => return ResolverError::from(err).into_response(),
    };

    let response = match render_claim(&encoded, &headers, &params) {
        Ok(ClaimRender::Full(response)) => response,
        Ok(not_modified @ ClaimRender::NotModified(_)) => return not_modified.into_response(),
        Err(err) => return err.into_response(),
    };

    if truthy(&params, "notify") {
        let account = Claims::<Activation>::decode(&encoded)
            .map(|claims| claims.issuer)
            .unwrap_or_default();
        if let Err(err) = state.notifier.publish_activation(&account, &hash, &encoded).await {
            return ResolverError::Transient(err.to_string()).into_response();
        }
    }

    response
}

async fn post_activation(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let encoded = String::from_utf8_lossy(&body).into_owned();
    match state.validation.update_activation(&encoded).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_pack(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let max = match params.get("max").map(|v| v.parse::<i64>()) {
        Some(Ok(max)) => max,
        Some(Err(_)) => return ResolverError::Malformed("max must be an integer".to_string()).into_response(),
        None => -1,
    };
    let body = state.store.pack(max);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response()
}
