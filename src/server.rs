//! Axum router construction and object route handlers.
//!
//! The [`app`] function wires the object endpoints and the reserved
//! `/_stowry/*` endpoints (health, metrics, OpenAPI) and returns a
//! ready-to-serve [`axum::Router`].
//!
//! Object routes sit behind the signature middleware: GET/HEAD use the read
//! verifier, PUT/DELETE the write verifier.  A public access level installs
//! no verifier and requests pass straight through.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, RawQuery, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use metrics::counter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use utoipa::OpenApi;

use crate::auth::RequestInfo;
use crate::config::{CorsConfig, ServerMode};
use crate::errors::{ApiError, ErrorKind, ErrorResponse, StowryError};
use crate::metadata::{ListQuery, ListResult, MetaData};
use crate::metrics::{
    metrics_handler, metrics_middleware, AUTH_FAILURES_TOTAL, BYTES_RECEIVED_TOTAL, METRICS_PATH,
};
use crate::path::is_valid_path;
use crate::service::CreateObject;
use crate::AppState;

/// Namespace reserved for server endpoints; objects cannot be stored here.
const RESERVED_PREFIX: &str = "_stowry/";

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the Stowry HTTP API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Stowry Object Storage API",
        version = "0.1.0",
        description = "Self-hosted object storage with presigned URL authentication"
    ),
    paths(
        health_check,
        handle_root,
        handle_get,
        handle_head,
        handle_put,
        handle_delete,
    ),
    components(schemas(MetaData, ListResult, ErrorResponse)),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Object", description = "Object operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with the object routes and the reserved
/// `/_stowry/*` endpoints.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/", get(handle_root).head(handle_head_root))
        .route(
            "/*path",
            get(handle_get)
                .head(handle_head)
                .put(handle_put)
                .delete(handle_delete),
        )
        // Only the object routes above are authenticated.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .route("/_stowry/health", get(health_check))
        .route("/_stowry/openapi.json", get(openapi_json));

    if state.config.observability.metrics {
        router = router.route(METRICS_PATH, get(metrics_handler));
    }

    let cors = state.config.cors.enabled.then(|| cors_layer(&state.config.cors));

    let mut router = router
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if let Some(cors) = cors {
        router = router.layer(cors);
    }
    router
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        // Upload size is enforced while streaming, see `handle_put`.
        .layer(DefaultBodyLimit::disable())
}

// -- CORS ---------------------------------------------------------------------

fn is_wildcard(values: &[String]) -> bool {
    values.iter().any(|v| v == "*")
}

fn header_values(values: &[String]) -> Vec<HeaderValue> {
    values
        .iter()
        .filter_map(|v| match HeaderValue::from_str(v) {
            Ok(h) => Some(h),
            Err(_) => {
                warn!(value = %v, "ignoring invalid CORS origin");
                None
            }
        })
        .collect()
}

fn header_names(values: &[String]) -> Vec<HeaderName> {
    values
        .iter()
        .filter_map(|v| HeaderName::from_bytes(v.as_bytes()).ok())
        .collect()
}

/// Translate the CORS config section into a [`CorsLayer`].
///
/// Wildcards cannot be combined with credentials, so with
/// `allow_credentials` a `*` mirrors the request instead.
fn cors_layer(cfg: &CorsConfig) -> CorsLayer {
    let creds = cfg.allow_credentials;

    let origins = match (is_wildcard(&cfg.allowed_origins), creds) {
        (true, false) => AllowOrigin::any(),
        (true, true) => AllowOrigin::mirror_request(),
        (false, _) => AllowOrigin::list(header_values(&cfg.allowed_origins)),
    };
    let methods = match (is_wildcard(&cfg.allowed_methods), creds) {
        (true, false) => AllowMethods::any(),
        (true, true) => AllowMethods::mirror_request(),
        (false, _) => AllowMethods::list(
            cfg.allowed_methods
                .iter()
                .filter_map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok()),
        ),
    };
    let headers = match (is_wildcard(&cfg.allowed_headers), creds) {
        (true, false) => AllowHeaders::any(),
        (true, true) => AllowHeaders::mirror_request(),
        (false, _) => AllowHeaders::list(header_names(&cfg.allowed_headers)),
    };
    let exposed = if is_wildcard(&cfg.exposed_headers) && !creds {
        ExposeHeaders::any()
    } else {
        ExposeHeaders::list(header_names(&cfg.exposed_headers))
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers(exposed)
        .allow_credentials(creds)
        .max_age(Duration::from_secs(cfg.max_age))
}

// -- Auth middleware ----------------------------------------------------------

/// Presigned URL middleware for object routes.
///
/// Picks the read verifier for GET/HEAD and the write verifier otherwise.
/// The specific rejection reason is returned in the message.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let verifier = match *req.method() {
        Method::GET | Method::HEAD => state.read_verifier.as_ref(),
        _ => state.write_verifier.as_ref(),
    };

    if let Some(verifier) = verifier {
        let info = RequestInfo::from_parts(req.method(), req.uri(), req.headers());
        if let Err(e) = verifier.verify(&info) {
            debug!(method = %info.method, path = %info.raw_path, reason = %e, "signature rejected");
            counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(ApiError::Unauthorized(e.to_string()));
        }
    }

    Ok(next.run(req).await)
}

// -- Internal endpoints -------------------------------------------------------

/// `GET /_stowry/health` -- Liveness check.
#[utoipa::path(
    get,
    path = "/_stowry/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// -- Request helpers ----------------------------------------------------------

/// Parse raw query string into a HashMap.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            let decode = |s: &str| {
                percent_encoding::percent_decode_str(&s.replace('+', " "))
                    .decode_utf8_lossy()
                    .into_owned()
            };
            map.entry(decode(k)).or_insert_with(|| decode(v));
        }
    }
    map
}

/// Non-empty header value as a string.
fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// A token that fires when the handler future is dropped (client gone).
fn request_context() -> (CancellationToken, DropGuard) {
    let ctx = CancellationToken::new();
    let guard = ctx.clone().drop_guard();
    (ctx, guard)
}

fn check_read_path(path: &str) -> Result<(), ApiError> {
    if !path.is_empty() && !is_valid_path(path) {
        return Err(ApiError::InvalidPath);
    }
    Ok(())
}

fn check_write_path(path: &str) -> Result<(), ApiError> {
    if path.is_empty() || !is_valid_path(path) || path.starts_with(RESERVED_PREFIX) {
        return Err(ApiError::InvalidPath);
    }
    Ok(())
}

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a Range header.
#[derive(Debug, Clone, PartialEq)]
enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-  (from start to end of file)
    StartOpen(u64),
    /// bytes=-N  (last N bytes)
    Suffix(u64),
}

/// Parse a Range header value like "bytes=0-4", "bytes=5-", "bytes=-3".
/// Returns None if the header is not a single valid bytes range.
fn parse_range_header(range_str: &str) -> Option<ByteRange> {
    let spec = range_str.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        (n > 0).then_some(ByteRange::Suffix(n))
    } else if let Some(stripped) = spec.strip_suffix('-') {
        Some(ByteRange::StartOpen(stripped.parse().ok()?))
    } else {
        let (start_s, end_s) = spec.split_once('-')?;
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = end_s.parse().ok()?;
        (start <= end).then_some(ByteRange::StartEnd(start, end))
    }
}

/// Resolve a ByteRange against a total content length.
/// Returns (start, end) where both are inclusive, or None if unsatisfiable.
fn resolve_range(range: &ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match *range {
        ByteRange::StartEnd(start, end) => {
            (start < total).then(|| (start, end.min(total - 1)))
        }
        ByteRange::StartOpen(start) => (start < total).then(|| (start, total - 1)),
        ByteRange::Suffix(n) => Some((total.saturating_sub(n), total - 1)),
    }
}

// -- Conditional requests -----------------------------------------------------

fn quoted_etag(meta: &MetaData) -> String {
    format!("\"{}\"", meta.etag)
}

/// Strong comparison for `If-Match`: weak candidates never match.  Accepts
/// `*`, comma-separated lists, and quoted or bare values.
fn etag_strong_match(header_val: &str, etag: &str) -> bool {
    if header_val.trim() == "*" {
        return true;
    }
    if etag.starts_with("W/") {
        return false;
    }
    let opaque = etag.trim_matches('"');
    header_val
        .split(',')
        .map(str::trim)
        .filter(|c| !c.starts_with("W/"))
        .any(|c| c == etag || c.trim_matches('"') == opaque)
}

/// Weak comparison for `If-None-Match`: `W/` prefixes are ignored on both
/// sides.
fn etag_weak_match(header_val: &str, etag: &str) -> bool {
    if header_val.trim() == "*" {
        return true;
    }
    let opaque = etag.strip_prefix("W/").unwrap_or(etag);
    header_val
        .split(',')
        .map(str::trim)
        .map(|c| c.strip_prefix("W/").unwrap_or(c))
        .any(|c| c == opaque)
}

/// `If-None-Match` wins over `If-Modified-Since`; dates compare at second
/// precision.
fn is_not_modified(headers: &HeaderMap, meta: &MetaData) -> bool {
    if let Some(inm) = header_str(headers, header::IF_NONE_MATCH) {
        return etag_weak_match(inm, &quoted_etag(meta));
    }
    if let Some(ims) = header_str(headers, header::IF_MODIFIED_SINCE) {
        if let Ok(since) = httpdate::parse_http_date(ims) {
            let since = DateTime::<Utc>::from(since).timestamp();
            return meta.updated_at.timestamp() <= since;
        }
    }
    false
}

fn http_date(ts: DateTime<Utc>) -> String {
    httpdate::fmt_http_date(SystemTime::from(ts))
}

/// ETag, Content-Type, Last-Modified and Accept-Ranges for `meta`.
fn object_headers(meta: &MetaData) -> HeaderMap {
    let mut hdrs = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&quoted_etag(meta)) {
        hdrs.insert(header::ETAG, v);
    }
    hdrs.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(v) = HeaderValue::from_str(&http_date(meta.updated_at)) {
        hdrs.insert(header::LAST_MODIFIED, v);
    }
    hdrs.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    hdrs
}

fn not_modified(meta: &MetaData) -> Response {
    let mut resp = StatusCode::NOT_MODIFIED.into_response();
    let hdrs = object_headers(meta);
    for name in [header::ETAG, header::LAST_MODIFIED] {
        if let Some(v) = hdrs.get(&name) {
            resp.headers_mut().insert(name.clone(), v.clone());
        }
    }
    resp
}

// -- Root dispatch ------------------------------------------------------------

/// `GET /` -- List active objects in store mode; static and spa modes serve
/// the site index instead.
#[utoipa::path(
    get,
    path = "/",
    tag = "Object",
    operation_id = "ListObjects",
    params(
        ("prefix" = Option<String>, Query, description = "Only paths starting with this prefix"),
        ("limit" = Option<i64>, Query, description = "Page size, clamped to 1..=1000 (default 100)"),
        ("cursor" = Option<String>, Query, description = "Opaque cursor from a previous page"),
    ),
    responses(
        (status = 200, description = "One page of objects", body = ListResult),
        (status = 400, description = "Invalid parameter or cursor", body = ErrorResponse)
    )
)]
async fn handle_root(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    match state.config.server.mode {
        ServerMode::Store => list_objects(&state, raw_query).await,
        ServerMode::Static | ServerMode::Spa => serve_object(&state, "", &headers).await,
    }
}

/// `HEAD /`
async fn handle_head_root(
    State(state): State<Arc<AppState>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    match state.config.server.mode {
        ServerMode::Store => list_objects(&state, raw_query).await,
        ServerMode::Static | ServerMode::Spa => head_object(&state, "", &headers).await,
    }
}

// -- Object handlers ----------------------------------------------------------

async fn list_objects(state: &AppState, raw_query: Option<String>) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);

    let limit = match query.get("limit").filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| ApiError::InvalidParameter("limit must be a valid integer".into()))?
            .clamp(1, MAX_LIST_LIMIT),
        None => DEFAULT_LIST_LIMIT,
    };
    let list_query = ListQuery::new(
        query.get("prefix").cloned().unwrap_or_default(),
        limit as usize,
        query.get("cursor").cloned().unwrap_or_default(),
    );

    let (ctx, _guard) = request_context();
    // The cursor is the only caller-supplied input the listing can reject.
    let result = state
        .service
        .list(&ctx, list_query)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidInput => ApiError::InvalidParameter(e.to_string()),
            _ => ApiError::from(e),
        })?;
    Ok((StatusCode::OK, Json(result)).into_response())
}

/// `GET /{path}` -- Fetch an object.
#[utoipa::path(
    get,
    path = "/{path}",
    tag = "Object",
    operation_id = "GetObject",
    params(
        ("path" = String, Path, description = "Object path"),
    ),
    responses(
        (status = 200, description = "Object content"),
        (status = 206, description = "Partial content"),
        (status = 304, description = "Not modified"),
        (status = 404, description = "Object not found", body = ErrorResponse),
        (status = 416, description = "Range not satisfiable", body = ErrorResponse)
    )
)]
async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_object(&state, &path, &headers).await
}

async fn serve_object(state: &AppState, path: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    check_read_path(path)?;

    let (ctx, _guard) = request_context();
    let (meta, mut reader) = state.service.get(&ctx, path).await?;

    if is_not_modified(headers, &meta) {
        return Ok(not_modified(&meta));
    }

    let size = reader
        .seek(SeekFrom::End(0))
        .await
        .map_err(StowryError::from)?;

    let (status, start, len) = match header_str(headers, header::RANGE).and_then(parse_range_header) {
        Some(range) => match resolve_range(&range, size) {
            Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
            None => return Err(ApiError::RangeNotSatisfiable { size: size as i64 }),
        },
        // Malformed range header -- ignore per HTTP spec, return full body.
        None => (StatusCode::OK, 0, size),
    };
    reader
        .seek(SeekFrom::Start(start))
        .await
        .map_err(StowryError::from)?;

    let body = Body::from_stream(ReaderStream::new(reader.take(len)));
    let mut response = (status, body).into_response();
    let hdrs = response.headers_mut();
    hdrs.extend(object_headers(&meta));
    hdrs.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if status == StatusCode::PARTIAL_CONTENT {
        let end = start + len - 1;
        if let Ok(v) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")) {
            hdrs.insert(header::CONTENT_RANGE, v);
        }
    }

    Ok(response)
}

/// `HEAD /{path}` -- Object metadata as headers.
#[utoipa::path(
    head,
    path = "/{path}",
    tag = "Object",
    operation_id = "HeadObject",
    params(
        ("path" = String, Path, description = "Object path"),
    ),
    responses(
        (status = 200, description = "Object exists"),
        (status = 304, description = "Not modified"),
        (status = 404, description = "Object not found")
    )
)]
async fn handle_head(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    head_object(&state, &path, &headers).await
}

async fn head_object(state: &AppState, path: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    check_read_path(path)?;

    let (ctx, _guard) = request_context();
    let meta = state.service.info(&ctx, path).await?;

    if is_not_modified(headers, &meta) {
        return Ok(not_modified(&meta));
    }

    let mut response = StatusCode::OK.into_response();
    let hdrs = response.headers_mut();
    hdrs.extend(object_headers(&meta));
    hdrs.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.file_size_bytes.max(0)),
    );
    Ok(response)
}

/// Stream `body` as an `AsyncRead`, failing once more than `limit` bytes
/// arrive (`limit == 0` means unlimited).  `exceeded` records why it failed.
fn body_reader(body: Body, limit: u64, exceeded: Arc<AtomicBool>) -> impl AsyncRead + Send + Unpin {
    let mut seen: u64 = 0;
    let stream = body
        .into_data_stream()
        .map_err(std::io::Error::other)
        .and_then(move |chunk| {
            seen += chunk.len() as u64;
            let res = if limit > 0 && seen > limit {
                exceeded.store(true, Ordering::SeqCst);
                Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "request body exceeds the upload limit",
                ))
            } else {
                Ok(chunk)
            };
            futures::future::ready(res)
        });
    StreamReader::new(Box::pin(stream))
}

/// `PUT /{path}` -- Create or overwrite an object.
#[utoipa::path(
    put,
    path = "/{path}",
    tag = "Object",
    operation_id = "PutObject",
    params(
        ("path" = String, Path, description = "Object path"),
    ),
    request_body(content = Vec<u8>, description = "Object content", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Object stored", body = MetaData),
        (status = 400, description = "Invalid path", body = ErrorResponse),
        (status = 412, description = "If-Match did not match", body = ErrorResponse),
        (status = 413, description = "Body exceeds the upload limit", body = ErrorResponse)
    )
)]
async fn handle_put(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    check_write_path(&path)?;

    let content_type = header_str(&headers, header::CONTENT_TYPE)
        .unwrap_or("application/octet-stream")
        .to_string();
    let (ctx, _guard) = request_context();

    if let Some(if_match) = header_str(&headers, header::IF_MATCH) {
        // A fallback hit (static/spa) is not the resource being replaced.
        let existing = match state.service.info(&ctx, &path).await {
            Ok(m) if m.path == path => m,
            Ok(_) => return Err(ApiError::PreconditionFailed),
            Err(e) if e.is_not_found() => return Err(ApiError::PreconditionFailed),
            Err(e) => return Err(e.into()),
        };
        if !etag_strong_match(if_match, &quoted_etag(&existing)) {
            return Err(ApiError::PreconditionFailed);
        }
    }

    let limit = state.config.server.max_upload_size;
    if limit > 0 {
        let declared = header_str(&headers, header::CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|n| n > limit) {
            return Err(ApiError::PayloadTooLarge);
        }
    }

    let exceeded = Arc::new(AtomicBool::new(false));
    let mut reader = body_reader(body, limit, exceeded.clone());
    let created = state
        .service
        .create(
            &ctx,
            CreateObject {
                path,
                content_type,
            },
            &mut reader,
        )
        .await;

    match created {
        Ok(meta) => {
            counter!(BYTES_RECEIVED_TOTAL).increment(meta.file_size_bytes.max(0) as u64);
            Ok((StatusCode::OK, Json(meta)).into_response())
        }
        Err(_) if exceeded.load(Ordering::SeqCst) => Err(ApiError::PayloadTooLarge),
        Err(e) => Err(e.into()),
    }
}

/// `DELETE /{path}` -- Soft-delete an object.
#[utoipa::path(
    delete,
    path = "/{path}",
    tag = "Object",
    operation_id = "DeleteObject",
    params(
        ("path" = String, Path, description = "Object path"),
    ),
    responses(
        (status = 204, description = "Object deleted"),
        (status = 404, description = "Object not found", body = ErrorResponse)
    )
)]
async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    check_write_path(&path)?;

    let (ctx, _guard) = request_context();
    state.service.delete(&ctx, &path).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Tests --------------------------------------------------------------------
