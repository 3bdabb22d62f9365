use axum::{
    Json,
    body::Body,
    extract::{Path, Query as QueryParams, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use reqwest::Url;
use std::sync::Arc;

use crate::data_models::Post;
use crate::error::{ProbeError, UpstreamError};
use crate::media::{self, MediaKind, MediaRequestError};
use crate::prober::PostCountProber;
use crate::query::Query;
use crate::session::{SearchStatePatch, SessionError, SessionSnapshot};
use crate::tags::group_by_category;
use crate::upstream::ListError;

use super::AppState;
use super::models::{
    CountParams, CountResponse, DownloadParams, ErrorBody, PostDetail, PostsParams, ProxyParams,
    TagsParams,
};

pub type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            details: None,
        }),
    )
}

fn api_error_with_details(
    status: StatusCode,
    message: impl Into<String>,
    details: impl ToString,
) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            details: Some(details.to_string()),
        }),
    )
}

fn parse_query(tags: Option<&str>, sort: Option<&str>, filter_ai: bool) -> Result<Query, ApiError> {
    let tags = tags.unwrap_or_default();
    if tags.trim().is_empty() && !filter_ai {
        return Err(api_error(StatusCode::BAD_REQUEST, "Tags parameter is required"));
    }
    Query::parse(tags, sort.unwrap_or_default(), filter_ai)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

fn upstream_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn list_error(err: ListError) -> ApiError {
    match err {
        ListError::Upstream(UpstreamError::Status(status)) => api_error(
            upstream_status(status),
            format!("API returned {status}"),
        ),
        ListError::Upstream(e) => {
            log::error!("error fetching from upstream API: {e}");
            api_error_with_details(
                StatusCode::BAD_GATEWAY,
                "Failed to fetch data from upstream API",
                e,
            )
        }
        ListError::InvalidBody => api_error(
            StatusCode::BAD_GATEWAY,
            "Invalid JSON response from upstream API",
        ),
    }
}

fn media_error(err: MediaRequestError, forbidden: &str, failed: &str) -> ApiError {
    match err {
        MediaRequestError::InvalidUrl(e) => {
            api_error_with_details(StatusCode::BAD_REQUEST, "Invalid URL", e)
        }
        MediaRequestError::Forbidden => api_error(StatusCode::FORBIDDEN, forbidden),
        MediaRequestError::Upstream(e) => {
            log::error!("media fetch failed: {e}");
            api_error_with_details(StatusCode::BAD_GATEWAY, failed, e)
        }
    }
}

fn session_error(err: SessionError) -> ApiError {
    match err {
        SessionError::NotFound(_) => api_error(StatusCode::NOT_FOUND, err.to_string()),
        SessionError::Query(e) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// `/api/...?k=v` with properly encoded parameters.
fn local_link(path: &str, pairs: &[(&str, &str)]) -> String {
    match Url::parse_with_params("http://localhost", pairs) {
        Ok(url) => format!("{path}?{}", url.query().unwrap_or_default()),
        Err(_) => path.to_string(),
    }
}

pub async fn list_posts_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<PostsParams>,
) -> Result<Json<Vec<Post>>, ApiError> {
    let query = parse_query(params.tags.as_deref(), params.sort.as_deref(), params.filter_ai)?;
    let page = state
        .booru
        .list_posts(
            &query.upstream_tags(),
            params.page,
            state.probe_settings.page_size,
        )
        .await
        .map_err(list_error)?;
    Ok(Json(page.posts))
}

pub async fn count_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<CountParams>,
) -> Result<Json<CountResponse>, ApiError> {
    let query = parse_query(params.tags.as_deref(), params.sort.as_deref(), params.filter_ai)?;
    let prober = PostCountProber::new(state.booru.clone(), state.probe_settings);
    match prober.probe(&query).await {
        Ok(result) => Ok(Json(result.into())),
        Err(e) => {
            log::error!("error counting posts: {e}");
            Err(api_error_with_details(
                StatusCode::BAD_GATEWAY,
                "Failed to count posts",
                e,
            ))
        }
    }
}

pub async fn post_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<PostDetail>, ApiError> {
    let post = state
        .booru
        .find_post(id)
        .await
        .map_err(list_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Post {id} not found")))?;

    let media_kind = media::media_kind(&post.file_url);
    let filename = media::download_filename(&post);
    // Videos are large; let the browser fetch them directly.
    let download_url = match media_kind {
        MediaKind::Video => post.file_url.clone(),
        MediaKind::Image | MediaKind::Gif => local_link(
            "/api/download",
            &[("url", post.file_url.as_str()), ("filename", filename.as_str())],
        ),
    };
    let proxy_url = local_link("/api/proxy", &[("url", post.file_url.as_str())]);

    Ok(Json(PostDetail {
        post_url: media::post_page_url(&state.site_url, post.id),
        media_kind,
        download_filename: filename,
        download_url,
        proxy_url,
        post,
    }))
}

pub async fn tags_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<TagsParams>,
) -> Result<Response, ApiError> {
    let raw = params.names.unwrap_or_default();
    let mut names: Vec<String> = Vec::new();
    for name in raw.split_whitespace() {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    if names.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Names parameter is required"));
    }

    let info = state.tags.describe(&names).await;
    if params.grouped {
        return Ok(Json(group_by_category(&raw, &info)).into_response());
    }
    Ok(Json(info).into_response())
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<ProxyParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(url) = params.url.filter(|u| !u.trim().is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "URL parameter is required"));
    };
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let upstream = state
        .media
        .proxy(&url, range)
        .await
        .map_err(|e| media_error(e, "Invalid domain", "Failed to proxy media"))?;

    let origin_status = upstream.status();
    if !origin_status.is_success() {
        return Err(api_error(origin_status, "Failed to proxy media"));
    }
    let status = if origin_status == StatusCode::PARTIAL_CONTENT {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "public, max-age=3600");
    for name in [header::CONTENT_LENGTH, header::ACCEPT_RANGES, header::CONTENT_RANGE] {
        if let Some(value) = upstream.headers().get(&name) {
            builder = builder.header(name, value.clone());
        }
    }

    let stream = upstream
        .bytes_stream()
        .inspect_err(move |e| log::warn!("media stream from {url} broke off: {e}"));
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| api_error_with_details(StatusCode::INTERNAL_SERVER_ERROR, "Failed to proxy media", e))
}

pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<DownloadParams>,
) -> Result<Response, ApiError> {
    let Some(url) = params.url.filter(|u| !u.trim().is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "URL parameter is required"));
    };

    let upstream = state
        .media
        .download(&url)
        .await
        .map_err(|e| media_error(e, "URL not allowed", "Failed to fetch file"))?;
    if !upstream.status().is_success() {
        return Err(api_error(upstream.status(), "Failed to fetch file"));
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let bytes = upstream.bytes().await.map_err(|e| {
        log::error!("download proxy error for {url}: {e}");
        api_error_with_details(StatusCode::BAD_GATEWAY, "Failed to fetch file", e)
    })?;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, bytes.len())
        .header(header::CACHE_CONTROL, "public, max-age=31536000");
    if let Some(filename) = params.filename.as_deref().filter(|f| !f.trim().is_empty()) {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", media::sanitize_filename(filename)),
        );
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| api_error_with_details(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", e))
}

pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<SessionSnapshot>) {
    (StatusCode::CREATED, Json(state.sessions.create()))
}

pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .sessions
        .get(&id)
        .map(Json)
        .ok_or_else(|| session_error(SessionError::NotFound(id)))
}

pub async fn update_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<SearchStatePatch>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .sessions
        .update(&id, patch)
        .map(Json)
        .map_err(session_error)
}

pub async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(session_error(SessionError::NotFound(id)))
    }
}

/// Counts the session's current query. A result that arrives after the
/// query has moved on is dropped and reported as a conflict.
pub async fn session_count_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    let (guard, query) = state.sessions.guard_probe(&id).map_err(session_error)?;
    let prober = PostCountProber::new(state.booru.clone(), state.probe_settings);

    match prober.probe_until_cancelled(&query, guard.ticket().token()).await {
        Ok(result) => {
            if guard.finish(Some(result.total_count)) {
                Ok(Json(result.into()))
            } else {
                Err(api_error(
                    StatusCode::CONFLICT,
                    "Count superseded by a newer query",
                ))
            }
        }
        Err(ProbeError::Cancelled) => Err(api_error(
            StatusCode::CONFLICT,
            "Count superseded by a newer query",
        )),
        Err(e) => {
            log::error!("error counting posts for session {}: {e}", guard.ticket().session_id());
            guard.finish(None);
            Err(api_error_with_details(
                StatusCode::BAD_GATEWAY,
                "Failed to count posts",
                e,
            ))
        }
    }
}
