//! Playback endpoints: available ranges and timed reads over recordings.
//!
//! Served on their own address, authenticated with the `playback` action.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Local};
use uuid::Uuid;

use relaymux_core::auth::{AuthAction, AuthRequest, Credentials, Protocol};
use relaymux_core::RecordFormat;
use relaymux_record::playback::{self, TimeSpan};

use crate::error::{ApiError, ApiResult};
use crate::{request_credentials, request_ip, ApiState};

/// Credentials for playback may arrive as query parameters as well, for
/// clients that can not set headers.
fn playback_credentials(req: &Request) -> Option<Credentials> {
    if let Some(creds) = request_credentials(req) {
        return Some(creds);
    }
    let query = req.uri().query()?;
    let mut user = String::new();
    let mut pass = String::new();
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=')?;
        match k {
            "user" => user = v.to_string(),
            "pass" => pass = v.to_string(),
            _ => {}
        }
    }
    if user.is_empty() && pass.is_empty() {
        return None;
    }
    Some(Credentials {
        user,
        pass,
        token: String::new(),
    })
}

pub(crate) async fn playback_auth(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|p| p.strip_prefix("path=").map(String::from))
        })
        .unwrap_or_default();

    let auth_req = AuthRequest {
        action: AuthAction::Playback,
        path,
        protocol: Protocol::Api,
        query: req.uri().query().unwrap_or_default().to_string(),
        credentials: playback_credentials(&req),
        ip: request_ip(&req),
        id: Uuid::new_v4(),
        custom_verify: None,
    };

    let auth = state.path_manager.auth_manager();
    match auth.authenticate(&auth_req).await {
        Ok(_) => next.run(req).await,
        Err(err) => {
            if err.ask_credentials {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Basic realm=\"relaymux\"")],
                    Json(serde_json::json!({"error": err.message})),
                )
                    .into_response();
            }
            let pause = state.conf.lock().await.auth_pause_after_error.as_duration();
            tokio::time::sleep(pause).await;
            ApiError::unauthorized(err.message).into_response()
        }
    }
}

fn required<'a>(query: &'a HashMap<String, String>, key: &str) -> ApiResult<&'a str> {
    query
        .get(key)
        .filter(|v| !v.is_empty())
        .map(String::as_str)
        .ok_or_else(|| ApiError::bad_request(format!("missing '{key}' parameter")))
}

fn parse_start(raw: &str) -> ApiResult<DateTime<Local>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|e| ApiError::bad_request(format!("invalid 'start' parameter: {e}")))
}

/// Seconds (possibly fractional) or a humantime string.
fn parse_duration(raw: &str) -> ApiResult<Duration> {
    if let Ok(secs) = raw.parse::<f64>() {
        if secs <= 0.0 || !secs.is_finite() {
            return Err(ApiError::bad_request("duration must be positive"));
        }
        return Ok(Duration::from_secs_f64(secs));
    }
    humantime::parse_duration(raw)
        .map_err(|e| ApiError::bad_request(format!("invalid 'duration' parameter: {e}")))
}

/// `GET /list?path=<name>`: available time ranges.
pub async fn list(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<TimeSpan>>> {
    let name = required(&query, "path")?.to_string();
    let conf = state.conf.lock().await.clone();
    let path_conf = state
        .path_manager
        .resolve_conf(&name)
        .or_else(|| conf.paths.get(&name).cloned())
        .ok_or_else(|| ApiError::not_found(format!("path '{name}' is not configured")))?;

    let spans = tokio::task::spawn_blocking(move || playback::list_spans(&path_conf, &name))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(spans))
}

/// `GET /get?path=<name>&start=<RFC 3339>&duration=<seconds>`: one
/// concatenated byte stream over the requested window.
pub async fn get_window(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let name = required(&query, "path")?.to_string();
    let start = parse_start(required(&query, "start")?)?;
    let duration = parse_duration(required(&query, "duration")?)?;

    let path_conf = state
        .path_manager
        .resolve_conf(&name)
        .ok_or_else(|| ApiError::not_found(format!("path '{name}' is not configured")))?;
    let content_type = match path_conf.record_format {
        RecordFormat::Fmp4 => "video/mp4",
        RecordFormat::Mpegts => "video/MP2T",
    };

    let bytes = tokio::task::spawn_blocking(move || {
        playback::stitch(&path_conf, &name, start, duration)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response())
}
