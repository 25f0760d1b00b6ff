//! `/v3/recordings/*`: recording inventory and segment deletion.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Local};

use relaymux_core::Conf;
use relaymux_record::index::{self, Recording, SegmentEntry};

use crate::error::{ApiError, ApiResult};
use crate::pagination::{paginate, PageEnvelope, PageParams};
use crate::ApiState;

fn recording_of(conf: &Conf, name: &str) -> Option<Recording> {
    let path_conf = resolve(conf, name)?;
    let segments = index::segments_of_path(&path_conf, name).ok()?;
    Some(Recording {
        name: name.to_string(),
        segments: segments
            .into_iter()
            .map(|s| SegmentEntry { start: s.start })
            .collect(),
    })
}

/// Literal match first, regex templates next; recordings never use the
/// catch-all.
fn resolve(conf: &Conf, name: &str) -> Option<relaymux_core::PathConf> {
    if let Some(found) = conf.paths.get(name) {
        return Some(found.clone());
    }
    for (conf_name, path_conf) in &conf.paths {
        if let Some(expr) = conf_name.strip_prefix('~') {
            if regex::Regex::new(expr).is_ok_and(|re| re.is_match(name)) {
                return Some(path_conf.clone());
            }
        }
    }
    None
}

pub async fn list(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<PageEnvelope<Recording>>> {
    let params = PageParams::from_query(
        query.get("itemsPerPage").map(String::as_str),
        query.get("page").map(String::as_str),
    )?;
    let conf = state.conf.lock().await.clone();

    let items = tokio::task::spawn_blocking(move || {
        index::find_all_paths_with_segments(&conf)
            .into_iter()
            .filter_map(|name| recording_of(&conf, &name))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(paginate(items, params)))
}

pub async fn get_one(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Recording>> {
    if name.is_empty() {
        return Err(ApiError::bad_request("path name can not be empty"));
    }
    let conf = state.conf.lock().await.clone();

    let recording = tokio::task::spawn_blocking(move || recording_of(&conf, &name))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    recording
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no recording found"))
}

/// `DELETE /v3/recordings/deletesegment?path=<name>&start=<RFC 3339>`.
pub async fn delete_segment(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<()> {
    let name = query
        .get("path")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing 'path' parameter"))?
        .clone();
    let raw_start = query
        .get("start")
        .ok_or_else(|| ApiError::bad_request("missing 'start' parameter"))?;
    let start: DateTime<Local> = DateTime::parse_from_rfc3339(raw_start)
        .map_err(|e| ApiError::bad_request(format!("invalid 'start' parameter: {e}")))?
        .with_timezone(&Local);

    let conf: Arc<Conf> = state.conf.lock().await.clone();
    let path_conf = resolve(&conf, &name)
        .ok_or_else(|| ApiError::not_found(format!("path '{name}' is not configured")))?;

    tokio::task::spawn_blocking(move || index::delete_segment(&path_conf, &name, start))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(())
}
