//! `/v3/config/*`: copy-on-write configuration mutations.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;

use relaymux_core::{Conf, PathConf};

use crate::error::{ApiError, ApiResult};
use crate::pagination::{paginate, PageEnvelope, PageParams};
use crate::ApiState;

fn page_params(query: &HashMap<String, String>) -> Result<PageParams, ApiError> {
    PageParams::from_query(
        query.get("itemsPerPage").map(String::as_str),
        query.get("page").map(String::as_str),
    )
}

fn check_name(name: &str) -> ApiResult<()> {
    if name.is_empty() {
        return Err(ApiError::bad_request("path name can not be empty"));
    }
    Ok(())
}

/// Clone-patch-validate-swap, then hand the new snapshot to the parent.
///
/// `detach_notify` schedules the notification on a separate task so the HTTP
/// response can complete even when the swap tears this listener down (e.g.
/// the API address itself changed).
async fn apply(
    state: &ApiState,
    build: impl FnOnce(&Conf) -> ApiResult<Conf>,
    detach_notify: bool,
) -> ApiResult<()> {
    let mut guard = state.conf.lock().await;
    let new_conf = build(&guard)?;
    new_conf
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let new_conf = Arc::new(new_conf);
    *guard = new_conf.clone();
    drop(guard);

    let tx = state.config_tx.clone();
    if detach_notify {
        tokio::spawn(async move {
            let _ = tx.send(new_conf);
        });
    } else {
        let _ = tx.send(new_conf);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// global
// ---------------------------------------------------------------------------

pub async fn global_get(State(state): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
    let conf = state.conf.lock().await.clone();
    let mut doc = serde_json::to_value(conf.as_ref())
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("paths");
        obj.remove("pathDefaults");
    }
    Ok(Json(doc))
}

pub async fn global_patch(
    State(state): State<ApiState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<()> {
    for key in ["paths", "pathDefaults"] {
        if body.get(key).is_some() {
            return Err(ApiError::bad_request(format!(
                "json: unknown field \"{key}\""
            )));
        }
    }
    apply(
        &state,
        |current| {
            current
                .patched_with(&body)
                .map_err(|e| ApiError::bad_request(e.to_string()))
        },
        true,
    )
    .await
}

// ---------------------------------------------------------------------------
// path defaults
// ---------------------------------------------------------------------------

pub async fn path_defaults_get(State(state): State<ApiState>) -> Json<PathConf> {
    let conf = state.conf.lock().await.clone();
    Json(conf.path_defaults.clone())
}

pub async fn path_defaults_patch(
    State(state): State<ApiState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<()> {
    apply(
        &state,
        |current| {
            let defaults = current
                .path_defaults
                .patched_with(&body)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            Ok(Conf {
                path_defaults: defaults,
                ..current.clone()
            })
        },
        false,
    )
    .await
}

// ---------------------------------------------------------------------------
// paths
// ---------------------------------------------------------------------------

pub async fn paths_list(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<PageEnvelope<PathConf>>> {
    let params = page_params(&query)?;
    let conf = state.conf.lock().await.clone();
    let items: Vec<PathConf> = conf.paths.values().cloned().collect();
    Ok(Json(paginate(items, params)))
}

pub async fn paths_get(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PathConf>> {
    check_name(&name)?;
    let conf = state.conf.lock().await.clone();
    conf.paths
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("path '{name}' not found")))
}

pub async fn paths_add(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<()> {
    check_name(&name)?;
    apply(
        &state,
        |current| {
            if current.paths.contains_key(&name) {
                return Err(ApiError::bad_request(format!(
                    "path '{name}' already exists"
                )));
            }
            let mut entry = current
                .path_defaults
                .patched_with(&body)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            entry.name.clone_from(&name);
            let mut new_conf = current.clone();
            new_conf.paths.insert(name.clone(), entry);
            Ok(new_conf)
        },
        false,
    )
    .await
}

pub async fn paths_patch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<()> {
    check_name(&name)?;
    apply(
        &state,
        |current| {
            let existing = current
                .paths
                .get(&name)
                .ok_or_else(|| ApiError::not_found(format!("path '{name}' not found")))?;
            let mut entry = existing
                .patched_with(&body)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            entry.name.clone_from(&name);
            let mut new_conf = current.clone();
            new_conf.paths.insert(name.clone(), entry);
            Ok(new_conf)
        },
        false,
    )
    .await
}

/// Replace is an upsert: non-submitted fields reset to the path defaults,
/// and a missing name is created.
pub async fn paths_replace(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<()> {
    check_name(&name)?;
    apply(
        &state,
        |current| {
            let mut entry = current
                .path_defaults
                .patched_with(&body)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            entry.name.clone_from(&name);
            let mut new_conf = current.clone();
            new_conf.paths.insert(name.clone(), entry);
            Ok(new_conf)
        },
        false,
    )
    .await
}

pub async fn paths_delete(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<()> {
    check_name(&name)?;
    apply(
        &state,
        |current| {
            if !current.paths.contains_key(&name) {
                return Err(ApiError::not_found(format!("path '{name}' not found")));
            }
            let mut new_conf = current.clone();
            new_conf.paths.shift_remove(&name);
            Ok(new_conf)
        },
        false,
    )
    .await
}
