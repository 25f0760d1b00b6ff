//! `/v3/paths/*`: runtime path inventory.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;

use relaymux_stream::path::PathInfo;

use crate::error::{ApiError, ApiResult};
use crate::pagination::{paginate, PageEnvelope, PageParams};
use crate::ApiState;

pub async fn list(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<PageEnvelope<PathInfo>>> {
    let params = PageParams::from_query(
        query.get("itemsPerPage").map(String::as_str),
        query.get("page").map(String::as_str),
    )?;
    let items = state.path_manager.api_paths_list().await;
    Ok(Json(paginate(items, params)))
}

pub async fn get_one(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PathInfo>> {
    if name.is_empty() {
        return Err(ApiError::bad_request("path name can not be empty"));
    }
    let info = state.path_manager.api_paths_get(&name).await?;
    Ok(Json(info))
}
