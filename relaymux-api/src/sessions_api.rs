//! `/v3/{rtspconns,rtspsessions,rtmpconns,srtconns,webrtcsessions,hlsmuxers}/*`:
//! protocol session inventories and forced eviction.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use relaymux_stream::session::{SessionInfo, SessionKind};

use crate::error::{ApiError, ApiResult};
use crate::pagination::{paginate, PageEnvelope, PageParams};
use crate::ApiState;

async fn list_kind(
    state: &ApiState,
    kind: SessionKind,
    query: &HashMap<String, String>,
) -> ApiResult<Json<PageEnvelope<SessionInfo>>> {
    let params = PageParams::from_query(
        query.get("itemsPerPage").map(String::as_str),
        query.get("page").map(String::as_str),
    )?;
    let items = state.sessions.list(kind);
    Ok(Json(paginate(items, params)))
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid session id '{raw}'")))
}

fn get_kind(state: &ApiState, kind: SessionKind, raw_id: &str) -> ApiResult<Json<SessionInfo>> {
    let id = parse_id(raw_id)?;
    Ok(Json(state.sessions.get(kind, id)?))
}

fn kick_kind(state: &ApiState, kind: SessionKind, raw_id: &str) -> ApiResult<()> {
    let id = parse_id(raw_id)?;
    state.sessions.kick(kind, id)?;
    Ok(())
}

macro_rules! session_endpoints {
    ($list:ident, $get:ident, $kind:expr) => {
        pub async fn $list(
            State(state): State<ApiState>,
            Query(query): Query<HashMap<String, String>>,
        ) -> ApiResult<Json<PageEnvelope<SessionInfo>>> {
            list_kind(&state, $kind, &query).await
        }

        pub async fn $get(
            State(state): State<ApiState>,
            Path(id): Path<String>,
        ) -> ApiResult<Json<SessionInfo>> {
            get_kind(&state, $kind, &id)
        }
    };
    ($list:ident, $get:ident, $kick:ident, $kind:expr) => {
        session_endpoints!($list, $get, $kind);

        pub async fn $kick(
            State(state): State<ApiState>,
            Path(id): Path<String>,
        ) -> ApiResult<()> {
            kick_kind(&state, $kind, &id)
        }
    };
}

session_endpoints!(rtsp_conns_list, rtsp_conns_get, SessionKind::RtspConn);
session_endpoints!(
    rtsp_sessions_list,
    rtsp_sessions_get,
    rtsp_sessions_kick,
    SessionKind::RtspSession
);
session_endpoints!(
    rtmp_conns_list,
    rtmp_conns_get,
    rtmp_conns_kick,
    SessionKind::RtmpConn
);
session_endpoints!(
    srt_conns_list,
    srt_conns_get,
    srt_conns_kick,
    SessionKind::SrtConn
);
session_endpoints!(
    webrtc_sessions_list,
    webrtc_sessions_get,
    webrtc_sessions_kick,
    SessionKind::WebrtcSession
);
session_endpoints!(hls_muxers_list, hls_muxers_get, SessionKind::HlsMuxer);
