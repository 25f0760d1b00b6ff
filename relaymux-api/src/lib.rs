//! Versioned admin HTTP surface (`/v3`) and the playback endpoints.
//!
//! Configuration mutations go through a copy-on-write pipeline: clone the
//! current snapshot, merge the partial JSON document, validate, swap under
//! the handler mutex, then hand the new snapshot to the parent for graceful
//! reconfiguration.

pub mod config_api;
pub mod error;
pub mod pagination;
pub mod paths_api;
pub mod playback_api;
pub mod recordings_api;
pub mod server;
pub mod sessions_api;

pub use error::{ApiError, ApiResult};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Router,
};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use relaymux_core::auth::{AuthAction, AuthRequest, Credentials, Protocol};
use relaymux_core::Conf;
use relaymux_stream::manager::PathManager;
use relaymux_stream::session::SessionRegistry;

/// Shared state of every API handler.
#[derive(Clone)]
pub struct ApiState {
    /// The authoritative configuration snapshot; mutations serialize here.
    pub conf: Arc<Mutex<Arc<Conf>>>,
    pub path_manager: PathManager,
    pub sessions: Arc<SessionRegistry>,
    /// New snapshots travel to the parent, which reconfigures components.
    pub config_tx: mpsc::UnboundedSender<Arc<Conf>>,
}

impl ApiState {
    #[must_use]
    pub fn new(
        conf: Arc<Conf>,
        path_manager: PathManager,
        sessions: Arc<SessionRegistry>,
        config_tx: mpsc::UnboundedSender<Arc<Conf>>,
    ) -> Self {
        Self {
            conf: Arc::new(Mutex::new(conf)),
            path_manager,
            sessions,
            config_tx,
        }
    }
}

/// Authenticated client address: the socket address when served, loopback in
/// direct-service tests.
fn request_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |ci| ci.0.ip())
}

/// Credentials from `Authorization: Basic` or `Authorization: Bearer`.
fn request_credentials(req: &Request) -> Option<Credentials> {
    use base64::Engine as _;

    let header = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    if let Some(token) = header.strip_prefix("Bearer ") {
        return Some(Credentials {
            user: String::new(),
            pass: String::new(),
            token: token.to_string(),
        });
    }
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some(Credentials {
        user: user.to_string(),
        pass: pass.to_string(),
        token: String::new(),
    })
}

async fn api_auth(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let auth_req = AuthRequest {
        action: AuthAction::Api,
        path: String::new(),
        protocol: Protocol::Api,
        query: req.uri().query().unwrap_or_default().to_string(),
        credentials: request_credentials(&req),
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
                    axum::Json(serde_json::json!({"error": err.message})),
                )
                    .into_response();
            }
            // brute-force pacing
            let pause = state.conf.lock().await.auth_pause_after_error.as_duration();
            tokio::time::sleep(pause).await;
            ApiError::unauthorized(err.message).into_response()
        }
    }
}

async fn cors(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let allow_origin = state.conf.lock().await.api_allow_origin.clone();
    let origin_value = HeaderValue::from_str(&allow_origin)
        .unwrap_or_else(|_| HeaderValue::from_static("*"));

    if req.method() == Method::OPTIONS
        && req
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    {
        return (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, origin_value),
                (
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                ),
                (
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("OPTIONS, GET, POST, PATCH, DELETE"),
                ),
                (
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static("Authorization, Content-Type"),
                ),
            ],
        )
            .into_response();
    }

    let mut res = next.run(req).await;
    res.headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin_value);
    res.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    res
}

/// Assemble the `/v3` admin router.
#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        // config
        .route("/v3/config/global/get", get(config_api::global_get))
        .route("/v3/config/global/patch", patch(config_api::global_patch))
        .route(
            "/v3/config/pathdefaults/get",
            get(config_api::path_defaults_get),
        )
        .route(
            "/v3/config/pathdefaults/patch",
            patch(config_api::path_defaults_patch),
        )
        .route("/v3/config/paths/list", get(config_api::paths_list))
        .route("/v3/config/paths/get/{*name}", get(config_api::paths_get))
        .route("/v3/config/paths/add/{*name}", post(config_api::paths_add))
        .route(
            "/v3/config/paths/patch/{*name}",
            patch(config_api::paths_patch),
        )
        .route(
            "/v3/config/paths/replace/{*name}",
            post(config_api::paths_replace),
        )
        .route(
            "/v3/config/paths/delete/{*name}",
            delete(config_api::paths_delete),
        )
        // runtime paths
        .route("/v3/paths/list", get(paths_api::list))
        .route("/v3/paths/get/{*name}", get(paths_api::get_one))
        // protocol inventories
        .route("/v3/rtspconns/list", get(sessions_api::rtsp_conns_list))
        .route("/v3/rtspconns/get/{id}", get(sessions_api::rtsp_conns_get))
        .route(
            "/v3/rtspsessions/list",
            get(sessions_api::rtsp_sessions_list),
        )
        .route(
            "/v3/rtspsessions/get/{id}",
            get(sessions_api::rtsp_sessions_get),
        )
        .route(
            "/v3/rtspsessions/kick/{id}",
            post(sessions_api::rtsp_sessions_kick),
        )
        .route("/v3/rtmpconns/list", get(sessions_api::rtmp_conns_list))
        .route("/v3/rtmpconns/get/{id}", get(sessions_api::rtmp_conns_get))
        .route(
            "/v3/rtmpconns/kick/{id}",
            post(sessions_api::rtmp_conns_kick),
        )
        .route("/v3/srtconns/list", get(sessions_api::srt_conns_list))
        .route("/v3/srtconns/get/{id}", get(sessions_api::srt_conns_get))
        .route("/v3/srtconns/kick/{id}", post(sessions_api::srt_conns_kick))
        .route(
            "/v3/webrtcsessions/list",
            get(sessions_api::webrtc_sessions_list),
        )
        .route(
            "/v3/webrtcsessions/get/{id}",
            get(sessions_api::webrtc_sessions_get),
        )
        .route(
            "/v3/webrtcsessions/kick/{id}",
            post(sessions_api::webrtc_sessions_kick),
        )
        .route("/v3/hlsmuxers/list", get(sessions_api::hls_muxers_list))
        .route("/v3/hlsmuxers/get/{id}", get(sessions_api::hls_muxers_get))
        // recordings
        .route("/v3/recordings/list", get(recordings_api::list))
        .route("/v3/recordings/get/{*name}", get(recordings_api::get_one))
        .route(
            "/v3/recordings/deletesegment",
            delete(recordings_api::delete_segment),
        )
        .layer(middleware::from_fn_with_state(state.clone(), api_auth))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

/// Assemble the playback router, served on its own address.
#[must_use]
pub fn playback_router(state: ApiState) -> Router {
    Router::new()
        .route("/list", get(playback_api::list))
        .route("/get", get(playback_api::get_window))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            playback_api::playback_auth,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}
