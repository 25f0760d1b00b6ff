//! End-to-end tests of the admin surface, driven through the router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tower::ServiceExt;

use relaymux_api::{router, ApiState};
use relaymux_core::Conf;
use relaymux_stream::manager::PathManager;
use relaymux_stream::session::{SessionKind, SessionRegistry};

struct Harness {
    router: Router,
    state: ApiState,
    _config_rx: mpsc::UnboundedReceiver<Arc<Conf>>,
}

fn harness_with(doc: serde_json::Value) -> Harness {
    let conf = Conf::from_json_value(doc).expect("conf");
    conf.validate().expect("valid conf");
    let conf = Arc::new(conf);

    let path_manager = PathManager::new(conf.clone(), None, None).expect("manager");
    let sessions = Arc::new(SessionRegistry::new());
    let (config_tx, config_rx) = mpsc::unbounded_channel();

    let state = ApiState::new(conf, path_manager, sessions, config_tx);
    Harness {
        router: router(state.clone()),
        state,
        _config_rx: config_rx,
    }
}

fn harness() -> Harness {
    harness_with(serde_json::json!({}))
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&v).expect("body"))
        }
        None => Body::empty(),
    };
    let res = router
        .clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response");

    let status = res.status();
    let bytes = res.into_body().collect().await.expect("collect").to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_global_patch_round_trip() {
    let h = harness();

    let (status, before) = send(&h.router, Method::GET, "/v3/config/global/get", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before["api"], true);
    assert_eq!(before["rtmp"], true);
    // per-path data is not part of the global document
    assert!(before.get("paths").is_none());

    let (status, _) = send(
        &h.router,
        Method::PATCH,
        "/v3/config/global/patch",
        Some(serde_json::json!({
            "rtmp": false,
            "readTimeout": "7s",
            "protocols": ["tcp"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, after) = send(&h.router, Method::GET, "/v3/config/global/get", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["rtmp"], false);
    assert_eq!(after["readTimeout"], "7s");
    assert_eq!(after["protocols"], serde_json::json!(["tcp"]));
    // untouched fields survive
    assert_eq!(after["api"], true);
}

#[tokio::test]
async fn test_global_patch_unknown_field() {
    let h = harness();

    let (status, body) = send(
        &h.router,
        Method::PATCH,
        "/v3/config/global/patch",
        Some(serde_json::json!({"test": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        serde_json::json!({"error": "json: unknown field \"test\""})
    );
}

#[tokio::test]
async fn test_global_patch_is_idempotent() {
    let h = harness();
    let patch = serde_json::json!({"rtmp": false, "readTimeout": "7s"});

    for _ in 0..2 {
        let (status, _) = send(
            &h.router,
            Method::PATCH,
            "/v3/config/global/patch",
            Some(patch.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (_, after) = send(&h.router, Method::GET, "/v3/config/global/get", None).await;
    assert_eq!(after["rtmp"], false);
    assert_eq!(after["readTimeout"], "7s");
}

#[tokio::test]
async fn test_path_add_then_replace_resets_defaults() {
    let h = harness();

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/v3/config/paths/add/my/path",
        Some(serde_json::json!({
            "source": "rtsp://127.0.0.1:9999/mypath",
            "sourceOnDemand": true,
            "rpiCameraVFlip": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &h.router,
        Method::GET,
        "/v3/config/paths/get/my/path",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "my/path");
    assert_eq!(body["source"], "rtsp://127.0.0.1:9999/mypath");
    assert_eq!(body["sourceOnDemand"], true);
    assert_eq!(body["rpiCameraVFlip"], true);

    // adding the same name twice is an error
    let (status, _) = send(
        &h.router,
        Method::POST,
        "/v3/config/paths/add/my/path",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // replace resets non-submitted fields to defaults
    let (status, _) = send(
        &h.router,
        Method::POST,
        "/v3/config/paths/replace/my/path",
        Some(serde_json::json!({
            "source": "rtsp://127.0.0.1:9998/mypath",
            "sourceOnDemand": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(
        &h.router,
        Method::GET,
        "/v3/config/paths/get/my/path",
        None,
    )
    .await;
    assert_eq!(body["source"], "rtsp://127.0.0.1:9998/mypath");
    assert_eq!(body["sourceOnDemand"], true);
    assert_eq!(body["rpiCameraVFlip"], false);
}

#[tokio::test]
async fn test_replace_missing_name_creates_it() {
    let h = harness();

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/v3/config/paths/replace/fresh",
        Some(serde_json::json!({"maxReaders": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&h.router, Method::GET, "/v3/config/paths/get/fresh", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["maxReaders"], 5);
}

#[tokio::test]
async fn test_path_patch_and_delete() {
    let h = harness();

    let (status, _) = send(
        &h.router,
        Method::PATCH,
        "/v3/config/paths/patch/ghost",
        Some(serde_json::json!({"maxReaders": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(
        &h.router,
        Method::POST,
        "/v3/config/paths/add/cam1",
        Some(serde_json::json!({"maxReaders": 1})),
    )
    .await;
    let (status, _) = send(
        &h.router,
        Method::PATCH,
        "/v3/config/paths/patch/cam1",
        Some(serde_json::json!({"maxReaders": 9})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&h.router, Method::GET, "/v3/config/paths/get/cam1", None).await;
    assert_eq!(body["maxReaders"], 9);
    // patch keeps fields the patch did not mention
    assert_eq!(body["source"], "publisher");

    let (status, _) = send(
        &h.router,
        Method::DELETE,
        "/v3/config/paths/delete/cam1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&h.router, Method::GET, "/v3/config/paths/get/cam1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &h.router,
        Method::DELETE,
        "/v3/config/paths/delete/cam1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_paths_list_pagination() {
    let h = harness();
    for i in 0..5 {
        send(
            &h.router,
            Method::POST,
            &format!("/v3/config/paths/add/cam{i}"),
            Some(serde_json::json!({})),
        )
        .await;
    }

    let (status, body) = send(
        &h.router,
        Method::GET,
        "/v3/config/paths/list?itemsPerPage=2&page=1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["itemCount"], 5);
    assert_eq!(body["pageCount"], 3);
    assert_eq!(body["items"].as_array().expect("items").len(), 2);
    assert_eq!(body["items"][0]["name"], "cam2");

    // page past the end: correct counts, empty items
    let (_, body) = send(
        &h.router,
        Method::GET,
        "/v3/config/paths/list?itemsPerPage=2&page=9",
        None,
    )
    .await;
    assert_eq!(body["itemCount"], 5);
    assert!(body["items"].as_array().expect("items").is_empty());

    // invalid pagination parameters
    for uri in [
        "/v3/config/paths/list?itemsPerPage=0",
        "/v3/config/paths/list?itemsPerPage=-3",
        "/v3/config/paths/list?itemsPerPage=1.5",
        "/v3/config/paths/list?page=-1",
    ] {
        let (status, _) = send(&h.router, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn test_runtime_paths_inventory() {
    let h = harness_with(serde_json::json!({"paths": {"cam1": {}}}));

    let (status, body) = send(&h.router, Method::GET, "/v3/paths/list", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["itemCount"], 1);
    assert_eq!(body["items"][0]["name"], "cam1");
    assert_eq!(body["items"][0]["ready"], false);

    let (status, body) = send(&h.router, Method::GET, "/v3/paths/get/cam1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "cam1");

    let (status, _) = send(&h.router, Method::GET, "/v3/paths/get/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sessions_inventory_and_kick() {
    let h = harness();
    let id = uuid::Uuid::new_v4();
    let token = h
        .state
        .sessions
        .register(SessionKind::RtmpConn, id, "10.0.0.9:5000".to_string());

    let (status, body) = send(&h.router, Method::GET, "/v3/rtmpconns/list", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["itemCount"], 1);

    let (status, body) = send(
        &h.router,
        Method::GET,
        &format!("/v3/rtmpconns/get/{id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remoteAddr"], "10.0.0.9:5000");

    // wrong inventory: not found
    let (status, _) = send(
        &h.router,
        Method::GET,
        &format!("/v3/srtconns/get/{id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &h.router,
        Method::POST,
        &format!("/v3/rtmpconns/kick/{id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(token.is_cancelled());

    let (status, _) = send(
        &h.router,
        Method::GET,
        "/v3/rtmpconns/get/not-a-uuid",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_recordings_enumeration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let record_path = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.path().display());
    let h = harness_with(serde_json::json!({
        "pathDefaults": {"recordPath": record_path},
        "paths": {"p1": {}},
    }));

    let p1 = dir.path().join("p1");
    std::fs::create_dir_all(&p1).expect("mkdir");
    std::fs::write(p1.join("2009-11-07_11-22-00-900000.mp4"), b"x").expect("write");
    std::fs::write(p1.join("2008-11-07_11-22-00-500000.mp4"), b"x").expect("write");

    let (status, body) = send(&h.router, Method::GET, "/v3/recordings/get/p1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "p1");
    let segments = body["segments"].as_array().expect("segments");
    assert_eq!(segments.len(), 2);
    let start0 = segments[0]["start"].as_str().expect("start");
    let start1 = segments[1]["start"].as_str().expect("start");
    assert!(start0.starts_with("2008-11-07T11:22:00.5"), "{start0}");
    assert!(start1.starts_with("2009-11-07T11:22:00.9"), "{start1}");

    let (status, body) = send(&h.router, Method::GET, "/v3/recordings/list", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["itemCount"], 1);
    assert_eq!(body["items"][0]["name"], "p1");

    let (status, _) = send(&h.router, Method::GET, "/v3/recordings/get/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_segment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let record_path = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.path().display());
    let h = harness_with(serde_json::json!({
        "pathDefaults": {"recordPath": record_path},
        "paths": {"p1": {}},
    }));

    let file = dir.path().join("p1/2008-11-07_11-22-00-500000.mp4");
    std::fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
    std::fs::write(&file, b"x").expect("write");

    // RFC 3339 start matching the encoded filename, in local time
    let start = chrono::Local
        .with_ymd_and_hms(2008, 11, 7, 11, 22, 0)
        .single()
        .expect("time")
        + chrono::Duration::microseconds(500_000);
    let uri = format!(
        "/v3/recordings/deletesegment?path=p1&start={}",
        urlencode(&start.to_rfc3339()),
    );

    let (status, _) = send(&h.router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!file.exists());

    let (status, _) = send(&h.router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

use chrono::TimeZone;

fn urlencode(s: &str) -> String {
    s.replace('+', "%2B").replace(':', "%3A")
}

#[tokio::test]
async fn test_cors() {
    let h = harness();

    let res = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v3/config/global/get")
                .header("Access-Control-Request-Method", "GET")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        res.headers().get("Access-Control-Allow-Origin").map(|v| v.to_str().expect("hdr")),
        Some("*")
    );
    assert_eq!(
        res.headers()
            .get("Access-Control-Allow-Credentials")
            .map(|v| v.to_str().expect("hdr")),
        Some("true")
    );
    assert!(res.headers().contains_key("Access-Control-Allow-Methods"));

    // plain responses carry the CORS headers too
    let res = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v3/config/global/get")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(
        res.headers().get("Access-Control-Allow-Origin").map(|v| v.to_str().expect("hdr")),
        Some("*")
    );
}

#[tokio::test]
async fn test_auth_challenge_and_pacing() {
    use base64::Engine as _;

    // lock the API behind a user table and shorten the pacing delay
    let h = harness_with(serde_json::json!({
        "authPauseAfterError": "500ms",
        "authInternalUsers": [{
            "user": "admin",
            "pass": "secret",
            "permissions": [{"action": "api"}],
        }],
    }));

    // no credentials: challenge
    let res = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v3/config/global/get")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        res.headers().get(header::WWW_AUTHENTICATE).map(|v| v.to_str().expect("hdr")),
        Some("Basic realm=\"relaymux\"")
    );

    // wrong credentials: 401 no earlier than the pacing delay
    let basic = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
    let started = std::time::Instant::now();
    let res = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v3/config/global/get")
                .header(header::AUTHORIZATION, format!("Basic {basic}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(started.elapsed() >= std::time::Duration::from_millis(500));

    // correct credentials pass
    let basic = base64::engine::general_purpose::STANDARD.encode("admin:secret");
    let res = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v3/config/global/get")
                .header(header::AUTHORIZATION, format!("Basic {basic}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
}
