//! Component assembly and lifecycle.
//!
//! Teardown is parent-before-child with explicit joins: the core cancels,
//! listeners drain, the path manager terminates every path, each stream
//! closes its reader queues, readers observe end-of-stream and exit.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relaymux_api::{playback_router, router, ApiState};
use relaymux_core::Conf;
use relaymux_record::{RecordCleaner, Recorder};
use relaymux_stream::manager::PathManager;
use relaymux_stream::session::SessionRegistry;

struct Listener {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

fn start_listener(addr: String, router: axum::Router) -> Listener {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let join = tokio::spawn(async move {
        if let Err(e) = relaymux_api::server::serve(&addr, router, task_token).await {
            tracing::error!("listener error: {e}");
        }
    });
    Listener { token, join }
}

impl Listener {
    async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

pub async fn run(conf: Arc<Conf>) -> anyhow::Result<()> {
    let sessions = Arc::new(SessionRegistry::new());
    let path_manager = PathManager::new(conf.clone(), None, Some(Arc::new(Recorder)))?;

    let (config_tx, mut config_rx) = mpsc::unbounded_channel::<Arc<Conf>>();
    let api_state = ApiState::new(
        conf.clone(),
        path_manager.clone(),
        sessions.clone(),
        config_tx,
    );

    let mut cleaner = RecordCleaner::start(conf.clone());
    let mut api_listener = if conf.api {
        Some(start_listener(
            conf.api_address.clone(),
            router(api_state.clone()),
        ))
    } else {
        None
    };
    let mut playback_listener = if conf.playback {
        Some(start_listener(
            conf.playback_address.clone(),
            playback_router(api_state.clone()),
        ))
    } else {
        None
    };

    tracing::info!("relaymux started");

    let mut current = conf;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            new_conf = config_rx.recv() => {
                let Some(new_conf) = new_conf else { break };
                tracing::info!("reloading configuration");

                path_manager.reload_path_confs(new_conf.clone()).await?;

                cleaner.close();
                cleaner = RecordCleaner::start(new_conf.clone());

                let api_changed = new_conf.api != current.api
                    || new_conf.api_address != current.api_address;
                if api_changed {
                    if let Some(listener) = api_listener.take() {
                        listener.close().await;
                    }
                    if new_conf.api {
                        api_listener = Some(start_listener(
                            new_conf.api_address.clone(),
                            router(api_state.clone()),
                        ));
                    }
                }

                let playback_changed = new_conf.playback != current.playback
                    || new_conf.playback_address != current.playback_address;
                if playback_changed {
                    if let Some(listener) = playback_listener.take() {
                        listener.close().await;
                    }
                    if new_conf.playback {
                        playback_listener = Some(start_listener(
                            new_conf.playback_address.clone(),
                            playback_router(api_state.clone()),
                        ));
                    }
                }

                current = new_conf;
            }
        }
    }

    if let Some(listener) = api_listener.take() {
        listener.close().await;
    }
    if let Some(listener) = playback_listener.take() {
        listener.close().await;
    }
    cleaner.close();
    path_manager.close().await;

    tracing::info!("relaymux stopped");
    Ok(())
}
