//! HTTP listener lifecycle.

use std::net::SocketAddr;

use axum::Router;
use tokio_util::sync::CancellationToken;

/// Bind and serve a router until the token is cancelled. Returns once the
/// listener has shut down.
pub async fn serve(addr: &str, router: Router, token: CancellationToken) -> anyhow::Result<()> {
    // ":9997" means every interface
    let addr = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listener opened on {}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await?;

    tracing::info!("listener on {} closed", addr);
    Ok(())
}
