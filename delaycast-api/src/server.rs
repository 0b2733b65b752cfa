//! Server bootstrap
//!
//! Wires the configured platform credentials, room service client and relay
//! registry behind the admin router, then serves until SIGINT/SIGTERM.

use anyhow::Context;
use delaycast_relay::{AccessTokenIssuer, RelayContext, RelayRegistry, RoomServiceClient, SessionConnector};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::http::{create_router, AppState};

/// Build the relay registry from configuration
///
/// `connector` is the real-time SDK binding used to join rooms as a relay.
pub fn build_registry(config: &Config, connector: Arc<dyn SessionConnector>) -> anyhow::Result<Arc<RelayRegistry>> {
    let relay_config = Arc::new(config.relay.clone());

    let issuer = Arc::new(
        AccessTokenIssuer::new(
            config.platform.api_key.clone(),
            &config.platform.api_secret,
            relay_config.credential_ttl_secs,
        )
        .context("Invalid platform credentials")?,
    );

    let control = Arc::new(
        RoomServiceClient::new(
            config.platform.url.clone(),
            issuer.clone(),
            relay_config.identity.clone(),
            config.platform.request_timeout(),
        )
        .context("Failed to create room service client")?,
    );

    Ok(RelayRegistry::new(RelayContext {
        config: relay_config,
        issuer,
        connector,
        control,
    }))
}

/// Serve the admin API until a shutdown signal arrives
pub async fn serve(config: Config, connector: Arc<dyn SessionConnector>) -> anyhow::Result<()> {
    let registry = build_registry(&config, connector)?;
    let listener = TcpListener::bind(config.http_address())
        .await
        .with_context(|| format!("Failed to bind HTTP address {}", config.http_address()))?;

    serve_with_listener(listener, registry, config.server.admin_token, shutdown_signal()).await
}

/// Serve on an already bound listener; relays are stopped once `shutdown` resolves
pub async fn serve_with_listener(
    listener: TcpListener,
    registry: Arc<RelayRegistry>,
    admin_token: Option<String>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let router = create_router(AppState::new(registry.clone(), admin_token));

    info!(
        address = %addr,
        max_delay_ms = registry.config().max_delay_ms,
        "HTTP server listening"
    );

    let result = axum::serve(listener, router).with_graceful_shutdown(shutdown).await;
    if let Err(e) = &result {
        error!("HTTP server error: {}", e);
    }

    registry.shutdown().await;
    info!("HTTP server shut down gracefully");

    result.context("HTTP server failed")
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delaycast_relay::test_helpers::{stage_roster, test_context, MockConnector};
    use delaycast_relay::RelayConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_build_registry_rejects_empty_secret() {
        let config = Config::default();
        let connector: Arc<dyn SessionConnector> = MockConnector::new();
        assert!(build_registry(&config, connector).is_err());
    }

    #[tokio::test]
    async fn test_build_registry_from_config() {
        let mut config = Config::default();
        config.platform.api_key = "APIkey".to_string();
        config.platform.api_secret = "a-secret-long-enough-for-hs256".to_string();
        config.relay.max_delay_ms = 3000;

        let connector: Arc<dyn SessionConnector> = MockConnector::new();
        let registry = build_registry(&config, connector).unwrap();
        assert_eq!(registry.config().max_delay_ms, 3000);
        assert_eq!(registry.relay_count(), 0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_stops_relays_on_shutdown() {
        let (ctx, control, connector) = test_context(RelayConfig::default());
        stage_roster(&control);
        let registry = RelayRegistry::new(ctx);
        registry
            .set_delay("stage".into(), "alice".into(), 500, false)
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_with_listener(listener, registry.clone(), None, async move {
            let _ = stop_rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("OK"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(registry.relay_count(), 0);
        assert!(connector.session("relay-alice").is_some_and(|s| s.is_closed()));
    }
}
