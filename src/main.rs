use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::middleware::from_fn;
use clap::Parser;
use std::net::SocketAddr;
use tileadder::{cli, config, db, middleware, openapi, routes, state, static_assets};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind tileadder listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind tileadder listener on {addr}")),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::AdminConfig::from_env(args.static_root)?;
    tracing::info!(
        auth_type = ?config.auth_type,
        key_pair_type = %config.key_pair_type,
        map_directory = %config.map_directory.display(),
        extensions = ?config.extensions,
        "loaded configuration"
    );

    let pool = db::connect_lazy(&config.database_url)?;
    if args.migrate {
        db::migrate(&pool).await?;
        tracing::info!("database migrations applied");
    }

    let cors = CorsLayer::new()
        .allow_origin([HeaderValue::from_str(&config.app_base_url)
            .context("TILEADDER_APP_BASE_URL is not a valid origin")?])
        .allow_methods(Any)
        .allow_headers(Any);

    let state = state::AppState::new(config.clone(), pool.clone(), reqwest::Client::new());
    let app = routes::router(state)
        .merge(static_assets::router(config.static_root.clone())?)
        .layer(cors)
        .layer(from_fn(middleware::log_requests));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "tileadder listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        if err.to_string().to_lowercase().contains("operation not permitted") {
            return Ok(());
        }
        let message = err.to_string().to_lowercase();

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
