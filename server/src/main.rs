//! Chatter Server - Main entry point.
//!
//! This binary starts the Chatter hub server with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - The hub and history archiver as background tasks
//!
//! # Configuration
//!
//! See [`chatter_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (guests, no tokens)
//! CHATTER_UNSAFE_NO_AUTH=true cargo run --bin chatter-server
//!
//! # Production mode
//! CHATTER_IDENTITY_PUBLIC_KEY="base64pubkey" \
//! PORT=5050 \
//! cargo run --release --bin chatter-server
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use chatter_server::config::Config;
use chatter_server::error::ServerError;
use chatter_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled):");
            eprintln!("  CHATTER_IDENTITY_PUBLIC_KEY - Base64 Ed25519 key for identity tokens");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                        - HTTP server port (default: 5050)");
            eprintln!("  CHATTER_HOST                - Bind address (default: 0.0.0.0)");
            eprintln!("  CHATTER_QUEUE_CAPACITY      - Outbound queue per connection (default: 16)");
            eprintln!("  CHATTER_HUB_CAPACITY        - Hub request channel (default: 64)");
            eprintln!("  CHATTER_HISTORY_CAPACITY    - Messages kept, 0 disables (default: 500)");
            eprintln!("  CHATTER_AVATAR_DIR          - Avatar images (default: ./images/128x128)");
            eprintln!("  CHATTER_CORS_ORIGINS        - Allowed origins, comma-separated");
            eprintln!("  RUST_LOG                    - Log level filter (default: info)");
            eprintln!("  CHATTER_UNSAFE_NO_AUTH      - Accept guests (dev only, set to 'true')");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "Server error");
            ExitCode::from(1)
        }
    }
}

/// Starts the background tasks, serves until a shutdown signal, then stops
/// the background tasks.
async fn run(config: Config) -> Result<(), ServerError> {
    let auth_mode = if config.unsafe_no_auth {
        "guests (UNSAFE)"
    } else {
        "identity tokens"
    };
    info!(
        port = config.port,
        auth_mode = auth_mode,
        queue_capacity = config.queue_capacity,
        history_capacity = config.history_capacity,
        "Chatter server starting"
    );

    let bind_addr = config.socket_addr();
    let (state, tasks) = AppState::new(config)?;

    // Fails fast if the hub did not come up.
    state.hub.connection_count().await?;
    info!("Hub ready");

    let app = create_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|err| ServerError::bind(bind_addr.to_string(), err))?;
    info!(address = %bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::serve)?;

    info!("Server shutting down gracefully");
    tasks.shutdown().await;
    Ok(())
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output for production use with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - Target and level information
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
