//! Main Entrypoint for the Realtime Gateway Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Connecting to the MCP tool server, when one is configured.
//! 3. Resolving upstream authentication.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use rmcp::{
    ServiceExt,
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use voicerag_api::{auth::AuthProvider, config::Config, router::create_router, state::AppState};
use voicerag_core::{ToolRegistry, mcp};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler; shutdown signal disabled.");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Starts the configured MCP server as a child process and registers its tools.
async fn load_tools(config: &Config) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    let Some((program, args)) = config
        .mcp_server_command
        .as_deref()
        .and_then(|command| command.split_first())
    else {
        info!("No MCP server configured; the model will have no tools.");
        return Ok(registry);
    };

    let transport = TokioChildProcess::new(tokio::process::Command::new(program).configure(|cmd| {
        cmd.args(args).stderr(std::process::Stdio::inherit());
    }))
    .with_context(|| format!("Failed to start MCP server '{}'", program))?;
    let client = ().serve(transport).await.context("Failed to initialize MCP client")?;

    let count = mcp::register_tools(Arc::new(client), &config.client_visible_tools, &mut registry)
        .await?;
    info!(count, program = %program, "Registered MCP tools.");
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let tools = load_tools(&config).await?;
    info!(tools = ?tools.names().collect::<Vec<_>>(), "Tool registry ready.");

    let auth = AuthProvider::from_credential(&config.credential)
        .await
        .context("Failed to set up upstream authentication")?;

    let app_state = Arc::new(AppState {
        endpoint: config.endpoint.clone(),
        server_config: Arc::new(config.server_config()),
        tools: Arc::new(tools),
        auth: Arc::new(auth),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state, &config.relay_path).layer(cors);

    // --- 5. Start Server ---
    info!(
        backend = ?config.backend,
        deployment = %config.deployment,
        relay_path = %config.relay_path,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
