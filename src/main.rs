use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use fgateway::{
    DashboardRenderer, FileSystemAdapter, GatewayService, HttpClient, HttpClientAdapter,
    HttpHandler,
    adapters::build_router,
    config::{EnvironmentConfig, ServerConfigValidator, load_config, loader::load_config_unchecked},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};

/// Starter configuration written by `fgateway init`.
const DEFAULT_CONFIG: &str = include_str!("../gateway.config.json");

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file (JSON, YAML or TOML)
    #[clap(short, long, global = true, default_value = "gateway.config.json")]
    config: String,

    /// Environment section of the configuration file to use
    #[clap(short, long, global = true, default_value = "development")]
    env: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway server (default)
    Serve,
    /// Validate the configuration file and print a summary
    Validate,
    /// Write a starter configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&args.config, &args.env).await,
        Commands::Validate => validate_config_command(&args.config, &args.env).await,
        Commands::Init => init_config_command(&args.config).await,
    }
}

async fn serve(config_path: &str, environment: &str) -> Result<()> {
    let config = Arc::new(load_config(config_path, environment).await?);
    tracing_setup::init_tracing(&config.logging)?;

    let port = config
        .port
        .ok_or_else(|| eyre!("Missing required configuration field: port"))?;
    let gateway = Arc::new(GatewayService::new(config.clone())?);

    let shutdown = GracefulShutdown::new();
    let background_tasks = gateway.spawn_background_tasks(shutdown.sender());
    let signal_handler = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!(error = ?e, "Signal handler failed");
            }
        })
    };

    let http_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new()?);
    let handler = HttpHandler::new(
        gateway.clone(),
        http_client,
        Arc::new(DashboardRenderer::new(&config.dashboard.template)),
        Arc::new(FileSystemAdapter::new()),
    );
    let app = build_router(Arc::new(handler));

    for route in gateway.routes().iter() {
        tracing::info!(
            prefix = route.prefix(),
            target = route.target(),
            timeout_ms = route.timeout().as_millis() as u64,
            "Configured route"
        );
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, environment, "Gateway listening");

    let wait_for_signal = {
        let shutdown = shutdown.clone();
        async move {
            let reason = shutdown.wait_for_shutdown_signal().await;
            tracing::info!(?reason, "Draining connections");
        }
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_signal)
    .await
    .context("Server error")?;

    // Stops the background tasks if the server ended on its own.
    shutdown.trigger(ShutdownReason::Requested);
    signal_handler.abort();
    for task in background_tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    for snapshot in gateway.breakers().snapshots() {
        tracing::info!(
            route = %snapshot.route,
            state = %snapshot.state,
            failures = snapshot.counts.failures,
            timeouts = snapshot.counts.timeouts,
            total = snapshot.counts.total(),
            "Final circuit breaker state"
        );
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate the configuration file and exit
async fn validate_config_command(config_path: &str, environment: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path} (environment: {environment})");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path, environment).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            print_summary(&config);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Every route needs a prefix starting with '/' and an http(s) target");
            println!("   • Route prefixes must be unique");
            println!("   • Rate limit windowMs and max must be greater than zero");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &EnvironmentConfig) {
    println!("📋 Configuration Summary:");
    if let Some(port) = config.port {
        println!("   • Port: {port}");
    }
    println!(
        "   • Rate limit: {} requests / {}ms{}",
        config.rate_limit.max,
        config.rate_limit.window_ms,
        if config.security.enable_rate_limit { "" } else { " (disabled)" }
    );
    println!("   • Routes: {}", config.routes().len());
    for route in config.routes() {
        println!(
            "     - {} -> {}",
            route.prefix.as_deref().unwrap_or("?"),
            route.target.as_deref().unwrap_or("?")
        );
    }
    println!();
    println!("🎉 Configuration is valid and ready to use!");
}

/// Write a starter configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'fgateway --config {config_path} serve' to start the gateway");
    Ok(())
}
