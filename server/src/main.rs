use anyhow::Result;
use clap::Parser;
use meridian_server::{api, config, db, ingest};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Meridian — GPS/telemetry tracking server.
#[derive(Parser, Debug)]
#[command(name = "meridian-server", version, about)]
struct Cli {
    /// Address and port for the HTTP/WebSocket API.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Path to the SQLite database file.
    #[arg(short, long, default_value = "meridian.db")]
    db: String,

    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<String>,
}

const BANNER: &str = r#"
  __  __           _     _ _
 |  \/  | ___ _ __(_) __| (_) __ _ _ __
 | |\/| |/ _ \ '__| |/ _` | |/ _` | '_ \
 | |  | |  __/ |  | | (_| | | (_| | | | |
 |_|  |_|\___|_|  |_|\__,_|_|\__,_|_| |_|
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (logs).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meridian_server=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    println!("{BANNER}");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Meridian server"
    );

    // Load optional config file.
    let app_config = if let Some(ref path) = cli.config {
        config::AppConfig::from_file(path)?
    } else {
        config::AppConfig::default()
    };

    // Open the database and bring the schema up to date.
    let pool = db::init(&cli.db).await?;
    info!(path = %cli.db, "Database initialized");

    // Build shared application state (session core, hub, group manager).
    let database = Arc::new(db::Database::new(pool));
    let state = api::AppState::new(database, app_config.clone());

    // Warm the group cache so parent walks see the stored hierarchy.
    match state.groups.all().await {
        Ok(groups) => info!(count = groups.len(), "Group hierarchy loaded"),
        Err(e) => tracing::error!("Failed to load groups: {e}"),
    }

    // Periodic keepalive towards subscribed user sessions.
    {
        let hub = state.hub.clone();
        let period = std::time::Duration::from_secs(app_config.keepalive_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                hub.send_keepalive();
            }
        });
    }

    // Start the tracker ingest listener if enabled.
    if app_config.ingest.enabled {
        let deps = ingest::IngestDeps {
            manager: state.manager.clone(),
            hub: state.hub.clone(),
            devices: state.devices.clone(),
            positions: state.positions.clone(),
            evaluators: state.evaluators.clone(),
        };
        ingest::start_ingest_task(app_config.ingest.port, deps).await?;
    } else {
        info!("Ingest listener disabled (set enabled = true in [ingest])");
    }

    // Build the application router.
    let manager = state.manager.clone();
    let app = api::router(state);

    // Start listening.
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!(addr = %cli.listen, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    // Drop armed decay timeouts and clear the session tables.
    manager.shutdown();

    Ok(())
}
