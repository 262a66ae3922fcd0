//! Service entry point.
//!
//! Wires configuration, the shared clients, and the HTTP interface together,
//! then serves until ctrl-c.

use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use mentor_core::MentorConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use mentor_server::admission::AdmissionController;
use mentor_server::auth::AuthVerifier;
use mentor_server::chat::TurnContext;
use mentor_server::http::{start_http_server, HttpState};
use mentor_server::store::{PgSessionStore, TranscriptStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Course tutoring service", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "mentor.toml")]
    config: String,

    /// Check database connectivity and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match MentorConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            exit(1);
        }
    };

    let clients = match mentor_core::clients::shared(&config).await {
        Ok(clients) => clients,
        Err(e) => {
            eprintln!("Failed to initialize shared clients: {e}");
            exit(1);
        }
    };

    if let Err(e) = mentor_core::db::ensure_schema(&clients.pool).await {
        eprintln!("Failed to apply database schema: {e}");
        exit(1);
    }

    if args.health {
        match mentor_core::db::health_check(&clients.pool).await {
            Ok(version) => {
                println!("Database OK: {version}");
                return Ok(());
            }
            Err(e) => {
                eprintln!("Database health check failed: {e}");
                exit(1);
            }
        }
    }

    let jwt_secret = match std::env::var("MENTOR_JWT_SECRET") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            eprintln!("MENTOR_JWT_SECRET must be set");
            exit(1);
        }
    };

    let store: Arc<dyn TranscriptStore> = Arc::new(PgSessionStore::new(clients.pool.clone()));
    let state = Arc::new(HttpState {
        pool: clients.pool.clone(),
        auth: AuthVerifier::new(&jwt_secret, config.auth.token_leeway_secs),
        turn: TurnContext {
            store,
            backend: clients.llm.clone(),
            admission: AdmissionController::new(config.chat.max_concurrent as usize),
            chat: config.chat.clone(),
        },
        config,
    });

    tracing::info!(
        max_concurrent = state.turn.admission.capacity(),
        model = %state.config.llm.model,
        "Tutoring service starting"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    start_http_server(state, shutdown_rx).await?;

    tracing::info!("Tutoring service stopped");
    Ok(())
}
