use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use brokercrm::{
    build_router,
    config::{AppConfig, StorageBackend},
    core::SystemClock,
    repository::Store,
    storage::{DocumentBackend, FileBackend, RecordBackend},
    web::{AppState, auth::{AuthSettings, seed_admin}},
};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    File,
    Document,
}

#[derive(Parser)]
#[command(name = "brokercrm")]
#[command(about = "Brokerage CRM record server")]
struct Cli {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(backend) = self.backend {
            config.storage_backend = match backend {
                BackendArg::File => StorageBackend::File,
                BackendArg::Document => StorageBackend::Document,
            };
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut config = AppConfig::from_env().context("failed to load application configuration")?;
    Cli::parse().apply(&mut config);

    let backend: Arc<dyn RecordBackend> = match config.storage_backend {
        StorageBackend::File => {
            info!(data_dir = %config.data_dir.display(), "storage backend: file");
            Arc::new(
                FileBackend::open(&config.data_dir)
                    .with_context(|| format!("failed to open {}", config.data_dir.display()))?,
            )
        }
        StorageBackend::Document => {
            info!(
                data_dir = %config.data_dir.display(),
                database = %config.database_name,
                "storage backend: document"
            );
            Arc::new(DocumentBackend::open(
                &config.data_dir,
                config.database_name.clone(),
            ))
        }
    };

    if config.has_insecure_jwt_secret() {
        if config.auth_required {
            anyhow::bail!("JWT_SECRET must be set to a private value when AUTH_REQUIRED is on");
        }
        warn!("JWT_SECRET is unset; issued tokens are forgeable");
    }

    let store = Store::new(backend, Arc::new(SystemClock::new()))
        .with_id_retry_limit(config.id_retry_limit);

    seed_admin(&store, &config.admin_email, &config.admin_password)
        .await
        .context("failed to seed admin user")?;

    let auth = AuthSettings::new(
        &config.jwt_secret,
        config.jwt_ttl_minutes,
        config.auth_required,
    );
    let app = build_router(AppState::new(store, auth));

    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(address = %addr, auth_required = config.auth_required, "brokercrm started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

const DEFAULT_LOG_FILTER: &str = "brokercrm=debug,tower_http=info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn shutdown_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(err) => {
                error!(error = %err, "unable to listen for Ctrl+C");
                std::future::pending::<&'static str>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(err) => {
                error!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<&'static str>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    let received = tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    };
    info!(signal = received, "draining connections before exit");
}
