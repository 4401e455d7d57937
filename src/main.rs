//! Nexus server entry point.

use anyhow::Context;

use nexus::api::{self, auth};
use nexus::db::Database;
use nexus::Config;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("nexus error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    init_tracing()?;

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        "Starting nexus v{} (dev_mode={}, database={})",
        env!("CARGO_PKG_VERSION"),
        config.dev_mode,
        config.database_path.display()
    );
    if config.dev_mode && config.auth.jwt_secret.is_none() {
        tracing::warn!("DEV_MODE without JWT_SECRET: unauthenticated requests act as the super admin");
    }

    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    if let Some(admin) = &config.bootstrap_admin {
        match auth::bootstrap_super_admin(&db, admin, auth::PBKDF2_ROUNDS)
            .context("failed to create the bootstrap super admin")?
        {
            Some(user) => tracing::info!("Created super admin {} ({})", user.username, user.email),
            None => tracing::debug!("Super admin already present, skipping bootstrap"),
        }
    }

    api::serve(config, db).await
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}
