// Operator Expenses - Query Server
// Read-only REST API over the pipeline artifacts

use anyhow::{Context, Result};
use tracing::info;

use operator_expenses::api::{router, AppState};
use operator_expenses::logging::init_logging;
use operator_expenses::{Repository, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let settings = Settings::from_env().context("Failed to load settings")?;
    info!("data directory: {}", settings.data_dir.display());

    let repo = Repository::load(&settings).context("Failed to load artifacts")?;
    info!("{} operators loaded", repo.operator_count());

    let app = router(AppState::new(repo), &settings.cors_origin_list());

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;

    info!("🚀 server running on http://{}", settings.bind_addr);
    info!("   API: http://{}/api/operators", settings.bind_addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
