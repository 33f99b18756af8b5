use std::sync::Arc;

use anyhow::Context;

use draftmill_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    draftmill_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let services = draftmill_api::app::services::build_services(&settings)
        .await
        .context("failed to wire services")?;

    let app = draftmill_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
