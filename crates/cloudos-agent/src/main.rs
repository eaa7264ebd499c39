use std::sync::Arc;

use cloudos_agent::config::AgentConfig;
use cloudos_agent::http::{self, AppState};
use cloudos_agent::{ActionExecutor, ActionRegistry, ProxyTarget, StatusReporter, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env()?;
    let _log_guard = logging::init(config.log_dir.as_deref())?;

    let registry = Arc::new(ActionRegistry::load(&config.actions_file).await);
    let executor = ActionExecutor::new(registry).with_timeout(config.action_timeout);

    let vnc = ProxyTarget::new(config.vnc_addr.clone())
        .with_connect_timeout(config.vnc_connect_timeout)
        .with_idle_timeout(config.vnc_idle_timeout);

    if config.api_token.is_none() {
        tracing::warn!("CLOUDOS_API_TOKEN is not set; /os/* routes are unauthenticated");
    }

    let state = AppState {
        executor,
        status: StatusReporter::new(config.cpu_sample_window),
        vnc,
        api_token: config.api_token.clone(),
    };

    let addr = config.bind_addr;
    tracing::info!(
        %addr,
        data_root = %config.data_root.display(),
        actions_file = %config.actions_file.display(),
        vnc = %config.vnc_addr,
        "cloudos-agent HTTP listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}
