//! OpenJules mission runtime daemon.
//!
//! Wires the in-memory store, the HTTP LLM gateway and the Docker sandbox
//! driver into a mission runtime, then parks. The CRUD/transport layer is an
//! external collaborator; in this binary, jobs arrive through the store.

use std::sync::Arc;

use openjules::config::Config;
use openjules::llm::HttpLlmClient;
use openjules::mission::{MissionController, MissionRuntime, DEFAULT_MAX_CONCURRENT_MISSIONS};
use openjules::sandbox::DockerDriver;
use openjules::store::InMemoryStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openjules=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Docker socket: {}, sandbox root override: {:?}",
        config.docker_socket.display(),
        config.sandbox_root_override
    );

    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(HttpLlmClient::new());
    let driver = Arc::new(DockerDriver::connect(config)?);
    let controller = Arc::new(MissionController::new(store, llm, driver));
    let runtime = Arc::new(MissionRuntime::new(
        controller,
        DEFAULT_MAX_CONCURRENT_MISSIONS,
    ));

    info!("Mission runtime ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, waiting for running missions");
    runtime.request_shutdown();
    runtime.join_all().await;

    Ok(())
}
