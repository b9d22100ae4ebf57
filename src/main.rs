//! Endpoint Evolution server
//!
//! Usage: `endpoint_evolution [config.yaml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use endpoint_evolution::{
    server::{run_server, AppState},
    utils::init_tracing,
    CapabilityRegistry, EvolutionConfig, LifecycleEngine, LifecycleStore, LlmGenerationClient, MaintenanceScheduler,
    ScriptSandbox,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EvolutionConfig::load(config_path.as_deref())?;
    let _log_guard = init_tracing(config.log_filter.as_deref(), config.log_dir.as_deref())?;

    println!("\n{}", "═".repeat(60));
    println!("🧬 Endpoint Evolution v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", "═".repeat(60));
    println!("Spawn | Execute | Evolve | Decay");
    println!("{}\n", "═".repeat(60));

    let capabilities = Arc::new(CapabilityRegistry::new(&config.capabilities_dir));
    let capability_count = capabilities.reload().await?;
    if capability_count == 0 {
        warn!("No capabilities loaded; registering built-ins");
        capabilities.register_builtins().await;
    }
    println!("⚡ Capabilities: {}", capabilities.names().await.join(", "));

    let store = Arc::new(LifecycleStore::new(&config.data_file));
    let endpoint_count = store.load_all().await?;
    println!("📚 Endpoints: {} restored from {:?}", endpoint_count, config.data_file);

    let provider = config
        .provider
        .build()
        .context("Failed to configure the generation provider")?;
    let sandbox = Arc::new(ScriptSandbox::new());
    let generator = LlmGenerationClient::new(provider, config.provider.model(), config.refusal_detector()?)
        .with_sandbox(sandbox.clone());
    println!("🤖 Generator: {:?} / {}", config.provider.kind, config.provider.model());

    let engine = LifecycleEngine::new(store, Arc::new(generator), sandbox, capabilities)
        .with_execution_timeout(config.execution_timeout());

    let maintenance = MaintenanceScheduler::new(engine.clone())
        .with_intervals(config.evolve_interval(), config.decay_interval())
        .start();

    println!("🌐 Listening on {}\n", config.bind_addr);
    let result = run_server(AppState { engine }, &config.bind_addr).await;

    maintenance.shutdown();
    info!("👋 Goodbye!");
    result
}
