//! Harbor broker daemon.
//!
//! Reads newline-delimited JSON requests on stdin, writes one JSON response
//! per line on stdout, and drives the orchestrator underneath. Logs go to
//! stderr so the protocol stream stays clean.

mod cli;
mod rpc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harbor_auth::{AuthManager, CredentialStore};
use harbor_docker::{sandbox_dockerfile, SandboxDriver};
use harbor_index::SandboxIndex;
use harbor_orchestrator::Orchestrator;
use harbor_session::SessionRegistry;
use harbor_settings::SettingsLoader;

use cli::Args;
use rpc::RpcHandler;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let loader = match &args.settings {
        Some(path) => SettingsLoader::new(path),
        None => SettingsLoader::from_default_location(),
    };

    if args.init {
        loader.ensure_template().context("failed to write settings template")?;
        println!("settings written to {}", loader.path().display());
        return Ok(());
    }

    let mut settings = loader.load().context("failed to load settings")?;
    if let Some(data_dir) = &args.data_dir {
        settings.server.data_dir = data_dir.clone();
    }

    init_tracing(&settings.server.log_level);
    info!(data_dir = %settings.server.data_dir.display(), "harbor starting");

    let driver =
        Arc::new(SandboxDriver::new(&settings.sandbox).context("failed to create sandbox driver")?);

    if args.build_image {
        driver
            .ensure_image(&sandbox_dockerfile(), &settings.sandbox.image_tag)
            .await
            .context("image build failed")?;
        println!("image {} ready", settings.sandbox.image_tag);
        return Ok(());
    }

    if !driver.ping().await {
        warn!("container engine unreachable; sandbox operations will fail until it is");
    }

    let index =
        Arc::new(SandboxIndex::open(&settings.server.data_dir).context("failed to open index")?);
    let store = Arc::new(CredentialStore::new(&settings.auth));
    let auth = Arc::new(AuthManager::new(store, settings.auth.clone()));
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(
        settings.server.registry_timeout_secs,
    )));

    let orchestrator = Orchestrator::new(settings, driver, index, auth);
    orchestrator.spawn_reaper();
    spawn_registry_sweep(Arc::clone(&registry), Arc::clone(&orchestrator));

    serve_stdio(Arc::clone(&orchestrator), registry).await?;

    // EOF or an explicit shutdown request; either way drain everything.
    orchestrator.shutdown().await;
    info!("harbor stopped");
    Ok(())
}

fn init_tracing(fallback_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("harbor={fallback_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn spawn_registry_sweep(registry: Arc<SessionRegistry>, orchestrator: Arc<Orchestrator>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(300)).await;
            let dropped = registry.sweep_stale();
            if dropped.is_empty() {
                continue;
            }
            info!(count = dropped.len(), "swept stale transport mappings");
            for agent_id in dropped {
                orchestrator.detach_agent(&agent_id).await;
            }
        }
    });
}

async fn serve_stdio(
    orchestrator: Arc<Orchestrator>,
    registry: Arc<SessionRegistry>,
) -> anyhow::Result<()> {
    let handler = RpcHandler::new(orchestrator, registry);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match handler.handle_line(trimmed).await {
            Some(response) => {
                let mut out = serde_json::to_string(&response)
                    .unwrap_or_else(|e| format!(r#"{{"id":0,"ok":false,"error":"{e}"}}"#));
                out.push('\n');
                stdout
                    .write_all(out.as_bytes())
                    .await
                    .context("stdout write failed")?;
                stdout.flush().await.context("stdout flush failed")?;
            }
            None => break,
        }
    }

    Ok(())
}
