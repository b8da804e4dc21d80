//! The long-running agent process.

use anyhow::{Context, Result};
use buildfarm_config::load_agent_config;
use buildfarm_db::{PgWorkStore, WorkStore, create_pool};
use buildfarm_executor::{LocalProcessLauncher, PerforceClient};
use buildfarm_scheduler::{AgentCoordinator, Collaborators, Emailer, ExitReason, MailTransport};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::mail::{LogTransport, WebhookTransport};

/// Exit status telling the service wrapper to start the agent again.
const RESTART_EXIT_CODE: i32 = 3;

pub fn exit_code(reason: ExitReason) -> i32 {
    match reason {
        ExitReason::Shutdown => 0,
        ExitReason::Restart => RESTART_EXIT_CODE,
        ExitReason::SystemDown => 1,
    }
}

pub async fn run(config_path: &Path, machine: Option<String>, database_url: Option<String>) -> Result<ExitReason> {
    let mut config = load_agent_config(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    if let Some(machine) = machine {
        config.machine = machine;
    }
    if let Some(url) = database_url {
        config.database_url = Some(url);
    }

    let url = config
        .database_url
        .clone()
        .context("No database URL: pass --database-url or set database-url in the config")?;
    let pool = create_pool(&url).await.context("Failed to connect to the work store")?;
    let store: Arc<dyn WorkStore> = Arc::new(PgWorkStore::new(pool));

    let transport: Arc<dyn MailTransport> = match &config.mail.webhook {
        Some(endpoint) => Arc::new(WebhookTransport::new(endpoint.clone())),
        None => {
            warn!("No mail relay configured; notifications will only be logged");
            Arc::new(LogTransport)
        }
    };
    let notifier = Arc::new(Emailer::new(config.mail.clone(), transport));

    info!(machine = %config.machine, root = %config.root.display(), "Starting agent");

    let deps = Collaborators {
        store,
        scc: Arc::new(PerforceClient::default()),
        launcher: Arc::new(LocalProcessLauncher::new()),
        notifier,
        config: Arc::new(config),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut coordinator = AgentCoordinator::new(deps, shutdown);
    let reason = coordinator.run().await?;
    info!(?reason, "Agent stopped");
    Ok(reason)
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(ExitReason::Shutdown), 0);
        assert_eq!(exit_code(ExitReason::Restart), RESTART_EXIT_CODE);
        assert_ne!(exit_code(ExitReason::SystemDown), 0);
    }
}
