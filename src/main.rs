use anyhow::Result;
use clap::Parser;
use mr_metrics_lib::config::{Cli, Command};
use mr_metrics_lib::sync::CycleOutcome;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config()?;
    mr_metrics_lib::logging::init_tracing(config.log_dir.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match &cli.command {
            Command::Serve => {
                let shutdown = CancellationToken::new();
                tokio::spawn({
                    let shutdown = shutdown.clone();
                    async move {
                        if let Err(error) = tokio::signal::ctrl_c().await {
                            tracing::warn!(error = %error, "failed to listen for ctrl-c");
                        }
                        shutdown.cancel();
                    }
                });
                mr_metrics_lib::serve(&config, shutdown).await?;
            }
            Command::SyncOnce => {
                let outcomes = mr_metrics_lib::sync_once(&config).await?;
                let failed = outcomes
                    .iter()
                    .filter(|(_, outcome)| {
                        !matches!(outcome, CycleOutcome::Merged { .. } | CycleOutcome::Skipped)
                    })
                    .count();
                for (project, outcome) in &outcomes {
                    println!("{project}: {outcome:?}");
                }
                if failed > 0 {
                    anyhow::bail!("{failed} of {} projects failed to sync", outcomes.len());
                }
            }
            Command::Snapshot { date } => {
                let stats = mr_metrics_lib::snapshot(&config, date.as_deref()).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}
