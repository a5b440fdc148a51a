use anyhow::Result;
use clap::Parser;

use balancer::config::Cli;
use balancer::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.log_file.as_deref())?;

    run(cli).await
}

#[cfg(feature = "libvirt")]
async fn run(cli: Cli) -> Result<()> {
    use std::time::Duration;

    use anyhow::Context;
    use tokio_util::sync::CancellationToken;

    use balancer::core::scheduler::Scheduler;
    use balancer::virt::libvirt::LibvirtHost;

    let cfg = cli.balancer_config()?;
    let interval = Duration::from_secs(cli.interval_secs);
    tracing::info!(interval_secs = cli.interval_secs, uri = %cli.connect_uri, "starting balancer");

    let host = LibvirtHost::connect(&cli.connect_uri)
        .with_context(|| format!("failed to open management connection to {}", cli.connect_uri))?;
    let mut scheduler =
        Scheduler::new(host, cfg, interval).context("failed to initialize scheduler")?;

    let cancellation_token = CancellationToken::new();
    spawn_signal_handler(cancellation_token.clone())?;

    scheduler.run(cancellation_token).await;
    tracing::info!("balancer stopped");
    Ok(())
}

#[cfg(not(feature = "libvirt"))]
async fn run(_cli: Cli) -> Result<()> {
    anyhow::bail!(
        "this build carries no production management connector; rebuild with --features libvirt"
    )
}

/// Request cooperative shutdown on SIGTERM/SIGINT; the in-flight tick always
/// completes first.
#[cfg(feature = "libvirt")]
fn spawn_signal_handler(
    cancellation_token: tokio_util::sync::CancellationToken,
) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
            cancellation_token.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C, initiating graceful shutdown");
            }
            cancellation_token.cancel();
        });
    }

    Ok(())
}
