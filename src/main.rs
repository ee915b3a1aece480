use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pbxwatch::cli::{self, Args};
use pbxwatch::config::Config;
use pbxwatch::health::{self, PollMetrics};
use pbxwatch::notify::{DiscordNotifier, LogNotifier, Notifier};
use pbxwatch::pbx::PbxClient;
use pbxwatch::redact;
use pbxwatch::watch::{Renderer, Watcher};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    if args.help {
        cli::print_help();
        return Ok(());
    }

    // Initialize logging
    let level = if args.debug { "pbxwatch=debug" } else { "pbxwatch=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    info!("pbxwatch v{}", env!("CARGO_PKG_VERSION"));
    for flag in &args.unknown {
        warn!("Ignoring unknown argument {}", flag);
    }

    // Load configuration
    let mut config = Config::from_env()?;
    config.debug |= args.debug;
    info!("Configuration loaded");
    info!("  PBX: {}", config.pbx_base_url);
    info!(
        "  PBX login: {}",
        if config.pbx_login.is_empty() { "(none)" } else { config.pbx_login.as_str() }
    );
    info!("  Poll interval: {}s", config.poll_interval_secs);
    match config.fetch_deadline() {
        Some(deadline) => info!("  Fetch deadline: {}s", deadline.as_secs()),
        None => info!("  Fetch deadline: none"),
    }
    if let Some(token) = &config.discord_token {
        info!("  Discord bot token: {}", redact::token(token));
    }

    // Handle --validate mode
    if args.validate {
        info!("Validating configuration...");
        match config.validate(args.dry_run) {
            Ok(()) => {
                info!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate(args.dry_run)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let client = PbxClient::from_config(&config, cancel.clone()).context("Failed to build PBX client")?;
    if let Err(e) = client.authenticate().await {
        // Not fatal: the fetch loop re-authenticates on 401/403
        warn!("Initial PBX login failed: {}", e);
    }

    if args.dry_run {
        info!("Dry run: notifications go to the log");
        run(&args, &config, client, LogNotifier, cancel).await
    } else {
        let (token, channel_id) = config.discord()?;
        let notifier = DiscordNotifier::new(&config.discord_api_base, token, channel_id, config.http_timeout())?;
        info!("Discord notifier configured for channel {}", channel_id);
        run(&args, &config, client, notifier, cancel).await
    }
}

async fn run<N: Notifier>(
    args: &Args,
    config: &Config,
    client: PbxClient,
    notifier: N,
    cancel: CancellationToken,
) -> Result<()> {
    let metrics = Arc::new(PollMetrics::new());

    // Start health check server if configured
    let health_cancel = cancel.child_token();
    if let Some(port) = config.health_port {
        tokio::spawn(health::run_health_server(port, metrics.clone(), health_cancel.clone()));
    }

    let mut watcher = Watcher::new(client, notifier, Renderer::from_entropy(), metrics).with_cancel(cancel);

    if args.once {
        info!("Running single poll cycle (--once mode)");
        let report = watcher.check_once().await;
        health_cancel.cancel();
        if !report.is_ok() && !report.is_cancelled() {
            anyhow::bail!("Poll cycle failed");
        }
        return Ok(());
    }

    watcher.run(config.poll_interval()).await;
    health_cancel.cancel();

    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested");
    cancel.cancel();
}
