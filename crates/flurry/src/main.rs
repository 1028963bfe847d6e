mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use broker_client::HttpBroker;
use proxy_core::{Broker, PeerConnector, RelayDialer, Scheduler};
use proxy_events::{EventKind, EventSink, Reporter};
use webrtc_peer::WebRtcConnector;
use ws_relay::WsDialer;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref broker) = cli.broker {
        cfg.broker.url = broker.clone();
    }
    if let Some(ref relay) = cli.relay {
        cfg.relay.url = relay.clone();
    }
    if let Some(rate) = cli.rate_limit {
        cfg.limits.rate_bytes_per_sec = Some(rate);
    }
    if let Some(nat) = cli.nat {
        cfg.nat = nat;
    }
    if let Some(ref path) = cli.event_log {
        cfg.logging.event_log = Some(path.clone());
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        broker = %cfg.broker.url,
        relay = %cfg.relay.url,
        nat = %cfg.nat,
        "flurry starting"
    );

    // 4. Build the runtime configuration and the shared rate limiter.
    let core = Arc::new(config::to_core(&cfg)?);
    let rate = Arc::new(
        core.rate_limiter()
            .context("rejected rate-limit configuration")?,
    );

    // 5. Start the activity reporter.
    let (events, stream) = EventSink::channel();
    let reporter = Reporter::new(cfg.logging.event_log.clone()).spawn(stream);
    events.emit(
        None,
        EventKind::ProxyStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );

    // 6. Wire up the collaborators the core consumes.
    let broker = HttpBroker::new(&core.broker_url).context("failed to build broker client")?;
    info!(broker = broker.base(), "rendezvous endpoint resolved");
    let broker: Arc<dyn Broker> = Arc::new(broker);
    let connector: Arc<dyn PeerConnector> = Arc::new(WebRtcConnector::new());
    let dialer: Arc<dyn RelayDialer> = Arc::new(WsDialer::new());

    // 7. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx_signal.send(());
    });

    // 8. Serve until the shutdown signal arrives.
    let scheduler = Scheduler::new(core, broker, connector, dialer, rate, events.clone());
    scheduler.run(shutdown_tx.subscribe()).await;

    // 9. Let the reporter drain its queue before exiting.
    drop(events);
    let _ = reporter.await;

    info!("flurry shut down");
    Ok(())
}
