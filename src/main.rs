use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flock::cli;
use flock::context::AppContext;
use flock::node::{run_analyser, AnalyserCommand, Flock};
use flock::settings::{self, INBOUND_QUEUE_DEPTH};
use flock::transport::{SecureTransport, Transport, UdpLink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flock=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings();
    let listen = settings.listen_socket()?;

    let link = UdpLink::bind(listen).await?;
    let creds = settings.credentials()?;
    info!("certificate units {:?}", creds.units());
    let (monitor_tx, monitor_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    let ctx = AppContext::new().with_monitor(monitor_tx);
    let transport = Arc::new(SecureTransport::new(
        link,
        settings.node_name.clone().unwrap_or_default(),
        Some(creds),
        &ctx,
    ));

    info!(
        "Starting {} {} on {}",
        settings::APP_NAME,
        settings::APP_VERSION,
        listen
    );
    let timing = settings.probe_timing()?;
    info!("probing {}", timing.source());
    let node = Flock::start(
        settings.node_id(),
        transport.clone(),
        Arc::new(timing),
        settings.flock_config()?,
        ctx,
    )?;

    // Report stable flocks as they appear
    let (analyser_tx, analyser_rx) = mpsc::channel(1);
    let (status_tx, mut status_rx) = mpsc::channel(8);
    let analyser = tokio::spawn(run_analyser(
        settings.stable_window(),
        analyser_rx,
        monitor_rx,
        status_tx,
    ));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            Some(status) = status_rx.recv() => {
                println!("{}", serde_json::to_string(&status)?);
            }
            _ = &mut shutdown => {
                info!("Shutting down {}", node.me());
                break;
            }
        }
    }

    node.close().await;
    transport.quit();
    if analyser_tx.send(AnalyserCommand::Quit).await.is_err() {
        debug!("analyser already stopped");
    }
    analyser.await?;
    info!("udp link: {}", transport.link().stats);
    info!(
        "packet dispositions: {}",
        serde_json::to_string(&transport.counters().freeze())?
    );

    Ok(())
}
