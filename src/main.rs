use anyhow::Result;

use groundlink::config::LinkConfig;
use groundlink::events::LinkEvent;
use groundlink::link::LinkManager;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    info!("Application starting...");

    let config = match LinkConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            LinkConfig::default()
        }
    };
    info!(
        "Vehicle endpoint: {}:{}",
        config.connection.host, config.connection.port
    );

    let link = LinkManager::new(config);
    let mut events = link.subscribe();

    link.connect().await?;
    info!("Link session started");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Shutdown signal received, stopping link..."),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(n)) => warn!("Event stream lagged, {} events dropped", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    link.disconnect().await?;
    info!("Link stopped, shutting down");
    Ok(())
}

fn print_event(event: &LinkEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to serialize event: {}", e),
    }
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .with(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("groundlink=debug".parse().unwrap()),
        )
        .try_init()
        .expect("Failed to initialize logging");
}
