//! pingpong-lb: ping/pong server harness
//!
//! Runs one load session and logs the raw counters:
//! - queue overflows per poller
//! - readiness wait histogram per poller
//! - replies served and connections closed
//!
//! Configuration via CLI arguments or TOML file.

use pingpong_lb::config::Config;
use pingpong_lb::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        transport = ?config.transport,
        mode = ?config.mode,
        pollers = config.pollers,
        workers = config.workers,
        clients = config.clients,
        connections = config.connections,
        messages = config.messages,
        queue_capacity = config.queue_capacity,
        "Starting pingpong-lb"
    );

    let report = runtime::run(config)?;

    for poller in &report.pollers {
        let histogram: Vec<_> = poller.histogram.nonzero().collect();
        info!(
            poller = poller.id,
            overflows = poller.overflows,
            closed = poller.closed,
            ticks = poller.ticks,
            ?histogram,
            "Poller counters"
        );
    }
    info!(
        replies = report.replies(),
        client_replies = report.client_replies(),
        closed = report.closed(),
        overflows = report.overflows(),
        "Run complete"
    );

    Ok(())
}
