//! Sentinel Daemon
//!
//! Take-profit / stop-loss engine runtime.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration
//! cargo run -p sentineld
//!
//! # Start with custom environment
//! SENTINEL_ENV=test SENTINEL_TP_LADDER=70,10,10,10 cargo run -p sentineld
//! ```
//!
//! # Environment Variables
//!
//! - `SENTINEL_ENV`: Environment (test, development, production)
//! - `SENTINEL_TP_LADDER`: TP ladder percentages (default: 85,5,5,5)
//! - `SENTINEL_FEE_RATE`: Fallback trading fee rate (default: 0.0006)
//! - `SENTINEL_SAFETY_MARGIN`: Breakeven safety margin (default: 0.0002)
//! - `SENTINEL_FILL_THRESHOLD`: Fill confidence threshold (default: 1.0)
//! - `SENTINEL_MIRROR_ENABLED`: Track a mirror account (default: false)
//! - `SENTINEL_ALERT_TARGET`: Default alert destination

use sentineld::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("sentineld=info".parse()?))
        .init();

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        ladder = ?config.ladder.percentages(),
        mirror = config.mirror_enabled,
        "Sentinel Daemon"
    );

    // Create and run daemon
    let daemon = Daemon::new_stub(config);
    daemon.run().await?;

    Ok(())
}
