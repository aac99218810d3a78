//! Planning-poker room server.
//!
//! Configuration comes from the environment (`BALLOT_BIND_ADDR` or `PORT`,
//! `BALLOT_GRACE_MS`, `BALLOT_OUTBOX_CAPACITY`, `BALLOT_HEARTBEAT_SECS`,
//! `BALLOT_ENFORCE_SCALE`); log level from `RUST_LOG`.

use ballot_collab::{RoomServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    log::info!(
        "Starting ballot server (grace {:?}, outbox {}, heartbeat {}s, strict scale: {})",
        config.grace_period,
        config.outbox_capacity,
        config.heartbeat_interval_secs,
        config.enforce_voting_scale
    );

    RoomServer::new(config).run().await
}
