//! Standalone relay gateway simulator
//!
//! Serves a bank of coils over Modbus RTU-over-TCP so the client can be
//! exercised without hardware.
//!
//! Usage: cargo run --bin relay-sim [listen_address] [num_coils] [device_address]
//! Example: cargo run --bin relay-sim 0.0.0.0:5020 16 1
//!
//! Set `RUST_LOG=debug` to see every request.

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voltage_relay::RelaySimulator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let listen = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:5020");
    let num_coils: u16 = match args.get(2) {
        Some(n) => n.parse()?,
        None => 8,
    };
    let device_address: u8 = match args.get(3) {
        Some(a) => a.parse()?,
        None => 1,
    };

    let listener = TcpListener::bind(listen).await?;
    info!(
        addr = %listener.local_addr()?,
        num_coils,
        device_address,
        "Starting relay simulator"
    );

    let simulator = RelaySimulator::new(device_address, num_coils);
    tokio::select! {
        result = simulator.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
