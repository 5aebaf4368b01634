//! Voltage Relay Demo
//!
//! Walks through the relay client: reading the bank, verified writes,
//! fault handling and background polling.
//!
//! Usage: cargo run --bin demo [gateway_address] [num_relays]
//! Example: cargo run --bin demo 192.168.1.200:502 8
//!
//! Without an address the demo starts a local simulator and talks to it
//! over TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voltage_relay::{PollingCoordinator, RelayHub, RelayHubConfig, RelaySimulator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 {}", voltage_relay::info());
    println!("=====================================\n");

    let args: Vec<String> = std::env::args().collect();
    let num_relays: u16 = args.get(2).and_then(|n| n.parse().ok()).unwrap_or(8);
    let mut simulator = None;
    let (host, port) = match args.get(1) {
        Some(address) => {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or("gateway address must be host:port")?;
            (host.to_string(), port.parse::<u16>()?)
        },
        None => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            let sim = RelaySimulator::new(1, num_relays);
            tokio::spawn(sim.clone().serve(listener));
            println!("🧪 No gateway given, started simulator on 127.0.0.1:{}\n", port);
            simulator = Some(sim);
            ("127.0.0.1".to_string(), port)
        },
    };

    let config = RelayHubConfig::new(host, port)
        .with_name("demo")
        .with_num_relays(num_relays)
        .with_timeout_ms(2_000)
        .with_max_retries(3)
        .with_retry_delays_ms(200, 2_000);
    let polling = config
        .clone()
        .with_poll_interval_ms(1_000)
        .with_max_poll_interval_ms(8_000)
        .polling_config();
    let hub = Arc::new(RelayHub::connect_tcp(config)?);

    // =========================================================================
    // Part 1: Read the bank
    // =========================================================================
    println!("📖 Part 1: Read relay states");
    println!("----------------------------");
    match hub.read_states().await {
        Ok(snapshot) => println!("  States: {}", format_states(snapshot.as_slice())),
        Err(e) => {
            println!("  ⚠️  Read failed: {}", e);
            println!("  (This is expected if no gateway is reachable)");
            println!("\n🎉 Demo completed! (relay operations skipped)");
            return Ok(());
        },
    }

    // =========================================================================
    // Part 2: Verified writes
    // =========================================================================
    println!("\n✏️  Part 2: Verified writes");
    println!("--------------------------");
    for address in [1, num_relays] {
        match hub.set_state(address, true).await {
            Ok(true) => println!("  Relay {} ON (verified)", address),
            Ok(false) => println!("  Relay {} did not change", address),
            Err(e) => println!("  Relay {} error: {}", address, e),
        }
    }

    if let Some(sim) = &simulator {
        sim.set_ignore_writes(true);
        let verified = hub.set_state(2, true).await?;
        println!("  Relay 2 with writes ignored by the board -> verified: {}", verified);
        sim.set_ignore_writes(false);
    }
    println!("  Cached: {}", format_states(&hub.states()));

    // =========================================================================
    // Part 3: Fault handling
    // =========================================================================
    if let Some(sim) = &simulator {
        println!("\n⚡ Part 3: Fault handling");
        println!("------------------------");
        sim.corrupt_next_response();
        match hub.read_states().await {
            Ok(_) => println!("  Corrupted response retried transparently"),
            Err(e) => println!("  Read failed: {}", e),
        }

        sim.set_online(false);
        match hub.read_states().await {
            Ok(_) => println!("  Unexpected success while offline"),
            Err(e) => println!("  Offline gateway -> {}", e),
        }
        println!("  Available: {}", hub.is_available());
        sim.set_online(true);
    }

    // =========================================================================
    // Part 4: Background polling
    // =========================================================================
    println!("\n🔄 Part 4: Background polling");
    println!("-----------------------------");
    let coordinator = PollingCoordinator::new(hub.clone(), polling);
    let mut updates = coordinator.subscribe();
    coordinator.refresh_now().await;
    coordinator.start();

    for _ in 0..3 {
        if tokio::time::timeout(Duration::from_secs(3), updates.changed())
            .await
            .is_err()
        {
            break;
        }
        let latest = updates.borrow_and_update().clone();
        let states = latest
            .states
            .as_ref()
            .map(|s| format_states(s.as_slice()))
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  available={} failures={} states={}",
            latest.available, latest.consecutive_failures, states
        );
    }
    coordinator.stop().await;

    // =========================================================================
    // Part 5: Diagnostics
    // =========================================================================
    println!("\n📊 Part 5: Diagnostics");
    println!("----------------------");
    println!("{}", serde_json::to_string_pretty(&hub.diagnostics())?);

    println!("\n🎉 Demo completed!");
    Ok(())
}

fn format_states(states: &[bool]) -> String {
    states
        .iter()
        .map(|&on| if on { "ON" } else { "off" })
        .collect::<Vec<_>>()
        .join(" ")
}
