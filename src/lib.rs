//! # Voltage Relay - Resilient Modbus Relay Client
//!
//! Async client for relay boards behind Modbus TCP gateways. The wire
//! protocol is small (three coil function codes); the library's job is to
//! keep remote calls bounded and self-healing on an unreliable network.
//!
//! ## Features
//!
//! - **Serialized Access**: one stream per gateway, commands never interleave
//! - **Retry with Backoff**: exponential delays with optional full jitter
//! - **Circuit Breaker**: fast-fail during outages, lazy half-open probing
//! - **Verified Writes**: every write is confirmed by re-reading the relay
//! - **Adaptive Polling**: interval doubles on failure, resets on success
//! - **Built-in Monitoring**: command statistics and hub diagnostics
//! - **Simulator**: in-process relay gateway for tests and demos
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Simulator |
//! |------|----------|--------|-----------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//!
//! Frames are RTU ADUs (address, PDU, CRC-16) carried over TCP, as spoken
//! by common serial-to-Ethernet relay gateways.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_relay::{PollingCoordinator, RelayHub, RelayHubConfig, RelayResult};
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     let config = RelayHubConfig::new("192.168.1.200", 502).with_num_relays(8);
//!     let polling = config.polling_config();
//!     let hub = Arc::new(RelayHub::connect_tcp(config)?);
//!
//!     // Switch relay 3 on; `true` means the relay was seen to change
//!     let verified = hub.set_state(3, true).await?;
//!     println!("Relay 3 on: {}", verified);
//!
//!     // Keep states fresh in the background
//!     let coordinator = PollingCoordinator::new(hub.clone(), polling);
//!     coordinator.refresh_now().await;
//!     coordinator.start();
//!
//!     let mut updates = coordinator.subscribe();
//!     updates.changed().await.ok();
//!     println!("States: {:?}", updates.borrow().states);
//!
//!     coordinator.stop().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types and retry classification
pub mod error;

/// Protocol constants and limits
pub mod constants;

/// RTU frame encoding and decoding
pub mod codec;

/// Stream connectors and frame-level I/O
pub mod transport;

// ============================================================================
// Resilience
// ============================================================================

/// Exponential backoff policy
pub mod retry;

/// Consecutive-failure circuit breaker
pub mod circuit_breaker;

/// Command statistics
pub mod stats;

/// Per-gateway connection manager
pub mod connection;

// ============================================================================
// Device layer
// ============================================================================

/// Hub configuration and relay-to-entity mapping
pub mod config;

/// Relay-level operations with write verification
pub mod hub;

/// Adaptive polling coordinator
pub mod coordinator;

/// In-process relay gateway simulator
pub mod simulator;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_relay::tokio) ===
pub use tokio;

// === Core API ===
pub use config::{RelayEntity, RelayHubConfig, RelayRole};
pub use coordinator::{PollSnapshot, PollingConfig, PollingCoordinator, RefreshOutcome};
pub use hub::{HubDiagnostics, RelayDevice, RelayHub, RelaySnapshot};

// === Error handling ===
pub use error::{ProtocolError, RelayError, RelayResult};

// === Protocol ===
pub use codec::{Command, FrameCodec, Response};

// === Resilience ===
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection::{ConnectionManager, Session};
pub use retry::{RetryConfig, RetryPolicy};

// === Monitoring ===
pub use stats::CommandStats;

// === Transport ===
pub use transport::{Connector, TcpConnector};

// === Testing ===
pub use simulator::{RelaySimulator, SimulatorConnector};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Relay v{} - Resilient Modbus relay client", VERSION)
}
