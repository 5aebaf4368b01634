//! Relay hub: relay-level operations over one gateway
//!
//! Relay addresses are 1-based (`1..=num_relays`); the hub translates to
//! 0-based coil addresses here and nowhere else. The cached state is an
//! immutable [`RelaySnapshot`] swapped atomically, so readers never see a
//! half-applied update. Every mutation of the cache happens inside the
//! connection manager's exclusive section.
//!
//! Writes are verified: [`RelayHub::set_state`] writes the coil, re-reads
//! that single coil in the same session and reports whether the relay
//! actually holds the requested value.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::codec::{Command, FrameCodec, Response};
use crate::config::{RelayEntity, RelayHubConfig};
use crate::connection::ConnectionManager;
use crate::error::{ProtocolError, RelayError, RelayResult};
use crate::retry::RetryPolicy;
use crate::stats::CommandStats;
use crate::transport::{Connector, TcpConnector};

/// Device seam driven by the polling coordinator
pub trait RelayDevice: Send + Sync + 'static {
    /// Read every relay and refresh the cache
    fn read_states(&self) -> impl Future<Output = RelayResult<Arc<RelaySnapshot>>> + Send;

    /// Last command succeeded and the circuit is not open
    fn is_available(&self) -> bool;

    /// Release the live connection
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Called before an orderly shutdown cancels in-flight work
    fn begin_close(&self) {}
}

/// Immutable view of every relay's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySnapshot {
    states: Vec<bool>,
    /// When the whole bank was last read from the device
    updated_at: Option<DateTime<Utc>>,
}

impl RelaySnapshot {
    /// All relays off, never confirmed
    pub fn unknown(num_relays: u16) -> Self {
        Self {
            states: vec![false; num_relays as usize],
            updated_at: None,
        }
    }

    fn confirmed(states: Vec<bool>) -> Self {
        Self {
            states,
            updated_at: Some(Utc::now()),
        }
    }

    /// State of relay `address` (1-based)
    pub fn get(&self, address: u16) -> Option<bool> {
        let index = usize::from(address).checked_sub(1)?;
        self.states.get(index).copied()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, Serialize)]
pub struct HubDiagnostics {
    pub name: String,
    pub endpoint: String,
    pub num_relays: u16,
    pub available: bool,
    pub connected: bool,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub stats: CommandStats,
}

/// Relay-level API for one gateway
pub struct RelayHub<C: Connector = TcpConnector> {
    config: RelayHubConfig,
    manager: ConnectionManager<C>,
    snapshot: RwLock<Arc<RelaySnapshot>>,
}

impl RelayHub<TcpConnector> {
    /// Hub talking TCP to `config.host:config.port`
    pub fn connect_tcp(config: RelayHubConfig) -> RelayResult<Self> {
        let connector = TcpConnector::new(config.host.clone(), config.port, config.timeout());
        Self::new(config, connector)
    }
}

impl<C: Connector> RelayHub<C> {
    /// Validate `config` and build the hub. No I/O happens until the first
    /// command.
    pub fn new(config: RelayHubConfig, connector: C) -> RelayResult<Self> {
        config.validate()?;

        let manager = ConnectionManager::new(
            connector,
            FrameCodec::new(config.device_address),
            RetryPolicy::new(config.retry_config()),
            config.circuit_breaker_config(),
            config.timeout(),
        )
        .with_packet_logging(config.packet_logging);

        info!(
            hub = %config.name,
            endpoint = %manager.endpoint(),
            device = config.device_address,
            relays = config.num_relays,
            "Relay hub created"
        );

        Ok(Self {
            snapshot: RwLock::new(Arc::new(RelaySnapshot::unknown(config.num_relays))),
            config,
            manager,
        })
    }

    /// Seed the cache with persisted states. Ignored unless
    /// `restore_state` is set; missing relays stay off and extra entries
    /// are dropped.
    pub fn with_restored_states(self, states: &[bool]) -> Self {
        if !self.config.restore_state {
            debug!(hub = %self.config.name, "State restore disabled, ignoring persisted states");
            return self;
        }
        let mut restored = vec![false; self.config.num_relays as usize];
        for (slot, state) in restored.iter_mut().zip(states) {
            *slot = *state;
        }
        debug!(hub = %self.config.name, ?restored, "Restored relay states");
        *self.snapshot.write() = Arc::new(RelaySnapshot {
            states: restored,
            updated_at: None,
        });
        self
    }

    pub fn config(&self) -> &RelayHubConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn num_relays(&self) -> u16 {
        self.config.num_relays
    }

    pub fn entities(&self) -> &[RelayEntity] {
        &self.config.entities
    }

    /// Current cached states
    pub fn snapshot(&self) -> Arc<RelaySnapshot> {
        self.snapshot.read().clone()
    }

    /// Cached states as a plain vector, for persistence
    pub fn states(&self) -> Vec<bool> {
        self.snapshot().as_slice().to_vec()
    }

    /// Read all relays in one command and replace the cache
    pub async fn read_states(&self) -> RelayResult<Arc<RelaySnapshot>> {
        let count = self.config.num_relays;
        let mut session = self.manager.session().await;
        let response = session
            .send(&Command::ReadCoils { start: 0, count })
            .await?;
        let states = self.expect_coils(response, count)?;

        let snapshot = Arc::new(RelaySnapshot::confirmed(states));
        *self.snapshot.write() = snapshot.clone();
        Ok(snapshot)
    }

    /// Read one relay and update its cached bit
    pub async fn read_state(&self, address: u16) -> RelayResult<bool> {
        let coil = self.coil_index(address)?;
        let mut session = self.manager.session().await;
        let response = session
            .send(&Command::ReadCoils {
                start: coil,
                count: 1,
            })
            .await?;
        let state = self.expect_coils(response, 1)?[0];
        self.update_bit(coil, state);
        Ok(state)
    }

    /// Switch one relay and verify it.
    ///
    /// Returns `Ok(true)` when the re-read coil holds `value`, `Ok(false)`
    /// when the device acknowledged the write but the relay did not change.
    pub async fn set_state(&self, address: u16, value: bool) -> RelayResult<bool> {
        let coil = self.coil_index(address)?;
        let mut session = self.manager.session().await;

        session
            .send(&Command::WriteCoil {
                address: coil,
                value,
            })
            .await?;
        let response = session
            .send(&Command::ReadCoils {
                start: coil,
                count: 1,
            })
            .await?;
        let actual = self.expect_coils(response, 1)?[0];
        self.update_bit(coil, actual);

        let verified = actual == value;
        if verified {
            debug!(hub = %self.config.name, address, value, "Relay switched");
        } else {
            warn!(
                hub = %self.config.name,
                address,
                requested = value,
                actual,
                "Relay did not change state after write"
            );
        }
        Ok(verified)
    }

    /// Switch every relay with one write-multiple-coils command, then
    /// verify the whole bank
    pub async fn set_states(&self, states: &[bool]) -> RelayResult<bool> {
        let count = self.config.num_relays;
        if states.len() != count as usize {
            return Err(RelayError::validation(
                "states",
                format!("expected {} values, got {}", count, states.len()),
            ));
        }

        let mut session = self.manager.session().await;
        session
            .send(&Command::WriteCoils {
                start: 0,
                bits: states.to_vec(),
            })
            .await?;
        let response = session
            .send(&Command::ReadCoils { start: 0, count })
            .await?;
        let actual = self.expect_coils(response, count)?;

        let verified = actual == states;
        if !verified {
            warn!(hub = %self.config.name, requested = ?states, ?actual, "Bulk write not applied");
        }
        *self.snapshot.write() = Arc::new(RelaySnapshot::confirmed(actual));
        Ok(verified)
    }

    pub fn is_available(&self) -> bool {
        self.manager.is_available()
    }

    pub fn diagnostics(&self) -> HubDiagnostics {
        HubDiagnostics {
            name: self.config.name.clone(),
            endpoint: self.manager.endpoint(),
            num_relays: self.config.num_relays,
            available: self.manager.is_available(),
            connected: self.manager.is_connected(),
            circuit_state: self.manager.circuit_state(),
            consecutive_failures: self.manager.consecutive_failures(),
            stats: self.manager.stats(),
        }
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }

    fn coil_index(&self, address: u16) -> RelayResult<u16> {
        if address == 0 || address > self.config.num_relays {
            return Err(RelayError::invalid_address(address, self.config.num_relays));
        }
        Ok(address - 1)
    }

    /// `updated_at` only tracks full-bank reads, so a single confirmed
    /// bit leaves it alone
    fn update_bit(&self, coil: u16, state: bool) {
        let mut guard = self.snapshot.write();
        let mut states = guard.states.clone();
        if let Some(slot) = states.get_mut(coil as usize) {
            *slot = state;
        }
        *guard = Arc::new(RelaySnapshot {
            states,
            updated_at: guard.updated_at,
        });
    }

    fn expect_coils(&self, response: Response, count: u16) -> RelayResult<Vec<bool>> {
        match response {
            Response::Coils(states) if states.len() == count as usize => Ok(states),
            other => {
                self.manager.mark_failed();
                Err(ProtocolError::InvalidPayload {
                    message: format!("expected {} coil states, got {:?}", count, other),
                }
                .into())
            },
        }
    }
}

impl<C: Connector> RelayDevice for RelayHub<C> {
    fn read_states(&self) -> impl Future<Output = RelayResult<Arc<RelaySnapshot>>> + Send {
        RelayHub::read_states(self)
    }

    fn is_available(&self) -> bool {
        RelayHub::is_available(self)
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        RelayHub::close(self)
    }

    fn begin_close(&self) {
        self.manager.begin_close();
    }
}
