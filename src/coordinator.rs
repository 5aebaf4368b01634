//! Polling coordinator with adaptive interval and refresh de-duplication
//!
//! One coordinator drives one device. Its loop waits for the current
//! interval (or an explicit wake-up), then refreshes. A successful refresh
//! resets the interval to the base value; a failed one doubles it up to the
//! ceiling, so a dead gateway is polled less and less often but never
//! abandoned.
//!
//! At most one refresh runs at a time. Scheduled ticks, explicit
//! [`refresh_now`](PollingCoordinator::refresh_now) calls and
//! [`request_immediate_refresh`](PollingCoordinator::request_immediate_refresh)
//! all go through the same in-flight flag.
//!
//! Consumers read [`PollSnapshot`]s through a `watch` channel. The loop
//! task holds an `Arc` to the coordinator until [`stop`](PollingCoordinator::stop)
//! is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::hub::{RelayDevice, RelaySnapshot};

/// How long `stop` waits for the loop task
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub base_interval: Duration,
    /// Ceiling for the doubled interval
    pub max_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(300),
        }
    }
}

/// What consumers see after each refresh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSnapshot {
    /// Last successfully read states; kept across failed refreshes
    pub states: Option<Arc<RelaySnapshot>>,
    pub available: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Result of one refresh request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    Failed,
    /// Another refresh was already in flight
    Skipped,
}

#[derive(Debug)]
struct Schedule {
    interval: Duration,
    consecutive_failures: u32,
}

/// Clears the in-flight flag when the refresh ends or is cancelled
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic refresher for one device
pub struct PollingCoordinator<D: RelayDevice> {
    device: Arc<D>,
    config: PollingConfig,
    schedule: Mutex<Schedule>,
    in_flight: AtomicBool,
    wake: Notify,
    updates: watch::Sender<PollSnapshot>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: RelayDevice> PollingCoordinator<D> {
    pub fn new(device: Arc<D>, config: PollingConfig) -> Arc<Self> {
        let (updates, _) = watch::channel(PollSnapshot::default());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            device,
            schedule: Mutex::new(Schedule {
                interval: config.base_interval,
                consecutive_failures: 0,
            }),
            config,
            in_flight: AtomicBool::new(false),
            wake: Notify::new(),
            updates,
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Interval the loop waits before its next tick
    pub fn current_interval(&self) -> Duration {
        self.schedule.lock().interval
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.updates.subscribe()
    }

    pub fn latest(&self) -> PollSnapshot {
        self.updates.borrow().clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Spawn the polling loop. The first tick comes one interval after
    /// start; call [`refresh_now`](Self::refresh_now) for an initial read.
    /// Calling it again after [`stop`](Self::stop) restarts the loop.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Polling already started");
            return;
        }

        self.shutdown.send_replace(false);
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(
            interval_ms = self.config.base_interval.as_millis() as u64,
            "Polling started"
        );

        *task = Some(tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let interval = this.current_interval();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = this.wake.notified() => debug!("Immediate refresh requested"),
                    _ = sleep(interval) => {},
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = this.refresh_now() => {},
                }
            }
            debug!("Polling loop exited");
        }));
    }

    /// Refresh now unless a refresh is already running
    pub async fn refresh_now(&self) -> RefreshOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Refresh already in flight, skipping");
            return RefreshOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        let result = self.device.read_states().await;
        let available = self.device.is_available();

        match result {
            Ok(states) => {
                {
                    let mut schedule = self.schedule.lock();
                    if schedule.consecutive_failures > 0 {
                        info!(
                            failures = schedule.consecutive_failures,
                            "Polling recovered"
                        );
                    }
                    schedule.interval = self.config.base_interval;
                    schedule.consecutive_failures = 0;
                }
                self.updates.send_modify(|snapshot| {
                    snapshot.states = Some(states);
                    snapshot.available = available;
                    snapshot.last_error = None;
                    snapshot.consecutive_failures = 0;
                    snapshot.last_refresh = Some(Utc::now());
                });
                RefreshOutcome::Updated
            },
            Err(err) => {
                let (interval, failures) = {
                    let mut schedule = self.schedule.lock();
                    schedule.interval = schedule
                        .interval
                        .saturating_mul(2)
                        .min(self.config.max_interval);
                    schedule.consecutive_failures += 1;
                    (schedule.interval, schedule.consecutive_failures)
                };
                warn!(
                    error = %err,
                    failures,
                    next_interval_ms = interval.as_millis() as u64,
                    "Poll failed, backing off"
                );
                self.updates.send_modify(|snapshot| {
                    snapshot.available = available;
                    snapshot.last_error = Some(err.to_string());
                    snapshot.consecutive_failures = failures;
                    snapshot.last_refresh = Some(Utc::now());
                });
                RefreshOutcome::Failed
            },
        }
    }

    /// The polling loop is running
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wake the loop for an immediate refresh. Returns `false` without
    /// scheduling anything when the loop is not running or a refresh is
    /// already in flight.
    pub fn request_immediate_refresh(&self) -> bool {
        if !self.is_running() {
            debug!("Polling not running, immediate refresh not scheduled");
            return false;
        }
        if self.is_refreshing() {
            debug!("Refresh in flight, immediate refresh not scheduled");
            return false;
        }
        self.wake.notify_one();
        true
    }

    /// Stop the loop, cancelling a pending tick or refresh, and close the
    /// device connection. A cancelled refresh is not held against the
    /// device.
    pub async fn stop(&self) {
        self.device.begin_close();
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            match timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(error = %e, "Polling task ended abnormally"),
                Err(_) => warn!("Polling task did not stop in time"),
            }
        }
        self.device.close().await;
        info!("Polling stopped");
    }
}
