//! Connection manager: one stream, one breaker, one retry loop per gateway
//!
//! Every command goes through a [`Session`], which holds the per-gateway
//! exclusive section for its whole lifetime. Frames from different callers
//! therefore never interleave on the stream, and a caller that needs
//! several commands back to back (write then verify) keeps the section
//! across them. Retry backoff sleeps happen inside the section.
//!
//! A single [`Session::send`]:
//!
//! 1. encodes the command (encode failures return immediately)
//! 2. asks the circuit breaker for a permit (fast-fails while Open)
//! 3. runs attempts: connect if needed, write, read under the per-call
//!    timeout, decode. A retryable failure discards the stream and sleeps
//!    the [`RetryPolicy`] delay before the next attempt.
//! 4. reports exactly one outcome to the breaker and the statistics.
//!
//! If a `send` future is dropped mid-exchange the stream may hold a stale
//! response; it is discarded when the next session starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::codec::{Command, FrameCodec, Response};
use crate::error::{RelayError, RelayResult};
use crate::retry::RetryPolicy;
use crate::stats::CommandStats;
use crate::transport::{log_packet, read_response_frame, write_frame, Connector};

struct Link<S> {
    stream: Option<S>,
    /// Set while a request is on the wire and its response not yet read
    mid_exchange: bool,
    streams_opened: u64,
}

/// Owns the transport to one gateway
pub struct ConnectionManager<C: Connector> {
    connector: C,
    codec: FrameCodec,
    retry: RetryPolicy,
    call_timeout: Duration,
    packet_logging: bool,
    link: AsyncMutex<Link<C::Stream>>,
    breaker: Mutex<CircuitBreaker>,
    stats: RwLock<CommandStats>,
    last_send_ok: AtomicBool,
    connected: AtomicBool,
    /// Set between `begin_close` and `close`; cancelled sends stay neutral
    closing: AtomicBool,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        codec: FrameCodec,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            codec,
            retry,
            call_timeout,
            packet_logging: false,
            link: AsyncMutex::new(Link {
                stream: None,
                mid_exchange: false,
                streams_opened: 0,
            }),
            breaker: Mutex::new(CircuitBreaker::new(breaker)),
            stats: RwLock::new(CommandStats::default()),
            last_send_ok: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    /// Log every frame sent and received
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Enter the exclusive section
    pub async fn session(&self) -> Session<'_, C> {
        let mut link = self.link.lock().await;
        if link.mid_exchange {
            debug!(
                endpoint = %self.connector.endpoint(),
                "Discarding stream abandoned mid-exchange"
            );
            link.stream = None;
            link.mid_exchange = false;
            self.connected.store(false, Ordering::Release);
        }
        Session { manager: self, link }
    }

    /// Send a single command in its own session
    pub async fn send(&self, command: &Command) -> RelayResult<Response> {
        self.session().await.send(command).await
    }

    /// Announce an orderly shutdown. Sends cancelled from now until
    /// [`close`](Self::close) release their breaker permit instead of
    /// counting as failures.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Drop the live stream; the next command reconnects
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if link.stream.take().is_some() {
            debug!(endpoint = %self.connector.endpoint(), "Connection closed");
        }
        link.mid_exchange = false;
        self.connected.store(false, Ordering::Release);
        self.closing.store(false, Ordering::Release);
    }

    /// Mark the gateway unavailable after a reply the caller could not use
    pub(crate) fn mark_failed(&self) {
        self.last_send_ok.store(false, Ordering::Release);
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.lock().failure_count()
    }

    pub fn stats(&self) -> CommandStats {
        self.stats.read().clone()
    }

    /// A stream is currently held
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The most recent command succeeded
    pub fn last_send_ok(&self) -> bool {
        self.last_send_ok.load(Ordering::Acquire)
    }

    /// Last command succeeded and the breaker is not Open
    pub fn is_available(&self) -> bool {
        self.last_send_ok() && self.circuit_state() != CircuitState::Open
    }
}

/// Exclusive access to one gateway's stream
pub struct Session<'a, C: Connector> {
    manager: &'a ConnectionManager<C>,
    link: AsyncMutexGuard<'a, Link<C::Stream>>,
}

impl<C: Connector> Session<'_, C> {
    /// Execute one command with retry and circuit breaking
    pub async fn send(&mut self, command: &Command) -> RelayResult<Response> {
        let manager = self.manager;
        let frame = manager.codec.encode(command)?;

        let acquired = manager.breaker.lock().try_acquire();
        if let Err(err) = acquired {
            manager.stats.write().record_rejected();
            debug!(command = command.name(), error = %err, "Rejected by circuit breaker");
            return Err(err);
        }
        let permit = BreakerPermit::new(&manager.breaker, &manager.closing);

        let started = Instant::now();
        let result = self.run_attempts(command, &frame).await;

        match &result {
            Ok(_) => {
                permit.settle(true);
                manager.stats.write().record_success(started.elapsed());
                manager.last_send_ok.store(true, Ordering::Release);
            },
            Err(err) => {
                // A device exception still proves the link for the breaker
                permit.settle(!err.counts_against_breaker());
                manager.stats.write().record_failure(&err.to_string());
                manager.last_send_ok.store(false, Ordering::Release);
            },
        }
        result
    }

    async fn run_attempts(&mut self, command: &Command, frame: &[u8]) -> RelayResult<Response> {
        let mut attempt: u32 = 1;
        loop {
            let err = match self.attempt(command, frame).await {
                Ok(response) => return Ok(response),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            self.discard();
            match self.manager.retry.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        endpoint = %self.manager.connector.endpoint(),
                        command = command.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    self.manager.stats.write().retried_attempts += 1;
                    sleep(delay).await;
                    attempt += 1;
                },
                None => {
                    warn!(
                        endpoint = %self.manager.connector.endpoint(),
                        command = command.name(),
                        attempts = attempt,
                        error = %err,
                        "Command failed"
                    );
                    return Err(err);
                },
            }
        }
    }

    async fn attempt(&mut self, command: &Command, frame: &[u8]) -> RelayResult<Response> {
        let manager = self.manager;
        let timeout_ms = manager.call_timeout.as_millis() as u64;

        if self.link.stream.is_none() {
            let stream = timeout(manager.call_timeout, manager.connector.connect())
                .await
                .map_err(|_| {
                    RelayError::timeout(
                        format!("connect to {}", manager.connector.endpoint()),
                        timeout_ms,
                    )
                })??;
            if self.link.streams_opened > 0 {
                manager.stats.write().reconnects += 1;
            }
            self.link.streams_opened += 1;
            self.link.stream = Some(stream);
            manager.connected.store(true, Ordering::Release);
        }

        let device = manager.codec.device_address();
        if manager.packet_logging {
            log_packet("send", frame, device);
        }

        self.link.mid_exchange = true;
        let stream = self
            .link
            .stream
            .as_mut()
            .ok_or_else(|| RelayError::connection("Stream unavailable"))?;
        let exchange = async {
            write_frame(stream, frame).await?;
            read_response_frame(stream).await
        };
        let raw = match timeout(manager.call_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                manager.stats.write().timeouts += 1;
                return Err(RelayError::timeout(
                    format!("{} response", command.name()),
                    timeout_ms,
                ));
            },
        };
        self.link.mid_exchange = false;

        {
            let mut stats = manager.stats.write();
            stats.bytes_sent += frame.len() as u64;
            stats.bytes_received += raw.len() as u64;
        }
        if manager.packet_logging {
            log_packet("recv", &raw, device);
        }

        match manager.codec.decode(&raw, command)? {
            Response::Exception { function, code } => Err(RelayError::Exception { function, code }),
            response => Ok(response),
        }
    }

    fn discard(&mut self) {
        self.link.stream = None;
        self.link.mid_exchange = false;
        self.manager.connected.store(false, Ordering::Release);
    }
}

/// One breaker permit; a permit dropped unsettled counts as a failure
/// unless the manager is closing
struct BreakerPermit<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    closing: &'a AtomicBool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a Mutex<CircuitBreaker>, closing: &'a AtomicBool) -> Self {
        Self {
            breaker,
            closing,
            settled: false,
        }
    }

    fn settle(mut self, success: bool) {
        let mut breaker = self.breaker.lock();
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        self.settled = true;
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.closing.load(Ordering::Acquire) {
            self.breaker.lock().release();
        } else {
            self.breaker.lock().record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio_test::io::{Builder, Mock};

    /// Hands out pre-scripted streams, then refuses
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        streams: Arc<Mutex<VecDeque<Mock>>>,
        connects: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn push(&self, stream: Mock) {
            self.streams.lock().push_back(stream);
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl Connector for ScriptedConnector {
        type Stream = Mock;

        fn connect(&self) -> impl Future<Output = RelayResult<Mock>> + Send {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self
                .streams
                .lock()
                .pop_front()
                .ok_or_else(|| RelayError::connection("Connection refused"));
            async move { next }
        }

        fn endpoint(&self) -> String {
            "scripted".to_string()
        }
    }

    const CODEC: FrameCodec = FrameCodec::new(1);

    fn manager(
        connector: ScriptedConnector,
        retries: u32,
        threshold: u32,
    ) -> ConnectionManager<ScriptedConnector> {
        ConnectionManager::new(
            connector,
            CODEC,
            RetryPolicy::new(
                RetryConfig::default()
                    .with_max_attempts(retries)
                    .with_base_delay(Duration::from_millis(100))
                    .with_jitter(false),
            ),
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(30)),
            Duration::from_secs(1),
        )
    }

    fn read_cmd() -> Command {
        Command::ReadCoils { start: 0, count: 4 }
    }

    fn read_exchange(states: Vec<bool>) -> Mock {
        let request = CODEC.encode(&read_cmd()).unwrap();
        let response = CODEC.encode_response(&Response::Coils(states));
        Builder::new().write(&request).read(&response).build()
    }

    #[tokio::test]
    async fn test_send_success() {
        let connector = ScriptedConnector::default();
        connector.push(read_exchange(vec![true, false, false, true]));
        let mgr = manager(connector.clone(), 2, 3);

        let response = mgr.send(&read_cmd()).await.unwrap();
        assert_eq!(response, Response::Coils(vec![true, false, false, true]));
        assert_eq!(connector.connects(), 1);
        assert!(mgr.is_connected());
        assert!(mgr.is_available());

        let stats = mgr.stats();
        assert_eq!(stats.total_commands, 1);
        assert_eq!(stats.successful_commands, 1);
        assert_eq!(stats.bytes_sent, 8);
        assert!(stats.last_success.is_some());
    }

    #[tokio::test]
    async fn test_stream_reused_across_commands() {
        let request = CODEC.encode(&read_cmd()).unwrap();
        let response = CODEC.encode_response(&Response::Coils(vec![false; 4]));
        let connector = ScriptedConnector::default();
        connector.push(
            Builder::new()
                .write(&request)
                .read(&response)
                .write(&request)
                .read(&response)
                .build(),
        );
        let mgr = manager(connector.clone(), 2, 3);

        let mut session = mgr.session().await;
        session.send(&read_cmd()).await.unwrap();
        session.send(&read_cmd()).await.unwrap();
        drop(session);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checksum_error_retries_on_fresh_stream() {
        let request = CODEC.encode(&read_cmd()).unwrap();
        let mut corrupt = CODEC
            .encode_response(&Response::Coils(vec![true; 4]))
            .to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let connector = ScriptedConnector::default();
        connector.push(Builder::new().write(&request).read(&corrupt).build());
        connector.push(read_exchange(vec![true; 4]));
        let mgr = manager(connector.clone(), 2, 3);

        let response = mgr.send(&read_cmd()).await.unwrap();
        assert_eq!(response, Response::Coils(vec![true; 4]));
        assert_eq!(connector.connects(), 2);

        let stats = mgr.stats();
        assert_eq!(stats.retried_attempts, 1);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.successful_commands, 1);
        assert_eq!(mgr.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_reports_once() {
        let connector = ScriptedConnector::default();
        let mgr = manager(connector.clone(), 2, 5);

        let started = Instant::now();
        let err = mgr.send(&read_cmd()).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(connector.connects(), 3);
        // 100ms + 200ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        assert_eq!(mgr.consecutive_failures(), 1);
        assert!(!mgr.is_available());
        let stats = mgr.stats();
        assert_eq!(stats.failed_commands, 1);
        assert_eq!(stats.retried_attempts, 2);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_does_not_touch_transport() {
        let connector = ScriptedConnector::default();
        let mgr = manager(connector.clone(), 0, 1);

        assert!(mgr.send(&read_cmd()).await.is_err());
        assert_eq!(mgr.circuit_state(), CircuitState::Open);
        assert_eq!(connector.connects(), 1);

        let err = mgr.send(&read_cmd()).await.unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen { .. }));
        assert_eq!(connector.connects(), 1);
        assert_eq!(mgr.stats().rejected_commands, 1);

        // Half-open trial call succeeds and closes the circuit
        tokio::time::advance(Duration::from_secs(30)).await;
        connector.push(read_exchange(vec![false; 4]));
        mgr.send(&read_cmd()).await.unwrap();
        assert_eq!(mgr.circuit_state(), CircuitState::Closed);
        assert!(mgr.is_available());
    }

    #[tokio::test]
    async fn test_encode_error_skips_wire_and_breaker() {
        let connector = ScriptedConnector::default();
        let mgr = manager(connector.clone(), 2, 1);

        let err = mgr
            .send(&Command::ReadCoils { start: 0, count: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Encode { .. }));
        assert_eq!(connector.connects(), 0);
        assert_eq!(mgr.circuit_state(), CircuitState::Closed);
        assert_eq!(mgr.stats().total_commands, 0);
    }

    #[tokio::test]
    async fn test_device_exception_is_not_retried() {
        let request = CODEC.encode(&read_cmd()).unwrap();
        let response = CODEC.encode_response(&Response::Exception {
            function: 0x01,
            code: 0x02,
        });
        let connector = ScriptedConnector::default();
        connector.push(Builder::new().write(&request).read(&response).build());
        let mgr = manager(connector.clone(), 2, 1);

        let err = mgr.send(&read_cmd()).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Exception {
                function: 0x01,
                code: 0x02
            }
        ));
        assert_eq!(connector.connects(), 1);
        // The device answered: the breaker sees a healthy link, but the
        // command itself failed
        assert_eq!(mgr.circuit_state(), CircuitState::Closed);
        assert_eq!(mgr.consecutive_failures(), 0);
        assert!(!mgr.is_available());
        assert!(mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout() {
        let request = CODEC.encode(&read_cmd()).unwrap();
        let connector = ScriptedConnector::default();
        connector.push(
            Builder::new()
                .write(&request)
                .wait(Duration::from_secs(10))
                .build(),
        );
        let mgr = manager(connector.clone(), 0, 5);

        let err = mgr.send(&read_cmd()).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout { .. }));
        assert_eq!(mgr.stats().timeouts, 1);
        assert!(!mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_send_discards_stream() {
        let request = CODEC.encode(&read_cmd()).unwrap();
        let connector = ScriptedConnector::default();
        connector.push(
            Builder::new()
                .write(&request)
                .wait(Duration::from_secs(10))
                .build(),
        );
        connector.push(read_exchange(vec![true; 4]));
        let mgr = manager(connector.clone(), 0, 5);

        let cancelled = timeout(Duration::from_millis(100), mgr.send(&read_cmd())).await;
        assert!(cancelled.is_err());
        // The abandoned permit counts as a failure
        assert_eq!(mgr.consecutive_failures(), 1);

        mgr.send(&read_cmd()).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_cancelled_during_close_is_neutral() {
        let request = CODEC.encode(&read_cmd()).unwrap();
        let connector = ScriptedConnector::default();
        connector.push(
            Builder::new()
                .write(&request)
                .wait(Duration::from_secs(10))
                .build(),
        );
        let mgr = manager(connector.clone(), 0, 5);

        mgr.begin_close();
        let cancelled = timeout(Duration::from_millis(100), mgr.send(&read_cmd())).await;
        assert!(cancelled.is_err());
        mgr.close().await;

        assert_eq!(mgr.consecutive_failures(), 0);
        assert_eq!(mgr.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_close_drops_stream() {
        let connector = ScriptedConnector::default();
        connector.push(read_exchange(vec![true; 4]));
        connector.push(read_exchange(vec![false; 4]));
        let mgr = manager(connector.clone(), 0, 5);

        mgr.send(&read_cmd()).await.unwrap();
        mgr.close().await;
        assert!(!mgr.is_connected());

        mgr.send(&read_cmd()).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }
}
