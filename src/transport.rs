//! Stream transport: connectors and frame-level I/O
//!
//! A [`Connector`] opens fresh byte streams to one gateway. The
//! connection manager owns at most one stream at a time and asks the
//! connector for a new one whenever the previous stream was discarded.
//!
//! Response frames are read in two steps: the three header bytes, which
//! announce the total length (see [`FrameCodec::response_len`]), then the
//! remainder.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec::FrameCodec;
use crate::constants::RESPONSE_HEADER_LEN;
use crate::error::{RelayError, RelayResult};

/// Opens byte streams to a gateway
pub trait Connector: Send + Sync + 'static {
    /// Stream type produced by this connector
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream
    fn connect(&self) -> impl Future<Output = RelayResult<Self::Stream>> + Send;

    /// Human-readable endpoint for logs and diagnostics
    fn endpoint(&self) -> String;
}

/// TCP connector with a bounded connect time
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = RelayResult<TcpStream>> + Send {
        let endpoint = self.endpoint();
        let host = self.host.clone();
        let port = self.port;
        let connect_timeout = self.connect_timeout;

        async move {
            debug!(endpoint = %endpoint, "Connecting");
            let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| {
                    RelayError::timeout(
                        format!("connect to {}", endpoint),
                        connect_timeout.as_millis() as u64,
                    )
                })?
                .map_err(|e| {
                    RelayError::connection(format!("Failed to connect to {}: {}", endpoint, e))
                })?;
            stream.set_nodelay(true)?;
            info!(endpoint = %endpoint, "Connected");
            Ok(stream)
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Write one frame and flush
pub async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> RelayResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await.map_err(map_io)?;
    stream.flush().await.map_err(map_io)?;
    Ok(())
}

/// Read one complete response frame
pub async fn read_response_frame<S>(stream: &mut S) -> RelayResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut frame).await.map_err(map_io)?;

    let total = FrameCodec::response_len(&frame)?;
    frame.resize(total, 0);
    stream
        .read_exact(&mut frame[RESPONSE_HEADER_LEN..])
        .await
        .map_err(map_io)?;
    Ok(frame)
}

fn map_io(err: std::io::Error) -> RelayError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => RelayError::connection("Connection closed by peer"),
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => RelayError::connection(err.to_string()),
        _ => RelayError::from(err),
    }
}

/// Format packet as hex string for logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and device address
pub fn log_packet(direction: &str, data: &[u8], device: u8) {
    info!(
        "[RELAY-RTU] {} slave:{} {}",
        direction,
        device,
        format_hex_packet(data)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Response;
    use tokio_test::io::Builder;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x01, 0x0F, 0xAB]), "01 0F AB");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[tokio::test]
    async fn test_read_response_frame_in_pieces() {
        let frame = FrameCodec::new(1).encode_response(&Response::Coils(vec![true; 16]));
        let mut stream = Builder::new()
            .read(&frame[..2])
            .read(&frame[2..5])
            .read(&frame[5..])
            .build();

        let read = read_response_frame(&mut stream).await.unwrap();
        assert_eq!(read, frame.to_vec());
    }

    #[tokio::test]
    async fn test_read_response_frame_eof() {
        let mut stream = Builder::new().read(&[0x01, 0x01]).build();
        let err = read_response_frame(&mut stream).await.unwrap_err();
        assert!(matches!(err, RelayError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_read_response_frame_unknown_function() {
        let mut stream = Builder::new().read(&[0x01, 0x03, 0x02]).build();
        let err = read_response_frame(&mut stream).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut stream = Builder::new().write(&[0x01, 0x02]).build();
        write_frame(&mut stream, &[0x01, 0x02]).await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new("127.0.0.1", port, Duration::from_secs(1));
        assert_eq!(connector.endpoint(), format!("127.0.0.1:{}", port));
        let err = connector.connect().await.unwrap_err();
        assert!(err.is_transport());
    }
}
