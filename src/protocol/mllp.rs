use std::io;
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ============================================================================
// MLLP PROTOCOL CONSTANTS
// ============================================================================

/// MLLP (Minimal Lower Layer Protocol) Start Block - Vertical Tab
pub const MLLP_START_BLOCK: u8 = 0x0B;

/// MLLP End Block - File Separator
pub const MLLP_END_BLOCK: u8 = 0x1C;

/// MLLP Carriage Return
pub const MLLP_CARRIAGE_RETURN: u8 = 0x0D;

const READ_CHUNK_SIZE: usize = 1024;

// ============================================================================
// FRAMING
// ============================================================================

/// Creates an MLLP frame around an HL7 message
pub fn frame(message: &str) -> Vec<u8> {
    let mut framed = Vec::with_capacity(message.len() + 3);
    framed.push(MLLP_START_BLOCK);
    framed.extend_from_slice(message.as_bytes());
    framed.push(MLLP_END_BLOCK);
    framed.push(MLLP_CARRIAGE_RETURN);
    framed
}

/// Extracts the HL7 payload between the start block and the first
/// end-of-block byte, or `None` when the buffer holds no complete frame.
pub fn unframe(data: &[u8]) -> Option<Vec<u8>> {
    let start = data.iter().position(|&b| b == MLLP_START_BLOCK)?;
    let end = data.iter().position(|&b| b == MLLP_END_BLOCK)?;
    if end <= start {
        return None;
    }
    Some(data[start + 1..end].to_vec())
}

// ============================================================================
// RECONNECT BACKOFF
// ============================================================================

/// Exponential backoff between connection attempts: doubles from the base
/// delay up to the cap. The transport never gives up by itself.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base_delay: Duration,
    pub cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_delay: Duration, cap: Duration) -> Self {
        Self {
            base_delay,
            cap,
            attempt: 0,
        }
    }

    /// Delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.checked_mul(factor).unwrap_or(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay.min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Outbound TCP client carrying the single upstream MLLP session.
pub struct MllpTransport {
    stream: TcpStream,
}

impl MllpTransport {
    /// Connects to the upstream, retrying forever with exponential backoff.
    pub async fn connect(host: &str, port: u16) -> Self {
        let mut backoff = Backoff::default();
        loop {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => {
                    info!("Connected to MLLP on {}:{}", host, port);
                    return Self { stream };
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Failed to connect to MLLP on {}:{}: {}; retrying in {:?}...",
                        host, port, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Reads from the socket in chunks until the end-of-block marker shows up
    /// in the buffer. Returns the raw accumulated buffer and a flag telling
    /// the caller whether the connection must be re-established.
    pub async fn read_frame(&mut self) -> (Option<Vec<u8>>, bool) {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while !buffer.contains(&MLLP_END_BLOCK) {
            match self.stream.read(&mut chunk).await {
                Ok(0) => {
                    warn!("MLLP peer closed the connection, reconnecting...");
                    return (None, true);
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    warn!("MLLP connection was reset, reconnecting...");
                    return (None, true);
                }
                Err(e) => {
                    error!("Failed to read an MLLP message: {}", e);
                    return (None, false);
                }
            }
        }
        (Some(buffer), false)
    }

    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            warn!("Error shutting down MLLP connection: {}", e);
        }
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
