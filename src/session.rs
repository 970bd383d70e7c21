//! Session establishment and lifecycle
//!
//! Opening a session is a single linear sequence with no retries:
//!
//! ```text
//! Closed → ConnectingTcp → CotpConnecting → S7SetupPending → Ready
//! ```
//!
//! 1. TCP connect to `(host, port)`, Nagle disabled.
//! 2. COTP Connection Request / Connection Confirm.
//! 3. S7 communication setup; the Ack-Data carries the granted PDU size and
//!    the job concurrency budget.
//!
//! Any validation or I/O failure aborts back to `Closed`; the caller opens
//! a fresh session to retry. A `Ready` session owns the buffer pool and the
//! request executor that all subsequent reads and writes go through.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec;
use crate::config::S7ConnectionConfig;
use crate::constants::FRAME_OVERHEAD;
use crate::error::{S7Error, S7Result};
use crate::executor::{RequestExecutor, Response, SessionStats};
use crate::pool::{BufferPool, PooledBuffer};

/// Parameters negotiated during communication setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParameters {
    /// Granted maximum PDU size in bytes; every request and response must
    /// fit within it.
    pub pdu_size: u16,
    /// Granted max AMQ called: the number of jobs that may be outstanding
    /// at once.
    pub max_concurrent_jobs: u16,
}

impl SessionParameters {
    /// Size of a buffer able to hold any frame of this session: the PDU
    /// plus the TPKT/COTP overhead, which is not counted inside the PDU.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.pdu_size as usize + FRAME_OVERHEAD
    }
}

/// An open S7 session: negotiated parameters, buffer pool and executor.
#[derive(Debug)]
pub struct S7Session {
    parameters: SessionParameters,
    pool: BufferPool,
    executor: RequestExecutor,
}

impl S7Session {
    /// Open a session: TCP connect, COTP handshake, communication setup.
    ///
    /// Each step is bounded by `config.connect_timeout`. On success the
    /// buffer pool is sized from the negotiation
    /// (`max_concurrent_jobs + 1` buffers of `pdu_size + 7` bytes) and the
    /// executor is started.
    pub async fn open(config: &S7ConnectionConfig) -> S7Result<Self> {
        config.validate()?;
        let step_timeout = config.connect_timeout;

        debug!(host = %config.host, port = config.port, "connecting");
        let stream = timeout(
            step_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| timeout_error(step_timeout))??;
        stream.set_nodelay(true)?;
        let mut stream = stream;

        // Handshake telegrams are tiny; one scratch buffer serves both
        // exchanges before the real pool exists.
        let mut scratch = vec![0u8; 512];

        debug!("sending COTP connection request");
        let len =
            codec::encode_connect_request(&mut scratch, config.local_tsap, config.remote_tsap)?;
        let confirm = exchange(&mut stream, &mut scratch, len, step_timeout).await?;
        codec::parse_connect_confirm(&scratch[..confirm])?;

        debug!("sending S7 communication setup");
        let len = codec::encode_communication_setup(&mut scratch)?;
        let ack = exchange(&mut stream, &mut scratch, len, step_timeout).await?;
        let parameters = codec::parse_communication_setup_ack(&scratch[..ack])?;

        debug!(
            pdu_size = parameters.pdu_size,
            max_concurrent_jobs = parameters.max_concurrent_jobs,
            "session ready"
        );
        let pool = BufferPool::new(
            parameters.buffer_size(),
            parameters.max_concurrent_jobs as usize + 1,
        );
        let (read_half, write_half) = stream.into_split();
        let executor = RequestExecutor::start(
            read_half,
            write_half,
            pool.clone(),
            parameters.max_concurrent_jobs as usize,
        );

        Ok(Self {
            parameters,
            pool,
            executor,
        })
    }

    /// Negotiated session parameters.
    pub fn parameters(&self) -> SessionParameters {
        self.parameters
    }

    /// Lifetime counters of the executor.
    pub fn stats(&self) -> SessionStats {
        self.executor.stats()
    }

    /// Whether the session has been torn down by [`S7Session::close`] or a
    /// fatal error.
    pub fn is_closed(&self) -> bool {
        self.executor.is_closed()
    }

    /// Take a PDU-sized buffer for building a request.
    pub async fn acquire_buffer(&self) -> S7Result<PooledBuffer> {
        self.pool.acquire().await
    }

    /// Execute one framed request through the executor.
    pub async fn perform(
        &self,
        request: PooledBuffer,
        len: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> S7Result<Response> {
        self.executor.perform(request, len, deadline, cancel).await
    }

    /// Close the session: outstanding jobs complete with
    /// [`S7Error::SessionClosed`], pooled buffers are released and the
    /// stream is shut down.
    pub async fn close(&self) {
        self.executor.close().await;
    }
}

fn timeout_error(deadline: Duration) -> S7Error {
    S7Error::Timeout {
        timeout_ms: deadline.as_millis() as u64,
    }
}

/// Send `scratch[..len]` and read back exactly one frame, both bounded by
/// `deadline`.
async fn exchange(
    stream: &mut TcpStream,
    scratch: &mut [u8],
    len: usize,
    deadline: Duration,
) -> S7Result<usize> {
    timeout(deadline, stream.write_all(&scratch[..len]))
        .await
        .map_err(|_| timeout_error(deadline))??;
    timeout(deadline, codec::read_frame(stream, scratch))
        .await
        .map_err(|_| timeout_error(deadline))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn read_exact_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut rest = vec![0u8; total - 4];
        stream.read_exact(&mut rest).await.unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&rest);
        frame
    }

    fn connect_confirm() -> Vec<u8> {
        let mut frame = vec![0u8; 22];
        frame[0] = 0x03;
        frame[2..4].copy_from_slice(&22u16.to_be_bytes());
        frame[4] = 0x11;
        frame[5] = 0xD0;
        frame
    }

    /// Setup Ack-Data granting `pdu_size` and `jobs`.
    fn setup_ack(pdu_size: u16, jobs: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 27];
        frame[0] = 0x03;
        frame[2..4].copy_from_slice(&27u16.to_be_bytes());
        frame[4] = 0x02;
        frame[5] = 0xF0;
        frame[6] = 0x80;
        frame[7] = 0x32;
        frame[8] = 0x03; // Ack-Data
        frame[13..15].copy_from_slice(&8u16.to_be_bytes()); // parameter length
        frame[19] = 0xF0;
        frame[21..23].copy_from_slice(&1u16.to_be_bytes()); // AMQ calling
        frame[23..25].copy_from_slice(&jobs.to_be_bytes()); // AMQ called
        frame[25..27].copy_from_slice(&pdu_size.to_be_bytes());
        frame
    }

    async fn spawn_handshake_server(
        confirm: Vec<u8>,
        ack: Vec<u8>,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let cr = read_exact_frame(&mut stream).await;
            assert_eq!(cr.len(), 22);
            assert_eq!(cr[5], 0xE0);
            stream.write_all(&confirm).await.unwrap();
            let setup = read_exact_frame(&mut stream).await;
            assert_eq!(setup.len(), 25);
            stream.write_all(&ack).await.unwrap();
            stream
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_open_negotiates_parameters() {
        let (addr, server) =
            spawn_handshake_server(connect_confirm(), setup_ack(960, 8)).await;
        let config = S7ConnectionConfig::new(addr.ip().to_string()).with_port(addr.port());
        let session = S7Session::open(&config).await.unwrap();

        let parameters = session.parameters();
        assert_eq!(parameters.pdu_size, 960);
        assert_eq!(parameters.max_concurrent_jobs, 8);
        assert_eq!(parameters.buffer_size(), 967);
        assert!(!session.is_closed());

        session.close().await;
        assert!(session.is_closed());
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_bad_connect_confirm() {
        // Server answers the CR with another CR instead of a CC.
        let mut bogus = connect_confirm();
        bogus[5] = 0xE0;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_exact_frame(&mut stream).await;
            stream.write_all(&bogus).await.unwrap();
        });

        let config = S7ConnectionConfig::new(addr.ip().to_string()).with_port(addr.port());
        let err = S7Session::open(&config).await.unwrap_err();
        assert!(matches!(err, S7Error::Framing { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_failed_negotiation() {
        // PLC grants a zero PDU size.
        let (addr, _server) =
            spawn_handshake_server(connect_confirm(), setup_ack(0, 8)).await;
        let config = S7ConnectionConfig::new(addr.ip().to_string()).with_port(addr.port());
        let err = S7Session::open(&config).await.unwrap_err();
        assert!(matches!(err, S7Error::SpecViolation { .. }));
    }

    #[tokio::test]
    async fn test_open_times_out_on_silent_server() {
        // Server accepts but never answers the CR.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let config = S7ConnectionConfig::new(addr.ip().to_string())
            .with_port(addr.port())
            .with_connect_timeout(Duration::from_millis(100));
        let err = S7Session::open(&config).await.unwrap_err();
        assert!(matches!(err, S7Error::Timeout { timeout_ms: 100 }));
        server.await.unwrap();
    }
}
