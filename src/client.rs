//! High-level S7 client
//!
//! [`S7Client`] ties the session, the codec and the executor together into
//! the API most applications use: batched reads and writes of
//! [`DataItem`]s, plus convenience helpers for the common cases of raw DB
//! transfers and single bits.
//!
//! All operations take `&self`; a client behind an [`std::sync::Arc`] can
//! issue concurrent requests, bounded by the negotiated job budget.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use voltage_s7::{S7Client, S7ConnectionConfig, CpuType, ValueItem, S7Result};
//!
//! #[tokio::main]
//! async fn main() -> S7Result<()> {
//!     let config = S7ConnectionConfig::new("192.168.0.10").with_cpu(CpuType::S71500);
//!     let client = S7Client::connect(config).await?;
//!
//!     // Read DB9.DBW6 and DB9.DBD8 in one request
//!     let mut speed = ValueItem::db_word(9, 6);
//!     let mut total = ValueItem::db_dint(9, 8);
//!     client.read_items(&mut [&mut speed, &mut total]).await?;
//!     println!("speed={} total={}", speed.value(), total.value());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec;
use crate::config::S7ConnectionConfig;
use crate::error::{S7Error, S7Result};
use crate::executor::SessionStats;
use crate::item::{Area, DataItem};
use crate::session::{S7Session, SessionParameters};
use crate::value::{ByteSpanItem, S7Value, ValueItem};

/// Overhead of a read Ack-Data around a single item's payload:
/// S7 ack header (12) + parameters (2) + data item header (4).
const READ_RESPONSE_OVERHEAD: usize = 18;

/// Overhead of a write job around a single item's payload:
/// S7 job header (10) + parameters (2 + 12) + data item header (4), plus
/// slack matching what engineering tools reserve.
const WRITE_REQUEST_OVERHEAD: usize = 28;

/// Asynchronous S7 client over one ISO-on-TCP session.
#[derive(Debug)]
pub struct S7Client {
    session: S7Session,
    request_timeout: Duration,
}

impl S7Client {
    /// Connect and negotiate a session per `config`.
    pub async fn connect(config: S7ConnectionConfig) -> S7Result<Self> {
        let request_timeout = config.request_timeout;
        let session = S7Session::open(&config).await?;
        Ok(Self {
            session,
            request_timeout,
        })
    }

    /// Negotiated session parameters.
    pub fn parameters(&self) -> SessionParameters {
        self.session.parameters()
    }

    /// Negotiated maximum PDU size in bytes.
    pub fn pdu_size(&self) -> u16 {
        self.session.parameters().pdu_size
    }

    /// Negotiated number of concurrently outstanding jobs.
    pub fn max_concurrent_jobs(&self) -> u16 {
        self.session.parameters().max_concurrent_jobs
    }

    /// Lifetime request/response counters.
    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Whether the session is still usable.
    pub fn is_connected(&self) -> bool {
        !self.session.is_closed()
    }

    // ===== Batched item operations =====

    /// Read a batch of items in one request, using the default deadline.
    pub async fn read_items(&self, items: &mut [&mut dyn DataItem]) -> S7Result<()> {
        let cancel = CancellationToken::new();
        self.read_items_with(items, self.request_timeout, &cancel)
            .await
    }

    /// Read a batch of items with an explicit deadline and cancellation
    /// token. Cancelling `cancel` aborts the call with
    /// [`S7Error::Canceled`], winning over a simultaneous deadline.
    pub async fn read_items_with(
        &self,
        items: &mut [&mut dyn DataItem],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> S7Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut request = self.session.acquire_buffer().await?;
        let len = codec::encode_read_request(&mut request, &*items, self.pdu_size())?;
        let response = self.session.perform(request, len, deadline, cancel).await?;
        let result = codec::parse_read_response(&response, items);
        self.teardown_on_fatal(&result).await;
        result
    }

    /// Write a batch of items in one request, using the default deadline.
    pub async fn write_items(&self, items: &[&dyn DataItem]) -> S7Result<()> {
        let cancel = CancellationToken::new();
        self.write_items_with(items, self.request_timeout, &cancel)
            .await
    }

    /// Write a batch of items with an explicit deadline and cancellation
    /// token.
    pub async fn write_items_with(
        &self,
        items: &[&dyn DataItem],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> S7Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut request = self.session.acquire_buffer().await?;
        let len = codec::encode_write_request(&mut request, items, self.pdu_size())?;
        let response = self.session.perform(request, len, deadline, cancel).await?;
        let result = codec::parse_write_response(&response, items.len());
        self.teardown_on_fatal(&result).await;
        result
    }

    // ===== Convenience operations =====

    /// Read `len` bytes from a data block, splitting into as many requests
    /// as the negotiated PDU size demands.
    pub async fn db_read(&self, db_number: u16, start: u32, len: usize) -> S7Result<Vec<u8>> {
        self.area_read(Area::DataBlock, db_number, start, len).await
    }

    /// Write `data` into a data block, splitting into as many requests as
    /// the negotiated PDU size demands.
    pub async fn db_write(&self, db_number: u16, start: u32, data: &[u8]) -> S7Result<()> {
        self.area_write(Area::DataBlock, db_number, start, data)
            .await
    }

    /// Read a run of bytes from any byte-addressed area.
    pub async fn area_read(
        &self,
        area: Area,
        db_number: u16,
        start: u32,
        len: usize,
    ) -> S7Result<Vec<u8>> {
        let budget = self.read_payload_budget();
        let mut out = Vec::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let chunk = (len - offset).min(budget);
            let mut item = ByteSpanItem::read(area, db_number, start + offset as u32, chunk as u16);
            self.read_items(&mut [&mut item]).await?;
            if item.data().len() != chunk {
                return Err(S7Error::PartialRead {
                    expected: chunk,
                    actual: item.data().len(),
                });
            }
            out.extend_from_slice(item.data());
            offset += chunk;
        }
        debug!(len, chunks = len.div_ceil(budget.max(1)), "area read complete");
        Ok(out)
    }

    /// Write a run of bytes into any byte-addressed area.
    pub async fn area_write(
        &self,
        area: Area,
        db_number: u16,
        start: u32,
        data: &[u8],
    ) -> S7Result<()> {
        let budget = self.write_payload_budget();
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(budget);
            let item = ByteSpanItem::write(
                area,
                db_number,
                start + offset as u32,
                data[offset..offset + chunk].to_vec(),
            );
            self.write_items(&[&item]).await?;
            offset += chunk;
        }
        Ok(())
    }

    /// Read a single bit, e.g. `DB10.DBX71.4`.
    pub async fn read_bit(
        &self,
        area: Area,
        db_number: u16,
        byte_address: u32,
        bit_index: u8,
    ) -> S7Result<bool> {
        let mut item = ValueItem::bit(area, db_number, byte_address, bit_index, false);
        self.read_items(&mut [&mut item]).await?;
        match item.value() {
            S7Value::Bool(v) => Ok(*v),
            _ => unreachable!("bit item always holds a Bool"),
        }
    }

    /// Write a single bit without touching its neighbors.
    pub async fn write_bit(
        &self,
        area: Area,
        db_number: u16,
        byte_address: u32,
        bit_index: u8,
        value: bool,
    ) -> S7Result<()> {
        let item = ValueItem::bit(area, db_number, byte_address, bit_index, value);
        self.write_items(&[&item]).await
    }

    /// Close the session. Outstanding requests complete with
    /// [`S7Error::SessionClosed`].
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// A response that violates the protocol past the framing layer leaves
    /// the stream in an unknown state; the session is torn down so other
    /// jobs fail with `SessionClosed` instead of misparsing.
    async fn teardown_on_fatal(&self, result: &S7Result<()>) {
        if let Err(e) = result {
            if e.is_fatal() {
                debug!(error = %e, "fatal response error, closing session");
                self.session.close().await;
            }
        }
    }

    /// Largest single-item read payload the negotiated PDU allows.
    fn read_payload_budget(&self) -> usize {
        (self.pdu_size() as usize)
            .saturating_sub(READ_RESPONSE_OVERHEAD)
            .max(1)
    }

    /// Largest single-item write payload the negotiated PDU allows.
    fn write_payload_budget(&self) -> usize {
        (self.pdu_size() as usize)
            .saturating_sub(WRITE_REQUEST_OVERHEAD)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn be16(buf: &[u8], offset: usize) -> u16 {
        u16::from_be_bytes([buf[offset], buf[offset + 1]])
    }

    async fn read_one_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.ok()?;
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut rest = vec![0u8; total - 4];
        stream.read_exact(&mut rest).await.ok()?;
        let mut frame = header.to_vec();
        frame.extend_from_slice(&rest);
        Some(frame)
    }

    fn ack_frame(reference: u16, parameters: &[u8], data: &[u8]) -> Vec<u8> {
        let total = 19 + parameters.len() + data.len();
        let mut frame = vec![0u8; total];
        frame[0] = 0x03;
        frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        frame[4] = 0x02;
        frame[5] = 0xF0;
        frame[6] = 0x80;
        frame[7] = 0x32;
        frame[8] = 0x03;
        frame[11..13].copy_from_slice(&reference.to_be_bytes());
        frame[13..15].copy_from_slice(&(parameters.len() as u16).to_be_bytes());
        frame[15..17].copy_from_slice(&(data.len() as u16).to_be_bytes());
        frame[19..19 + parameters.len()].copy_from_slice(parameters);
        frame[19 + parameters.len()..].copy_from_slice(data);
        frame
    }

    /// Mock PLC: serves the handshake, then answers read/write jobs.
    ///
    /// Behavior knobs encoded in the addressed DB number:
    /// - DB 99: the item fails with return code 0x05
    /// - DB 13: the whole request is silently dropped (never answered)
    /// - otherwise reads echo the DB number in the leading payload bytes
    async fn spawn_mock_plc(pdu_size: u16, jobs: u16) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            // COTP handshake
            let cr = read_one_frame(&mut stream).await.unwrap();
            assert_eq!(cr[5], 0xE0);
            let mut cc = vec![0u8; 22];
            cc[0] = 0x03;
            cc[2..4].copy_from_slice(&22u16.to_be_bytes());
            cc[4] = 0x11;
            cc[5] = 0xD0;
            stream.write_all(&cc).await.unwrap();

            // Communication setup
            let setup = read_one_frame(&mut stream).await.unwrap();
            assert_eq!(setup[17], 0xF0);
            let mut ack = vec![0u8; 27];
            ack[0] = 0x03;
            ack[2..4].copy_from_slice(&27u16.to_be_bytes());
            ack[4] = 0x02;
            ack[5] = 0xF0;
            ack[6] = 0x80;
            ack[7] = 0x32;
            ack[8] = 0x03;
            ack[13..15].copy_from_slice(&8u16.to_be_bytes());
            ack[19] = 0xF0;
            ack[21..23].copy_from_slice(&1u16.to_be_bytes());
            ack[23..25].copy_from_slice(&jobs.to_be_bytes());
            ack[25..27].copy_from_slice(&pdu_size.to_be_bytes());
            stream.write_all(&ack).await.unwrap();

            // Job loop
            while let Some(frame) = read_one_frame(&mut stream).await {
                let reference = be16(&frame, 11);
                let function = frame[17];
                let n = frame[18] as usize;

                let mut drop_request = false;
                let mut items = Vec::with_capacity(n);
                for i in 0..n {
                    let base = 19 + 12 * i;
                    let var_type = frame[base + 3];
                    let count = be16(&frame, base + 4);
                    let db = be16(&frame, base + 6);
                    if db == 13 {
                        drop_request = true;
                    }
                    items.push((var_type, count, db));
                }
                if drop_request {
                    continue;
                }

                let response = match function {
                    0x04 => {
                        let mut data = Vec::new();
                        for (i, &(var_type, count, db)) in items.iter().enumerate() {
                            if db == 99 {
                                data.extend_from_slice(&[0x05, 0x00, 0x00, 0x00]);
                            } else if var_type == 0x01 {
                                data.extend_from_slice(&[0xFF, 0x03, 0x00, 0x01, 0x01]);
                                if i + 1 < items.len() {
                                    data.push(0x00);
                                }
                            } else {
                                let size = count as usize;
                                data.extend_from_slice(&[0xFF, 0x04]);
                                data.extend_from_slice(&((size as u16) * 8).to_be_bytes());
                                let mut payload = vec![0u8; size];
                                let echo = db.to_be_bytes();
                                for (dst, src) in payload.iter_mut().zip(echo.iter().copied()) {
                                    *dst = src;
                                }
                                if size == 1 {
                                    payload[0] = echo[1];
                                }
                                data.extend_from_slice(&payload);
                                if size % 2 == 1 && i + 1 < items.len() {
                                    data.push(0x00);
                                }
                            }
                        }
                        ack_frame(reference, &[0x04, n as u8], &data)
                    }
                    0x05 => {
                        let codes: Vec<u8> = items
                            .iter()
                            .map(|&(_, _, db)| if db == 99 { 0x05 } else { 0xFF })
                            .collect();
                        ack_frame(reference, &[0x05, n as u8], &codes)
                    }
                    other => panic!("mock PLC got unexpected function 0x{other:02X}"),
                };
                if stream.write_all(&response).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    async fn connect_mock(pdu_size: u16, jobs: u16) -> S7Client {
        let addr = spawn_mock_plc(pdu_size, jobs).await;
        let config = S7ConnectionConfig::new(addr.ip().to_string())
            .with_port(addr.port())
            .with_request_timeout(Duration::from_secs(5));
        S7Client::connect(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_reports_negotiation() {
        let client = connect_mock(960, 8).await;
        assert_eq!(client.pdu_size(), 960);
        assert_eq!(client.max_concurrent_jobs(), 8);
        assert!(client.is_connected());
        client.close().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_read_typed_items() {
        let client = connect_mock(960, 4).await;

        // The mock echoes the DB number into the leading payload bytes.
        let mut word = ValueItem::db_word(9, 6);
        let mut dint = ValueItem::db_dint(21, 0);
        client
            .read_items(&mut [&mut word, &mut dint])
            .await
            .unwrap();
        assert_eq!(word.value(), &S7Value::Word(9));
        assert_eq!(dint.value(), &S7Value::DInt(21 << 16));
        client.close().await;
    }

    #[tokio::test]
    async fn test_read_item_error_aggregate() {
        let client = connect_mock(960, 4).await;

        let mut good = ValueItem::db_word(5, 0);
        let mut bad = ValueItem::db_word(99, 0);
        let err = client
            .read_items(&mut [&mut good, &mut bad])
            .await
            .unwrap_err();
        match err {
            S7Error::Items { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].item_index, 1);
                assert_eq!(failures[0].code, 0x05);
            }
            other => panic!("expected Items, got {other:?}"),
        }
        // The successful item was still delivered.
        assert_eq!(good.value(), &S7Value::Word(5));
        client.close().await;
    }

    #[tokio::test]
    async fn test_write_items() {
        let client = connect_mock(960, 4).await;

        let ok = ValueItem::new(Area::DataBlock, 3, 0, S7Value::Word(0x1234));
        client.write_items(&[&ok]).await.unwrap();

        let rejected = ValueItem::new(Area::DataBlock, 99, 0, S7Value::Word(1));
        let err = client.write_items(&[&ok, &rejected]).await.unwrap_err();
        match err {
            S7Error::Items { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].item_index, 1);
            }
            other => panic!("expected Items, got {other:?}"),
        }
        client.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_reads_within_job_budget() {
        let client = Arc::new(connect_mock(960, 4).await);

        let mut workers = Vec::new();
        for db in 1..=16u16 {
            let client = Arc::clone(&client);
            workers.push(tokio::spawn(async move {
                let mut item = ValueItem::db_word(db, 0);
                client.read_items(&mut [&mut item]).await.unwrap();
                assert_eq!(item.value(), &S7Value::Word(db));
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let stats = client.stats();
        assert_eq!(stats.requests_sent, 16);
        assert_eq!(stats.responses_received, 16);
        client.close().await;
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_usable() {
        let client = connect_mock(960, 4).await;

        // DB 13 is never answered by the mock.
        let mut silent = ValueItem::db_word(13, 0);
        let cancel = CancellationToken::new();
        let err = client
            .read_items_with(&mut [&mut silent], Duration::from_millis(150), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, S7Error::Timeout { timeout_ms: 150 }));

        // Other slots keep working.
        let mut item = ValueItem::db_word(2, 0);
        client.read_items(&mut [&mut item]).await.unwrap();
        assert_eq!(item.value(), &S7Value::Word(2));
        assert_eq!(client.stats().timeouts, 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_db_read_chunks_to_pdu_budget() {
        // PDU 60 → read payload budget 42 → 100 bytes take 3 requests.
        let client = connect_mock(60, 2).await;
        let data = client.db_read(1, 0, 100).await.unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(client.stats().requests_sent, 3);
        client.close().await;
    }

    #[tokio::test]
    async fn test_db_write_chunks_to_pdu_budget() {
        // PDU 60 → write payload budget 32 → 100 bytes take 4 requests.
        let client = connect_mock(60, 2).await;
        client.db_write(1, 0, &vec![0xAB; 100]).await.unwrap();
        assert_eq!(client.stats().requests_sent, 4);
        client.close().await;
    }

    #[tokio::test]
    async fn test_bit_helpers() {
        let client = connect_mock(960, 2).await;
        let value = client.read_bit(Area::DataBlock, 10, 71, 4).await.unwrap();
        assert!(value);
        client
            .write_bit(Area::Marker, 0, 10, 3, true)
            .await
            .unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let client = connect_mock(960, 2).await;
        client.close().await;
        let mut item = ValueItem::db_word(1, 0);
        let err = client.read_items(&mut [&mut item]).await.unwrap_err();
        assert!(matches!(err, S7Error::SessionClosed));
    }

    #[tokio::test]
    async fn test_empty_batches_are_noops() {
        let client = connect_mock(960, 2).await;
        client.read_items(&mut []).await.unwrap();
        client.write_items(&[]).await.unwrap();
        assert_eq!(client.stats().requests_sent, 0);
        client.close().await;
    }
}
