//! # S7 Wire Codec
//!
//! Encoding and decoding of every PDU the session and the read/write path
//! use: COTP connection setup, S7 communication setup, and batched variable
//! read/write jobs.
//!
//! All encoders write into a caller-supplied contiguous buffer at the fixed
//! offsets tabulated in [`crate::constants`]; every multibyte field is an
//! explicit big-endian access, never a native-endian reinterpretation. The
//! parsers validate each layer (TPKT → COTP → S7 header → parameters) before
//! touching the data region.
//!
//! ## Frame Layout
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0..4   | TPKT: version, reserved, total length |
//! | 4..7   | COTP DT: length=2, type=0xF0, EOT |
//! | 7..17  | S7 job header (`..19` for Ack-Data) |
//! | 17..   | Function parameters, then data |

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::config::Tsap;
use crate::constants::*;
use crate::error::{ItemFailure, S7Error, S7Result};
use crate::item::DataItem;
use crate::session::SessionParameters;

// ============================================================================
// Primitives
// ============================================================================

#[inline]
fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn put_be16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Patch the correlation id into an already encoded job request.
///
/// The encoders leave the `pdu_reference` slot zeroed; the executor owns
/// reference allocation and fills it in just before the frame hits the wire.
#[inline]
pub(crate) fn patch_pdu_reference(frame: &mut [u8], reference: u16) {
    put_be16(frame, PDU_REFERENCE_OFFSET, reference);
}

/// Extract the correlation id from a received frame.
#[inline]
pub(crate) fn pdu_reference(frame: &[u8]) -> u16 {
    be16(frame, PDU_REFERENCE_OFFSET)
}

/// Read exactly one TPKT-framed packet into `buf`, returning its length.
///
/// Validates the TPKT header before reading the remainder, so a corrupt
/// length field can never run the buffer over.
pub(crate) async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> S7Result<usize>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(&mut buf[..TPKT_HEADER_LEN]).await?;
    if buf[0] != TPKT_VERSION {
        return Err(S7Error::framing(format!(
            "invalid TPKT version 0x{:02X}",
            buf[0]
        )));
    }
    let total = be16(buf, 2) as usize;
    if total < FRAME_OVERHEAD {
        return Err(S7Error::framing(format!("TPKT length {total} too small")));
    }
    if total > buf.len() {
        return Err(S7Error::framing(format!(
            "frame of {total} bytes exceeds the {} byte buffer",
            buf.len()
        )));
    }
    reader.read_exact(&mut buf[TPKT_HEADER_LEN..total]).await?;
    Ok(total)
}

fn write_tpkt(buf: &mut [u8], total_len: usize) {
    buf[0] = TPKT_VERSION;
    buf[1] = 0x00;
    put_be16(buf, 2, total_len as u16);
}

fn write_cotp_dt(buf: &mut [u8]) {
    buf[4] = (COTP_DT_HEADER_LEN - 1) as u8;
    buf[5] = COTP_PDU_DATA;
    buf[6] = COTP_TPDU_NR_EOT;
}

fn write_job_header(buf: &mut [u8], parameter_length: u16, data_length: u16) {
    buf[S7_HEADER_OFFSET] = S7_PROTOCOL_ID;
    buf[S7_HEADER_OFFSET + 1] = MSG_JOB_REQUEST;
    put_be16(buf, S7_HEADER_OFFSET + 2, 0); // reserved
    put_be16(buf, PDU_REFERENCE_OFFSET, 0); // filled in by the executor
    put_be16(buf, S7_HEADER_OFFSET + 6, parameter_length);
    put_be16(buf, S7_HEADER_OFFSET + 8, data_length);
}

// ============================================================================
// Connection Setup (COTP CR/CC)
// ============================================================================

/// Encode a COTP Connection Request carrying the TSAP pair and a fixed
/// 1024-byte TPDU size hint. Returns the telegram length.
pub fn encode_connect_request(buf: &mut [u8], src_tsap: Tsap, dst_tsap: Tsap) -> S7Result<usize> {
    if buf.len() < CONNECT_REQUEST_LEN {
        return Err(S7Error::configuration("buffer too small for COTP CR"));
    }
    write_tpkt(buf, CONNECT_REQUEST_LEN);
    // Fixed COTP CR part: header length (everything after the length byte),
    // PDU type, dst/src references, class 0.
    buf[4] = (CONNECT_REQUEST_LEN - TPKT_HEADER_LEN - 1) as u8;
    buf[5] = COTP_PDU_CONNECT_REQUEST;
    put_be16(buf, 6, 0); // dst reference
    put_be16(buf, 8, 0); // src reference
    buf[10] = 0x00; // class + options
    // Parameter list: tpdu-size, src TSAP, dst TSAP.
    buf[11] = COTP_PARAM_TPDU_SIZE;
    buf[12] = 0x01;
    buf[13] = COTP_TPDU_SIZE_1024;
    buf[14] = COTP_PARAM_SRC_TSAP;
    buf[15] = 0x02;
    buf[16] = src_tsap.high();
    buf[17] = src_tsap.low();
    buf[18] = COTP_PARAM_DST_TSAP;
    buf[19] = 0x02;
    buf[20] = dst_tsap.high();
    buf[21] = dst_tsap.low();
    Ok(CONNECT_REQUEST_LEN)
}

/// Parse a COTP Connection Confirm. The parameter list is accepted without
/// further inspection; only the framing and the PDU type are validated.
pub fn parse_connect_confirm(frame: &[u8]) -> S7Result<()> {
    if frame.len() < 6 {
        return Err(S7Error::PartialRead {
            expected: 6,
            actual: frame.len(),
        });
    }
    if frame[0] != TPKT_VERSION {
        return Err(S7Error::framing(format!(
            "invalid TPKT version 0x{:02X}",
            frame[0]
        )));
    }
    if be16(frame, 2) as usize != frame.len() {
        return Err(S7Error::framing("TPKT length disagrees with frame length"));
    }
    if frame[5] != COTP_PDU_CONNECT_CONFIRM {
        return Err(S7Error::framing(format!(
            "expected COTP CC (0xD0), got 0x{:02X}",
            frame[5]
        )));
    }
    Ok(())
}

// ============================================================================
// Communication Setup
// ============================================================================

/// Encode the S7 communication setup job: AMQ 1/1 and a requested PDU size
/// of [`REQUESTED_PDU_SIZE`] bytes. Returns the telegram length.
pub fn encode_communication_setup(buf: &mut [u8]) -> S7Result<usize> {
    if buf.len() < SETUP_REQUEST_LEN {
        return Err(S7Error::configuration("buffer too small for setup job"));
    }
    write_tpkt(buf, SETUP_REQUEST_LEN);
    write_cotp_dt(buf);
    write_job_header(buf, 8, 0);
    let p = JOB_PARAMETERS_OFFSET;
    buf[p] = FUNCTION_SETUP;
    buf[p + 1] = 0x00; // reserved
    put_be16(buf, p + 2, REQUESTED_MAX_AMQ); // max AMQ calling
    put_be16(buf, p + 4, REQUESTED_MAX_AMQ); // max AMQ called
    put_be16(buf, p + 6, REQUESTED_PDU_SIZE);
    Ok(SETUP_REQUEST_LEN)
}

/// Parse the communication setup Ack-Data and extract the negotiated
/// session parameters: the granted PDU size and the max AMQ called, which
/// bounds the number of concurrently outstanding jobs.
pub fn parse_communication_setup_ack(frame: &[u8]) -> S7Result<SessionParameters> {
    validate_ack_frame(frame)?;
    if frame.len() < SETUP_RESPONSE_LEN {
        return Err(S7Error::PartialRead {
            expected: SETUP_RESPONSE_LEN,
            actual: frame.len(),
        });
    }
    let p = ACK_PARAMETERS_OFFSET;
    if frame[p] != FUNCTION_SETUP {
        return Err(S7Error::UnexpectedFunctionCode {
            expected: FUNCTION_SETUP,
            actual: frame[p],
        });
    }
    let max_amq_called = be16(frame, p + 4);
    let pdu_size = be16(frame, p + 6);
    if pdu_size == 0 || max_amq_called == 0 {
        return Err(S7Error::spec_violation(format!(
            "PLC negotiated pdu_size={pdu_size}, max_amq_called={max_amq_called}"
        )));
    }
    debug!(pdu_size, max_amq_called, "communication setup negotiated");
    Ok(SessionParameters {
        pdu_size,
        max_concurrent_jobs: max_amq_called,
    })
}

// ============================================================================
// Ack-Data Validation
// ============================================================================

/// Validate TPKT, COTP DT and the S7 Ack-Data header of a received frame,
/// including the length-field invariant
/// `parameter_length + data_length + header = payload`.
fn validate_ack_frame(frame: &[u8]) -> S7Result<()> {
    if frame.len() < ACK_PARAMETERS_OFFSET {
        return Err(S7Error::PartialRead {
            expected: ACK_PARAMETERS_OFFSET,
            actual: frame.len(),
        });
    }
    if frame[0] != TPKT_VERSION {
        return Err(S7Error::framing(format!(
            "invalid TPKT version 0x{:02X}",
            frame[0]
        )));
    }
    if be16(frame, 2) as usize != frame.len() {
        return Err(S7Error::framing("TPKT length disagrees with frame length"));
    }
    if frame[5] != COTP_PDU_DATA {
        return Err(S7Error::framing(format!(
            "expected COTP DT (0xF0), got 0x{:02X}",
            frame[5]
        )));
    }
    if frame[6] != COTP_TPDU_NR_EOT {
        return Err(S7Error::framing("fragmented COTP frame"));
    }
    if frame[S7_HEADER_OFFSET] != S7_PROTOCOL_ID {
        return Err(S7Error::framing(format!(
            "invalid S7 protocol id 0x{:02X}",
            frame[S7_HEADER_OFFSET]
        )));
    }
    if frame[S7_HEADER_OFFSET + 1] != MSG_ACK_DATA {
        return Err(S7Error::UnexpectedMessageType {
            expected: MSG_ACK_DATA,
            actual: frame[S7_HEADER_OFFSET + 1],
        });
    }
    let parameter_length = be16(frame, S7_HEADER_OFFSET + 6) as usize;
    let data_length = be16(frame, S7_HEADER_OFFSET + 8) as usize;
    if S7_ACK_HEADER_LEN + parameter_length + data_length != frame.len() - FRAME_OVERHEAD {
        return Err(S7Error::spec_violation(format!(
            "length fields disagree: header {S7_ACK_HEADER_LEN} + parameters \
             {parameter_length} + data {data_length} != payload {}",
            frame.len() - FRAME_OVERHEAD
        )));
    }
    let error_class = frame[S7_HEADER_OFFSET + 10];
    let error_code = frame[S7_HEADER_OFFSET + 11];
    if error_class != 0 || error_code != 0 {
        return Err(S7Error::spec_violation(format!(
            "PLC rejected the job: error class 0x{error_class:02X}, code 0x{error_code:02X}"
        )));
    }
    Ok(())
}

/// Shared validation of read/write Ack-Data down to the data region.
/// Returns the offset of the first data byte.
fn validate_rw_ack(frame: &[u8], function: u8, item_count: usize) -> S7Result<usize> {
    validate_ack_frame(frame)?;
    let parameter_length = be16(frame, S7_HEADER_OFFSET + 6);
    if parameter_length != 2 {
        return Err(S7Error::spec_violation(format!(
            "read/write ack parameter length {parameter_length}, expected 2"
        )));
    }
    let p = ACK_PARAMETERS_OFFSET;
    if frame[p] != function {
        return Err(S7Error::UnexpectedFunctionCode {
            expected: function,
            actual: frame[p],
        });
    }
    let received = frame[p + 1] as usize;
    if received != item_count {
        return Err(S7Error::ItemCountMismatch {
            requested: item_count,
            received,
        });
    }
    Ok(p + 2)
}

// ============================================================================
// Read
// ============================================================================

/// Validate that an item's bit span is representable in the 24-bit address
/// field of a request item.
fn check_item_span(index: usize, item: &dyn DataItem) -> S7Result<()> {
    let span = u32::from(item.read_count()) * item.variable_type().element_bits();
    let end = item.address().checked_add(span);
    match end {
        Some(end) if end <= MAX_BIT_ADDRESS => Ok(()),
        _ => Err(S7Error::spec_violation(format!(
            "item {index}: bit address {} + span {span} exceeds the 24-bit address space",
            item.address()
        ))),
    }
}

fn write_request_item(buf: &mut [u8], offset: usize, item: &dyn DataItem, count: u16) {
    buf[offset] = ITEM_SPECIFICATION;
    buf[offset + 1] = ITEM_LENGTH;
    buf[offset + 2] = ITEM_SYNTAX_ID;
    buf[offset + 3] = item.variable_type().to_u8();
    put_be16(buf, offset + 4, count);
    put_be16(buf, offset + 6, item.db_number());
    buf[offset + 8] = item.area().to_u8();
    let address = item.address();
    buf[offset + 9] = ((address >> 16) & 0xFF) as u8;
    buf[offset + 10] = ((address >> 8) & 0xFF) as u8;
    buf[offset + 11] = (address & 0xFF) as u8;
}

/// Encode a batched read job for `items` into `buf`, leaving the
/// `pdu_reference` slot zeroed. Returns the telegram length.
///
/// Fails with `SpecViolation` when the batch exceeds 255 items, an item's
/// address span is not representable, or the request does not fit into the
/// negotiated PDU size.
pub fn encode_read_request(
    buf: &mut [u8],
    items: &[&mut dyn DataItem],
    pdu_size: u16,
) -> S7Result<usize> {
    let n = items.len();
    if n == 0 || n > MAX_ITEMS_PER_REQUEST {
        return Err(S7Error::spec_violation(format!(
            "read batch of {n} items, supported range is 1..=255"
        )));
    }
    let parameter_length = 2 + REQUEST_ITEM_LEN * n;
    let total = JOB_PARAMETERS_OFFSET + parameter_length;
    if S7_JOB_HEADER_LEN + parameter_length > pdu_size as usize || total > buf.len() {
        return Err(S7Error::spec_violation(format!(
            "read request of {n} items does not fit into the negotiated PDU of {pdu_size} bytes"
        )));
    }

    write_tpkt(buf, total);
    write_cotp_dt(buf);
    write_job_header(buf, parameter_length as u16, 0);
    buf[JOB_PARAMETERS_OFFSET] = FUNCTION_READ;
    buf[JOB_PARAMETERS_OFFSET + 1] = n as u8;

    let mut offset = JOB_PARAMETERS_OFFSET + 2;
    for (index, item) in items.iter().enumerate() {
        let item: &dyn DataItem = &**item;
        check_item_span(index, item)?;
        write_request_item(buf, offset, item, item.read_count());
        offset += REQUEST_ITEM_LEN;
    }
    debug!(items = n, total, "encoded read request");
    Ok(total)
}

/// Wire transports that express their data-item `count` in bits rather than
/// bytes: Bit (0x03), Byte/Word/DWord (0x04) and Int (0x05). Everything
/// else (DInt, Real, octet string) counts bytes.
#[inline]
fn response_count_in_bytes(transport: u8) -> bool {
    !matches!(transport, 0x03..=0x05)
}

/// Parse a batched read Ack-Data and deliver each item's payload through
/// its [`DataItem::read_value`].
///
/// Successful items are delivered even when others fail; failures are
/// reported afterwards as one [`S7Error::Items`] aggregate keyed by item
/// index.
pub fn parse_read_response(frame: &[u8], items: &mut [&mut dyn DataItem]) -> S7Result<()> {
    if items.is_empty() {
        return Err(S7Error::spec_violation("read batch must not be empty"));
    }
    let mut pos = validate_rw_ack(frame, FUNCTION_READ, items.len())?;
    let mut failures = Vec::new();
    let last = items.len() - 1;

    for (index, item) in items.iter_mut().enumerate() {
        if pos + 4 > frame.len() {
            return Err(S7Error::PartialRead {
                expected: pos + 4,
                actual: frame.len(),
            });
        }
        let return_code = frame[pos];
        let transport = frame[pos + 1];
        let count = be16(frame, pos + 2) as usize;
        pos += 4;

        if return_code == RETURN_CODE_SUCCESS {
            let size = if response_count_in_bytes(transport) {
                count
            } else {
                count.div_ceil(8)
            };
            if pos + size > frame.len() {
                return Err(S7Error::PartialRead {
                    expected: pos + size,
                    actual: frame.len(),
                });
            }
            item.read_value(&frame[pos..pos + size])?;
            pos += size;
            // Items are padded to even boundaries, except after the last one.
            if size % 2 == 1 && index < last {
                pos += 1;
            }
        } else {
            failures.push(ItemFailure {
                item_index: index,
                code: return_code,
            });
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(S7Error::items(failures))
    }
}

// ============================================================================
// Write
// ============================================================================

/// Bytes an item is expected to serialize, derived from its element count
/// and word length. Used to budget the data region before invoking
/// [`DataItem::write_value`].
fn expected_write_bytes(item: &dyn DataItem) -> usize {
    let count = item.read_count() as usize;
    match item.variable_type().element_bits() {
        1 => 1,
        bits => count * (bits as usize / 8),
    }
}

/// Encode a batched write job for `items` into `buf`, leaving the
/// `pdu_reference` slot zeroed. Returns the telegram length.
///
/// The function parameters mirror the read layout with function code 0x05;
/// each request item's `count` carries the number of value bytes the item
/// produces. The data region holds one block per item: return code 0, the
/// item's transport size, the count (bits for bit transports, bytes
/// otherwise) and the serialized value, padded to an even boundary between
/// items.
pub fn encode_write_request(
    buf: &mut [u8],
    items: &[&dyn DataItem],
    pdu_size: u16,
) -> S7Result<usize> {
    let n = items.len();
    if n == 0 || n > MAX_ITEMS_PER_REQUEST {
        return Err(S7Error::spec_violation(format!(
            "write batch of {n} items, supported range is 1..=255"
        )));
    }
    let parameter_length = 2 + REQUEST_ITEM_LEN * n;

    // Budget the whole telegram up front so write_value can never run past
    // the negotiated PDU.
    let mut budget = JOB_PARAMETERS_OFFSET + parameter_length;
    for (index, item) in items.iter().enumerate() {
        check_item_span(index, *item)?;
        let bytes = expected_write_bytes(*item);
        budget += 4 + bytes;
        if bytes % 2 == 1 && index + 1 < n {
            budget += 1;
        }
    }
    if budget - FRAME_OVERHEAD > pdu_size as usize || budget > buf.len() {
        return Err(S7Error::spec_violation(format!(
            "write request of {n} items does not fit into the negotiated PDU of {pdu_size} bytes"
        )));
    }

    write_cotp_dt(buf);

    // Data region first: the request items need the produced byte counts.
    let data_start = JOB_PARAMETERS_OFFSET + parameter_length;
    let mut pos = data_start;
    let mut produced = Vec::with_capacity(n);
    for (index, item) in items.iter().enumerate() {
        let expected = expected_write_bytes(*item);
        let payload = pos + 4;
        let bytes = item.write_value(&mut buf[payload..payload + expected]);
        let transport = item.transport_size();
        buf[pos] = 0x00;
        buf[pos + 1] = transport.to_u8();
        let block_count = if transport.is_size_in_bytes() {
            bytes as u16
        } else {
            item.read_count()
        };
        put_be16(buf, pos + 2, block_count);
        pos = payload + bytes;
        if bytes % 2 == 1 && index + 1 < n {
            buf[pos] = 0x00;
            pos += 1;
        }
        produced.push(bytes as u16);
    }
    let data_length = pos - data_start;

    write_tpkt(buf, pos);
    write_job_header(buf, parameter_length as u16, data_length as u16);
    buf[JOB_PARAMETERS_OFFSET] = FUNCTION_WRITE;
    buf[JOB_PARAMETERS_OFFSET + 1] = n as u8;
    let mut offset = JOB_PARAMETERS_OFFSET + 2;
    for (item, bytes) in items.iter().zip(&produced) {
        write_request_item(buf, offset, *item, *bytes);
        offset += REQUEST_ITEM_LEN;
    }
    debug!(items = n, total = pos, "encoded write request");
    Ok(pos)
}

/// Parse a batched write Ack-Data: one return code per item, aggregated
/// into [`S7Error::Items`] when any item failed.
pub fn parse_write_response(frame: &[u8], item_count: usize) -> S7Result<()> {
    let pos = validate_rw_ack(frame, FUNCTION_WRITE, item_count)?;
    if pos + item_count > frame.len() {
        return Err(S7Error::PartialRead {
            expected: pos + item_count,
            actual: frame.len(),
        });
    }
    let failures: Vec<ItemFailure> = frame[pos..pos + item_count]
        .iter()
        .enumerate()
        .filter(|(_, &code)| code != RETURN_CODE_SUCCESS)
        .map(|(item_index, &code)| ItemFailure { item_index, code })
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(S7Error::items(failures))
    }
}
