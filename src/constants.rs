//! S7 protocol constants and frame layout offsets
//!
//! The S7 protocol nests four layers on the wire:
//! TPKT (RFC 1006) → COTP (ISO 8073) → S7 header → function parameters/data.
//! All multibyte integers are big-endian. The offsets below are the single
//! source of truth shared by the encoders and parsers in [`crate::codec`].

// ============================================================================
// Frame Layout
// ============================================================================

/// TPKT header length: version(1) + reserved(1) + length(2) = 4 bytes.
/// The length field counts the entire packet, header included.
pub const TPKT_HEADER_LEN: usize = 4;

/// RFC 1006 version identifier, first byte of every frame.
pub const TPKT_VERSION: u8 = 0x03;

/// COTP Data (DT) header: length(1) + pdu_type(1) + tpdu_nr(1) = 3 bytes.
pub const COTP_DT_HEADER_LEN: usize = 3;

/// Lower-layer overhead on every data frame: TPKT (4) + COTP DT (3).
///
/// The negotiated PDU size does not include this overhead, so a buffer able
/// to hold any frame needs `pdu_size + FRAME_OVERHEAD` bytes.
pub const FRAME_OVERHEAD: usize = TPKT_HEADER_LEN + COTP_DT_HEADER_LEN;

/// S7 header length for job requests: protocol_id(1) + message_type(1) +
/// reserved(2) + pdu_reference(2) + parameter_length(2) + data_length(2).
pub const S7_JOB_HEADER_LEN: usize = 10;

/// S7 header length for Ack-Data: the job header plus error_class(1) +
/// error_code(1).
pub const S7_ACK_HEADER_LEN: usize = 12;

/// Absolute offset of the S7 header within a data frame.
pub const S7_HEADER_OFFSET: usize = FRAME_OVERHEAD;

/// Absolute offset of the 16-bit `pdu_reference` field: the executor patches
/// the correlation id here, the reader extracts it here.
/// = FRAME_OVERHEAD + protocol_id(1) + message_type(1) + reserved(2).
pub const PDU_REFERENCE_OFFSET: usize = 11;

/// Absolute offset of the function parameters in a job request frame.
pub const JOB_PARAMETERS_OFFSET: usize = FRAME_OVERHEAD + S7_JOB_HEADER_LEN;

/// Absolute offset of the function parameters in an Ack-Data frame.
pub const ACK_PARAMETERS_OFFSET: usize = FRAME_OVERHEAD + S7_ACK_HEADER_LEN;

// ============================================================================
// COTP
// ============================================================================

/// COTP PDU type: Connection Request.
pub const COTP_PDU_CONNECT_REQUEST: u8 = 0xE0;

/// COTP PDU type: Connection Confirm.
pub const COTP_PDU_CONNECT_CONFIRM: u8 = 0xD0;

/// COTP PDU type: Data.
pub const COTP_PDU_DATA: u8 = 0xF0;

/// COTP DT TPDU number with the end-of-transmission bit set.
/// This client never fragments, so every DT frame carries it.
pub const COTP_TPDU_NR_EOT: u8 = 0x80;

/// COTP CR parameter code: requested TPDU size (value is log2 of the size).
pub const COTP_PARAM_TPDU_SIZE: u8 = 0xC0;

/// COTP CR parameter code: source TSAP.
pub const COTP_PARAM_SRC_TSAP: u8 = 0xC1;

/// COTP CR parameter code: destination TSAP.
pub const COTP_PARAM_DST_TSAP: u8 = 0xC2;

/// TPDU size hint sent in the Connection Request: log2(1024).
pub const COTP_TPDU_SIZE_1024: u8 = 0x0A;

/// Total length of the Connection Request telegram:
/// TPKT(4) + fixed COTP CR part(7) + tpdu-size TLV(3) + two TSAP TLVs(4 each).
pub const CONNECT_REQUEST_LEN: usize = 22;

// ============================================================================
// S7 Header
// ============================================================================

/// S7 protocol identifier, first byte of every S7 header.
pub const S7_PROTOCOL_ID: u8 = 0x32;

/// S7 message type: job request (client → PLC).
pub const MSG_JOB_REQUEST: u8 = 0x01;

/// S7 message type: Ack-Data (PLC → client).
pub const MSG_ACK_DATA: u8 = 0x03;

// ============================================================================
// S7 Functions
// ============================================================================

/// Function code: read variables.
pub const FUNCTION_READ: u8 = 0x04;

/// Function code: write variables.
pub const FUNCTION_WRITE: u8 = 0x05;

/// Function code: communication setup (PDU/AMQ negotiation).
pub const FUNCTION_SETUP: u8 = 0xF0;

/// Request item header: specification byte (variable specification).
pub const ITEM_SPECIFICATION: u8 = 0x12;

/// Request item header: length of the remainder of the item.
pub const ITEM_LENGTH: u8 = 0x0A;

/// Request item header: syntax id for any-type addressing.
pub const ITEM_SYNTAX_ID: u8 = 0x10;

/// Size of one request item within read/write parameters.
pub const REQUEST_ITEM_LEN: usize = 12;

/// The item count field is a single byte.
pub const MAX_ITEMS_PER_REQUEST: usize = 255;

/// Per-item return code signalling success in Ack-Data.
pub const RETURN_CODE_SUCCESS: u8 = 0xFF;

/// The request item address field is 24 bits wide; a valid item must fit its
/// whole bit span below this bound.
pub const MAX_BIT_ADDRESS: u32 = 1 << 24;

// ============================================================================
// Negotiation
// ============================================================================

/// Communication setup telegram length:
/// TPKT(4) + COTP DT(3) + S7 job header(10) + setup parameters(8).
pub const SETUP_REQUEST_LEN: usize = 25;

/// Communication setup Ack-Data telegram length:
/// TPKT(4) + COTP DT(3) + S7 ack header(12) + setup parameters(8).
pub const SETUP_RESPONSE_LEN: usize = 27;

/// PDU size requested during communication setup. The PLC answers with the
/// size it actually grants, which is what the session stores.
pub const REQUESTED_PDU_SIZE: u16 = 1920;

/// Max AMQ (parallel jobs) requested for both directions during setup.
pub const REQUESTED_MAX_AMQ: u16 = 1;

// ============================================================================
// Defaults
// ============================================================================

/// S7 communication uses ISO-on-TCP on this port.
pub const DEFAULT_TCP_PORT: u16 = 102;

/// Default request deadline in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
