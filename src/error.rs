//! Core error types and result handling
//!
//! Errors fall on two axes:
//!
//! - **Session-fatal errors**: the bytes on the wire violate the protocol
//!   (framing, unexpected message types, truncated frames) or the transport
//!   failed. The session is unusable afterwards; outstanding jobs are
//!   completed with [`S7Error::SessionClosed`].
//! - **Item errors**: one element of a batched request was rejected by the
//!   PLC. The operation still completes: successful items are delivered and
//!   the failures are reported as an aggregate keyed by item index.

use std::fmt;

use thiserror::Error;

/// Result type alias for S7 operations.
pub type S7Result<T> = Result<T, S7Error>;

/// A single failed element of a batched read or write.
///
/// The PLC answers every item of a request individually; `code` is the
/// per-item return code from the data section of the Ack-Data PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemFailure {
    /// Zero-based index of the item within the request.
    pub item_index: usize,
    /// S7 return code reported for this item.
    pub code: u8,
}

impl ItemFailure {
    /// Human-readable meaning of the return code.
    ///
    /// The interesting codes in practice:
    ///
    /// | Code | Meaning |
    /// |------|---------|
    /// | 0x03 | Access denied |
    /// | 0x05 | Address out of range (or the DB is optimized) |
    /// | 0x06 | Unsupported transport size |
    /// | 0x0A | Object does not exist (e.g. the DB is not loaded) |
    pub fn description(&self) -> &'static str {
        match self.code {
            0x01 => "hardware fault",
            0x03 => "access denied",
            0x05 => "address out of range",
            0x06 => "unsupported transport size",
            0x07 => "write data size mismatch",
            0x0A => "object does not exist",
            _ => "unspecified item error",
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "item {}: {} (code 0x{:02X})",
            self.item_index,
            self.description(),
            self.code
        )
    }
}

/// Error type covering every failure mode of the client.
#[derive(Debug, Error)]
pub enum S7Error {
    /// Underlying socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes on the wire violate TPKT/COTP framing.
    #[error("framing error: {message}")]
    Framing {
        /// What was malformed.
        message: String,
    },

    /// A well-framed message violates the S7 protocol rules.
    #[error("protocol violation: {message}")]
    SpecViolation {
        /// Which rule was violated.
        message: String,
    },

    /// The S7 header carried a message type other than the expected one.
    #[error("unexpected message type: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedMessageType {
        /// Message type we were waiting for.
        expected: u8,
        /// Message type found in the header.
        actual: u8,
    },

    /// The S7 parameters carried a function code other than the expected one.
    #[error("unexpected function code: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedFunctionCode {
        /// Function code we were waiting for.
        expected: u8,
        /// Function code found in the parameters.
        actual: u8,
    },

    /// A frame or data region ended before the announced length.
    #[error("partial read: needed {expected} bytes, got {actual}")]
    PartialRead {
        /// Bytes required by the announced length.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// The response carries a different number of items than the request.
    #[error("item count mismatch: requested {requested}, response carries {received}")]
    ItemCountMismatch {
        /// Items in the request.
        requested: usize,
        /// Items in the response.
        received: usize,
    },

    /// One or more items of a batched operation failed on the PLC.
    ///
    /// Successful items of the same batch have already been delivered.
    #[error("{} of the requested items failed: {}", failures.len(), DisplayFailures(failures.as_slice()))]
    Items {
        /// The failed items, in request order.
        failures: Vec<ItemFailure>,
    },

    /// The request-scoped deadline elapsed before the response arrived.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout {
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The caller canceled the request.
    #[error("request canceled")]
    Canceled,

    /// The session is closed or was torn down by a fatal error.
    #[error("session closed")]
    SessionClosed,

    /// Invalid client configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },
}

struct DisplayFailures<'a>(&'a [ItemFailure]);

impl fmt::Display for DisplayFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl S7Error {
    /// Create a framing error.
    pub fn framing(message: impl Into<String>) -> Self {
        S7Error::Framing {
            message: message.into(),
        }
    }

    /// Create a protocol violation error.
    pub fn spec_violation(message: impl Into<String>) -> Self {
        S7Error::SpecViolation {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        S7Error::Configuration {
            message: message.into(),
        }
    }

    /// Create an aggregate item error.
    pub fn items(failures: Vec<ItemFailure>) -> Self {
        S7Error::Items { failures }
    }

    /// Whether this error is fatal to the session.
    ///
    /// Fatal errors require opening a fresh session; item errors, timeouts
    /// and cancellations leave the session usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            S7Error::Io(_)
                | S7Error::Framing { .. }
                | S7Error::SpecViolation { .. }
                | S7Error::UnexpectedMessageType { .. }
                | S7Error::UnexpectedFunctionCode { .. }
                | S7Error::PartialRead { .. }
                | S7Error::ItemCountMismatch { .. }
                | S7Error::SessionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_failure_display() {
        let failure = ItemFailure {
            item_index: 1,
            code: 0x05,
        };
        let text = failure.to_string();
        assert!(text.contains("item 1"));
        assert!(text.contains("address out of range"));
        assert!(text.contains("0x05"));
    }

    #[test]
    fn test_items_aggregate_display() {
        let err = S7Error::items(vec![
            ItemFailure {
                item_index: 0,
                code: 0x0A,
            },
            ItemFailure {
                item_index: 2,
                code: 0x05,
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 of the requested items failed"));
        assert!(text.contains("item 0"));
        assert!(text.contains("item 2"));
    }

    #[test]
    fn test_fatality_axes() {
        assert!(S7Error::framing("bad TPKT").is_fatal());
        assert!(S7Error::SessionClosed.is_fatal());
        assert!(S7Error::ItemCountMismatch {
            requested: 2,
            received: 1
        }
        .is_fatal());

        assert!(!S7Error::items(vec![]).is_fatal());
        assert!(!S7Error::Timeout { timeout_ms: 500 }.is_fatal());
        assert!(!S7Error::Canceled.is_fatal());
    }
}
