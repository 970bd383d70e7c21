//! # Voltage S7 - High-Performance Industrial S7 Library
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! An async Siemens S7 client (ISO-on-TCP, RFC 1006) in pure Rust for
//! industrial automation, IoT applications and smart grid systems. Talks to
//! S7-300/400/1200/1500 family PLCs on TCP port 102.
//!
//! ## Features
//!
//! - **Concurrent by design**: up to the negotiated number of jobs in
//!   flight over one TCP stream, correlated by PDU reference
//! - **Batched access**: many variables per request, per-item error
//!   reporting
//! - **Zero-copy framing**: requests and responses live in pooled,
//!   PDU-sized buffers negotiated with the CPU
//! - **Memory safe**: pure Rust, no unsafe code
//! - **Deadlines and cancellation**: per-request timeouts, user
//!   cancellation distinct from timeout
//!
//! ## Supported Address Spaces
//!
//! | Area | Code | Notation |
//! |------|------|----------|
//! | Process inputs | 0x81 | `I` / `E` |
//! | Process outputs | 0x82 | `Q` / `A` |
//! | Markers | 0x83 | `M` |
//! | Data blocks | 0x84 | `DB` |
//! | Counters | 0x1C | `C` / `Z` |
//! | Timers | 0x1D | `T` |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_s7::{S7Client, S7ConnectionConfig, CpuType, ValueItem, S7Result};
//!
//! #[tokio::main]
//! async fn main() -> S7Result<()> {
//!     // Connect to an S7-1500 at the conventional rack/slot
//!     let config = S7ConnectionConfig::new("192.168.0.10").with_cpu(CpuType::S71500);
//!     let client = S7Client::connect(config).await?;
//!     println!(
//!         "negotiated pdu_size={} max_jobs={}",
//!         client.pdu_size(),
//!         client.max_concurrent_jobs()
//!     );
//!
//!     // Read DB9.DBW6
//!     let mut speed = ValueItem::db_word(9, 6);
//!     client.read_items(&mut [&mut speed]).await?;
//!     println!("speed = {}", speed.value());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// S7 protocol constants and frame layout offsets
pub mod constants;

/// Wire codec for TPKT/COTP/S7 framing and read/write jobs
pub mod codec;

/// Address spaces and the `DataItem` capability
pub mod item;

/// Session establishment and negotiated parameters
pub mod session;

/// Concurrent request executor
pub mod executor;

/// Reusable PDU-sized buffer pool
pub mod pool;

/// Connection configuration and TSAP helpers
pub mod config;

/// High-level client
pub mod client;

/// Typed values and standard `DataItem` implementations
pub mod value;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_s7::tokio) ===
pub use tokio;

// === Core client API ===
pub use client::S7Client;
pub use config::{ConnectionType, CpuType, S7ConnectionConfig, Tsap};
pub use session::{S7Session, SessionParameters};

// === Error handling ===
pub use error::{ItemFailure, S7Error, S7Result};

// === Core types ===
pub use item::{Area, DataItem, TransportSize, VariableType};
pub use value::{ByteSpanItem, S7Value, ValueItem};

// === Monitoring ===
pub use executor::SessionStats;

// === Advanced usage ===
pub use executor::{RequestExecutor, Response};
pub use pool::{BufferPool, PooledBuffer};

// === Protocol defaults (commonly needed constants) ===
pub use constants::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS, REQUESTED_PDU_SIZE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage S7 v{} - High-performance industrial S7 library by Evan Liu",
        VERSION
    )
}
