//! # Connection Configuration
//!
//! User-facing configuration for opening an S7 session: host, port, TSAP
//! pair and timeouts, with helpers that derive the remote TSAP from the
//! CPU family, rack and slot the way engineering tools do.
//!
//! ## Typical TSAPs
//!
//! | CPU | Rack | Slot |
//! |-----|------|------|
//! | S7-300 | 0 | 2 |
//! | S7-400 | varies | varies |
//! | S7-1200/1500 | 0 | 0 or 1 |

use std::time::Duration;

use crate::constants::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS};
use crate::error::{S7Error, S7Result};

/// A 2-byte Transport Service Access Point.
///
/// TSAPs select the communication endpoint within the COTP connection
/// request; a session is parameterized by a (local, remote) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tsap {
    high: u8,
    low: u8,
}

impl Tsap {
    /// TSAP from its two bytes.
    #[inline]
    pub fn new(high: u8, low: u8) -> Self {
        Self { high, low }
    }

    /// High byte.
    #[inline]
    pub fn high(&self) -> u8 {
        self.high
    }

    /// Low byte.
    #[inline]
    pub fn low(&self) -> u8 {
        self.low
    }
}

impl From<u16> for Tsap {
    fn from(value: u16) -> Self {
        Self::new((value >> 8) as u8, (value & 0xFF) as u8)
    }
}

impl From<Tsap> for u16 {
    fn from(tsap: Tsap) -> Self {
        (u16::from(tsap.high) << 8) | u16::from(tsap.low)
    }
}

/// How the client announces itself in the remote TSAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    /// As a programming device (default).
    Pg = 0x01,
    /// As an HMI / operator panel.
    Op = 0x02,
    /// As a generic S7 communication partner.
    Basic = 0x03,
}

/// CPU family, used to pick the conventional rack/slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    /// S7-300: CPU is always at rack 0, slot 2.
    S7300,
    /// S7-400: rack and slot come from the hardware configuration.
    S7400,
    /// S7-1200: rack 0, slot 0.
    S71200,
    /// S7-1500: rack 0, slot 0.
    S71500,
}

impl CpuType {
    /// Conventional (rack, slot) for this family.
    fn default_rack_slot(self) -> (u8, u8) {
        match self {
            CpuType::S7300 => (0, 2),
            CpuType::S7400 => (0, 3),
            CpuType::S71200 | CpuType::S71500 => (0, 0),
        }
    }
}

/// Configuration of one S7 session.
///
/// # Example
///
/// ```rust
/// use voltage_s7::{CpuType, S7ConnectionConfig};
/// use std::time::Duration;
///
/// let config = S7ConnectionConfig::new("192.168.0.10")
///     .with_cpu(CpuType::S71500)
///     .with_request_timeout(Duration::from_secs(2));
/// assert_eq!(config.port, 102);
/// ```
#[derive(Debug, Clone)]
pub struct S7ConnectionConfig {
    /// PLC host name or IP address.
    pub host: String,
    /// TCP port, 102 unless the PLC sits behind NAT.
    pub port: u16,
    /// Local TSAP announced in the COTP connection request.
    pub local_tsap: Tsap,
    /// Remote TSAP of the PLC.
    pub remote_tsap: Tsap,
    /// Deadline for TCP connect and each handshake exchange.
    pub connect_timeout: Duration,
    /// Default deadline for read/write requests.
    pub request_timeout: Duration,
}

impl S7ConnectionConfig {
    /// Configuration for `host` with PG access to rack 0, slot 0
    /// (S7-1200/1500 convention) and default timeouts.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_TCP_PORT,
            local_tsap: Tsap::new(0x01, 0x00),
            remote_tsap: remote_tsap(ConnectionType::Pg, 0, 0),
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Use the conventional rack/slot of a CPU family.
    pub fn with_cpu(self, cpu: CpuType) -> Self {
        let (rack, slot) = cpu.default_rack_slot();
        self.with_rack_slot(rack, slot)
    }

    /// Address a CPU at an explicit rack and slot (PG connection).
    pub fn with_rack_slot(mut self, rack: u8, slot: u8) -> Self {
        self.remote_tsap = remote_tsap(ConnectionType::Pg, rack, slot);
        self
    }

    /// Address a CPU at an explicit rack and slot with a chosen
    /// connection type.
    pub fn with_connection_type(mut self, kind: ConnectionType, rack: u8, slot: u8) -> Self {
        self.remote_tsap = remote_tsap(kind, rack, slot);
        self
    }

    /// Set both TSAPs explicitly (LOGO!, S7-200 and exotic hardware).
    pub fn with_tsaps(mut self, local: Tsap, remote: Tsap) -> Self {
        self.local_tsap = local;
        self.remote_tsap = remote;
        self
    }

    /// Override the TCP port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the connect/handshake deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the default request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validate the configuration before connecting.
    pub fn validate(&self) -> S7Result<()> {
        if self.host.is_empty() {
            return Err(S7Error::configuration("host must not be empty"));
        }
        if self.port == 0 {
            return Err(S7Error::configuration("port must not be 0"));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(S7Error::configuration("timeouts must be greater than 0"));
        }
        Ok(())
    }
}

/// Remote TSAP from connection type, rack and slot:
/// high byte is the connection type, low byte packs rack and slot.
fn remote_tsap(kind: ConnectionType, rack: u8, slot: u8) -> Tsap {
    Tsap::new(kind as u8, (rack << 5) | (slot & 0x1F))
}
