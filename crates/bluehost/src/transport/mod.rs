//! Transport abstraction.
//!
//! The central and peripheral roles have different primitives, so there are
//! two traits: [`ClientTransport`] (scan, connect, raw ATT send/receive) and
//! [`ServerTransport`] (advertise, accept, ATT PDU exchange driven through
//! callbacks). Two implementations of each exist: an HCI/L2CAP socket
//! backend ([`socket`]) and an integrated-stack character-device backend
//! ([`chardev`]). The protocol engine is generic over the trait and never
//! sees which one it is running on.

pub mod chardev;
pub mod socket;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::gap::{AddressType, BdAddr};
use crate::scan::ad;
use crate::uuid::Uuid;

/// Errors surfaced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("controller unavailable")]
    Unavailable,

    #[error("already scanning")]
    AlreadyScanning,

    #[error("not scanning")]
    NotScanning,

    #[error("peer unreachable")]
    Unreachable,

    #[error("authentication failed")]
    AuthFailed,

    #[error("operation timed out")]
    Timeout,

    #[error("host stack not synchronized")]
    NotSynchronized,

    #[error("services can only be registered before the host is started")]
    ServicesLocked,

    #[error("invalid device address")]
    InvalidAddress,

    #[error("unknown connection {0}")]
    UnknownConnection(i32),

    #[error("advertising payload exceeds 31 bytes")]
    PayloadTooLong,

    #[error("advertisement buffer overflow")]
    BufferFull,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opaque connection identifier handed out by a client transport.
///
/// The socket transport uses the connection's file descriptor, the
/// integrated-stack transport a small allocated integer; callers must not
/// read meaning into the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) i32);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long `get_advertisements` may wait for at least one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately with whatever is buffered.
    NonBlocking,
    /// Wait up to this many milliseconds for at least one record.
    Millis(u32),
    /// Wait until a record arrives.
    Forever,
}

/// Scan filter policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPolicy {
    All,
    Whitelist,
}

/// Parameters for [`ClientTransport::start_scan`].
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// Active scanning sends scan requests; passive does not.
    pub active: bool,
    pub interval_ms: u16,
    pub window_ms: u16,
    pub filter_policy: FilterPolicy,
    /// Controller-side duplicate filtering.
    pub filter_duplicates: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        ScanParams {
            active: true,
            interval_ms: 10,
            window_ms: 10,
            filter_policy: FilterPolicy::All,
            filter_duplicates: true,
        }
    }
}

/// Converts milliseconds to the radio's 0.625 ms units, clamped to the HCI
/// legal range 0x0004..=0x4000.
pub(crate) fn ms_to_scan_slots(ms: u16) -> u16 {
    let slots = (ms as u32 * 1000 / 625) as u16;
    slots.clamp(0x0004, 0x4000)
}

/// Parameters for [`ClientTransport::connect`].
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub peer_address: BdAddr,
    pub peer_address_type: AddressType,
    /// Connection interval min, 1.25 ms units.
    pub min_interval: u16,
    /// Connection interval max, 1.25 ms units.
    pub max_interval: u16,
    pub latency: u16,
    /// Supervision timeout, 10 ms units.
    pub supervision_timeout: u16,
}

impl ConnectParams {
    pub fn new(peer_address: BdAddr, peer_address_type: AddressType) -> Self {
        ConnectParams {
            peer_address,
            peer_address_type,
            min_interval: 24,
            max_interval: 40,
            latency: 0,
            supervision_timeout: 400,
        }
    }
}

/// A raw advertising record handed out by a client transport; parsing of the
/// TLV payload happens in [`crate::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub address: BdAddr,
    pub address_type: AddressType,
    pub event_type: u8,
    pub rssi: i8,
    pub data: Vec<u8>,
}

/// Parameters for [`ServerTransport::start_advertising`].
#[derive(Debug, Clone)]
pub struct AdvertisingParams {
    pub device_name: String,
    pub service_uuids: Vec<Uuid>,
    pub appearance: u16,
    pub min_interval_ms: u16,
    pub max_interval_ms: u16,
    /// Raw advertising data; when empty a standard payload is synthesized.
    pub advertising_data: Vec<u8>,
    /// Raw scan response data; empty means none.
    pub scan_response_data: Vec<u8>,
}

impl Default for AdvertisingParams {
    fn default() -> Self {
        AdvertisingParams {
            device_name: String::new(),
            service_uuids: Vec::new(),
            appearance: 0,
            min_interval_ms: 100,
            max_interval_ms: 200,
            advertising_data: Vec::new(),
            scan_response_data: Vec::new(),
        }
    }
}

/// Flags value: LE general discoverable + BR/EDR not supported.
pub(crate) const ADV_FLAGS_GENERAL_DISC: u8 = 0x06;

/// Maximum legacy advertising payload.
pub(crate) const ADV_DATA_MAX: usize = 31;

impl AdvertisingParams {
    /// The advertising payload to put on air.
    ///
    /// A non-empty raw buffer is used as-is (bounded to 31 bytes). Otherwise
    /// a standard payload is synthesized: flags, then the complete 16-bit
    /// UUID list TLV for the UUIDs that fit, then the complete local name
    /// truncated to the remaining budget.
    pub fn advertising_payload(&self) -> Result<Vec<u8>, TransportError> {
        if !self.advertising_data.is_empty() {
            if self.advertising_data.len() > ADV_DATA_MAX {
                return Err(TransportError::PayloadTooLong);
            }
            return Ok(self.advertising_data.clone());
        }

        let mut data = Vec::with_capacity(ADV_DATA_MAX);
        data.extend_from_slice(&[0x02, ad::FLAGS, ADV_FLAGS_GENERAL_DISC]);

        let uuid16s: Vec<u16> = self
            .service_uuids
            .iter()
            .filter_map(|u| u.as_u16())
            .collect();
        if !uuid16s.is_empty() {
            // 2 bytes of TLV header per list; only UUIDs that fit go in.
            let room = (ADV_DATA_MAX - data.len()).saturating_sub(2);
            let count = (room / 2).min(uuid16s.len());
            if count > 0 {
                data.push(1 + 2 * count as u8);
                data.push(ad::COMPLETE_16BIT_UUIDS);
                for u in &uuid16s[..count] {
                    data.extend_from_slice(&u.to_le_bytes());
                }
            }
        }

        if !self.device_name.is_empty() {
            let room = (ADV_DATA_MAX - data.len()).saturating_sub(2);
            let name = self.device_name.as_bytes();
            let len = name.len().min(room);
            if len > 0 {
                data.push(1 + len as u8);
                data.push(ad::COMPLETE_LOCAL_NAME);
                data.extend_from_slice(&name[..len]);
            }
        }

        Ok(data)
    }

    /// The scan response payload, if any.
    pub fn scan_response_payload(&self) -> Result<Vec<u8>, TransportError> {
        if self.scan_response_data.len() > ADV_DATA_MAX {
            return Err(TransportError::PayloadTooLong);
        }
        Ok(self.scan_response_data.clone())
    }
}

/// Parameters reported when a server transport accepts a connection.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub conn_handle: u16,
    pub peer_address: BdAddr,
    pub peer_address_type: AddressType,
    pub mtu: u16,
}

type ConnectedFn = Box<dyn Fn(ConnectionParams) + Send + Sync>;
type DisconnectedFn = Box<dyn Fn(u16, u8) + Send + Sync>;
type DataReceivedFn = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

/// The three callbacks a server transport surfaces to the protocol engine.
///
/// The engine installs closures holding a non-owning handle back to itself;
/// during engine teardown they are replaced with no-ops before the transport
/// is dropped.
pub struct TransportCallbacks {
    pub on_connected: ConnectedFn,
    pub on_disconnected: DisconnectedFn,
    pub on_data_received: DataReceivedFn,
}

impl Default for TransportCallbacks {
    fn default() -> Self {
        TransportCallbacks {
            on_connected: Box::new(|_| {}),
            on_disconnected: Box::new(|_, _| {}),
            on_data_received: Box::new(|_, _| {}),
        }
    }
}

impl TransportCallbacks {
    pub fn noop() -> Self {
        Self::default()
    }
}

impl fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportCallbacks { .. }")
    }
}

/// Central-role transport: scanning, connecting, raw ATT PDU exchange.
pub trait ClientTransport {
    fn start_scan(&mut self, params: &ScanParams) -> Result<(), TransportError>;

    /// Idempotent; stopping an idle transport is not an error.
    fn stop_scan(&mut self) -> Result<(), TransportError>;

    fn is_scanning(&self) -> bool;

    /// Drains buffered advertising records. `Timeout::NonBlocking` returns
    /// immediately; otherwise the call waits up to the timeout for at least
    /// one record. Records accumulate between calls and are never silently
    /// dropped unless the internal buffer overflows (oldest first).
    fn get_advertisements(
        &mut self,
        timeout: Timeout,
    ) -> Result<Vec<RawAdvertisement>, TransportError>;

    /// Connects to a peer. Transport-enforced 30 second timeout.
    fn connect(&mut self, params: &ConnectParams) -> Result<ConnId, TransportError>;

    fn disconnect(&mut self, conn: ConnId) -> Result<(), TransportError>;

    /// Sends one complete ATT PDU. The PDU is never fragmented across send
    /// calls; a return value >= `data.len()` means it went out atomically.
    fn send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize, TransportError>;

    /// Receives inbound ATT bytes; 0 means nothing pending. The socket
    /// transport yields all inbound PDUs; the integrated-stack transport
    /// yields only server-initiated PDUs (notifications and indications)
    /// because request/response pairs are matched inside the stack. This
    /// asymmetry is part of the contract.
    fn receive(&mut self, conn: ConnId, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn get_mtu(&self, conn: ConnId) -> u16;

    fn set_mtu(&mut self, conn: ConnId, mtu: u16) -> Result<(), TransportError>;
}

/// Peripheral-role transport: advertising, accepting connections, ATT PDU
/// exchange with connected centrals.
pub trait ServerTransport {
    /// Idempotent: starting while already advertising succeeds.
    fn start_advertising(&mut self, params: &AdvertisingParams) -> Result<(), TransportError>;

    /// Idempotent.
    fn stop_advertising(&mut self) -> Result<(), TransportError>;

    fn is_advertising(&self) -> bool;

    /// Polls for one pending connection without blocking; completion is
    /// delivered through `on_connected`.
    fn accept_connection(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self, conn_handle: u16) -> Result<(), TransportError>;

    fn send_pdu(&mut self, conn_handle: u16, data: &[u8]) -> Result<usize, TransportError>;

    fn recv_pdu(&mut self, conn_handle: u16, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn set_mtu(&mut self, conn_handle: u16, mtu: u16) -> Result<(), TransportError>;

    fn get_mtu(&self, conn_handle: u16) -> u16;

    /// One turn of the internal event pump. Transports with a background
    /// reader thread make this a no-op; transports driven from the
    /// application's loop read inbound PDUs and fire callbacks here.
    fn process_events(&mut self) -> Result<(), TransportError>;

    fn set_callbacks(&mut self, callbacks: TransportCallbacks);

    /// Notification that the GATT database is final. Transports whose host
    /// stack must learn the services before starting (the integrated-stack
    /// backend) start their host task here; afterwards further registration
    /// fails with [`TransportError::ServicesLocked`].
    fn services_registered(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
