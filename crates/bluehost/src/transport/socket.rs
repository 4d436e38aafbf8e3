//! HCI/L2CAP socket transport.
//!
//! Advertising and scanning are driven by HCI commands on a raw HCI socket;
//! ATT traffic rides on L2CAP SOCK_SEQPACKET sockets bound to CID 4, the ATT
//! fixed channel. Each accepted or initiated connection is one bidirectional
//! byte stream carrying whole ATT PDUs.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, info, warn};

use crate::gap::{AddressType, BdAddr};
use crate::hci::{
    HciCommand, HciSocket, ADV_CHANNEL_MAP_ALL, ADV_TYPE_ADV_IND, EVT_LE_META_EVENT,
    HCI_REASON_REMOTE_USER_TERMINATED,
};
use crate::scan::parse_le_meta_event;

use super::{
    ms_to_scan_slots, AdvertisingParams, ClientTransport, ConnId, ConnectParams, ConnectionParams,
    FilterPolicy, RawAdvertisement, ScanParams, ServerTransport, Timeout, TransportCallbacks,
    TransportError,
};

const AF_BLUETOOTH: i32 = 31;
const BTPROTO_L2CAP: i32 = 0;
const BDADDR_LE_PUBLIC: u8 = 0x01;

/// ATT fixed channel.
const ATT_CID: u16 = 0x0004;

/// HCI reason reported when the local host tears a link down.
const REASON_LOCAL_TERMINATED: u8 = 0x16;

/// Advertisements buffered between `get_advertisements` calls; oldest are
/// dropped past this.
const ADV_BUFFER_CAP: usize = 256;

const CONNECT_TIMEOUT_MS: i32 = 30_000;

#[repr(C)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

fn l2cap_sockaddr(addr: BdAddr, addr_type: u8) -> SockaddrL2 {
    SockaddrL2 {
        l2_family: AF_BLUETOOTH as libc::sa_family_t,
        l2_psm: 0,
        l2_bdaddr: addr.bytes,
        l2_cid: ATT_CID.to_le(),
        l2_bdaddr_type: addr_type,
    }
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<(), TransportError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

struct ServerConnection {
    fd: RawFd,
    peer_address: BdAddr,
    mtu: u16,
}

/// Peripheral-side socket transport.
pub struct SocketServerTransport {
    hci: HciSocket,
    listen_fd: RawFd,
    advertising: bool,
    next_conn_handle: u16,
    connections: HashMap<u16, ServerConnection>,
    callbacks: TransportCallbacks,
}

impl SocketServerTransport {
    /// Opens the HCI device and sets up the listening L2CAP socket.
    pub fn new(hci_dev_id: u16) -> Result<Self, TransportError> {
        let hci = HciSocket::open(hci_dev_id)?;

        let listen_fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) };
        if listen_fd < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }

        let addr = l2cap_sockaddr(BdAddr::ANY, BDADDR_LE_PUBLIC);
        let rc = unsafe {
            libc::bind(
                listen_fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(listen_fd) };
            return Err(TransportError::Io(err));
        }

        if unsafe { libc::listen(listen_fd, 5) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(listen_fd) };
            return Err(TransportError::Io(err));
        }
        set_nonblocking(listen_fd, true)?;

        info!(
            "L2CAP server listening on CID {} (fd={})",
            ATT_CID, listen_fd
        );
        Ok(SocketServerTransport {
            hci,
            listen_fd,
            advertising: false,
            next_conn_handle: 1,
            connections: HashMap::new(),
            callbacks: TransportCallbacks::noop(),
        })
    }

    fn drop_connection(&mut self, conn_handle: u16, reason: u8) {
        if let Some(conn) = self.connections.remove(&conn_handle) {
            unsafe { libc::close(conn.fd) };
            info!(
                "connection {} to {} closed (reason 0x{:02X})",
                conn_handle, conn.peer_address, reason
            );
            (self.callbacks.on_disconnected)(conn_handle, reason);
        }
    }
}

impl ServerTransport for SocketServerTransport {
    fn start_advertising(&mut self, params: &AdvertisingParams) -> Result<(), TransportError> {
        if self.advertising {
            debug!("already advertising");
            return Ok(());
        }

        self.hci.send_command(&HciCommand::LeSetAdvertisingParameters {
            min_interval: ms_to_scan_slots(params.min_interval_ms),
            max_interval: ms_to_scan_slots(params.max_interval_ms),
            advertising_type: ADV_TYPE_ADV_IND,
            own_address_type: 0x00,
            peer_address_type: 0x00,
            peer_address: [0; 6],
            channel_map: ADV_CHANNEL_MAP_ALL,
            filter_policy: 0x00,
        })?;

        self.hci.send_command(&HciCommand::LeSetAdvertisingData {
            data: params.advertising_payload()?,
        })?;

        let scan_rsp = params.scan_response_payload()?;
        if !scan_rsp.is_empty() {
            self.hci
                .send_command(&HciCommand::LeSetScanResponseData { data: scan_rsp })?;
        }

        self.hci
            .send_command(&HciCommand::LeSetAdvertisingEnable { enable: true })?;

        self.advertising = true;
        info!("advertising started: {:?}", params.device_name);
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), TransportError> {
        if !self.advertising {
            return Ok(());
        }
        self.hci
            .send_command(&HciCommand::LeSetAdvertisingEnable { enable: false })?;
        self.advertising = false;
        info!("advertising stopped");
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertising
    }

    fn accept_connection(&mut self) -> Result<(), TransportError> {
        let mut addr: SockaddrL2 = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<SockaddrL2>() as libc::socklen_t;

        let client_fd = unsafe {
            libc::accept(
                self.listen_fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if client_fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(()); // nothing pending
            }
            return Err(TransportError::Io(err));
        }

        let peer_address = BdAddr::new(addr.l2_bdaddr);
        let peer_address_type = if addr.l2_bdaddr_type == 0x02 {
            AddressType::Random
        } else {
            AddressType::Public
        };

        let conn_handle = self.next_conn_handle;
        self.next_conn_handle += 1;
        self.connections.insert(
            conn_handle,
            ServerConnection {
                fd: client_fd,
                peer_address,
                mtu: 23,
            },
        );

        info!("client connected: {} (handle={})", peer_address, conn_handle);
        (self.callbacks.on_connected)(ConnectionParams {
            conn_handle,
            peer_address,
            peer_address_type,
            mtu: 23,
        });
        Ok(())
    }

    fn disconnect(&mut self, conn_handle: u16) -> Result<(), TransportError> {
        if !self.connections.contains_key(&conn_handle) {
            return Err(TransportError::UnknownConnection(conn_handle as i32));
        }
        self.drop_connection(conn_handle, REASON_LOCAL_TERMINATED);
        Ok(())
    }

    fn send_pdu(&mut self, conn_handle: u16, data: &[u8]) -> Result<usize, TransportError> {
        let conn = self
            .connections
            .get(&conn_handle)
            .ok_or(TransportError::UnknownConnection(conn_handle as i32))?;

        // SOCK_SEQPACKET preserves message boundaries; one send is one PDU.
        let sent =
            unsafe { libc::send(conn.fd, data.as_ptr() as *const libc::c_void, data.len(), 0) };
        if sent < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        debug!("sent {} bytes to connection {}", sent, conn_handle);
        Ok(sent as usize)
    }

    fn recv_pdu(&mut self, conn_handle: u16, buf: &mut [u8]) -> Result<usize, TransportError> {
        let fd = self
            .connections
            .get(&conn_handle)
            .map(|c| c.fd)
            .ok_or(TransportError::UnknownConnection(conn_handle as i32))?;

        let received = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if received < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(TransportError::Io(err));
        }
        if received == 0 {
            self.drop_connection(conn_handle, HCI_REASON_REMOTE_USER_TERMINATED);
            return Ok(0);
        }
        Ok(received as usize)
    }

    fn set_mtu(&mut self, conn_handle: u16, mtu: u16) -> Result<(), TransportError> {
        let conn = self
            .connections
            .get_mut(&conn_handle)
            .ok_or(TransportError::UnknownConnection(conn_handle as i32))?;
        conn.mtu = mtu;
        Ok(())
    }

    fn get_mtu(&self, conn_handle: u16) -> u16 {
        self.connections
            .get(&conn_handle)
            .map(|c| c.mtu)
            .unwrap_or(23)
    }

    fn process_events(&mut self) -> Result<(), TransportError> {
        // Drain inbound ATT data from every live connection.
        let handles: Vec<u16> = self.connections.keys().copied().collect();
        let mut buf = [0u8; 512];
        for conn_handle in handles {
            loop {
                match self.recv_pdu(conn_handle, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => (self.callbacks.on_data_received)(conn_handle, &buf[..n]),
                    Err(e) => {
                        warn!("recv failed on connection {}: {}", conn_handle, e);
                        self.drop_connection(conn_handle, REASON_LOCAL_TERMINATED);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn set_callbacks(&mut self, callbacks: TransportCallbacks) {
        self.callbacks = callbacks;
    }
}

impl Drop for SocketServerTransport {
    fn drop(&mut self) {
        if self.advertising {
            let _ = self.stop_advertising();
        }
        for (_, conn) in self.connections.drain() {
            unsafe { libc::close(conn.fd) };
        }
        unsafe { libc::close(self.listen_fd) };
    }
}

struct ClientConnection {
    mtu: u16,
}

/// Central-side socket transport.
pub struct SocketClientTransport {
    hci: HciSocket,
    scanning: bool,
    pending: VecDeque<RawAdvertisement>,
    connections: HashMap<RawFd, ClientConnection>,
}

impl SocketClientTransport {
    pub fn new(hci_dev_id: u16) -> Result<Self, TransportError> {
        let hci = HciSocket::open(hci_dev_id)?;
        Ok(SocketClientTransport {
            hci,
            scanning: false,
            pending: VecDeque::new(),
            connections: HashMap::new(),
        })
    }

    /// Reads one HCI event (bounded by `timeout_ms`) and buffers any
    /// advertising reports it carried. Returns whether anything was read.
    fn pump_events(&mut self, timeout_ms: i32) -> Result<bool, TransportError> {
        let Some(event) = self.hci.read_event(Some(timeout_ms))? else {
            return Ok(false);
        };
        if event.event_code != EVT_LE_META_EVENT {
            return Ok(true);
        }

        match parse_le_meta_event(&event.parameters) {
            Ok(reports) => {
                for report in reports {
                    if self.pending.len() == ADV_BUFFER_CAP {
                        // Bounded buffer: oldest goes first.
                        self.pending.pop_front();
                    }
                    self.pending.push_back(report);
                }
            }
            Err(e) => {
                // Corrupt controller data fails this event only.
                warn!("dropping malformed advertising event: {}", e);
            }
        }
        Ok(true)
    }
}

impl ClientTransport for SocketClientTransport {
    fn start_scan(&mut self, params: &ScanParams) -> Result<(), TransportError> {
        if self.scanning {
            return Err(TransportError::AlreadyScanning);
        }

        self.hci.send_command(&HciCommand::LeSetScanParameters {
            scan_type: params.active as u8,
            scan_interval: ms_to_scan_slots(params.interval_ms),
            scan_window: ms_to_scan_slots(params.window_ms),
            own_address_type: 0x00,
            filter_policy: match params.filter_policy {
                FilterPolicy::All => 0x00,
                FilterPolicy::Whitelist => 0x01,
            },
        })?;
        self.hci.set_le_event_filter()?;
        self.hci.send_command(&HciCommand::LeSetScanEnable {
            enable: true,
            filter_duplicates: params.filter_duplicates,
        })?;

        self.scanning = true;
        self.pending.clear();
        info!("BLE scanning started");
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        if !self.scanning {
            return Ok(());
        }
        self.hci.send_command(&HciCommand::LeSetScanEnable {
            enable: false,
            filter_duplicates: false,
        })?;
        self.scanning = false;
        info!("BLE scanning stopped");
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn get_advertisements(
        &mut self,
        timeout: Timeout,
    ) -> Result<Vec<RawAdvertisement>, TransportError> {
        if !self.scanning {
            return Err(TransportError::NotScanning);
        }

        // Drain whatever the controller already delivered.
        while self.pump_events(0)? {}

        // Then wait for at least one record if the caller asked to.
        if self.pending.is_empty() {
            match timeout {
                Timeout::NonBlocking => {}
                Timeout::Millis(ms) => {
                    self.pump_events(ms as i32)?;
                    while self.pump_events(0)? {}
                }
                Timeout::Forever => {
                    while self.pending.is_empty() {
                        self.pump_events(-1)?;
                    }
                    while self.pump_events(0)? {}
                }
            }
        }

        Ok(self.pending.drain(..).collect())
    }

    fn connect(&mut self, params: &ConnectParams) -> Result<ConnId, TransportError> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) };
        if fd < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }

        let addr = l2cap_sockaddr(
            params.peer_address,
            match params.peer_address_type {
                AddressType::Public => BDADDR_LE_PUBLIC,
                AddressType::Random => 0x02,
            },
        );

        // Non-blocking connect so the 30 second timeout can be enforced
        // with poll.
        set_nonblocking(fd, true)?;
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe { libc::close(fd) };
                return Err(map_connect_error(err));
            }

            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pollfd, 1, CONNECT_TIMEOUT_MS) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(TransportError::Io(err));
            }
            if rc == 0 {
                unsafe { libc::close(fd) };
                return Err(TransportError::Timeout);
            }

            let mut so_error: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut so_error as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 || so_error != 0 {
                unsafe { libc::close(fd) };
                return Err(map_connect_error(std::io::Error::from_raw_os_error(
                    so_error,
                )));
            }
        }
        set_nonblocking(fd, false)?;

        self.connections.insert(fd, ClientConnection { mtu: 23 });
        info!("connected to {} (fd={})", params.peer_address, fd);
        Ok(ConnId(fd))
    }

    fn disconnect(&mut self, conn: ConnId) -> Result<(), TransportError> {
        self.connections
            .remove(&conn.0)
            .ok_or(TransportError::UnknownConnection(conn.0))?;
        unsafe { libc::close(conn.0) };
        info!("disconnected fd={}", conn.0);
        Ok(())
    }

    fn send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connections.contains_key(&conn.0) {
            return Err(TransportError::UnknownConnection(conn.0));
        }
        let sent =
            unsafe { libc::send(conn.0, data.as_ptr() as *const libc::c_void, data.len(), 0) };
        if sent < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(sent as usize)
    }

    fn receive(&mut self, conn: ConnId, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.connections.contains_key(&conn.0) {
            return Err(TransportError::UnknownConnection(conn.0));
        }
        let received = unsafe {
            libc::recv(
                conn.0,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if received < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(TransportError::Io(err));
        }
        if received == 0 {
            // Peer closed; the next explicit disconnect cleans the map up.
            debug!("connection fd={} closed by peer", conn.0);
        }
        Ok(received as usize)
    }

    fn get_mtu(&self, conn: ConnId) -> u16 {
        self.connections.get(&conn.0).map(|c| c.mtu).unwrap_or(23)
    }

    fn set_mtu(&mut self, conn: ConnId, mtu: u16) -> Result<(), TransportError> {
        let c = self
            .connections
            .get_mut(&conn.0)
            .ok_or(TransportError::UnknownConnection(conn.0))?;
        c.mtu = mtu;
        Ok(())
    }
}

fn map_connect_error(err: std::io::Error) -> TransportError {
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => TransportError::Timeout,
        Some(libc::ECONNREFUSED) | Some(libc::EHOSTDOWN) | Some(libc::EHOSTUNREACH) => {
            TransportError::Unreachable
        }
        Some(libc::EACCES) | Some(libc::EPERM) => TransportError::AuthFailed,
        _ => TransportError::Io(err),
    }
}

impl Drop for SocketClientTransport {
    fn drop(&mut self) {
        if self.scanning {
            let _ = self.stop_scan();
        }
        for (fd, _) in self.connections.drain() {
            unsafe { libc::close(fd) };
        }
    }
}
