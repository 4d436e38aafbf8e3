//! Integrated-stack transport over a character-device ioctl interface.
//!
//! A single char device exposes six ioctl commands (coexist start/stop,
//! advertising data, advertising start, scan response data, HCI packet
//! transmit). Asynchronous events are announced with SIGIO; the handler does
//! nothing but an 8-byte write to an eventfd (the async-signal-safe stand-in
//! for `sem_post`), and a dedicated reader thread drains the kernel queue
//! until its `list_empty` flag is set, routing HCI events into the engine
//! callbacks.
//!
//! Initialization order matters: open device and install the handler, then
//! register GATT services, then start the host (which eventually reports
//! synchronized), and only then accept commands that need a live controller.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::RngCore;

use crate::gap::{AddressType, BdAddr};
use crate::hci::{
    EVT_CMD_COMPLETE, EVT_CMD_STATUS, EVT_CONN_COMPLETE, EVT_DISCONN_COMPLETE,
    EVT_LE_ADVERTISING_REPORT, EVT_LE_CONN_COMPLETE, EVT_LE_META_EVENT,
    HCI_REASON_REMOTE_USER_TERMINATED,
};
use crate::scan::parse_le_meta_event;

use super::{
    ms_to_scan_slots, AdvertisingParams, ClientTransport, ConnId, ConnectParams, ConnectionParams,
    RawAdvertisement, ScanParams, ServerTransport, Timeout, TransportCallbacks, TransportError,
};

/// Default device node.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/ble_ioctl";

// ioctl commands: _IOW(121, n, unsigned int)
const IOCTL_TYPE: u32 = 121;
const IOC_WRITE: u32 = 1;

const fn iow(nr: u32) -> libc::c_ulong {
    ((IOC_WRITE << 30) | ((std::mem::size_of::<u32>() as u32) << 16) | (IOCTL_TYPE << 8) | nr)
        as libc::c_ulong
}

const IOCTL_COEXIST_START: libc::c_ulong = iow(0);
const IOCTL_COEXIST_STOP: libc::c_ulong = iow(1);
const IOCTL_SET_ADV_DATA: libc::c_ulong = iow(2);
const IOCTL_ADV_START: libc::c_ulong = iow(3);
const IOCTL_SET_RESP_DATA: libc::c_ulong = iow(4);
const IOCTL_TX_HCI_PACKET: libc::c_ulong = iow(5);

// Framing message ids inside the event buffer.
const MSG_ID_BLE_EVENT: u16 = 0xC01;
const MSG_ID_BLE_ACK: u16 = 0xC02;

// HCI packet type bytes used on the tx-hci-packet path.
const HIF_PKT_CMD: u8 = 0x01;
const HIF_PKT_ACL: u8 = 0x02;
const HIF_PKT_EVT: u8 = 0x04;

const EVENT_BUFFER_LEN: usize = 512;

/// Wait bound on the host-synchronized latch during startup.
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-enforced connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered advertisements; oldest dropped past this.
const ADV_BUFFER_CAP: usize = 256;

/// One framed record read from the device.
#[repr(C)]
struct EventRecord {
    kind: u8,
    driver_mode: u8,
    /// 1 when the kernel queue is drained.
    list_empty: u8,
    buffer: [u8; EVENT_BUFFER_LEN],
}

/// The eventfd the SIGIO handler posts to. One device instance owns the
/// handler at a time, from `install` to `uninstall`, both under
/// `INSTALL_LOCK`.
static SIGNAL_EVENT_FD: AtomicI32 = AtomicI32::new(-1);
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// SIGIO handler: strictly an atomic load and a write. Nothing here may
/// allocate or take locks.
extern "C" fn sigio_handler(_sig: libc::c_int) {
    let fd = SIGNAL_EVENT_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let val: u64 = 1;
        unsafe {
            libc::write(fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

/// Synchronization latch posted once when the host stack reports ready.
struct SyncLatch {
    state: Mutex<bool>,
    cv: Condvar,
}

impl SyncLatch {
    fn new() -> Self {
        SyncLatch {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut synced = self.state.lock().unwrap();
        if !*synced {
            *synced = true;
            self.cv.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let synced = self.state.lock().unwrap();
        let (synced, _) = self
            .cv
            .wait_timeout_while(synced, timeout, |s| !*s)
            .unwrap();
        *synced
    }

    fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }
}

/// The shared device: ioctl fd, its serialization lock, and the eventfd the
/// signal handler posts.
struct Device {
    fd: RawFd,
    event_fd: RawFd,
    /// Every ioctl goes through this; the kernel interface is not
    /// reentrant.
    ioctl_lock: Mutex<()>,
}

impl Device {
    fn open(path: &str) -> Result<Self, TransportError> {
        let cpath = std::ffi::CString::new(path).map_err(|_| TransportError::InvalidAddress)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }

        let event_fd = unsafe { libc::eventfd(0, 0) };
        if event_fd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Io(err));
        }

        unsafe {
            // Async IO delivery plus close-on-exec, then the handler.
            libc::fcntl(fd, libc::F_SETOWN, libc::getpid());
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC);
            let fdflags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
        }

        {
            let _guard = INSTALL_LOCK.lock().unwrap();
            SIGNAL_EVENT_FD.store(event_fd, Ordering::SeqCst);
            unsafe {
                let mut sa: libc::sigaction = std::mem::zeroed();
                sa.sa_sigaction = sigio_handler as libc::sighandler_t;
                sa.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut sa.sa_mask);
                libc::sigaction(libc::SIGIO, &sa, std::ptr::null_mut());
            }
        }

        info!("opened integrated-stack device {} (fd={})", path, fd);
        Ok(Device {
            fd,
            event_fd,
            ioctl_lock: Mutex::new(()),
        })
    }

    fn ioctl(&self, cmd: libc::c_ulong, buf: &[u8]) -> Result<(), TransportError> {
        let _guard = self.ioctl_lock.lock().unwrap();
        let rc = unsafe { libc::ioctl(self.fd, cmd, buf.as_ptr()) };
        if rc < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Sends a raw HCI command packet through the tx-hci-packet ioctl:
    /// `[total_len u16][0x01][command bytes]`.
    fn send_hci_command(&self, cmd: &[u8]) -> Result<(), TransportError> {
        let mut packet = Vec::with_capacity(3 + cmd.len());
        let total_len = (cmd.len() + 1) as u16;
        packet.extend_from_slice(&total_len.to_le_bytes());
        packet.push(HIF_PKT_CMD);
        packet.extend_from_slice(cmd);
        self.ioctl(IOCTL_TX_HCI_PACKET, &packet)
    }

    /// Sends an ATT PDU as an ACL data packet on the ATT fixed channel:
    /// `[total_len][0x02][handle+flags][acl len][l2cap len][cid 4][pdu]`.
    fn send_att_pdu(&self, conn_handle: u16, pdu: &[u8]) -> Result<(), TransportError> {
        let acl_len = (4 + pdu.len()) as u16;
        let total_len = (1 + 4 + 4 + pdu.len()) as u16;

        let mut packet = Vec::with_capacity(2 + total_len as usize);
        packet.extend_from_slice(&total_len.to_le_bytes());
        packet.push(HIF_PKT_ACL);
        packet.push((conn_handle & 0xFF) as u8);
        packet.push(((conn_handle >> 8) & 0x0F) as u8);
        packet.extend_from_slice(&acl_len.to_le_bytes());
        packet.extend_from_slice(&(pdu.len() as u16).to_le_bytes());
        packet.extend_from_slice(&0x0004u16.to_le_bytes());
        packet.extend_from_slice(pdu);
        self.ioctl(IOCTL_TX_HCI_PACKET, &packet)
    }

    /// Blocks on the eventfd until the signal handler posts (or the wake
    /// used for shutdown arrives).
    fn wait_event(&self) -> bool {
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                self.event_fd,
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        n == 8
    }

    /// Wakes the reader thread without a signal (shutdown path).
    fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.event_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Reads one framed record; `None` once the queue is empty.
    fn read_record(&self) -> Option<EventRecord> {
        let mut record: EventRecord = unsafe { std::mem::zeroed() };
        let size = std::mem::size_of::<EventRecord>();
        let n = unsafe {
            libc::read(
                self.fd,
                &mut record as *mut EventRecord as *mut libc::c_void,
                size,
            )
        };
        if n as usize != size {
            return None;
        }
        Some(record)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _guard = INSTALL_LOCK.lock().unwrap();
        if SIGNAL_EVENT_FD.load(Ordering::SeqCst) == self.event_fd {
            SIGNAL_EVENT_FD.store(-1, Ordering::SeqCst);
            unsafe {
                libc::signal(libc::SIGIO, libc::SIG_DFL);
            }
        }
        unsafe {
            libc::close(self.event_fd);
            libc::close(self.fd);
        }
    }
}

/// Derives a static random identity address when the controller has none
/// configured: the MAC of a network interface if one exists, random bytes
/// otherwise, with the top two bits set.
fn derive_identity_address() -> BdAddr {
    const CANDIDATES: [&str; 4] = ["wlan0", "wlan1", "ath0", "ra0"];

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock >= 0 {
        for name in CANDIDATES {
            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
            for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
                *dst = src as libc::c_char;
            }
            if unsafe { libc::ioctl(sock, libc::SIOCGIFHWADDR, &mut ifr) } == 0 {
                let hw = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
                let mut bytes = [0u8; 6];
                for (dst, src) in bytes.iter_mut().zip(hw.iter()) {
                    *dst = *src as u8;
                }
                unsafe { libc::close(sock) };
                info!("derived BLE identity address from {}", name);
                return BdAddr::new(bytes).into_static_random();
            }
        }
        unsafe { libc::close(sock) };
    }

    warn!("no usable interface MAC, using a random identity address");
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    BdAddr::new(bytes).into_static_random()
}

struct ChardevConnection {
    peer_address: BdAddr,
    mtu: u16,
}

struct ServerShared {
    device: Device,
    callbacks: Mutex<TransportCallbacks>,
    connections: Mutex<HashMap<u16, ChardevConnection>>,
    sync: SyncLatch,
    running: AtomicBool,
}

impl ServerShared {
    /// Reader thread body: wait for the signal-posted eventfd, then drain
    /// the kernel queue until it reports empty.
    fn event_loop(self: &Arc<Self>) {
        info!("integrated-stack event thread started");
        while self.running.load(Ordering::SeqCst) {
            if !self.device.wait_event() {
                continue;
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            loop {
                let Some(record) = self.device.read_record() else {
                    break;
                };
                self.process_record(&record);
                if record.list_empty == 1 {
                    break;
                }
            }
        }
        info!("integrated-stack event thread stopped");
    }

    fn process_record(&self, record: &EventRecord) {
        // Framing header: [len u16][id u16], then the wrapped HCI packet.
        let buf = &record.buffer;
        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let id = u16::from_le_bytes([buf[2], buf[3]]);
        debug!(
            "device event: kind={} mode={} id=0x{:04X} len={}",
            record.kind, record.driver_mode, id, len
        );
        if 4 + len > buf.len() {
            warn!("event record claims {} bytes, dropping", len);
            return;
        }
        let hci = &buf[4..4 + len];

        match id {
            MSG_ID_BLE_ACK => {
                // Command acknowledged; the first one doubles as the host
                // synchronization signal.
                debug!("command ack ({} bytes)", len);
                self.sync.post();
            }
            MSG_ID_BLE_EVENT => self.process_hci_packet(hci),
            other => warn!("unknown event id 0x{:04X}", other),
        }
    }

    fn process_hci_packet(&self, data: &[u8]) {
        if data.len() < 2 {
            warn!("HCI packet too short: {}", data.len());
            return;
        }

        match data[0] {
            HIF_PKT_EVT => self.process_hci_event(&data[1..]),
            HIF_PKT_ACL => self.process_acl_data(&data[1..]),
            other => debug!("ignoring HCI packet type 0x{:02X}", other),
        }
    }

    fn process_hci_event(&self, data: &[u8]) {
        if data.len() < 2 {
            return;
        }
        let event_code = data[0];
        let param_len = data[1] as usize;
        if data.len() < 2 + param_len {
            warn!("truncated HCI event 0x{:02X}", event_code);
            return;
        }
        let params = &data[2..2 + param_len];

        match event_code {
            EVT_CONN_COMPLETE => self.on_connection_complete(params),
            EVT_DISCONN_COMPLETE => self.on_disconnection_complete(params),
            EVT_LE_META_EVENT => {
                if params.first() == Some(&EVT_LE_CONN_COMPLETE) {
                    self.on_le_connection_complete(params);
                }
            }
            EVT_CMD_COMPLETE => {
                debug!("command complete");
                self.sync.post();
            }
            EVT_CMD_STATUS => {
                if params.first().copied().unwrap_or(0) != 0 {
                    warn!("command status error: {}", params[0]);
                }
            }
            other => debug!("unhandled HCI event 0x{:02X}", other),
        }
    }

    fn on_connection_complete(&self, params: &[u8]) {
        if params.len() < 9 {
            return;
        }
        let status = params[0];
        let conn_handle = u16::from_le_bytes([params[1], params[2]]);
        if status != 0 {
            warn!("connection failed: status=0x{:02X}", status);
            return;
        }
        let peer_address = BdAddr::from_slice(&params[3..9]).unwrap_or(BdAddr::ANY);
        self.register_connection(conn_handle, peer_address, AddressType::Public);
    }

    fn on_le_connection_complete(&self, params: &[u8]) {
        // [subevent][status][handle][role][peer type][peer addr][..]
        if params.len() < 12 {
            return;
        }
        let status = params[1];
        let conn_handle = u16::from_le_bytes([params[2], params[3]]);
        if status != 0 {
            warn!("LE connection failed: status=0x{:02X}", status);
            return;
        }
        let peer_address_type = AddressType::from(params[5]);
        let peer_address = BdAddr::from_slice(&params[6..12]).unwrap_or(BdAddr::ANY);
        self.register_connection(conn_handle, peer_address, peer_address_type);
    }

    fn register_connection(
        &self,
        conn_handle: u16,
        peer_address: BdAddr,
        peer_address_type: AddressType,
    ) {
        info!(
            "connection complete: handle={} peer={}",
            conn_handle, peer_address
        );
        self.connections.lock().unwrap().insert(
            conn_handle,
            ChardevConnection {
                peer_address,
                mtu: 23,
            },
        );
        let callbacks = self.callbacks.lock().unwrap();
        (callbacks.on_connected)(ConnectionParams {
            conn_handle,
            peer_address,
            peer_address_type,
            mtu: 23,
        });
    }

    fn on_disconnection_complete(&self, params: &[u8]) {
        if params.len() < 4 {
            return;
        }
        let status = params[0];
        let conn_handle = u16::from_le_bytes([params[1], params[2]]);
        let reason = params[3];
        if status != 0 {
            return;
        }
        if let Some(conn) = self.connections.lock().unwrap().remove(&conn_handle) {
            info!(
                "disconnection complete: handle={} peer={} reason=0x{:02X}",
                conn_handle, conn.peer_address, reason
            );
        }
        let callbacks = self.callbacks.lock().unwrap();
        (callbacks.on_disconnected)(conn_handle, reason);
    }

    fn process_acl_data(&self, data: &[u8]) {
        // HCI ACL header, then L2CAP header; ATT rides on CID 4.
        if data.len() < 8 {
            warn!("ACL packet too short");
            return;
        }
        let handle_flags = u16::from_le_bytes([data[0], data[1]]);
        let conn_handle = handle_flags & 0x0FFF;
        let acl_len = u16::from_le_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + acl_len || acl_len < 4 {
            warn!("ACL length mismatch");
            return;
        }
        let l2cap_len = u16::from_le_bytes([data[4], data[5]]) as usize;
        let cid = u16::from_le_bytes([data[6], data[7]]);
        if cid != 0x0004 {
            debug!("ignoring L2CAP CID 0x{:04X}", cid);
            return;
        }
        if data.len() < 8 + l2cap_len {
            warn!("L2CAP length overruns ACL packet");
            return;
        }
        let pdu = &data[8..8 + l2cap_len];
        let callbacks = self.callbacks.lock().unwrap();
        (callbacks.on_data_received)(conn_handle, pdu);
    }
}

/// Peripheral-side integrated-stack transport.
pub struct ChardevServerTransport {
    shared: Arc<ServerShared>,
    reader: Option<JoinHandle<()>>,
    host_started: bool,
    advertising: bool,
    identity_address: Option<BdAddr>,
}

impl ChardevServerTransport {
    pub fn new(device_path: &str) -> Result<Self, TransportError> {
        let device = Device::open(device_path)?;
        Ok(ChardevServerTransport {
            shared: Arc::new(ServerShared {
                device,
                callbacks: Mutex::new(TransportCallbacks::noop()),
                connections: Mutex::new(HashMap::new()),
                sync: SyncLatch::new(),
                running: AtomicBool::new(false),
            }),
            reader: None,
            host_started: false,
            advertising: false,
            identity_address: None,
        })
    }

    pub fn with_default_device() -> Result<Self, TransportError> {
        Self::new(DEFAULT_DEVICE_PATH)
    }

    /// Starts the host: coexistence on, reader thread up, then wait for the
    /// controller to report synchronized and make sure an identity address
    /// exists.
    fn start_host(&mut self) -> Result<(), TransportError> {
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        self.reader = Some(thread::spawn(move || shared.event_loop()));

        let started = self
            .shared
            .device
            .ioctl(IOCTL_COEXIST_START, &0u32.to_le_bytes());
        if started.is_err() || !self.shared.sync.wait(SYNC_TIMEOUT) {
            error!("host failed to start or synchronize");
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.device.wake();
            if let Some(reader) = self.reader.take() {
                let _ = reader.join();
            }
            return started.and(Err(TransportError::Timeout));
        }

        let addr = derive_identity_address();
        // LE Set Random Address (OGF 0x08, OCF 0x0005).
        let mut cmd = vec![0x05, 0x20, 0x06];
        cmd.extend_from_slice(addr.as_slice());
        self.shared.device.send_hci_command(&cmd)?;
        self.identity_address = Some(addr);

        info!("host synchronized, identity address {}", addr);
        Ok(())
    }

    pub fn identity_address(&self) -> Option<BdAddr> {
        self.identity_address
    }
}

impl ServerTransport for ChardevServerTransport {
    fn start_advertising(&mut self, params: &AdvertisingParams) -> Result<(), TransportError> {
        if !self.shared.sync.is_set() {
            return Err(TransportError::NotSynchronized);
        }
        if self.advertising {
            debug!("already advertising");
            return Ok(());
        }

        let payload = params.advertising_payload()?;
        let mut buf = Vec::with_capacity(2 + payload.len());
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&payload);
        self.shared.device.ioctl(IOCTL_SET_ADV_DATA, &buf)?;

        let scan_rsp = params.scan_response_payload()?;
        if !scan_rsp.is_empty() {
            let mut buf = Vec::with_capacity(2 + scan_rsp.len());
            buf.extend_from_slice(&(scan_rsp.len() as u16).to_le_bytes());
            buf.extend_from_slice(&scan_rsp);
            self.shared.device.ioctl(IOCTL_SET_RESP_DATA, &buf)?;
        }

        let mut intervals = Vec::with_capacity(4);
        intervals.extend_from_slice(&ms_to_scan_slots(params.min_interval_ms).to_le_bytes());
        intervals.extend_from_slice(&ms_to_scan_slots(params.max_interval_ms).to_le_bytes());
        self.shared.device.ioctl(IOCTL_ADV_START, &intervals)?;

        self.advertising = true;
        info!("advertising started: {:?}", params.device_name);
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), TransportError> {
        if !self.advertising {
            return Ok(());
        }
        // LE Set Advertising Enable (OGF 0x08, OCF 0x000A), disable.
        self.shared.device.send_hci_command(&[0x0A, 0x20, 0x01, 0x00])?;
        self.advertising = false;
        info!("advertising stopped");
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertising
    }

    fn accept_connection(&mut self) -> Result<(), TransportError> {
        // Connections arrive asynchronously through the event thread.
        Ok(())
    }

    fn disconnect(&mut self, conn_handle: u16) -> Result<(), TransportError> {
        if !self
            .shared
            .connections
            .lock()
            .unwrap()
            .contains_key(&conn_handle)
        {
            return Err(TransportError::UnknownConnection(conn_handle as i32));
        }
        // HCI Disconnect (OGF 0x01, OCF 0x0006).
        let mut cmd = vec![0x06, 0x04, 0x03];
        cmd.extend_from_slice(&conn_handle.to_le_bytes());
        cmd.push(HCI_REASON_REMOTE_USER_TERMINATED);
        self.shared.device.send_hci_command(&cmd)
        // The disconnection-complete event cleans up the connection map.
    }

    fn send_pdu(&mut self, conn_handle: u16, data: &[u8]) -> Result<usize, TransportError> {
        if !self
            .shared
            .connections
            .lock()
            .unwrap()
            .contains_key(&conn_handle)
        {
            return Err(TransportError::UnknownConnection(conn_handle as i32));
        }
        self.shared.device.send_att_pdu(conn_handle, data)?;
        debug!("sent {} byte PDU on connection {}", data.len(), conn_handle);
        Ok(data.len())
    }

    fn recv_pdu(&mut self, _conn_handle: u16, _buf: &mut [u8]) -> Result<usize, TransportError> {
        // Inbound PDUs are delivered through on_data_received by the event
        // thread; there is nothing to poll here.
        Ok(0)
    }

    fn set_mtu(&mut self, conn_handle: u16, mtu: u16) -> Result<(), TransportError> {
        let mut conns = self.shared.connections.lock().unwrap();
        let conn = conns
            .get_mut(&conn_handle)
            .ok_or(TransportError::UnknownConnection(conn_handle as i32))?;
        conn.mtu = mtu;
        Ok(())
    }

    fn get_mtu(&self, conn_handle: u16) -> u16 {
        self.shared
            .connections
            .lock()
            .unwrap()
            .get(&conn_handle)
            .map(|c| c.mtu)
            .unwrap_or(23)
    }

    fn process_events(&mut self) -> Result<(), TransportError> {
        // The background reader thread pumps events.
        Ok(())
    }

    fn set_callbacks(&mut self, callbacks: TransportCallbacks) {
        *self.shared.callbacks.lock().unwrap() = callbacks;
    }

    fn services_registered(&mut self) -> Result<(), TransportError> {
        if self.host_started {
            // The integrated stack only accepts services before the host
            // task runs.
            return Err(TransportError::ServicesLocked);
        }
        self.start_host()?;
        self.host_started = true;
        Ok(())
    }
}

impl Drop for ChardevServerTransport {
    fn drop(&mut self) {
        if self.advertising {
            let _ = self.stop_advertising();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.device.wake();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if self.host_started {
            let _ = self
                .shared
                .device
                .ioctl(IOCTL_COEXIST_STOP, &0u32.to_le_bytes());
        }
    }
}

struct ClientConnState {
    conn_handle: u16,
    connected: bool,
    mtu: u16,
    /// Server-initiated PDUs (notifications/indications) queued for
    /// `receive`.
    rx_queue: VecDeque<Vec<u8>>,
}

struct ClientShared {
    device: Device,
    sync: SyncLatch,
    running: AtomicBool,
    scan_results: Mutex<VecDeque<RawAdvertisement>>,
    scan_cv: Condvar,
    /// fd -> connection; handle_to_fd maps controller handles back.
    connections: Mutex<HashMap<i32, ClientConnState>>,
    handle_to_fd: Mutex<HashMap<u16, i32>>,
    /// Latch for the single in-flight connect attempt.
    connect_result: Mutex<Option<Result<u16, u8>>>,
    connect_cv: Condvar,
}

impl ClientShared {
    fn event_loop(self: &Arc<Self>) {
        info!("integrated-stack client event thread started");
        while self.running.load(Ordering::SeqCst) {
            if !self.device.wait_event() {
                continue;
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            loop {
                let Some(record) = self.device.read_record() else {
                    break;
                };
                self.process_record(&record);
                if record.list_empty == 1 {
                    break;
                }
            }
        }
        info!("integrated-stack client event thread stopped");
    }

    fn process_record(&self, record: &EventRecord) {
        let buf = &record.buffer;
        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let id = u16::from_le_bytes([buf[2], buf[3]]);
        debug!(
            "device event: kind={} mode={} id=0x{:04X} len={}",
            record.kind, record.driver_mode, id, len
        );
        if 4 + len > buf.len() {
            warn!("event record claims {} bytes, dropping", len);
            return;
        }
        let hci = &buf[4..4 + len];

        match id {
            MSG_ID_BLE_ACK => self.sync.post(),
            MSG_ID_BLE_EVENT => {
                if hci.len() < 2 {
                    return;
                }
                match hci[0] {
                    HIF_PKT_EVT => self.process_hci_event(&hci[1..]),
                    HIF_PKT_ACL => self.process_acl_data(&hci[1..]),
                    other => debug!("ignoring HCI packet type 0x{:02X}", other),
                }
            }
            other => warn!("unknown event id 0x{:04X}", other),
        }
    }

    fn process_hci_event(&self, data: &[u8]) {
        if data.len() < 2 {
            return;
        }
        let event_code = data[0];
        let param_len = data[1] as usize;
        if data.len() < 2 + param_len {
            return;
        }
        let params = &data[2..2 + param_len];

        match event_code {
            EVT_LE_META_EVENT => match params.first() {
                Some(&EVT_LE_ADVERTISING_REPORT) => self.queue_advertisements(params),
                Some(&EVT_LE_CONN_COMPLETE) => self.on_le_connection_complete(params),
                _ => {}
            },
            EVT_DISCONN_COMPLETE => self.on_disconnection_complete(params),
            EVT_CMD_COMPLETE => self.sync.post(),
            _ => {}
        }
    }

    fn queue_advertisements(&self, params: &[u8]) {
        match parse_le_meta_event(params) {
            Ok(reports) => {
                let mut queue = self.scan_results.lock().unwrap();
                for report in reports {
                    if queue.len() == ADV_BUFFER_CAP {
                        queue.pop_front();
                    }
                    queue.push_back(report);
                }
                self.scan_cv.notify_all();
            }
            Err(e) => warn!("dropping malformed advertising event: {}", e),
        }
    }

    fn on_le_connection_complete(&self, params: &[u8]) {
        if params.len() < 12 {
            return;
        }
        let status = params[1];
        let conn_handle = u16::from_le_bytes([params[2], params[3]]);

        let mut result = self.connect_result.lock().unwrap();
        *result = Some(if status == 0 {
            Ok(conn_handle)
        } else {
            Err(status)
        });
        self.connect_cv.notify_all();
    }

    fn on_disconnection_complete(&self, params: &[u8]) {
        if params.len() < 4 || params[0] != 0 {
            return;
        }
        let conn_handle = u16::from_le_bytes([params[1], params[2]]);
        let fd = self.handle_to_fd.lock().unwrap().remove(&conn_handle);
        if let Some(fd) = fd {
            self.connections.lock().unwrap().remove(&fd);
            info!("disconnected: handle={} conn={}", conn_handle, fd);
        }
    }

    fn process_acl_data(&self, data: &[u8]) {
        if data.len() < 8 {
            return;
        }
        let handle_flags = u16::from_le_bytes([data[0], data[1]]);
        let conn_handle = handle_flags & 0x0FFF;
        let l2cap_len = u16::from_le_bytes([data[4], data[5]]) as usize;
        let cid = u16::from_le_bytes([data[6], data[7]]);
        if cid != 0x0004 || data.len() < 8 + l2cap_len {
            return;
        }
        let pdu = &data[8..8 + l2cap_len];

        // Only server-initiated PDUs surface through receive(); the stack
        // matches responses to requests internally.
        let opcode = pdu.first().copied().unwrap_or(0);
        if opcode != crate::att::ATT_HANDLE_VALUE_NTF && opcode != crate::att::ATT_HANDLE_VALUE_IND
        {
            debug!("dropping non-notification PDU opcode 0x{:02X}", opcode);
            return;
        }

        let fd = self
            .handle_to_fd
            .lock()
            .unwrap()
            .get(&conn_handle)
            .copied();
        if let Some(fd) = fd {
            let mut conns = self.connections.lock().unwrap();
            if let Some(conn) = conns.get_mut(&fd) {
                conn.rx_queue.push_back(pdu.to_vec());
            }
        }
    }
}

/// Central-side integrated-stack transport.
pub struct ChardevClientTransport {
    shared: Arc<ClientShared>,
    reader: Option<JoinHandle<()>>,
    scanning: bool,
    next_fd: i32,
}

impl ChardevClientTransport {
    pub fn new(device_path: &str) -> Result<Self, TransportError> {
        let device = Device::open(device_path)?;
        let shared = Arc::new(ClientShared {
            device,
            sync: SyncLatch::new(),
            running: AtomicBool::new(true),
            scan_results: Mutex::new(VecDeque::new()),
            scan_cv: Condvar::new(),
            connections: Mutex::new(HashMap::new()),
            handle_to_fd: Mutex::new(HashMap::new()),
            connect_result: Mutex::new(None),
            connect_cv: Condvar::new(),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::spawn(move || reader_shared.event_loop());

        let started = shared.device.ioctl(IOCTL_COEXIST_START, &0u32.to_le_bytes());
        if started.is_err() || !shared.sync.wait(SYNC_TIMEOUT) {
            shared.running.store(false, Ordering::SeqCst);
            shared.device.wake();
            let _ = reader.join();
            return started.and(Err(TransportError::Timeout));
        }

        info!("integrated-stack client synchronized");
        Ok(ChardevClientTransport {
            shared,
            reader: Some(reader),
            scanning: false,
            // Above the range real descriptors occupy, to make confusion
            // with actual fds fail loudly.
            next_fd: 1000,
        })
    }

    pub fn with_default_device() -> Result<Self, TransportError> {
        Self::new(DEFAULT_DEVICE_PATH)
    }
}

impl ClientTransport for ChardevClientTransport {
    fn start_scan(&mut self, params: &ScanParams) -> Result<(), TransportError> {
        if !self.shared.sync.is_set() {
            return Err(TransportError::NotSynchronized);
        }
        if self.scanning {
            return Err(TransportError::AlreadyScanning);
        }

        self.shared.scan_results.lock().unwrap().clear();

        // LE Set Scan Parameters (OGF 0x08, OCF 0x000B).
        let mut cmd = vec![0x0B, 0x20, 0x07];
        cmd.push(params.active as u8);
        cmd.extend_from_slice(&ms_to_scan_slots(params.interval_ms).to_le_bytes());
        cmd.extend_from_slice(&ms_to_scan_slots(params.window_ms).to_le_bytes());
        cmd.push(0x00); // own address type: public
        cmd.push(match params.filter_policy {
            super::FilterPolicy::All => 0x00,
            super::FilterPolicy::Whitelist => 0x01,
        });
        self.shared.device.send_hci_command(&cmd)?;

        // LE Set Scan Enable (OGF 0x08, OCF 0x000C).
        self.shared.device.send_hci_command(&[
            0x0C,
            0x20,
            0x02,
            0x01,
            params.filter_duplicates as u8,
        ])?;

        self.scanning = true;
        info!("scan started");
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        if !self.scanning {
            return Ok(());
        }
        self.shared
            .device
            .send_hci_command(&[0x0C, 0x20, 0x02, 0x00, 0x00])?;
        self.scanning = false;
        info!("scan stopped");
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

        let mut queue = self.shared.scan_results.lock().unwrap();
        match timeout {
            Timeout::NonBlocking => {}
            Timeout::Millis(ms) => {
                if queue.is_empty() {
                    let (q, _) = self
                        .shared
                        .scan_cv
                        .wait_timeout_while(queue, Duration::from_millis(ms as u64), |q| {
                            q.is_empty()
                        })
                        .unwrap();
                    queue = q;
                }
            }
            Timeout::Forever => {
                while queue.is_empty() {
                    queue = self.shared.scan_cv.wait(queue).unwrap();
                }
            }
        }
        Ok(queue.drain(..).collect())
    }

    fn connect(&mut self, params: &ConnectParams) -> Result<ConnId, TransportError> {
        if !self.shared.sync.is_set() {
            return Err(TransportError::NotSynchronized);
        }

        let fd = self.next_fd;
        self.next_fd += 1;

        *self.shared.connect_result.lock().unwrap() = None;

        // LE Create Connection (OGF 0x08, OCF 0x000D).
        let mut cmd = vec![0x0D, 0x20, 0x19];
        cmd.extend_from_slice(&0x0010u16.to_le_bytes()); // scan interval
        cmd.extend_from_slice(&0x0010u16.to_le_bytes()); // scan window
        cmd.push(0x00); // no whitelist
        cmd.push(u8::from(params.peer_address_type));
        cmd.extend_from_slice(params.peer_address.as_slice());
        cmd.push(0x00); // own address type: public
        cmd.extend_from_slice(&params.min_interval.to_le_bytes());
        cmd.extend_from_slice(&params.max_interval.to_le_bytes());
        cmd.extend_from_slice(&params.latency.to_le_bytes());
        cmd.extend_from_slice(&params.supervision_timeout.to_le_bytes());
        cmd.extend_from_slice(&0u16.to_le_bytes()); // min CE length
        cmd.extend_from_slice(&0u16.to_le_bytes()); // max CE length
        self.shared.device.send_hci_command(&cmd)?;

        // Wait for the connection-complete event.
        let result = self.shared.connect_result.lock().unwrap();
        let (mut result, timeout) = self
            .shared
            .connect_cv
            .wait_timeout_while(result, CONNECT_TIMEOUT, |r| r.is_none())
            .unwrap();
        if timeout.timed_out() {
            return Err(TransportError::Timeout);
        }

        match result.take() {
            Some(Ok(conn_handle)) => {
                self.shared.connections.lock().unwrap().insert(
                    fd,
                    ClientConnState {
                        conn_handle,
                        connected: true,
                        mtu: 23,
                        rx_queue: VecDeque::new(),
                    },
                );
                self.shared
                    .handle_to_fd
                    .lock()
                    .unwrap()
                    .insert(conn_handle, fd);
                info!(
                    "connected to {} (handle={} conn={})",
                    params.peer_address, conn_handle, fd
                );
                Ok(ConnId(fd))
            }
            Some(Err(status)) => {
                warn!("connection failed: status=0x{:02X}", status);
                Err(TransportError::Unreachable)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn disconnect(&mut self, conn: ConnId) -> Result<(), TransportError> {
        let conn_handle = {
            let conns = self.shared.connections.lock().unwrap();
            conns
                .get(&conn.0)
                .ok_or(TransportError::UnknownConnection(conn.0))?
                .conn_handle
        };
        let mut cmd = vec![0x06, 0x04, 0x03];
        cmd.extend_from_slice(&conn_handle.to_le_bytes());
        cmd.push(HCI_REASON_REMOTE_USER_TERMINATED);
        self.shared.device.send_hci_command(&cmd)
        // Cleanup happens on the disconnection-complete event.
    }

    fn send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize, TransportError> {
        let conn_handle = {
            let conns = self.shared.connections.lock().unwrap();
            let state = conns
                .get(&conn.0)
                .ok_or(TransportError::UnknownConnection(conn.0))?;
            if !state.connected {
                return Err(TransportError::UnknownConnection(conn.0));
            }
            state.conn_handle
        };
        self.shared.device.send_att_pdu(conn_handle, data)?;
        Ok(data.len())
    }

    fn receive(&mut self, conn: ConnId, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut conns = self.shared.connections.lock().unwrap();
        let state = conns
            .get_mut(&conn.0)
            .ok_or(TransportError::UnknownConnection(conn.0))?;

        let Some(pdu) = state.rx_queue.pop_front() else {
            return Ok(0);
        };
        let n = pdu.len().min(buf.len());
        buf[..n].copy_from_slice(&pdu[..n]);
        Ok(n)
    }

    fn get_mtu(&self, conn: ConnId) -> u16 {
        self.shared
            .connections
            .lock()
            .unwrap()
            .get(&conn.0)
            .map(|c| c.mtu)
            .unwrap_or(23)
    }

    fn set_mtu(&mut self, conn: ConnId, mtu: u16) -> Result<(), TransportError> {
        let mut conns = self.shared.connections.lock().unwrap();
        let state = conns
            .get_mut(&conn.0)
            .ok_or(TransportError::UnknownConnection(conn.0))?;
        state.mtu = mtu;
        Ok(())
    }
}

impl Drop for ChardevClientTransport {
    fn drop(&mut self) {
        if self.scanning {
            let _ = self.stop_scan();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.device.wake();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let _ = self
            .shared
            .device
            .ioctl(IOCTL_COEXIST_STOP, &0u32.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_codes_follow_iow_encoding() {
        // _IOW(121, n, unsigned int): write dir, 4-byte payload.
        assert_eq!(IOCTL_COEXIST_START, 0x4004_7900);
        assert_eq!(IOCTL_COEXIST_STOP, 0x4004_7901);
        assert_eq!(IOCTL_SET_ADV_DATA, 0x4004_7902);
        assert_eq!(IOCTL_ADV_START, 0x4004_7903);
        assert_eq!(IOCTL_SET_RESP_DATA, 0x4004_7904);
        assert_eq!(IOCTL_TX_HCI_PACKET, 0x4004_7905);
    }

    #[test]
    fn event_record_layout() {
        assert_eq!(std::mem::size_of::<EventRecord>(), 3 + EVENT_BUFFER_LEN);
    }

    #[test]
    fn identity_address_is_static_random() {
        let addr = derive_identity_address();
        assert_eq!(addr.bytes[5] & 0xC0, 0xC0);
    }

    #[test]
    fn sync_latch_posts_once() {
        let latch = SyncLatch::new();
        assert!(!latch.is_set());
        latch.post();
        latch.post();
        assert!(latch.is_set());
        assert!(latch.wait(Duration::from_millis(1)));
    }
}
