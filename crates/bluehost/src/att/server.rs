//! The GATT server engine: ATT PDU dispatch, per-connection state, and
//! server-initiated notifications and indications.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::gap::{AddressType, BdAddr};
use crate::gatt::{RegisteredService, ServiceDef};
use crate::transport::{
    AdvertisingParams, ConnectionParams, ServerTransport, TransportCallbacks,
};
use crate::uuid::Uuid;

use super::constants::*;
use super::database::AttributeDatabase;
use super::error::{AttErrorCode, ServerError};
use super::pdu::*;

/// How long an indication may remain unconfirmed before the engine allows a
/// new one. A client that never sends the confirmation would otherwise block
/// indications on that connection forever.
const INDICATION_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The MTU the server offers during MTU exchange.
    pub max_mtu: u16,
    /// Delay inserted before each Read By Group Type Response. Some deployed
    /// clients queue their outbound command after sending the request and
    /// silently drop a response that arrives first; 20 ms covers them.
    pub group_type_response_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_mtu: ATT_MAX_MTU,
            group_type_response_delay: Duration::ZERO,
        }
    }
}

/// Per-connection state. CCCD values live here, not in the database: they
/// are per-connection and vanish on disconnect.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub conn_handle: u16,
    pub peer_address: BdAddr,
    pub peer_address_type: AddressType,
    pub mtu: u16,
    /// Characteristic value handle -> CCCD value for this connection.
    pub cccd_values: HashMap<u16, u16>,
    pub connected: bool,
    indication_sent_at: Option<Instant>,
}

impl ConnectionState {
    fn new(params: &ConnectionParams) -> Self {
        ConnectionState {
            conn_handle: params.conn_handle,
            peer_address: params.peer_address,
            peer_address_type: params.peer_address_type,
            mtu: ATT_DEFAULT_MTU,
            cccd_values: HashMap::new(),
            connected: true,
            indication_sent_at: None,
        }
    }
}

enum EngineEvent {
    Connected(ConnectionParams),
    Disconnected(u16, u8),
    Data(u16, Vec<u8>),
}

type ConnectedHook = Box<dyn Fn(u16, BdAddr) + Send + Sync>;
type DisconnectedHook = Box<dyn Fn(u16) + Send + Sync>;
type MtuHook = Box<dyn Fn(u16, u16) + Send + Sync>;

/// The GATT server.
///
/// Owns one transport and one attribute database. Inbound PDUs for a
/// connection are processed in arrival order; each is fully handled
/// (callbacks invoked, response handed to the transport) before the next
/// begins. User read/write callbacks run on the engine's event thread — do
/// not call back into the engine from inside one.
pub struct GattServer<T: ServerTransport> {
    transport: Arc<Mutex<T>>,
    db: Arc<AttributeDatabase>,
    connections: Arc<Mutex<HashMap<u16, ConnectionState>>>,
    events: Arc<Mutex<VecDeque<EngineEvent>>>,
    config: ServerConfig,
    running: Arc<AtomicBool>,

    /// Called after a central connects.
    pub on_connected: Option<ConnectedHook>,
    /// Called after a central disconnects.
    pub on_disconnected: Option<DisconnectedHook>,
    /// Called after MTU exchange completes, with the negotiated value.
    pub on_mtu_exchanged: Option<MtuHook>,
}

impl<T: ServerTransport> GattServer<T> {
    pub fn new(transport: T, config: ServerConfig) -> Self {
        let transport = Arc::new(Mutex::new(transport));
        let events: Arc<Mutex<VecDeque<EngineEvent>>> = Arc::new(Mutex::new(VecDeque::new()));

        {
            let mut t = transport.lock().unwrap();
            let conn_events = Arc::clone(&events);
            let disc_events = Arc::clone(&events);
            let data_events = Arc::clone(&events);
            t.set_callbacks(TransportCallbacks {
                on_connected: Box::new(move |params| {
                    conn_events
                        .lock()
                        .unwrap()
                        .push_back(EngineEvent::Connected(params));
                }),
                on_disconnected: Box::new(move |conn_handle, reason| {
                    disc_events
                        .lock()
                        .unwrap()
                        .push_back(EngineEvent::Disconnected(conn_handle, reason));
                }),
                on_data_received: Box::new(move |conn_handle, data| {
                    data_events
                        .lock()
                        .unwrap()
                        .push_back(EngineEvent::Data(conn_handle, data.to_vec()));
                }),
            });
        }

        info!("GATT server created (max MTU {})", config.max_mtu);
        GattServer {
            transport,
            db: Arc::new(AttributeDatabase::new()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            events,
            config,
            running: Arc::new(AtomicBool::new(false)),
            on_connected: None,
            on_disconnected: None,
            on_mtu_exchanged: None,
        }
    }

    /// The attribute database.
    pub fn db(&self) -> &Arc<AttributeDatabase> {
        &self.db
    }

    /// Registers services with the database and tells the transport the
    /// database is final. Must happen before the first connection.
    pub fn register_services(
        &mut self,
        services: &[ServiceDef],
    ) -> Result<Vec<RegisteredService>, ServerError> {
        let registered = self.db.register_services(services)?;
        self.transport.lock().unwrap().services_registered()?;
        Ok(registered)
    }

    pub fn start_advertising(&mut self, params: &AdvertisingParams) -> Result<(), ServerError> {
        Ok(self.transport.lock().unwrap().start_advertising(params)?)
    }

    pub fn stop_advertising(&mut self) -> Result<(), ServerError> {
        Ok(self.transport.lock().unwrap().stop_advertising()?)
    }

    pub fn is_advertising(&self) -> bool {
        self.transport.lock().unwrap().is_advertising()
    }

    pub fn disconnect(&mut self, conn_handle: u16) -> Result<(), ServerError> {
        Ok(self.transport.lock().unwrap().disconnect(conn_handle)?)
    }

    /// A snapshot of the state for one connection.
    pub fn connection_state(&self, conn_handle: u16) -> Option<ConnectionState> {
        self.connections.lock().unwrap().get(&conn_handle).cloned()
    }

    /// Blocking event loop: accepts connections, pumps the transport and
    /// dispatches inbound PDUs until [`stop`](Self::stop) is called.
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        info!("GATT server running");

        while self.running.load(Ordering::SeqCst) {
            self.process()?;
            thread::sleep(Duration::from_millis(10));
        }

        info!("GATT server stopped");
        Ok(())
    }

    /// One turn of the event loop: poll for a pending connection, pump
    /// transport events, dispatch everything queued.
    pub fn process(&mut self) -> Result<(), ServerError> {
        {
            let mut t = self.transport.lock().unwrap();
            if let Err(e) = t.accept_connection() {
                warn!("accept_connection failed: {}", e);
            }
            if let Err(e) = t.process_events() {
                warn!("process_events failed: {}", e);
            }
        }
        self.drain_events();
        Ok(())
    }

    /// Requests the event loop to exit. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn drain_events(&mut self) {
        loop {
            let event = self.events.lock().unwrap().pop_front();
            let Some(event) = event else { break };
            match event {
                EngineEvent::Connected(params) => self.handle_connected(params),
                EngineEvent::Disconnected(conn_handle, reason) => {
                    self.handle_disconnected(conn_handle, reason)
                }
                EngineEvent::Data(conn_handle, data) => {
                    let mut t = self.transport.lock().unwrap();
                    self.handle_att_pdu(&mut t, conn_handle, &data);
                }
            }
        }
    }

    fn handle_connected(&mut self, params: ConnectionParams) {
        info!(
            "client connected: handle={} addr={}",
            params.conn_handle, params.peer_address
        );
        self.connections
            .lock()
            .unwrap()
            .insert(params.conn_handle, ConnectionState::new(&params));
        if let Some(cb) = &self.on_connected {
            cb(params.conn_handle, params.peer_address);
        }
    }

    fn handle_disconnected(&mut self, conn_handle: u16, reason: u8) {
        info!(
            "client disconnected: handle={} reason=0x{:02X}",
            conn_handle, reason
        );
        self.connections.lock().unwrap().remove(&conn_handle);
        if let Some(cb) = &self.on_disconnected {
            cb(conn_handle);
        }
    }

    /// Sends a notification. Requires the client to have enabled
    /// notifications through the characteristic's CCCD. Unacknowledged: the
    /// call succeeds as soon as the transport accepts the PDU.
    pub fn notify(
        &self,
        conn_handle: u16,
        value_handle: u16,
        data: &[u8],
    ) -> Result<(), ServerError> {
        let mut t = self.transport.lock().unwrap();

        let mtu = {
            let conns = self.connections.lock().unwrap();
            let conn = conns
                .get(&conn_handle)
                .ok_or(ServerError::UnknownConnection(conn_handle))?;
            let cccd = conn.cccd_values.get(&value_handle).copied().unwrap_or(0);
            if cccd & CCCD_NOTIFICATION == 0 {
                return Err(ServerError::NotificationsDisabled(value_handle));
            }
            conn.mtu
        };
        if data.len() > mtu as usize - 3 {
            return Err(ServerError::ValueTooLong {
                len: data.len(),
                mtu,
            });
        }

        let pdu = HandleValueNotification {
            handle: value_handle,
            value: data.to_vec(),
        }
        .serialize();
        t.send_pdu(conn_handle, &pdu)?;
        Ok(())
    }

    /// Sends an indication. Requires the client to have enabled indications
    /// through the CCCD. Only one indication may be outstanding per
    /// connection; a second call before the client's confirmation (or the
    /// 30 s confirmation timeout) fails with [`ServerError::Busy`].
    pub fn indicate(
        &self,
        conn_handle: u16,
        value_handle: u16,
        data: &[u8],
    ) -> Result<(), ServerError> {
        let mut t = self.transport.lock().unwrap();

        let mtu = {
            let mut conns = self.connections.lock().unwrap();
            let conn = conns
                .get_mut(&conn_handle)
                .ok_or(ServerError::UnknownConnection(conn_handle))?;
            let cccd = conn.cccd_values.get(&value_handle).copied().unwrap_or(0);
            if cccd & CCCD_INDICATION == 0 {
                return Err(ServerError::IndicationsDisabled(value_handle));
            }
            if let Some(sent_at) = conn.indication_sent_at {
                if sent_at.elapsed() < INDICATION_CONFIRM_TIMEOUT {
                    return Err(ServerError::Busy);
                }
                warn!(
                    "indication on connection {} unconfirmed for {:?}, allowing a new one",
                    conn_handle, INDICATION_CONFIRM_TIMEOUT
                );
            }
            conn.indication_sent_at = Some(Instant::now());
            conn.mtu
        };
        if data.len() > mtu as usize - 3 {
            self.clear_indication_marker(conn_handle);
            return Err(ServerError::ValueTooLong {
                len: data.len(),
                mtu,
            });
        }

        let pdu = HandleValueIndication {
            handle: value_handle,
            value: data.to_vec(),
        }
        .serialize();
        if let Err(e) = t.send_pdu(conn_handle, &pdu) {
            self.clear_indication_marker(conn_handle);
            return Err(e.into());
        }
        Ok(())
    }

    fn clear_indication_marker(&self, conn_handle: u16) {
        if let Some(conn) = self.connections.lock().unwrap().get_mut(&conn_handle) {
            conn.indication_sent_at = None;
        }
    }

    fn mtu_of(&self, conn_handle: u16) -> u16 {
        self.connections
            .lock()
            .unwrap()
            .get(&conn_handle)
            .map(|c| c.mtu)
            .unwrap_or(ATT_DEFAULT_MTU)
    }

    /// Sends a PDU; a transport error here is unrecoverable for the
    /// connection, which is torn down.
    fn send_or_drop(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        if let Err(e) = transport.send_pdu(conn_handle, pdu) {
            warn!(
                "send failed on connection {}, dropping it: {}",
                conn_handle, e
            );
            let _ = transport.disconnect(conn_handle);
            self.connections.lock().unwrap().remove(&conn_handle);
            if let Some(cb) = &self.on_disconnected {
                cb(conn_handle);
            }
        }
    }

    fn send_error_response(
        &self,
        transport: &mut T,
        conn_handle: u16,
        request_opcode: u8,
        handle: u16,
        error_code: AttErrorCode,
    ) {
        debug!(
            "ATT error: opcode=0x{:02X} handle=0x{:04X} code={:?}",
            request_opcode, handle, error_code
        );
        let pdu = ErrorResponse {
            request_opcode,
            handle,
            error_code,
        }
        .serialize();
        self.send_or_drop(transport, conn_handle, &pdu);
    }

    fn handle_att_pdu(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        if pdu.is_empty() {
            warn!("empty PDU on connection {}", conn_handle);
            return;
        }
        if !self.connections.lock().unwrap().contains_key(&conn_handle) {
            warn!("PDU for unknown connection {}", conn_handle);
            return;
        }

        let opcode = pdu[0];
        debug!(
            "ATT PDU: conn={} opcode=0x{:02X} len={}",
            conn_handle,
            opcode,
            pdu.len()
        );

        match opcode {
            ATT_EXCHANGE_MTU_REQ => self.handle_exchange_mtu(transport, conn_handle, pdu),
            ATT_FIND_INFO_REQ => self.handle_find_information(transport, conn_handle, pdu),
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                self.handle_find_by_type_value(transport, conn_handle, pdu)
            }
            ATT_READ_BY_TYPE_REQ => self.handle_read_by_type(transport, conn_handle, pdu),
            ATT_READ_REQ => self.handle_read(transport, conn_handle, pdu),
            ATT_READ_BLOB_REQ => self.handle_read_blob(transport, conn_handle, pdu),
            ATT_READ_BY_GROUP_TYPE_REQ => {
                self.handle_read_by_group_type(transport, conn_handle, pdu)
            }
            ATT_WRITE_REQ => self.handle_write(transport, conn_handle, pdu),
            ATT_WRITE_CMD => self.handle_write_command(conn_handle, pdu),
            ATT_PREPARE_WRITE_REQ | ATT_EXECUTE_WRITE_REQ => {
                self.send_error_response(
                    transport,
                    conn_handle,
                    opcode,
                    0x0000,
                    AttErrorCode::RequestNotSupported,
                );
            }
            ATT_SIGNED_WRITE_CMD => {
                warn!("signed write command not supported, ignoring");
            }
            ATT_HANDLE_VALUE_CONF => {
                debug!("indication confirmed on connection {}", conn_handle);
                self.clear_indication_marker(conn_handle);
            }
            _ => {
                warn!("unsupported ATT opcode 0x{:02X}", opcode);
                self.send_error_response(
                    transport,
                    conn_handle,
                    opcode,
                    0x0000,
                    AttErrorCode::RequestNotSupported,
                );
            }
        }
    }

    fn handle_exchange_mtu(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match ExchangeMtuRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_EXCHANGE_MTU_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        let server_mtu = self.config.max_mtu;
        let negotiated = req.client_mtu.min(server_mtu);
        {
            let mut conns = self.connections.lock().unwrap();
            if let Some(conn) = conns.get_mut(&conn_handle) {
                conn.mtu = negotiated;
            }
        }
        if let Err(e) = transport.set_mtu(conn_handle, negotiated) {
            warn!("transport refused MTU {}: {}", negotiated, e);
        }

        info!("MTU negotiated: {} (conn {})", negotiated, conn_handle);
        let rsp = ExchangeMtuResponse { server_mtu }.serialize();
        self.send_or_drop(transport, conn_handle, &rsp);

        if let Some(cb) = &self.on_mtu_exchanged {
            cb(conn_handle, negotiated);
        }
    }

    fn handle_find_information(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match FindInformationRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_FIND_INFO_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        if req.start_handle == 0 || req.start_handle > req.end_handle {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_FIND_INFO_REQ,
                req.start_handle,
                AttErrorCode::InvalidHandle,
            );
        }

        let attrs = self.db.range(req.start_handle, req.end_handle);
        if attrs.is_empty() {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_FIND_INFO_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
        }

        let format = if attrs[0].type_uuid.is_short() {
            ATT_FIND_INFO_FORMAT_16BIT
        } else {
            ATT_FIND_INFO_FORMAT_128BIT
        };
        let pair_size = if format == ATT_FIND_INFO_FORMAT_16BIT {
            4
        } else {
            18
        };

        let mtu = self.mtu_of(conn_handle) as usize;
        let mut pairs = Vec::new();
        let mut used = 2; // opcode + format
        for attr in &attrs {
            // Pairs share one format; stop at the first width change.
            if attr.type_uuid.is_short() != (format == ATT_FIND_INFO_FORMAT_16BIT) {
                break;
            }
            if used + pair_size > mtu {
                break;
            }
            pairs.push(HandleTypePair {
                handle: attr.handle,
                uuid: attr.type_uuid,
            });
            used += pair_size;
        }

        let rsp = FindInformationResponse { format, pairs }.serialize();
        self.send_or_drop(transport, conn_handle, &rsp);
    }

    fn handle_find_by_type_value(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match FindByTypeValueRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_FIND_BY_TYPE_VALUE_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        if req.start_handle == 0 || req.start_handle > req.end_handle {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_FIND_BY_TYPE_VALUE_REQ,
                req.start_handle,
                AttErrorCode::InvalidHandle,
            );
        }

        let matches = self.db.find_by_type_value(
            req.start_handle,
            req.end_handle,
            &Uuid::from_u16(req.attribute_type),
            &req.attribute_value,
        );
        if matches.is_empty() {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_FIND_BY_TYPE_VALUE_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
        }

        let mtu = self.mtu_of(conn_handle) as usize;
        let mut handles = Vec::new();
        let mut used = 1;
        for attr in &matches {
            if used + 4 > mtu {
                break;
            }
            // Service declarations span a group; anything else ends at its
            // own handle.
            let group_end = if attr.is_service() {
                attr.end_group_handle
            } else {
                attr.handle
            };
            handles.push(HandleRange {
                found_handle: attr.handle,
                group_end_handle: group_end,
            });
            used += 4;
        }

        let rsp = FindByTypeValueResponse { handles }.serialize();
        self.send_or_drop(transport, conn_handle, &rsp);
    }

    fn handle_read_by_type(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match ReadByTypeRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_READ_BY_TYPE_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        if req.start_handle == 0 || req.start_handle > req.end_handle {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_BY_TYPE_REQ,
                req.start_handle,
                AttErrorCode::InvalidHandle,
            );
        }

        let matches = self
            .db
            .find_by_type(req.start_handle, req.end_handle, &req.attribute_type);
        if matches.is_empty() {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_BY_TYPE_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
        }

        let mtu = self.mtu_of(conn_handle) as usize;

        // The first attribute's value fixes the pair length; ATT requires
        // every pair in the response to have the same size.
        let first_value = self
            .db
            .read_value(conn_handle, matches[0].handle, 0)
            .unwrap_or_else(|_| matches[0].value.clone());
        let value_len = first_value.len();
        let pair_len = 2 + value_len;

        let mut pairs = Vec::new();
        let mut used = 2; // opcode + pair length
        for attr in &matches {
            if used + pair_len > mtu {
                break;
            }
            let value = self
                .db
                .read_value(conn_handle, attr.handle, 0)
                .unwrap_or_else(|_| attr.value.clone());
            if value.len() != value_len {
                // Values of a different length than the first are dropped.
                continue;
            }
            pairs.push(HandleValue {
                handle: attr.handle,
                value,
            });
            used += pair_len;
        }

        let rsp = ReadByTypeResponse {
            pair_length: pair_len as u8,
            pairs,
        }
        .serialize();
        self.send_or_drop(transport, conn_handle, &rsp);
    }

    fn handle_read(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match ReadRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_READ_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        let Some(attr) = self.db.get(req.handle) else {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_REQ,
                req.handle,
                AttErrorCode::InvalidHandle,
            );
        };
        if !attr.readable() {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_REQ,
                req.handle,
                AttErrorCode::ReadNotPermitted,
            );
        }

        let mut value = match self.db.read_value(conn_handle, req.handle, 0) {
            Ok(value) => value,
            Err(code) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_READ_REQ,
                    req.handle,
                    code,
                )
            }
        };

        let max = self.mtu_of(conn_handle) as usize - 1;
        value.truncate(max);
        let rsp = ReadResponse { value }.serialize();
        self.send_or_drop(transport, conn_handle, &rsp);
    }

    fn handle_read_blob(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match ReadBlobRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_READ_BLOB_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        let Some(attr) = self.db.get(req.handle) else {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_BLOB_REQ,
                req.handle,
                AttErrorCode::InvalidHandle,
            );
        };
        if !attr.readable() {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_BLOB_REQ,
                req.handle,
                AttErrorCode::ReadNotPermitted,
            );
        }

        let mut value = match self.db.read_value(conn_handle, req.handle, req.offset) {
            Ok(value) => value,
            Err(code) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_READ_BLOB_REQ,
                    req.handle,
                    code,
                )
            }
        };

        let max = self.mtu_of(conn_handle) as usize - 1;
        value.truncate(max);
        let rsp = ReadBlobResponse { value }.serialize();
        self.send_or_drop(transport, conn_handle, &rsp);
    }

    fn handle_read_by_group_type(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match ReadByGroupTypeRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_READ_BY_GROUP_TYPE_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        if req.start_handle == 0 || req.start_handle > req.end_handle {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_BY_GROUP_TYPE_REQ,
                req.start_handle,
                AttErrorCode::InvalidHandle,
            );
        }

        // Primary Service is the only grouping attribute.
        if req.group_type != Uuid::from_u16(PRIMARY_SERVICE_UUID) {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_BY_GROUP_TYPE_REQ,
                req.start_handle,
                AttErrorCode::UnsupportedGroupType,
            );
        }

        let services = self
            .db
            .find_by_type(req.start_handle, req.end_handle, &req.group_type);
        if services.is_empty() {
            return self.send_error_response(
                transport,
                conn_handle,
                ATT_READ_BY_GROUP_TYPE_REQ,
                req.start_handle,
                AttErrorCode::AttributeNotFound,
            );
        }

        // The first service's UUID width fixes the pair length; services of
        // the other width are omitted.
        let uuid_size = services[0].value.len();
        let pair_len = 4 + uuid_size;
        let mtu = self.mtu_of(conn_handle) as usize;

        let mut groups = Vec::new();
        let mut used = 2;
        for svc in &services {
            if svc.value.len() != uuid_size {
                continue;
            }
            if used + pair_len > mtu {
                break;
            }
            groups.push(GroupData {
                handle: svc.handle,
                end_group_handle: svc.end_group_handle,
                value: svc.value.clone(),
            });
            used += pair_len;
        }

        let rsp = ReadByGroupTypeResponse {
            pair_length: pair_len as u8,
            groups,
        }
        .serialize();

        // Compatibility knob for clients that queue their command after
        // sending the request and drop a response that beats it.
        if !self.config.group_type_response_delay.is_zero() {
            thread::sleep(self.config.group_type_response_delay);
        }

        self.send_or_drop(transport, conn_handle, &rsp);
    }

    /// Shared write path for Write Request and Write Command. CCCD writes
    /// update per-connection state before any user callback runs.
    fn do_write(&self, conn_handle: u16, handle: u16, value: &[u8]) -> Result<(), AttErrorCode> {
        let attr = self.db.get(handle).ok_or(AttErrorCode::InvalidHandle)?;
        if !attr.writable() {
            return Err(AttErrorCode::WriteNotPermitted);
        }

        if attr.type_uuid == Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID) && value.len() == 2 {
            let cccd_value = u16::from_le_bytes([value[0], value[1]]);
            // The CCCD always sits right behind its characteristic value.
            let char_value_handle = handle - 1;
            let mut conns = self.connections.lock().unwrap();
            if let Some(conn) = conns.get_mut(&conn_handle) {
                conn.cccd_values.insert(char_value_handle, cccd_value);
                debug!(
                    "CCCD write: conn={} char=0x{:04X} value=0x{:04X}",
                    conn_handle, char_value_handle, cccd_value
                );
            }
        }

        self.db.write_value(conn_handle, handle, value)
    }

    fn handle_write(&self, transport: &mut T, conn_handle: u16, pdu: &[u8]) {
        let req = match WriteRequest::parse(pdu) {
            Ok(req) => req,
            Err(_) => {
                return self.send_error_response(
                    transport,
                    conn_handle,
                    ATT_WRITE_REQ,
                    0x0000,
                    AttErrorCode::InvalidPdu,
                )
            }
        };

        match self.do_write(conn_handle, req.handle, &req.value) {
            Ok(()) => {
                let rsp = WriteResponse.serialize();
                self.send_or_drop(transport, conn_handle, &rsp);
            }
            Err(code) => {
                self.send_error_response(transport, conn_handle, ATT_WRITE_REQ, req.handle, code)
            }
        }
    }

    fn handle_write_command(&self, conn_handle: u16, pdu: &[u8]) {
        // No response, whatever happens.
        let Ok(cmd) = WriteCommand::parse(pdu) else {
            return;
        };
        if let Err(code) = self.do_write(conn_handle, cmd.handle, &cmd.value) {
            debug!(
                "write command on 0x{:04X} failed silently: {:?}",
                cmd.handle, code
            );
        }
    }
}

impl<T: ServerTransport> Drop for GattServer<T> {
    fn drop(&mut self) {
        self.stop();
        // Detach the transport's callbacks so nothing fires into a
        // half-dropped engine.
        self.transport
            .lock()
            .unwrap()
            .set_callbacks(TransportCallbacks::noop());
    }
}
