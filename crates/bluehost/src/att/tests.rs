//! Tests for the attribute database and the server engine.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::att::constants::*;
use crate::att::database::AttributeDatabase;
use crate::att::error::{AttErrorCode, DbError, ServerError};
use crate::att::server::{GattServer, ServerConfig};
use crate::gap::{AddressType, BdAddr};
use crate::gatt::{flags, CharacteristicDef, DescriptorDef, ServiceDef};
use crate::transport::{
    AdvertisingParams, ConnectionParams, ServerTransport, TransportCallbacks, TransportError,
};
use crate::uuid::Uuid;

// ---------------------------------------------------------------------------
// Mock transport

#[derive(Default)]
struct MockState {
    sent: Vec<(u16, Vec<u8>)>,
    inbound: VecDeque<(u16, Vec<u8>)>,
    pending_connections: VecDeque<ConnectionParams>,
    mtus: HashMap<u16, u16>,
    fail_sends: bool,
}

/// Server transport that records outbound PDUs and replays queued inbound
/// traffic on `process_events`.
struct MockTransport {
    state: Arc<Mutex<MockState>>,
    callbacks: TransportCallbacks,
    advertising: bool,
}

impl MockTransport {
    fn new(state: Arc<Mutex<MockState>>) -> Self {
        MockTransport {
            state,
            callbacks: TransportCallbacks::noop(),
            advertising: false,
        }
    }
}

impl ServerTransport for MockTransport {
    fn start_advertising(&mut self, _params: &AdvertisingParams) -> Result<(), TransportError> {
        self.advertising = true;
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), TransportError> {
        self.advertising = false;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertising
    }

    fn accept_connection(&mut self) -> Result<(), TransportError> {
        let pending = self.state.lock().unwrap().pending_connections.pop_front();
        if let Some(params) = pending {
            (self.callbacks.on_connected)(params);
        }
        Ok(())
    }

    fn disconnect(&mut self, conn_handle: u16) -> Result<(), TransportError> {
        (self.callbacks.on_disconnected)(conn_handle, 0x16);
        Ok(())
    }

    fn send_pdu(&mut self, conn_handle: u16, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock send failure",
            )));
        }
        state.sent.push((conn_handle, data.to_vec()));
        Ok(data.len())
    }

    fn recv_pdu(&mut self, _conn_handle: u16, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn set_mtu(&mut self, conn_handle: u16, mtu: u16) -> Result<(), TransportError> {
        self.state.lock().unwrap().mtus.insert(conn_handle, mtu);
        Ok(())
    }

    fn get_mtu(&self, conn_handle: u16) -> u16 {
        self.state
            .lock()
            .unwrap()
            .mtus
            .get(&conn_handle)
            .copied()
            .unwrap_or(23)
    }

    fn process_events(&mut self) -> Result<(), TransportError> {
        loop {
            let next = self.state.lock().unwrap().inbound.pop_front();
            let Some((conn_handle, data)) = next else {
                return Ok(());
            };
            (self.callbacks.on_data_received)(conn_handle, &data);
        }
    }

    fn set_callbacks(&mut self, callbacks: TransportCallbacks) {
        self.callbacks = callbacks;
    }
}

// ---------------------------------------------------------------------------
// Harness

const CONN: u16 = 1;

fn new_server() -> (GattServer<MockTransport>, Arc<Mutex<MockState>>) {
    let state = Arc::new(Mutex::new(MockState::default()));
    let server = GattServer::new(MockTransport::new(Arc::clone(&state)), ServerConfig::default());
    (server, state)
}

fn connect(server: &mut GattServer<MockTransport>, state: &Arc<Mutex<MockState>>) {
    state
        .lock()
        .unwrap()
        .pending_connections
        .push_back(ConnectionParams {
            conn_handle: CONN,
            peer_address: BdAddr::new([0x55, 0x44, 0x33, 0x22, 0x11, 0x00]),
            peer_address_type: AddressType::Public,
            mtu: 23,
        });
    server.process().unwrap();
}

/// Queues a client PDU, runs one engine turn, and returns everything the
/// server sent during it.
fn exchange(
    server: &mut GattServer<MockTransport>,
    state: &Arc<Mutex<MockState>>,
    pdu: &[u8],
) -> Vec<Vec<u8>> {
    let before = state.lock().unwrap().sent.len();
    state
        .lock()
        .unwrap()
        .inbound
        .push_back((CONN, pdu.to_vec()));
    server.process().unwrap();
    state.lock().unwrap().sent[before..]
        .iter()
        .map(|(_, pdu)| pdu.clone())
        .collect()
}

/// One battery-style service: read-only characteristic, no CCCD.
/// Handles: service 1, declaration 2, value 3.
fn battery_service_plain() -> ServiceDef {
    ServiceDef::primary(Uuid::from_u16(0x180F)).with_characteristic(
        CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ).with_value(vec![0x64]),
    )
}

/// Same service with notify: service 1, declaration 2, value 3, CCCD 4.
fn battery_service_notify() -> ServiceDef {
    ServiceDef::primary(Uuid::from_u16(0x180F)).with_characteristic(
        CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ | flags::NOTIFY)
            .with_value(vec![0x64]),
    )
}

// ---------------------------------------------------------------------------
// Database invariants

#[test]
fn handles_are_laid_out_decl_value_cccd() {
    let db = AttributeDatabase::new();
    let regs = db.register_services(&[battery_service_notify()]).unwrap();

    assert_eq!(regs[0].service_handle, 1);
    let chr = &regs[0].characteristics[0];
    assert_eq!(chr.declaration_handle, 2);
    assert_eq!(chr.value_handle, 3);
    assert_eq!(chr.cccd_handle, Some(4));

    // Value attribute sits at declaration + 1 and carries the char UUID.
    let value = db.get(3).unwrap();
    assert_eq!(value.type_uuid, Uuid::from_u16(0x2A19));

    // CCCD sits at value + 1, readable and writable, initialised to 0x0000.
    let cccd = db.get(4).unwrap();
    assert_eq!(cccd.type_uuid, Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID));
    assert!(cccd.readable() && cccd.writable());
    assert_eq!(cccd.value, vec![0x00, 0x00]);

    // Service group covers everything.
    let svc = db.get(1).unwrap();
    assert_eq!(svc.end_group_handle, 4);
}

#[test]
fn no_cccd_without_notify_or_indicate() {
    let db = AttributeDatabase::new();
    let regs = db.register_services(&[battery_service_plain()]).unwrap();
    assert_eq!(regs[0].characteristics[0].cccd_handle, None);
    assert!(db.get(4).is_none());
    assert_eq!(db.get(1).unwrap().end_group_handle, 3);
}

#[test]
fn range_of_single_handle_returns_exactly_that_attribute() {
    let db = AttributeDatabase::new();
    db.register_services(&[battery_service_notify()]).unwrap();

    for attr in db.range(ATT_HANDLE_MIN, ATT_HANDLE_MAX) {
        let single = db.range(attr.handle, attr.handle);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].handle, attr.handle);
    }
}

#[test]
fn inverted_range_is_empty() {
    let db = AttributeDatabase::new();
    db.register_services(&[battery_service_plain()]).unwrap();
    assert!(db.range(3, 1).is_empty());
    assert!(db.find_by_type(3, 1, &Uuid::from_u16(PRIMARY_SERVICE_UUID)).is_empty());
}

#[test]
fn services_partition_the_used_handle_space() {
    let db = AttributeDatabase::new();
    db.register_services(&[
        battery_service_notify(),
        ServiceDef::primary(Uuid::from_u16(0x180A)).with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A29), flags::READ)
                .with_value(b"acme".to_vec()),
        ),
    ])
    .unwrap();

    let services: Vec<_> = db
        .find_by_type(ATT_HANDLE_MIN, ATT_HANDLE_MAX, &Uuid::from_u16(PRIMARY_SERVICE_UUID))
        .into_iter()
        .collect();
    assert_eq!(services.len(), 2);

    for pair in services.windows(2) {
        assert!(pair[0].end_group_handle >= pair[0].handle);
        // No gap between one service's group and the next declaration.
        assert_eq!(pair[0].end_group_handle + 1, pair[1].handle);
    }
    let last = services.last().unwrap();
    assert_eq!(last.end_group_handle, db.next_handle() - 1);
}

#[test]
fn descriptors_extend_the_owning_service_group() {
    let db = AttributeDatabase::new();
    let svc = db.add_primary_service(Uuid::from_u16(0x180F)).unwrap();
    let decl = db
        .add_characteristic(svc, Uuid::from_u16(0x2A19), GATT_PROP_READ, ATT_PERM_READ)
        .unwrap();
    let dsc = db
        .add_descriptor(decl + 1, Uuid::from_u16(0x2901), ATT_PERM_READ)
        .unwrap();

    assert_eq!(db.get(svc).unwrap().end_group_handle, dsc);
}

#[test]
fn include_value_references_target_service() {
    let db = AttributeDatabase::new();
    let inc_svc = db.add_secondary_service(Uuid::from_u16(0x180A)).unwrap();
    db.add_characteristic(inc_svc, Uuid::from_u16(0x2A29), GATT_PROP_READ, ATT_PERM_READ)
        .unwrap();
    let svc = db.add_primary_service(Uuid::from_u16(0x180F)).unwrap();
    let include = db.add_include(svc, inc_svc).unwrap();

    let attr = db.get(include).unwrap();
    assert_eq!(attr.type_uuid, Uuid::from_u16(INCLUDE_UUID));
    // included handle, its group end, its 16-bit UUID
    assert_eq!(attr.value[0..2], inc_svc.to_le_bytes());
    assert_eq!(attr.value[2..4], 3u16.to_le_bytes());
    assert_eq!(attr.value[4..6], 0x180Au16.to_le_bytes());
}

#[test]
fn handle_space_exhaustion_is_reported() {
    let db = AttributeDatabase::new();
    let svc = db.add_primary_service(Uuid::from_u16(0x180F)).unwrap();
    loop {
        match db.add_characteristic(svc, Uuid::from_u16(0x2A19), GATT_PROP_READ, ATT_PERM_READ) {
            Ok(_) => {}
            Err(DbError::HandleSpaceExhausted) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(db.next_handle(), ATT_HANDLE_MAX);
}

#[test]
fn failed_registration_leaves_partial_state_for_caller_to_discard() {
    let db = AttributeDatabase::new();
    let defs = [
        battery_service_plain(),
        // Include of a never-registered service handle.
        ServiceDef::primary(Uuid::from_u16(0x180A)).with_include(0x4242),
    ];
    assert!(db.register_services(&defs).is_err());
    assert!(!db.is_empty());

    db.clear();
    assert!(db.is_empty());
    assert_eq!(db.next_handle(), ATT_HANDLE_MIN);
}

#[test]
fn characteristic_value_accessors_check_kind() {
    let db = AttributeDatabase::new();
    db.register_services(&[battery_service_plain()]).unwrap();

    db.set_characteristic_value(3, vec![0x42]).unwrap();
    assert_eq!(db.characteristic_value(3).unwrap(), vec![0x42]);

    assert_eq!(
        db.set_characteristic_value(2, vec![]),
        Err(DbError::NotCharacteristicValue(2))
    );
    assert_eq!(
        db.characteristic_value(0x100).unwrap_err(),
        DbError::UnknownHandle(0x100)
    );
}

// ---------------------------------------------------------------------------
// Server engine scenarios

#[test]
fn mtu_exchange_negotiates_minimum() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    // Client offers MTU 100; server answers with its own maximum, 517.
    let sent = exchange(&mut server, &state, &[0x02, 0x64, 0x00]);
    assert_eq!(sent, vec![vec![0x03, 0x05, 0x02]]);

    assert_eq!(server.connection_state(CONN).unwrap().mtu, 100);
    assert_eq!(state.lock().unwrap().mtus.get(&CONN), Some(&100));
}

#[test]
fn mtu_below_default_is_honored() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    // A client offering less than 23 gets exactly what it asked for.
    let sent = exchange(&mut server, &state, &[0x02, 0x10, 0x00]);
    assert_eq!(sent, vec![vec![0x03, 0x05, 0x02]]);

    assert_eq!(server.connection_state(CONN).unwrap().mtu, 16);
    assert_eq!(state.lock().unwrap().mtus.get(&CONN), Some(&16));
}

#[test]
fn primary_service_discovery() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
    assert_eq!(
        sent,
        vec![vec![0x11, 0x06, 0x01, 0x00, 0x03, 0x00, 0x0F, 0x18]]
    );
}

#[test]
fn characteristic_discovery() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_notify()]).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x08, 0x01, 0x00, 0x03, 0x00, 0x03, 0x28]);
    // Declaration at 2: properties 0x12, value handle 3, UUID 0x2A19.
    assert_eq!(
        sent,
        vec![vec![0x09, 0x07, 0x02, 0x00, 0x12, 0x03, 0x00, 0x19, 0x2A]]
    );
}

#[test]
fn read_by_type_drops_length_mismatched_values() {
    let (mut server, state) = new_server();
    // Three characteristics of the same UUID; the middle value is longer
    // than the first, the last matches it.
    server.register_services(&[ServiceDef::primary(Uuid::from_u16(0x180F))
        .with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ).with_value(vec![0xAA]),
        )
        .with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ)
                .with_value(vec![0x01, 0x02, 0x03]),
        )
        .with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ).with_value(vec![0xBB]),
        )])
        .unwrap();
    connect(&mut server, &state);

    // Read By Type on the characteristic UUID hits the value attributes at
    // handles 3, 5 and 7. The first fixes the pair length at 3; the longer
    // value at handle 5 is excluded rather than truncated.
    let sent = exchange(&mut server, &state, &[0x08, 0x01, 0x00, 0xFF, 0xFF, 0x19, 0x2A]);
    assert_eq!(
        sent,
        vec![vec![0x09, 0x03, 0x03, 0x00, 0xAA, 0x07, 0x00, 0xBB]]
    );
}

#[test]
fn read_callback_error_travels_verbatim() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    server
        .db()
        .set_read_callback(3, Arc::new(|_, _| Err(AttErrorCode::InvalidOffset)))
        .unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x0A, 0x03, 0x00]);
    assert_eq!(sent, vec![vec![0x01, 0x0A, 0x03, 0x00, 0x07]]);
}

#[test]
fn cccd_write_enables_notifications() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_notify()]).unwrap();
    connect(&mut server, &state);

    // Enable notifications on the CCCD at handle 4.
    let sent = exchange(&mut server, &state, &[0x12, 0x04, 0x00, 0x01, 0x00]);
    assert_eq!(sent, vec![vec![0x13]]);
    assert_eq!(
        server.connection_state(CONN).unwrap().cccd_values.get(&3),
        Some(&0x0001)
    );

    server.notify(CONN, 3, &[0x55]).unwrap();
    let last = state.lock().unwrap().sent.last().cloned().unwrap();
    assert_eq!(last, (CONN, vec![0x1B, 0x03, 0x00, 0x55]));
}

#[test]
fn notify_requires_cccd_bit() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_notify()]).unwrap();
    connect(&mut server, &state);

    assert!(matches!(
        server.notify(CONN, 3, &[0x55]),
        Err(ServerError::NotificationsDisabled(3))
    ));
    assert!(matches!(
        server.notify(99, 3, &[0x55]),
        Err(ServerError::UnknownConnection(99))
    ));
}

#[test]
fn second_indication_in_flight_is_busy() {
    let (mut server, state) = new_server();
    server.register_services(&[ServiceDef::primary(Uuid::from_u16(0x180F))
        .with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ | flags::INDICATE)
                .with_value(vec![0x64]),
        )])
        .unwrap();
    connect(&mut server, &state);

    // Enable indications.
    exchange(&mut server, &state, &[0x12, 0x04, 0x00, 0x02, 0x00]);

    server.indicate(CONN, 3, &[0x01]).unwrap();
    assert!(matches!(
        server.indicate(CONN, 3, &[0x02]),
        Err(ServerError::Busy)
    ));

    // The confirmation clears the outstanding marker.
    exchange(&mut server, &state, &[0x1E]);
    server.indicate(CONN, 3, &[0x03]).unwrap();

    let pdus: Vec<Vec<u8>> = state
        .lock()
        .unwrap()
        .sent
        .iter()
        .filter(|(_, p)| p[0] == 0x1D)
        .map(|(_, p)| p.clone())
        .collect();
    assert_eq!(pdus, vec![vec![0x1D, 0x03, 0x00, 0x01], vec![0x1D, 0x03, 0x00, 0x03]]);
}

// ---------------------------------------------------------------------------
// Boundary behaviours

#[test]
fn read_truncates_to_mtu_and_blob_continues() {
    let (mut server, state) = new_server();
    let value: Vec<u8> = (0..40).collect();
    server.register_services(&[ServiceDef::primary(Uuid::from_u16(0x180F))
        .with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ).with_value(value.clone()),
        )])
        .unwrap();
    connect(&mut server, &state);

    // Default MTU 23: a read returns the first 22 bytes.
    let sent = exchange(&mut server, &state, &[0x0A, 0x03, 0x00]);
    assert_eq!(sent[0][0], 0x0B);
    assert_eq!(sent[0].len(), 23);
    assert_eq!(&sent[0][1..], &value[..22]);

    // Read Blob with offset 22 returns the remaining 18 bytes.
    let sent = exchange(&mut server, &state, &[0x0C, 0x03, 0x00, 0x16, 0x00]);
    assert_eq!(sent[0][0], 0x0D);
    assert_eq!(&sent[0][1..], &value[22..]);

    // Offset at the end of the value is invalid.
    let sent = exchange(&mut server, &state, &[0x0C, 0x03, 0x00, 0x28, 0x00]);
    assert_eq!(sent, vec![vec![0x01, 0x0C, 0x03, 0x00, 0x07]]);
}

#[test]
fn find_information_rejects_handle_zero_and_inverted_ranges() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x04, 0x00, 0x00, 0xFF, 0xFF]);
    assert_eq!(sent, vec![vec![0x01, 0x04, 0x00, 0x00, 0x01]]);

    let sent = exchange(&mut server, &state, &[0x04, 0x05, 0x00, 0x02, 0x00]);
    assert_eq!(sent, vec![vec![0x01, 0x04, 0x05, 0x00, 0x01]]);
}

#[test]
fn find_information_lists_handle_type_pairs() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x04, 0x01, 0x00, 0xFF, 0xFF]);
    assert_eq!(
        sent,
        vec![vec![
            0x05, 0x01, // format: 16-bit
            0x01, 0x00, 0x00, 0x28, // 1: primary service
            0x02, 0x00, 0x03, 0x28, // 2: characteristic declaration
            0x03, 0x00, 0x19, 0x2A, // 3: battery level
        ]]
    );
}

#[test]
fn group_type_other_than_primary_service_is_unsupported() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x03, 0x28]);
    assert_eq!(sent, vec![vec![0x01, 0x10, 0x01, 0x00, 0x10]]);
}

#[test]
fn write_command_with_unknown_handle_is_silent() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x52, 0x99, 0x00, 0x01]);
    assert!(sent.is_empty());
}

#[test]
fn write_request_rejects_unwritable_attribute() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    // The battery level is read-only.
    let sent = exchange(&mut server, &state, &[0x12, 0x03, 0x00, 0x01]);
    assert_eq!(sent, vec![vec![0x01, 0x12, 0x03, 0x00, 0x03]]);
}

#[test]
fn unsupported_requests_get_request_not_supported() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    // Prepare Write, Execute Write, and an unknown opcode.
    for opcode in [0x16u8, 0x18, 0x7F] {
        let sent = exchange(&mut server, &state, &[opcode, 0x01, 0x00]);
        assert_eq!(sent, vec![vec![0x01, opcode, 0x00, 0x00, 0x06]]);
    }

    // Signed Write Command is ignored without a response.
    let sent = exchange(&mut server, &state, &[0xD2, 0x03, 0x00, 0x01]);
    assert!(sent.is_empty());
}

#[test]
fn truncated_request_yields_invalid_pdu() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x0A, 0x03]);
    assert_eq!(sent, vec![vec![0x01, 0x0A, 0x00, 0x00, 0x04]]);
}

#[test]
fn responses_never_exceed_mtu_and_pairs_divide_evenly() {
    let (mut server, state) = new_server();
    // Five services, every group response pair is 6 bytes.
    let defs: Vec<ServiceDef> = [0x1800u16, 0x1801, 0x180A, 0x180F, 0x1810]
        .iter()
        .map(|&u| {
            ServiceDef::primary(Uuid::from_u16(u)).with_characteristic(
                CharacteristicDef::new(Uuid::from_u16(0x2A00), flags::READ).with_value(vec![0]),
            )
        })
        .collect();
    server.register_services(&defs).unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
    let rsp = &sent[0];
    assert_eq!(rsp[0], 0x11);
    assert!(rsp.len() <= 23);

    let pair_len = rsp[1] as usize;
    assert_eq!(pair_len, 6);
    assert_eq!((rsp.len() - 2) % pair_len, 0);
    // MTU 23 fits three 6-byte pairs, not five.
    assert_eq!((rsp.len() - 2) / pair_len, 3);
}

#[test]
fn group_discovery_resumes_from_continuation_handle() {
    let (mut server, state) = new_server();
    let defs: Vec<ServiceDef> = [0x1800u16, 0x1801, 0x180A, 0x180F, 0x1810]
        .iter()
        .map(|&u| {
            ServiceDef::primary(Uuid::from_u16(u)).with_characteristic(
                CharacteristicDef::new(Uuid::from_u16(0x2A00), flags::READ).with_value(vec![0]),
            )
        })
        .collect();
    server.register_services(&defs).unwrap();
    connect(&mut server, &state);

    let first = exchange(&mut server, &state, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
    let last_end = u16::from_le_bytes([
        first[0][first[0].len() - 4],
        first[0][first[0].len() - 3],
    ]);

    // Client continues after the last returned group.
    let next_start = (last_end + 1).to_le_bytes();
    let second = exchange(
        &mut server,
        &state,
        &[0x10, next_start[0], next_start[1], 0xFF, 0xFF, 0x00, 0x28],
    );
    assert_eq!(second[0][0], 0x11);
    assert_eq!((second[0].len() - 2) / 6, 2);

    // Past the last service the search comes up empty.
    let sent = exchange(&mut server, &state, &[0x10, 0xF0, 0xFF, 0xFF, 0xFF, 0x00, 0x28]);
    assert_eq!(sent[0][..2], [0x01, 0x10]);
    assert_eq!(sent[0][4], 0x0A); // attribute not found
}

#[test]
fn find_by_type_value_locates_service_by_uuid() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);

    // Find Primary Service with value 0x180F.
    let sent = exchange(
        &mut server,
        &state,
        &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x0F, 0x18],
    );
    assert_eq!(sent, vec![vec![0x07, 0x01, 0x00, 0x03, 0x00]]);

    // A UUID nobody registered.
    let sent = exchange(
        &mut server,
        &state,
        &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0xAA, 0xBB],
    );
    assert_eq!(sent, vec![vec![0x01, 0x06, 0x01, 0x00, 0x0A]]);
}

#[test]
fn send_failure_tears_the_connection_down() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_plain()]).unwrap();
    connect(&mut server, &state);
    assert!(server.connection_state(CONN).is_some());

    state.lock().unwrap().fail_sends = true;
    let sent = exchange(&mut server, &state, &[0x0A, 0x03, 0x00]);
    assert!(sent.is_empty());
    assert!(server.connection_state(CONN).is_none());
}

#[test]
fn disconnect_event_clears_cccd_state() {
    let (mut server, state) = new_server();
    server.register_services(&[battery_service_notify()]).unwrap();
    connect(&mut server, &state);
    exchange(&mut server, &state, &[0x12, 0x04, 0x00, 0x01, 0x00]);

    server.disconnect(CONN).unwrap();
    server.process().unwrap();
    assert!(server.connection_state(CONN).is_none());

    // Reconnecting starts from a clean CCCD slate.
    connect(&mut server, &state);
    assert!(server
        .connection_state(CONN)
        .unwrap()
        .cccd_values
        .is_empty());
}

#[test]
fn per_attribute_write_callback_sees_the_value() {
    let (mut server, state) = new_server();
    server.register_services(&[ServiceDef::primary(Uuid::from_u16(0x180F))
        .with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ | flags::WRITE),
        )])
        .unwrap();

    let written: Arc<Mutex<Vec<u8>>> = Arc::default();
    let sink = Arc::clone(&written);
    server
        .db()
        .set_write_callback(
            3,
            Arc::new(move |_conn, value| {
                *sink.lock().unwrap() = value.to_vec();
                Ok(())
            }),
        )
        .unwrap();
    connect(&mut server, &state);

    let sent = exchange(&mut server, &state, &[0x12, 0x03, 0x00, 0xDE, 0xAD]);
    assert_eq!(sent, vec![vec![0x13]]);
    assert_eq!(*written.lock().unwrap(), vec![0xDE, 0xAD]);
}

#[test]
fn descriptor_definitions_are_registered_and_discoverable() {
    let (mut server, state) = new_server();
    server.register_services(&[ServiceDef::primary(Uuid::from_u16(0x180F))
        .with_characteristic(
            CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ)
                .with_value(vec![0x64])
                .with_descriptor(DescriptorDef::new(Uuid::from_u16(0x2901), ATT_PERM_READ)),
        )])
        .unwrap();
    connect(&mut server, &state);

    // Descriptor at handle 4, discoverable via Find Information.
    let sent = exchange(&mut server, &state, &[0x04, 0x04, 0x00, 0x04, 0x00]);
    assert_eq!(sent, vec![vec![0x05, 0x01, 0x04, 0x00, 0x01, 0x29]]);
}
