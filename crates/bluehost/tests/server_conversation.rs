//! Drives a GATT server through a full discovery conversation over an
//! in-memory transport, asserting the exact bytes a central would see.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bluehost::att::AttErrorCode;
use bluehost::gatt::{flags, CharacteristicDef, ServiceDef};
use bluehost::transport::{
    AdvertisingParams, ConnectionParams, ServerTransport, TransportCallbacks, TransportError,
};
use bluehost::{AddressType, BdAddr, GattServer, ServerConfig, Uuid};

#[derive(Default)]
struct WireState {
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    pending_connection: bool,
}

/// In-memory transport connecting the server to a scripted central.
struct LoopbackTransport {
    state: Arc<Mutex<WireState>>,
    callbacks: TransportCallbacks,
    advertising: bool,
    mtu: u16,
}

const CONN: u16 = 0x0040;

impl LoopbackTransport {
    fn new(state: Arc<Mutex<WireState>>) -> Self {
        LoopbackTransport {
            state,
            callbacks: TransportCallbacks::noop(),
            advertising: false,
            mtu: 23,
        }
    }
}

impl ServerTransport for LoopbackTransport {
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
        let pending = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.pending_connection)
        };
        if pending {
            (self.callbacks.on_connected)(ConnectionParams {
                conn_handle: CONN,
                peer_address: "AA:BB:CC:DD:EE:FF".parse::<BdAddr>().unwrap(),
                peer_address_type: AddressType::Random,
                mtu: 23,
            });
        }
        Ok(())
    }

    fn disconnect(&mut self, conn_handle: u16) -> Result<(), TransportError> {
        (self.callbacks.on_disconnected)(conn_handle, 0x16);
        Ok(())
    }

    fn send_pdu(&mut self, _conn_handle: u16, data: &[u8]) -> Result<usize, TransportError> {
        self.state.lock().unwrap().sent.push(data.to_vec());
        Ok(data.len())
    }

    fn recv_pdu(&mut self, _conn_handle: u16, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn set_mtu(&mut self, _conn_handle: u16, mtu: u16) -> Result<(), TransportError> {
        self.mtu = mtu;
        Ok(())
    }

    fn get_mtu(&self, _conn_handle: u16) -> u16 {
        self.mtu
    }

    fn process_events(&mut self) -> Result<(), TransportError> {
        loop {
            let next = self.state.lock().unwrap().inbound.pop_front();
            let Some(pdu) = next else { return Ok(()) };
            (self.callbacks.on_data_received)(CONN, &pdu);
        }
    }

    fn set_callbacks(&mut self, callbacks: TransportCallbacks) {
        self.callbacks = callbacks;
    }
}

fn request(
    server: &mut GattServer<LoopbackTransport>,
    state: &Arc<Mutex<WireState>>,
    pdu: &[u8],
) -> Vec<Vec<u8>> {
    let before = state.lock().unwrap().sent.len();
    state.lock().unwrap().inbound.push_back(pdu.to_vec());
    server.process().unwrap();
    state.lock().unwrap().sent[before..].to_vec()
}

#[test]
fn full_discovery_conversation() {
    let state = Arc::new(Mutex::new(WireState::default()));
    let mut server = GattServer::new(
        LoopbackTransport::new(Arc::clone(&state)),
        ServerConfig::default(),
    );

    // Device Information (handles 1..3) and Battery (handles 4..7, with
    // CCCD) services.
    let device_name = b"widget".to_vec();
    let name = device_name.clone();
    let registered = server
        .register_services(&[
            ServiceDef::primary(Uuid::from_u16(0x180A)).with_characteristic(
                CharacteristicDef::new(Uuid::from_u16(0x2A29), flags::READ).with_read_cb(
                    Arc::new(move |_conn, offset| {
                        if offset as usize >= name.len() {
                            return Err(AttErrorCode::InvalidOffset);
                        }
                        Ok(name[offset as usize..].to_vec())
                    }),
                ),
            ),
            ServiceDef::primary(Uuid::from_u16(0x180F)).with_characteristic(
                CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ | flags::NOTIFY)
                    .with_value(vec![0x5A]),
            ),
        ])
        .unwrap();

    assert_eq!(registered[0].service_handle, 1);
    assert_eq!(registered[1].service_handle, 4);
    let battery_value = registered[1].characteristics[0].value_handle;
    assert_eq!(battery_value, 6);
    assert_eq!(registered[1].characteristics[0].cccd_handle, Some(7));

    let connected = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&connected);
    server.on_connected = Some(Box::new(move |conn, peer| {
        log.lock().unwrap().push((conn, peer.to_string()));
    }));

    // Central connects.
    state.lock().unwrap().pending_connection = true;
    server.process().unwrap();
    assert_eq!(
        *connected.lock().unwrap(),
        vec![(CONN, "AA:BB:CC:DD:EE:FF".to_string())]
    );

    // 1. MTU exchange at 185.
    let sent = request(&mut server, &state, &[0x02, 0xB9, 0x00]);
    assert_eq!(sent, vec![vec![0x03, 0x05, 0x02]]);
    assert_eq!(server.connection_state(CONN).unwrap().mtu, 185);

    // 2. Primary service discovery finds both groups in one response.
    let sent = request(&mut server, &state, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
    assert_eq!(
        sent,
        vec![vec![
            0x11, 0x06, //
            0x01, 0x00, 0x03, 0x00, 0x0A, 0x18, // device info: 1..3
            0x04, 0x00, 0x07, 0x00, 0x0F, 0x18, // battery: 4..7
        ]]
    );

    // 3. Characteristic discovery inside the battery service.
    let sent = request(&mut server, &state, &[0x08, 0x04, 0x00, 0x07, 0x00, 0x03, 0x28]);
    assert_eq!(
        sent,
        vec![vec![0x09, 0x07, 0x05, 0x00, 0x12, 0x06, 0x00, 0x19, 0x2A]]
    );

    // 4. Descriptor discovery: CCCD at 7.
    let sent = request(&mut server, &state, &[0x04, 0x07, 0x00, 0x07, 0x00]);
    assert_eq!(sent, vec![vec![0x05, 0x01, 0x07, 0x00, 0x02, 0x29]]);

    // 5. Callback-backed read of the manufacturer name.
    let sent = request(&mut server, &state, &[0x0A, 0x03, 0x00]);
    let mut expected = vec![0x0B];
    expected.extend_from_slice(&device_name);
    assert_eq!(sent, vec![expected]);

    // 6. Enable notifications and observe one.
    let sent = request(&mut server, &state, &[0x12, 0x07, 0x00, 0x01, 0x00]);
    assert_eq!(sent, vec![vec![0x13]]);
    server.notify(CONN, battery_value, &[0x59]).unwrap();
    assert_eq!(
        state.lock().unwrap().sent.last().unwrap(),
        &vec![0x1B, 0x06, 0x00, 0x59]
    );

    // 7. Disconnect wipes per-connection state.
    server.disconnect(CONN).unwrap();
    server.process().unwrap();
    assert!(server.connection_state(CONN).is_none());
    assert!(matches!(
        server.notify(CONN, battery_value, &[0x00]),
        Err(bluehost::ServerError::UnknownConnection(_))
    ));
}

#[test]
fn advertising_lifecycle_is_idempotent() {
    let state = Arc::new(Mutex::new(WireState::default()));
    let mut server = GattServer::new(
        LoopbackTransport::new(Arc::clone(&state)),
        ServerConfig::default(),
    );
    server
        .register_services(&[ServiceDef::primary(Uuid::from_u16(0x180F))])
        .unwrap();

    let params = AdvertisingParams {
        device_name: "widget".into(),
        service_uuids: vec![Uuid::from_u16(0x180F)],
        ..Default::default()
    };
    assert!(!server.is_advertising());
    server.start_advertising(&params).unwrap();
    server.start_advertising(&params).unwrap();
    assert!(server.is_advertising());
    server.stop_advertising().unwrap();
    server.stop_advertising().unwrap();
    assert!(!server.is_advertising());
}
