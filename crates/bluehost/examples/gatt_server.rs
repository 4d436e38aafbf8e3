//! A minimal GATT server exposing a Battery Service over the socket
//! transport. Requires a Bluetooth adapter and CAP_NET_ADMIN.

use std::sync::{Arc, Mutex};

use bluehost::att::AttErrorCode;
use bluehost::gatt::{flags, CharacteristicDef, ServiceDef};
use bluehost::transport::socket::SocketServerTransport;
use bluehost::{AdvertisingParams, GattServer, ServerConfig, Uuid};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let transport = match SocketServerTransport::new(0) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to open transport: {}", e);
            eprintln!("Is a Bluetooth adapter present and are you running with privileges?");
            return Err(e.into());
        }
    };

    let mut server = GattServer::new(transport, ServerConfig::default());

    let battery_level = Arc::new(Mutex::new(88u8));
    let level = Arc::clone(&battery_level);

    let battery = ServiceDef::primary(Uuid::from_u16(0x180F)).with_characteristic(
        CharacteristicDef::new(Uuid::from_u16(0x2A19), flags::READ | flags::NOTIFY).with_read_cb(
            Arc::new(move |_conn, offset| {
                if offset > 0 {
                    return Err(AttErrorCode::InvalidOffset);
                }
                Ok(vec![*level.lock().unwrap()])
            }),
        ),
    );

    let registered = server.register_services(&[battery])?;
    let value_handle = registered[0].characteristics[0].value_handle;
    println!("Battery level characteristic at handle 0x{:04X}", value_handle);

    server.on_connected = Some(Box::new(|conn, peer| {
        println!("Connected: handle={} peer={}", conn, peer);
    }));
    server.on_disconnected = Some(Box::new(|conn| {
        println!("Disconnected: handle={}", conn);
    }));

    server.start_advertising(&AdvertisingParams {
        device_name: "bluehost-demo".into(),
        service_uuids: vec![Uuid::from_u16(0x180F)],
        ..Default::default()
    })?;
    println!("Advertising; press Ctrl-C to quit");

    server.run()?;
    Ok(())
}
