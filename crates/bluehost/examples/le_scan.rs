//! Scans for BLE advertisements for ten seconds and prints what it finds.

use std::time::{Duration, Instant};

use bluehost::scan::{FilterDuplicates, Scanner};
use bluehost::transport::socket::SocketClientTransport;
use bluehost::Timeout;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut transport = SocketClientTransport::new(0)?;
    let mut scanner = Scanner::new(&mut transport, FilterDuplicates::Software);
    scanner.start(true)?;
    println!("Scanning for 10 seconds...");

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        for report in scanner.get_advertisements(Timeout::Millis(500))? {
            let name = report
                .fields
                .local_name
                .as_ref()
                .map(|n| n.name.as_str())
                .unwrap_or("(no name)");
            let rssi = if report.rssi == 127 {
                "n/a".to_string()
            } else {
                format!("{} dBm", report.rssi)
            };
            println!(
                "{}  {:?}  rssi={}  {}  uuids={:?}",
                report.address, report.event_type, rssi, name, report.fields.uuids
            );
        }
    }

    scanner.stop()?;
    Ok(())
}
