//! LE advertising report decoding and the transport-agnostic scanner.

use std::collections::HashSet;

use log::{debug, warn};
use thiserror::Error;

use crate::gap::{AddressType, BdAddr};
use crate::transport::{ClientTransport, RawAdvertisement, ScanParams, Timeout, TransportError};
use crate::uuid::Uuid;

/// GAP advertising data (AD) type codes.
pub mod ad {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_16BIT_UUIDS: u8 = 0x02;
    pub const COMPLETE_16BIT_UUIDS: u8 = 0x03;
    pub const INCOMPLETE_128BIT_UUIDS: u8 = 0x06;
    pub const COMPLETE_128BIT_UUIDS: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const SERVICE_DATA_16BIT: u8 = 0x16;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// LE advertising PDU event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertisingEventType {
    /// Connectable undirected advertising.
    AdvInd,
    /// Connectable directed advertising.
    AdvDirectInd,
    /// Scannable undirected advertising.
    AdvScanInd,
    /// Non-connectable undirected advertising.
    AdvNonconnInd,
    /// Response to a scan request.
    ScanRsp,
    Unknown(u8),
}

impl From<u8> for AdvertisingEventType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => AdvertisingEventType::AdvInd,
            0x01 => AdvertisingEventType::AdvDirectInd,
            0x02 => AdvertisingEventType::AdvScanInd,
            0x03 => AdvertisingEventType::AdvNonconnInd,
            0x04 => AdvertisingEventType::ScanRsp,
            v => AdvertisingEventType::Unknown(v),
        }
    }
}

/// Decoded Flags AD structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvFlags {
    pub le_limited_discoverable: bool,
    pub le_general_discoverable: bool,
    pub br_edr_unsupported: bool,
    pub simultaneous_le_br_controller: bool,
    pub simultaneous_le_br_host: bool,
    pub raw: u8,
}

impl AdvFlags {
    fn from_byte(raw: u8) -> Self {
        AdvFlags {
            le_limited_discoverable: raw & (1 << 0) != 0,
            le_general_discoverable: raw & (1 << 1) != 0,
            br_edr_unsupported: raw & (1 << 2) != 0,
            simultaneous_le_br_controller: raw & (1 << 3) != 0,
            simultaneous_le_br_host: raw & (1 << 4) != 0,
            raw,
        }
    }
}

/// Local name AD structure with its completeness marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalName {
    pub name: String,
    pub complete: bool,
}

/// The structured fields parsed from one advertising payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvFields {
    pub flags: Option<AdvFlags>,
    pub uuids: Vec<Uuid>,
    pub uuid16_complete: bool,
    pub uuid128_complete: bool,
    pub local_name: Option<LocalName>,
    pub manufacturer_data: Vec<Vec<u8>>,
    pub service_data: Vec<Vec<u8>>,
    /// TLVs nobody recognised, as `(type, value)` pairs.
    pub unparsed: Vec<(u8, Vec<u8>)>,
}

/// One fully decoded advertising report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    pub address: BdAddr,
    pub address_type: AddressType,
    pub event_type: AdvertisingEventType,
    /// Signed dBm; 127 means unavailable.
    pub rssi: i8,
    pub fields: AdvFields,
    /// The raw advertising payload the fields were parsed from.
    pub raw: Vec<u8>,
}

/// Scanner and decoder errors.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner is not running")]
    NotRunning,

    #[error("malformed advertising data: {0}")]
    Parse(&'static str),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// LE Advertising Report subevent code under the LE Meta Event.
pub const LE_ADVERTISING_REPORT_SUBEVENT: u8 = 0x02;

/// Splits an LE Meta Event parameter block (starting at the subevent code)
/// into its raw per-device reports.
///
/// A report whose advertising payload later fails TLV parsing is the
/// caller's problem; this layer only validates the outer framing.
pub fn parse_le_meta_event(params: &[u8]) -> Result<Vec<RawAdvertisement>, ScanError> {
    if params.len() < 2 {
        return Err(ScanError::Parse("meta event too short"));
    }
    if params[0] != LE_ADVERTISING_REPORT_SUBEVENT {
        // Some other LE meta event; nothing for the scanner.
        return Ok(Vec::new());
    }

    let num_reports = params[1] as usize;
    let mut reports = Vec::with_capacity(num_reports);
    let mut rest = &params[2..];

    for _ in 0..num_reports {
        // event_type + addr_type + addr(6) + data_len = 9 bytes minimum.
        if rest.len() < 9 {
            return Err(ScanError::Parse("truncated advertising report"));
        }
        let event_type = rest[0];
        let address_type = AddressType::from(rest[1]);
        let address = BdAddr::from_slice(&rest[2..8]).ok_or(ScanError::Parse("short address"))?;
        let data_len = rest[8] as usize;
        rest = &rest[9..];

        if rest.len() < data_len + 1 {
            return Err(ScanError::Parse("advertising data overruns report"));
        }
        let data = rest[..data_len].to_vec();
        let rssi = rest[data_len] as i8;
        rest = &rest[data_len + 1..];

        reports.push(RawAdvertisement {
            address,
            address_type,
            event_type,
            rssi,
            data,
        });
    }

    Ok(reports)
}

/// Parses the TLV advertising payload of one report into structured fields.
pub fn parse_ad_fields(data: &[u8]) -> Result<AdvFields, ScanError> {
    let mut fields = AdvFields::default();
    let mut rest = data;

    while !rest.is_empty() {
        let len = rest[0] as usize;
        if len == 0 {
            // Zero-length structure terminates the payload.
            break;
        }
        if rest.len() < 1 + len {
            return Err(ScanError::Parse("TLV length overruns payload"));
        }
        let ad_type = rest[1];
        let value = &rest[2..1 + len];
        rest = &rest[1 + len..];

        match ad_type {
            ad::FLAGS => {
                if let Some(&raw) = value.first() {
                    fields.flags = Some(AdvFlags::from_byte(raw));
                }
            }
            ad::INCOMPLETE_16BIT_UUIDS | ad::COMPLETE_16BIT_UUIDS => {
                if value.len() % 2 != 0 {
                    return Err(ScanError::Parse("odd 16-bit UUID list length"));
                }
                fields.uuid16_complete = ad_type == ad::COMPLETE_16BIT_UUIDS;
                for chunk in value.chunks_exact(2) {
                    fields
                        .uuids
                        .push(Uuid::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            ad::INCOMPLETE_128BIT_UUIDS | ad::COMPLETE_128BIT_UUIDS => {
                if value.len() % 16 != 0 {
                    return Err(ScanError::Parse("bad 128-bit UUID list length"));
                }
                fields.uuid128_complete = ad_type == ad::COMPLETE_128BIT_UUIDS;
                for chunk in value.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    fields.uuids.push(Uuid::from_bytes_le(bytes));
                }
            }
            ad::SHORTENED_LOCAL_NAME | ad::COMPLETE_LOCAL_NAME => {
                fields.local_name = Some(LocalName {
                    name: String::from_utf8_lossy(value).into_owned(),
                    complete: ad_type == ad::COMPLETE_LOCAL_NAME,
                });
            }
            ad::MANUFACTURER_DATA => {
                fields.manufacturer_data.push(value.to_vec());
            }
            ad::SERVICE_DATA_16BIT => {
                fields.service_data.push(value.to_vec());
            }
            _ => {
                fields.unparsed.push((ad_type, value.to_vec()));
            }
        }
    }

    Ok(fields)
}

/// Duplicate suppression policy chosen at scanner construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDuplicates {
    /// Deliver every advertising event.
    Off,
    /// Suppress repeats in software, keyed by `(address, event type)`.
    Software,
}

/// Transport-agnostic BLE scanner.
///
/// Holds a non-owning reference to a client transport; works with any
/// [`ClientTransport`] implementation.
pub struct Scanner<'t> {
    transport: &'t mut dyn ClientTransport,
    running: bool,
    software_filtering: bool,
    seen: HashSet<(BdAddr, u8)>,
}

impl<'t> Scanner<'t> {
    pub fn new(transport: &'t mut dyn ClientTransport, filter: FilterDuplicates) -> Self {
        Scanner {
            transport,
            running: false,
            software_filtering: filter == FilterDuplicates::Software,
            seen: HashSet::new(),
        }
    }

    /// Starts scanning. A no-op if already running.
    pub fn start(&mut self, active: bool) -> Result<(), ScanError> {
        if self.running {
            debug!("scanner already running");
            return Ok(());
        }

        let params = ScanParams {
            active,
            interval_ms: 16,
            window_ms: 16,
            // Controller-side filtering only when software filtering is off.
            filter_duplicates: !self.software_filtering,
            ..Default::default()
        };
        self.transport.start_scan(&params)?;
        self.seen.clear();
        self.running = true;
        debug!("scanner started (active={})", active);
        Ok(())
    }

    /// Stops scanning. Idempotent.
    pub fn stop(&mut self) -> Result<(), ScanError> {
        if !self.running {
            return Ok(());
        }
        self.transport.stop_scan()?;
        self.running = false;
        debug!("scanner stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Drains pending advertisements from the transport and parses each
    /// payload. A record whose payload fails to parse is logged and dropped;
    /// the rest of the batch is unaffected.
    pub fn get_advertisements(
        &mut self,
        timeout: Timeout,
    ) -> Result<Vec<AdvertisingReport>, ScanError> {
        if !self.running {
            return Err(ScanError::NotRunning);
        }

        let raw = self.transport.get_advertisements(timeout)?;
        let mut reports = Vec::with_capacity(raw.len());

        for ad in raw {
            if self.software_filtering {
                let key = (ad.address, ad.event_type);
                if !self.seen.insert(key) {
                    continue;
                }
            }

            let fields = match parse_ad_fields(&ad.data) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("dropping corrupt advertisement from {}: {}", ad.address, e);
                    continue;
                }
            };

            reports.push(AdvertisingReport {
                address: ad.address,
                address_type: ad.address_type,
                event_type: AdvertisingEventType::from(ad.event_type),
                rssi: ad.rssi,
                fields,
                raw: ad.data,
            });
        }

        Ok(reports)
    }
}

impl Drop for Scanner<'_> {
    fn drop(&mut self) {
        if self.running {
            if let Err(e) = self.stop() {
                warn!("failed to stop scan on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnId, ConnectParams};

    #[test]
    fn parses_flags_uuids_and_name() {
        // Flags 0x06, complete 16-bit UUID list [0x180F], complete name "Test".
        let data = [
            0x02, 0x01, 0x06, 0x03, 0x03, 0x0F, 0x18, 0x05, 0x09, 0x54, 0x65, 0x73, 0x74,
        ];
        let fields = parse_ad_fields(&data).unwrap();

        let flags = fields.flags.unwrap();
        assert!(flags.le_general_discoverable);
        assert!(flags.br_edr_unsupported);
        assert!(!flags.le_limited_discoverable);

        assert_eq!(fields.uuids, vec![Uuid::from_u16(0x180F)]);
        assert!(fields.uuid16_complete);

        let name = fields.local_name.unwrap();
        assert_eq!(name.name, "Test");
        assert!(name.complete);
    }

    #[test]
    fn unknown_tlvs_are_kept_unparsed() {
        // TX power level (0x0A) is not interpreted.
        let data = [0x02, 0x0A, 0x04];
        let fields = parse_ad_fields(&data).unwrap();
        assert_eq!(fields.unparsed, vec![(0x0A, vec![0x04])]);
    }

    #[test]
    fn overrunning_tlv_is_an_error() {
        let data = [0x05, 0x09, 0x54];
        assert!(parse_ad_fields(&data).is_err());
    }

    #[test]
    fn zero_length_tlv_ends_payload() {
        let data = [0x02, 0x01, 0x06, 0x00, 0xFF, 0xFF];
        let fields = parse_ad_fields(&data).unwrap();
        assert!(fields.flags.is_some());
        assert!(fields.unparsed.is_empty());
    }

    #[test]
    fn meta_event_with_two_reports() {
        let mut params = vec![0x02, 0x02]; // subevent, num_reports
        for (addr, rssi) in [(0x11u8, 0xC8u8), (0x22, 0x7F)] {
            params.push(0x00); // ADV_IND
            params.push(0x00); // public
            params.extend_from_slice(&[addr; 6]);
            params.push(0x03); // data_len
            params.extend_from_slice(&[0x02, 0x01, 0x06]);
            params.push(rssi);
        }

        let reports = parse_le_meta_event(&params).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].rssi, -56);
        assert_eq!(reports[1].rssi, 127); // unavailable
        assert_eq!(reports[0].data, vec![0x02, 0x01, 0x06]);
    }

    #[test]
    fn truncated_meta_event_fails() {
        let params = vec![0x02, 0x01, 0x00, 0x00, 0x11, 0x22];
        assert!(parse_le_meta_event(&params).is_err());
    }

    #[test]
    fn other_subevents_yield_nothing() {
        // LE Connection Complete, not an advertising report.
        let params = vec![0x01, 0x00, 0x40, 0x00];
        assert!(parse_le_meta_event(&params).unwrap().is_empty());
    }

    #[test]
    fn synthesized_payload_round_trips() {
        use crate::transport::AdvertisingParams;

        let params = AdvertisingParams {
            device_name: "Round".into(),
            service_uuids: vec![Uuid::from_u16(0x180F), Uuid::from_u16(0x180A)],
            ..Default::default()
        };
        let payload = params.advertising_payload().unwrap();
        let fields = parse_ad_fields(&payload).unwrap();

        assert!(fields.flags.unwrap().le_general_discoverable);
        assert_eq!(
            fields.uuids,
            vec![Uuid::from_u16(0x180F), Uuid::from_u16(0x180A)]
        );
        assert!(fields.uuid16_complete);
        assert_eq!(fields.local_name.unwrap().name, "Round");
    }

    /// Client transport that replays canned advertisements.
    struct ReplayTransport {
        scanning: bool,
        queued: Vec<RawAdvertisement>,
    }

    impl ReplayTransport {
        fn with_ads(queued: Vec<RawAdvertisement>) -> Self {
            ReplayTransport {
                scanning: false,
                queued,
            }
        }
    }

    impl ClientTransport for ReplayTransport {
        fn start_scan(&mut self, _params: &ScanParams) -> Result<(), TransportError> {
            if self.scanning {
                return Err(TransportError::AlreadyScanning);
            }
            self.scanning = true;
            Ok(())
        }

        fn stop_scan(&mut self) -> Result<(), TransportError> {
            self.scanning = false;
            Ok(())
        }

        fn is_scanning(&self) -> bool {
            self.scanning
        }

        fn get_advertisements(
            &mut self,
            _timeout: Timeout,
        ) -> Result<Vec<RawAdvertisement>, TransportError> {
            Ok(std::mem::take(&mut self.queued))
        }

        fn connect(&mut self, _params: &ConnectParams) -> Result<ConnId, TransportError> {
            Err(TransportError::Unavailable)
        }

        fn disconnect(&mut self, _conn: ConnId) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&mut self, _conn: ConnId, _data: &[u8]) -> Result<usize, TransportError> {
            Err(TransportError::Unavailable)
        }

        fn receive(&mut self, _conn: ConnId, _buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(0)
        }

        fn get_mtu(&self, _conn: ConnId) -> u16 {
            23
        }

        fn set_mtu(&mut self, _conn: ConnId, _mtu: u16) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn ad(addr_byte: u8, event_type: u8) -> RawAdvertisement {
        RawAdvertisement {
            address: BdAddr::new([addr_byte; 6]),
            address_type: AddressType::Public,
            event_type,
            rssi: -60,
            data: vec![0x02, 0x01, 0x06],
        }
    }

    #[test]
    fn software_dedup_suppresses_repeats_by_address_and_type() {
        let mut transport = ReplayTransport::with_ads(vec![
            ad(0x11, 0x00),
            ad(0x11, 0x00), // duplicate
            ad(0x11, 0x04), // same device, scan response: kept
            ad(0x22, 0x00),
        ]);
        let mut scanner = Scanner::new(&mut transport, FilterDuplicates::Software);
        scanner.start(true).unwrap();

        let reports = scanner.get_advertisements(Timeout::NonBlocking).unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].event_type, AdvertisingEventType::AdvInd);
        assert_eq!(reports[1].event_type, AdvertisingEventType::ScanRsp);
    }

    #[test]
    fn corrupt_record_is_dropped_not_fatal() {
        let mut bad = ad(0x33, 0x00);
        bad.data = vec![0x09, 0x09, 0x41]; // claims 9 bytes, has 2
        let mut transport = ReplayTransport::with_ads(vec![bad, ad(0x44, 0x00)]);
        let mut scanner = Scanner::new(&mut transport, FilterDuplicates::Off);
        scanner.start(false).unwrap();

        let reports = scanner.get_advertisements(Timeout::NonBlocking).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].address, BdAddr::new([0x44; 6]));
    }

    #[test]
    fn get_advertisements_requires_running() {
        let mut transport = ReplayTransport::with_ads(vec![]);
        let mut scanner = Scanner::new(&mut transport, FilterDuplicates::Off);
        assert!(matches!(
            scanner.get_advertisements(Timeout::NonBlocking),
            Err(ScanError::NotRunning)
        ));
    }

    #[test]
    fn start_is_idempotent_and_stop_clears_dedup() {
        let mut transport = ReplayTransport::with_ads(vec![ad(0x55, 0x00)]);
        let mut scanner = Scanner::new(&mut transport, FilterDuplicates::Software);
        scanner.start(true).unwrap();
        scanner.start(true).unwrap(); // no-op
        let first = scanner.get_advertisements(Timeout::NonBlocking).unwrap();
        assert_eq!(first.len(), 1);

        scanner.stop().unwrap();
        scanner.stop().unwrap(); // idempotent
    }
}
