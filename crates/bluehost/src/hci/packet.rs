//! HCI command encoding and event parsing.

use crate::hci::constants::*;

/// The HCI commands this library emits, identified by OGF/OCF pair.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HciCommand {
    Disconnect {
        handle: u16,
        reason: u8,
    },
    LeSetScanParameters {
        scan_type: u8,
        scan_interval: u16,
        scan_window: u16,
        own_address_type: u8,
        filter_policy: u8,
    },
    LeSetScanEnable {
        enable: bool,
        filter_duplicates: bool,
    },
    LeSetAdvertisingParameters {
        min_interval: u16,
        max_interval: u16,
        advertising_type: u8,
        own_address_type: u8,
        peer_address_type: u8,
        peer_address: [u8; 6],
        channel_map: u8,
        filter_policy: u8,
    },
    LeSetAdvertisingData {
        data: Vec<u8>,
    },
    LeSetScanResponseData {
        data: Vec<u8>,
    },
    LeSetAdvertisingEnable {
        enable: bool,
    },
}

impl HciCommand {
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::LeSetScanParameters { .. } => (OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),
            Self::LeSetAdvertisingParameters { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_PARAMETERS),
            Self::LeSetAdvertisingData { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_DATA),
            Self::LeSetScanResponseData { .. } => (OGF_LE, OCF_LE_SET_SCAN_RESPONSE_DATA),
            Self::LeSetAdvertisingEnable { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_ENABLE),
        }
    }

    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::LeSetScanParameters {
                scan_type,
                scan_interval,
                scan_window,
                own_address_type,
                filter_policy,
            } => {
                let mut params = Vec::with_capacity(7);
                params.push(*scan_type);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(*own_address_type);
                params.push(*filter_policy);
                params
            }

            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],

            Self::LeSetAdvertisingParameters {
                min_interval,
                max_interval,
                advertising_type,
                own_address_type,
                peer_address_type,
                peer_address,
                channel_map,
                filter_policy,
            } => {
                let mut params = Vec::with_capacity(15);
                params.extend_from_slice(&min_interval.to_le_bytes());
                params.extend_from_slice(&max_interval.to_le_bytes());
                params.push(*advertising_type);
                params.push(*own_address_type);
                params.push(*peer_address_type);
                params.extend_from_slice(peer_address);
                params.push(*channel_map);
                params.push(*filter_policy);
                params
            }

            // Advertising data commands always carry a 31-byte field,
            // zero-padded past the significant length.
            Self::LeSetAdvertisingData { data } | Self::LeSetScanResponseData { data } => {
                let mut params = Vec::with_capacity(32);
                params.push(data.len().min(31) as u8);
                let mut field = [0u8; 31];
                let n = data.len().min(31);
                field[..n].copy_from_slice(&data[..n]);
                params.extend_from_slice(&field);
                params
            }

            Self::LeSetAdvertisingEnable { enable } => vec![*enable as u8],
        }
    }

    /// The complete command packet: indicator, opcode, length, parameters.
    pub fn to_packet(&self) -> Vec<u8> {
        let (ogf, ocf) = self.opcode_parts();
        let opcode = ((ogf as u16) << 10) | (ocf & 0x3FF);
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// A parsed HCI event packet.
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parses an event from its header onwards (indicator byte stripped).
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let event_code = data[0];
        let param_len = data[1] as usize;
        if data.len() < 2 + param_len {
            return None;
        }
        Some(HciEvent {
            event_code,
            parameters: data[2..2 + param_len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_enable_packet_layout() {
        let cmd = HciCommand::LeSetScanEnable {
            enable: true,
            filter_duplicates: false,
        };
        // opcode = 0x08 << 10 | 0x0C = 0x200C
        assert_eq!(cmd.to_packet(), vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn advertising_data_is_padded_to_31_bytes() {
        let cmd = HciCommand::LeSetAdvertisingData {
            data: vec![0x02, 0x01, 0x06],
        };
        let packet = cmd.to_packet();
        // indicator(1) + opcode(2) + plen(1) + significant_len(1) + data(31)
        assert_eq!(packet.len(), 36);
        assert_eq!(packet[3], 32); // parameter length
        assert_eq!(packet[4], 3); // significant length
        assert_eq!(&packet[5..8], &[0x02, 0x01, 0x06]);
        assert!(packet[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn event_parse_checks_length() {
        assert!(HciEvent::parse(&[0x3E]).is_none());
        assert!(HciEvent::parse(&[0x3E, 0x05, 0x01]).is_none());

        let ev = HciEvent::parse(&[0x0E, 0x03, 0x01, 0x0C, 0x20]).unwrap();
        assert_eq!(ev.event_code, EVT_CMD_COMPLETE);
        assert_eq!(ev.parameters, vec![0x01, 0x0C, 0x20]);
    }
}
