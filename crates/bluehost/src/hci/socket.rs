//! Raw HCI socket bound to a local controller.

use std::os::unix::io::{AsRawFd, RawFd};

use log::debug;

use crate::hci::constants::*;
use crate::hci::packet::{HciCommand, HciEvent};
use crate::transport::TransportError;

const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_RAW: u16 = 0;

const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// Kernel HCI socket filter.
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// A raw HCI socket on one controller.
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
}

impl HciSocket {
    /// Opens a raw HCI socket and binds it to the given device id.
    pub fn open(dev_id: u16) -> Result<Self, TransportError> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_HCI) };
        if fd < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Io(err));
        }

        debug!("opened HCI socket on hci{} (fd={})", dev_id, fd);
        Ok(HciSocket { fd })
    }

    /// Installs a receive filter that admits LE Meta Events only. Required
    /// before reading advertising reports; the kernel drops everything else.
    pub fn set_le_event_filter(&self) -> Result<(), TransportError> {
        let mut filter = HciFilter {
            type_mask: 1 << HCI_EVENT_PKT,
            event_mask: [0; 2],
            opcode: 0,
        };
        filter.event_mask[(EVT_LE_META_EVENT >> 5) as usize] |= 1 << (EVT_LE_META_EVENT & 0x1F);

        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_HCI,
                HCI_FILTER,
                &filter as *const _ as *const libc::c_void,
                std::mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Writes one command packet to the controller.
    pub fn send_command(&self, command: &HciCommand) -> Result<(), TransportError> {
        let packet = command.to_packet();
        let rc = unsafe {
            libc::write(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if rc < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Reads one event, waiting up to `timeout_ms` (`None` = forever).
    /// Returns `Ok(None)` on timeout or on a packet the filter let through
    /// that is not an event.
    pub fn read_event(&self, timeout_ms: Option<i32>) -> Result<Option<HciEvent>, TransportError> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = timeout_ms.unwrap_or(-1);
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout) };
        if rc < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        if rc == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 260];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(TransportError::Io(err));
        }
        let n = n as usize;
        if n < 1 || buf[0] != HCI_EVENT_PKT {
            return Ok(None);
        }
        Ok(HciEvent::parse(&buf[1..n]))
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
