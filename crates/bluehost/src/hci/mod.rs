//! HCI command/event plumbing used by the socket transport.

pub mod constants;
pub mod packet;
pub mod socket;

pub use self::constants::*;
pub use self::packet::{HciCommand, HciEvent};
pub use self::socket::HciSocket;
