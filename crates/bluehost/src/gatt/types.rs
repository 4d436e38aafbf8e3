use crate::att::constants::*;
use crate::att::database::{ReadCallback, WriteCallback};
use crate::uuid::Uuid;

/// Characteristic definition flags. These fold both the declaration
/// properties and the value attribute's access permissions into one word.
pub mod flags {
    pub const BROADCAST: u16 = 0x0001;
    pub const READ: u16 = 0x0002;
    pub const WRITE_NO_RSP: u16 = 0x0004;
    pub const WRITE: u16 = 0x0008;
    pub const NOTIFY: u16 = 0x0010;
    pub const INDICATE: u16 = 0x0020;
    pub const AUTH_SIGN_WRITE: u16 = 0x0040;
    pub const READ_ENC: u16 = 0x0200;
    pub const READ_AUTHEN: u16 = 0x0400;
    pub const WRITE_ENC: u16 = 0x1000;
    pub const WRITE_AUTHEN: u16 = 0x2000;
}

/// A descriptor inside a characteristic definition.
#[derive(Clone)]
pub struct DescriptorDef {
    pub uuid: Uuid,
    pub permissions: u8,
    pub read_cb: Option<ReadCallback>,
    pub write_cb: Option<WriteCallback>,
}

impl DescriptorDef {
    pub fn new(uuid: Uuid, permissions: u8) -> Self {
        DescriptorDef {
            uuid,
            permissions,
            read_cb: None,
            write_cb: None,
        }
    }
}

/// A characteristic inside a service definition.
#[derive(Clone)]
pub struct CharacteristicDef {
    pub uuid: Uuid,
    pub flags: u16,
    pub initial_value: Vec<u8>,
    pub read_cb: Option<ReadCallback>,
    pub write_cb: Option<WriteCallback>,
    pub descriptors: Vec<DescriptorDef>,
}

impl CharacteristicDef {
    pub fn new(uuid: Uuid, flags: u16) -> Self {
        CharacteristicDef {
            uuid,
            flags,
            initial_value: Vec::new(),
            read_cb: None,
            write_cb: None,
            descriptors: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.initial_value = value;
        self
    }

    pub fn with_read_cb(mut self, cb: ReadCallback) -> Self {
        self.read_cb = Some(cb);
        self
    }

    pub fn with_write_cb(mut self, cb: WriteCallback) -> Self {
        self.write_cb = Some(cb);
        self
    }

    pub fn with_descriptor(mut self, descriptor: DescriptorDef) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// The declaration properties byte derived from the flags.
    pub fn properties(&self) -> u8 {
        let mut props = 0;
        if self.flags & flags::BROADCAST != 0 {
            props |= GATT_PROP_BROADCAST;
        }
        if self.flags & flags::READ != 0 {
            props |= GATT_PROP_READ;
        }
        if self.flags & flags::WRITE_NO_RSP != 0 {
            props |= GATT_PROP_WRITE_NO_RSP;
        }
        if self.flags & flags::WRITE != 0 {
            props |= GATT_PROP_WRITE;
        }
        if self.flags & flags::NOTIFY != 0 {
            props |= GATT_PROP_NOTIFY;
        }
        if self.flags & flags::INDICATE != 0 {
            props |= GATT_PROP_INDICATE;
        }
        if self.flags & flags::AUTH_SIGN_WRITE != 0 {
            props |= GATT_PROP_AUTH_SIGN_WRITE;
        }
        props
    }

    /// The value attribute's permission bits derived from the flags.
    pub fn permissions(&self) -> u8 {
        let mut perms = 0;
        if self.flags & flags::READ != 0 {
            perms |= ATT_PERM_READ;
        }
        if self.flags & (flags::WRITE | flags::WRITE_NO_RSP) != 0 {
            perms |= ATT_PERM_WRITE;
        }
        if self.flags & flags::READ_ENC != 0 {
            perms |= ATT_PERM_READ_ENCRYPT;
        }
        if self.flags & flags::WRITE_ENC != 0 {
            perms |= ATT_PERM_WRITE_ENCRYPT;
        }
        if self.flags & flags::READ_AUTHEN != 0 {
            perms |= ATT_PERM_READ_AUTHEN;
        }
        if self.flags & flags::WRITE_AUTHEN != 0 {
            perms |= ATT_PERM_WRITE_AUTHEN;
        }
        perms
    }
}

/// A service definition.
#[derive(Clone)]
pub struct ServiceDef {
    pub primary: bool,
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDef>,
    /// Handles of already-registered services to include.
    pub includes: Vec<u16>,
}

impl ServiceDef {
    pub fn primary(uuid: Uuid) -> Self {
        ServiceDef {
            primary: true,
            uuid,
            characteristics: Vec::new(),
            includes: Vec::new(),
        }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        ServiceDef {
            primary: false,
            uuid,
            characteristics: Vec::new(),
            includes: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, chr: CharacteristicDef) -> Self {
        self.characteristics.push(chr);
        self
    }

    pub fn with_include(mut self, service_handle: u16) -> Self {
        self.includes.push(service_handle);
        self
    }

    /// Shorthand for a readable characteristic backed by a read callback.
    pub fn with_read_characteristic(self, uuid: Uuid, cb: ReadCallback) -> Self {
        self.with_characteristic(CharacteristicDef::new(uuid, flags::READ).with_read_cb(cb))
    }

    /// Shorthand for a read + notify characteristic.
    pub fn with_notify_characteristic(self, uuid: Uuid) -> Self {
        self.with_characteristic(CharacteristicDef::new(uuid, flags::READ | flags::NOTIFY))
    }
}

/// Handles reported back for one registered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCharacteristic {
    pub uuid: Uuid,
    pub declaration_handle: u16,
    pub value_handle: u16,
    pub cccd_handle: Option<u16>,
    pub descriptor_handles: Vec<u16>,
}

/// Handles reported back for one registered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    pub uuid: Uuid,
    pub service_handle: u16,
    pub characteristics: Vec<RegisteredCharacteristic>,
}
