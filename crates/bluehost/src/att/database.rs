//! The handle-indexed attribute database backing the GATT server.
//!
//! The database is only mutated while services are being registered; once
//! registration is done it is shared behind an `Arc` and the remaining
//! interior mutability (attribute values written by clients) is guarded by
//! the internal lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use log::{debug, info};

use crate::uuid::Uuid;

use super::constants::*;
use super::error::{AttErrorCode, DbError};

/// Read callback: `(conn_handle, offset)` to value bytes or an ATT error
/// code that is sent to the client verbatim.
pub type ReadCallback = Arc<dyn Fn(u16, u16) -> Result<Vec<u8>, AttErrorCode> + Send + Sync>;

/// Write callback: `(conn_handle, value)`; an error code is sent to the
/// client verbatim (and swallowed for Write Commands).
pub type WriteCallback = Arc<dyn Fn(u16, &[u8]) -> Result<(), AttErrorCode> + Send + Sync>;

/// What role an attribute plays in the GATT hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    PrimaryService,
    SecondaryService,
    Include,
    Characteristic,
    CharacteristicValue,
    Descriptor,
}

/// A single attribute.
#[derive(Clone)]
pub struct Attribute {
    pub handle: u16,
    pub kind: AttributeKind,
    /// The attribute type (0x2800, 0x2803, 0x2902, or the characteristic /
    /// descriptor UUID itself).
    pub type_uuid: Uuid,
    pub permissions: u8,
    pub value: Vec<u8>,
    /// Characteristic declarations only.
    pub properties: u8,
    /// Characteristic declarations only; always the declaration handle + 1.
    pub value_handle: u16,
    /// Service declarations only; the largest handle inside the group.
    pub end_group_handle: u16,
    pub read_cb: Option<ReadCallback>,
    pub write_cb: Option<WriteCallback>,
}

impl Attribute {
    fn new(handle: u16, kind: AttributeKind, type_uuid: Uuid, permissions: u8) -> Self {
        Attribute {
            handle,
            kind,
            type_uuid,
            permissions,
            value: Vec::new(),
            properties: 0,
            value_handle: 0,
            end_group_handle: handle,
            read_cb: None,
            write_cb: None,
        }
    }

    pub fn readable(&self) -> bool {
        self.permissions & ATT_PERM_READ != 0
    }

    pub fn writable(&self) -> bool {
        self.permissions & ATT_PERM_WRITE != 0
    }

    pub fn is_service(&self) -> bool {
        matches!(
            self.kind,
            AttributeKind::PrimaryService | AttributeKind::SecondaryService
        )
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("type_uuid", &self.type_uuid)
            .field("permissions", &self.permissions)
            .field("value_len", &self.value.len())
            .field("end_group_handle", &self.end_group_handle)
            .finish()
    }
}

/// Span of handles belonging to one registered service, in registration
/// order. Keeps `end_group_handle` updates O(1) on append.
#[derive(Debug, Clone, Copy)]
struct ServiceSpan {
    start_handle: u16,
    end_handle: u16,
}

struct DbInner {
    attributes: BTreeMap<u16, Attribute>,
    services: Vec<ServiceSpan>,
    next_handle: u16,
}

/// The attribute database.
pub struct AttributeDatabase {
    inner: RwLock<DbInner>,
}

impl Default for AttributeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeDatabase {
    pub fn new() -> Self {
        AttributeDatabase {
            inner: RwLock::new(DbInner {
                attributes: BTreeMap::new(),
                services: Vec::new(),
                next_handle: ATT_HANDLE_MIN,
            }),
        }
    }

    fn allocate_handle(inner: &mut DbInner) -> Result<u16, DbError> {
        if inner.next_handle == ATT_HANDLE_MAX {
            return Err(DbError::HandleSpaceExhausted);
        }
        let handle = inner.next_handle;
        inner.next_handle += 1;
        Ok(handle)
    }

    fn update_service_end_handle(inner: &mut DbInner, service_handle: u16, last_handle: u16) {
        for span in inner.services.iter_mut() {
            if span.start_handle == service_handle {
                span.end_handle = last_handle;
                break;
            }
        }
        if let Some(attr) = inner.attributes.get_mut(&service_handle) {
            attr.end_group_handle = last_handle;
        }
    }

    fn add_service(&self, uuid: Uuid, primary: bool) -> Result<u16, DbError> {
        let mut inner = self.inner.write().unwrap();
        let handle = Self::allocate_handle(&mut inner)?;

        let (kind, type16) = if primary {
            (AttributeKind::PrimaryService, PRIMARY_SERVICE_UUID)
        } else {
            (AttributeKind::SecondaryService, SECONDARY_SERVICE_UUID)
        };

        let mut attr = Attribute::new(handle, kind, Uuid::from_u16(type16), ATT_PERM_READ);
        attr.value = uuid.wire_bytes();
        inner.attributes.insert(handle, attr);
        inner.services.push(ServiceSpan {
            start_handle: handle,
            end_handle: handle,
        });

        info!(
            "added {} service {} at handle 0x{:04X}",
            if primary { "primary" } else { "secondary" },
            uuid,
            handle
        );
        Ok(handle)
    }

    /// Adds a primary service declaration and returns its handle.
    pub fn add_primary_service(&self, uuid: Uuid) -> Result<u16, DbError> {
        self.add_service(uuid, true)
    }

    /// Adds a secondary service declaration and returns its handle.
    pub fn add_secondary_service(&self, uuid: Uuid) -> Result<u16, DbError> {
        self.add_service(uuid, false)
    }

    /// Adds an include declaration referencing an already-registered service.
    pub fn add_include(
        &self,
        service_handle: u16,
        included_service_handle: u16,
    ) -> Result<u16, DbError> {
        let mut inner = self.inner.write().unwrap();

        let (inc_end, inc_uuid) = {
            let inc = inner
                .attributes
                .get(&included_service_handle)
                .filter(|a| a.is_service())
                .ok_or(DbError::UnknownHandle(included_service_handle))?;
            (
                inc.end_group_handle,
                Uuid::try_from_slice_le(&inc.value),
            )
        };

        let handle = Self::allocate_handle(&mut inner)?;
        let mut attr = Attribute::new(
            handle,
            AttributeKind::Include,
            Uuid::from_u16(INCLUDE_UUID),
            ATT_PERM_READ,
        );

        // Value: included handle + end group handle, plus the UUID when the
        // included service has a 16-bit one.
        attr.value.extend_from_slice(&included_service_handle.to_le_bytes());
        attr.value.extend_from_slice(&inc_end.to_le_bytes());
        if let Some(u16_uuid) = inc_uuid.and_then(|u| u.as_u16()) {
            attr.value.extend_from_slice(&u16_uuid.to_le_bytes());
        }

        inner.attributes.insert(handle, attr);
        Self::update_service_end_handle(&mut inner, service_handle, handle);

        debug!("added include at handle 0x{:04X}", handle);
        Ok(handle)
    }

    /// Adds a characteristic declaration plus its value attribute and, when
    /// the properties include NOTIFY or INDICATE, a CCCD right after the
    /// value. Returns the declaration handle; the value handle is always the
    /// declaration handle + 1.
    pub fn add_characteristic(
        &self,
        service_handle: u16,
        uuid: Uuid,
        properties: u8,
        permissions: u8,
    ) -> Result<u16, DbError> {
        let mut inner = self.inner.write().unwrap();

        let decl_handle = Self::allocate_handle(&mut inner)?;
        let value_handle = Self::allocate_handle(&mut inner)?;

        let mut decl = Attribute::new(
            decl_handle,
            AttributeKind::Characteristic,
            Uuid::from_u16(CHARACTERISTIC_UUID),
            ATT_PERM_READ,
        );
        decl.properties = properties;
        decl.value_handle = value_handle;
        decl.value.push(properties);
        decl.value.extend_from_slice(&value_handle.to_le_bytes());
        decl.value.extend_from_slice(&uuid.wire_bytes());
        inner.attributes.insert(decl_handle, decl);

        let mut value = Attribute::new(
            value_handle,
            AttributeKind::CharacteristicValue,
            uuid,
            permissions,
        );
        value.properties = properties;
        inner.attributes.insert(value_handle, value);

        Self::update_service_end_handle(&mut inner, service_handle, value_handle);

        if properties & (GATT_PROP_NOTIFY | GATT_PROP_INDICATE) != 0 {
            let cccd_handle = Self::add_descriptor_locked(
                &mut inner,
                value_handle,
                Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID),
                ATT_PERM_READ | ATT_PERM_WRITE,
            )?;
            if let Some(cccd) = inner.attributes.get_mut(&cccd_handle) {
                cccd.value = vec![0x00, 0x00];
            }
            debug!(
                "auto-added CCCD at handle 0x{:04X} for characteristic 0x{:04X}",
                cccd_handle, value_handle
            );
        }

        info!(
            "added characteristic {} (decl=0x{:04X}, value=0x{:04X})",
            uuid, decl_handle, value_handle
        );
        Ok(decl_handle)
    }

    fn add_descriptor_locked(
        inner: &mut DbInner,
        char_value_handle: u16,
        uuid: Uuid,
        permissions: u8,
    ) -> Result<u16, DbError> {
        let handle = Self::allocate_handle(inner)?;
        let attr = Attribute::new(handle, AttributeKind::Descriptor, uuid, permissions);
        inner.attributes.insert(handle, attr);

        // Walk the service spans from the most recent backwards; descriptors
        // always belong to the last service containing their characteristic.
        let mut owner = None;
        for span in inner.services.iter().rev() {
            if char_value_handle >= span.start_handle && char_value_handle <= span.end_handle {
                owner = Some(span.start_handle);
                break;
            }
        }
        let owner = owner.ok_or(DbError::ServiceNotFound(char_value_handle))?;
        Self::update_service_end_handle(inner, owner, handle);

        Ok(handle)
    }

    /// Adds a user descriptor after the given characteristic value attribute
    /// and extends the owning service's group.
    pub fn add_descriptor(
        &self,
        char_value_handle: u16,
        uuid: Uuid,
        permissions: u8,
    ) -> Result<u16, DbError> {
        let mut inner = self.inner.write().unwrap();
        let handle = Self::add_descriptor_locked(&mut inner, char_value_handle, uuid, permissions)?;
        debug!("added descriptor {} at handle 0x{:04X}", uuid, handle);
        Ok(handle)
    }

    /// Returns a snapshot of the attribute at `handle`.
    pub fn get(&self, handle: u16) -> Option<Attribute> {
        self.inner.read().unwrap().attributes.get(&handle).cloned()
    }

    /// All attributes in `[start, end]` whose type equals `type_uuid`,
    /// ascending by handle.
    pub fn find_by_type(&self, start_handle: u16, end_handle: u16, type_uuid: &Uuid) -> Vec<Attribute> {
        if start_handle > end_handle {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap();
        inner
            .attributes
            .range(start_handle..=end_handle)
            .filter(|(_, a)| a.type_uuid == *type_uuid)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Like [`find_by_type`](Self::find_by_type) with an additional exact
    /// value match.
    pub fn find_by_type_value(
        &self,
        start_handle: u16,
        end_handle: u16,
        type_uuid: &Uuid,
        value: &[u8],
    ) -> Vec<Attribute> {
        if start_handle > end_handle {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap();
        inner
            .attributes
            .range(start_handle..=end_handle)
            .filter(|(_, a)| a.type_uuid == *type_uuid && a.value == value)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// All attributes with handle in `[start, end]`, ascending.
    pub fn range(&self, start_handle: u16, end_handle: u16) -> Vec<Attribute> {
        if start_handle > end_handle {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap();
        inner
            .attributes
            .range(start_handle..=end_handle)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// The next handle that would be allocated.
    pub fn next_handle(&self) -> u16 {
        self.inner.read().unwrap().next_handle
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes everything and resets handle allocation.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.attributes.clear();
        inner.services.clear();
        inner.next_handle = ATT_HANDLE_MIN;
    }

    /// Replaces the stored value of a characteristic value attribute.
    pub fn set_characteristic_value(&self, value_handle: u16, value: Vec<u8>) -> Result<(), DbError> {
        let mut inner = self.inner.write().unwrap();
        let attr = inner
            .attributes
            .get_mut(&value_handle)
            .ok_or(DbError::UnknownHandle(value_handle))?;
        if attr.kind != AttributeKind::CharacteristicValue {
            return Err(DbError::NotCharacteristicValue(value_handle));
        }
        attr.value = value;
        Ok(())
    }

    /// The stored value of a characteristic value attribute.
    pub fn characteristic_value(&self, value_handle: u16) -> Result<Vec<u8>, DbError> {
        let inner = self.inner.read().unwrap();
        let attr = inner
            .attributes
            .get(&value_handle)
            .ok_or(DbError::UnknownHandle(value_handle))?;
        if attr.kind != AttributeKind::CharacteristicValue {
            return Err(DbError::NotCharacteristicValue(value_handle));
        }
        Ok(attr.value.clone())
    }

    /// Installs a read callback on an existing attribute.
    pub fn set_read_callback(&self, handle: u16, cb: ReadCallback) -> Result<(), DbError> {
        let mut inner = self.inner.write().unwrap();
        let attr = inner
            .attributes
            .get_mut(&handle)
            .ok_or(DbError::UnknownHandle(handle))?;
        attr.read_cb = Some(cb);
        Ok(())
    }

    /// Installs a write callback on an existing attribute.
    pub fn set_write_callback(&self, handle: u16, cb: WriteCallback) -> Result<(), DbError> {
        let mut inner = self.inner.write().unwrap();
        let attr = inner
            .attributes
            .get_mut(&handle)
            .ok_or(DbError::UnknownHandle(handle))?;
        attr.write_cb = Some(cb);
        Ok(())
    }

    /// Obtains an attribute's value for the dispatcher: the read callback if
    /// one is installed (its error code travels to the client verbatim),
    /// otherwise the stored value from `offset`.
    pub fn read_value(&self, conn_handle: u16, handle: u16, offset: u16) -> Result<Vec<u8>, AttErrorCode> {
        let cb = {
            let inner = self.inner.read().unwrap();
            let attr = inner
                .attributes
                .get(&handle)
                .ok_or(AttErrorCode::InvalidHandle)?;
            match &attr.read_cb {
                Some(cb) => Arc::clone(cb),
                None => {
                    let value = &attr.value;
                    if offset == 0 {
                        return Ok(value.clone());
                    }
                    if offset as usize >= value.len() {
                        return Err(AttErrorCode::InvalidOffset);
                    }
                    return Ok(value[offset as usize..].to_vec());
                }
            }
        };
        // Callback runs without the database lock held.
        cb(conn_handle, offset)
    }

    /// Applies a client write for the dispatcher: the write callback if one
    /// is installed, otherwise the stored value is replaced.
    pub fn write_value(&self, conn_handle: u16, handle: u16, value: &[u8]) -> Result<(), AttErrorCode> {
        let cb = {
            let inner = self.inner.read().unwrap();
            let attr = inner
                .attributes
                .get(&handle)
                .ok_or(AttErrorCode::InvalidHandle)?;
            attr.write_cb.as_ref().map(Arc::clone)
        };
        match cb {
            Some(cb) => cb(conn_handle, value),
            None => {
                let mut inner = self.inner.write().unwrap();
                if let Some(attr) = inner.attributes.get_mut(&handle) {
                    attr.value = value.to_vec();
                }
                Ok(())
            }
        }
    }
}
