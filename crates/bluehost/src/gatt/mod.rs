//! Declarative GATT service definitions and bulk registration.
//!
//! Applications describe their services as [`ServiceDef`] values and hand
//! them to [`AttributeDatabase::register_services`]; the database lays out
//! declaration, value, CCCD and descriptor attributes and reports the
//! resulting handles back.

mod types;

pub use types::{
    flags, CharacteristicDef, DescriptorDef, RegisteredCharacteristic, RegisteredService,
    ServiceDef,
};

use log::{error, info};

use crate::att::constants::{GATT_PROP_INDICATE, GATT_PROP_NOTIFY};
use crate::att::{AttributeDatabase, DbError};

impl AttributeDatabase {
    /// Registers a batch of service definitions.
    ///
    /// Order per service: declaration, includes, characteristics (each with
    /// its automatic CCCD), then user descriptors. The first error aborts
    /// registration and leaves the attributes added so far in place; callers
    /// are expected to [`clear`](AttributeDatabase::clear) and start over.
    pub fn register_services(
        &self,
        services: &[ServiceDef],
    ) -> Result<Vec<RegisteredService>, DbError> {
        let mut registered = Vec::with_capacity(services.len());

        for svc in services {
            let service_handle = if svc.primary {
                self.add_primary_service(svc.uuid)?
            } else {
                self.add_secondary_service(svc.uuid)?
            };

            for &included in &svc.includes {
                self.add_include(service_handle, included).map_err(|e| {
                    error!("failed to add include of 0x{:04X}: {}", included, e);
                    e
                })?;
            }

            let mut characteristics = Vec::with_capacity(svc.characteristics.len());
            for chr in &svc.characteristics {
                let properties = chr.properties();
                let permissions = chr.permissions();

                let declaration_handle =
                    self.add_characteristic(service_handle, chr.uuid, properties, permissions)?;
                let value_handle = declaration_handle + 1;

                let cccd_handle = if properties & (GATT_PROP_NOTIFY | GATT_PROP_INDICATE) != 0 {
                    Some(value_handle + 1)
                } else {
                    None
                };

                if !chr.initial_value.is_empty() {
                    self.set_characteristic_value(value_handle, chr.initial_value.clone())?;
                }
                if let Some(cb) = &chr.read_cb {
                    self.set_read_callback(value_handle, cb.clone())?;
                }
                if let Some(cb) = &chr.write_cb {
                    self.set_write_callback(value_handle, cb.clone())?;
                }

                let mut descriptor_handles = Vec::with_capacity(chr.descriptors.len());
                for dsc in &chr.descriptors {
                    let dsc_handle =
                        self.add_descriptor(value_handle, dsc.uuid, dsc.permissions)?;
                    if let Some(cb) = &dsc.read_cb {
                        self.set_read_callback(dsc_handle, cb.clone())?;
                    }
                    if let Some(cb) = &dsc.write_cb {
                        self.set_write_callback(dsc_handle, cb.clone())?;
                    }
                    descriptor_handles.push(dsc_handle);
                }

                characteristics.push(RegisteredCharacteristic {
                    uuid: chr.uuid,
                    declaration_handle,
                    value_handle,
                    cccd_handle,
                    descriptor_handles,
                });
            }

            registered.push(RegisteredService {
                uuid: svc.uuid,
                service_handle,
                characteristics,
            });
        }

        info!(
            "registered {} services, {} attributes total",
            services.len(),
            self.len()
        );
        Ok(registered)
    }
}
