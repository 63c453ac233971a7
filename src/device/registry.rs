use std::sync::Arc;

use super::{DeviceCatalog, PortDescriptor, UsbId};
use crate::events::{EventNotifier, SerialEvent};

/// Ordered cache of the devices currently visible through the transport.
///
/// Holds at most one descriptor per vendor/product pair. Entries keep their
/// insertion order.
pub struct DeviceRegistry {
    devices: Vec<PortDescriptor>,
    path: String,
    catalog: Arc<DeviceCatalog>,
    notifier: Arc<EventNotifier>,
}

impl DeviceRegistry {
    pub fn new(path: impl Into<String>, catalog: Arc<DeviceCatalog>, notifier: Arc<EventNotifier>) -> Self {
        Self {
            devices: Vec::new(),
            path: path.into(),
            catalog,
            notifier,
        }
    }

    /// Register a device; `None` if the pair is already present
    pub fn add_device(&mut self, vendor_id: u16, product_id: u16) -> Option<PortDescriptor> {
        if self.contains(vendor_id, product_id) {
            log::debug!("Device {:04X}:{:04X} already registered", vendor_id, product_id);
            return None;
        }

        let descriptor = PortDescriptor {
            path: self.path.clone(),
            display_name: self.catalog.display_name(vendor_id, product_id),
            vendor_id,
            product_id,
        };
        self.devices.push(descriptor.clone());

        log::info!("Added device {} ({:04X}:{:04X})", descriptor.display_name, vendor_id, product_id);
        self.notifier.emit(SerialEvent::AddedDevice(descriptor.clone()));
        Some(descriptor)
    }

    /// Remove the first matching device; `None` if absent
    pub fn remove_device(&mut self, vendor_id: u16, product_id: u16) -> Option<PortDescriptor> {
        let pos = self.devices.iter().position(|d| d.matches(vendor_id, product_id))?;
        let descriptor = self.devices.remove(pos);

        log::info!("Removed device {} ({:04X}:{:04X})", descriptor.display_name, vendor_id, product_id);
        self.notifier.emit(SerialEvent::RemovedDevice(descriptor.clone()));
        Some(descriptor)
    }

    pub fn contains(&self, vendor_id: u16, product_id: u16) -> bool {
        self.devices.iter().any(|d| d.matches(vendor_id, product_id))
    }

    pub fn find(&self, id: UsbId) -> Option<&PortDescriptor> {
        self.devices.iter().find(|d| d.usb_id() == id)
    }

    pub fn devices(&self) -> &[PortDescriptor] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}
