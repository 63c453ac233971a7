use std::sync::Arc;

use super::{DeviceCatalog, DeviceRegistry, UsbId};
use crate::serial::{PermissionRequest, SerialTransport};

/// Walks the whitelist asking the transport for access.
///
/// Stops at the first grant. Failed requests are treated as "device absent".
pub struct PermissionNegotiator {
    catalog: Arc<DeviceCatalog>,
    driver: String,
}

impl PermissionNegotiator {
    pub fn new(catalog: Arc<DeviceCatalog>, driver: impl Into<String>) -> Self {
        Self {
            catalog,
            driver: driver.into(),
        }
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Returns true if any candidate was granted
    pub async fn request_access(&self, transport: &dyn SerialTransport, registry: &mut DeviceRegistry) -> bool {
        for candidate in self.catalog.whitelist() {
            if self.request_device(transport, *candidate).await {
                if !registry.contains(candidate.vendor_id, candidate.product_id) {
                    registry.add_device(candidate.vendor_id, candidate.product_id);
                }
                return true;
            }
        }

        log::info!("No known device granted access");
        false
    }

    /// Ask for one device; refusals and failures both come back as false
    pub async fn request_device(&self, transport: &dyn SerialTransport, id: UsbId) -> bool {
        let request = PermissionRequest {
            vendor_id: id.vendor_id,
            product_id: id.product_id,
            driver: self.driver.clone(),
        };

        match transport.request_serial_permissions(request).await {
            Ok(response) if response.granted => {
                log::info!("Permission granted for {}", id);
                true
            }
            Ok(_) => {
                log::debug!("Permission refused for {}", id);
                false
            }
            Err(e) => {
                log::debug!("Skipping {}: {}", id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventNotifier;
    use crate::serial::{MockTransport, DEFAULT_DRIVER};
    use std::collections::BTreeMap;

    fn setup(whitelist: Vec<UsbId>) -> (PermissionNegotiator, DeviceRegistry) {
        let catalog = Arc::new(DeviceCatalog::new(whitelist, BTreeMap::new()));
        let registry = DeviceRegistry::new("serial", catalog.clone(), Arc::new(EventNotifier::new()));
        (PermissionNegotiator::new(catalog, DEFAULT_DRIVER), registry)
    }

    #[tokio::test]
    async fn test_first_grant_wins() {
        let (negotiator, mut registry) = setup(vec![UsbId::new(1, 1), UsbId::new(2, 2), UsbId::new(3, 3)]);
        let transport = MockTransport::new();
        transport.grant(2, 2);
        transport.grant(3, 3);

        assert!(negotiator.request_access(&transport, &mut registry).await);

        // 1:1 fails, 2:2 grants, 3:3 is never asked
        assert_eq!(transport.permission_request_count(), 2);
        assert_eq!(registry.devices().len(), 1);
        assert_eq!(registry.devices()[0].usb_id(), UsbId::new(2, 2));
    }

    #[tokio::test]
    async fn test_exhausted_whitelist_returns_false() {
        let (negotiator, mut registry) = setup(vec![UsbId::new(1, 1), UsbId::new(2, 2)]);
        let transport = MockTransport::new();
        transport.deny(2, 2);

        assert!(!negotiator.request_access(&transport, &mut registry).await);
        assert_eq!(transport.permission_request_count(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_request_carries_driver() {
        let (negotiator, mut registry) = setup(vec![UsbId::new(0x0483, 0x5740)]);
        let transport = MockTransport::new();
        transport.grant(0x0483, 0x5740);

        negotiator.request_access(&transport, &mut registry).await;

        let log = transport.permission_log();
        assert_eq!(log[0].driver, DEFAULT_DRIVER);
        assert_eq!(log[0].vendor_id, 0x0483);
    }

    #[tokio::test]
    async fn test_already_registered_grant_is_not_duplicated() {
        let (negotiator, mut registry) = setup(vec![UsbId::new(1, 1)]);
        registry.add_device(1, 1);
        let transport = MockTransport::new();
        transport.grant(1, 1);

        assert!(negotiator.request_access(&transport, &mut registry).await);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_request_device_asks_only_that_pair() {
        let (negotiator, _registry) = setup(vec![UsbId::new(1, 1)]);
        let transport = MockTransport::new();
        transport.grant(7, 7);

        assert!(negotiator.request_device(&transport, UsbId::new(7, 7)).await);
        assert!(!negotiator.request_device(&transport, UsbId::new(8, 8)).await);

        let log = transport.permission_log();
        assert_eq!((log[0].vendor_id, log[0].product_id), (7, 7));
        assert_eq!(log.len(), 2);
    }
}
