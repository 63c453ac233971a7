use std::collections::BTreeMap;
use once_cell::sync::Lazy;

use super::UsbId;
use crate::config::SerialSettings;

/// USB bridges found on supported flight controllers, in probe order
pub const KNOWN_DEVICES: &[UsbId] = &[
    UsbId::new(0x0403, 0x6001), // FTDI FT232
    UsbId::new(0x0483, 0x3256), // STM32 HID bootloader
    UsbId::new(0x0483, 0x374E), // STM32 ST-Link VCP
    UsbId::new(0x0483, 0x5740), // STM32 virtual COM port
    UsbId::new(0x10C4, 0xEA60), // CP2102
    UsbId::new(0x10C4, 0xEA61), // CP2102 alternate
    UsbId::new(0x10C4, 0xEA62), // CP2104
    UsbId::new(0x2E3C, 0x5740), // AT32 virtual COM port
    UsbId::new(0x314B, 0x0106), // APM32 virtual COM port
    UsbId::new(0x1A86, 0x7523), // CH340
];

static VENDOR_NAMES: Lazy<BTreeMap<u16, String>> = Lazy::new(|| {
    let names: [(u16, &str); 6] = [
        (0x0403, "FTDI"),
        (0x0483, "STM Electronics"),
        (0x10C4, "Silicon Labs"),
        (0x1A86, "QinHeng Electronics"),
        (0x2E3C, "AT32"),
        (0x314B, "Geehy Semiconductor"),
    ];
    names
        .into_iter()
        .map(|(vid, name)| (vid, name.to_string()))
        .collect()
});

/// Whitelist plus vendor-name lookup
#[derive(Debug, Clone)]
pub struct DeviceCatalog {
    whitelist: Vec<UsbId>,
    vendor_names: BTreeMap<u16, String>,
}

impl DeviceCatalog {
    pub fn new(whitelist: Vec<UsbId>, vendor_names: BTreeMap<u16, String>) -> Self {
        Self { whitelist, vendor_names }
    }

    /// Built-in tables, adjusted by settings
    pub fn from_settings(settings: &SerialSettings) -> Self {
        let whitelist = settings
            .known_devices
            .clone()
            .unwrap_or_else(|| KNOWN_DEVICES.to_vec());

        let mut vendor_names = VENDOR_NAMES.clone();
        vendor_names.extend(settings.vendor_names.iter().map(|(vid, name)| (*vid, name.clone())));

        Self::new(whitelist, vendor_names)
    }

    pub fn whitelist(&self) -> &[UsbId] {
        &self.whitelist
    }

    pub fn is_known(&self, vendor_id: u16, product_id: u16) -> bool {
        self.whitelist.contains(&UsbId::new(vendor_id, product_id))
    }

    pub fn vendor_name(&self, vendor_id: u16) -> Option<&str> {
        self.vendor_names.get(&vendor_id).map(String::as_str)
    }

    pub fn display_name(&self, vendor_id: u16, product_id: u16) -> String {
        match self.vendor_name(vendor_id) {
            Some(name) => name.to_string(),
            None => format!("VID:{} PID:{}", vendor_id, product_id),
        }
    }
}

impl Default for DeviceCatalog {
    fn default() -> Self {
        Self::new(KNOWN_DEVICES.to_vec(), VENDOR_NAMES.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_uses_vendor_table() {
        let catalog = DeviceCatalog::default();
        assert_eq!(catalog.display_name(0x0483, 0x5740), "STM Electronics");
    }

    #[test]
    fn test_display_name_fallback_is_decimal() {
        let catalog = DeviceCatalog::default();
        assert_eq!(catalog.display_name(0x1234, 0x0001), "VID:4660 PID:1");
    }

    #[test]
    fn test_settings_override_whitelist_and_extend_vendors() {
        let mut settings = SerialSettings::default();
        settings.known_devices = Some(vec![UsbId::new(0x1209, 0x5741)]);
        settings.vendor_names.insert(0x1209, "pid.codes".to_string());

        let catalog = DeviceCatalog::from_settings(&settings);
        assert_eq!(catalog.whitelist(), &[UsbId::new(0x1209, 0x5741)]);
        assert!(catalog.is_known(0x1209, 0x5741));
        assert!(!catalog.is_known(0x0483, 0x5740));
        assert_eq!(catalog.display_name(0x1209, 0x5741), "pid.codes");
        assert_eq!(catalog.vendor_name(0x0403), Some("FTDI"));
    }
}
