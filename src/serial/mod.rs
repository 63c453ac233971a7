pub mod interface;
pub mod mock;
pub mod options;
pub mod subscription;

pub use interface::{available_usb_ports, NativeTransport, DEFAULT_PORT_PATH};
pub use mock::MockTransport;
pub use options::{ConnectionOptions, DataBits, FlowControl, Parity, StopBits};
pub use subscription::{ReadHandler, ReadSubscription};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Driver class requested when none is configured
pub const DEFAULT_DRIVER: &str = "CdcAcmSerialDriver";

/// Permission request for a single vendor/product pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub vendor_id: u16,
    pub product_id: u16,
    pub driver: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub granted: bool,
}

/// USB serial port as reported by the OS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Permission denied for {vendor_id:04X}:{product_id:04X}")]
    PermissionDenied { vendor_id: u16, product_id: u16 },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Read callback already registered")]
    ReadCallbackRegistered,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Platform serial provider the device layer drives.
///
/// Every operation may fail; callers decide which failures are fatal.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Ask the platform for access to a vendor/product pair
    async fn request_serial_permissions(&self, request: PermissionRequest) -> Result<PermissionResponse>;

    /// Open the physical connection addressed by `path`
    async fn open_connection(&self, path: &str, options: &ConnectionOptions) -> Result<()>;

    /// Write raw bytes, returning how many were written
    async fn write(&self, data: &[u8]) -> Result<usize>;

    /// Start delivering received chunks to `handler`
    async fn register_read_callback(&self, handler: ReadHandler) -> Result<ReadSubscription>;

    /// Stop delivering received chunks for `subscription`
    async fn unregister_read_callback(&self, subscription: ReadSubscription) -> Result<()>;

    /// Close the physical connection
    async fn close_connection(&self) -> Result<()>;
}
