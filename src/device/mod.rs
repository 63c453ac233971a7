pub mod catalog;
pub mod connection;
pub mod manager;
pub mod models;
pub mod permissions;
pub mod port_monitor;
pub mod registry;

pub use catalog::{DeviceCatalog, KNOWN_DEVICES};
pub use connection::ConnectionController;
pub use manager::DeviceManager;
pub use models::*;
pub use permissions::PermissionNegotiator;
pub use port_monitor::{PollingPortMonitor, PortEvent, PortMonitor};
pub use registry::DeviceRegistry;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Cannot {operation} while connection is {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Serial close failed: {source}")]
    SerialClose {
        #[source]
        source: crate::serial::SerialError,
    },

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Port monitor error: {0}")]
    Monitor(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
