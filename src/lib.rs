pub mod config;
pub mod device;
pub mod events;
pub mod logging;
pub mod serial;

pub use config::SerialSettings;
pub use device::{ConnectionState, ConnectionStatus, DeviceError, DeviceManager, PortDescriptor};
pub use events::{EventKind, EventNotifier, SerialEvent};
pub use serial::{ConnectionOptions, SerialError, SerialTransport};
