use std::sync::Arc;
use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{
    ConnectionOptions, PermissionRequest, PermissionResponse, ReadHandler, ReadSubscription,
    Result, SerialDeviceInfo, SerialError, SerialTransport,
};

/// Logical path under which the granted device is addressed
pub const DEFAULT_PORT_PATH: &str = "serial";

const READ_BUFFER_SIZE: usize = 1024;

/// List USB serial ports currently visible to the OS
pub fn available_usb_ports() -> Result<Vec<SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;
    let mut devices = Vec::new();

    for port in ports {
        if let SerialPortType::UsbPort(usb_info) = port.port_type {
            devices.push(SerialDeviceInfo {
                port_name: port.port_name,
                vid: usb_info.vid,
                pid: usb_info.pid,
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            });
        }
    }

    Ok(devices)
}

/// Desktop transport on top of `serialport` / `tokio-serial`.
///
/// Desktop platforms have no interactive USB permission prompt; a permission
/// request is granted when a USB port with the requested ids is present. The
/// granted port is then reachable under the logical path (`"serial"` by
/// default). Any other path is treated as an OS port name.
pub struct NativeTransport {
    logical_path: String,
    granted: Mutex<Option<SerialDeviceInfo>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    reader: Arc<Mutex<Option<ReadHalf<SerialStream>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl NativeTransport {
    pub fn new() -> Self {
        Self::with_path(DEFAULT_PORT_PATH)
    }

    pub fn with_path(logical_path: impl Into<String>) -> Self {
        Self {
            logical_path: logical_path.into(),
            granted: Mutex::new(None),
            writer: Mutex::new(None),
            reader: Arc::new(Mutex::new(None)),
            reader_task: Mutex::new(None),
        }
    }

    /// Device granted by the last successful permission request
    pub async fn granted_device(&self) -> Option<SerialDeviceInfo> {
        self.granted.lock().await.clone()
    }

    async fn resolve_port_name(&self, path: &str) -> Result<String> {
        if path != self.logical_path {
            return Ok(path.to_string());
        }
        self.granted
            .lock()
            .await
            .as_ref()
            .map(|info| info.port_name.clone())
            .ok_or_else(|| SerialError::PortNotFound(path.to_string()))
    }
}

impl Default for NativeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialTransport for NativeTransport {
    async fn request_serial_permissions(&self, request: PermissionRequest) -> Result<PermissionResponse> {
        let ports = tokio::task::spawn_blocking(available_usb_ports)
            .await
            .map_err(|e| SerialError::ConnectionFailed(format!("Port enumeration task failed: {}", e)))??;

        let found = ports
            .into_iter()
            .find(|info| info.vid == request.vendor_id && info.pid == request.product_id);

        match found {
            Some(info) => {
                log::debug!(
                    "Granting {:04X}:{:04X} ({}) on {}",
                    request.vendor_id,
                    request.product_id,
                    request.driver,
                    info.port_name
                );
                *self.granted.lock().await = Some(info);
                Ok(PermissionResponse { granted: true })
            }
            None => Err(SerialError::PortNotFound(format!(
                "{:04X}:{:04X}",
                request.vendor_id, request.product_id
            ))),
        }
    }

    async fn open_connection(&self, path: &str, options: &ConnectionOptions) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Err(SerialError::ConnectionFailed("Connection already open".to_string()));
        }

        let port_name = self.resolve_port_name(path).await?;
        let stream = tokio_serial::new(port_name.as_str(), options.baud_rate)
            .data_bits(options.data_bits.into())
            .stop_bits(options.stop_bits.into())
            .parity(options.parity.into())
            .flow_control(options.flow_control.into())
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(read_half);
        *writer = Some(write_half);

        log::info!("Opened {} at {} baud", port_name, options.baud_rate);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let port = writer.as_mut().ok_or(SerialError::NotConnected)?;

        port.write_all(data).await?;
        port.flush().await?;

        Ok(data.len())
    }

    async fn register_read_callback(&self, handler: ReadHandler) -> Result<ReadSubscription> {
        let connected = self.writer.lock().await.is_some();
        let taken = self.reader.lock().await.take();
        let mut read_half = match taken {
            Some(read_half) => read_half,
            None if connected => return Err(SerialError::ReadCallbackRegistered),
            None => return Err(SerialError::NotConnected),
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let reader_slot = self.reader.clone();

        let task = tokio::spawn(async move {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    read = read_half.read(&mut buffer) => match read {
                        Ok(0) => {
                            log::info!("Serial stream reached end of file");
                            break;
                        }
                        Ok(n) => handler(&buffer[..n]),
                        Err(e) => {
                            log::error!("Serial read failed: {}", e);
                            break;
                        }
                    },
                }
            }
            // Hand the read half back so a new callback can be registered
            *reader_slot.lock().await = Some(read_half);
        });

        *self.reader_task.lock().await = Some(task);

        Ok(ReadSubscription::new(move || {
            let _ = stop_tx.send(());
        }))
    }

    async fn unregister_read_callback(&self, mut subscription: ReadSubscription) -> Result<()> {
        subscription.cancel();
        if let Some(task) = self.reader_task.lock().await.take() {
            if let Err(e) = task.await {
                log::warn!("Serial reader task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        let writer = self.writer.lock().await.take();
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.reader.lock().await.take();

        match writer {
            Some(mut port) => {
                port.shutdown().await?;
                log::info!("Serial connection closed");
                Ok(())
            }
            None => Err(SerialError::NotConnected),
        }
    }
}
