use crate::error::{CoreError, Result};
use std::sync::Arc;

/// An open wgpu device/queue pair on one adapter, the device-runtime side of
/// a [`crate::device::DeviceBinding`].
#[derive(Debug, Clone)]
pub struct DeviceContext {
    ordinal: usize,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: wgpu::AdapterInfo,
}

impl DeviceContext {
    /// Requests a device and queue on `adapter`.
    pub(crate) async fn open(adapter: wgpu::Adapter, ordinal: usize) -> Result<Self> {
        let info = adapter.get_info();
        log::info!("Opening device {}: {} ({:?})", ordinal, info.name, info.backend);

        // No shader work is issued through this context, so the adapter's
        // own limits are enough.
        let limits = wgpu::Limits::default().using_resolution(adapter.limits());
        log::debug!("Device {} limits: {:?}", ordinal, limits);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("devshare device"),
                trace: wgpu::Trace::Off,
                memory_hints: wgpu::MemoryHints::Performance,
                required_features: wgpu::Features::empty(),
                required_limits: limits,
            })
            .await
            .map_err(|e| CoreError::Device {
                ordinal,
                message: format!("Failed to request device: {}", e),
            })?;

        log::info!("Device {} and queue obtained successfully", ordinal);
        Ok(Self {
            ordinal,
            device: Arc::new(device),
            queue: Arc::new(queue),
            info,
        })
    }

    pub fn info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Blocks until all work submitted to this device has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| CoreError::Device {
                ordinal: self.ordinal,
                message: format!("Device synchronization failed: {:?}", e),
            })
    }
}
