use crate::context::DeviceContext;
use crate::error::{CoreError, Result};
use std::fmt::Debug;
use std::sync::Arc;

/// The device runtime as seen by one process: how many devices it can see
/// and how to make one of them current.
pub trait DeviceInventory: Send + Sync + Debug {
    /// Number of accelerator devices visible on this node.
    fn device_count(&self) -> Result<usize>;

    /// Makes `ordinal` the current device of this process.
    fn bind(&self, ordinal: usize) -> Result<DeviceBinding>;
}

/// A device made current for this process.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    ordinal: usize,
    name: String,
    context: Option<Arc<DeviceContext>>,
}

impl DeviceBinding {
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wgpu context behind this binding, if the inventory opened one.
    pub fn context(&self) -> Option<&DeviceContext> {
        self.context.as_deref()
    }

    /// Waits for outstanding device work. A no-op for simulated devices.
    pub fn synchronize(&self) -> Result<()> {
        match &self.context {
            Some(context) => context.synchronize(),
            None => Ok(()),
        }
    }
}

/// Inventory with a fixed device count and no device runtime behind it.
/// Used to simulate node layouts.
#[derive(Debug, Clone, Copy)]
pub struct FixedInventory {
    device_count: usize,
}

impl FixedInventory {
    pub fn new(device_count: usize) -> Self {
        Self { device_count }
    }
}

impl DeviceInventory for FixedInventory {
    fn device_count(&self) -> Result<usize> {
        Ok(self.device_count)
    }

    fn bind(&self, ordinal: usize) -> Result<DeviceBinding> {
        if ordinal >= self.device_count {
            return Err(CoreError::Device {
                ordinal,
                message: format!("only {} simulated devices exist", self.device_count),
            });
        }
        Ok(DeviceBinding {
            ordinal,
            name: format!("simulated device {}", ordinal),
            context: None,
        })
    }
}

/// Inventory backed by the GPU adapters wgpu can see on this node.
/// CPU (software) adapters are not counted.
pub struct WgpuInventory {
    instance: wgpu::Instance,
    backends: wgpu::Backends,
}

impl Debug for WgpuInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuInventory")
            .field("backends", &self.backends)
            .finish()
    }
}

impl Default for WgpuInventory {
    fn default() -> Self {
        Self::new(wgpu::Backends::PRIMARY) // Vulkan, Metal, DX12
    }
}

impl WgpuInventory {
    pub fn new(backends: wgpu::Backends) -> Self {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        Self { instance, backends }
    }

    fn gpu_adapters(&self) -> Vec<wgpu::Adapter> {
        self.instance
            .enumerate_adapters(self.backends)
            .into_iter()
            .filter(|adapter| adapter.get_info().device_type != wgpu::DeviceType::Cpu)
            .collect()
    }
}

impl DeviceInventory for WgpuInventory {
    fn device_count(&self) -> Result<usize> {
        let adapters = self.gpu_adapters();
        for (ordinal, adapter) in adapters.iter().enumerate() {
            log::debug!("Adapter {}: {:?}", ordinal, adapter.get_info());
        }
        Ok(adapters.len())
    }

    fn bind(&self, ordinal: usize) -> Result<DeviceBinding> {
        let mut adapters = self.gpu_adapters();
        let count = adapters.len();
        if ordinal >= count {
            return Err(CoreError::Device {
                ordinal,
                message: format!("only {} GPU adapters are visible", count),
            });
        }
        let adapter = adapters.swap_remove(ordinal);
        let context = pollster::block_on(DeviceContext::open(adapter, ordinal))?;
        Ok(DeviceBinding {
            ordinal,
            name: context.info().name.clone(),
            context: Some(Arc::new(context)),
        })
    }
}
