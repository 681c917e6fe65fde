use log::info;
use nngraph_core::{Backend, KernelRegistry, Result};

use crate::MetalDevice;

/// Command backend over the system default Metal device.
pub fn metal_backend(registry: KernelRegistry) -> Result<Backend<MetalDevice>> {
    let device = MetalDevice::new()?;
    info!("using Metal device {}", nngraph_core::Device::name(&device));
    Ok(Backend::new(device, registry))
}
