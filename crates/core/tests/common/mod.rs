use nngraph_core::{Backend, CpuDevice, KernelRegistry, Network, NetworkConfig};

pub const MANIFEST: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../kernels/kernels.txt");

pub fn registry() -> KernelRegistry {
    KernelRegistry::from_manifest(MANIFEST, ".metal").unwrap()
}

pub fn network() -> Network<CpuDevice> {
    Network::new(Backend::new(CpuDevice::new(), registry()), NetworkConfig::default())
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "element {i}: {a} vs {e}");
    }
}
