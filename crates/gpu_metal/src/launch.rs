use metal::{ComputeCommandEncoderRef, ComputePipelineState, MTLSize};
use nngraph_core::LaunchConfig;

fn size(v: [usize; 3]) -> MTLSize {
    MTLSize::new(v[0] as u64, v[1] as u64, v[2] as u64)
}

/// Thread-group count and size for a launch.
pub fn metal_sizes(config: &LaunchConfig) -> (MTLSize, MTLSize) {
    (size(config.groups()), size(config.local))
}

pub fn dispatch_kernel(
    encoder: &ComputeCommandEncoderRef,
    pipeline: &ComputePipelineState,
    config: &LaunchConfig,
) {
    let (grid_size, block_size) = metal_sizes(config);
    encoder.set_compute_pipeline_state(pipeline);
    encoder.dispatch_thread_groups(grid_size, block_size);
}
