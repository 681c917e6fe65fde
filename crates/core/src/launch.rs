/// Global and local work sizes for one dispatch. Global sizes are rounded up
/// to a whole number of work groups, so kernels must guard their indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    pub global: [usize; 3],
    pub local: [usize; 3],
}

fn round_up(total: usize, group: usize) -> usize {
    let group = group.max(1);
    total.max(1).div_ceil(group) * group
}

impl LaunchConfig {
    pub const ELEMENTWISE_GROUP: usize = 64;
    pub const TILE: usize = 8;

    pub fn new_1d(total_threads: usize, threads_per_group: usize) -> Self {
        Self {
            global: [round_up(total_threads, threads_per_group), 1, 1],
            local: [threads_per_group.max(1), 1, 1],
        }
    }

    pub fn new_2d(width: usize, height: usize, threads_per_group_x: usize, threads_per_group_y: usize) -> Self {
        Self {
            global: [
                round_up(width, threads_per_group_x),
                round_up(height, threads_per_group_y),
                1,
            ],
            local: [threads_per_group_x.max(1), threads_per_group_y.max(1), 1],
        }
    }

    pub fn new_3d(width: usize, height: usize, depth: usize,
                  threads_per_group_x: usize, threads_per_group_y: usize, threads_per_group_z: usize) -> Self {
        Self {
            global: [
                round_up(width, threads_per_group_x),
                round_up(height, threads_per_group_y),
                round_up(depth, threads_per_group_z),
            ],
            local: [threads_per_group_x.max(1), threads_per_group_y.max(1), threads_per_group_z.max(1)],
        }
    }

    /// One work item per element, 64 per group.
    pub fn elementwise(n: usize) -> Self {
        Self::new_1d(n, Self::ELEMENTWISE_GROUP)
    }

    /// 8x8 tiles over a 2-D domain.
    pub fn tiled(width: usize, height: usize) -> Self {
        Self::new_2d(width, height, Self::TILE, Self::TILE)
    }

    /// 8x8 tiles over x/y with one layer per z.
    pub fn planes(width: usize, height: usize, depth: usize) -> Self {
        Self::new_3d(width, height, depth, Self::TILE, Self::TILE, 1)
    }

    /// A single work item.
    pub fn single() -> Self {
        Self::new_1d(1, 1)
    }

    pub fn groups(&self) -> [usize; 3] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
            self.global[2] / self.local[2],
        ]
    }
}
