//! Simulation-wide constants

/// Default number of cell slots allocated on the host and on the GPU
pub const DEFAULT_CAPACITY: u32 = 1024;

/// Default timestep in seconds
pub const DEFAULT_DELTA_TIME: f32 = 0.05;

/// Invocations per workgroup, must match `@workgroup_size` in the kernels
pub const WORKGROUP_SIZE: u32 = 64;

// Default scene: a column of rod-shaped cells along +z
/// Number of cells in the default scene
pub const SEED_CELL_COUNT: u32 = 11;

/// Spacing between consecutive seed cells
pub const SEED_SPACING: f32 = 2.6;

/// Seed cell length
pub const SEED_LENGTH: f32 = 3.0;

/// Seed cell radius
pub const SEED_RADIUS: f32 = 0.5;

/// Seed cell color (packed RGBA, opaque red)
pub const SEED_COLOR: u32 = 0xFF00_00FF;

/// Size of one viz record: position, direction, length, radius, color
pub const VIZ_RECORD_SIZE: usize = 9 * 4;

/// zlib level used for compressed snapshots
pub const SNAPSHOT_COMPRESSION_LEVEL: u32 = 2;
