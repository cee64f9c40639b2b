//! Cell attributes and the host-side mirror of the simulation state

use glam::{Vec2, Vec3};

use crate::constants::*;
use crate::error::{ModelError, Result};

/// Per-cell attributes that live in GPU storage buffers.
///
/// The discriminant doubles as the binding index inside each state set, so the
/// order here must match the `@binding` numbers in the kernels.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    Position = 0,
    Rotation = 1,
    Size = 2,
    Velocity = 3,
}

impl Attribute {
    pub const ALL: [Attribute; 4] = [
        Attribute::Position,
        Attribute::Rotation,
        Attribute::Size,
        Attribute::Velocity,
    ];

    /// Bytes per element; arrays are tightly packed on both sides.
    pub const fn element_size(self) -> u64 {
        match self {
            Attribute::Position | Attribute::Velocity => 3 * 4,
            Attribute::Rotation | Attribute::Size => 2 * 4,
        }
    }

    pub const fn binding(self) -> u32 {
        self as u32
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Attribute::Position => "Positions",
            Attribute::Rotation => "Rotations",
            Attribute::Size => "Sizes",
            Attribute::Velocity => "Velocities",
        }
    }
}

/// A single cell as seen by host code
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub position: Vec3,
    /// x: pitch, y: yaw
    pub rotation: Vec2,
    /// x: length, y: radius
    pub size: Vec2,
    pub velocity: Vec3,
    /// Packed RGBA, only used for visualization
    pub color: u32,
}

impl Cell {
    pub fn new(position: Vec3, rotation: Vec2, size: Vec2) -> Self {
        Self {
            position,
            rotation,
            size,
            velocity: Vec3::ZERO,
            color: 0xFFFF_FFFF,
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    /// Forward direction as written to viz snapshots
    pub fn direction(&self) -> Vec3 {
        Vec3::from_array(direction_from_angles(self.rotation.to_array()))
    }
}

/// Direction vector derived from `[pitch, yaw]`.
///
/// The viewer reconstructs pitch from `y` and yaw from `x`/`z`, so the
/// components are `(sin(yaw), cos(pitch), cos(yaw))` rather than a unit vector.
pub fn direction_from_angles(rotation: [f32; 2]) -> [f32; 3] {
    let [pitch, yaw] = rotation;
    [yaw.sin(), pitch.cos(), yaw.cos()]
}

/// Host mirror of the simulation state.
///
/// Every attribute array is allocated at full capacity up front; only the first
/// `cell_count` elements are meaningful. Slices handed out by the accessors are
/// already truncated to `cell_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostState {
    capacity: u32,
    cell_count: u32,
    positions: Vec<[f32; 3]>,
    rotations: Vec<[f32; 2]>,
    sizes: Vec<[f32; 2]>,
    velocities: Vec<[f32; 3]>,
    colors: Vec<u32>,
    ids: Vec<u64>,
    next_id: u64,
}

impl HostState {
    pub fn with_capacity(capacity: u32) -> Self {
        let slots = capacity as usize;
        Self {
            capacity,
            cell_count: 0,
            positions: vec![[0.0; 3]; slots],
            rotations: vec![[0.0; 2]; slots],
            sizes: vec![[0.0; 2]; slots],
            velocities: vec![[0.0; 3]; slots],
            colors: vec![0; slots],
            ids: vec![0; slots],
            next_id: 0,
        }
    }

    /// The default scene: a column of identical cells stacked along z.
    pub fn seeded(capacity: u32) -> Result<Self> {
        let mut state = Self::with_capacity(capacity);
        for i in 0..SEED_CELL_COUNT {
            let z = SEED_SPACING * (6.0 - i as f32);
            let cell = Cell::new(
                Vec3::new(0.0, 0.0, z),
                Vec2::new(std::f32::consts::FRAC_PI_2, 0.0),
                Vec2::new(SEED_LENGTH, SEED_RADIUS),
            )
            .with_color(SEED_COLOR);
            state.push(cell)?;
        }
        Ok(state)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn cell_count(&self) -> u32 {
        self.cell_count
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count == 0
    }

    /// Id that the next inserted cell will receive
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Resize the live range. Newly exposed slots are reset and get fresh ids.
    pub fn set_cell_count(&mut self, count: u32) -> Result<()> {
        self.check_capacity(count as u64)?;
        for slot in self.cell_count as usize..count as usize {
            self.reset_slot(slot);
        }
        self.cell_count = count;
        Ok(())
    }

    /// Append a cell and return its id.
    pub fn push(&mut self, cell: Cell) -> Result<u64> {
        self.check_capacity(self.cell_count as u64 + 1)?;
        let slot = self.cell_count as usize;
        self.reset_slot(slot);
        self.write_slot(slot, &cell);
        self.cell_count += 1;
        Ok(self.ids[slot])
    }

    pub fn clear(&mut self) {
        self.cell_count = 0;
    }

    pub fn cell(&self, index: u32) -> Option<Cell> {
        if index >= self.cell_count {
            return None;
        }
        let i = index as usize;
        Some(Cell {
            position: Vec3::from_array(self.positions[i]),
            rotation: Vec2::from_array(self.rotations[i]),
            size: Vec2::from_array(self.sizes[i]),
            velocity: Vec3::from_array(self.velocities[i]),
            color: self.colors[i],
        })
    }

    /// Overwrite a live cell, keeping its id.
    pub fn set_cell(&mut self, index: u32, cell: Cell) -> Result<()> {
        if index >= self.cell_count {
            return Err(ModelError::CapacityExceeded {
                requested: index as u64 + 1,
                capacity: self.cell_count,
            });
        }
        self.write_slot(index as usize, &cell);
        Ok(())
    }

    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions[..self.live()]
    }

    pub fn positions_mut(&mut self) -> &mut [[f32; 3]] {
        let live = self.live();
        &mut self.positions[..live]
    }

    pub fn rotations(&self) -> &[[f32; 2]] {
        &self.rotations[..self.live()]
    }

    pub fn rotations_mut(&mut self) -> &mut [[f32; 2]] {
        let live = self.live();
        &mut self.rotations[..live]
    }

    pub fn sizes(&self) -> &[[f32; 2]] {
        &self.sizes[..self.live()]
    }

    pub fn sizes_mut(&mut self) -> &mut [[f32; 2]] {
        let live = self.live();
        &mut self.sizes[..live]
    }

    pub fn velocities(&self) -> &[[f32; 3]] {
        &self.velocities[..self.live()]
    }

    pub fn velocities_mut(&mut self) -> &mut [[f32; 3]] {
        let live = self.live();
        &mut self.velocities[..live]
    }

    pub fn colors(&self) -> &[u32] {
        &self.colors[..self.live()]
    }

    pub fn colors_mut(&mut self) -> &mut [u32] {
        let live = self.live();
        &mut self.colors[..live]
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids[..self.live()]
    }

    /// Live elements of a GPU attribute as raw bytes (upload source).
    pub fn attribute_bytes(&self, attribute: Attribute) -> &[u8] {
        let live = self.live();
        match attribute {
            Attribute::Position => bytemuck::cast_slice(&self.positions[..live]),
            Attribute::Rotation => bytemuck::cast_slice(&self.rotations[..live]),
            Attribute::Size => bytemuck::cast_slice(&self.sizes[..live]),
            Attribute::Velocity => bytemuck::cast_slice(&self.velocities[..live]),
        }
    }

    /// Live elements of a GPU attribute as raw bytes (readback destination).
    pub fn attribute_bytes_mut(&mut self, attribute: Attribute) -> &mut [u8] {
        let live = self.live();
        match attribute {
            Attribute::Position => bytemuck::cast_slice_mut(&mut self.positions[..live]),
            Attribute::Rotation => bytemuck::cast_slice_mut(&mut self.rotations[..live]),
            Attribute::Size => bytemuck::cast_slice_mut(&mut self.sizes[..live]),
            Attribute::Velocity => bytemuck::cast_slice_mut(&mut self.velocities[..live]),
        }
    }

    /// Copy the live cells (and their ids) of `other` into this state.
    ///
    /// Used when restoring a snapshot whose capacity may differ from ours.
    pub fn replace_with(&mut self, other: &HostState) -> Result<()> {
        self.check_capacity(other.cell_count as u64)?;
        let live = other.live();
        self.positions[..live].copy_from_slice(other.positions());
        self.rotations[..live].copy_from_slice(other.rotations());
        self.sizes[..live].copy_from_slice(other.sizes());
        self.velocities[..live].copy_from_slice(other.velocities());
        self.colors[..live].copy_from_slice(other.colors());
        self.ids[..live].copy_from_slice(other.ids());
        self.cell_count = other.cell_count;
        self.next_id = self.next_id.max(other.next_id);
        Ok(())
    }

    /// State holding exactly the decoded cells (capacity == count).
    pub(crate) fn from_parts(parts: StateParts) -> Self {
        let live = parts.ids.len();
        let mut state = Self::with_capacity(live as u32);
        state.positions[..live].copy_from_slice(&parts.positions);
        state.rotations[..live].copy_from_slice(&parts.rotations);
        state.sizes[..live].copy_from_slice(&parts.sizes);
        state.velocities[..live].copy_from_slice(&parts.velocities);
        state.colors[..live].copy_from_slice(&parts.colors);
        state.ids[..live].copy_from_slice(&parts.ids);
        state.cell_count = live as u32;
        state.next_id = parts.next_id;
        state
    }

    fn live(&self) -> usize {
        self.cell_count as usize
    }

    fn check_capacity(&self, requested: u64) -> Result<()> {
        if requested > self.capacity as u64 {
            return Err(ModelError::CapacityExceeded {
                requested,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn reset_slot(&mut self, slot: usize) {
        self.positions[slot] = [0.0; 3];
        self.rotations[slot] = [0.0; 2];
        self.sizes[slot] = [0.0; 2];
        self.velocities[slot] = [0.0; 3];
        self.colors[slot] = 0;
        self.ids[slot] = self.next_id;
        self.next_id += 1;
    }

    fn write_slot(&mut self, slot: usize, cell: &Cell) {
        self.positions[slot] = cell.position.to_array();
        self.rotations[slot] = cell.rotation.to_array();
        self.sizes[slot] = cell.size.to_array();
        self.velocities[slot] = cell.velocity.to_array();
        self.colors[slot] = cell.color;
    }
}

/// Decoded step-file contents; every vector has one entry per live cell
pub(crate) struct StateParts {
    pub next_id: u64,
    pub positions: Vec<[f32; 3]>,
    pub rotations: Vec<[f32; 2]>,
    pub sizes: Vec<[f32; 2]>,
    pub velocities: Vec<[f32; 3]>,
    pub colors: Vec<u32>,
    pub ids: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seeded_scene_matches_default_column() {
        let state = HostState::seeded(DEFAULT_CAPACITY).unwrap();
        assert_eq!(state.cell_count(), SEED_CELL_COUNT);
        assert_eq!(state.positions()[0], [0.0, 0.0, 2.6 * 6.0]);
        assert_eq!(state.positions()[10], [0.0, 0.0, 2.6 * -4.0]);
        assert_eq!(state.sizes()[3], [3.0, 0.5]);
        assert_eq!(state.colors()[7], SEED_COLOR);
        assert_eq!(state.ids(), (0..11).collect::<Vec<u64>>().as_slice());
    }

    #[test]
    fn push_past_capacity_is_rejected() {
        let mut state = HostState::with_capacity(2);
        let cell = Cell::new(Vec3::ONE, Vec2::ZERO, Vec2::ONE);
        state.push(cell).unwrap();
        state.push(cell).unwrap();
        let err = state.push(cell).unwrap_err();
        assert!(matches!(
            err,
            ModelError::CapacityExceeded {
                requested: 3,
                capacity: 2
            }
        ));
        assert_eq!(state.cell_count(), 2);
    }

    #[test]
    fn regrown_slots_are_reset_with_new_ids() {
        let mut state = HostState::with_capacity(4);
        let cell = Cell::new(Vec3::splat(7.0), Vec2::ZERO, Vec2::ONE);
        state.push(cell).unwrap();
        state.push(cell).unwrap();
        state.set_cell_count(1).unwrap();
        state.set_cell_count(2).unwrap();

        assert_eq!(state.positions()[1], [0.0; 3]);
        assert_eq!(state.ids(), &[0, 2]);
    }

    #[test]
    fn set_cell_keeps_id() {
        let mut state = HostState::with_capacity(4);
        state
            .push(Cell::new(Vec3::ZERO, Vec2::ZERO, Vec2::ONE))
            .unwrap();
        let moved = Cell::new(Vec3::X, Vec2::ZERO, Vec2::ONE).with_velocity(Vec3::Y);
        state.set_cell(0, moved).unwrap();

        assert_eq!(state.cell(0), Some(moved));
        assert_eq!(state.ids(), &[0]);
        assert!(state.set_cell(1, moved).is_err());
    }

    #[test]
    fn direction_mixes_pitch_and_yaw() {
        assert_eq!(direction_from_angles([0.0, 0.0]), [0.0, 1.0, 1.0]);
        assert_eq!(direction_from_angles([std::f32::consts::PI, 0.0]), [0.0, -1.0, 1.0]);

        let [x, y, z] = direction_from_angles([0.0, std::f32::consts::FRAC_PI_2]);
        assert!((x - 1.0).abs() < 1e-6);
        assert_eq!(y, 1.0);
        assert!(z.abs() < 1e-6);
    }

    #[test]
    fn replace_with_rejects_larger_snapshot() {
        let big = HostState::seeded(64).unwrap();
        let mut small = HostState::with_capacity(4);
        assert!(small.replace_with(&big).is_err());

        let mut roomy = HostState::with_capacity(32);
        roomy.replace_with(&big).unwrap();
        assert_eq!(roomy.positions(), big.positions());
        assert_eq!(roomy.ids(), big.ids());
        assert_eq!(roomy.next_id(), big.next_id());
    }

    proptest! {
        #[test]
        fn live_range_tracks_count(capacity in 1u32..2048, fraction in 0.0f64..=1.0) {
            let count = (capacity as f64 * fraction) as u32;
            let mut state = HostState::with_capacity(capacity);
            state.set_cell_count(count).unwrap();

            for attribute in Attribute::ALL {
                prop_assert_eq!(
                    state.attribute_bytes(attribute).len() as u64,
                    count as u64 * attribute.element_size()
                );
            }
            prop_assert_eq!(state.ids().len(), count as usize);
            prop_assert!(state.set_cell_count(capacity + 1).is_err());
            prop_assert_eq!(state.cell_count(), count);
        }
    }
}
