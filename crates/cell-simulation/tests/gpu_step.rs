//! End-to-end steps on a real adapter. Run with `cargo test -- --ignored`.

use cell_model::{Cell, HostState};
use cell_simulation::{NagaCompiler, SimulationConfig, Simulator, StateSet, IDENTITY_KERNEL};
use glam::{Vec2, Vec3};

/// Increments velocity.x of every live cell once per step.
const MARKER_KERNEL: &str = r#"
struct StepConstants {
    cell_count: u32,
    delta_time: f32,
}

var<push_constant> constants: StepConstants;

@group(0) @binding(0) var<storage, read> positions_in: array<f32>;
@group(0) @binding(1) var<storage, read> rotations_in: array<vec2<f32>>;
@group(0) @binding(2) var<storage, read> sizes_in: array<vec2<f32>>;
@group(0) @binding(3) var<storage, read> velocities_in: array<f32>;

@group(1) @binding(0) var<storage, read_write> positions_out: array<f32>;
@group(1) @binding(1) var<storage, read_write> rotations_out: array<vec2<f32>>;
@group(1) @binding(2) var<storage, read_write> sizes_out: array<vec2<f32>>;
@group(1) @binding(3) var<storage, read_write> velocities_out: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= constants.cell_count) {
        return;
    }
    for (var c = 0u; c < 3u; c = c + 1u) {
        positions_out[i * 3u + c] = positions_in[i * 3u + c];
        velocities_out[i * 3u + c] = velocities_in[i * 3u + c];
    }
    velocities_out[i * 3u] = velocities_in[i * 3u] + 1.0;
    rotations_out[i] = rotations_in[i];
    sizes_out[i] = sizes_in[i];
}
"#;

fn config(capacity: u32) -> SimulationConfig {
    SimulationConfig {
        capacity,
        ..SimulationConfig::default()
    }
}

fn fill(host: &mut HostState, count: u32) {
    host.clear();
    for i in 0..count {
        let f = i as f32;
        host.push(
            Cell::new(
                Vec3::new(f * 0.5, -f, 1.0 / (f + 1.0)),
                Vec2::new(f * 0.01, -f * 0.02),
                Vec2::new(3.0 + f, 0.5),
            )
            .with_velocity(Vec3::new(0.0, f, -0.125)),
        )
        .unwrap();
    }
}

#[test]
#[ignore] // May not have GPU in CI
fn identity_kernel_round_trips_bit_exactly() {
    let mut sim =
        Simulator::with_kernel(config(1024), &NagaCompiler, IDENTITY_KERNEL, "identity").unwrap();
    fill(sim.host_state_mut(), 300);
    let before = sim.host_state().clone();

    let report = sim.step().unwrap();
    assert!(report.uploaded);
    assert_eq!(report.workgroups, 5);

    let after = sim.host_state();
    let bits = |s: &HostState| -> Vec<u32> {
        s.positions()
            .iter()
            .flatten()
            .chain(s.rotations().iter().flatten())
            .chain(s.sizes().iter().flatten())
            .chain(s.velocities().iter().flatten())
            .map(|v| v.to_bits())
            .collect()
    };
    assert_eq!(bits(after), bits(&before));
    assert_eq!(after.ids(), before.ids());
}

#[test]
#[ignore] // May not have GPU in CI
fn roles_alternate_and_state_carries_between_steps() {
    let mut sim =
        Simulator::with_kernel(config(128), &NagaCompiler, MARKER_KERNEL, "marker").unwrap();
    fill(sim.host_state_mut(), 70);

    let mut inputs = Vec::new();
    for _ in 0..3 {
        let report = sim.step().unwrap();
        assert_ne!(report.input_set, report.output_set);
        inputs.push(report.input_set);
    }
    assert_eq!(inputs, vec![StateSet::A, StateSet::B, StateSet::A]);
    assert_eq!(sim.step_index(), 3);

    for v in sim.host_state().velocities() {
        assert_eq!(v[0], 3.0);
    }
}

#[test]
#[ignore] // May not have GPU in CI
fn only_live_cells_are_touched() {
    let mut sim =
        Simulator::with_kernel(config(256), &NagaCompiler, MARKER_KERNEL, "marker").unwrap();
    fill(sim.host_state_mut(), 120);
    sim.step().unwrap();

    // slots 100..120 of both sets now hold values the next steps must not touch
    sim.host_state_mut().set_cell_count(100).unwrap();
    let report = sim.step().unwrap();
    assert!(report.uploaded);
    assert_eq!(report.cell_count, 100);
    assert_eq!(report.workgroups, 2);
    assert_eq!(sim.host_state().velocities().len(), 100);

    let device = sim.download_device_state().unwrap();
    assert_eq!(device.cell_count(), 256);
    for (i, v) in device.velocities().iter().enumerate() {
        let expected = match i {
            0..=99 => [2.0, i as f32, -0.125],
            100..=119 => [0.0, i as f32, -0.125],
            _ => [0.0; 3],
        };
        assert_eq!(*v, expected, "slot {i}");
    }

    sim.step().unwrap();
    let device = sim.download_device_state().unwrap();
    for i in 0..120 {
        let f = i as f32;
        let expected_x = if i < 100 { 3.0 } else { 1.0 };
        assert_eq!(device.velocities()[i][0], expected_x, "slot {i}");
        assert_eq!(device.positions()[i], [f * 0.5, -f, 1.0 / (f + 1.0)], "slot {i}");
    }
    assert_eq!(device.sizes()[200], [0.0, 0.0]);
}

#[test]
#[ignore] // May not have GPU in CI
fn edits_between_steps_are_uploaded_before_the_kernel() {
    let mut sim =
        Simulator::with_kernel(config(128), &NagaCompiler, MARKER_KERNEL, "marker").unwrap();
    fill(sim.host_state_mut(), 70);
    sim.step().unwrap();
    assert!(!sim.step().unwrap().uploaded);

    sim.host_state_mut().velocities_mut()[5] = [10.0, 0.0, 0.0];
    let report = sim.step().unwrap();
    assert!(report.uploaded);
    assert_eq!(report.gpu_timed, sim.has_gpu_timestamps());

    let velocities = sim.host_state().velocities();
    assert_eq!(velocities[5][0], 11.0);
    assert_eq!(velocities[4][0], 3.0);
    assert_eq!(velocities[69][0], 3.0);
}

#[test]
#[ignore] // May not have GPU in CI
fn default_kernel_advects_and_reports_time() {
    let mut sim = Simulator::with_default_kernel(config(1024)).unwrap();
    sim.host_state_mut().positions_mut()[0] = [0.0, 0.0, 0.0];
    sim.host_state_mut().velocities_mut()[0] = [2.0, 0.0, 0.0];

    sim.step().unwrap();
    let dt = sim.config().delta_time;
    assert!((sim.host_state().positions()[0][0] - 2.0 * dt).abs() < 1e-6);
    assert!(sim.last_step_time() >= 0.0);
}

#[test]
#[ignore] // May not have GPU in CI
fn empty_state_steps_without_work() {
    let mut sim = Simulator::with_default_kernel(config(64)).unwrap();
    sim.host_state_mut().clear();

    let report = sim.step().unwrap();
    assert_eq!(report.cell_count, 0);
    assert_eq!(report.workgroups, 0);
}
