//! The per-step protocol: upload, dispatch, readback, timing
//!
//! A step is planned as an ordered list of [`StepCommand`]s by [`plan_step`]
//! and then replayed into a fresh command encoder. Keeping the plan pure lets
//! the ordering rules be tested without a GPU.
//!
//! The upload is queued with `Queue::write_buffer`, which wgpu executes ahead
//! of the step's command buffer. It is therefore planned first, before the
//! begin timestamp, and GPU timing never includes it.

use std::sync::mpsc;
use std::time::Instant;

use cell_model::{Attribute, HostState, ModelError, WORKGROUP_SIZE};

use crate::device::GpuDevice;
use crate::error::{Result, SimError};
use crate::hooks::WaitHooks;
use crate::params::StepConstants;
use crate::pipeline::ComputePipeline;
use crate::state::{attribute_range, PingPong, StateSet, StateStore};
use crate::timing::TimestampQueries;

/// Workgroups needed to cover `threads` invocations
pub fn workgroup_count(threads: u32, group_size: u32) -> u32 {
    threads.div_ceil(group_size)
}

/// Execution dependency between transfer and shader work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Upload/copy writes must land before the kernel reads
    TransferToShader,
    /// Kernel writes must land before the readback copy
    ShaderToTransfer,
}

impl Barrier {
    fn marker(self) -> &'static str {
        match self {
            Barrier::TransferToShader => "barrier: transfer write -> shader read",
            Barrier::ShaderToTransfer => "barrier: shader write -> transfer read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSlot {
    Begin = 0,
    End = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCommand {
    WriteTimestamp(TimestampSlot),
    /// Host mirror into the input set, queued ahead of the command buffer
    Upload,
    /// Input set into the output set, so unwritten slots carry over
    CopyInputToOutput,
    Barrier(Barrier),
    Dispatch { workgroups: u32 },
    /// Output set into the host-visible readback set
    Readback,
    ResolveTimestamps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInputs {
    pub cell_count: u32,
    pub upload_pending: bool,
    pub readback: bool,
    pub timestamps: bool,
}

/// Ordered commands for one step.
pub fn plan_step(inputs: StepInputs) -> Vec<StepCommand> {
    let mut plan = Vec::with_capacity(10);

    if inputs.upload_pending {
        plan.push(StepCommand::Upload);
    }
    if inputs.timestamps {
        plan.push(StepCommand::WriteTimestamp(TimestampSlot::Begin));
    }
    if inputs.upload_pending {
        plan.push(StepCommand::CopyInputToOutput);
        plan.push(StepCommand::Barrier(Barrier::TransferToShader));
    }
    plan.push(StepCommand::Dispatch {
        workgroups: workgroup_count(inputs.cell_count, WORKGROUP_SIZE),
    });
    if inputs.readback {
        plan.push(StepCommand::Barrier(Barrier::ShaderToTransfer));
        plan.push(StepCommand::Readback);
    }
    if inputs.timestamps {
        plan.push(StepCommand::WriteTimestamp(TimestampSlot::End));
        plan.push(StepCommand::ResolveTimestamps);
    }
    plan
}

/// Observable state of the engine between and during steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPhase {
    #[default]
    Idle,
    Recording,
    Submitted,
    Complete,
}

/// Outcome of a completed step
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub elapsed_seconds: f64,
    pub input_set: StateSet,
    pub output_set: StateSet,
    pub uploaded: bool,
    pub cell_count: u32,
    pub workgroups: u32,
    /// Elapsed time came from GPU timestamps rather than the host clock
    pub gpu_timed: bool,
}

type MapReceiver = mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>;

/// Owns the ping-pong roles, the upload flag and the submission fence.
#[derive(Default)]
pub struct StepEngine {
    roles: PingPong,
    upload_pending: bool,
    fence: Option<wgpu::SubmissionIndex>,
    phase: StepPhase,
    timestamps: Option<TimestampQueries>,
    readback: bool,
}

impl StepEngine {
    pub fn new(device: &GpuDevice, readback: bool) -> Result<Self> {
        let timestamps = match device.timestamps() {
            Some(calibration) => Some(TimestampQueries::create(device, calibration)?),
            None => None,
        };
        Ok(Self {
            roles: PingPong::default(),
            upload_pending: true,
            fence: None,
            phase: StepPhase::Idle,
            timestamps,
            readback,
        })
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn roles(&self) -> PingPong {
        self.roles
    }

    pub fn upload_pending(&self) -> bool {
        self.upload_pending
    }

    /// Host state changed; the next step uploads it.
    pub fn mark_upload_pending(&mut self) {
        self.upload_pending = true;
    }

    pub fn has_gpu_timestamps(&self) -> bool {
        self.timestamps.is_some()
    }

    /// Run one synchronous step.
    pub fn step(
        &mut self,
        device: &mut GpuDevice,
        state: &StateStore,
        pipeline: &ComputePipeline,
        host: &mut HostState,
        hooks: &mut dyn WaitHooks,
        delta_time: f32,
    ) -> Result<StepReport> {
        let started = Instant::now();
        device.check_uncaptured()?;
        let cell_count = host.cell_count();
        if cell_count > state.capacity() {
            return Err(ModelError::CapacityExceeded {
                requested: cell_count as u64,
                capacity: state.capacity(),
            }
            .into());
        }

        let input = self.roles.input();
        let output = self.roles.output();
        let uploaded = self.upload_pending;
        let plan = plan_step(StepInputs {
            cell_count,
            upload_pending: uploaded,
            readback: self.readback,
            timestamps: self.timestamps.is_some(),
        });

        // Idle -> Recording
        self.phase = StepPhase::Recording;
        let bind_groups = state.bind_descriptors(device, pipeline, input, output, cell_count)?;
        let mut encoder = {
            let (raw, commands) = device.recorder()?;
            commands.begin(raw)?
        };

        let mut workgroups = 0;
        for command in &plan {
            match *command {
                StepCommand::WriteTimestamp(slot) => {
                    if let Some(queries) = &self.timestamps {
                        queries.write(&mut encoder, slot as u32);
                    }
                }
                StepCommand::Upload => {
                    let queue = device.queue()?;
                    let host: &HostState = host;
                    device.checked(|_| -> Result<()> {
                        for attribute in Attribute::ALL {
                            let bytes = host.attribute_bytes(attribute);
                            if !bytes.is_empty() {
                                let target = state.set(input).buffer(attribute).handle()?;
                                queue.write_buffer(target, 0, bytes);
                            }
                        }
                        Ok(())
                    })??;
                }
                StepCommand::CopyInputToOutput => {
                    copy_set(&mut encoder, state, input, output, cell_count)?;
                }
                StepCommand::Barrier(barrier) => encoder.insert_debug_marker(barrier.marker()),
                StepCommand::Dispatch { workgroups: count } => {
                    workgroups = count;
                    let constants = StepConstants {
                        cell_count,
                        delta_time,
                    };
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Step Compute Pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline.raw()?);
                    pass.set_bind_group(0, &bind_groups[0], &[]);
                    pass.set_bind_group(1, &bind_groups[1], &[]);
                    pass.set_push_constants(0, bytemuck::bytes_of(&constants));
                    pass.dispatch_workgroups(count, 1, 1);
                }
                StepCommand::Readback => {
                    copy_to_readback(&mut encoder, state, output, cell_count)?;
                }
                StepCommand::ResolveTimestamps => {
                    if let Some(queries) = &self.timestamps {
                        queries.resolve(&mut encoder)?;
                    }
                }
            }
        }
        if uploaded {
            self.upload_pending = false;
        }

        // Recording -> Submitted
        let queue = device.queue()?;
        let submission = device.checked(|_| queue.submit(std::iter::once(encoder.finish())))?;
        self.fence = Some(submission.clone());
        self.phase = StepPhase::Submitted;
        device.check_uncaptured()?;

        let pending = if self.readback {
            request_readback(state, cell_count)?
        } else {
            Vec::new()
        };
        let timestamp_map = match &self.timestamps {
            Some(queries) => {
                let staging = queries.staging();
                Some(request_map(staging.handle()?, staging.size()))
            }
            None => None,
        };

        hooks.wait_begin();
        let waited = device.device()?.poll(wgpu::PollType::Wait {
            submission_index: Some(submission),
            timeout: None,
        });
        hooks.wait_end();
        waited.map_err(|e| SimError::driver("DEVICE_LOST", e.to_string()))?;
        self.fence = None;
        device.check_uncaptured()?;

        // Submitted -> Complete
        finish_readback(state, cell_count, pending, host)?;

        let (elapsed_seconds, gpu_timed) = match (&self.timestamps, timestamp_map) {
            (Some(queries), Some(receiver)) => {
                await_map(receiver)?;
                let staging = queries.staging().handle()?;
                let elapsed = {
                    let view = staging.slice(..).get_mapped_range();
                    queries.decode(&view)
                };
                staging.unmap();
                (elapsed, true)
            }
            _ => (started.elapsed().as_secs_f64(), false),
        };

        self.roles.swap();
        self.phase = StepPhase::Complete;

        log::debug!(
            "Step done: {cell_count} cells, {workgroups} workgroups, {input:?} -> {output:?}, {:.3} ms",
            elapsed_seconds * 1e3
        );

        Ok(StepReport {
            elapsed_seconds,
            input_set: input,
            output_set: output,
            uploaded,
            cell_count,
            workgroups,
            gpu_timed,
        })
    }

    /// Read every slot of the current input set, live or not, into a host
    /// state filled to capacity. The device holds no ids, so the returned
    /// ids are placeholders.
    pub fn download_input(&self, device: &mut GpuDevice, state: &StateStore) -> Result<HostState> {
        device.check_uncaptured()?;
        let capacity = state.capacity();
        let mut host = HostState::with_capacity(capacity);
        host.set_cell_count(capacity)?;

        let mut encoder = {
            let (raw, commands) = device.recorder()?;
            commands.begin(raw)?
        };
        copy_to_readback(&mut encoder, state, self.roles.input(), capacity)?;

        let queue = device.queue()?;
        let submission = device.checked(|_| queue.submit(std::iter::once(encoder.finish())))?;
        let pending = request_readback(state, capacity)?;
        device
            .device()?
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: None,
            })
            .map_err(|e| SimError::driver("DEVICE_LOST", e.to_string()))?;
        device.check_uncaptured()?;

        finish_readback(state, capacity, pending, &mut host)?;
        log::debug!("Downloaded {capacity} slots of set {:?}", self.roles.input());
        Ok(host)
    }

    pub fn destroy(&mut self) {
        if let Some(mut queries) = self.timestamps.take() {
            queries.destroy();
        }
        self.fence = None;
        self.phase = StepPhase::Idle;
    }
}

fn copy_set(
    encoder: &mut wgpu::CommandEncoder,
    state: &StateStore,
    from: StateSet,
    to: StateSet,
    cell_count: u32,
) -> Result<()> {
    for attribute in Attribute::ALL {
        let range = attribute_range(attribute, cell_count);
        if range > 0 {
            encoder.copy_buffer_to_buffer(
                state.set(from).buffer(attribute).handle()?,
                0,
                state.set(to).buffer(attribute).handle()?,
                0,
                range,
            );
        }
    }
    Ok(())
}

fn copy_to_readback(
    encoder: &mut wgpu::CommandEncoder,
    state: &StateStore,
    from: StateSet,
    count: u32,
) -> Result<()> {
    for attribute in Attribute::ALL {
        let range = attribute_range(attribute, count);
        if range > 0 {
            encoder.copy_buffer_to_buffer(
                state.set(from).buffer(attribute).handle()?,
                0,
                state.readback().buffer(attribute).handle()?,
                0,
                range,
            );
        }
    }
    Ok(())
}

fn request_readback(state: &StateStore, count: u32) -> Result<Vec<(Attribute, MapReceiver)>> {
    let mut pending = Vec::new();
    for attribute in Attribute::ALL {
        let range = attribute_range(attribute, count);
        if range > 0 {
            let buffer = state.readback().buffer(attribute).handle()?;
            pending.push((attribute, request_map(buffer, range)));
        }
    }
    Ok(pending)
}

/// Copy mapped readback ranges into the first `count` cells of `host`.
fn finish_readback(
    state: &StateStore,
    count: u32,
    pending: Vec<(Attribute, MapReceiver)>,
    host: &mut HostState,
) -> Result<()> {
    for (attribute, receiver) in pending {
        await_map(receiver)?;
        let buffer = state.readback().buffer(attribute).handle()?;
        let range = attribute_range(attribute, count);
        {
            let view = buffer.slice(..range).get_mapped_range();
            host.attribute_bytes_mut(attribute).copy_from_slice(&view);
        }
        buffer.unmap();
    }
    Ok(())
}

fn request_map(buffer: &wgpu::Buffer, range: u64) -> MapReceiver {
    let (tx, rx) = mpsc::channel();
    buffer.slice(..range).map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    rx
}

#[track_caller]
fn await_map(receiver: MapReceiver) -> Result<()> {
    match receiver.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SimError::driver("MEMORY_MAP_FAILED", e.to_string())),
        Err(_) => Err(SimError::driver("MEMORY_MAP_FAILED", "map callback never ran")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inputs(cell_count: u32) -> StepInputs {
        StepInputs {
            cell_count,
            upload_pending: true,
            readback: true,
            timestamps: true,
        }
    }

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroup_count(130, 64), 3);
        assert_eq!(workgroup_count(128, 64), 2);
        assert_eq!(workgroup_count(1, 64), 1);
        assert_eq!(workgroup_count(0, 64), 0);
    }

    #[test]
    fn full_plan_order() {
        assert_eq!(
            plan_step(inputs(130)),
            vec![
                StepCommand::Upload,
                StepCommand::WriteTimestamp(TimestampSlot::Begin),
                StepCommand::CopyInputToOutput,
                StepCommand::Barrier(Barrier::TransferToShader),
                StepCommand::Dispatch { workgroups: 3 },
                StepCommand::Barrier(Barrier::ShaderToTransfer),
                StepCommand::Readback,
                StepCommand::WriteTimestamp(TimestampSlot::End),
                StepCommand::ResolveTimestamps,
            ]
        );
    }

    #[test]
    fn upload_is_queued_before_the_timed_range() {
        let plan = plan_step(StepInputs {
            readback: false,
            ..inputs(1)
        });
        let at = |command: StepCommand| plan.iter().position(|c| *c == command).unwrap();
        let upload = at(StepCommand::Upload);
        let begin = at(StepCommand::WriteTimestamp(TimestampSlot::Begin));

        assert_eq!(upload, 0);
        assert!(upload < begin);
        assert!(begin < at(StepCommand::CopyInputToOutput));
    }

    #[test]
    fn steady_state_plan_skips_upload() {
        let plan = plan_step(StepInputs {
            upload_pending: false,
            timestamps: false,
            ..inputs(64)
        });
        assert_eq!(
            plan,
            vec![
                StepCommand::Dispatch { workgroups: 1 },
                StepCommand::Barrier(Barrier::ShaderToTransfer),
                StepCommand::Readback,
            ]
        );
    }

    #[test]
    fn no_readback_means_single_barrier() {
        let plan = plan_step(StepInputs {
            readback: false,
            ..inputs(10)
        });
        let barriers: Vec<_> = plan
            .iter()
            .filter(|c| matches!(c, StepCommand::Barrier(_)))
            .collect();
        assert_eq!(barriers, vec![&StepCommand::Barrier(Barrier::TransferToShader)]);
        assert!(!plan.contains(&StepCommand::Readback));
    }

    #[test]
    fn fresh_engine_is_idle_with_upload_pending() {
        let mut engine = StepEngine::default();
        assert_eq!(engine.phase(), StepPhase::Idle);
        assert!(!engine.has_gpu_timestamps());
        engine.mark_upload_pending();
        assert!(engine.upload_pending());
        engine.destroy();
        engine.destroy();
        assert_eq!(engine.roles().input(), StateSet::A);
    }

    proptest! {
        #[test]
        fn plans_cover_exactly_the_live_cells(
            cell_count in 0u32..100_000,
            upload_pending in any::<bool>(),
            readback in any::<bool>(),
            timestamps in any::<bool>(),
        ) {
            let plan = plan_step(StepInputs { cell_count, upload_pending, readback, timestamps });

            let dispatches: Vec<u32> = plan
                .iter()
                .filter_map(|c| match c {
                    StepCommand::Dispatch { workgroups } => Some(*workgroups),
                    _ => None,
                })
                .collect();
            prop_assert_eq!(dispatches.len(), 1);
            let threads = dispatches[0] as u64 * WORKGROUP_SIZE as u64;
            prop_assert!(threads >= cell_count as u64);
            prop_assert!(threads < cell_count as u64 + WORKGROUP_SIZE as u64);

            let dispatch_at = plan.iter().position(|c| matches!(c, StepCommand::Dispatch { .. })).unwrap();
            if let Some(upload_at) = plan.iter().position(|c| *c == StepCommand::Upload) {
                prop_assert!(upload_pending);
                prop_assert!(upload_at < dispatch_at);
            }
            if let Some(readback_at) = plan.iter().position(|c| *c == StepCommand::Readback) {
                prop_assert!(readback_at > dispatch_at);
            }
            if timestamps {
                let first_recorded = if upload_pending { 1 } else { 0 };
                prop_assert_eq!(
                    plan.get(first_recorded),
                    Some(&StepCommand::WriteTimestamp(TimestampSlot::Begin))
                );
                prop_assert_eq!(plan.last(), Some(&StepCommand::ResolveTimestamps));
            }
        }
    }
}
