//! The frame graph: pass registration, scheduling and per-frame submission.
use std::{collections::HashMap, sync::Arc};

use slotmap::SlotMap;
use tracing::debug;

use crate::{
    backend::{CommandBufferId, DeviceBackend, QueueKind, SemaphoreId, SurfaceProvider, UnitOfWork},
    error::Error,
    pass::{ComputePassData, Pass, PassData, PassId, RenderPassData, SemaphoreIndex},
    profiler::{Profiler, TimeSpan},
    registry::{FrameContext, ResourceRegistry},
};

mod frame;
mod schedule;

pub(crate) use schedule::Schedule;

/// Query slots reserved for the profiler: two per pass is plenty for any
/// graph we expect to see.
const TIMESTAMP_CAPACITY: u32 = 128;

/// A frame graph over a device backend and a presentation surface.
///
/// Typical lifecycle: register resources and passes, [`calculate`] once,
/// then call [`render`] every frame and [`reset`] whenever `render` reports a
/// stale surface.
///
/// [`calculate`]: FrameGraph::calculate
/// [`render`]: FrameGraph::render
/// [`reset`]: FrameGraph::reset
pub struct FrameGraph {
    device: Arc<dyn DeviceBackend>,
    surface: Box<dyn SurfaceProvider>,
    registry: ResourceRegistry,
    passes: SlotMap<PassId, Pass>,
    registration_order: Vec<PassId>,
    schedule: Option<Schedule>,
    workers: rayon::ThreadPool,
    profiler: Profiler,
    frames_in_flight: usize,
    /// Total frames submitted so far; also the last value signalled on the
    /// frame timeline.
    submitted_frames: u64,
    frame_in_flight: usize,
    image_available: Vec<SemaphoreId>,
    render_finished: Vec<SemaphoreId>,
    frame_timeline: SemaphoreId,
    reset_cmd: CommandBufferId,
    reset_pending: bool,
}

impl FrameGraph {
    /// Creates an empty graph.
    ///
    /// `worker_threads` sizes the pool used to record independent passes in
    /// parallel. Fails if either the graphics or the compute queue family
    /// lacks timestamp support.
    pub fn new(
        device: Arc<dyn DeviceBackend>,
        surface: Box<dyn SurfaceProvider>,
        frames_in_flight: usize,
        worker_threads: usize,
    ) -> Result<FrameGraph, Error> {
        assert!(frames_in_flight > 0, "at least one frame in flight is required");
        let workers = rayon::ThreadPoolBuilder::new().num_threads(worker_threads).build()?;
        let profiler = Profiler::new(&*device, TIMESTAMP_CAPACITY)?;

        let image_available = (0..frames_in_flight)
            .map(|_| device.create_binary_semaphore())
            .collect::<Result<Vec<_>, _>>()?;
        let render_finished = (0..surface.image_count())
            .map(|_| device.create_binary_semaphore())
            .collect::<Result<Vec<_>, _>>()?;
        let frame_timeline = device.create_timeline_semaphore()?;
        let reset_cmd = device.create_command_buffer(QueueKind::Graphics)?;

        Ok(FrameGraph {
            device,
            surface,
            registry: ResourceRegistry::new(),
            passes: SlotMap::with_key(),
            registration_order: Vec::new(),
            schedule: None,
            workers,
            profiler,
            frames_in_flight,
            submitted_frames: 0,
            frame_in_flight: 0,
            image_available,
            render_finished,
            frame_timeline,
            reset_cmd,
            reset_pending: false,
        })
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    /// The frame-in-flight slot the next `render` call will use.
    pub fn frame_in_flight(&self) -> usize {
        self.frame_in_flight
    }

    /// The indices valid for the frame currently being prepared.
    pub fn frame_context(&self) -> FrameContext {
        FrameContext {
            frame_in_flight: self.frame_in_flight,
            presentable_image: self.surface.current_index() as usize,
        }
    }

    /// Creates a render pass, or returns the existing pass registered under
    /// `name`. Fails if `name` already designates a compute pass.
    pub fn create_render_pass(&mut self, name: &str) -> Result<PassId, Error> {
        if let Some(id) = self.pass_by_name(name) {
            return match self.passes[id].data() {
                PassData::Render(_) => Ok(id),
                PassData::Compute(_) => Err(Error::PassKindMismatch { name: name.to_owned() }),
            };
        }
        let pass = Pass::new(
            name,
            PassData::Render(RenderPassData::default()),
            self.frames_in_flight,
            &*self.device,
        )?;
        let id = self.passes.insert(pass);
        self.registration_order.push(id);
        Ok(id)
    }

    /// Creates a compute pass, or returns the existing pass registered under
    /// `name`. With `dedicated_queue`, the pass submits to the compute queue
    /// instead of the graphics queue.
    pub fn create_compute_pass(&mut self, name: &str, dedicated_queue: bool) -> Result<PassId, Error> {
        if let Some(id) = self.pass_by_name(name) {
            return match self.passes[id].data() {
                PassData::Compute(_) => Ok(id),
                PassData::Render(_) => Err(Error::PassKindMismatch { name: name.to_owned() }),
            };
        }
        let pass = Pass::new(
            name,
            PassData::Compute(ComputePassData {
                dedicated_queue,
                ..ComputePassData::default()
            }),
            self.frames_in_flight,
            &*self.device,
        )?;
        let id = self.passes.insert(pass);
        self.registration_order.push(id);
        Ok(id)
    }

    pub fn pass(&self, id: PassId) -> &Pass {
        &self.passes[id]
    }

    pub fn pass_by_name(&self, name: &str) -> Option<PassId> {
        self.registration_order
            .iter()
            .copied()
            .find(|&id| self.passes[id].name() == name)
    }

    fn render_data_mut(&mut self, id: PassId) -> Result<&mut RenderPassData, Error> {
        let name = self.passes[id].name().to_owned();
        match self.passes[id].data_mut() {
            PassData::Render(render) => Ok(render),
            PassData::Compute(_) => Err(Error::PassKindMismatch { name }),
        }
    }

    fn compute_data_mut(&mut self, id: PassId) -> Result<&mut ComputePassData, Error> {
        let name = self.passes[id].name().to_owned();
        match self.passes[id].data_mut() {
            PassData::Compute(compute) => Ok(compute),
            PassData::Render(_) => Err(Error::PassKindMismatch { name }),
        }
    }

    /// Declares a color target of a render pass.
    pub fn add_color_target(&mut self, id: PassId, target: &str) -> Result<(), Error> {
        self.render_data_mut(id)?.color_targets.push(target.to_owned());
        Ok(())
    }

    /// Declares the depth target of a render pass.
    pub fn set_depth_target(&mut self, id: PassId, target: &str) -> Result<(), Error> {
        self.render_data_mut(id)?.depth_target = Some(target.to_owned());
        Ok(())
    }

    /// Declares a sampled-texture input of a render pass.
    pub fn add_texture_input(&mut self, id: PassId, input: &str) -> Result<(), Error> {
        self.render_data_mut(id)?.texture_inputs.push(input.to_owned());
        Ok(())
    }

    /// Marks a target of a render pass as cleared on first use each frame.
    pub fn clear_target(&mut self, id: PassId, target: &str) -> Result<(), Error> {
        self.render_data_mut(id)?.clear_targets.insert(target.to_owned());
        Ok(())
    }

    /// Declares a storage-buffer input of a compute pass.
    pub fn add_storage_buffer_input(&mut self, id: PassId, input: &str) -> Result<(), Error> {
        self.compute_data_mut(id)?.storage_buffer_inputs.push(input.to_owned());
        Ok(())
    }

    /// Declares a storage-buffer output of a compute pass.
    pub fn add_storage_buffer_output(&mut self, id: PassId, output: &str) -> Result<(), Error> {
        self.compute_data_mut(id)?.storage_buffer_outputs.push(output.to_owned());
        Ok(())
    }

    /// Declares a storage-texture input of a compute pass.
    pub fn add_storage_texture_input(&mut self, id: PassId, input: &str) -> Result<(), Error> {
        self.compute_data_mut(id)?.storage_texture_inputs.push(input.to_owned());
        Ok(())
    }

    /// Declares a storage-texture output of a compute pass.
    pub fn add_storage_texture_output(&mut self, id: PassId, output: &str) -> Result<(), Error> {
        self.compute_data_mut(id)?.storage_texture_outputs.push(output.to_owned());
        Ok(())
    }

    /// Registers a unit of work into a pass.
    pub fn register_unit(&mut self, id: PassId, unit: Arc<dyn UnitOfWork>) {
        self.passes[id].register_unit(unit);
    }

    /// Attaches an externally owned wait semaphore to a pass, e.g. an upload
    /// that must complete before the first frame.
    pub fn add_wait_semaphore(&mut self, id: PassId, pool: Vec<SemaphoreId>, index: SemaphoreIndex) {
        self.passes[id].add_wait_semaphore(pool, index);
    }

    /// Attaches an externally owned signal semaphore to a pass.
    pub fn add_signal_semaphore(&mut self, id: PassId, pool: Vec<SemaphoreId>, index: SemaphoreIndex) {
        self.passes[id].add_signal_semaphore(pool, index);
    }

    /// The computed execution order, by pass name. Empty before
    /// [`FrameGraph::calculate`].
    pub fn execution_order(&self) -> Vec<&str> {
        self.schedule
            .as_ref()
            .map(|schedule| schedule.order.iter().map(|&id| self.passes[id].name()).collect())
            .unwrap_or_default()
    }

    /// Per-pass GPU spans of the last fetched frame, in nanoseconds.
    pub fn timestamps(&self) -> HashMap<String, TimeSpan> {
        self.profiler.snapshot()
    }

    /// Logs the computed schedule, one pass per line.
    pub fn describe(&self) {
        let Some(ref schedule) = self.schedule else {
            return;
        };
        let ctx = self.frame_context();
        for (position, &id) in schedule.order.iter().enumerate() {
            let pass = &self.passes[id];
            debug!(
                position,
                name = pass.name(),
                queue = ?pass.queue_kind(),
                queue_changed = schedule.records[position].queue_changed,
                waits = pass.wait_semaphores(&ctx).len(),
                signals = pass.signal_semaphores(&ctx).len(),
                "pass"
            );
        }
    }
}
