//! Per-frame recording, submission and surface recovery.
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    backend::{
        change_layout, AccessFlags, BufferBarrier, ImageBarrier, ImageLayout, MemoryBarrier, QueueKind, SemaphoreId,
        StageFlags, SubmitBatch, SurfaceStatus,
    },
    error::Error,
    graph::FrameGraph,
    pass::{PassData, PassId},
    registry::FrameContext,
};

impl FrameGraph {
    /// Records, submits and presents one frame.
    ///
    /// Throttles the CPU on the frame timeline so that at most
    /// `frames_in_flight` frames are outstanding, then acquires a
    /// presentable image, records every scheduled pass on the worker pool
    /// and submits the command buffers batch by batch, cutting a batch at
    /// each queue change. Same-queue dependencies become pipeline barriers
    /// appended to the producer's command buffer; the final batch signals
    /// the frame timeline.
    ///
    /// Returns [`SurfaceStatus::Stale`] when the surface needs to be rebuilt
    /// with [`FrameGraph::reset`]; the frame is skipped in that case.
    pub fn render(&mut self) -> Result<SurfaceStatus, Error> {
        let schedule = self.schedule.clone().ok_or(Error::NotCalculated)?;
        if schedule.order.is_empty() {
            return Ok(SurfaceStatus::Ready);
        }
        let frame = self.frame_in_flight;
        let signal_value = self.submitted_frames + 1;

        if signal_value > self.frames_in_flight as u64 {
            self.device
                .wait_timeline(self.frame_timeline, signal_value - self.frames_in_flight as u64)?;
        }

        if let SurfaceStatus::Stale = self.surface.acquire_next(self.image_available[frame])? {
            return Ok(SurfaceStatus::Stale);
        }
        let ctx = self.frame_context();
        let presentable = ctx.presentable_image;
        trace!(frame, presentable, signal_value, "frame begin");

        self.profiler.begin_frame(&*self.device);

        for &id in &schedule.order {
            let pass = &mut self.passes[id];
            if !pass.recording[frame] {
                let cmd = pass.command_buffers()[frame];
                self.device.begin_commands(cmd)?;
                pass.recording[frame] = true;
            }
        }

        // The presentable image is acquired in whatever layout the engine
        // left it in; bring it to the general layout at the head of the
        // frame's first command buffer.
        let surface_images = self.surface.images();
        let surface_image = &surface_images[presentable];
        if surface_image.layout() != ImageLayout::General {
            let first_cmd = self.passes[schedule.order[0]].command_buffers()[frame];
            change_layout(
                surface_image.as_ref(),
                ImageLayout::General,
                AccessFlags::empty(),
                AccessFlags::empty(),
                first_cmd,
                &*self.device,
            );
        }

        // Record all passes in parallel; each one owns its command buffer
        // for the frame, so the only shared state is the profiler.
        let device = &*self.device;
        let passes = &self.passes;
        let registry = &self.registry;
        let profiler = &self.profiler;
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        self.workers.scope(|scope| {
            for &id in &schedule.order {
                let pass = &passes[id];
                let cmd = pass.command_buffers()[frame];
                let failure = &failure;
                scope.spawn(move |_| {
                    let result = profiler
                        .push(pass.name(), cmd, device)
                        .and_then(|_| pass.execute(frame, cmd, registry, device, &ctx));
                    profiler.pop(pass.name(), cmd, device);
                    if let Err(err) = result {
                        let mut slot = failure.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                });
            }
        });
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }

        // Layout transitions recorded by a surface rebuild go first, on the
        // same queue as the frame itself.
        if self.reset_pending {
            self.device.submit(SubmitBatch {
                queue: QueueKind::Graphics,
                command_buffers: vec![self.reset_cmd],
                waits: Vec::new(),
                signals: Vec::new(),
                timeline_signal: None,
            })?;
            self.reset_pending = false;
        }

        let mut batch: Vec<PassId> = Vec::new();
        let mut waits: Vec<SemaphoreId> = Vec::new();
        let mut signals: Vec<SemaphoreId> = Vec::new();
        for (position, &id) in schedule.order.iter().enumerate() {
            let record = &schedule.records[position];
            if let Some(previous) = record.predecessor {
                if record.queue_changed {
                    self.submit_batch(&batch, frame, &waits, &signals, None)?;
                    batch.clear();
                    waits.clear();
                    signals.clear();
                } else {
                    // The producer's command buffer is still open, so the
                    // dependency barrier lands at its tail instead of
                    // splitting the batch.
                    self.append_dependency_barriers(previous, id, frame, &ctx)?;
                }
            }
            batch.push(id);
            waits.extend(self.passes[id].wait_semaphores(&ctx));
            signals.extend(self.passes[id].signal_semaphores(&ctx));
        }

        // Hand the presentable image back to the presentation engine.
        if surface_image.layout() != ImageLayout::PresentSrc {
            let tail = batch.last().copied().ok_or(Error::NotCalculated)?;
            change_layout(
                surface_image.as_ref(),
                ImageLayout::PresentSrc,
                AccessFlags::COLOR_ATTACHMENT_WRITE,
                AccessFlags::empty(),
                self.passes[tail].command_buffers()[frame],
                &*self.device,
            );
        }

        self.submit_batch(&batch, frame, &waits, &signals, Some((self.frame_timeline, signal_value)))?;
        self.profiler.fetch(&*self.device)?;

        self.submitted_frames = signal_value;
        self.frame_in_flight = (signal_value % self.frames_in_flight as u64) as usize;

        self.surface.present(self.render_finished[presentable], presentable as u32)
    }

    /// Ends and submits the command buffers of `batch` as one unit of queue
    /// work. The batch's queue and wait stage are those of its last pass.
    fn submit_batch(
        &mut self,
        batch: &[PassId],
        frame: usize,
        waits: &[SemaphoreId],
        signals: &[SemaphoreId],
        timeline_signal: Option<(SemaphoreId, u64)>,
    ) -> Result<(), Error> {
        let Some(&tail) = batch.last() else {
            return Ok(());
        };

        let mut command_buffers = Vec::with_capacity(batch.len());
        for &id in batch {
            let pass = &mut self.passes[id];
            let cmd = pass.command_buffers()[frame];
            self.device.end_commands(cmd)?;
            pass.recording[frame] = false;
            command_buffers.push(cmd);
        }

        let tail_pass = &self.passes[tail];
        let wait_stage = match tail_pass.data() {
            PassData::Render(_) => StageFlags::FRAGMENT_SHADER,
            PassData::Compute(_) => StageFlags::COMPUTE_SHADER,
        };
        self.device.submit(SubmitBatch {
            queue: tail_pass.queue_kind(),
            command_buffers,
            waits: waits.iter().map(|&semaphore| (semaphore, wait_stage)).collect(),
            signals: signals.to_vec(),
            timeline_signal,
        })
    }

    /// Emits the execution and memory barriers covering a same-queue
    /// dependency of `consumer` into the tail of `producer`'s command
    /// buffer. Layouts are untouched here.
    fn append_dependency_barriers(
        &self,
        producer: PassId,
        consumer: PassId,
        frame: usize,
        ctx: &FrameContext,
    ) -> Result<(), Error> {
        let cmd = self.passes[producer].command_buffers()[frame];
        match self.passes[consumer].data() {
            PassData::Render(render) => {
                let mut images = Vec::with_capacity(render.texture_inputs.len());
                for input in &render.texture_inputs {
                    let image = self.registry.images(input)?.current(ctx);
                    images.push(ImageBarrier {
                        image: image.id(),
                        src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
                        dst_access: AccessFlags::SHADER_READ,
                        old_layout: image.layout(),
                        new_layout: image.layout(),
                    });
                }
                self.device.cmd_pipeline_barrier(
                    cmd,
                    StageFlags::COLOR_ATTACHMENT_OUTPUT,
                    StageFlags::FRAGMENT_SHADER,
                    &[],
                    &[],
                    &images,
                );
            }
            PassData::Compute(compute) => {
                let mut images = Vec::with_capacity(compute.storage_texture_inputs.len());
                for input in &compute.storage_texture_inputs {
                    let image = self.registry.images(input)?.current(ctx);
                    images.push(ImageBarrier {
                        image: image.id(),
                        src_access: AccessFlags::SHADER_WRITE,
                        dst_access: AccessFlags::SHADER_READ,
                        old_layout: image.layout(),
                        new_layout: image.layout(),
                    });
                }
                let mut buffers = Vec::with_capacity(compute.storage_buffer_inputs.len());
                for input in &compute.storage_buffer_inputs {
                    let buffer = self.registry.buffers(input)?.current(ctx);
                    buffers.push(BufferBarrier {
                        buffer: buffer.id(),
                        size: buffer.byte_size(),
                        src_access: AccessFlags::SHADER_WRITE,
                        dst_access: AccessFlags::SHADER_READ,
                    });
                }
                self.device.cmd_pipeline_barrier(
                    cmd,
                    StageFlags::COMPUTE_SHADER,
                    StageFlags::COMPUTE_SHADER,
                    &[],
                    &buffers,
                    &images,
                );
            }
        }
        Ok(())
    }

    /// Rebuilds the presentation surface and every resource sized after it.
    ///
    /// Drains the device, recreates the surface, resizes and re-transitions
    /// the dependent images into a fresh command buffer and lets every
    /// scheduled pass refresh its per-image state. The recorded transitions
    /// are submitted at the start of the next [`FrameGraph::render`] call.
    /// Frame counters keep running across a reset.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.device.wait_idle()?;

        let old_surface = self.surface.recreate()?;
        let new_surface = self.surface.images();

        self.device.begin_commands(self.reset_cmd)?;
        self.registry
            .reset(&old_surface, new_surface.clone(), self.reset_cmd, &*self.device)?;
        if let Some(order) = self.schedule.as_ref().map(|schedule| schedule.order.clone()) {
            for id in order {
                self.passes[id].reset_units(&new_surface, self.reset_cmd, &*self.device);
            }
        }

        // Everything above runs on the same queue as the next frame's
        // command buffers; a global barrier makes the transitions visible
        // to them.
        self.device.cmd_pipeline_barrier(
            self.reset_cmd,
            StageFlags::ALL_COMMANDS,
            StageFlags::ALL_COMMANDS,
            &[MemoryBarrier {
                src_access: AccessFlags::MEMORY_WRITE,
                dst_access: AccessFlags::MEMORY_READ,
            }],
            &[],
            &[],
        );
        self.device.end_commands(self.reset_cmd)?;

        if self.surface.image_count() != self.render_finished.len() {
            let fresh = (0..self.surface.image_count())
                .map(|_| self.device.create_binary_semaphore())
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(&root) = self.schedule.as_ref().and_then(|schedule| schedule.order.last()) {
                self.passes[root].replace_signal_pool(&self.render_finished, fresh.clone());
            }
            self.render_finished = fresh;
        }

        self.reset_pending = true;
        Ok(())
    }
}
