//! Passes: named units of GPU work with declared resource usage.
use std::sync::Arc;

use fxhash::FxHashSet;

use crate::{
    backend::{
        ColorAttachment, CommandBufferId, DepthAttachment, DeviceBackend, ImageResource, QueueKind, RenderingInfo,
        SemaphoreId, UnitOfWork,
    },
    error::Error,
    registry::{FrameContext, ResourceRegistry},
};

slotmap::new_key_type! {
    /// Stable handle to a pass inside a graph.
    pub struct PassId;
}

/// Selects which element of a semaphore pool applies to the current frame.
/// Resolved against a [`FrameContext`] at submission time, since the frame
/// index is unknown when the graph is calculated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SemaphoreIndex {
    FrameInFlight,
    PresentableImage,
}

impl SemaphoreIndex {
    fn resolve(&self, ctx: &FrameContext) -> usize {
        match *self {
            SemaphoreIndex::FrameInFlight => ctx.frame_in_flight,
            SemaphoreIndex::PresentableImage => ctx.presentable_image,
        }
    }
}

#[derive(Clone, Debug)]
struct SemaphoreSlot {
    pool: Vec<SemaphoreId>,
    index: SemaphoreIndex,
}

/// Declared resource usage of a render pass.
#[derive(Default)]
pub struct RenderPassData {
    pub(crate) color_targets: Vec<String>,
    pub(crate) depth_target: Option<String>,
    pub(crate) texture_inputs: Vec<String>,
    pub(crate) clear_targets: FxHashSet<String>,
}

/// Declared resource usage of a compute pass.
#[derive(Default)]
pub struct ComputePassData {
    pub(crate) storage_buffer_inputs: Vec<String>,
    pub(crate) storage_buffer_outputs: Vec<String>,
    pub(crate) storage_texture_inputs: Vec<String>,
    pub(crate) storage_texture_outputs: Vec<String>,
    pub(crate) dedicated_queue: bool,
}

/// The two pass kinds, matched exhaustively by the resolver and scheduler.
pub enum PassData {
    Render(RenderPassData),
    Compute(ComputePassData),
}

/// A named unit of GPU work. Owns one command buffer per frame in flight and
/// the semaphore operations attached by the resolver.
pub struct Pass {
    name: String,
    data: PassData,
    command_buffers: Vec<CommandBufferId>,
    pub(crate) recording: Vec<bool>,
    waits: Vec<SemaphoreSlot>,
    signals: Vec<SemaphoreSlot>,
    work: Vec<Arc<dyn UnitOfWork>>,
}

impl Pass {
    pub(crate) fn new(
        name: &str,
        data: PassData,
        frames_in_flight: usize,
        device: &dyn DeviceBackend,
    ) -> Result<Pass, Error> {
        let queue = match data {
            PassData::Render(_) => QueueKind::Graphics,
            PassData::Compute(ref compute) if compute.dedicated_queue => QueueKind::Compute,
            PassData::Compute(_) => QueueKind::Graphics,
        };
        let command_buffers = (0..frames_in_flight)
            .map(|_| device.create_command_buffer(queue))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pass {
            name: name.to_owned(),
            data,
            recording: vec![false; frames_in_flight],
            command_buffers,
            waits: Vec::new(),
            signals: Vec::new(),
            work: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &PassData {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut PassData {
        &mut self.data
    }

    /// The queue this pass submits to.
    pub fn queue_kind(&self) -> QueueKind {
        match self.data {
            PassData::Compute(ref compute) if compute.dedicated_queue => QueueKind::Compute,
            _ => QueueKind::Graphics,
        }
    }

    pub fn command_buffers(&self) -> &[CommandBufferId] {
        &self.command_buffers
    }

    /// Appends a unit of work; units run in registration order every frame.
    pub fn register_unit(&mut self, unit: Arc<dyn UnitOfWork>) {
        self.work.push(unit);
    }

    /// Attaches a wait operation: one semaphore out of `pool`, selected by
    /// `index` each frame.
    pub fn add_wait_semaphore(&mut self, pool: Vec<SemaphoreId>, index: SemaphoreIndex) {
        self.waits.push(SemaphoreSlot { pool, index });
    }

    /// Attaches a signal operation, symmetric to [`Pass::add_wait_semaphore`].
    pub fn add_signal_semaphore(&mut self, pool: Vec<SemaphoreId>, index: SemaphoreIndex) {
        self.signals.push(SemaphoreSlot { pool, index });
    }

    /// Swaps out the signal pool currently equal to `old`. Used when the
    /// presentation surface changes its image count and the per-image
    /// semaphores must be reissued.
    pub(crate) fn replace_signal_pool(&mut self, old: &[SemaphoreId], pool: Vec<SemaphoreId>) {
        if let Some(slot) = self.signals.iter_mut().find(|slot| slot.pool == old) {
            slot.pool = pool;
        }
    }

    /// The concrete semaphores to wait on for the frame described by `ctx`.
    pub fn wait_semaphores(&self, ctx: &FrameContext) -> Vec<SemaphoreId> {
        self.waits.iter().map(|slot| slot.pool[slot.index.resolve(ctx)]).collect()
    }

    /// The concrete semaphores to signal for the frame described by `ctx`.
    pub fn signal_semaphores(&self, ctx: &FrameContext) -> Vec<SemaphoreId> {
        self.signals
            .iter()
            .map(|slot| slot.pool[slot.index.resolve(ctx)])
            .collect()
    }

    /// The resource names this pass reads: storage inputs for compute,
    /// texture inputs for render.
    pub(crate) fn declared_inputs(&self) -> Vec<&str> {
        match self.data {
            PassData::Render(ref render) => render.texture_inputs.iter().map(String::as_str).collect(),
            PassData::Compute(ref compute) => compute
                .storage_buffer_inputs
                .iter()
                .chain(compute.storage_texture_inputs.iter())
                .map(String::as_str)
                .collect(),
        }
    }

    /// The resource names the resolver chases producers for. A render pass
    /// with no texture inputs still depends on whoever wrote its
    /// attachments, so those stand in when the input list is empty.
    pub(crate) fn dependency_inputs(&self) -> Vec<&str> {
        let inputs = self.declared_inputs();
        if inputs.is_empty() {
            if let PassData::Render(ref render) = self.data {
                return render.color_targets.iter().map(String::as_str).collect();
            }
        }
        inputs
    }

    /// Whether this pass writes the named resource.
    pub(crate) fn declares_output(&self, resource: &str) -> bool {
        match self.data {
            PassData::Render(ref render) => {
                render.color_targets.iter().any(|t| t == resource)
                    || render.depth_target.as_deref() == Some(resource)
            }
            PassData::Compute(ref compute) => {
                compute.storage_buffer_outputs.iter().any(|t| t == resource)
                    || compute.storage_texture_outputs.iter().any(|t| t == resource)
            }
        }
    }

    /// The image resource names that could be bound to the presentation
    /// surface: attachments and texture inputs for render, storage textures
    /// for compute.
    pub(crate) fn presentation_candidates(&self) -> Vec<&str> {
        match self.data {
            PassData::Render(ref render) => render
                .color_targets
                .iter()
                .chain(render.texture_inputs.iter())
                .map(String::as_str)
                .collect(),
            PassData::Compute(ref compute) => compute
                .storage_texture_inputs
                .iter()
                .chain(compute.storage_texture_outputs.iter())
                .map(String::as_str)
                .collect(),
        }
    }

    /// Records this pass's work for `frame` into `cmd`.
    ///
    /// Render passes wrap every unit in a dynamic rendering scope over the
    /// declared targets; compute passes dispatch the units directly. A
    /// missing declared target is a configuration error, not retried.
    pub(crate) fn execute(
        &self,
        frame: usize,
        cmd: CommandBufferId,
        registry: &ResourceRegistry,
        device: &dyn DeviceBackend,
        ctx: &FrameContext,
    ) -> Result<(), Error> {
        match self.data {
            PassData::Render(ref render) => {
                let mut color_attachments = Vec::with_capacity(render.color_targets.len());
                for target in &render.color_targets {
                    let image = registry.images(target)?.current(ctx);
                    color_attachments.push(ColorAttachment {
                        image: image.id(),
                        layout: image.layout(),
                        clear: render.clear_targets.contains(target),
                    });
                }
                let depth_attachment = match render.depth_target {
                    Some(ref target) => {
                        let image = registry.images(target)?.current(ctx);
                        Some(DepthAttachment {
                            image: image.id(),
                            layout: image.layout(),
                            clear: render.clear_targets.contains(target),
                        })
                    }
                    None => None,
                };
                // the render area always matches the first declared target
                let area_source = render
                    .color_targets
                    .first()
                    .or(render.depth_target.as_ref())
                    .ok_or_else(|| Error::NoRenderTargets {
                        name: self.name.clone(),
                    })?;
                let area = registry.images(area_source)?.current(ctx).size();
                let info = RenderingInfo {
                    area,
                    color_attachments,
                    depth_attachment,
                };

                for unit in &self.work {
                    unit.update(frame, cmd, device);
                    device.cmd_begin_rendering(cmd, &info);
                    unit.draw(frame, cmd, device);
                    device.cmd_end_rendering(cmd);
                }
            }
            PassData::Compute(_) => {
                for unit in &self.work {
                    unit.draw(frame, cmd, device);
                }
            }
        }
        Ok(())
    }

    /// Lets every unit refresh state derived from the presentable images.
    pub(crate) fn reset_units(
        &self,
        surface_images: &[Arc<dyn ImageResource>],
        cmd: CommandBufferId,
        device: &dyn DeviceBackend,
    ) {
        for unit in &self.work {
            unit.reset(surface_images, cmd, device);
        }
    }
}
