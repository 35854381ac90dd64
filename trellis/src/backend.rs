//! Collaborator interfaces: device backends, presentation surfaces, resources
//! and units of work.
//!
//! The graph drives these traits but implements none of them: a backend turns
//! the recorded commands into API calls (see [`crate::vulkan::VulkanBackend`]),
//! a surface provider owns acquire/present, and units of work record the
//! actual draws and dispatches.
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Error;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// The execution queue a pass or submission is bound to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueueKind {
    Graphics,
    /// A dedicated compute queue, distinct from the graphics queue.
    Compute,
    Present,
}

/// Opaque handle to a backend semaphore (binary or timeline).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SemaphoreId(pub u64);

/// Opaque handle to a backend command buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CommandBufferId(pub u64);

/// Opaque handle to a backend image.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageId(pub u64);

/// Opaque handle to a backend buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufferId(pub u64);

/// Size of a 2D image in pixels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Size2D {
    pub width: u32,
    pub height: u32,
}

/// Access-optimized state of an image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageLayout {
    Undefined,
    General,
    DepthStencilAttachment,
    PresentSrc,
}

bitflags! {
    /// Backend-neutral memory access mask.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct AccessFlags: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const COLOR_ATTACHMENT_WRITE = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 3;
        const MEMORY_READ = 1 << 4;
        const MEMORY_WRITE = 1 << 5;
    }
}

bitflags! {
    /// Backend-neutral pipeline stage mask.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct StageFlags: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const COMPUTE_SHADER = 1 << 3;
        const BOTTOM_OF_PIPE = 1 << 4;
        const ALL_COMMANDS = 1 << 5;
    }
}

/// Execution + memory barrier without any resource attached.
#[derive(Copy, Clone, Debug)]
pub struct MemoryBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

/// Barrier on a buffer range (always the whole buffer here).
#[derive(Copy, Clone, Debug)]
pub struct BufferBarrier {
    pub buffer: BufferId,
    pub size: u64,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

/// Barrier on an image, optionally transitioning its layout.
#[derive(Copy, Clone, Debug)]
pub struct ImageBarrier {
    pub image: ImageId,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// A color attachment of a dynamic rendering scope.
#[derive(Copy, Clone, Debug)]
pub struct ColorAttachment {
    pub image: ImageId,
    pub layout: ImageLayout,
    /// Clear on load instead of preserving previous contents.
    pub clear: bool,
}

/// The depth attachment of a dynamic rendering scope.
#[derive(Copy, Clone, Debug)]
pub struct DepthAttachment {
    pub image: ImageId,
    pub layout: ImageLayout,
    pub clear: bool,
}

/// Describes one dynamic rendering scope.
#[derive(Clone, Debug)]
pub struct RenderingInfo {
    pub area: Size2D,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_attachment: Option<DepthAttachment>,
}

/// One queue submission: a batch of command buffers plus its semaphore
/// operations. Wait stages are uniform across the batch.
#[derive(Clone, Debug)]
pub struct SubmitBatch {
    pub queue: QueueKind,
    pub command_buffers: Vec<CommandBufferId>,
    pub waits: Vec<(SemaphoreId, StageFlags)>,
    pub signals: Vec<SemaphoreId>,
    /// Extra timeline signal appended to the batch, with the value to signal.
    pub timeline_signal: Option<(SemaphoreId, u64)>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Device-side collaborator: owns synchronization primitives, command buffer
/// lifecycles, queue submission and the timestamp query pool.
///
/// Command recording may happen from multiple worker threads at once, but
/// never into the same command buffer; implementations must be safe to share.
pub trait DeviceBackend: Send + Sync {
    fn create_binary_semaphore(&self) -> Result<SemaphoreId, Error>;
    fn create_timeline_semaphore(&self) -> Result<SemaphoreId, Error>;
    /// Blocks until the timeline semaphore reaches `value`.
    fn wait_timeline(&self, semaphore: SemaphoreId, value: u64) -> Result<(), Error>;

    /// Allocates a command buffer on the given queue kind. The buffer is
    /// re-recorded every frame, so backends must allow begin after submit.
    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferId, Error>;
    fn begin_commands(&self, cmd: CommandBufferId) -> Result<(), Error>;
    fn end_commands(&self, cmd: CommandBufferId) -> Result<(), Error>;

    fn cmd_pipeline_barrier(
        &self,
        cmd: CommandBufferId,
        src_stage: StageFlags,
        dst_stage: StageFlags,
        memory: &[MemoryBarrier],
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    );
    fn cmd_begin_rendering(&self, cmd: CommandBufferId, info: &RenderingInfo);
    fn cmd_end_rendering(&self, cmd: CommandBufferId);

    fn submit(&self, batch: SubmitBatch) -> Result<(), Error>;
    fn wait_idle(&self) -> Result<(), Error>;

    fn supports_timestamps(&self, queue: QueueKind) -> bool;
    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f64;
    fn create_timestamp_pool(&self, capacity: u32) -> Result<(), Error>;
    fn reset_timestamp_pool(&self);
    fn cmd_write_timestamp(&self, cmd: CommandBufferId, stage: StageFlags, slot: u32);
    /// Reads back the first `count` timestamp slots, waiting for availability.
    fn read_timestamps(&self, count: u32) -> Result<Vec<u64>, Error>;
}

/// Result of an acquire or present call that is allowed to go stale.
///
/// Stale is not a failure: it tells the caller to reset the graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum SurfaceStatus {
    Ready,
    Stale,
}

/// Presentation collaborator. Owns the presentable images and the index of
/// the one currently handed out by the presentation engine.
pub trait SurfaceProvider {
    /// Requests the next presentable image, signalling `semaphore` once it is
    /// available. The acquired index is observable through `current_index`.
    fn acquire_next(&mut self, semaphore: SemaphoreId) -> Result<SurfaceStatus, Error>;
    fn present(&mut self, wait: SemaphoreId, index: u32) -> Result<SurfaceStatus, Error>;
    fn current_index(&self) -> u32;
    fn image_count(&self) -> usize;
    fn images(&self) -> Vec<Arc<dyn ImageResource>>;
    /// Recreates the presentable images (typically after a resize) and
    /// returns the images that were in use before.
    fn recreate(&mut self) -> Result<Vec<Arc<dyn ImageResource>>, Error>;
}

/// A concrete image owned by a collaborator (allocator, swapchain, ...).
///
/// Layout is tracked on the resource itself so that the first pass touching
/// an image each frame can decide whether a transition is still needed.
pub trait ImageResource: Send + Sync {
    fn id(&self) -> ImageId;
    fn size(&self) -> Size2D;
    fn layout(&self) -> ImageLayout;
    fn set_layout(&self, layout: ImageLayout);
    /// Destroys and recreates the underlying image at `size`, leaving it in
    /// the undefined layout.
    fn recreate(&self, size: Size2D, cmd: CommandBufferId, device: &dyn DeviceBackend) -> Result<(), Error>;
}

/// A concrete buffer owned by a collaborator.
pub trait BufferResource: Send + Sync {
    fn id(&self) -> BufferId;
    fn byte_size(&self) -> u64;
}

/// A drawable or dispatchable element registered into a pass. Executed every
/// frame, possibly from a worker thread.
pub trait UnitOfWork: Send + Sync {
    fn update(&self, frame: usize, cmd: CommandBufferId, device: &dyn DeviceBackend) {
        let _ = (frame, cmd, device);
    }
    fn draw(&self, frame: usize, cmd: CommandBufferId, device: &dyn DeviceBackend);
    fn reset(&self, surface_images: &[Arc<dyn ImageResource>], cmd: CommandBufferId, device: &dyn DeviceBackend) {
        let _ = (surface_images, cmd, device);
    }
}

/// Records a layout transition for `image` and updates its tracked layout.
pub fn change_layout(
    image: &dyn ImageResource,
    new_layout: ImageLayout,
    src_access: AccessFlags,
    dst_access: AccessFlags,
    cmd: CommandBufferId,
    device: &dyn DeviceBackend,
) {
    let barrier = ImageBarrier {
        image: image.id(),
        src_access,
        dst_access,
        old_layout: image.layout(),
        new_layout,
    };
    device.cmd_pipeline_barrier(
        cmd,
        StageFlags::ALL_COMMANDS,
        StageFlags::ALL_COMMANDS,
        &[],
        &[],
        &[barrier],
    );
    image.set_layout(new_layout);
}
