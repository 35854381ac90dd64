//! A [`DeviceBackend`] over a Vulkan device.
//!
//! The backend owns no GPU memory: images and buffers are created by the
//! application and registered here, which hands back the opaque ids the
//! graph's resource traits speak. Command pools are created one per command
//! buffer so that independent passes can be recorded from worker threads
//! without external locking.
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::{
    backend::{
        AccessFlags, BufferBarrier, BufferId, CommandBufferId, DeviceBackend, ImageBarrier, ImageId, ImageLayout,
        MemoryBarrier, QueueKind, RenderingInfo, SemaphoreId, StageFlags, SubmitBatch,
    },
    error::Error,
};

struct RegisteredImage {
    image: vk::Image,
    view: vk::ImageView,
    aspect: vk::ImageAspectFlags,
}

struct CommandBufferSlot {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

struct QueueSlot {
    queue: Mutex<vk::Queue>,
    family: u32,
    timestamps: bool,
}

/// Queue handles and families the backend submits to. Graphics and compute
/// may alias the same family on devices without a dedicated compute queue.
pub struct QueueSetup {
    pub graphics: (u32, vk::Queue),
    pub compute: (u32, vk::Queue),
    pub present: (u32, vk::Queue),
}

pub struct VulkanBackend {
    device: ash::Device,
    graphics: QueueSlot,
    compute: QueueSlot,
    present: QueueSlot,
    timestamp_period: f64,
    next_id: AtomicU64,
    semaphores: Mutex<FxHashMap<SemaphoreId, vk::Semaphore>>,
    command_buffers: Mutex<FxHashMap<CommandBufferId, CommandBufferSlot>>,
    images: Mutex<FxHashMap<ImageId, RegisteredImage>>,
    buffers: Mutex<FxHashMap<BufferId, vk::Buffer>>,
    query_pool: Mutex<Option<(vk::QueryPool, u32)>>,
}

impl VulkanBackend {
    /// Wraps an already-created logical device. The instance and physical
    /// device are only consulted for queue-family properties and then
    /// released back to the caller.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queues: QueueSetup,
    ) -> VulkanBackend {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let slot = |family: u32, queue: vk::Queue| QueueSlot {
            queue: Mutex::new(queue),
            family,
            timestamps: families
                .get(family as usize)
                .map(|f| f.timestamp_valid_bits > 0)
                .unwrap_or(false),
        };
        VulkanBackend {
            graphics: slot(queues.graphics.0, queues.graphics.1),
            compute: slot(queues.compute.0, queues.compute.1),
            present: slot(queues.present.0, queues.present.1),
            timestamp_period: properties.limits.timestamp_period as f64,
            device,
            next_id: AtomicU64::new(1),
            semaphores: Mutex::new(FxHashMap::default()),
            command_buffers: Mutex::new(FxHashMap::default()),
            images: Mutex::new(FxHashMap::default()),
            buffers: Mutex::new(FxHashMap::default()),
            query_pool: Mutex::new(None),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an application-owned image so barriers and attachments can
    /// refer to it by id. The view must cover the subresource the graph
    /// renders to.
    pub fn register_image(&self, image: vk::Image, view: vk::ImageView, aspect: vk::ImageAspectFlags) -> ImageId {
        let id = ImageId(self.fresh_id());
        self.images.lock().insert(id, RegisteredImage { image, view, aspect });
        id
    }

    /// Replaces the Vulkan handles behind `id`, keeping the id stable across
    /// a resize.
    pub fn update_image(&self, id: ImageId, image: vk::Image, view: vk::ImageView, aspect: vk::ImageAspectFlags) {
        self.images.lock().insert(id, RegisteredImage { image, view, aspect });
    }

    /// Registers an application-owned buffer.
    pub fn register_buffer(&self, buffer: vk::Buffer) -> BufferId {
        let id = BufferId(self.fresh_id());
        self.buffers.lock().insert(id, buffer);
        id
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn semaphore(&self, id: SemaphoreId) -> vk::Semaphore {
        self.semaphores.lock().get(&id).copied().unwrap_or(vk::Semaphore::null())
    }

    fn command_buffer(&self, id: CommandBufferId) -> vk::CommandBuffer {
        self.command_buffers
            .lock()
            .get(&id)
            .map(|slot| slot.buffer)
            .unwrap_or(vk::CommandBuffer::null())
    }

    fn queue_slot(&self, kind: QueueKind) -> &QueueSlot {
        match kind {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Compute => &self.compute,
            QueueKind::Present => &self.present,
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for (_, slot) in self.command_buffers.get_mut().drain() {
                self.device.destroy_command_pool(slot.pool, None);
            }
            for (_, semaphore) in self.semaphores.get_mut().drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            if let Some((pool, _)) = self.query_pool.get_mut().take() {
                self.device.destroy_query_pool(pool, None);
            }
        }
    }
}

fn access_flags(access: AccessFlags) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();
    if access.contains(AccessFlags::SHADER_READ) {
        flags |= vk::AccessFlags::SHADER_READ;
    }
    if access.contains(AccessFlags::SHADER_WRITE) {
        flags |= vk::AccessFlags::SHADER_WRITE;
    }
    if access.contains(AccessFlags::COLOR_ATTACHMENT_WRITE) {
        flags |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if access.contains(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE) {
        flags |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if access.contains(AccessFlags::MEMORY_READ) {
        flags |= vk::AccessFlags::MEMORY_READ;
    }
    if access.contains(AccessFlags::MEMORY_WRITE) {
        flags |= vk::AccessFlags::MEMORY_WRITE;
    }
    flags
}

fn stage_flags(stage: StageFlags) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();
    if stage.contains(StageFlags::TOP_OF_PIPE) {
        flags |= vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if stage.contains(StageFlags::COLOR_ATTACHMENT_OUTPUT) {
        flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if stage.contains(StageFlags::FRAGMENT_SHADER) {
        flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stage.contains(StageFlags::COMPUTE_SHADER) {
        flags |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if stage.contains(StageFlags::BOTTOM_OF_PIPE) {
        flags |= vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    if stage.contains(StageFlags::ALL_COMMANDS) {
        flags |= vk::PipelineStageFlags::ALL_COMMANDS;
    }
    flags
}

fn image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

impl DeviceBackend for VulkanBackend {
    fn create_binary_semaphore(&self) -> Result<SemaphoreId, Error> {
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.create_semaphore(&info, None)? };
        let id = SemaphoreId(self.fresh_id());
        self.semaphores.lock().insert(id, semaphore);
        Ok(id)
    }

    fn create_timeline_semaphore(&self) -> Result<SemaphoreId, Error> {
        let mut timeline =
            vk::SemaphoreTypeCreateInfo::builder().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline);
        let semaphore = unsafe { self.device.create_semaphore(&info, None)? };
        let id = SemaphoreId(self.fresh_id());
        self.semaphores.lock().insert(id, semaphore);
        Ok(id)
    }

    fn wait_timeline(&self, semaphore: SemaphoreId, value: u64) -> Result<(), Error> {
        let semaphores = [self.semaphore(semaphore)];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder().semaphores(&semaphores).values(&values);
        unsafe { self.device.wait_semaphores(&info, u64::MAX)? };
        Ok(())
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferId, Error> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_slot(queue).family);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None)? };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)? }[0];
        let id = CommandBufferId(self.fresh_id());
        self.command_buffers.lock().insert(id, CommandBufferSlot { pool, buffer });
        Ok(id)
    }

    fn begin_commands(&self, cmd: CommandBufferId) -> Result<(), Error> {
        let info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.command_buffer(cmd), &info)? };
        Ok(())
    }

    fn end_commands(&self, cmd: CommandBufferId) -> Result<(), Error> {
        unsafe { self.device.end_command_buffer(self.command_buffer(cmd))? };
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: CommandBufferId,
        src_stage: StageFlags,
        dst_stage: StageFlags,
        memory: &[MemoryBarrier],
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    ) {
        let memory_barriers: Vec<vk::MemoryBarrier> = memory
            .iter()
            .map(|barrier| {
                vk::MemoryBarrier::builder()
                    .src_access_mask(access_flags(barrier.src_access))
                    .dst_access_mask(access_flags(barrier.dst_access))
                    .build()
            })
            .collect();
        let registered_buffers = self.buffers.lock();
        let buffer_barriers: Vec<vk::BufferMemoryBarrier> = buffers
            .iter()
            .map(|barrier| {
                vk::BufferMemoryBarrier::builder()
                    .src_access_mask(access_flags(barrier.src_access))
                    .dst_access_mask(access_flags(barrier.dst_access))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(registered_buffers.get(&barrier.buffer).copied().unwrap_or(vk::Buffer::null()))
                    .size(barrier.size)
                    .build()
            })
            .collect();
        let registered_images = self.images.lock();
        let image_barriers: Vec<vk::ImageMemoryBarrier> = images
            .iter()
            .map(|barrier| {
                let registered = registered_images.get(&barrier.image);
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(access_flags(barrier.src_access))
                    .dst_access_mask(access_flags(barrier.dst_access))
                    .old_layout(image_layout(barrier.old_layout))
                    .new_layout(image_layout(barrier.new_layout))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(registered.map(|r| r.image).unwrap_or(vk::Image::null()))
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: registered.map(|r| r.aspect).unwrap_or(vk::ImageAspectFlags::COLOR),
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .build()
            })
            .collect();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer(cmd),
                stage_flags(src_stage),
                stage_flags(dst_stage),
                vk::DependencyFlags::empty(),
                &memory_barriers,
                &buffer_barriers,
                &image_barriers,
            );
        }
    }

    fn cmd_begin_rendering(&self, cmd: CommandBufferId, info: &RenderingInfo) {
        let registered_images = self.images.lock();
        let view = |id: ImageId| {
            registered_images.get(&id).map(|r| r.view).unwrap_or(vk::ImageView::null())
        };
        let color_attachments: Vec<vk::RenderingAttachmentInfo> = info
            .color_attachments
            .iter()
            .map(|attachment| {
                vk::RenderingAttachmentInfo::builder()
                    .image_view(view(attachment.image))
                    .image_layout(image_layout(attachment.layout))
                    .load_op(if attachment.clear {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: [0.0; 4] },
                    })
                    .build()
            })
            .collect();
        let depth_attachment = info.depth_attachment.as_ref().map(|attachment| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(view(attachment.image))
                .image_layout(image_layout(attachment.layout))
                .load_op(if attachment.clear {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                })
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                })
                .build()
        });
        let mut rendering = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: info.area.width,
                    height: info.area.height,
                },
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(ref depth) = depth_attachment {
            rendering = rendering.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(self.command_buffer(cmd), &rendering) };
    }

    fn cmd_end_rendering(&self, cmd: CommandBufferId) {
        unsafe { self.device.cmd_end_rendering(self.command_buffer(cmd)) };
    }

    fn submit(&self, batch: SubmitBatch) -> Result<(), Error> {
        let command_buffers: Vec<vk::CommandBuffer> =
            batch.command_buffers.iter().map(|&id| self.command_buffer(id)).collect();
        let wait_semaphores: Vec<vk::Semaphore> =
            batch.waits.iter().map(|&(id, _)| self.semaphore(id)).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            batch.waits.iter().map(|&(_, stage)| stage_flags(stage)).collect();
        let mut signal_semaphores: Vec<vk::Semaphore> =
            batch.signals.iter().map(|&id| self.semaphore(id)).collect();

        // Binary semaphores take a zero placeholder in the timeline value
        // array.
        let mut signal_values = vec![0u64; signal_semaphores.len()];
        let mut timeline_info;
        let mut info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
        if let Some((timeline, value)) = batch.timeline_signal {
            signal_semaphores.push(self.semaphore(timeline));
            signal_values.push(value);
            timeline_info = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
            info = info.push_next(&mut timeline_info);
        }
        info = info.signal_semaphores(&signal_semaphores);

        let queue = self.queue_slot(batch.queue).queue.lock();
        unsafe { self.device.queue_submit(*queue, &[info.build()], vk::Fence::null())? };
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), Error> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn supports_timestamps(&self, queue: QueueKind) -> bool {
        self.queue_slot(queue).timestamps
    }

    fn timestamp_period(&self) -> f64 {
        self.timestamp_period
    }

    fn create_timestamp_pool(&self, capacity: u32) -> Result<(), Error> {
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(capacity);
        let pool = unsafe { self.device.create_query_pool(&info, None)? };
        *self.query_pool.lock() = Some((pool, capacity));
        Ok(())
    }

    fn reset_timestamp_pool(&self) {
        if let Some((pool, capacity)) = *self.query_pool.lock() {
            unsafe { self.device.reset_query_pool(pool, 0, capacity) };
        }
    }

    fn cmd_write_timestamp(&self, cmd: CommandBufferId, stage: StageFlags, slot: u32) {
        if let Some((pool, _)) = *self.query_pool.lock() {
            unsafe {
                self.device.cmd_write_timestamp(self.command_buffer(cmd), stage_flags(stage), pool, slot);
            }
        }
    }

    fn read_timestamps(&self, count: u32) -> Result<Vec<u64>, Error> {
        let Some((pool, _)) = *self.query_pool.lock() else {
            return Ok(Vec::new());
        };
        let mut data = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                pool,
                0,
                count,
                &mut data,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }
        Ok(data)
    }
}
