//! Mock device, surface and resources for driving a graph without a GPU.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use trellis::{
    BufferBarrier, BufferId, BufferResource, CommandBufferId, DeviceBackend, Error, ImageBarrier, ImageId,
    ImageLayout, ImageResource, MemoryBarrier, QueueKind, RenderingInfo, SemaphoreId, Size2D, StageFlags,
    SubmitBatch, SurfaceProvider, SurfaceStatus, UnitOfWork,
};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

static LOGGING: std::sync::Once = std::sync::Once::new();

/// Installs the log sink once per test binary; filter with `RUST_LOG`.
pub fn install_logging() {
    LOGGING.call_once(|| {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// One recorded command, enough detail for the scenarios to assert on.
#[derive(Debug)]
pub enum Command {
    Barrier {
        src_stage: StageFlags,
        dst_stage: StageFlags,
        memory: usize,
        buffers: usize,
        images: usize,
    },
    BeginRendering {
        colors: usize,
        has_depth: bool,
    },
    EndRendering,
    Timestamp {
        slot: u32,
    },
}

#[derive(Default)]
pub struct DeviceState {
    pub submissions: Vec<SubmitBatch>,
    pub timeline_waits: Vec<(SemaphoreId, u64)>,
    pub commands: HashMap<CommandBufferId, Vec<Command>>,
    pub open: HashSet<CommandBufferId>,
    pub queues: HashMap<CommandBufferId, QueueKind>,
    pub timestamp_values: Vec<u64>,
    pub timestamp_capacity: u32,
    pub tick: u64,
    pub idle_waits: u64,
}

/// A [`DeviceBackend`] that records everything and invents timestamp values.
///
/// Timestamp ticks are assigned when a batch is submitted, walking its
/// command buffers in submission order, so producer spans always end before
/// the spans of the consumers scheduled after them.
pub struct MockDevice {
    next_id: AtomicU64,
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Arc<MockDevice> {
        Arc::new(MockDevice {
            next_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(DeviceState::default())),
        })
    }

    pub fn state(&self) -> Arc<Mutex<DeviceState>> {
        self.state.clone()
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, cmd: CommandBufferId, command: Command) {
        let mut state = self.state.lock();
        assert!(state.open.contains(&cmd), "recording into a command buffer that is not open");
        state.commands.entry(cmd).or_default().push(command);
    }
}

impl DeviceBackend for MockDevice {
    fn create_binary_semaphore(&self) -> Result<SemaphoreId, Error> {
        Ok(SemaphoreId(self.fresh_id()))
    }

    fn create_timeline_semaphore(&self) -> Result<SemaphoreId, Error> {
        Ok(SemaphoreId(self.fresh_id()))
    }

    fn wait_timeline(&self, semaphore: SemaphoreId, value: u64) -> Result<(), Error> {
        self.state.lock().timeline_waits.push((semaphore, value));
        Ok(())
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferId, Error> {
        let id = CommandBufferId(self.fresh_id());
        let mut state = self.state.lock();
        state.commands.insert(id, Vec::new());
        state.queues.insert(id, queue);
        Ok(id)
    }

    fn begin_commands(&self, cmd: CommandBufferId) -> Result<(), Error> {
        let mut state = self.state.lock();
        assert!(state.open.insert(cmd), "command buffer begun twice");
        state.commands.insert(cmd, Vec::new());
        Ok(())
    }

    fn end_commands(&self, cmd: CommandBufferId) -> Result<(), Error> {
        let mut state = self.state.lock();
        assert!(state.open.remove(&cmd), "command buffer ended while not open");
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
        self.record(
            cmd,
            Command::Barrier {
                src_stage,
                dst_stage,
                memory: memory.len(),
                buffers: buffers.len(),
                images: images.len(),
            },
        );
    }

    fn cmd_begin_rendering(&self, cmd: CommandBufferId, info: &RenderingInfo) {
        self.record(
            cmd,
            Command::BeginRendering {
                colors: info.color_attachments.len(),
                has_depth: info.depth_attachment.is_some(),
            },
        );
    }

    fn cmd_end_rendering(&self, cmd: CommandBufferId) {
        self.record(cmd, Command::EndRendering);
    }

    fn submit(&self, batch: SubmitBatch) -> Result<(), Error> {
        let mut state = self.state.lock();
        for cmd in &batch.command_buffers {
            assert!(!state.open.contains(cmd), "submitted command buffer is still open");
            let slots: Vec<u32> = state.commands[cmd]
                .iter()
                .filter_map(|command| match command {
                    Command::Timestamp { slot } => Some(*slot),
                    _ => None,
                })
                .collect();
            for slot in slots {
                state.tick += 1;
                let tick = state.tick;
                state.timestamp_values[slot as usize] = tick;
            }
        }
        state.submissions.push(batch);
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), Error> {
        self.state.lock().idle_waits += 1;
        Ok(())
    }

    fn supports_timestamps(&self, _queue: QueueKind) -> bool {
        true
    }

    fn timestamp_period(&self) -> f64 {
        1.0
    }

    fn create_timestamp_pool(&self, capacity: u32) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.timestamp_capacity = capacity;
        state.timestamp_values = vec![0; capacity as usize];
        Ok(())
    }

    fn reset_timestamp_pool(&self) {
        let mut state = self.state.lock();
        let capacity = state.timestamp_capacity as usize;
        state.timestamp_values = vec![0; capacity];
    }

    fn cmd_write_timestamp(&self, cmd: CommandBufferId, _stage: StageFlags, slot: u32) {
        self.record(cmd, Command::Timestamp { slot });
    }

    fn read_timestamps(&self, count: u32) -> Result<Vec<u64>, Error> {
        Ok(self.state.lock().timestamp_values[..count as usize].to_vec())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct MockImage {
    id: ImageId,
    size: Mutex<Size2D>,
    layout: Mutex<ImageLayout>,
}

impl MockImage {
    pub fn new(size: Size2D) -> Arc<MockImage> {
        Arc::new(MockImage {
            id: ImageId(fresh_resource_id()),
            size: Mutex::new(size),
            layout: Mutex::new(ImageLayout::Undefined),
        })
    }
}

impl ImageResource for MockImage {
    fn id(&self) -> ImageId {
        self.id
    }

    fn size(&self) -> Size2D {
        *self.size.lock()
    }

    fn layout(&self) -> ImageLayout {
        *self.layout.lock()
    }

    fn set_layout(&self, layout: ImageLayout) {
        *self.layout.lock() = layout;
    }

    fn recreate(&self, size: Size2D, _cmd: CommandBufferId, _device: &dyn DeviceBackend) -> Result<(), Error> {
        *self.size.lock() = size;
        *self.layout.lock() = ImageLayout::Undefined;
        Ok(())
    }
}

pub struct MockBuffer {
    id: BufferId,
    size: u64,
}

impl MockBuffer {
    pub fn new(size: u64) -> Arc<MockBuffer> {
        Arc::new(MockBuffer {
            id: BufferId(fresh_resource_id()),
            size,
        })
    }
}

impl BufferResource for MockBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn byte_size(&self) -> u64 {
        self.size
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct SurfaceState {
    pub images: Vec<Arc<MockImage>>,
    pub size: Size2D,
    pub current: u32,
    pub acquired: Vec<SemaphoreId>,
    pub presented: Vec<(SemaphoreId, u32)>,
    pub stale_on_next_acquire: bool,
    pub next_image_count: Option<usize>,
    pub recreations: u64,
}

/// A presentation surface cycling through its images on acquisition. Tests
/// flip `stale_on_next_acquire` or change `size`/`next_image_count` through
/// the shared state to drive the reset path.
pub struct MockSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl MockSurface {
    pub fn new(image_count: usize, size: Size2D) -> (MockSurface, Arc<Mutex<SurfaceState>>) {
        let state = Arc::new(Mutex::new(SurfaceState {
            images: (0..image_count).map(|_| MockImage::new(size)).collect(),
            size,
            current: 0,
            acquired: Vec::new(),
            presented: Vec::new(),
            stale_on_next_acquire: false,
            next_image_count: None,
            recreations: 0,
        }));
        (MockSurface { state: state.clone() }, state)
    }
}

impl SurfaceProvider for MockSurface {
    fn acquire_next(&mut self, semaphore: SemaphoreId) -> Result<SurfaceStatus, Error> {
        let mut state = self.state.lock();
        if state.stale_on_next_acquire {
            state.stale_on_next_acquire = false;
            return Ok(SurfaceStatus::Stale);
        }
        let count = state.images.len() as u32;
        state.current = (state.acquired.len() as u32) % count;
        state.acquired.push(semaphore);
        Ok(SurfaceStatus::Ready)
    }

    fn present(&mut self, wait: SemaphoreId, index: u32) -> Result<SurfaceStatus, Error> {
        self.state.lock().presented.push((wait, index));
        Ok(SurfaceStatus::Ready)
    }

    fn current_index(&self) -> u32 {
        self.state.lock().current
    }

    fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    fn images(&self) -> Vec<Arc<dyn ImageResource>> {
        self.state.lock().images.iter().map(|image| image.clone() as Arc<dyn ImageResource>).collect()
    }

    fn recreate(&mut self) -> Result<Vec<Arc<dyn ImageResource>>, Error> {
        let mut state = self.state.lock();
        let size = state.size;
        let count = state.next_image_count.take().unwrap_or(state.images.len());
        let fresh: Vec<Arc<MockImage>> = (0..count).map(|_| MockImage::new(size)).collect();
        let old = std::mem::replace(&mut state.images, fresh);
        state.recreations += 1;
        state.current = 0;
        state.acquired.clear();
        Ok(old.into_iter().map(|image| image as Arc<dyn ImageResource>).collect())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
pub struct CountingUnit {
    pub updates: AtomicU64,
    pub draws: AtomicU64,
    pub resets: AtomicU64,
}

impl CountingUnit {
    pub fn new() -> Arc<CountingUnit> {
        Arc::new(CountingUnit::default())
    }

    pub fn draw_count(&self) -> u64 {
        self.draws.load(Ordering::Relaxed)
    }
}

impl UnitOfWork for CountingUnit {
    fn update(&self, _frame: usize, _cmd: CommandBufferId, _device: &dyn DeviceBackend) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn draw(&self, _frame: usize, _cmd: CommandBufferId, _device: &dyn DeviceBackend) {
        self.draws.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self, _surface_images: &[Arc<dyn ImageResource>], _cmd: CommandBufferId, _device: &dyn DeviceBackend) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }
}
