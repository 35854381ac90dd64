//! Frame graph scheduling, synchronization and submission for explicit
//! graphics APIs.
//!
//! Resources are registered under names, passes declare what they read and
//! write by name, and [`FrameGraph::calculate`] resolves the declarations
//! into an execution order with the semaphores and barriers it implies.
//! After that, [`FrameGraph::render`] records and submits one frame per
//! call, throttled on a timeline semaphore so that at most a configured
//! number of frames is in flight.
//!
//! The graph talks to the GPU through the [`DeviceBackend`] and
//! [`SurfaceProvider`] traits; [`VulkanBackend`] implements the former over
//! an [`ash`] device.

pub use ash::{self, vk};

pub use backend::*;
pub use error::Error;
pub use graph::FrameGraph;
pub use pass::{ComputePassData, Pass, PassData, PassId, RenderPassData, SemaphoreIndex};
pub use profiler::TimeSpan;
pub use registry::{BufferSet, FrameContext, FrameSelector, ImageSet, ResourceRegistry};
pub use vulkan::{QueueSetup, VulkanBackend};

mod backend;
mod error;
mod graph;
mod pass;
mod profiler;
mod registry;
mod vulkan;
