use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no resource registered under name `{name}`")]
    ResourceNotFound { name: String },
    #[error("pass `{name}` is not of the expected kind")]
    PassKindMismatch { name: String },
    #[error("render pass `{name}` declares no color or depth targets")]
    NoRenderTargets { name: String },
    #[error("the graph must be calculated before rendering")]
    NotCalculated,
    #[error("queue family does not support timestamp queries")]
    UnsupportedQueue,
    #[error("timestamp capacity exceeded: requested {requested}, capacity {capacity}")]
    TimestampCapacity { requested: u32, capacity: u32 },
    #[error("failed to build worker pool")]
    Workers(#[from] rayon::ThreadPoolBuildError),
    #[error("device error: {0}")]
    Device(String),
    #[error("Vulkan error")]
    Vulkan(#[from] vk::Result),
}
