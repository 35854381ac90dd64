//! Named resource registry.
//!
//! Passes never hold resources directly: they refer to them by name, and the
//! registry resolves the name to the concrete per-frame instance at execution
//! time. This indirection is what lets a reset swap the presentable images
//! without touching any pass.
use std::sync::Arc;

use fxhash::FxHashMap;
use tracing::debug;

use crate::{
    backend::{change_layout, AccessFlags, BufferResource, CommandBufferId, DeviceBackend, ImageLayout, ImageResource},
    error::Error,
};

/// Selects which element of a per-frame resource array is active, resolved
/// against a [`FrameContext`] at submission time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameSelector {
    /// One element per frame in flight, indexed by the frame-in-flight slot.
    FrameInFlight,
    /// One element per presentable image, indexed by the acquired image.
    PresentableImage,
    /// A single shared element.
    Fixed(usize),
}

/// Per-frame indices valid for the duration of one `render` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameContext {
    pub frame_in_flight: usize,
    pub presentable_image: usize,
}

impl FrameSelector {
    pub fn resolve(&self, ctx: &FrameContext) -> usize {
        match *self {
            FrameSelector::FrameInFlight => ctx.frame_in_flight,
            FrameSelector::PresentableImage => ctx.presentable_image,
            FrameSelector::Fixed(index) => index,
        }
    }
}

/// A named array of images plus the selector that picks the active element.
pub struct ImageSet {
    images: Vec<Arc<dyn ImageResource>>,
    selector: FrameSelector,
}

impl ImageSet {
    pub fn new(images: Vec<Arc<dyn ImageResource>>, selector: FrameSelector) -> ImageSet {
        ImageSet { images, selector }
    }

    pub fn images(&self) -> &[Arc<dyn ImageResource>] {
        &self.images
    }

    pub fn selector(&self) -> FrameSelector {
        self.selector
    }

    /// The element active under `ctx`.
    pub fn current(&self, ctx: &FrameContext) -> &Arc<dyn ImageResource> {
        &self.images[self.selector.resolve(ctx)]
    }

    /// Whether this set holds exactly the given instances, by identity.
    pub fn contains(&self, candidates: &[Arc<dyn ImageResource>]) -> bool {
        !candidates.is_empty()
            && candidates
                .iter()
                .all(|c| self.images.iter().any(|i| Arc::ptr_eq(i, c)))
    }

    fn replace(&mut self, images: Vec<Arc<dyn ImageResource>>) {
        self.images = images;
    }
}

/// A named array of buffers, one per frame in flight.
pub struct BufferSet {
    buffers: Vec<Arc<dyn BufferResource>>,
}

impl BufferSet {
    pub fn new(buffers: Vec<Arc<dyn BufferResource>>) -> BufferSet {
        BufferSet { buffers }
    }

    pub fn buffers(&self) -> &[Arc<dyn BufferResource>] {
        &self.buffers
    }

    pub fn current(&self, ctx: &FrameContext) -> &Arc<dyn BufferResource> {
        &self.buffers[ctx.frame_in_flight]
    }
}

/// Owns every named resource of a graph.
#[derive(Default)]
pub struct ResourceRegistry {
    images: FxHashMap<String, ImageSet>,
    buffers: FxHashMap<String, BufferSet>,
}

impl ResourceRegistry {
    pub fn new() -> ResourceRegistry {
        ResourceRegistry::default()
    }

    /// Registers an image set under `name`, replacing any previous binding.
    /// Last write wins so that re-registration after a reset is seamless.
    pub fn add_images(&mut self, name: impl Into<String>, set: ImageSet) {
        self.images.insert(name.into(), set);
    }

    /// Registers a buffer set under `name`, replacing any previous binding.
    pub fn add_buffers(&mut self, name: impl Into<String>, set: BufferSet) {
        self.buffers.insert(name.into(), set);
    }

    pub fn images(&self, name: &str) -> Result<&ImageSet, Error> {
        self.images.get(name).ok_or_else(|| Error::ResourceNotFound {
            name: name.to_owned(),
        })
    }

    pub fn buffers(&self, name: &str) -> Result<&BufferSet, Error> {
        self.buffers.get(name).ok_or_else(|| Error::ResourceNotFound {
            name: name.to_owned(),
        })
    }

    /// Reverse lookup: the name under which exactly these instances are
    /// registered, if any.
    pub fn find_images(&self, candidates: &[Arc<dyn ImageResource>]) -> Option<&str> {
        self.images
            .iter()
            .find(|(_, set)| set.contains(candidates))
            .map(|(name, _)| name.as_str())
    }

    /// Propagates a presentation-surface swap through the registry: rebinds
    /// the set holding `old_surface` to `new_surface`, then recreates every
    /// other image whose size no longer matches and transitions it back to
    /// the general layout.
    pub fn reset(
        &mut self,
        old_surface: &[Arc<dyn ImageResource>],
        new_surface: Vec<Arc<dyn ImageResource>>,
        cmd: CommandBufferId,
        device: &dyn DeviceBackend,
    ) -> Result<(), Error> {
        let Some(size) = new_surface.first().map(|image| image.size()) else {
            return Ok(());
        };

        let surface_name = self.find_images(old_surface).map(str::to_owned);
        if let Some(ref name) = surface_name {
            debug!(name, width = size.width, height = size.height, "rebinding presentation resource");
            self.images
                .get_mut(name)
                .expect("the found name is present")
                .replace(new_surface);
        }

        for (name, set) in &self.images {
            if surface_name.as_deref() == Some(name.as_str()) {
                continue;
            }
            for image in set.images() {
                if image.size() != size {
                    debug!(name, "recreating image at new surface size");
                    image.recreate(size, cmd, device)?;
                    change_layout(
                        image.as_ref(),
                        ImageLayout::General,
                        AccessFlags::empty(),
                        AccessFlags::empty(),
                        cmd,
                        device,
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ImageId, Size2D};
    use parking_lot::Mutex;

    struct DummyImage {
        id: ImageId,
        size: Mutex<Size2D>,
        layout: Mutex<ImageLayout>,
    }

    impl DummyImage {
        fn new(id: u64, width: u32, height: u32) -> Arc<DummyImage> {
            Arc::new(DummyImage {
                id: ImageId(id),
                size: Mutex::new(Size2D { width, height }),
                layout: Mutex::new(ImageLayout::Undefined),
            })
        }
    }

    impl ImageResource for DummyImage {
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

    #[test]
    fn last_write_wins() {
        let mut registry = ResourceRegistry::new();
        let first = DummyImage::new(1, 8, 8);
        let second = DummyImage::new(2, 16, 16);
        registry.add_images("Target", ImageSet::new(vec![first], FrameSelector::FrameInFlight));
        registry.add_images(
            "Target",
            ImageSet::new(vec![second.clone()], FrameSelector::FrameInFlight),
        );
        let set = registry.images("Target").unwrap();
        assert_eq!(set.images().len(), 1);
        assert!(Arc::ptr_eq(&set.images()[0], &(second as Arc<dyn ImageResource>)));
    }

    #[test]
    fn missing_name_is_an_error() {
        let registry = ResourceRegistry::new();
        assert!(matches!(
            registry.images("Nope"),
            Err(Error::ResourceNotFound { .. })
        ));
    }

    #[test]
    fn reverse_lookup_by_identity() {
        let mut registry = ResourceRegistry::new();
        let a = DummyImage::new(1, 8, 8) as Arc<dyn ImageResource>;
        let b = DummyImage::new(2, 8, 8) as Arc<dyn ImageResource>;
        registry.add_images(
            "Swapchain",
            ImageSet::new(vec![a.clone(), b.clone()], FrameSelector::PresentableImage),
        );
        assert_eq!(registry.find_images(&[a.clone(), b.clone()]), Some("Swapchain"));
        let other = DummyImage::new(3, 8, 8) as Arc<dyn ImageResource>;
        assert_eq!(registry.find_images(&[other]), None);
        assert_eq!(registry.find_images(&[]), None);
    }

    #[test]
    fn selector_resolution() {
        let ctx = FrameContext {
            frame_in_flight: 1,
            presentable_image: 2,
        };
        assert_eq!(FrameSelector::FrameInFlight.resolve(&ctx), 1);
        assert_eq!(FrameSelector::PresentableImage.resolve(&ctx), 2);
        assert_eq!(FrameSelector::Fixed(0).resolve(&ctx), 0);
    }
}
