//! Surface loss and rebuild: stale acquisition, resource resizing and the
//! deferred transition submission.
mod common;

use std::sync::{atomic::Ordering, Arc};

use common::{CountingUnit, MockDevice, MockImage, MockSurface};
use trellis::{FrameGraph, FrameSelector, ImageResource, ImageSet, Size2D, SurfaceStatus};

const SURFACE_SIZE: Size2D = Size2D { width: 800, height: 600 };

#[test]
fn stale_surface_skips_the_frame_and_reset_rebuilds_it() {
    common::install_logging();
    let device = MockDevice::new();
    let (surface, surface_state) = MockSurface::new(2, SURFACE_SIZE);
    let mut graph = FrameGraph::new(device.clone(), Box::new(surface), 2, 1).unwrap();

    let swapchain: Vec<Arc<dyn ImageResource>> = surface_state
        .lock()
        .images
        .iter()
        .map(|image| image.clone() as Arc<dyn ImageResource>)
        .collect();
    graph
        .registry_mut()
        .add_images("Swapchain", ImageSet::new(swapchain, FrameSelector::PresentableImage));
    let targets: Vec<Arc<MockImage>> = (0..2).map(|_| MockImage::new(SURFACE_SIZE)).collect();
    graph.registry_mut().add_images(
        "Target",
        ImageSet::new(
            targets.iter().map(|image| image.clone() as Arc<dyn ImageResource>).collect(),
            FrameSelector::FrameInFlight,
        ),
    );

    let unit = CountingUnit::new();
    let scene = graph.create_render_pass("Scene").unwrap();
    graph.add_color_target(scene, "Target").unwrap();
    graph.register_unit(scene, unit.clone());
    let blit = graph.create_render_pass("Blit").unwrap();
    graph.add_texture_input(blit, "Target").unwrap();
    graph.add_color_target(blit, "Swapchain").unwrap();
    graph.register_unit(blit, unit.clone());

    graph.calculate().unwrap();
    assert_eq!(graph.execution_order(), vec!["Scene", "Blit"]);

    assert!(matches!(graph.render().unwrap(), SurfaceStatus::Ready));
    assert_eq!(unit.draw_count(), 2);
    assert_eq!(graph.frame_in_flight(), 1);

    // A stale acquisition skips the frame entirely: no submission, no
    // counter movement.
    surface_state.lock().stale_on_next_acquire = true;
    let submissions_before = device.state().lock().submissions.len();
    assert!(matches!(graph.render().unwrap(), SurfaceStatus::Stale));
    assert_eq!(device.state().lock().submissions.len(), submissions_before);
    assert_eq!(unit.draw_count(), 2);
    assert_eq!(graph.frame_in_flight(), 1);

    // The window grew; rebuild the surface and everything sized after it.
    let new_size = Size2D { width: 1024, height: 768 };
    surface_state.lock().size = new_size;
    graph.reset().unwrap();

    assert_eq!(device.state().lock().idle_waits, 1);
    assert_eq!(surface_state.lock().recreations, 1);
    for target in &targets {
        assert_eq!(target.size(), new_size);
    }
    // Both scheduled passes let their units refresh per-image state.
    assert_eq!(unit.resets.load(Ordering::Relaxed), 2);

    // The next frame submits the recorded transitions first, as a bare
    // batch, then the frame itself. Counters keep running.
    assert!(matches!(graph.render().unwrap(), SurfaceStatus::Ready));
    let state = device.state();
    let state = state.lock();
    assert_eq!(state.submissions.len(), submissions_before + 2);
    let transitions = &state.submissions[submissions_before];
    assert_eq!(transitions.command_buffers.len(), 1);
    assert!(transitions.waits.is_empty());
    assert!(transitions.signals.is_empty());
    assert!(transitions.timeline_signal.is_none());
    assert_eq!(
        state.submissions[submissions_before + 1].timeline_signal.map(|(_, value)| value),
        Some(2)
    );
    drop(state);
    assert_eq!(unit.draw_count(), 4);
    assert_eq!(graph.frame_in_flight(), 0);

    // The rebuilt presentable images flow through the registry.
    let rebuilt = surface_state.lock().images[0].clone();
    let ctx = graph.frame_context();
    let bound = graph.registry().images("Swapchain").unwrap().current(&ctx).clone();
    assert_eq!(bound.id(), rebuilt.id());
}

#[test]
fn surface_image_count_change_reissues_the_presentation_semaphores() {
    common::install_logging();
    let device = MockDevice::new();
    let (surface, surface_state) = MockSurface::new(2, SURFACE_SIZE);
    let mut graph = FrameGraph::new(device.clone(), Box::new(surface), 2, 1).unwrap();

    let swapchain: Vec<Arc<dyn ImageResource>> = surface_state
        .lock()
        .images
        .iter()
        .map(|image| image.clone() as Arc<dyn ImageResource>)
        .collect();
    graph
        .registry_mut()
        .add_images("Swapchain", ImageSet::new(swapchain, FrameSelector::PresentableImage));

    let composite = graph.create_render_pass("Composite").unwrap();
    graph.add_color_target(composite, "Swapchain").unwrap();
    graph.register_unit(composite, CountingUnit::new());
    graph.calculate().unwrap();

    assert!(matches!(graph.render().unwrap(), SurfaceStatus::Ready));
    let before = surface_state.lock().presented[0].0;

    // The engine came back with one more image, so the per-image
    // presentation semaphores have to be reissued to cover it.
    surface_state.lock().next_image_count = Some(3);
    graph.reset().unwrap();
    assert_eq!(surface_state.lock().images.len(), 3);

    for _ in 0..3 {
        assert!(matches!(graph.render().unwrap(), SurfaceStatus::Ready));
    }
    let presented = surface_state.lock().presented.clone();
    let indices: Vec<u32> = presented[1..].iter().map(|&(_, index)| index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    // Every post-reset frame presents on a semaphore from the fresh pool,
    // and the root pass signals that same semaphore.
    let state = device.state();
    let state = state.lock();
    assert_eq!(state.submissions.len(), 5);
    for (batch, &(semaphore, _)) in state.submissions[2..].iter().zip(&presented[1..]) {
        assert_eq!(batch.signals, vec![semaphore]);
        assert_ne!(semaphore, before);
    }
    // Frame counters run straight through the rebuild.
    assert_eq!(state.submissions[4].timeline_signal.map(|(_, value)| value), Some(4));
}
