//! Dependency resolution: pass ordering and semaphore insertion.
use std::collections::VecDeque;

use slotmap::SlotMap;
use tracing::debug;

use crate::{
    error::Error,
    graph::FrameGraph,
    pass::{Pass, PassId, SemaphoreIndex},
};

/// One entry per scheduled pass, in execution order.
#[derive(Clone)]
pub(crate) struct PassRecord {
    /// Whether this pass runs on a different queue than the one before it.
    /// The first pass of the frame counts as a queue change so that it
    /// always opens a fresh submission batch.
    pub queue_changed: bool,
    /// The pass scheduled immediately before this one, if any.
    pub predecessor: Option<PassId>,
}

/// The outcome of [`FrameGraph::calculate`]: a producers-before-consumers
/// ordering plus per-pass batching hints.
#[derive(Clone, Default)]
pub(crate) struct Schedule {
    pub order: Vec<PassId>,
    pub records: Vec<PassRecord>,
}

impl FrameGraph {
    /// Resolves the registered passes into an execution order and inserts
    /// the synchronization the order requires.
    ///
    /// The last registered pass is taken as the frame's root: everything it
    /// transitively consumes is scheduled before it, each pass exactly once,
    /// and passes nothing reaches from the root stay out of the frame.
    /// Inputs with no registered producer are treated as externally written.
    /// Three kinds of semaphores are attached here:
    ///
    /// - a binary semaphore per frame in flight wherever two adjacent
    ///   scheduled passes land on different queues,
    /// - the image-available wait on the first scheduled pass touching the
    ///   presentation resource,
    /// - the per-image render-finished signal on the root, which the
    ///   presentation engine waits on.
    ///
    /// Call this once, after all passes and resources are registered.
    pub fn calculate(&mut self) -> Result<(), Error> {
        let mut order = VecDeque::with_capacity(self.registration_order.len());
        let mut pool = self.registration_order.clone();
        if let Some(&root) = self.registration_order.last() {
            visit(&self.passes, root, &mut pool, &mut order);
        }
        let order: Vec<PassId> = order.into();

        let surface_name = {
            let surface_images = self.surface.images();
            self.registry.find_images(&surface_images).map(str::to_owned)
        };
        // Acquisition gates only the first pass that touches the presentable
        // image; everything downstream is ordered behind it already.
        let mut wait_for_surface = surface_name.is_some();

        let mut records = Vec::with_capacity(order.len());
        for (position, &id) in order.iter().enumerate() {
            let predecessor = position.checked_sub(1).map(|prev| order[prev]);
            let queue_changed = match predecessor {
                Some(prev) => self.passes[prev].queue_kind() != self.passes[id].queue_kind(),
                None => true,
            };

            if let Some(prev) = predecessor {
                if queue_changed {
                    let pool = (0..self.frames_in_flight)
                        .map(|_| self.device.create_binary_semaphore())
                        .collect::<Result<Vec<_>, _>>()?;
                    debug!(
                        producer = self.passes[prev].name(),
                        consumer = self.passes[id].name(),
                        "inserting cross-queue semaphore"
                    );
                    self.passes[prev].add_signal_semaphore(pool.clone(), SemaphoreIndex::FrameInFlight);
                    self.passes[id].add_wait_semaphore(pool, SemaphoreIndex::FrameInFlight);
                }
            }

            if wait_for_surface {
                let surface = surface_name.as_deref().unwrap_or_default();
                if self.passes[id].presentation_candidates().iter().any(|&c| c == surface) {
                    debug!(pass = self.passes[id].name(), "waiting for image acquisition");
                    self.passes[id].add_wait_semaphore(self.image_available.clone(), SemaphoreIndex::FrameInFlight);
                    wait_for_surface = false;
                }
            }

            records.push(PassRecord { queue_changed, predecessor });
        }

        if let Some(&root) = order.last() {
            self.passes[root].add_signal_semaphore(self.render_finished.clone(), SemaphoreIndex::PresentableImage);
        }

        self.schedule = Some(Schedule { order, records });
        Ok(())
    }
}

/// Walks producers from `id`, prepending each reached pass so producers end
/// up in front of their consumers. Every pass is pulled out of `pool` when
/// placed, which both bounds the walk and keeps shared producers from
/// appearing twice.
fn visit(passes: &SlotMap<PassId, Pass>, id: PassId, pool: &mut Vec<PassId>, order: &mut VecDeque<PassId>) {
    pool.retain(|&candidate| candidate != id);
    order.push_front(id);

    for input in passes[id].dependency_inputs() {
        match producer_of(passes, pool, input) {
            Some(producer) => visit(passes, producer, pool, order),
            None => debug!(pass = passes[id].name(), input, "no pending producer"),
        }
    }
}

/// The most recently registered pass still in `pool` that writes `input`.
fn producer_of(passes: &SlotMap<PassId, Pass>, pool: &[PassId], input: &str) -> Option<PassId> {
    pool.iter().rev().copied().find(|&id| passes[id].declares_output(input))
}
