//! GPU timing via timestamp queries, two per pass and frame.
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    backend::{CommandBufferId, DeviceBackend, QueueKind, StageFlags},
    error::Error,
};

/// A measured GPU span in nanoseconds, relative to the device's timestamp
/// origin.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeSpan {
    pub start: f64,
    pub end: f64,
}

impl TimeSpan {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Default)]
struct FrameQueries {
    /// Pass name and the first of its two query slots, in push order.
    entries: Vec<(String, u32)>,
    next_slot: u32,
}

/// Collects per-pass GPU timestamps.
///
/// `push` and `pop` are called from recording workers and only touch the
/// query bookkeeping; `fetch` runs on the submission thread after the frame
/// is handed to the device. Results lag by the frames currently in flight,
/// which is fine for profiling.
pub(crate) struct Profiler {
    capacity: u32,
    queries: Mutex<FrameQueries>,
    results: Mutex<HashMap<String, TimeSpan>>,
}

impl Profiler {
    /// Reserves `capacity` query slots. Timestamps must be supported on
    /// every queue the graph submits to, otherwise spans would silently
    /// miss compute passes.
    pub fn new(device: &dyn DeviceBackend, capacity: u32) -> Result<Profiler, Error> {
        if !device.supports_timestamps(QueueKind::Graphics) || !device.supports_timestamps(QueueKind::Compute) {
            return Err(Error::UnsupportedQueue);
        }
        device.create_timestamp_pool(capacity)?;
        Ok(Profiler {
            capacity,
            queries: Mutex::new(FrameQueries::default()),
            results: Mutex::new(HashMap::new()),
        })
    }

    /// Invalidates all slots for a new frame.
    pub fn begin_frame(&self, device: &dyn DeviceBackend) {
        device.reset_timestamp_pool();
        let mut queries = self.queries.lock();
        queries.entries.clear();
        queries.next_slot = 0;
    }

    /// Writes the opening timestamp of `name` into `cmd`.
    pub fn push(&self, name: &str, cmd: CommandBufferId, device: &dyn DeviceBackend) -> Result<(), Error> {
        let slot = {
            let mut queries = self.queries.lock();
            if queries.next_slot + 2 > self.capacity {
                return Err(Error::TimestampCapacity {
                    requested: queries.next_slot + 2,
                    capacity: self.capacity,
                });
            }
            let slot = queries.next_slot;
            queries.next_slot += 2;
            queries.entries.push((name.to_owned(), slot));
            slot
        };
        device.cmd_write_timestamp(cmd, StageFlags::TOP_OF_PIPE, slot);
        Ok(())
    }

    /// Writes the closing timestamp of `name` into `cmd`. Must follow a
    /// matching `push` in the same frame.
    pub fn pop(&self, name: &str, cmd: CommandBufferId, device: &dyn DeviceBackend) {
        let slot = self
            .queries
            .lock()
            .entries
            .iter()
            .rev()
            .find(|(entry, _)| entry == name)
            .map(|&(_, slot)| slot);
        if let Some(slot) = slot {
            device.cmd_write_timestamp(cmd, StageFlags::BOTTOM_OF_PIPE, slot + 1);
        }
    }

    /// Reads back every slot written this frame and converts the raw ticks
    /// into nanosecond spans.
    pub fn fetch(&self, device: &dyn DeviceBackend) -> Result<(), Error> {
        let (entries, count) = {
            let queries = self.queries.lock();
            (queries.entries.clone(), queries.next_slot)
        };
        if count == 0 {
            return Ok(());
        }
        let ticks = device.read_timestamps(count)?;
        let period = device.timestamp_period();
        let mut results = self.results.lock();
        for (name, slot) in entries {
            let span = TimeSpan {
                start: ticks[slot as usize] as f64 * period,
                end: ticks[slot as usize + 1] as f64 * period,
            };
            results.insert(name, span);
        }
        Ok(())
    }

    /// The spans of the most recently fetched frame, by pass name.
    pub fn snapshot(&self) -> HashMap<String, TimeSpan> {
        self.results.lock().clone()
    }
}
