//! Counter delta reconciliation
//!
//! Turns successive cumulative readings into per-interval deltas. A reading
//! lower than the previous one is taken as a counter reset (node restart or
//! counter clear), in which case the whole reading is new traffic.
//!
//! A reset followed by regrowth past the previous reading before the next
//! poll looks exactly like normal growth and under-counts. The same holds
//! for a counter wrap.

use dashmap::DashMap;

use pf_core::types::{NodeId, TrafficDelta, TrafficSample};

/// Per-node baselines for delta computation
#[derive(Debug, Default)]
pub struct TrafficReconciler {
    baselines: DashMap<NodeId, TrafficSample>,
}

impl TrafficReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sample` for `id` and return the traffic since the previous one.
    ///
    /// The first sample for a node only seeds the baseline and yields zero.
    pub fn observe(&self, id: &NodeId, sample: TrafficSample) -> TrafficDelta {
        let mut delta = TrafficDelta::default();
        self.baselines
            .entry(id.clone())
            .and_modify(|prev| {
                delta = TrafficDelta::new(
                    counter_delta(prev.tx, sample.tx),
                    counter_delta(prev.rx, sample.rx),
                );
                *prev = sample;
            })
            .or_insert(sample);
        delta
    }

    /// Last recorded sample for `id`
    pub fn baseline(&self, id: &NodeId) -> Option<TrafficSample> {
        self.baselines.get(id).map(|r| *r)
    }

    /// Forget a node, e.g. after it was removed from the fleet
    pub fn forget(&self, id: &NodeId) {
        self.baselines.remove(id);
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}

fn counter_delta(prev: u64, cur: u64) -> u64 {
    if cur >= prev {
        cur - prev
    } else {
        cur
    }
}
