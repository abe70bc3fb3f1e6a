//! Host-local coordination primitives: barriers, leader elections, and
//! task partitioning.
//!
//! All primitives are advisory and scoped to this engine instance. Outcomes
//! are observable both through returned futures and the event stream.

mod barrier;
mod election;
mod partition;

use std::sync::Arc;

use dashmap::DashMap;

use crate::events::EventBus;

pub use barrier::{BarrierHandle, BarrierOutcome};
pub use election::{ElectionHandle, ElectionResult};
pub use partition::{Partition, PartitionStrategy, partition_task};

pub struct Coordinator {
    barriers: DashMap<String, Arc<parking_lot::Mutex<barrier::BarrierState>>>,
    elections: DashMap<String, Arc<parking_lot::Mutex<election::ElectionState>>>,
    events: EventBus,
}

impl Coordinator {
    pub fn new(events: EventBus) -> Self {
        Self {
            barriers: DashMap::new(),
            elections: DashMap::new(),
            events,
        }
    }
}
