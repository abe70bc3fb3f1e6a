pub mod bus;
pub mod cli;
pub mod config;
pub mod consolidation;
pub mod coordination;
pub mod error;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod utils;
pub mod vcs;

pub use bus::{Message, MessageBus, MessagePriority, MessageStatus};
pub use config::{OrchConfig, OrchPaths};
pub use consolidation::{Consolidation, Consolidator, MergeStrategy};
pub use coordination::{Coordinator, PartitionStrategy, partition_task};
pub use error::{ErrorCode, MusterError, Result};
pub use events::{EventBus, OrchEvent};
pub use monitor::ResourceMonitor;
pub use orchestrator::Engine;
pub use registry::{Registry, Worker, WorkerStatus};
pub use supervisor::{SpawnRequest, TermReason, WorkerSupervisor};
pub use vcs::{GitCli, VcsAdapter};
