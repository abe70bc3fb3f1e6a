//! Configuration types and loading.
//!
//! Provides the orchestrator configuration (`OrchConfig`) with per-subsystem
//! sections and the filesystem layout (`OrchPaths`) for durable state.

mod settings;

pub use settings::{
    BusConfig, ConsolidationConfig, MonitorConfig, OrchConfig, OrchPaths, RegistryConfig,
    ServerConfig, SupervisorConfig,
};
