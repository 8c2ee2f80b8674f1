pub mod config;
pub mod group;
pub mod instance;
pub mod launcher;
pub mod manager;
pub mod port;
pub mod process_monitor;
pub mod takeover;
pub mod utils;

pub use group::{Group, GroupConfig};
pub use instance::{Instance, InstanceConfig, InstanceStatus};
pub use manager::Manager;
