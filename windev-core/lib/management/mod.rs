//! Central management for image lineage, customization, and orchestration.

pub mod agent;
pub mod archive;
pub mod catalog;
pub mod descriptor;
pub mod device;
pub mod fetch;
pub mod hypervisor;
pub mod lineage;
pub mod provision;
pub mod registry;
